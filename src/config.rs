use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub fusion: FusionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub highlight: HighlightConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Path of the persisted vector index + metadata file.
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size_words: usize,
    #[serde(default = "default_overlap")]
    pub overlap_words: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size_words: default_chunk_size(),
            overlap_words: default_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    250
}
fn default_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Results requested per search before dedup and ranking.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Ranked matches kept on the final result.
    #[serde(default = "default_max_matches")]
    pub max_matches: usize,
    /// Cap on objects examined by the brute-force fallback scan.
    #[serde(default = "default_bruteforce_max")]
    pub bruteforce_max_objects: usize,
    /// Concurrent provider calls per submission (classifier, cross-encoder).
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_matches: default_max_matches(),
            bruteforce_max_objects: default_bruteforce_max(),
            parallelism: default_parallelism(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_max_matches() -> usize {
    10
}
fn default_bruteforce_max() -> usize {
    50
}
fn default_parallelism() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct FusionConfig {
    /// Path of the trained fusion model JSON. Absent or unreadable falls
    /// back to heuristic weights.
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    /// Chunks considered by top-k AI probability aggregation.
    #[serde(default = "default_aggregate_top_k")]
    pub aggregate_top_k: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            aggregate_top_k: default_aggregate_top_k(),
        }
    }
}

fn default_aggregate_top_k() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_embedding_ttl")]
    pub embedding_ttl_secs: u64,
    #[serde(default = "default_lexical_ttl")]
    pub lexical_ttl_secs: u64,
    #[serde(default = "default_result_ttl")]
    pub result_ttl_secs: u64,
    #[serde(default = "default_embedding_capacity")]
    pub embedding_capacity: u64,
    #[serde(default = "default_lexical_capacity")]
    pub lexical_capacity: u64,
    #[serde(default = "default_result_capacity")]
    pub result_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            embedding_ttl_secs: default_embedding_ttl(),
            lexical_ttl_secs: default_lexical_ttl(),
            result_ttl_secs: default_result_ttl(),
            embedding_capacity: default_embedding_capacity(),
            lexical_capacity: default_lexical_capacity(),
            result_capacity: default_result_capacity(),
        }
    }
}

fn default_embedding_ttl() -> u64 {
    2 * 60 * 60
}
fn default_lexical_ttl() -> u64 {
    24 * 60 * 60
}
fn default_result_ttl() -> u64 {
    60 * 60
}
fn default_embedding_capacity() -> u64 {
    10_000
}
fn default_lexical_capacity() -> u64 {
    256
}
fn default_result_capacity() -> u64 {
    2_048
}

#[derive(Debug, Deserialize, Clone)]
pub struct HighlightConfig {
    /// AI probability at or above which a chunk is flagged AI-like.
    #[serde(default = "default_ai_threshold")]
    pub ai_threshold: f64,
    /// Plagiarism similarity at or above which a chunk is flagged.
    #[serde(default = "default_plagiarism_threshold")]
    pub plagiarism_threshold: f64,
}

impl Default for HighlightConfig {
    fn default() -> Self {
        Self {
            ai_threshold: default_ai_threshold(),
            plagiarism_threshold: default_plagiarism_threshold(),
        }
    }
}

fn default_ai_threshold() -> f64 {
    0.5
}
fn default_plagiarism_threshold() -> f64 {
    0.4
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_size_words == 0 {
        anyhow::bail!("chunking.chunk_size_words must be > 0");
    }
    if config.chunking.overlap_words >= config.chunking.chunk_size_words {
        anyhow::bail!("chunking.overlap_words must be < chunking.chunk_size_words");
    }
    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.parallelism == 0 {
        anyhow::bail!("retrieval.parallelism must be >= 1");
    }
    if config.fusion.aggregate_top_k == 0 {
        anyhow::bail!("fusion.aggregate_top_k must be >= 1");
    }
    for (name, v) in [
        ("highlight.ai_threshold", config.highlight.ai_threshold),
        (
            "highlight.plagiarism_threshold",
            config.highlight.plagiarism_threshold,
        ),
    ] {
        if !(0.0..=1.0).contains(&v) {
            anyhow::bail!("{} must be in [0.0, 1.0]", name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_minimal_config_defaults() {
        let f = write_config("[index]\npath = \"/tmp/index.bin\"\n");
        let config = load_config(f.path()).unwrap();
        assert_eq!(config.chunking.chunk_size_words, 250);
        assert_eq!(config.chunking.overlap_words, 50);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.retrieval.max_matches, 10);
        assert_eq!(config.retrieval.bruteforce_max_objects, 50);
        assert_eq!(config.cache.lexical_ttl_secs, 24 * 60 * 60);
        assert_eq!(config.fusion.aggregate_top_k, 3);
        assert!((config.highlight.ai_threshold - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_overlap_must_be_smaller_than_chunk() {
        let f = write_config(
            "[index]\npath = \"/tmp/index.bin\"\n[chunking]\nchunk_size_words = 50\noverlap_words = 50\n",
        );
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let f = write_config(
            "[index]\npath = \"/tmp/index.bin\"\n[highlight]\nai_threshold = 1.5\n",
        );
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(load_config(Path::new("/nonexistent/ctx.toml")).is_err());
    }
}
