//! TTL + capacity-bounded caches for the scoring pipeline.
//!
//! Three independent caches keep repeated queries cheap: text-hash →
//! embedding vector, assignment → lexical model, submission → final
//! result. Namespacing falls out of the caches being separate instances,
//! so keys can never collide across kinds.
//!
//! Eviction is TTL-first, then capacity-based. Expiry runs lazily inside
//! moka; a `get` racing an eviction is an ordinary miss and callers must
//! treat it as such.

use moka::sync::Cache;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::config::CacheConfig;
use crate::lexical::LexicalModel;
use crate::models::CheckResult;

pub struct ScoreCache {
    embeddings: Cache<String, Arc<Vec<f32>>>,
    lexical: Cache<String, Arc<LexicalModel>>,
    results: Cache<String, Arc<CheckResult>>,
}

impl ScoreCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            embeddings: Cache::builder()
                .max_capacity(config.embedding_capacity)
                .time_to_live(Duration::from_secs(config.embedding_ttl_secs))
                .build(),
            lexical: Cache::builder()
                .max_capacity(config.lexical_capacity)
                .time_to_live(Duration::from_secs(config.lexical_ttl_secs))
                .build(),
            results: Cache::builder()
                .max_capacity(config.result_capacity)
                .time_to_live(Duration::from_secs(config.result_ttl_secs))
                .build(),
        }
    }

    /// Stable cache key for a text's embedding.
    pub fn embedding_key(text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn get_embedding(&self, text: &str) -> Option<Arc<Vec<f32>>> {
        self.embeddings.get(&Self::embedding_key(text))
    }

    pub fn put_embedding(&self, text: &str, vector: Vec<f32>) {
        self.embeddings
            .insert(Self::embedding_key(text), Arc::new(vector));
    }

    pub fn get_lexical(&self, assignment_id: &str) -> Option<Arc<LexicalModel>> {
        self.lexical.get(assignment_id)
    }

    pub fn put_lexical(&self, assignment_id: &str, model: Arc<LexicalModel>) {
        self.lexical.insert(assignment_id.to_string(), model);
    }

    pub fn get_result(&self, submission_id: &str) -> Option<Arc<CheckResult>> {
        self.results.get(submission_id)
    }

    pub fn put_result(&self, result: CheckResult) {
        self.results
            .insert(result.submission_id.clone(), Arc::new(result));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cache() -> ScoreCache {
        ScoreCache::new(&CacheConfig::default())
    }

    #[test]
    fn test_embedding_roundtrip() {
        let cache = test_cache();
        assert!(cache.get_embedding("some text").is_none());
        cache.put_embedding("some text", vec![0.1, 0.2, 0.3]);
        let got = cache.get_embedding("some text").unwrap();
        assert_eq!(*got, vec![0.1, 0.2, 0.3]);
        // A different text misses.
        assert!(cache.get_embedding("other text").is_none());
    }

    #[test]
    fn test_embedding_key_is_content_addressed() {
        assert_eq!(
            ScoreCache::embedding_key("abc"),
            ScoreCache::embedding_key("abc")
        );
        assert_ne!(
            ScoreCache::embedding_key("abc"),
            ScoreCache::embedding_key("abd")
        );
    }

    #[test]
    fn test_result_roundtrip() {
        let cache = test_cache();
        cache.put_result(CheckResult::zero("sub1", "asg1"));
        let got = cache.get_result("sub1").unwrap();
        assert_eq!(got.submission_id, "sub1");
        assert_eq!(got.similarity_score, 0.0);
        assert!(cache.get_result("sub2").is_none());
    }

    #[test]
    fn test_ttl_expiry() {
        let config = CacheConfig {
            result_ttl_secs: 1,
            ..CacheConfig::default()
        };
        let cache = ScoreCache::new(&config);
        cache.put_result(CheckResult::zero("sub1", "asg1"));
        assert!(cache.get_result("sub1").is_some());
        std::thread::sleep(Duration::from_millis(1100));
        assert!(cache.get_result("sub1").is_none());
    }
}
