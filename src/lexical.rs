//! Per-assignment BM25 lexical retrieval.
//!
//! Used only when the vector path yields nothing: a cold assignment, or an
//! unavailable embedding provider. Models are built lazily from the
//! assignment's stored submission texts and cached for 24 hours; staleness
//! within that window is accepted by design.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::cache::ScoreCache;

const BM25_K1: f64 = 1.5;
const BM25_B: f64 = 0.75;

/// Lowercased word-boundary tokenization.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            current.extend(ch.to_lowercase());
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// A BM25 Okapi ranking model over one assignment's submissions.
pub struct LexicalModel {
    doc_ids: Vec<String>,
    term_freqs: Vec<HashMap<String, usize>>,
    doc_lengths: Vec<usize>,
    doc_freqs: HashMap<String, usize>,
    avgdl: f64,
}

impl LexicalModel {
    /// Build a model over the corpus. Refuses an empty corpus (or one with
    /// only empty texts) to avoid degenerate scoring.
    pub fn build(submissions: &HashMap<String, String>) -> Option<Self> {
        let mut doc_ids = Vec::new();
        let mut term_freqs = Vec::new();
        let mut doc_lengths = Vec::new();
        let mut doc_freqs: HashMap<String, usize> = HashMap::new();

        for (id, text) in submissions {
            let tokens = tokenize(text);
            if tokens.is_empty() {
                continue;
            }
            let mut tf: HashMap<String, usize> = HashMap::new();
            for token in &tokens {
                *tf.entry(token.clone()).or_insert(0) += 1;
            }
            for term in tf.keys() {
                *doc_freqs.entry(term.clone()).or_insert(0) += 1;
            }
            doc_ids.push(id.clone());
            doc_lengths.push(tokens.len());
            term_freqs.push(tf);
        }

        if doc_ids.is_empty() {
            return None;
        }

        let avgdl = doc_lengths.iter().sum::<usize>() as f64 / doc_lengths.len() as f64;
        Some(Self {
            doc_ids,
            term_freqs,
            doc_lengths,
            doc_freqs,
            avgdl,
        })
    }

    pub fn len(&self) -> usize {
        self.doc_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_ids.is_empty()
    }

    /// Raw BM25 score of every document against the query tokens.
    fn scores(&self, query_tokens: &[String]) -> Vec<f64> {
        let n = self.doc_ids.len() as f64;
        let mut scores = vec![0.0f64; self.doc_ids.len()];

        for token in query_tokens {
            let Some(&df) = self.doc_freqs.get(token) else {
                continue;
            };
            // IDF: log((N - df + 0.5) / (df + 0.5) + 1)
            let idf = ((n - df as f64 + 0.5) / (df as f64 + 0.5) + 1.0).ln();

            for (doc, score) in scores.iter_mut().enumerate() {
                let tf = self.term_freqs[doc].get(token).copied().unwrap_or(0) as f64;
                if tf == 0.0 {
                    continue;
                }
                let dl = self.doc_lengths[doc] as f64;
                let tf_norm =
                    (tf * (BM25_K1 + 1.0)) / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * dl / self.avgdl));
                *score += idf * tf_norm;
            }
        }

        scores
    }

    /// Top-k documents for a query, scores min-max normalized to [0, 1].
    ///
    /// Documents with zero raw score are dropped; an empty query returns
    /// nothing.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<(String, f64)> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return Vec::new();
        }

        let raw = self.scores(&query_tokens);
        let mut scored: Vec<(usize, f64)> = raw
            .into_iter()
            .enumerate()
            .filter(|(_, s)| *s > 0.0)
            .collect();
        if scored.is_empty() {
            return Vec::new();
        }

        let s_min = scored.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);
        let s_max = scored
            .iter()
            .map(|(_, s)| *s)
            .fold(f64::NEG_INFINITY, f64::max);

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);

        scored
            .into_iter()
            .map(|(doc, s)| {
                let norm = if (s_max - s_min).abs() < f64::EPSILON {
                    1.0
                } else {
                    (s - s_min) / (s_max - s_min)
                };
                (self.doc_ids[doc].clone(), norm)
            })
            .collect()
    }
}

/// Return the cached model for an assignment or build and cache a new one.
///
/// `None` when the corpus is empty: a missing lexical index is an expected
/// outcome, not an error.
pub fn get_or_build(
    cache: &ScoreCache,
    assignment_id: &str,
    submissions: &HashMap<String, String>,
) -> Option<Arc<LexicalModel>> {
    if let Some(model) = cache.get_lexical(assignment_id) {
        return Some(model);
    }

    let model = Arc::new(LexicalModel::build(submissions)?);
    debug!(
        assignment_id,
        docs = model.len(),
        "built lexical index"
    );
    cache.put_lexical(assignment_id, model.clone());
    Some(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    fn corpus(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(id, text)| (id.to_string(), text.to_string()))
            .collect()
    }

    #[test]
    fn test_tokenize_lowercases_and_splits() {
        assert_eq!(
            tokenize("Hello, World! rust_lang 42"),
            vec!["hello", "world", "rust", "lang", "42"]
        );
        assert!(tokenize("").is_empty());
        assert!(tokenize("---").is_empty());
    }

    #[test]
    fn test_empty_corpus_refused() {
        assert!(LexicalModel::build(&HashMap::new()).is_none());
        assert!(LexicalModel::build(&corpus(&[("s1", "   ")])).is_none());
    }

    #[test]
    fn test_finds_matching_docs() {
        let model = LexicalModel::build(&corpus(&[
            ("s1", "rust programming systems language fast"),
            ("s2", "python programming scripting easy"),
            ("s3", "java enterprise programming verbose"),
        ]))
        .unwrap();
        let results = model.search("rust systems", 10);
        assert!(!results.is_empty());
        assert_eq!(results[0].0, "s1");
    }

    #[test]
    fn test_higher_tf_ranks_first() {
        let model = LexicalModel::build(&corpus(&[
            ("s1", "essay essay essay filler"),
            ("s2", "essay on something else entirely"),
        ]))
        .unwrap();
        let results = model.search("essay", 10);
        assert_eq!(results[0].0, "s1");
    }

    #[test]
    fn test_scores_normalized_to_unit_interval() {
        let model = LexicalModel::build(&corpus(&[
            ("s1", "alpha beta gamma alpha"),
            ("s2", "alpha delta"),
            ("s3", "unrelated words only here"),
        ]))
        .unwrap();
        for (_, score) in model.search("alpha beta", 10) {
            assert!((0.0..=1.0).contains(&score));
        }
    }

    #[test]
    fn test_no_match_and_empty_query() {
        let model = LexicalModel::build(&corpus(&[("s1", "some words")])).unwrap();
        assert!(model.search("zzzz", 10).is_empty());
        assert!(model.search("", 10).is_empty());
    }

    #[test]
    fn test_get_or_build_caches() {
        let cache = ScoreCache::new(&CacheConfig::default());
        let subs = corpus(&[("s1", "cached words here")]);
        let first = get_or_build(&cache, "asg1", &subs).unwrap();
        // Second call with an empty corpus still hits the cache.
        let second = get_or_build(&cache, "asg1", &HashMap::new()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        // A different assignment with no corpus yields nothing.
        assert!(get_or_build(&cache, "asg2", &HashMap::new()).is_none());
    }
}
