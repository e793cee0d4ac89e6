//! External collaborator traits.
//!
//! The engine never loads a neural model, parses a PDF, or talks to the
//! relational store itself. Each of those concerns is a trait here,
//! implemented by the calling system. Optional collaborators (classifier,
//! cross-encoder, object store) are held as `Option<Arc<dyn …>>` in the
//! orchestrator so callers branch on capability, not on caught errors.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Produces fixed-dimensionality embedding vectors for text.
///
/// A provider instance has one dimensionality for its lifetime; the vector
/// store sizes itself from [`dims`](EmbeddingProvider::dims) on cold start.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embedding vector dimensionality (e.g. `384`).
    fn dims(&self) -> usize;

    /// Embed a batch of texts, one vector per input, in input order.
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Scores a text span for AI-authorship likelihood, in [0, 1].
#[async_trait]
pub trait TextClassifierProvider: Send + Sync {
    async fn score(&self, text: &str) -> Result<f64>;
}

/// Scores a pair of texts jointly for relevance.
///
/// The returned score is unbounded; the fusion scorer pushes it through a
/// sigmoid before use.
#[async_trait]
pub trait CrossEncoderProvider: Send + Sync {
    async fn score(&self, text_a: &str, text_b: &str) -> Result<f64>;
}

/// Byte-level object storage, used only by the brute-force fallback scan.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List object keys under a prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Fetch one object's extracted text content as bytes (UTF-8).
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
}

/// Read access to the caller's relational submission store.
#[async_trait]
pub trait SubmissionRepository: Send + Sync {
    /// Resolve a submission's assignment, if known.
    async fn assignment_id(&self, submission_id: &str) -> Result<Option<String>>;

    /// All stored submission texts for an assignment, keyed by submission id.
    /// Used to build the per-assignment lexical corpus.
    async fn texts_for_assignment(&self, assignment_id: &str)
        -> Result<HashMap<String, String>>;
}

/// Normalize a vector to unit L2 length in place.
///
/// Stored and query vectors are normalized so squared L2 distance is a
/// monotonic inverse of cosine similarity. Zero vectors are left unchanged.
pub fn l2_normalize(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_normalize_unit_length() {
        let mut v = vec![3.0f32, 4.0];
        l2_normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_zero_vector_unchanged() {
        let mut v = vec![0.0f32, 0.0, 0.0];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0, 0.0]);
    }
}
