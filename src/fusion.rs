//! Score fusion: five heterogeneous signals in, one probability out.
//!
//! The scorer is a tagged variant decided once at load time: a trained
//! linear model with a min-max feature scaler (exported by the offline
//! training job as JSON), or fixed heuristic weights when no model is
//! available. A trained prediction that degenerates (NaN/infinite) falls
//! back to the heuristic path instead of surfacing an error.
//!
//! Also home to the small scoring primitives shared across the pipeline:
//! top-k AI probability aggregation, char-trigram Jaccard, and the
//! sigmoid used to normalize unbounded cross-encoder scores.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::warn;

use crate::models::FeatureVector;

// Heuristic fallback weights. The AI term is a penalty: AI-paraphrase
// similarity is measured differently from direct copying, so a strongly
// AI-like text gets reduced plagiarism confidence.
const W_VECTOR: f64 = 0.5;
const W_LEXICAL: f64 = 0.25;
const W_CROSS: f64 = 0.15;
const W_TRIGRAM: f64 = 0.05;
const W_AI_PENALTY: f64 = -0.2;

/// Min-max scaler fitted alongside the trained model.
#[derive(Debug, Clone, Deserialize)]
pub struct FeatureScaler {
    pub min: [f64; 5],
    pub max: [f64; 5],
}

impl FeatureScaler {
    fn transform(&self, features: [f64; 5]) -> [f64; 5] {
        let mut out = [0.0; 5];
        for i in 0..5 {
            let range = self.max[i] - self.min[i];
            out[i] = if range.abs() < f64::EPSILON {
                0.0
            } else {
                (features[i] - self.min[i]) / range
            };
        }
        out
    }
}

/// A trained logistic model over the 5-feature vector.
#[derive(Debug, Clone, Deserialize)]
pub struct TrainedModel {
    pub coefficients: [f64; 5],
    pub intercept: f64,
    #[serde(default)]
    pub scaler: Option<FeatureScaler>,
}

/// The fusion scorer variant, decided once at load time.
#[derive(Debug, Clone)]
pub enum FusionModel {
    Heuristic,
    Trained(TrainedModel),
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum ModelFile {
    Linear(TrainedModel),
}

impl FusionModel {
    /// Load the trained model, falling back to heuristic weights when no
    /// path is configured or the file is missing/unreadable.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::Heuristic;
        };
        match Self::load_trained(path) {
            Ok(model) => Self::Trained(model),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "fusion model unavailable, using heuristic weights");
                Self::Heuristic
            }
        }
    }

    fn load_trained(path: &Path) -> Result<TrainedModel> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fusion model: {}", path.display()))?;
        let ModelFile::Linear(model) =
            serde_json::from_str(&content).context("Failed to parse fusion model")?;
        Ok(model)
    }

    /// Fuse a feature vector into a probability in [0, 1].
    pub fn predict(&self, features: &FeatureVector) -> f64 {
        let x = features.as_array();
        if let Self::Trained(model) = self {
            let scaled = match &model.scaler {
                Some(scaler) => scaler.transform(x),
                None => x,
            };
            let logit: f64 = scaled
                .iter()
                .zip(model.coefficients.iter())
                .map(|(f, c)| f * c)
                .sum::<f64>()
                + model.intercept;
            let prob = sigmoid(logit);
            if prob.is_finite() {
                return prob.clamp(0.0, 1.0);
            }
            warn!("trained fusion prediction degenerate, falling back to heuristic");
        }

        let score = W_VECTOR * x[0]
            + W_LEXICAL * x[1]
            + W_CROSS * x[2]
            + W_TRIGRAM * x[3]
            + W_AI_PENALTY * x[4];
        score.clamp(0.0, 1.0)
    }
}

/// Logistic transform for unbounded scores.
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Document-level AI probability from per-chunk probabilities.
///
/// Not a mean: `1 − Π(1 − p_i)` over the `top_k` highest chunk
/// probabilities, i.e. the probability that at least one of the most
/// suspicious chunks is truly AI-generated. A long mostly-human document
/// with a few strongly AI-like chunks is flagged rather than diluted.
pub fn aggregate_chunk_probabilities(probs: &[f64], top_k: usize) -> f64 {
    if probs.is_empty() || top_k == 0 {
        return 0.0;
    }
    let mut sorted: Vec<f64> = probs.iter().map(|p| p.clamp(0.0, 1.0)).collect();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    sorted.truncate(top_k);

    let none_ai: f64 = sorted.iter().map(|p| 1.0 - p).product();
    (1.0 - none_ai).clamp(0.0, 1.0)
}

/// Jaccard similarity of whitespace-stripped lowercase char trigrams.
///
/// Strings shorter than three chars degrade to whole-string comparison.
pub fn jaccard_char_trigrams(a: &str, b: &str) -> f64 {
    let set_a = trigram_set(a);
    let set_b = trigram_set(b);
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

fn trigram_set(s: &str) -> HashSet<String> {
    let stripped: String = s
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let chars: Vec<char> = stripped.chars().collect();
    if chars.is_empty() {
        return HashSet::new();
    }
    if chars.len() < 3 {
        let mut set = HashSet::new();
        set.insert(stripped);
        return set;
    }
    chars.windows(3).map(|w| w.iter().collect()).collect()
}
