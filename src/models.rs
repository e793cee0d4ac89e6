//! Core data models used throughout the engine.
//!
//! These types represent the submissions, chunks, candidates, and results
//! that flow through the retrieval and fusion pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A submission as handed to the engine by the calling system.
///
/// The engine only reads from it; ownership of raw submissions (storage,
/// deletion, access control) stays with the caller.
#[derive(Debug, Clone)]
pub struct Submission {
    pub id: String,
    pub assignment_id: String,
    pub text: String,
}

/// A bounded word-span slice of a submission, the retrieval granularity.
///
/// `start_char`/`end_char` index into the source text. Spans overlap only
/// within the configured overlap window. The AI and plagiarism scores are
/// filled in lazily during a check and read back by the highlight aligner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub submission_id: String,
    pub index: usize,
    pub start_char: usize,
    pub end_char: usize,
    pub text: String,
    #[serde(default)]
    pub ai_score: Option<f64>,
    #[serde(default)]
    pub plag_score: Option<f64>,
}

/// Which retrieval path produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateSource {
    Vector,
    Lexical,
    Bruteforce,
}

/// Ephemeral candidate record before fusion.
///
/// Deduplicated by `submission_id` keeping the maximum raw score.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub submission_id: String,
    pub raw_score: f64,
    pub source: CandidateSource,
}

/// The fixed 5-signal feature vector consumed by the fusion scorer.
///
/// Every field is normalized to [0, 1] before prediction.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FeatureVector {
    pub vector_similarity: f64,
    pub lexical_score: f64,
    pub cross_encoder_score: f64,
    pub trigram_jaccard: f64,
    pub ai_probability: f64,
}

impl FeatureVector {
    pub fn as_array(&self) -> [f64; 5] {
        [
            self.vector_similarity,
            self.lexical_score,
            self.cross_encoder_score,
            self.trigram_jaccard,
            self.ai_probability,
        ]
    }
}

/// One ranked match on a check result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchEntry {
    pub submission_id: String,
    pub similarity: f64,
    pub source: CandidateSource,
}

/// The verdict for one submission.
///
/// Always structurally valid: a submission with no usable text or no
/// candidates yields zeros and an empty match list, never an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub submission_id: String,
    pub assignment_id: String,
    pub similarity_score: f64,
    pub ai_probability: f64,
    pub matches: Vec<MatchEntry>,
    pub checked_at: DateTime<Utc>,
}

impl CheckResult {
    /// The degraded all-zero result used for empty text and failed stages.
    pub fn zero(submission_id: &str, assignment_id: &str) -> Self {
        Self {
            submission_id: submission_id.to_string(),
            assignment_id: assignment_id.to_string(),
            similarity_score: 0.0,
            ai_probability: 0.0,
            matches: Vec::new(),
            checked_at: Utc::now(),
        }
    }
}

/// A word on a rendered page with its bounding box, as produced by the
/// caller's text extraction layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageWord {
    pub text: String,
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

/// Highlight color ordered by precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HighlightColor {
    /// Both AI-like and plagiarized.
    Combined,
    Plagiarism,
    Ai,
}

/// A selected highlight span: a run of word indices on one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HighlightSpan {
    pub page: usize,
    pub start_word: usize,
    pub end_word: usize,
    pub color: HighlightColor,
}
