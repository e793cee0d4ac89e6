//! The `run_check` pipeline.
//!
//! Drives one submission through the stage machine:
//!
//! ```text
//! EXTRACT_TEXT → SCORE_AI → RETRIEVE_CANDIDATES → FUSE_SCORES
//!              → INCREMENTAL_INDEX_UPDATE → DONE
//! ```
//!
//! Every stage degrades to a zero-value outcome instead of aborting: a
//! missing classifier scores 0.0, an empty retrieval chain produces an
//! empty match list, a failed index update leaves the already-computed
//! result untouched. Callers always receive a structurally valid
//! [`CheckResult`].
//!
//! The retrieval chain falls back in order: vector search (skipped when
//! the assignment has nothing indexed), per-assignment BM25 (only when a
//! stored corpus exists), then a capped brute-force trigram scan over the
//! object store. Cross-assignment fallback is disabled by design to avoid
//! false positives from out-of-scope documents.

use anyhow::{Context, Result};
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::ScoreCache;
use crate::chunk::chunk_text;
use crate::config::Config;
use crate::fusion::{aggregate_chunk_probabilities, jaccard_char_trigrams, sigmoid, FusionModel};
use crate::lexical;
use crate::models::{
    Candidate, CandidateSource, CheckResult, Chunk, FeatureVector, MatchEntry, Submission,
};
use crate::providers::{
    l2_normalize, CrossEncoderProvider, EmbeddingProvider, ObjectStore, SubmissionRepository,
    TextClassifierProvider,
};
use crate::vector_store::VectorStore;

/// Object-store keys containing this fragment are generated artifacts,
/// not corpus documents, and are skipped by the brute-force scan.
const GENERATED_KEY_FRAGMENT: &str = "highlighted/";

pub struct RetrievalOrchestrator {
    config: Config,
    store: Arc<VectorStore>,
    cache: Arc<ScoreCache>,
    fusion: FusionModel,
    embedder: Arc<dyn EmbeddingProvider>,
    classifier: Option<Arc<dyn TextClassifierProvider>>,
    cross_encoder: Option<Arc<dyn CrossEncoderProvider>>,
    object_store: Option<Arc<dyn ObjectStore>>,
    repository: Option<Arc<dyn SubmissionRepository>>,
}

impl RetrievalOrchestrator {
    /// Construct the engine: open (or cold-start) the vector index sized
    /// from the embedding provider, load the fusion model once, and set up
    /// the caches. Optional collaborators are attached with the `with_*`
    /// builders.
    pub fn new(config: Config, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        crate::config::validate(&config)?;
        let store = VectorStore::open(&config.index.path, embedder.dims())
            .context("Failed to open vector index")?;
        let fusion = FusionModel::load(config.fusion.model_path.as_deref());
        let cache = ScoreCache::new(&config.cache);

        Ok(Self {
            config,
            store: Arc::new(store),
            cache: Arc::new(cache),
            fusion,
            embedder,
            classifier: None,
            cross_encoder: None,
            object_store: None,
            repository: None,
        })
    }

    pub fn with_classifier(mut self, provider: Arc<dyn TextClassifierProvider>) -> Self {
        self.classifier = Some(provider);
        self
    }

    pub fn with_cross_encoder(mut self, provider: Arc<dyn CrossEncoderProvider>) -> Self {
        self.cross_encoder = Some(provider);
        self
    }

    pub fn with_object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.object_store = Some(store);
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn SubmissionRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// The vector store backing this engine, exposed for shutdown flushes.
    pub fn vector_store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    /// Run the full check for one submission.
    pub async fn run_check(&self, submission: &Submission) -> CheckResult {
        self.run_check_detailed(submission).await.0
    }

    /// Run the full check, also returning the scored chunks so the caller
    /// can store them for later highlight alignment.
    ///
    /// Chunks are only produced on a fresh check: a result-cache hit
    /// returns the stored verdict with an empty chunk list, so callers
    /// doing highlight work should keep the chunks from the first run.
    pub async fn run_check_detailed(&self, submission: &Submission) -> (CheckResult, Vec<Chunk>) {
        if let Some(cached) = self.cache.get_result(&submission.id) {
            debug!(submission_id = %submission.id, "result cache hit");
            return ((*cached).clone(), Vec::new());
        }

        let assignment_id = self.resolve_assignment(submission).await;
        let text = submission.text.trim();
        if text.is_empty() {
            debug!(submission_id = %submission.id, "no text after extraction, returning zero result");
            return (CheckResult::zero(&submission.id, &assignment_id), Vec::new());
        }

        let mut chunks = chunk_text(
            &submission.id,
            &submission.text,
            self.config.chunking.chunk_size_words,
            self.config.chunking.overlap_words,
        );

        // SCORE_AI: never fatal; a missing or failing classifier scores 0.
        let ai_probability = self.score_ai(&mut chunks).await;

        // RETRIEVE_CANDIDATES: embeddings first, then the fallback chain.
        let embeddings = match self.embed_chunks(&chunks).await {
            Ok(embeddings) => Some(embeddings),
            Err(e) => {
                warn!(submission_id = %submission.id, error = %e, "embedding provider failed, vector path unavailable");
                None
            }
        };

        let mut candidates = Vec::new();
        if let Some(embeddings) = &embeddings {
            candidates = self.vector_candidates(&mut chunks, embeddings, &assignment_id, &submission.id);
        }

        let mut corpus: Option<HashMap<String, String>> = None;
        if candidates.is_empty() {
            debug!(submission_id = %submission.id, "no vector candidates, trying lexical fallback");
            candidates = self
                .lexical_candidates(text, &assignment_id, &submission.id, &mut corpus)
                .await;
        }
        if candidates.is_empty() {
            debug!(submission_id = %submission.id, "no lexical candidates, trying brute-force scan");
            candidates = self.bruteforce_candidates(text, &assignment_id, &submission.id).await;
        }

        // FUSE_SCORES.
        let (similarity_score, matches) = self
            .fuse(text, dedup_candidates(candidates), ai_probability, corpus.as_ref())
            .await;

        for chunk in chunks.iter_mut() {
            if chunk.plag_score.is_none() {
                chunk.plag_score = Some(similarity_score);
            }
        }

        let result = CheckResult {
            submission_id: submission.id.clone(),
            assignment_id: assignment_id.clone(),
            similarity_score,
            ai_probability,
            matches,
            checked_at: chrono::Utc::now(),
        };

        // INCREMENTAL_INDEX_UPDATE: only after scoring, so a submission can
        // never match against itself and index growth cannot perturb the
        // result just computed. The flush is file I/O, so it runs on the
        // blocking pool.
        if let Some(embeddings) = embeddings {
            let store = Arc::clone(&self.store);
            let sub_id = submission.id.clone();
            let asg_id = assignment_id.clone();
            let update = tokio::task::spawn_blocking(move || {
                store.insert_and_persist(&embeddings, &sub_id, &asg_id)
            })
            .await;
            match update {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    warn!(submission_id = %submission.id, error = %e, "incremental index update failed")
                }
                Err(e) => {
                    warn!(submission_id = %submission.id, error = %e, "index update task failed")
                }
            }
        }

        info!(
            submission_id = %submission.id,
            assignment_id = %assignment_id,
            similarity = similarity_score,
            ai = ai_probability,
            matches = result.matches.len(),
            "check complete"
        );
        self.cache.put_result(result.clone());
        (result, chunks)
    }

    /// Resolve the submission's assignment, falling back to the repository
    /// when the caller did not supply one. An unresolvable assignment
    /// becomes the empty sentinel, which never matches a scoped search.
    async fn resolve_assignment(&self, submission: &Submission) -> String {
        if !submission.assignment_id.is_empty() {
            return submission.assignment_id.clone();
        }
        if let Some(repo) = &self.repository {
            match repo.assignment_id(&submission.id).await {
                Ok(Some(assignment_id)) => return assignment_id,
                Ok(None) => {}
                Err(e) => {
                    warn!(submission_id = %submission.id, error = %e, "assignment lookup failed")
                }
            }
        }
        String::new()
    }

    /// Score each chunk's AI probability concurrently and aggregate.
    async fn score_ai(&self, chunks: &mut [Chunk]) -> f64 {
        let Some(classifier) = &self.classifier else {
            return 0.0;
        };

        let scores: Vec<(usize, f64)> = stream::iter(chunks.iter().enumerate())
            .map(|(i, chunk)| {
                let classifier = Arc::clone(classifier);
                let text = chunk.text.clone();
                async move {
                    match classifier.score(&text).await {
                        Ok(p) => (i, p.clamp(0.0, 1.0)),
                        Err(e) => {
                            warn!(chunk = i, error = %e, "classifier failed for chunk, scoring 0");
                            (i, 0.0)
                        }
                    }
                }
            })
            .buffer_unordered(self.config.retrieval.parallelism)
            .collect()
            .await;

        let mut probs = vec![0.0f64; chunks.len()];
        for (i, p) in scores {
            chunks[i].ai_score = Some(p);
            probs[i] = p;
        }
        aggregate_chunk_probabilities(&probs, self.config.fusion.aggregate_top_k)
    }

    /// Embed every chunk, normalized, using the embedding cache.
    async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>> {
        let mut embeddings: Vec<Option<Vec<f32>>> = Vec::with_capacity(chunks.len());
        let mut missing: Vec<usize> = Vec::new();

        for (i, chunk) in chunks.iter().enumerate() {
            match self.cache.get_embedding(&chunk.text) {
                Some(cached) => embeddings.push(Some((*cached).clone())),
                None => {
                    embeddings.push(None);
                    missing.push(i);
                }
            }
        }

        if !missing.is_empty() {
            let texts: Vec<String> = missing.iter().map(|&i| chunks[i].text.clone()).collect();
            let mut encoded = self.embedder.encode(&texts).await?;
            if encoded.len() != texts.len() {
                anyhow::bail!(
                    "embedding provider returned {} vectors for {} texts",
                    encoded.len(),
                    texts.len()
                );
            }
            for (slot, vector) in missing.iter().zip(encoded.iter_mut()) {
                l2_normalize(vector);
                self.cache.put_embedding(&chunks[*slot].text, vector.clone());
                embeddings[*slot] = Some(vector.clone());
            }
        }

        Ok(embeddings.into_iter().flatten().collect())
    }

    /// Vector path: search per chunk, record each chunk's best similarity,
    /// and collect candidates across chunks.
    fn vector_candidates(
        &self,
        chunks: &mut [Chunk],
        embeddings: &[Vec<f32>],
        assignment_id: &str,
        submission_id: &str,
    ) -> Vec<Candidate> {
        if self.store.assignment_count(assignment_id) == 0 {
            debug!(assignment_id, "assignment has no indexed entries, skipping vector search");
            return Vec::new();
        }

        let mut candidates = Vec::new();
        for (chunk, embedding) in chunks.iter_mut().zip(embeddings.iter()) {
            let hits = self.store.search(
                embedding,
                self.config.retrieval.top_k,
                assignment_id,
                submission_id,
            );
            if let Some((_, best)) = hits.first() {
                chunk.plag_score = Some(*best);
            }
            for (candidate_id, similarity) in hits {
                candidates.push(Candidate {
                    submission_id: candidate_id,
                    raw_score: similarity,
                    source: CandidateSource::Vector,
                });
            }
        }
        debug!(count = candidates.len(), "vector candidates");
        candidates
    }

    /// Lexical path: only runs when the repository already holds a corpus
    /// for this assignment. Keeps the fetched corpus for later feature
    /// computation.
    async fn lexical_candidates(
        &self,
        text: &str,
        assignment_id: &str,
        submission_id: &str,
        corpus_out: &mut Option<HashMap<String, String>>,
    ) -> Vec<Candidate> {
        let Some(repo) = &self.repository else {
            return Vec::new();
        };
        if assignment_id.is_empty() {
            return Vec::new();
        }

        let corpus = match repo.texts_for_assignment(assignment_id).await {
            Ok(corpus) => corpus,
            Err(e) => {
                warn!(assignment_id, error = %e, "corpus fetch failed, skipping lexical fallback");
                return Vec::new();
            }
        };

        let Some(model) = lexical::get_or_build(&self.cache, assignment_id, &corpus) else {
            return Vec::new();
        };

        let candidates: Vec<Candidate> = model
            .search(text, self.config.retrieval.top_k)
            .into_iter()
            .filter(|(id, _)| id != submission_id)
            .map(|(id, score)| Candidate {
                submission_id: id,
                raw_score: score,
                source: CandidateSource::Lexical,
            })
            .collect();

        debug!(count = candidates.len(), "lexical candidates");
        *corpus_out = Some(corpus);
        candidates
    }

    /// Last resort: capped char-trigram scan over the object store under
    /// the assignment prefix.
    async fn bruteforce_candidates(
        &self,
        text: &str,
        assignment_id: &str,
        submission_id: &str,
    ) -> Vec<Candidate> {
        let Some(object_store) = &self.object_store else {
            return Vec::new();
        };
        if assignment_id.is_empty() {
            return Vec::new();
        }

        let keys = match object_store.list(assignment_id).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(assignment_id, error = %e, "object store list failed, skipping brute-force scan");
                return Vec::new();
            }
        };

        let mut scored: Vec<(String, f64)> = Vec::new();
        for key in keys
            .into_iter()
            .filter(|k| !k.contains(GENERATED_KEY_FRAGMENT) && !k.contains(submission_id))
            .take(self.config.retrieval.bruteforce_max_objects)
        {
            let bytes = match object_store.get(&key).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(key = %key, error = %e, "object fetch failed, skipping");
                    continue;
                }
            };
            let other = String::from_utf8_lossy(&bytes);
            scored.push((key, jaccard_char_trigrams(text, &other)));
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.config.retrieval.top_k);

        debug!(count = scored.len(), "brute-force candidates");
        scored
            .into_iter()
            .map(|(key, score)| Candidate {
                submission_id: key,
                raw_score: score,
                source: CandidateSource::Bruteforce,
            })
            .collect()
    }

    /// Build a feature vector per candidate, predict, and rank.
    async fn fuse(
        &self,
        text: &str,
        candidates: Vec<Candidate>,
        ai_probability: f64,
        corpus: Option<&HashMap<String, String>>,
    ) -> (f64, Vec<MatchEntry>) {
        if candidates.is_empty() {
            return (0.0, Vec::new());
        }

        let parallelism = self.config.retrieval.parallelism;
        let mut matches: Vec<MatchEntry> = stream::iter(candidates.into_iter())
            .map(|candidate| async move {
                let candidate_text =
                    corpus.and_then(|c| c.get(&candidate.submission_id).map(String::as_str));
                let features = self
                    .candidate_features(text, &candidate, candidate_text, ai_probability)
                    .await;
                MatchEntry {
                    submission_id: candidate.submission_id,
                    similarity: self.fusion.predict(&features),
                    source: candidate.source,
                }
            })
            .buffer_unordered(parallelism)
            .collect()
            .await;

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.submission_id.cmp(&b.submission_id))
        });
        matches.truncate(self.config.retrieval.max_matches);

        let best = matches.first().map(|m| m.similarity).unwrap_or(0.0);
        (best, matches)
    }

    /// Assemble the 5-signal feature vector for one candidate. The raw
    /// signal is mirrored into both retrieval slots because only one path
    /// fired for any given candidate.
    async fn candidate_features(
        &self,
        text: &str,
        candidate: &Candidate,
        candidate_text: Option<&str>,
        ai_probability: f64,
    ) -> FeatureVector {
        let raw = candidate.raw_score.clamp(0.0, 1.0);

        let trigram = match candidate_text {
            Some(other) => jaccard_char_trigrams(text, other),
            None => raw,
        };

        let cross = match (&self.cross_encoder, candidate_text) {
            (Some(encoder), Some(other)) => match encoder.score(text, other).await {
                Ok(score) => {
                    // Cross-encoder output is unbounded relevance.
                    if (0.0..=1.0).contains(&score) {
                        score
                    } else {
                        sigmoid(score)
                    }
                }
                Err(e) => {
                    warn!(candidate = %candidate.submission_id, error = %e, "cross-encoder failed, using vector similarity");
                    raw
                }
            },
            _ => 0.0,
        };

        FeatureVector {
            vector_similarity: raw,
            lexical_score: raw,
            cross_encoder_score: cross,
            trigram_jaccard: trigram,
            ai_probability,
        }
    }
}

/// Deduplicate candidates by submission, keeping the maximum raw score.
fn dedup_candidates(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut best: HashMap<String, Candidate> = HashMap::new();
    for candidate in candidates {
        match best.get(&candidate.submission_id) {
            Some(existing) if existing.raw_score >= candidate.raw_score => {}
            _ => {
                best.insert(candidate.submission_id.clone(), candidate);
            }
        }
    }
    let mut deduped: Vec<Candidate> = best.into_values().collect();
    deduped.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    deduped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, score: f64, source: CandidateSource) -> Candidate {
        Candidate {
            submission_id: id.to_string(),
            raw_score: score,
            source,
        }
    }

    #[test]
    fn test_dedup_keeps_maximum() {
        let deduped = dedup_candidates(vec![
            candidate("s1", 0.4, CandidateSource::Vector),
            candidate("s1", 0.9, CandidateSource::Vector),
            candidate("s1", 0.6, CandidateSource::Lexical),
            candidate("s2", 0.5, CandidateSource::Vector),
        ]);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].submission_id, "s1");
        assert!((deduped[0].raw_score - 0.9).abs() < 1e-9);
        assert_eq!(deduped[0].source, CandidateSource::Vector);
    }

    #[test]
    fn test_dedup_sorted_descending() {
        let deduped = dedup_candidates(vec![
            candidate("low", 0.1, CandidateSource::Bruteforce),
            candidate("high", 0.8, CandidateSource::Vector),
            candidate("mid", 0.5, CandidateSource::Lexical),
        ]);
        let ids: Vec<&str> = deduped.iter().map(|c| c.submission_id.as_str()).collect();
        assert_eq!(ids, vec!["high", "mid", "low"]);
    }
}
