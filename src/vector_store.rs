//! Flat L2 vector index with parallel metadata.
//!
//! Stores L2-normalized embedding vectors row-major alongside one metadata
//! row per vector (`submission_id`, `assignment_id`). The index is
//! append-only: corrections happen by never re-inserting a submission that
//! is already present. Search is an exhaustive scan over normalized
//! vectors, so squared L2 distance is a monotonic inverse of cosine
//! similarity; similarity is reported as `1 / (1 + distance)`, bounded in
//! `(0, 1]`.
//!
//! Readers take a shared lock and writers an exclusive one, so searches
//! run concurrently with each other and never observe a vector without its
//! metadata row. [`VectorStore::insert_and_persist`] additionally holds a
//! writer gate so concurrent insert+persist sequences cannot interleave
//! their flushes.
//!
//! ## Persistence
//!
//! Index and metadata are one logical unit in a single file:
//!
//! ```text
//! [8-byte magic "ORIGIDX1"][u64 LE header length][JSON header][f32 LE blob]
//! ```
//!
//! The header carries the dimensionality, the metadata rows, and a SHA-256
//! of the vector blob. A missing file is a well-defined cold start (empty
//! index sized from a probe encoding); any corruption, checksum failure,
//! or header/blob length mismatch is fatal at load time.

use anyhow::{bail, Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const MAGIC: &[u8; 8] = b"ORIGIDX1";

/// Minimum raw candidate breadth requested before assignment filtering.
const MIN_SEARCH_K: usize = 200;
/// Breadth multiplier compensating for post-filtering by assignment.
const SEARCH_K_FACTOR: usize = 50;

/// Metadata row paired with one stored vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorMeta {
    pub submission_id: String,
    pub assignment_id: String,
}

#[derive(Serialize, Deserialize)]
struct PersistHeader {
    dims: usize,
    rows: usize,
    meta: Vec<VectorMeta>,
    blob_sha256: String,
}

struct StoreInner {
    dims: usize,
    /// Row-major normalized vectors; `rows * dims` floats.
    vectors: Vec<f32>,
    meta: Vec<VectorMeta>,
    /// Submissions present in the index.
    members: HashSet<String>,
    /// Distinct submissions per assignment, maintained on insert under the
    /// same write lock so it can never drift from true membership.
    assignment_counts: HashMap<String, usize>,
}

impl StoreInner {
    fn empty(dims: usize) -> Self {
        Self {
            dims,
            vectors: Vec::new(),
            meta: Vec::new(),
            members: HashSet::new(),
            assignment_counts: HashMap::new(),
        }
    }

    fn rows(&self) -> usize {
        self.meta.len()
    }

    fn row(&self, i: usize) -> &[f32] {
        &self.vectors[i * self.dims..(i + 1) * self.dims]
    }
}

pub struct VectorStore {
    path: PathBuf,
    inner: RwLock<StoreInner>,
    write_gate: Mutex<()>,
}

impl VectorStore {
    /// Load the persisted index, or initialize an empty one when the file
    /// does not exist yet.
    ///
    /// `probe_dims` is the embedding provider's dimensionality, used to
    /// size a cold-start index. A present-but-unreadable file is an error:
    /// serving partial state would silently break the index/metadata
    /// pairing invariant.
    pub fn open(path: &Path, probe_dims: usize) -> Result<Self> {
        let inner = match std::fs::read(path) {
            Ok(bytes) => Self::parse(&bytes)
                .with_context(|| format!("Corrupt vector index: {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), dims = probe_dims, "no vector index on disk, starting empty");
                StoreInner::empty(probe_dims)
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read vector index: {}", path.display()))
            }
        };

        info!(
            path = %path.display(),
            rows = inner.rows(),
            dims = inner.dims,
            "vector index ready"
        );

        Ok(Self {
            path: path.to_path_buf(),
            inner: RwLock::new(inner),
            write_gate: Mutex::new(()),
        })
    }

    fn parse(bytes: &[u8]) -> Result<StoreInner> {
        if bytes.len() < MAGIC.len() + 8 || &bytes[..MAGIC.len()] != MAGIC {
            bail!("bad magic");
        }
        let mut cursor = &bytes[MAGIC.len()..];
        let mut len_buf = [0u8; 8];
        cursor.read_exact(&mut len_buf)?;
        let header_len = u64::from_le_bytes(len_buf) as usize;
        if cursor.len() < header_len {
            bail!("truncated header");
        }

        let header: PersistHeader =
            serde_json::from_slice(&cursor[..header_len]).context("unreadable header")?;
        let blob = &cursor[header_len..];

        if header.meta.len() != header.rows {
            bail!(
                "metadata rows ({}) do not match vector rows ({})",
                header.meta.len(),
                header.rows
            );
        }
        if blob.len() != header.rows * header.dims * 4 {
            bail!(
                "vector blob is {} bytes, expected {}",
                blob.len(),
                header.rows * header.dims * 4
            );
        }
        let digest = format!("{:x}", Sha256::digest(blob));
        if digest != header.blob_sha256 {
            bail!("vector blob checksum mismatch");
        }

        let vectors = blob_to_vec(blob);
        let mut members = HashSet::new();
        let mut assignment_counts: HashMap<String, usize> = HashMap::new();
        for m in &header.meta {
            if members.insert(m.submission_id.clone()) {
                *assignment_counts.entry(m.assignment_id.clone()).or_insert(0) += 1;
            }
        }

        Ok(StoreInner {
            dims: header.dims,
            vectors,
            meta: header.meta,
            members,
            assignment_counts,
        })
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        self.inner.read().rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dims(&self) -> usize {
        self.inner.read().dims
    }

    /// Whether any vector for this submission is already stored.
    pub fn contains(&self, submission_id: &str) -> bool {
        self.inner.read().members.contains(submission_id)
    }

    /// Distinct submissions indexed for an assignment.
    pub fn assignment_count(&self, assignment_id: &str) -> usize {
        self.inner
            .read()
            .assignment_counts
            .get(assignment_id)
            .copied()
            .unwrap_or(0)
    }

    /// Assignment-scoped, self-excluding search.
    ///
    /// Returns up to `k` `(submission_id, similarity)` pairs ranked by
    /// descending similarity, deduplicated keeping the best chunk-level
    /// similarity per submission. An assignment with nothing indexed
    /// returns empty without scanning.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        assignment_id: &str,
        exclude_submission_id: &str,
    ) -> Vec<(String, f64)> {
        let inner = self.inner.read();

        let assignment_count = inner
            .assignment_counts
            .get(assignment_id)
            .copied()
            .unwrap_or(0);
        if assignment_count == 0 || inner.rows() == 0 {
            return Vec::new();
        }

        let query = fit_dims(query, inner.dims);

        // Breadth-expanded raw candidate count to survive post-filtering.
        let search_k = (k * SEARCH_K_FACTOR)
            .max(MIN_SEARCH_K)
            .max(assignment_count * SEARCH_K_FACTOR)
            .min(inner.rows());

        let mut scored: Vec<(usize, f64)> = (0..inner.rows())
            .map(|i| (i, squared_l2(&query, inner.row(i))))
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(search_k);

        let mut best: HashMap<&str, f64> = HashMap::new();
        for (i, dist) in scored {
            let meta = &inner.meta[i];
            if meta.assignment_id != assignment_id {
                continue;
            }
            if meta.submission_id == exclude_submission_id {
                continue;
            }
            let similarity = 1.0 / (1.0 + dist);
            let entry = best.entry(meta.submission_id.as_str()).or_insert(similarity);
            if similarity > *entry {
                *entry = similarity;
            }
        }

        let mut results: Vec<(String, f64)> = best
            .into_iter()
            .map(|(id, sim)| (id.to_string(), sim))
            .collect();
        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(k);
        results
    }

    /// Append a submission's chunk vectors with one metadata row each.
    ///
    /// Idempotent per submission: a submission already present is left
    /// untouched and `false` is returned. The append is atomic with
    /// respect to readers.
    pub fn insert(
        &self,
        vectors: &[Vec<f32>],
        submission_id: &str,
        assignment_id: &str,
    ) -> Result<bool> {
        if vectors.is_empty() {
            return Ok(false);
        }

        let mut inner = self.inner.write();
        if inner.members.contains(submission_id) {
            debug!(submission_id, "already indexed, skipping insert");
            return Ok(false);
        }

        let dims = inner.dims;
        for v in vectors {
            let fitted = fit_dims(v, dims);
            inner.vectors.extend_from_slice(&fitted);
            inner.meta.push(VectorMeta {
                submission_id: submission_id.to_string(),
                assignment_id: assignment_id.to_string(),
            });
        }
        inner.members.insert(submission_id.to_string());
        *inner
            .assignment_counts
            .entry(assignment_id.to_string())
            .or_insert(0) += 1;

        debug!(
            submission_id,
            assignment_id,
            chunks = vectors.len(),
            total = inner.rows(),
            "indexed submission"
        );
        Ok(true)
    }

    /// Serialize index + metadata to disk as one unit.
    ///
    /// Writes to a sibling temp file and renames, so a crash never leaves
    /// a partially written index behind.
    pub fn persist(&self) -> Result<()> {
        let (header, blob) = {
            let inner = self.inner.read();
            let blob = vec_to_blob(&inner.vectors);
            let header = PersistHeader {
                dims: inner.dims,
                rows: inner.rows(),
                meta: inner.meta.clone(),
                blob_sha256: format!("{:x}", Sha256::digest(&blob)),
            };
            (header, blob)
        };

        let header_json = serde_json::to_vec(&header)?;
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut f = std::fs::File::create(&tmp_path)
                .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
            f.write_all(MAGIC)?;
            f.write_all(&(header_json.len() as u64).to_le_bytes())?;
            f.write_all(&header_json)?;
            f.write_all(&blob)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        debug!(path = %self.path.display(), rows = header.rows, "persisted vector index");
        Ok(())
    }

    /// Insert and flush under one writer section.
    pub fn insert_and_persist(
        &self,
        vectors: &[Vec<f32>],
        submission_id: &str,
        assignment_id: &str,
    ) -> Result<bool> {
        let _gate = self.write_gate.lock();
        let inserted = self.insert(vectors, submission_id, assignment_id)?;
        if inserted {
            self.persist()?;
        }
        Ok(inserted)
    }
}

/// Truncate or zero-pad a vector to the index dimensionality.
///
/// A deliberate lossy compatibility shim for embedding provider changes;
/// logged so the mismatch is visible in operation.
fn fit_dims(vec: &[f32], dims: usize) -> Vec<f32> {
    if vec.len() == dims {
        return vec.to_vec();
    }
    warn!(
        got = vec.len(),
        expected = dims,
        "vector dimensionality mismatch, truncating/padding"
    );
    let mut fitted = vec.to_vec();
    fitted.resize(dims, 0.0);
    fitted
}

fn squared_l2(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = (x - y) as f64;
            d * d
        })
        .sum()
}

/// Encode vectors as little-endian f32 bytes.
fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode little-endian f32 bytes back into floats.
fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::l2_normalize;

    fn unit(mut v: Vec<f32>) -> Vec<f32> {
        l2_normalize(&mut v);
        v
    }

    fn store_with(entries: &[(&str, &str, Vec<Vec<f32>>)]) -> (tempfile::TempDir, VectorStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(&dir.path().join("index.bin"), 3).unwrap();
        for (sub, asg, vectors) in entries {
            store.insert(vectors, sub, asg).unwrap();
        }
        (dir, store)
    }

    #[test]
    fn test_cold_start_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(&dir.path().join("index.bin"), 384).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.dims(), 384);
        assert!(store.search(&[0.0; 384], 5, "asg1", "sub1").is_empty());
    }

    #[test]
    fn test_vectors_and_meta_stay_parallel() {
        let (_dir, store) = store_with(&[
            ("s1", "a1", vec![unit(vec![1.0, 0.0, 0.0]), unit(vec![0.0, 1.0, 0.0])]),
            ("s2", "a1", vec![unit(vec![0.0, 0.0, 1.0])]),
        ]);
        let inner = store.inner.read();
        assert_eq!(inner.vectors.len(), inner.meta.len() * inner.dims);
        assert_eq!(inner.meta.len(), 3);
    }

    #[test]
    fn test_insert_idempotent() {
        let (_dir, store) = store_with(&[("s1", "a1", vec![unit(vec![1.0, 0.0, 0.0])])]);
        assert_eq!(store.len(), 1);
        let inserted = store
            .insert(&[unit(vec![0.5, 0.5, 0.0])], "s1", "a1")
            .unwrap();
        assert!(!inserted);
        assert_eq!(store.len(), 1);
        assert_eq!(store.assignment_count("a1"), 1);
    }

    #[test]
    fn test_search_excludes_self_and_other_assignments() {
        let (_dir, store) = store_with(&[
            ("query", "a1", vec![unit(vec![1.0, 0.0, 0.0])]),
            ("same", "a1", vec![unit(vec![0.9, 0.1, 0.0])]),
            ("other-asg", "a2", vec![unit(vec![1.0, 0.0, 0.0])]),
        ]);
        let results = store.search(&unit(vec![1.0, 0.0, 0.0]), 5, "a1", "query");
        let ids: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["same"]);
    }

    #[test]
    fn test_search_dedups_by_best_chunk() {
        let (_dir, store) = store_with(&[(
            "s1",
            "a1",
            vec![unit(vec![1.0, 0.0, 0.0]), unit(vec![0.0, 1.0, 0.0])],
        )]);
        let results = store.search(&unit(vec![1.0, 0.0, 0.0]), 5, "a1", "none");
        assert_eq!(results.len(), 1);
        // Best chunk is an exact match: distance 0, similarity 1.
        assert!((results[0].1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_ordering_and_bounds() {
        let (_dir, store) = store_with(&[
            ("near", "a1", vec![unit(vec![1.0, 0.1, 0.0])]),
            ("far", "a1", vec![unit(vec![0.0, 1.0, 1.0])]),
        ]);
        let results = store.search(&unit(vec![1.0, 0.0, 0.0]), 5, "a1", "none");
        assert_eq!(results[0].0, "near");
        for (_, sim) in &results {
            assert!(*sim > 0.0 && *sim <= 1.0);
        }
    }

    #[test]
    fn test_empty_assignment_fast_path() {
        let (_dir, store) = store_with(&[("s1", "a1", vec![unit(vec![1.0, 0.0, 0.0])])]);
        assert!(store.search(&unit(vec![1.0, 0.0, 0.0]), 5, "a9", "none").is_empty());
    }

    #[test]
    fn test_dimension_shim() {
        let (_dir, store) = store_with(&[("s1", "a1", vec![unit(vec![1.0, 0.0, 0.0])])]);
        // Longer query is truncated, shorter is zero-padded; both still search.
        assert_eq!(
            store.search(&[1.0, 0.0, 0.0, 0.7], 5, "a1", "none").len(),
            1
        );
        assert_eq!(store.search(&[1.0], 5, "a1", "none").len(), 1);
    }

    #[test]
    fn test_persist_load_roundtrip_same_results() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.bin");
        let query = unit(vec![0.8, 0.2, 0.0]);

        let before = {
            let store = VectorStore::open(&path, 3).unwrap();
            store
                .insert(&[unit(vec![1.0, 0.0, 0.0])], "s1", "a1")
                .unwrap();
            store
                .insert(&[unit(vec![0.0, 1.0, 0.0]), unit(vec![0.5, 0.5, 0.0])], "s2", "a1")
                .unwrap();
            store.persist().unwrap();
            store.search(&query, 5, "a1", "none")
        };

        let reloaded = VectorStore::open(&path, 3).unwrap();
        assert_eq!(reloaded.len(), 3);
        assert_eq!(reloaded.assignment_count("a1"), 2);
        let after = reloaded.search(&query, 5, "a1", "none");

        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(after.iter()) {
            assert_eq!(b.0, a.0);
            assert!((b.1 - a.1).abs() < 1e-9);
        }
    }

    #[test]
    fn test_corrupt_index_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.bin");
        std::fs::write(&path, b"not an index at all").unwrap();
        assert!(VectorStore::open(&path, 3).is_err());
    }

    #[test]
    fn test_tampered_blob_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.bin");
        {
            let store = VectorStore::open(&path, 3).unwrap();
            store
                .insert(&[unit(vec![1.0, 0.0, 0.0])], "s1", "a1")
                .unwrap();
            store.persist().unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();
        assert!(VectorStore::open(&path, 3).is_err());
    }

    #[test]
    fn test_insert_and_persist_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.bin");
        let store = VectorStore::open(&path, 3).unwrap();
        let inserted = store
            .insert_and_persist(&[unit(vec![1.0, 0.0, 0.0])], "s1", "a1")
            .unwrap();
        assert!(inserted);
        assert!(path.exists());
        // Second call is a no-op and does not rewrite.
        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();
        let inserted = store
            .insert_and_persist(&[unit(vec![1.0, 0.0, 0.0])], "s1", "a1")
            .unwrap();
        assert!(!inserted);
        assert_eq!(
            std::fs::metadata(&path).unwrap().modified().unwrap(),
            modified
        );
    }
}
