//! # Originality
//!
//! A retrieval-and-fusion engine for plagiarism and AI-authorship detection
//! within a bounded corpus of submissions grouped by assignment.
//!
//! Originality combines approximate-nearest-neighbor retrieval over an
//! incrementally-grown vector index, per-assignment BM25 retrieval, and a
//! brute-force trigram fallback into a single fused similarity verdict per
//! submission, plus per-span highlight annotations for rendering.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────────────┐   ┌──────────────┐
//! │ Submission │──▶│ RetrievalOrchestrator │──▶│ CheckResult  │
//! │   text     │   │  chunk → AI score →   │   │ score + top  │
//! └────────────┘   │  retrieve → fuse      │   │   matches    │
//!                  └──────┬───────────────┘   └──────────────┘
//!                         │
//!        ┌────────────────┼────────────────┐
//!        ▼                ▼                ▼
//!  ┌──────────┐    ┌────────────┐   ┌────────────┐
//!  │ Vector   │    │  Lexical   │   │ ObjectStore │
//!  │ Store    │    │  (BM25)    │   │  trigram    │
//!  │ (flat L2)│    │  per-asg   │   │  fallback   │
//!  └──────────┘    └────────────┘   └────────────┘
//! ```
//!
//! Model inference (embeddings, AI classifier, cross-encoder), document
//! text extraction, and the relational submission store are external
//! collaborators behind the traits in [`providers`]. The crate never loads
//! a model itself.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`chunk`] | Overlapping word-window chunker |
//! | [`providers`] | External collaborator traits |
//! | [`cache`] | TTL + capacity-bounded score caches |
//! | [`vector_store`] | Flat L2 vector index with parallel metadata |
//! | [`lexical`] | Per-assignment BM25 retrieval |
//! | [`fusion`] | Heterogeneous signal fusion into one probability |
//! | [`orchestrator`] | The `run_check` pipeline |
//! | [`highlight`] | Chunk-to-page-word highlight alignment |

pub mod cache;
pub mod chunk;
pub mod config;
pub mod fusion;
pub mod highlight;
pub mod lexical;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod vector_store;
