//! ArtifactStore - semantic memory for generated artifacts
//!
//! Stores typed artifacts (plans, functions, workflows, tool descriptors,
//! fixes, performance records) with optional dense embeddings, and retrieves
//! them by meaning (cosine similarity), by id, or by metadata filters.
//!
//! # Architecture
//!
//! ```text
//! .artifactstore/
//! ├── index.json       # schema-versioned artifact metadata, rows aligned
//! ├── vectors.bin      # f32 little-endian matrix, one row per embedding
//! └── store.lock       # exclusive fs2 lock held by the owning process
//! ```
//!
//! Two backends satisfy the same [`ArtifactStore`] contract: [`LocalStore`]
//! (file-backed, preferred for small caches) and [`RemoteStore`] (HTTP
//! vector-DB, eventually consistent). Embeddings are computed by the caller
//! through the [`Embedder`] seam; this crate never talks to an LLM itself.

pub mod cli;
pub mod config;

mod artifact;
mod embedder;
mod error;
mod local;
mod remote;
mod store;

pub use artifact::{Artifact, ArtifactKind};
pub use config::StoreConfig;
pub use embedder::{EmbedError, Embedder};
pub use error::StoreError;
pub use local::LocalStore;
pub use remote::{RemoteStore, RemoteStoreConfig};
pub use store::{ArtifactStore, SearchHit, SearchQuery, cosine_similarity};

/// On-disk index schema version. Opening a store with a higher version fails.
pub const SCHEMA_VERSION: u32 = 1;

/// Default embedding dimension.
pub const DEFAULT_DIMENSION: usize = 768;

/// Default minimum cosine similarity for semantic search hits.
pub const DEFAULT_MIN_SIMILARITY: f64 = 0.3;

/// Default weight for the exponential moving average on quality updates.
pub const DEFAULT_EMA_ALPHA: f64 = 0.3;
