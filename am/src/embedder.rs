//! Embedder seam
//!
//! The store never talks to an LLM itself. The daemon implements this trait
//! on its router (role `embedding`) and hands it to whatever needs to turn
//! text into vectors.

use async_trait::async_trait;
use thiserror::Error;

/// Errors from an embedding provider
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("Embedding backend unavailable: {0}")]
    Unavailable(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {found}")]
    Dimension { expected: usize, found: usize },
}

/// Turns text into a fixed-dimension dense vector
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text. The returned vector length equals `dimension()`.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    /// The fixed dimension of every vector this embedder produces
    fn dimension(&self) -> usize;
}
