//! Store error types

use thiserror::Error;

/// Errors that can occur in an artifact store backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store schema version {found} is newer than supported {supported}")]
    SchemaVersion { found: u32, supported: u32 },

    #[error("Embedding dimension mismatch: expected {expected}, got {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Vector matrix is misaligned with the index: {0}")]
    CorruptMatrix(String),

    #[error("Store is locked by another process: {0}")]
    Locked(String),

    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Remote store error: {0}")]
    Remote(String),
}

impl StoreError {
    /// Whether the operation may succeed if retried against the same backend
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Network(_) | StoreError::Remote(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_version_display() {
        let err = StoreError::SchemaVersion { found: 9, supported: 1 };
        assert!(err.to_string().contains("9"));
        assert!(err.to_string().contains("1"));
    }

    #[test]
    fn test_retryable() {
        assert!(StoreError::Remote("down".into()).is_retryable());
        assert!(!StoreError::NotFound("x".into()).is_retryable());
    }
}
