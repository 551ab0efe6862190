//! Router and backend error types

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during routed LLM operations
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("All endpoints and fallbacks exhausted for role '{role}': {detail}")]
    Unavailable { role: String, detail: String },

    #[error("Prompt needs {needed} tokens but the window leaves {available}")]
    ContextOverflow { needed: usize, available: usize },

    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Backend '{backend}' does not support {operation}")]
    Unsupported { backend: String, operation: String },

    #[error("Embedding has dimension {found}, expected {expected}")]
    BadEmbedding { expected: usize, found: usize },

    #[error("Cancelled")]
    Cancelled,
}

impl RouterError {
    /// Whether trying another endpoint may help
    pub fn is_retryable(&self) -> bool {
        match self {
            RouterError::RateLimited { .. } => true,
            RouterError::ApiError { status, .. } => matches!(status, 408 | 429) || *status >= 500,
            RouterError::Network(_) => true,
            RouterError::Timeout(_) => true,
            RouterError::Unavailable { .. }
            | RouterError::ContextOverflow { .. }
            | RouterError::UnknownRole(_)
            | RouterError::Json(_)
            | RouterError::Unsupported { .. }
            | RouterError::BadEmbedding { .. }
            | RouterError::Cancelled => false,
        }
    }
}
