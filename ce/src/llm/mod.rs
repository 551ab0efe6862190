//! LLM routing layer
//!
//! Backend adapters, the backend-agnostic request/response types, and the
//! role-based router with round-robin endpoint balancing.

mod anthropic;
pub mod backend;
mod error;
mod http;
mod ollama;
mod openai;
mod router;
mod types;

pub use anthropic::AnthropicBackend;
pub use backend::{LlmBackend, create_backend};
pub use error::RouterError;
pub use ollama::OllamaBackend;
pub use openai::OpenAiBackend;
pub use router::Router;
pub use types::{ChatMessage, ChatRequest, ChatResponse, ChatRole, GenerateOptions, TokenUsage, estimate_tokens};
