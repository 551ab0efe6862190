//! LlmBackend trait and adapter factory
//!
//! A backend is one provider protocol (Ollama, OpenAI-compatible, Anthropic)
//! reachable at one or more endpoints. The router owns endpoint selection;
//! adapters are handed the endpoint per call and stay stateless beyond their
//! HTTP client and credentials.

use std::sync::Arc;

use async_trait::async_trait;

use super::error::RouterError;
use super::types::{ChatRequest, ChatResponse};
use crate::config::{BackendConfig, BackendProtocol};

/// One provider protocol behind the router
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Backend name from config, for logs and error messages
    fn name(&self) -> &str;

    /// Send a completion request to the given endpoint
    async fn chat(&self, endpoint: &str, request: &ChatRequest) -> Result<ChatResponse, RouterError>;

    /// Embed a text into a dense vector
    async fn embed(&self, endpoint: &str, model: &str, text: &str) -> Result<Vec<f32>, RouterError>;

    /// Probe whether the endpoint answers at all
    async fn health(&self, endpoint: &str) -> Result<(), RouterError>;

    /// Models the endpoint serves, used at startup to refuse bad configs
    async fn list_models(&self, endpoint: &str) -> Result<Vec<String>, RouterError>;
}

/// Create a backend adapter from its configuration
pub fn create_backend(name: &str, config: &BackendConfig) -> Result<Arc<dyn LlmBackend>, RouterError> {
    match config.protocol {
        BackendProtocol::Ollama => Ok(Arc::new(super::ollama::OllamaBackend::new(name, config))),
        BackendProtocol::Openai => Ok(Arc::new(super::openai::OpenAiBackend::new(name, config)?)),
        BackendProtocol::Anthropic => Ok(Arc::new(super::anthropic::AnthropicBackend::new(name, config)?)),
    }
}

/// Deterministic in-process backend for the test suite and offline runs
///
/// Completions are served from a scripted queue; embeddings are a hashed
/// bag-of-words projection, so texts sharing words land near each other in
/// cosine space. Every call is recorded for assertions.
pub mod mock {
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex;

    use super::*;

    /// One recorded chat call
    #[derive(Debug, Clone)]
    pub struct RecordedCall {
        pub endpoint: String,
        pub model: String,
        pub prompt: String,
        pub temperature: Option<f64>,
    }

    pub struct MockBackend {
        name: String,
        dimension: usize,
        responses: Mutex<VecDeque<String>>,
        calls: Mutex<Vec<RecordedCall>>,
        dead_endpoints: Mutex<HashSet<String>>,
    }

    impl MockBackend {
        pub fn new(responses: Vec<String>) -> Self {
            Self {
                name: "mock".to_string(),
                dimension: 16,
                responses: Mutex::new(responses.into_iter().collect()),
                calls: Mutex::new(Vec::new()),
                dead_endpoints: Mutex::new(HashSet::new()),
            }
        }

        pub fn with_dimension(mut self, dimension: usize) -> Self {
            self.dimension = dimension;
            self
        }

        /// Make an endpoint fail every chat call with a 503
        pub fn kill_endpoint(&self, endpoint: &str) {
            self.dead_endpoints.lock().unwrap().insert(endpoint.to_string());
        }

        /// Queue more scripted responses
        pub fn push_response(&self, response: impl Into<String>) {
            self.responses.lock().unwrap().push_back(response.into());
        }

        pub fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        /// Hashed bag-of-words embedding of the configured dimension
        pub fn embed_text(dimension: usize, text: &str) -> Vec<f32> {
            let mut vector = vec![0.0f32; dimension];
            for word in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
                if word.is_empty() {
                    continue;
                }
                let mut hash: usize = 5381;
                for b in word.bytes() {
                    hash = hash.wrapping_mul(33).wrapping_add(b as usize);
                }
                vector[hash % dimension] += 1.0;
            }
            let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm > 0.0 {
                for v in &mut vector {
                    *v /= norm;
                }
            }
            vector
        }
    }

    #[async_trait]
    impl LlmBackend for MockBackend {
        fn name(&self) -> &str {
            &self.name
        }

        async fn chat(&self, endpoint: &str, request: &ChatRequest) -> Result<ChatResponse, RouterError> {
            if self.dead_endpoints.lock().unwrap().contains(endpoint) {
                return Err(RouterError::ApiError {
                    status: 503,
                    message: format!("endpoint {} is down", endpoint),
                });
            }

            let prompt = request
                .messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            self.calls.lock().unwrap().push(RecordedCall {
                endpoint: endpoint.to_string(),
                model: request.model.clone(),
                prompt,
                temperature: request.temperature,
            });

            let text = self.responses.lock().unwrap().pop_front().unwrap_or_default();
            Ok(ChatResponse { text, usage: None })
        }

        async fn embed(&self, _endpoint: &str, _model: &str, text: &str) -> Result<Vec<f32>, RouterError> {
            Ok(Self::embed_text(self.dimension, text))
        }

        async fn health(&self, endpoint: &str) -> Result<(), RouterError> {
            if self.dead_endpoints.lock().unwrap().contains(endpoint) {
                return Err(RouterError::ApiError {
                    status: 503,
                    message: "down".to_string(),
                });
            }
            Ok(())
        }

        async fn list_models(&self, _endpoint: &str) -> Result<Vec<String>, RouterError> {
            Ok(vec!["mock-model".to_string()])
        }
    }

}
