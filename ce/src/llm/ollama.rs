//! Ollama backend adapter
//!
//! Speaks the local Ollama API: `/api/generate` for completions,
//! `/api/embeddings` for vectors, `/api/tags` for health and model listing.
//! No credentials; Ollama is assumed to be reachable on a trusted network.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use super::backend::LlmBackend;
use super::error::RouterError;
use super::http::send_with_retry;
use super::types::{ChatRequest, ChatResponse, ChatRole, TokenUsage};
use crate::config::BackendConfig;

pub struct OllamaBackend {
    name: String,
    http: Client,
}

impl OllamaBackend {
    pub fn new(name: &str, config: &BackendConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .unwrap_or_default();
        Self {
            name: name.to_string(),
            http,
        }
    }

    /// Flatten chat messages into Ollama's single prompt + system form
    fn build_request_body(request: &ChatRequest) -> serde_json::Value {
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == ChatRole::System)
            .map(|m| m.content.as_str())
            .collect();

        let prompt = request
            .messages
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut options = serde_json::json!({
            "num_predict": request.max_tokens,
        });
        if let Some(t) = request.temperature {
            options["temperature"] = serde_json::json!(t);
        }
        if !request.stop.is_empty() {
            options["stop"] = serde_json::json!(request.stop);
        }

        let mut body = serde_json::json!({
            "model": request.model,
            "prompt": prompt,
            "stream": false,
            "options": options,
        });
        if !system.is_empty() {
            body["system"] = serde_json::json!(system.join("\n\n"));
        }
        body
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}

#[async_trait]
impl LlmBackend for OllamaBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, endpoint: &str, request: &ChatRequest) -> Result<ChatResponse, RouterError> {
        let url = format!("{}/api/generate", endpoint.trim_end_matches('/'));
        let body = Self::build_request_body(request);

        let response = send_with_retry(|| self.http.post(&url).json(&body)).await?;
        let parsed: GenerateResponse = response.json().await?;

        let usage = match (parsed.prompt_eval_count, parsed.eval_count) {
            (None, None) => None,
            (p, c) => Some(TokenUsage {
                prompt_tokens: p.unwrap_or(0),
                completion_tokens: c.unwrap_or(0),
            }),
        };

        Ok(ChatResponse {
            text: parsed.response,
            usage,
        })
    }

    async fn embed(&self, endpoint: &str, model: &str, text: &str) -> Result<Vec<f32>, RouterError> {
        let url = format!("{}/api/embeddings", endpoint.trim_end_matches('/'));
        let body = serde_json::json!({ "model": model, "prompt": text });

        let response = send_with_retry(|| self.http.post(&url).json(&body)).await?;
        let parsed: EmbeddingsResponse = response.json().await?;
        Ok(parsed.embedding)
    }

    async fn health(&self, endpoint: &str) -> Result<(), RouterError> {
        let url = format!("{}/api/tags", endpoint.trim_end_matches('/'));
        let response = self.http.get(&url).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(RouterError::ApiError {
                status: response.status().as_u16(),
                message: "health probe failed".to_string(),
            })
        }
    }

    async fn list_models(&self, endpoint: &str) -> Result<Vec<String>, RouterError> {
        let url = format!("{}/api/tags", endpoint.trim_end_matches('/'));
        let response = send_with_retry(|| self.http.get(&url)).await?;
        let parsed: TagsResponse = response.json().await?;
        Ok(parsed.models.into_iter().map(|m| m.name).collect())
    }
}
