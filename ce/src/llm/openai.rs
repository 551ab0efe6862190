//! OpenAI-compatible backend adapter
//!
//! Covers the `/chat/completions`, `/embeddings` and `/models` surface that
//! OpenAI, Azure deployments and the many compatible local servers share.
//! Endpoints are expected to include any path prefix (e.g. `/v1`).

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use super::backend::LlmBackend;
use super::error::RouterError;
use super::http::send_with_retry;
use super::types::{ChatRequest, ChatResponse, ChatRole, TokenUsage};
use crate::config::BackendConfig;

pub struct OpenAiBackend {
    name: String,
    api_key: Option<String>,
    http: Client,
}

impl OpenAiBackend {
    /// Create the adapter, reading the API key from the configured env var
    pub fn new(name: &str, config: &BackendConfig) -> Result<Self, RouterError> {
        let api_key = match &config.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| RouterError::ApiError {
                status: 401,
                message: format!("Environment variable {} not set", var),
            })?),
            None => None,
        };

        let http = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;

        Ok(Self {
            name: name.to_string(),
            api_key,
            http,
        })
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn build_request_body(request: &ChatRequest) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    ChatRole::System => "system",
                    ChatRole::User => "user",
                    ChatRole::Assistant => "assistant",
                };
                serde_json::json!({ "role": role, "content": m.content })
            })
            .collect();

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "stream": false,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if !request.stop.is_empty() {
            body["stop"] = serde_json::json!(request.stop);
        }
        body
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<UsageBlock>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageBlock {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelRow>,
}

#[derive(Debug, Deserialize)]
struct ModelRow {
    id: String,
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, endpoint: &str, request: &ChatRequest) -> Result<ChatResponse, RouterError> {
        let url = format!("{}/chat/completions", endpoint.trim_end_matches('/'));
        let body = Self::build_request_body(request);

        let response = send_with_retry(|| self.authed(self.http.post(&url)).json(&body)).await?;
        let parsed: ChatCompletionResponse = response.json().await?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok(ChatResponse {
            text,
            usage: parsed.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            }),
        })
    }

    async fn embed(&self, endpoint: &str, model: &str, text: &str) -> Result<Vec<f32>, RouterError> {
        let url = format!("{}/embeddings", endpoint.trim_end_matches('/'));
        let body = serde_json::json!({ "model": model, "input": text });

        let response = send_with_retry(|| self.authed(self.http.post(&url)).json(&body)).await?;
        let parsed: EmbeddingResponse = response.json().await?;

        parsed
            .data
            .into_iter()
            .next()
            .map(|row| row.embedding)
            .ok_or_else(|| RouterError::ApiError {
                status: 200,
                message: "embedding response carried no data".to_string(),
            })
    }

    async fn health(&self, endpoint: &str) -> Result<(), RouterError> {
        let url = format!("{}/models", endpoint.trim_end_matches('/'));
        let response = self.authed(self.http.get(&url)).send().await?;
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
        let url = format!("{}/models", endpoint.trim_end_matches('/'));
        let response = send_with_retry(|| self.authed(self.http.get(&url))).await?;
        let parsed: ModelsResponse = response.json().await?;
        Ok(parsed.data.into_iter().map(|m| m.id).collect())
    }
}
