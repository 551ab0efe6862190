//! Anthropic backend adapter
//!
//! Maps the backend-agnostic request onto the Messages API. Anthropic serves
//! no embedding endpoint, so the embedding role must resolve to a different
//! backend.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use super::backend::LlmBackend;
use super::error::RouterError;
use super::http::send_with_retry;
use super::types::{ChatRequest, ChatResponse, ChatRole, TokenUsage};
use crate::config::BackendConfig;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicBackend {
    name: String,
    api_key: String,
    http: Client,
}

impl AnthropicBackend {
    /// Create the adapter, reading the API key from the configured env var
    pub fn new(name: &str, config: &BackendConfig) -> Result<Self, RouterError> {
        let var = config.api_key_env.as_deref().unwrap_or("ANTHROPIC_API_KEY");
        let api_key = std::env::var(var).map_err(|_| RouterError::ApiError {
            status: 401,
            message: format!("Environment variable {} not set", var),
        })?;

        let http = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;

        Ok(Self {
            name: name.to_string(),
            api_key,
            http,
        })
    }

    fn build_request_body(request: &ChatRequest) -> serde_json::Value {
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == ChatRole::System)
            .map(|m| m.content.as_str())
            .collect();

        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .map(|m| {
                let role = if m.role == ChatRole::Assistant { "assistant" } else { "user" };
                serde_json::json!({ "role": role, "content": m.content })
            })
            .collect();

        let mut body = serde_json::json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": messages,
        });
        if !system.is_empty() {
            body["system"] = serde_json::json!(system.join("\n\n"));
        }
        if let Some(t) = request.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if !request.stop.is_empty() {
            body["stop_sequences"] = serde_json::json!(request.stop);
        }
        body
    }

    fn headers(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("x-api-key", self.api_key.clone())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<AnthropicBlock>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
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
impl LlmBackend for AnthropicBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, endpoint: &str, request: &ChatRequest) -> Result<ChatResponse, RouterError> {
        let url = format!("{}/v1/messages", endpoint.trim_end_matches('/'));
        let body = Self::build_request_body(request);

        let response = send_with_retry(|| self.headers(self.http.post(&url)).json(&body)).await?;
        let parsed: MessagesResponse = response.json().await?;

        let text = parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                AnthropicBlock::Text { text } => Some(text),
                AnthropicBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("");

        Ok(ChatResponse {
            text,
            usage: parsed.usage.map(|u| TokenUsage {
                prompt_tokens: u.input_tokens,
                completion_tokens: u.output_tokens,
            }),
        })
    }

    async fn embed(&self, _endpoint: &str, _model: &str, _text: &str) -> Result<Vec<f32>, RouterError> {
        Err(RouterError::Unsupported {
            backend: self.name.clone(),
            operation: "embeddings".to_string(),
        })
    }

    async fn health(&self, endpoint: &str) -> Result<(), RouterError> {
        let url = format!("{}/v1/models", endpoint.trim_end_matches('/'));
        let response = self.headers(self.http.get(&url)).send().await?;
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
        let url = format!("{}/v1/models", endpoint.trim_end_matches('/'));
        let response = send_with_retry(|| self.headers(self.http.get(&url))).await?;
        let parsed: ModelsResponse = response.json().await?;
        Ok(parsed.data.into_iter().map(|m| m.id).collect())
    }
}
