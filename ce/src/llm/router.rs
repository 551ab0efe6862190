//! The LLM router
//!
//! Resolves a logical role to a model and endpoint pool via the routing
//! policy, balances calls across endpoints with an independent round-robin
//! counter per role, fits the prompt into the role's context window, and
//! fails over across endpoints and then fallback backends. The router never
//! interprets response bodies; it hands raw text to the caller.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use eyre::Result;
use tracing::{debug, warn};

use artifactstore::{EmbedError, Embedder};

use super::backend::{LlmBackend, create_backend};
use super::error::RouterError;
use super::types::{ChatMessage, ChatRequest, GenerateOptions, estimate_tokens};
use crate::cancel::CancelToken;
use crate::config::{LlmPolicyConfig, ResolvedRole};

/// Routes generation and embedding calls onto configured backends
pub struct Router {
    policy: LlmPolicyConfig,
    dimension: usize,
    backends: BTreeMap<String, Arc<dyn LlmBackend>>,
    counters: Mutex<HashMap<String, Arc<AtomicUsize>>>,
    cancel: CancelToken,
}

impl Router {
    /// Build the router and one adapter per configured backend
    pub fn new(policy: LlmPolicyConfig, dimension: usize, cancel: CancelToken) -> Result<Self> {
        let mut backends: BTreeMap<String, Arc<dyn LlmBackend>> = BTreeMap::new();
        for (name, config) in &policy.backends {
            let adapter = create_backend(name, config)
                .map_err(|e| eyre::eyre!("Failed to create backend '{}': {}", name, e))?;
            backends.insert(name.clone(), adapter);
        }

        Ok(Self {
            policy,
            dimension,
            backends,
            counters: Mutex::new(HashMap::new()),
            cancel,
        })
    }

    /// Build a router over injected adapters (tests, offline runs)
    pub fn with_backends(
        policy: LlmPolicyConfig,
        dimension: usize,
        backends: BTreeMap<String, Arc<dyn LlmBackend>>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            policy,
            dimension,
            backends,
            counters: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// The routing policy this router was built from
    pub fn policy(&self) -> &LlmPolicyConfig {
        &self.policy
    }

    /// Take the next round-robin slot for a role
    fn next_slot(&self, role: &str) -> usize {
        let counter = {
            let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            counters.entry(role.to_string()).or_default().clone()
        };
        counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Generate text for a role. The result is the raw completion; an empty
    /// string is a model refusal, not an error.
    pub async fn generate(
        &self,
        role: &str,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<String, RouterError> {
        let resolved = self
            .policy
            .resolve(role, options.category.as_deref())
            .map_err(|e| RouterError::UnknownRole(format!("{}: {}", role, e)))?;

        let model = options.model.clone().unwrap_or_else(|| resolved.model.clone());
        let max_tokens = options.max_tokens.unwrap_or(resolved.max_tokens);
        let temperature = options.temperature.or(resolved.temperature);

        let budget = resolved
            .context_window
            .saturating_sub(self.policy.reserved_output_tokens);
        let prompt = truncate_prompt(options.system_prompt.as_deref(), prompt, budget)?;

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &options.system_prompt {
            messages.push(ChatMessage::system(system.clone()));
        }
        messages.push(ChatMessage::user(prompt));

        let request = ChatRequest {
            model,
            messages,
            temperature,
            max_tokens,
            stop: options.stop.clone(),
            stream: false,
        };

        debug!(
            role,
            model = %request.model,
            prompt_digest = %digest(&request.messages.last().map(|m| m.content.as_str()).unwrap_or("")),
            "Routing generation"
        );

        let response = self.dispatch(&resolved, &request).await?;
        debug!(role, response_digest = %digest(&response), "Generation complete");
        Ok(response)
    }

    /// Walk the endpoint pool from the round-robin slot, then fallbacks
    async fn dispatch(&self, resolved: &ResolvedRole, request: &ChatRequest) -> Result<String, RouterError> {
        let backend = self
            .backends
            .get(&resolved.backend)
            .ok_or_else(|| RouterError::UnknownRole(format!("backend '{}' not built", resolved.backend)))?;

        let timeout = resolved.tier.timeout();
        let start = self.next_slot(&resolved.role);
        let n = resolved.endpoints.len();
        let mut failures: Vec<String> = Vec::new();

        for i in 0..n {
            if self.cancel.is_cancelled() {
                return Err(RouterError::Cancelled);
            }

            let endpoint = &resolved.endpoints[(start + i) % n];
            match tokio::time::timeout(timeout, backend.chat(endpoint, request)).await {
                Ok(Ok(response)) => {
                    if let Some(usage) = &response.usage {
                        debug!(
                            role = %resolved.role,
                            prompt_tokens = usage.prompt_tokens,
                            completion_tokens = usage.completion_tokens,
                            "Token usage"
                        );
                    }
                    return Ok(response.text);
                }
                Ok(Err(e)) => {
                    warn!(endpoint, error = %e, "Endpoint attempt failed");
                    failures.push(format!("{}: {}", endpoint, e));
                }
                Err(_) => {
                    warn!(endpoint, ?timeout, "Endpoint attempt timed out");
                    failures.push(format!("{}: timeout after {:?}", endpoint, timeout));
                }
            }
        }

        // One retry against the first reachable fallback backend
        for fallback_name in &resolved.fallback_backends {
            if self.cancel.is_cancelled() {
                return Err(RouterError::Cancelled);
            }
            let Some(fallback) = self.backends.get(fallback_name) else {
                continue;
            };
            let Some(endpoint) = self.backend_endpoint(fallback_name) else {
                continue;
            };
            if fallback.health(&endpoint).await.is_err() {
                failures.push(format!("{}: unreachable", fallback_name));
                continue;
            }

            debug!(fallback = %fallback_name, "Primary endpoints exhausted, using fallback backend");
            match tokio::time::timeout(timeout, fallback.chat(&endpoint, request)).await {
                Ok(Ok(response)) => return Ok(response.text),
                Ok(Err(e)) => failures.push(format!("{}: {}", fallback_name, e)),
                Err(_) => failures.push(format!("{}: timeout after {:?}", fallback_name, timeout)),
            }
            break;
        }

        Err(RouterError::Unavailable {
            role: resolved.role.clone(),
            detail: failures.join("; "),
        })
    }

    /// First endpoint of a backend's own pool
    fn backend_endpoint(&self, backend_name: &str) -> Option<String> {
        let config = self.policy.backends.get(backend_name)?;
        config
            .endpoints
            .first()
            .cloned()
            .or_else(|| Some(config.base_url.clone()))
    }

    /// Embed text via the `embedding` role, enforcing the configured dimension
    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>, RouterError> {
        let resolved = self
            .policy
            .resolve("embedding", None)
            .map_err(|e| RouterError::UnknownRole(format!("embedding: {}", e)))?;

        let backend = self
            .backends
            .get(&resolved.backend)
            .ok_or_else(|| RouterError::UnknownRole(format!("backend '{}' not built", resolved.backend)))?;

        let timeout = resolved.tier.timeout();
        let start = self.next_slot("embedding");
        let n = resolved.endpoints.len();
        let mut failures = Vec::new();

        for i in 0..n {
            let endpoint = &resolved.endpoints[(start + i) % n];
            match tokio::time::timeout(timeout, backend.embed(endpoint, &resolved.model, text)).await {
                Ok(Ok(vector)) => {
                    if vector.len() != self.dimension {
                        return Err(RouterError::BadEmbedding {
                            expected: self.dimension,
                            found: vector.len(),
                        });
                    }
                    return Ok(vector);
                }
                Ok(Err(e)) => failures.push(format!("{}: {}", endpoint, e)),
                Err(_) => failures.push(format!("{}: timeout after {:?}", endpoint, timeout)),
            }
        }

        Err(RouterError::Unavailable {
            role: "embedding".to_string(),
            detail: failures.join("; "),
        })
    }

    /// Probe every backend endpoint and confirm each role's model is served
    ///
    /// Used at startup when `llm.verify-backends` is on.
    pub async fn verify_backends(&self) -> Result<()> {
        for (name, backend) in &self.backends {
            let Some(endpoint) = self.backend_endpoint(name) else { continue };
            backend
                .health(&endpoint)
                .await
                .map_err(|e| eyre::eyre!("backend '{}' failed its health probe at {}: {}", name, endpoint, e))?;

            let served = backend
                .list_models(&endpoint)
                .await
                .map_err(|e| eyre::eyre!("backend '{}' failed to list models: {}", name, e))?;

            let mut roles: Vec<&str> = crate::config::CORE_ROLES.to_vec();
            for role in self.policy.roles.keys() {
                if !roles.contains(&role.as_str()) {
                    roles.push(role);
                }
            }
            for role in roles {
                let Ok(resolved) = self.policy.resolve(role, None) else { continue };
                if resolved.backend == *name && !served.iter().any(|m| *m == resolved.model) {
                    eyre::bail!(
                        "backend '{}' does not serve model '{}' required by role '{}'",
                        name,
                        resolved.model,
                        role
                    );
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Embedder for Router {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        match self.embed_text(text).await {
            Ok(vector) => Ok(vector),
            Err(RouterError::BadEmbedding { expected, found }) => Err(EmbedError::Dimension { expected, found }),
            Err(e) => Err(EmbedError::Unavailable(e.to_string())),
        }
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Fit a prompt into the token budget, dropping the oldest content first
///
/// The system prompt is never dropped; if it alone exceeds the budget the
/// call fails with `ContextOverflow`.
fn truncate_prompt(system: Option<&str>, prompt: &str, budget: usize) -> Result<String, RouterError> {
    let system_tokens = system.map(estimate_tokens).unwrap_or(0);
    if system_tokens >= budget {
        return Err(RouterError::ContextOverflow {
            needed: system_tokens,
            available: budget,
        });
    }

    let remaining = budget - system_tokens;
    if estimate_tokens(prompt) <= remaining {
        return Ok(prompt.to_string());
    }

    // Keep the newest tail; the head is the oldest context
    let keep_chars = remaining * 4;
    let total = prompt.chars().count();
    let truncated: String = prompt.chars().skip(total.saturating_sub(keep_chars)).collect();
    debug!(
        dropped_chars = total - truncated.chars().count(),
        "Truncated prompt to fit context window"
    );
    Ok(truncated)
}

/// Short digest for prompt/response logging
fn digest(text: &str) -> String {
    let flat: String = text.chars().take(120).map(|c| if c == '\n' { ' ' } else { c }).collect();
    if text.chars().count() > 120 {
        format!("{}... ({} chars)", flat, text.len())
    } else {
        flat
    }
}
