//! The tool registry
//!
//! Selection is semantic: the task text is embedded and matched against the
//! TOOL artifacts in memory; the best non-deprecated specialist above the
//! similarity threshold wins, and the generic fallback answers everything
//! else. Selection never returns nothing.

use std::collections::HashMap;
use std::sync::Arc;

use eyre::{Context, Result};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use artifactstore::ArtifactKind;

use super::tool::{Invocation, Tool, ToolKind};
use crate::config::RegistryConfig;
use crate::llm::{GenerateOptions, Router};
use crate::memory::Memory;
use crate::runner::{ExecutionMetrics, SandboxRunner};

/// What invoking a tool produced
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    /// Text from an LLM-backed tool
    Text(String),

    /// Metrics from an executable
    Execution(ExecutionMetrics),

    /// The caller must run this workflow; the registry does not recurse
    Workflow { workflow_id: String },
}

/// Process-wide tool catalogue
pub struct ToolRegistry {
    memory: Arc<Memory>,
    router: Arc<Router>,
    runner: Arc<SandboxRunner>,
    config: RegistryConfig,
    tools: RwLock<HashMap<String, Tool>>,
}

impl ToolRegistry {
    pub fn new(
        memory: Arc<Memory>,
        router: Arc<Router>,
        runner: Arc<SandboxRunner>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            memory,
            router,
            runner,
            config,
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Guarantee the generic fallback exists; call once at startup
    pub async fn bootstrap(&self) -> Result<()> {
        let has_fallback = {
            let tools = self.tools.read().await;
            tools.values().any(|t| t.kind == ToolKind::GenericFallback)
        };
        if !has_fallback {
            self.register(Tool::generic_fallback()).await?;
            info!("Registered generic fallback tool");
        }
        Ok(())
    }

    /// Store a tool and index its description for semantic selection
    pub async fn register(&self, tool: Tool) -> Result<()> {
        self.memory
            .save(tool.artifact())
            .await
            .context("Failed to index tool in memory")?;

        debug!(tool_id = %tool.tool_id, name = %tool.name, "Registered tool");
        self.tools.write().await.insert(tool.tool_id.clone(), tool);
        Ok(())
    }

    pub async fn get(&self, tool_id: &str) -> Option<Tool> {
        self.tools.read().await.get(tool_id).cloned()
    }

    pub async fn list(&self, kind: Option<ToolKind>) -> Vec<Tool> {
        let tools = self.tools.read().await;
        let mut listed: Vec<Tool> = tools
            .values()
            .filter(|t| kind.is_none_or(|k| t.kind == k))
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.name.cmp(&b.name));
        listed
    }

    /// Pick the best tool for a task; at worst, the generic fallback
    pub async fn select(&self, task_text: &str) -> Result<Tool> {
        let hits = self
            .memory
            .find(
                task_text,
                Some(ArtifactKind::Tool),
                &[],
                8,
                Some(self.config.min_similarity),
            )
            .await
            .unwrap_or_default();

        let tools = self.tools.read().await;
        for hit in &hits {
            if hit.similarity < self.config.min_similarity {
                continue;
            }
            let Some(tool_id) = hit.artifact.metadata.get("tool_id").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(tool) = tools.get(tool_id) else { continue };
            if tool.deprecated || tool.kind == ToolKind::GenericFallback {
                continue;
            }
            debug!(
                tool = %tool.name,
                similarity = hit.similarity,
                "Selected specialist tool"
            );
            return Ok(tool.clone());
        }

        let fallback = tools
            .values()
            .find(|t| t.kind == ToolKind::GenericFallback)
            .cloned()
            .ok_or_else(|| eyre::eyre!("Generic fallback tool is missing; registry was not bootstrapped"))?;
        debug!("No specialist cleared the threshold; using the generic fallback");
        Ok(fallback)
    }

    /// Invoke a tool on an input
    ///
    /// Workflow tools are returned to the caller for execution; everything
    /// else is dispatched here. Usage and failure counters update either way.
    pub async fn invoke(&self, tool_id: &str, input: &str) -> Result<ToolOutcome> {
        let tool = self
            .get(tool_id)
            .await
            .ok_or_else(|| eyre::eyre!("Unknown tool: {}", tool_id))?;

        let outcome = self.dispatch(&tool, input).await;
        let success = match &outcome {
            Ok(ToolOutcome::Execution(metrics)) => metrics.success,
            Ok(_) => true,
            Err(_) => false,
        };
        self.record_outcome(tool_id, success, None).await?;
        outcome
    }

    async fn dispatch(&self, tool: &Tool, input: &str) -> Result<ToolOutcome> {
        match &tool.invocation {
            Invocation::Role { role, category } => {
                let options = GenerateOptions {
                    category: category.clone(),
                    ..Default::default()
                };
                let text = self
                    .router
                    .generate(role, input, &options)
                    .await
                    .context(format!("Tool '{}' failed", tool.name))?;
                Ok(ToolOutcome::Text(text))
            }
            Invocation::Model { model, endpoints: _ } => {
                let options = GenerateOptions::default().with_model(model.clone());
                let text = self
                    .router
                    .generate("general", input, &options)
                    .await
                    .context(format!("Tool '{}' failed", tool.name))?;
                Ok(ToolOutcome::Text(text))
            }
            Invocation::Command { program, args } => {
                let mut argv = vec![program.clone()];
                argv.extend(args.iter().map(|a| a.replace("{input}", input)));
                let timeout = tool
                    .constraints
                    .as_ref()
                    .and_then(|c| c.max_time_ms)
                    .unwrap_or(30_000);
                let metrics = self
                    .runner
                    .run_command(&argv, input, timeout)
                    .await
                    .context(format!("Tool '{}' failed to run", tool.name))?;
                Ok(ToolOutcome::Execution(metrics))
            }
            Invocation::WorkflowRef { workflow_id } => Ok(ToolOutcome::Workflow {
                workflow_id: workflow_id.clone(),
            }),
        }
    }

    /// Fold an invocation result into the tool's counters and quality
    ///
    /// The fallback's quality is floor-capped so one bad run cannot remove
    /// it from availability; specialists crossing the failure threshold with
    /// low quality are deprecated but preserved for audit.
    pub async fn record_outcome(&self, tool_id: &str, success: bool, score: Option<f64>) -> Result<()> {
        let mut tools = self.tools.write().await;
        let Some(tool) = tools.get_mut(tool_id) else {
            return Ok(());
        };

        tool.usage_count += 1;
        if !success {
            tool.failure_count += 1;
        }

        let sample = score.unwrap_or(if success { 1.0 } else { 0.0 });
        tool.quality_score = 0.3 * sample + 0.7 * tool.quality_score;

        if tool.kind == ToolKind::GenericFallback {
            tool.quality_score = tool.quality_score.max(self.config.fallback_quality_floor);
        } else if !tool.deprecated
            && tool.failure_count >= self.config.deprecation_failure_threshold
            && tool.quality_score < self.config.deprecation_quality_threshold
        {
            tool.deprecated = true;
            warn!(
                tool = %tool.name,
                failures = tool.failure_count,
                quality = tool.quality_score,
                "Tool deprecated; kept for audit, no longer selectable"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use artifactstore::{ArtifactStore, EmbedError, Embedder, LocalStore};
    use async_trait::async_trait;
    use tempfile::tempdir;

    use crate::cancel::CancelToken;
    use crate::config::{BackendConfig, BackendProtocol, LlmPolicyConfig, RunnerConfig};
    use crate::llm::backend::mock::MockBackend;

    struct WordEmbedder;

    #[async_trait]
    impl Embedder for WordEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
            Ok(MockBackend::embed_text(64, text))
        }

        fn dimension(&self) -> usize {
            64
        }
    }

    fn mock_policy() -> LlmPolicyConfig {
        let mut policy = LlmPolicyConfig::default();
        policy.backends.clear();
        policy.backends.insert(
            "mock".to_string(),
            BackendConfig {
                protocol: BackendProtocol::Ollama,
                base_url: "http://mock".to_string(),
                api_key_env: None,
                endpoints: Vec::new(),
                request_timeout_ms: 600_000,
            },
        );
        for role in policy.roles.values_mut() {
            role.backend = Some("mock".to_string());
        }
        policy
    }

    async fn harness(dir: &std::path::Path, responses: Vec<String>) -> (ToolRegistry, Arc<MockBackend>) {
        let mock = Arc::new(MockBackend::new(responses));
        let mut backends: BTreeMap<String, Arc<dyn crate::llm::LlmBackend>> = BTreeMap::new();
        backends.insert("mock".to_string(), mock.clone() as Arc<dyn crate::llm::LlmBackend>);
        let router = Arc::new(crate::llm::Router::with_backends(
            mock_policy(),
            64,
            backends,
            CancelToken::new(),
        ));

        let store: Arc<dyn ArtifactStore> = Arc::new(LocalStore::open(dir.join("store"), 64, 0.3).unwrap());
        let memory = Arc::new(Memory::new(store, Arc::new(WordEmbedder), 0.3));
        let runner = Arc::new(SandboxRunner::new(RunnerConfig {
            interpreter: vec!["sh".to_string()],
            nodes_dir: dir.join("nodes"),
            default_timeout_ms: 5_000,
            memory_limit_mb: 512,
            sample_interval_ms: 20,
        }));

        let registry = ToolRegistry::new(memory, router, runner, RegistryConfig::default());
        registry.bootstrap().await.unwrap();
        (registry, mock)
    }

    #[tokio::test]
    async fn test_bootstrap_guarantees_fallback() {
        let dir = tempdir().unwrap();
        let (registry, _) = harness(dir.path(), vec![]).await;

        let fallbacks = registry.list(Some(ToolKind::GenericFallback)).await;
        assert_eq!(fallbacks.len(), 1);

        // Bootstrapping again does not duplicate it
        registry.bootstrap().await.unwrap();
        assert_eq!(registry.list(Some(ToolKind::GenericFallback)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_select_matches_specialist_by_meaning() {
        let dir = tempdir().unwrap();
        let (registry, _) = harness(dir.path(), vec![]).await;

        registry
            .register(Tool::specialist(
                "translator",
                "translate text between languages french spanish",
                "translator",
            ))
            .await
            .unwrap();
        registry
            .register(Tool::specialist("summarizer", "summarize long documents", "summarizer"))
            .await
            .unwrap();

        let tool = registry.select("translate text between languages").await.unwrap();
        assert_eq!(tool.name, "translator");
    }

    #[tokio::test]
    async fn test_select_falls_back_when_nothing_matches() {
        let dir = tempdir().unwrap();
        let (registry, _) = harness(dir.path(), vec![]).await;

        registry
            .register(Tool::specialist("translator", "translate text languages", "translator"))
            .await
            .unwrap();

        // Semantically unrelated to the one specialist
        let tool = registry.select("qwmzx pltkv arbitrary gibberish").await.unwrap();
        assert_eq!(tool.kind, ToolKind::GenericFallback);
    }

    #[tokio::test]
    async fn test_select_with_empty_registry_still_returns_fallback() {
        let dir = tempdir().unwrap();
        let (registry, _) = harness(dir.path(), vec![]).await;

        let tool = registry.select("anything at all").await.unwrap();
        assert_eq!(tool.kind, ToolKind::GenericFallback);
    }

    #[tokio::test]
    async fn test_invoke_specialist_routes_text() {
        let dir = tempdir().unwrap();
        let (registry, _) = harness(dir.path(), vec!["bonjour".to_string()]).await;

        let tool = Tool::specialist("translator", "translates", "general");
        let tool_id = tool.tool_id.clone();
        registry.register(tool).await.unwrap();

        let outcome = registry.invoke(&tool_id, "hello").await.unwrap();
        match outcome {
            ToolOutcome::Text(text) => assert_eq!(text, "bonjour"),
            other => panic!("expected text, got {:?}", other),
        }

        let tool = registry.get(&tool_id).await.unwrap();
        assert_eq!(tool.usage_count, 1);
        assert_eq!(tool.failure_count, 0);
    }

    #[tokio::test]
    async fn test_invoke_executable_runs_command() {
        let dir = tempdir().unwrap();
        let (registry, _) = harness(dir.path(), vec![]).await;

        let tool = Tool::executable("echoer", "echoes stdin", "sh", vec!["-c".to_string(), "cat".to_string()]);
        let tool_id = tool.tool_id.clone();
        registry.register(tool).await.unwrap();

        let outcome = registry.invoke(&tool_id, "{\"x\":1}").await.unwrap();
        match outcome {
            ToolOutcome::Execution(metrics) => {
                assert!(metrics.success);
                assert_eq!(metrics.stdout, "{\"x\":1}");
            }
            other => panic!("expected execution, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_workflow_tool_returned_to_caller() {
        let dir = tempdir().unwrap();
        let (registry, _) = harness(dir.path(), vec![]).await;

        let tool = Tool::workflow("pipeline", "runs the pipeline", "wf-42");
        let tool_id = tool.tool_id.clone();
        registry.register(tool).await.unwrap();

        let outcome = registry.invoke(&tool_id, "{}").await.unwrap();
        assert!(matches!(outcome, ToolOutcome::Workflow { workflow_id } if workflow_id == "wf-42"));
    }

    #[tokio::test]
    async fn test_deprecation_after_repeated_failures() {
        let dir = tempdir().unwrap();
        let (registry, _) = harness(dir.path(), vec![]).await;

        let tool = Tool::specialist("flaky", "handles flaky things", "general");
        let tool_id = tool.tool_id.clone();
        registry.register(tool).await.unwrap();

        for _ in 0..6 {
            registry.record_outcome(&tool_id, false, Some(0.0)).await.unwrap();
        }

        let tool = registry.get(&tool_id).await.unwrap();
        assert!(tool.deprecated);
        assert_eq!(tool.usage_count, 6, "preserved for audit");
    }

    #[tokio::test]
    async fn test_fallback_quality_is_floor_capped() {
        let dir = tempdir().unwrap();
        let (registry, _) = harness(dir.path(), vec![]).await;

        for _ in 0..20 {
            registry
                .record_outcome("tool-generic-fallback", false, Some(0.0))
                .await
                .unwrap();
        }

        let fallback = registry.get("tool-generic-fallback").await.unwrap();
        assert!(fallback.quality_score >= 0.2);
        assert!(!fallback.deprecated);
    }
}
