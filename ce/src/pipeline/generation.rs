//! The end-to-end generation pipeline
//!
//! One `handle` call takes a task from text to a verified, persisted code
//! artifact: tool selection, overseer strategy, optional workflow
//! decomposition, structured generation, sandboxed execution, evaluation,
//! and escalation on failure. Everything the run learned lands in the
//! artifact memory.

use std::collections::HashMap;
use std::sync::Arc;

use eyre::{Context, Result, bail};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use artifactstore::{Artifact, ArtifactKind};

use super::contract::parse_generation;
use crate::cancel::CancelToken;
use crate::escalation::{EscalationAttempt, EscalationContext, Escalator};
use crate::eval::{ArtifactClass, EvalKind, Evaluator, Triage, TriageVerdict};
use crate::llm::{GenerateOptions, Router};
use crate::memory::Memory;
use crate::registry::{Invocation, Tool, ToolKind, ToolRegistry};
use crate::runner::{ExecutionMetrics, SandboxRunner};
use crate::prompts::PromptLoader;
use crate::workflow::{StepKind, WorkflowExecutor, WorkflowPlanner};

/// Marker the overseer emits when a task should decompose
const MULTI_STEP_MARKER: &str = "MULTI-STEP";

/// Summary of a decomposed run
#[derive(Debug, Clone)]
pub struct WorkflowSummary {
    pub workflow_id: String,
    pub steps_total: usize,
    pub steps_failed: usize,
    pub outputs: HashMap<String, Value>,
}

/// What one `handle` call produced
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub success: bool,
    pub node_id: Option<String>,
    pub code: String,
    pub score: f64,
    /// Full escalation trajectory; empty when the first candidate passed
    pub attempts: Vec<EscalationAttempt>,
    pub tool_used: String,
    pub used_fallback_tool: bool,
    pub plan_artifact_id: String,
    /// FUNCTION on success, FAILURE on exhaustion
    pub artifact_id: Option<String>,
    pub parse_fallback: bool,
    pub workflow: Option<WorkflowSummary>,
    pub suggestion: Option<String>,
}

/// The orchestrating pipeline
pub struct GenerationPipeline {
    router: Arc<Router>,
    memory: Arc<Memory>,
    registry: Arc<ToolRegistry>,
    runner: Arc<SandboxRunner>,
    evaluator: Arc<Evaluator>,
    triage: Triage,
    escalator: Escalator,
    planner: WorkflowPlanner,
    executor: WorkflowExecutor,
    prompts: PromptLoader,
    cancel: CancelToken,
}

impl GenerationPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router: Arc<Router>,
        memory: Arc<Memory>,
        registry: Arc<ToolRegistry>,
        runner: Arc<SandboxRunner>,
        evaluator: Arc<Evaluator>,
        escalator: Escalator,
        planner: WorkflowPlanner,
        executor: WorkflowExecutor,
        cancel: CancelToken,
    ) -> Self {
        Self {
            triage: Triage::new(router.clone()),
            router,
            memory,
            registry,
            runner,
            evaluator,
            escalator,
            planner,
            executor,
            prompts: PromptLoader::embedded_only(),
            cancel,
        }
    }

    /// Handle a task with the default representative input (`{}`)
    pub async fn handle(&self, task_text: &str) -> Result<PipelineResult> {
        self.handle_with_input(task_text, None).await
    }

    /// Handle a task, verifying candidates against the given stdin payload
    pub async fn handle_with_input(
        &self,
        task_text: &str,
        representative_input: Option<&str>,
    ) -> Result<PipelineResult> {
        let input = representative_input.unwrap_or("{}");
        info!(task = %digest(task_text), "Handling task");

        // 1. Pick the tool; remember when only the fallback answered
        let tool = self.registry.select(task_text).await?;
        let used_fallback_tool = tool.kind == ToolKind::GenericFallback;

        // 2. Overseer strategy, persisted as a PLAN
        let strategy = self.overseer_strategy(task_text, &tool).await?;
        let plan = Artifact::new(
            ArtifactKind::Plan,
            digest(task_text),
            format!("strategy via tool '{}'", tool.name),
            strategy.clone(),
        )
        .with_meta("tool_id", json!(tool.tool_id))
        .with_meta("task", json!(task_text));
        let plan = self.memory.save(plan).await?;

        if self.cancel.is_cancelled() {
            bail!("cancelled after planning");
        }

        // 3. Multi-step strategies go through the workflow engine
        if strategy.contains(MULTI_STEP_MARKER) {
            match self
                .run_as_workflow(task_text, &strategy, &tool, input, &plan.artifact_id)
                .await
            {
                Ok(result) => return Ok(result),
                Err(e) => {
                    warn!(error = %e, "Workflow path failed; falling back to single-step generation");
                }
            }
        }

        // 4-8. Single-step generation
        self.generate_and_verify(task_text, &strategy, &tool, input, &plan.artifact_id)
            .await
    }

    /// Ask the overseer for a strategy
    async fn overseer_strategy(&self, task_text: &str, tool: &Tool) -> Result<String> {
        let system = self.prompts.raw("overseer-system")?;
        let prompt = self.prompts.render(
            "overseer-task",
            &json!({
                "task": task_text,
                "tool_name": tool.name,
                "tool_description": tool.description,
            }),
        )?;

        let options = GenerateOptions::default().with_system_prompt(system);
        self.router
            .generate("overseer", &prompt, &options)
            .await
            .context("Overseer strategy failed")
    }

    /// Decompose, materialise code steps, execute
    async fn run_as_workflow(
        &self,
        task_text: &str,
        strategy: &str,
        tool: &Tool,
        input: &str,
        plan_artifact_id: &str,
    ) -> Result<PipelineResult> {
        let mut spec = self.planner.plan(task_text).await?;

        // Leaf steps that need code recurse through generation first
        for step in &mut spec.steps {
            if step.kind == StepKind::CodeTool && !self.runner.nodes().exists(&step.tool_ref) {
                debug!(step_id = %step.step_id, "Generating code for workflow step");
                let sub_task = format!("{} (workflow step: {})", task_text, step.step_id);
                let sub = Box::pin(self.generate_and_verify(&sub_task, strategy, tool, input, plan_artifact_id)).await?;
                let Some(node_id) = sub.node_id else {
                    bail!("code generation for step '{}' produced no node", step.step_id);
                };
                if !sub.success {
                    bail!("code generation for step '{}' failed", step.step_id);
                }
                step.tool_ref = node_id;
            }
        }

        // The validated plan is itself an artifact worth keeping
        let workflow_artifact = Artifact::new(
            ArtifactKind::Workflow,
            spec.workflow_id.clone(),
            format!("decomposition of: {}", digest(task_text)),
            serde_json::to_string_pretty(&spec)?,
        )
        .with_meta("plan", json!(plan_artifact_id));
        self.memory.save(workflow_artifact).await?;

        let mut inputs = HashMap::new();
        inputs.insert("task".to_string(), Value::String(task_text.to_string()));
        let run = self.executor.execute(&spec, inputs).await?;

        let steps_failed = run.steps.iter().filter(|s| !s.success).count();
        let summary = WorkflowSummary {
            workflow_id: spec.workflow_id.clone(),
            steps_total: run.steps.len(),
            steps_failed,
            outputs: run.outputs.clone(),
        };

        self.registry
            .record_outcome(&tool.tool_id, run.success, None)
            .await?;

        if run.success {
            let outputs_artifact = Artifact::new(
                ArtifactKind::Conversation,
                format!("workflow outputs: {}", spec.workflow_id),
                format!("outputs of: {}", digest(task_text)),
                serde_json::to_string_pretty(&run.outputs)?,
            )
            .with_meta("workflow", json!(spec.workflow_id));
            self.memory.save(outputs_artifact).await?;
        }

        Ok(PipelineResult {
            success: run.success,
            node_id: None,
            code: String::new(),
            score: if run.success { 1.0 } else { 0.0 },
            attempts: Vec::new(),
            tool_used: tool.name.clone(),
            used_fallback_tool: tool.kind == ToolKind::GenericFallback,
            plan_artifact_id: plan_artifact_id.to_string(),
            artifact_id: None,
            parse_fallback: false,
            workflow: Some(summary),
            suggestion: run
                .failed_step
                .map(|step| format!("workflow step '{}' failed; inspect its output", step)),
        })
    }

    /// Steps 4-8: generate, run, evaluate, escalate on failure
    async fn generate_and_verify(
        &self,
        task_text: &str,
        strategy: &str,
        tool: &Tool,
        input: &str,
        plan_artifact_id: &str,
    ) -> Result<PipelineResult> {
        // The specialist's own role generates when an LLM specialist was
        // selected; the generator role otherwise
        let generation_role = match (&tool.kind, &tool.invocation) {
            (ToolKind::LlmSpecialist, Invocation::Role { role, .. }) => role.clone(),
            _ => "generator".to_string(),
        };

        let system = self.prompts.raw("generator-system")?;
        let prompt = self
            .prompts
            .render("generator-task", &json!({ "task": task_text, "strategy": strategy }))?;
        let options = GenerateOptions::default().with_system_prompt(system);
        let response = self
            .router
            .generate(&generation_role, &prompt, &options)
            .await
            .context("Generation failed")?;

        let envelope = parse_generation(&response);
        if envelope.parse_fallback {
            debug!("Generator response was not an envelope; demoted to raw code");
        }

        let name = if envelope.description.is_empty() {
            digest(task_text)
        } else {
            envelope.description.clone()
        };
        let meta = self
            .runner
            .nodes()
            .save(&envelope.code, None, &name, &envelope.description, None)
            .context("Failed to save node")?;

        // 6. Run; a runner-level error gets one retry before escalation
        let metrics = match self.runner.run_node(&meta.node_id, input, None).await {
            Ok(metrics) => metrics,
            Err(first) => {
                warn!(error = %first, "Runner error; retrying once");
                match self.runner.run_node(&meta.node_id, input, None).await {
                    Ok(metrics) => metrics,
                    Err(second) => ExecutionMetrics {
                        exit_code: -1,
                        success: false,
                        stderr: format!("runner error: {}", second),
                        ..Default::default()
                    },
                }
            }
        };

        let triage = self.triage.classify(&metrics).await;
        let evaluation = if triage.verdict == TriageVerdict::Pass {
            Some(
                self.evaluator
                    .evaluate(
                        EvalKind::Final,
                        ArtifactClass::Code,
                        task_text,
                        &envelope.code,
                        Some(&metrics),
                        None,
                    )
                    .await?,
            )
        } else {
            None
        };

        if let Some(evaluation) = evaluation.filter(|e| e.pass) {
            let artifact = Artifact::new(ArtifactKind::Function, &name, &envelope.description, &envelope.code)
                .with_tags(envelope.tags.iter().cloned())
                .with_meta("node_id", json!(meta.node_id))
                .with_meta("strategy", json!(strategy))
                .with_meta("tool_id", json!(tool.tool_id))
                .with_meta("parse_fallback", json!(envelope.parse_fallback));
            let artifact = self.memory.save(artifact).await?;

            let perf = Artifact::new(
                ArtifactKind::PerfRecord,
                format!("run of {}", meta.node_id),
                format!("{} ms, {:.1} MB peak", metrics.latency_ms, metrics.memory_mb_peak),
                serde_json::to_string(&metrics)?,
            )
            .with_meta("function", json!(artifact.artifact_id))
            .with_meta("node_id", json!(meta.node_id));
            self.memory.save(perf).await?;

            self.registry
                .record_outcome(&tool.tool_id, true, Some(evaluation.score))
                .await?;

            info!(node_id = %meta.node_id, score = evaluation.score, "Task complete on first candidate");
            return Ok(PipelineResult {
                success: true,
                node_id: Some(meta.node_id),
                code: envelope.code,
                score: evaluation.score,
                attempts: Vec::new(),
                tool_used: tool.name.clone(),
                used_fallback_tool: tool.kind == ToolKind::GenericFallback,
                plan_artifact_id: plan_artifact_id.to_string(),
                artifact_id: Some(artifact.artifact_id),
                parse_fallback: envelope.parse_fallback,
                workflow: None,
                suggestion: None,
            });
        }

        // 7. Hand the failure to the escalator
        debug!(node_id = %meta.node_id, reason = %triage.reason, "First candidate failed; escalating");
        let ctx = EscalationContext {
            task: task_text.to_string(),
            strategy: strategy.to_string(),
            node_id: meta.node_id.clone(),
            representative_input: input.to_string(),
            tags: envelope.tags.clone(),
        };
        let report = self.escalator.escalate(&ctx, &envelope.code, &metrics).await?;

        self.registry
            .record_outcome(&tool.tool_id, report.success, Some(report.final_score))
            .await?;

        Ok(PipelineResult {
            success: report.success,
            node_id: Some(meta.node_id),
            code: report.final_code,
            score: report.final_score,
            attempts: report.attempts,
            tool_used: tool.name.clone(),
            used_fallback_tool: tool.kind == ToolKind::GenericFallback,
            plan_artifact_id: plan_artifact_id.to_string(),
            artifact_id: report.artifact_id,
            parse_fallback: envelope.parse_fallback,
            workflow: None,
            suggestion: report.suggestion,
        })
    }
}

/// First 60 chars of a task for names and logs
fn digest(text: &str) -> String {
    let flat: String = text.chars().take(60).map(|c| if c == '\n' { ' ' } else { c }).collect();
    if text.chars().count() > 60 { format!("{}...", flat) } else { flat }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use artifactstore::{ArtifactStore, EmbedError, Embedder, LocalStore};
    use async_trait::async_trait;
    use tempfile::tempdir;

    use crate::config::{BackendConfig, BackendProtocol, LlmPolicyConfig, RegistryConfig, RunnerConfig};
    use crate::eval::{AdaptiveThresholds, Thresholds};
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

    struct Harness {
        pipeline: GenerationPipeline,
        registry: Arc<ToolRegistry>,
        memory: Arc<Memory>,
        mock: Arc<MockBackend>,
    }

    async fn harness(dir: &std::path::Path, responses: Vec<String>) -> Harness {
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
        let registry = Arc::new(ToolRegistry::new(
            memory.clone(),
            router.clone(),
            runner.clone(),
            RegistryConfig::default(),
        ));
        registry.bootstrap().await.unwrap();

        let thresholds = Arc::new(AdaptiveThresholds::new(Thresholds::default(), 0.3, 0.1, 0.9, 100));
        let evaluator = Arc::new(Evaluator::new(router.clone(), memory.clone(), thresholds));
        let escalator = Escalator::new(
            router.clone(),
            runner.clone(),
            evaluator.clone(),
            memory.clone(),
            true,
            CancelToken::new(),
        );
        let planner = WorkflowPlanner::new(router.clone(), 1);
        let executor = WorkflowExecutor::new(
            router.clone(),
            registry.clone(),
            runner.clone(),
            memory.clone(),
            4,
            CancelToken::new(),
        );

        let pipeline = GenerationPipeline::new(
            router,
            memory.clone(),
            registry.clone(),
            runner,
            evaluator,
            escalator,
            planner,
            executor,
            CancelToken::new(),
        );
        Harness {
            pipeline,
            registry,
            memory,
            mock,
        }
    }

    const STRATEGY: &str = "SINGLE-STEP\nRead the two integers from stdin and print their sum as JSON.";
    const GOOD_VERDICT: &str =
        r#"{"score": 0.9, "pass": true, "strengths": ["works"], "weaknesses": [], "suggestions": []}"#;

    fn adder_envelope() -> String {
        serde_json::json!({
            "code": "cat > /dev/null\necho '{\"result\":8}'",
            "description": "adds two integers",
            "tags": ["math", "addition"]
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_trivial_task_end_to_end() {
        let dir = tempdir().unwrap();
        let h = harness(
            dir.path(),
            vec![STRATEGY.to_string(), adder_envelope(), GOOD_VERDICT.to_string()],
        )
        .await;

        let result = h
            .pipeline
            .handle_with_input(
                "write a function that adds two integers from stdin and prints the sum as JSON",
                Some(r#"{"a":5,"b":3}"#),
            )
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.score >= 0.7);
        assert!(result.attempts.is_empty());
        assert!(result.used_fallback_tool, "only the fallback is registered");
        assert!(!result.parse_fallback);

        // One PLAN and one FUNCTION artifact, tagged by the envelope
        let plans = h.memory.list(Some(ArtifactKind::Plan), &[], 10).await.unwrap();
        assert_eq!(plans.len(), 1);
        let functions = h.memory.list(Some(ArtifactKind::Function), &[], 10).await.unwrap();
        assert_eq!(functions.len(), 1);
        assert!(functions[0].tags.contains("math"));
        assert_eq!(functions[0].metadata["parse_fallback"], false);

        // The stored code is exactly what ran: no fences, no wrapper
        assert!(!functions[0].content.contains("```"));
        assert_eq!(functions[0].content, "cat > /dev/null\necho '{\"result\":8}'");

        // Tool usage was recorded
        let fallback = h.registry.get("tool-generic-fallback").await.unwrap();
        assert_eq!(fallback.usage_count, 1);
    }

    #[tokio::test]
    async fn test_parse_fallback_path_still_succeeds() {
        let dir = tempdir().unwrap();
        // The generator ignores the envelope and answers with bare code
        let raw_code = "cat > /dev/null\necho '{\"result\":4}'";
        let h = harness(
            dir.path(),
            vec![STRATEGY.to_string(), raw_code.to_string(), GOOD_VERDICT.to_string()],
        )
        .await;

        let result = h
            .pipeline
            .handle_with_input("add two integers", Some(r#"{"a":2,"b":2}"#))
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.parse_fallback);

        let functions = h.memory.list(Some(ArtifactKind::Function), &[], 10).await.unwrap();
        assert_eq!(functions[0].metadata["parse_fallback"], true);
        assert_eq!(functions[0].content, raw_code);
    }

    #[tokio::test]
    async fn test_failure_hands_off_to_escalation() {
        let dir = tempdir().unwrap();
        let broken = serde_json::json!({
            "code": "exit 1",
            "description": "broken candidate",
            "tags": ["math"]
        })
        .to_string();
        let repaired = serde_json::json!({
            "code": "cat > /dev/null\necho '{\"result\":4}'",
            "fixes_applied": ["emit the result object"],
            "analysis": "the program exited without printing"
        })
        .to_string();

        let h = harness(
            dir.path(),
            vec![
                STRATEGY.to_string(),
                broken,
                repaired,
                GOOD_VERDICT.to_string(),
            ],
        )
        .await;

        let result = h
            .pipeline
            .handle_with_input("add two integers", Some(r#"{"a":2,"b":2}"#))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.attempts.len(), 1, "one escalation attempt repaired it");
        assert!(result.code.contains("result"));

        // The repair left FUNCTION and PATTERN artifacts behind
        let functions = h.memory.list(Some(ArtifactKind::Function), &[], 10).await.unwrap();
        assert_eq!(functions.len(), 1);
        let patterns = h.memory.list(Some(ArtifactKind::Pattern), &[], 10).await.unwrap();
        assert_eq!(patterns.len(), 1);
    }

    #[tokio::test]
    async fn test_specialist_selection_recorded() {
        let dir = tempdir().unwrap();
        let h = harness(
            dir.path(),
            vec![STRATEGY.to_string(), adder_envelope(), GOOD_VERDICT.to_string()],
        )
        .await;

        h.registry
            .register(Tool::specialist(
                "arithmetic",
                "adds integers sums numbers arithmetic",
                "general",
            ))
            .await
            .unwrap();

        let result = h
            .pipeline
            .handle_with_input("adds integers sums numbers", Some("{}"))
            .await
            .unwrap();

        assert!(!result.used_fallback_tool);
        assert_eq!(result.tool_used, "arithmetic");
    }

    #[tokio::test]
    async fn test_second_call_bumps_tool_usage_by_one() {
        let dir = tempdir().unwrap();
        let h = harness(
            dir.path(),
            vec![
                STRATEGY.to_string(),
                adder_envelope(),
                GOOD_VERDICT.to_string(),
                STRATEGY.to_string(),
                adder_envelope(),
                GOOD_VERDICT.to_string(),
            ],
        )
        .await;

        h.pipeline.handle_with_input("add two integers", Some("{}")).await.unwrap();
        let after_first = h.registry.get("tool-generic-fallback").await.unwrap().usage_count;

        h.pipeline.handle_with_input("add two integers", Some("{}")).await.unwrap();
        let after_second = h.registry.get("tool-generic-fallback").await.unwrap().usage_count;

        assert_eq!(after_second, after_first + 1);
    }

    #[tokio::test]
    async fn test_multi_step_strategy_runs_workflow() {
        let dir = tempdir().unwrap();
        let plan = serde_json::json!({
            "workflow_id": "joke-and-translations",
            "inputs": ["task"],
            "outputs": ["french", "spanish"],
            "steps": [
                {"step_id": "write", "kind": "LLM_CALL", "tool_ref": "general",
                 "input_mapping": {"prompt": "task"}, "output_name": "joke", "depends_on": []},
                {"step_id": "to-french", "kind": "LLM_CALL", "tool_ref": "general",
                 "input_mapping": {"text": "joke"}, "output_name": "french",
                 "parallel_group": "translate", "depends_on": ["write"]},
                {"step_id": "to-spanish", "kind": "LLM_CALL", "tool_ref": "general",
                 "input_mapping": {"text": "joke"}, "output_name": "spanish",
                 "parallel_group": "translate", "depends_on": ["write"]}
            ]
        })
        .to_string();

        let h = harness(
            dir.path(),
            vec![
                "MULTI-STEP\n1. write a joke\n2. translate to French\n3. translate to Spanish".to_string(),
                plan,
                "the joke".to_string(),
                "la blague".to_string(),
                "el chiste".to_string(),
            ],
        )
        .await;

        let result = h
            .pipeline
            .handle("write a joke and translate it to French and to Spanish")
            .await
            .unwrap();

        assert!(result.success);
        let summary = result.workflow.expect("workflow path taken");
        assert_eq!(summary.steps_total, 3);
        assert_eq!(summary.steps_failed, 0);
        assert!(summary.outputs.contains_key("french"));
        assert!(summary.outputs.contains_key("spanish"));

        // The decomposition itself was persisted
        let workflows = h.memory.list(Some(ArtifactKind::Workflow), &[], 10).await.unwrap();
        assert_eq!(workflows.len(), 1);
    }
}
