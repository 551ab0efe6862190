//! Workflow execution
//!
//! Executes a validated spec level by level: every step in a level runs
//! concurrently under a bounded pool, a step only dispatches once all its
//! dependencies succeeded, and each output is committed to the shared map
//! before any dependent starts. A failed required step cancels levels that
//! have not started; steps already in flight finish and their outputs are
//! kept for postmortem.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use artifactstore::ArtifactKind;

use super::spec::{Step, StepKind, WorkflowError, WorkflowSpec};
use crate::cancel::CancelToken;
use crate::llm::{GenerateOptions, Router};
use crate::memory::Memory;
use crate::registry::{ToolOutcome, ToolRegistry};
use crate::runner::SandboxRunner;

/// Sub-workflows may nest this deep before execution refuses
const MAX_DEPTH: usize = 3;

/// What happened to one step
#[derive(Debug, Clone)]
pub struct StepResult {
    pub step_id: String,
    pub output_name: String,
    pub attempts: u32,
    pub success: bool,
    /// Never dispatched (failed dependency or cancelled level)
    pub skipped: bool,
    pub value: Option<Value>,
    pub error: Option<String>,
}

/// The outcome of one workflow execution
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    /// Workflow inputs plus every committed step output
    pub outputs: HashMap<String, Value>,
    pub steps: Vec<StepResult>,
    pub success: bool,
    pub failed_step: Option<String>,
}

/// Level-by-level workflow engine
pub struct WorkflowExecutor {
    router: Arc<Router>,
    registry: Arc<ToolRegistry>,
    runner: Arc<SandboxRunner>,
    memory: Arc<Memory>,
    pool_size: usize,
    cancel: CancelToken,
}

impl WorkflowExecutor {
    pub fn new(
        router: Arc<Router>,
        registry: Arc<ToolRegistry>,
        runner: Arc<SandboxRunner>,
        memory: Arc<Memory>,
        pool_size: usize,
        cancel: CancelToken,
    ) -> Self {
        Self {
            router,
            registry,
            runner,
            memory,
            pool_size: pool_size.max(1),
            cancel,
        }
    }

    /// Execute a spec with the given workflow inputs
    pub async fn execute(
        &self,
        spec: &WorkflowSpec,
        inputs: HashMap<String, Value>,
    ) -> Result<WorkflowRun, WorkflowError> {
        self.execute_at_depth(spec, inputs, 0).await
    }

    async fn execute_at_depth(
        &self,
        spec: &WorkflowSpec,
        inputs: HashMap<String, Value>,
        depth: usize,
    ) -> Result<WorkflowRun, WorkflowError> {
        if depth > MAX_DEPTH {
            return Err(WorkflowError::Invalid(format!(
                "sub-workflows nest deeper than {}",
                MAX_DEPTH
            )));
        }

        let levels = spec.topological_levels()?;
        info!(
            workflow_id = %spec.workflow_id,
            steps = spec.steps.len(),
            levels = levels.len(),
            "Executing workflow"
        );

        let semaphore = Arc::new(Semaphore::new(self.pool_size));
        let mut outputs = inputs;
        let mut results: Vec<StepResult> = Vec::with_capacity(spec.steps.len());
        let mut failed_step: Option<String> = None;

        for level in levels {
            if self.cancel.is_cancelled() {
                return Err(WorkflowError::Cancelled);
            }

            if failed_step.is_some() {
                for idx in level {
                    let step = &spec.steps[idx];
                    results.push(StepResult {
                        step_id: step.step_id.clone(),
                        output_name: step.output_name.clone(),
                        attempts: 0,
                        success: false,
                        skipped: true,
                        value: None,
                        error: Some("cancelled after required step failure".to_string()),
                    });
                }
                continue;
            }

            let mut pending = Vec::new();
            let mut immediate = Vec::new();
            for idx in level {
                let step = &spec.steps[idx];

                let dead_dep = step
                    .depends_on
                    .iter()
                    .find(|d| results.iter().any(|r| r.step_id == **d && !r.success));
                if let Some(dep) = dead_dep {
                    immediate.push(StepResult {
                        step_id: step.step_id.clone(),
                        output_name: step.output_name.clone(),
                        attempts: 0,
                        success: false,
                        skipped: true,
                        value: None,
                        error: Some(format!("dependency '{}' did not succeed", dep)),
                    });
                    continue;
                }

                // Inputs resolve against the snapshot: dependencies live in
                // earlier levels, so nothing in this level can change them.
                match resolve_mapping(step, &outputs) {
                    Ok(payload) => pending.push(self.run_step(step, payload, semaphore.clone(), depth)),
                    Err(message) => immediate.push(StepResult {
                        step_id: step.step_id.clone(),
                        output_name: step.output_name.clone(),
                        attempts: 0,
                        success: false,
                        skipped: true,
                        value: None,
                        error: Some(message),
                    }),
                }
            }

            let mut level_results = futures::future::join_all(pending).await;
            level_results.extend(immediate);

            for result in level_results {
                if result.success {
                    if let Some(value) = &result.value {
                        outputs.insert(result.output_name.clone(), value.clone());
                    }
                } else {
                    let optional = spec
                        .steps
                        .iter()
                        .find(|s| s.step_id == result.step_id)
                        .map(|s| s.retry_policy.optional)
                        .unwrap_or(false);
                    if !optional && failed_step.is_none() {
                        failed_step = Some(result.step_id.clone());
                    }
                }
                results.push(result);
            }
        }

        let success = failed_step.is_none();
        if !success {
            warn!(workflow_id = %spec.workflow_id, failed_step = ?failed_step, "Workflow failed");
        }
        Ok(WorkflowRun {
            outputs,
            steps: results,
            success,
            failed_step,
        })
    }

    /// Run one step with its retry budget under the pool bound
    async fn run_step(
        &self,
        step: &Step,
        payload: serde_json::Map<String, Value>,
        semaphore: Arc<Semaphore>,
        depth: usize,
    ) -> StepResult {
        let _permit = semaphore.acquire().await;
        let mut attempts = 0;
        let mut last_error = String::new();

        while attempts <= step.retry_policy.max_retries {
            attempts += 1;
            match self.dispatch(step, &payload, depth).await {
                Ok(value) => {
                    debug!(step_id = %step.step_id, attempts, "Step complete");
                    return StepResult {
                        step_id: step.step_id.clone(),
                        output_name: step.output_name.clone(),
                        attempts,
                        success: true,
                        skipped: false,
                        value: Some(value),
                        error: None,
                    };
                }
                Err(message) => {
                    warn!(step_id = %step.step_id, attempts, error = %message, "Step attempt failed");
                    last_error = message;
                }
            }
        }

        StepResult {
            step_id: step.step_id.clone(),
            output_name: step.output_name.clone(),
            attempts,
            success: false,
            skipped: false,
            value: None,
            error: Some(last_error),
        }
    }

    async fn dispatch(
        &self,
        step: &Step,
        payload: &serde_json::Map<String, Value>,
        depth: usize,
    ) -> Result<Value, String> {
        match step.kind {
            StepKind::LlmCall => {
                let prompt = payload_text(payload);
                let text = self
                    .router
                    .generate(&step.tool_ref, &prompt, &GenerateOptions::default())
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(Value::String(text))
            }
            StepKind::CodeTool => {
                let input = Value::Object(payload.clone()).to_string();
                let metrics = self
                    .runner
                    .run_node(&step.tool_ref, &input, step.timeout_ms)
                    .await
                    .map_err(|e| e.to_string())?;
                if !metrics.success {
                    return Err(metrics.error_digest(300));
                }
                Ok(parse_step_value(&metrics.stdout))
            }
            StepKind::ExistingTool => {
                let input = payload_text(payload);
                let outcome = self
                    .registry
                    .invoke(&step.tool_ref, &input)
                    .await
                    .map_err(|e| e.to_string())?;
                match outcome {
                    ToolOutcome::Text(text) => Ok(Value::String(text)),
                    ToolOutcome::Execution(metrics) => {
                        if !metrics.success {
                            return Err(metrics.error_digest(300));
                        }
                        Ok(parse_step_value(&metrics.stdout))
                    }
                    ToolOutcome::Workflow { workflow_id } => {
                        self.run_sub_workflow(&workflow_id, payload, depth).await
                    }
                }
            }
            StepKind::SubWorkflow => self.run_sub_workflow(&step.tool_ref, payload, depth).await,
        }
    }

    /// Load a stored WORKFLOW artifact and execute it one level deeper
    async fn run_sub_workflow(
        &self,
        workflow_ref: &str,
        payload: &serde_json::Map<String, Value>,
        depth: usize,
    ) -> Result<Value, String> {
        let artifact = self
            .memory
            .get(workflow_ref)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("workflow artifact '{}' not found", workflow_ref))?;
        if artifact.kind != ArtifactKind::Workflow && artifact.kind != ArtifactKind::SubWorkflow {
            return Err(format!("artifact '{}' is not a workflow", workflow_ref));
        }

        let spec: WorkflowSpec =
            serde_json::from_str(&artifact.content).map_err(|e| format!("stored workflow is invalid: {}", e))?;

        let inputs: HashMap<String, Value> = payload.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let run = Box::pin(self.execute_at_depth(&spec, inputs, depth + 1))
            .await
            .map_err(|e| e.to_string())?;
        if !run.success {
            return Err(format!(
                "sub-workflow '{}' failed at step {:?}",
                spec.workflow_id, run.failed_step
            ));
        }

        // Surface the declared outputs, or everything the steps produced
        let mut object = serde_json::Map::new();
        if spec.outputs.is_empty() {
            for result in &run.steps {
                if let Some(value) = &result.value {
                    object.insert(result.output_name.clone(), value.clone());
                }
            }
        } else {
            for name in &spec.outputs {
                if let Some(value) = run.outputs.get(name) {
                    object.insert(name.clone(), value.clone());
                }
            }
        }
        Ok(Value::Object(object))
    }
}

/// Resolve a step's input mapping against the committed outputs
fn resolve_mapping(
    step: &Step,
    outputs: &HashMap<String, Value>,
) -> Result<serde_json::Map<String, Value>, String> {
    let mut payload = serde_json::Map::new();
    for (param, source) in &step.input_mapping {
        let value = outputs
            .get(source)
            .cloned()
            .ok_or_else(|| format!("input '{}' is not available", source))?;
        payload.insert(param.clone(), value);
    }
    Ok(payload)
}

/// A single string parameter is passed through verbatim; anything else is
/// the JSON object itself
fn payload_text(payload: &serde_json::Map<String, Value>) -> String {
    if payload.len() == 1
        && let Some(Value::String(text)) = payload.values().next()
    {
        return text.clone();
    }
    Value::Object(payload.clone()).to_string()
}

/// Node stdout is JSON by contract; tolerate plain text from LLM tools
fn parse_step_value(stdout: &str) -> Value {
    serde_json::from_str(stdout.trim()).unwrap_or_else(|_| Value::String(stdout.trim().to_string()))
}
