//! LLM-driven workflow planning
//!
//! Asks the overseer role for a structured decomposition, validates it, and
//! retries once with a stricter prompt quoting the validation failure before
//! giving up.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use super::spec::{WorkflowError, WorkflowSpec};
use crate::llm::{GenerateOptions, Router};
use crate::pipeline::contract::parse_json_object;
use crate::prompts::PromptLoader;

pub struct WorkflowPlanner {
    router: Arc<Router>,
    prompts: PromptLoader,
    max_retries: u32,
}

impl WorkflowPlanner {
    pub fn new(router: Arc<Router>, max_retries: u32) -> Self {
        Self {
            router,
            prompts: PromptLoader::embedded_only(),
            max_retries,
        }
    }

    /// Decompose a task into a validated workflow
    pub async fn plan(&self, task_text: &str) -> Result<WorkflowSpec, WorkflowError> {
        let mut last_error = String::new();

        for attempt in 0..=self.max_retries {
            let strict = attempt > 0;
            if strict {
                warn!(attempt, error = %last_error, "Replanning with a stricter prompt");
            }

            match self.plan_once(task_text, strict, &last_error).await {
                Ok(spec) => {
                    info!(
                        workflow_id = %spec.workflow_id,
                        steps = spec.steps.len(),
                        "Workflow planned"
                    );
                    return Ok(spec);
                }
                Err(WorkflowError::Unavailable(detail)) => {
                    // No point re-prompting a dead router
                    return Err(WorkflowError::Unavailable(detail));
                }
                Err(e) => last_error = e.to_string(),
            }
        }

        Err(WorkflowError::PlanInvalid(last_error))
    }

    async fn plan_once(&self, task_text: &str, strict: bool, last_error: &str) -> Result<WorkflowSpec, WorkflowError> {
        let system = self
            .prompts
            .raw("planner-system")
            .map_err(|e| WorkflowError::PlanInvalid(e.to_string()))?;
        let prompt = self
            .prompts
            .render(
                "planner-task",
                &json!({
                    "task": task_text,
                    "strict": strict,
                    "validation_error": last_error,
                }),
            )
            .map_err(|e| WorkflowError::PlanInvalid(e.to_string()))?;

        let options = GenerateOptions::default().with_system_prompt(system);
        let response = self
            .router
            .generate("overseer", &prompt, &options)
            .await
            .map_err(|e| WorkflowError::Unavailable(e.to_string()))?;

        let value = parse_json_object(&response)
            .map_err(|e| WorkflowError::PlanInvalid(format!("response was not a JSON object: {}", e)))?;
        let spec: WorkflowSpec = serde_json::from_value(value)
            .map_err(|e| WorkflowError::PlanInvalid(format!("response does not match the workflow schema: {}", e)))?;

        spec.validate()?;
        debug!(workflow_id = %spec.workflow_id, "Planner output validated");
        Ok(spec)
    }
}
