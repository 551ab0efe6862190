//! Triage - cheap pass/fail classification of a run
//!
//! Deterministic rules first: exit codes, timeouts, exception traces, and
//! the stdout-must-be-one-JSON-object protocol. The triage LLM role is only
//! consulted when the rules cannot decide.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use crate::llm::{GenerateOptions, Router};
use crate::prompts::PromptLoader;
use crate::runner::ExecutionMetrics;

/// Outcome of triage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriageVerdict {
    Pass,
    Fail,
    Uncertain,
}

/// A triage classification with its reason
#[derive(Debug, Clone)]
pub struct TriageReport {
    pub verdict: TriageVerdict,
    pub reason: String,
    /// Set when the LLM tier was needed but unavailable
    pub low_confidence: bool,
}

/// Patterns in stderr that mark a crashed run even with a clean exit
const TRACE_PATTERNS: [&str; 4] = [
    "Traceback (most recent call last)",
    "Exception:",
    "Error:",
    "panicked at",
];

/// Deterministic classification from metrics alone
pub fn triage_rules(metrics: &ExecutionMetrics) -> (TriageVerdict, String) {
    if metrics.timed_out {
        return (TriageVerdict::Fail, "run timed out".to_string());
    }
    if metrics.exit_code != 0 {
        return (TriageVerdict::Fail, format!("exit code {}", metrics.exit_code));
    }

    let stdout = metrics.stdout.trim();
    let stdout_is_object = serde_json::from_str::<serde_json::Value>(stdout)
        .map(|v| v.is_object())
        .unwrap_or(false);
    if !stdout_is_object {
        // Contract violation: a node must print exactly one JSON object
        return (
            TriageVerdict::Fail,
            format!("stdout is not a single JSON object: {:.80}", stdout),
        );
    }

    let stderr_has_trace = TRACE_PATTERNS.iter().any(|p| metrics.stderr.contains(p));
    if stderr_has_trace {
        return (
            TriageVerdict::Uncertain,
            "clean exit and JSON output, but stderr carries an exception trace".to_string(),
        );
    }

    (TriageVerdict::Pass, "clean exit with JSON output".to_string())
}

/// Two-tier triage: rules, then the triage LLM role
pub struct Triage {
    router: Arc<Router>,
    prompts: PromptLoader,
}

impl Triage {
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            router,
            prompts: PromptLoader::embedded_only(),
        }
    }

    pub async fn classify(&self, metrics: &ExecutionMetrics) -> TriageReport {
        let (verdict, reason) = triage_rules(metrics);
        if verdict != TriageVerdict::Uncertain {
            return TriageReport {
                verdict,
                reason,
                low_confidence: false,
            };
        }

        debug!(reason = %reason, "Rules inconclusive, consulting triage role");
        let prompt = match self.prompts.render(
            "triage-task",
            &json!({
                "exit_code": metrics.exit_code,
                "stdout": truncate(&metrics.stdout, 1000),
                "stderr": truncate(&metrics.stderr, 1000),
            }),
        ) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Failed to build triage prompt");
                return self.rules_only(reason);
            }
        };

        match self.router.generate("triage", &prompt, &GenerateOptions::default()).await {
            Ok(answer) => {
                let upper = answer.to_uppercase();
                let verdict = if upper.contains("PASS") && !upper.contains("FAIL") {
                    TriageVerdict::Pass
                } else {
                    TriageVerdict::Fail
                };
                TriageReport {
                    verdict,
                    reason: format!("{}; triage model said {:?}", reason, verdict),
                    low_confidence: false,
                }
            }
            Err(e) => {
                warn!(error = %e, "Triage role unavailable");
                self.rules_only(reason)
            }
        }
    }

    /// With the LLM down, a clean exit with JSON output leans Pass
    fn rules_only(&self, reason: String) -> TriageReport {
        TriageReport {
            verdict: TriageVerdict::Pass,
            reason: format!("{}; triage model unavailable, keeping the clean exit", reason),
            low_confidence: true,
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}
