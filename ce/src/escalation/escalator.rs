//! The six-stage adaptive repair loop
//!
//! Takes over when a fresh candidate fails: up to six attempts across the
//! stage schedule, each prompt carrying the full attempt history, with
//! deterministic trace injection from attempt three and a cleanup pass that
//! strips the traces once the code finally passes. Terminates in at most
//! seven attempts regardless of model behaviour.

use std::sync::Arc;

use eyre::{Context, Result, bail};
use serde_json::json;
use tracing::{debug, info, warn};

use artifactstore::{Artifact, ArtifactKind};

use super::logging::{has_injected, inject_trace, strip_trace};
use super::stage::{AttemptOutcome, AttemptPlan, EscalationAttempt, schedule};
use crate::cancel::CancelToken;
use crate::eval::{ArtifactClass, EvalKind, Evaluator, TriageVerdict, triage_rules};
use crate::llm::{GenerateOptions, Router};
use crate::memory::Memory;
use crate::pipeline::contract::parse_repair;
use crate::prompts::PromptLoader;
use crate::runner::{ExecutionMetrics, SandboxRunner};

/// Everything an escalation needs to know about the failing candidate
#[derive(Debug, Clone)]
pub struct EscalationContext {
    pub task: String,
    pub strategy: String,
    pub node_id: String,
    /// Stdin payload used to re-verify candidates
    pub representative_input: String,
    pub tags: Vec<String>,
}

/// The structured report every escalation ends with
#[derive(Debug, Clone)]
pub struct EscalationReport {
    pub success: bool,
    pub final_code: String,
    pub final_score: f64,
    pub attempts: Vec<EscalationAttempt>,
    /// Some(true) when the trace-stripped version was kept, Some(false)
    /// when the instrumented version had to stay
    pub cleaned: Option<bool>,
    pub artifact_id: Option<String>,
    /// What a human should try next when the escalation is exhausted
    pub suggestion: Option<String>,
}

/// Six-stage repair engine
pub struct Escalator {
    router: Arc<Router>,
    runner: Arc<SandboxRunner>,
    evaluator: Arc<Evaluator>,
    memory: Arc<Memory>,
    prompts: PromptLoader,
    allow_last_resort: bool,
    cancel: CancelToken,
}

impl Escalator {
    pub fn new(
        router: Arc<Router>,
        runner: Arc<SandboxRunner>,
        evaluator: Arc<Evaluator>,
        memory: Arc<Memory>,
        allow_last_resort: bool,
        cancel: CancelToken,
    ) -> Self {
        Self {
            router,
            runner,
            evaluator,
            memory,
            prompts: PromptLoader::embedded_only(),
            allow_last_resort,
            cancel,
        }
    }

    /// Repair a failing candidate
    ///
    /// `initial_metrics` is the run that triggered escalation; its digest
    /// seeds the first attempt's error context.
    pub async fn escalate(
        &self,
        ctx: &EscalationContext,
        initial_code: &str,
        initial_metrics: &ExecutionMetrics,
    ) -> Result<EscalationReport> {
        let plans = schedule(self.allow_last_resort);
        let mut attempts: Vec<EscalationAttempt> = Vec::new();
        let mut current_code = initial_code.to_string();
        let mut current_error = initial_metrics.error_digest(600);
        // Best candidate seen so far, for the exhaustion report
        let mut best: (f64, String) = (f64::MIN, initial_code.to_string());

        info!(node_id = %ctx.node_id, "Escalation started");

        for (idx, plan) in plans.iter().enumerate() {
            if self.cancel.is_cancelled() {
                bail!("escalation cancelled before attempt {}", plan.attempt_num);
            }

            let next_stage_differs = plans.get(idx + 1).map(|p| p.stage != plan.stage).unwrap_or(false);
            let attempt = self
                .run_attempt(ctx, plan, &current_code, &current_error, &attempts)
                .await;

            match attempt {
                AttemptResult::Passed { code, score } => {
                    let mut record = self.attempt_record(plan, &code, "passed verification", AttemptOutcome::Pass);
                    record.score = score;
                    attempts.push(record);
                    return self.finish_success(ctx, code, score, attempts).await;
                }
                AttemptResult::Failed {
                    code,
                    error_digest,
                    fixes_applied,
                    analysis,
                    score,
                } => {
                    let outcome = if next_stage_differs {
                        AttemptOutcome::Escalate
                    } else {
                        AttemptOutcome::Fail
                    };
                    let mut record = self.attempt_record(plan, &code, &error_digest, outcome);
                    record.fixes_applied = fixes_applied;
                    record.analysis = analysis;
                    record.score = score;
                    attempts.push(record);

                    if score > best.0 && !code.is_empty() {
                        best = (score, code.clone());
                    }
                    if !code.is_empty() {
                        current_code = code;
                    }
                    current_error = error_digest;
                }
            }
        }

        self.finish_exhausted(ctx, best, attempts).await
    }

    /// One attempt: prompt, parse, instrument, run, evaluate
    async fn run_attempt(
        &self,
        ctx: &EscalationContext,
        plan: &AttemptPlan,
        current_code: &str,
        current_error: &str,
        attempts: &[EscalationAttempt],
    ) -> AttemptResult {
        debug!(
            attempt = plan.attempt_num,
            stage = %plan.stage,
            role = plan.model_role,
            temperature = plan.temperature,
            "Running escalation attempt"
        );

        let history = attempts
            .iter()
            .map(|a| a.summary_line())
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = match self.prompts.render(
            "escalation-task",
            &json!({
                "task": ctx.task,
                "strategy": ctx.strategy,
                "code": current_code,
                "error": current_error,
                "attempts": history,
                "inject_logging": plan.inject_logging,
            }),
        ) {
            Ok(p) => p,
            Err(e) => return AttemptResult::failed(String::new(), format!("prompt render failed: {}", e)),
        };
        let system = match self.prompts.raw("escalation-system") {
            Ok(s) => s,
            Err(e) => return AttemptResult::failed(String::new(), format!("prompt render failed: {}", e)),
        };

        let options = GenerateOptions::default()
            .with_system_prompt(system)
            .with_temperature(plan.temperature);
        let response = match self.router.generate(plan.model_role, &prompt, &options).await {
            Ok(text) => text,
            Err(e) => {
                warn!(attempt = plan.attempt_num, error = %e, "Router failed during escalation");
                return AttemptResult::failed(String::new(), format!("router: {}", e));
            }
        };

        // A parse failure is a normal attempt failure; the next prompt
        // quotes it so the model can correct its envelope
        let envelope = match parse_repair(&response) {
            Ok(envelope) => envelope,
            Err(e) => {
                return AttemptResult::failed(String::new(), format!("response parse error: {}", e));
            }
        };

        let mut code = envelope.code;
        if plan.inject_logging {
            code = inject_trace(&code);
        }

        let metrics = match self.write_and_run(ctx, &code).await {
            Ok(metrics) => metrics,
            Err(e) => return AttemptResult::failed(code, format!("runner: {}", e)),
        };

        let (verdict, reason) = triage_rules(&metrics);
        if verdict != TriageVerdict::Pass {
            return AttemptResult::Failed {
                code,
                error_digest: format!("{}; {}", reason, metrics.error_digest(400)),
                fixes_applied: envelope.fixes_applied,
                analysis: envelope.analysis,
                score: 0.0,
            };
        }

        let evaluation = match self
            .evaluator
            .evaluate(EvalKind::Code, ArtifactClass::Code, &ctx.task, &code, Some(&metrics), None)
            .await
        {
            Ok(evaluation) => evaluation,
            Err(e) => return AttemptResult::failed(code, format!("evaluation failed: {}", e)),
        };

        if evaluation.pass {
            AttemptResult::Passed {
                code,
                score: evaluation.score,
            }
        } else {
            AttemptResult::Failed {
                code,
                error_digest: format!(
                    "evaluation score {:.2} below threshold: {}",
                    evaluation.score,
                    evaluation.weaknesses.join("; ")
                ),
                fixes_applied: envelope.fixes_applied,
                analysis: envelope.analysis,
                score: evaluation.score,
            }
        }
    }

    async fn write_and_run(&self, ctx: &EscalationContext, code: &str) -> Result<ExecutionMetrics> {
        self.runner
            .nodes()
            .update_code(&ctx.node_id, code)
            .context("Failed to write candidate")?;
        let metrics = self
            .runner
            .run_node(&ctx.node_id, &ctx.representative_input, None)
            .await
            .context("Failed to run candidate")?;
        Ok(metrics)
    }

    /// Cleanup and persistence once an attempt passes
    async fn finish_success(
        &self,
        ctx: &EscalationContext,
        passing_code: String,
        passing_score: f64,
        attempts: Vec<EscalationAttempt>,
    ) -> Result<EscalationReport> {
        let mut final_code = passing_code.clone();
        let mut final_score = passing_score;
        let mut cleaned = None;

        if has_injected(&passing_code) {
            let stripped = strip_trace(&passing_code);
            debug!(node_id = %ctx.node_id, "Re-verifying trace-stripped candidate");

            let stripped_passes = match self.write_and_run(ctx, &stripped).await {
                Ok(metrics) => {
                    if triage_rules(&metrics).0 == TriageVerdict::Pass {
                        match self
                            .evaluator
                            .evaluate(
                                EvalKind::Code,
                                ArtifactClass::Code,
                                &ctx.task,
                                &stripped,
                                Some(&metrics),
                                None,
                            )
                            .await
                        {
                            Ok(evaluation) if evaluation.pass => Some(evaluation.score),
                            _ => None,
                        }
                    } else {
                        None
                    }
                }
                Err(_) => None,
            };

            match stripped_passes {
                Some(score) => {
                    final_code = stripped;
                    final_score = score;
                    cleaned = Some(true);
                }
                None => {
                    // Keep the instrumented version; put it back on disk
                    warn!(node_id = %ctx.node_id, "Stripped version failed re-verification; keeping traces");
                    self.write_and_run(ctx, &passing_code).await?;
                    cleaned = Some(false);
                }
            }
        }

        let function = Artifact::new(ArtifactKind::Function, &ctx.task, "repaired by escalation", &final_code)
            .with_tags(ctx.tags.iter().cloned())
            .with_meta("node_id", json!(ctx.node_id))
            .with_meta("attempts", json!(attempts.len()))
            .with_meta("instrumented_kept", json!(cleaned == Some(false)));
        let function = self.memory.save(function).await?;

        let pattern = Artifact::new(
            ArtifactKind::Pattern,
            format!("repair trajectory for {}", ctx.node_id),
            format!("{} attempts to repair: {}", attempts.len(), ctx.task),
            serde_json::to_string_pretty(&attempts)?,
        )
        .with_meta("function", json!(function.artifact_id));
        self.memory.save(pattern).await?;

        // The fixes that finally worked, retrievable on their own
        let applied: Vec<&str> = attempts
            .iter()
            .flat_map(|a| a.fixes_applied.iter().map(|f| f.as_str()))
            .collect();
        if !applied.is_empty() {
            let fix = Artifact::new(
                ArtifactKind::CodeFix,
                format!("fixes for {}", ctx.node_id),
                applied.join("; "),
                serde_json::to_string_pretty(&applied)?,
            )
            .with_meta("function", json!(function.artifact_id));
            self.memory.save(fix).await?;
        }

        info!(
            node_id = %ctx.node_id,
            attempts = attempts.len(),
            score = final_score,
            "Escalation succeeded"
        );
        Ok(EscalationReport {
            success: true,
            final_code,
            final_score,
            attempts,
            cleaned,
            artifact_id: Some(function.artifact_id),
            suggestion: None,
        })
    }

    /// Persist the best attempt and the trajectory when everything failed
    async fn finish_exhausted(
        &self,
        ctx: &EscalationContext,
        best: (f64, String),
        attempts: Vec<EscalationAttempt>,
    ) -> Result<EscalationReport> {
        let (best_score, best_code) = best;

        let failure = Artifact::new(
            ArtifactKind::Failure,
            format!("unrepaired: {}", ctx.task),
            format!("all {} escalation attempts failed", attempts.len()),
            serde_json::to_string_pretty(&json!({
                "best_code": best_code,
                "best_score": best_score,
                "attempts": attempts,
            }))?,
        )
        .with_tags(ctx.tags.iter().cloned())
        .with_meta("node_id", json!(ctx.node_id));
        let failure = self.memory.save(failure).await?;

        let suggestion = attempts
            .iter()
            .rev()
            .find(|a| !a.error_digest.is_empty())
            .map(|a| {
                if a.error_digest.contains("timed out") {
                    "increase the runner timeout".to_string()
                } else if a.error_digest.contains("router") {
                    "check LLM backend availability and endpoints".to_string()
                } else {
                    format!("inspect the last error: {}", a.error_digest)
                }
            });

        warn!(node_id = %ctx.node_id, attempts = attempts.len(), "Escalation exhausted");
        Ok(EscalationReport {
            success: false,
            final_code: best_code,
            final_score: best_score.max(0.0),
            attempts,
            cleaned: None,
            artifact_id: Some(failure.artifact_id),
            suggestion,
        })
    }

    fn attempt_record(
        &self,
        plan: &AttemptPlan,
        code: &str,
        error_digest: &str,
        outcome: AttemptOutcome,
    ) -> EscalationAttempt {
        EscalationAttempt {
            attempt_num: plan.attempt_num,
            stage: plan.stage,
            model_role: plan.model_role.to_string(),
            temperature: plan.temperature,
            fixes_applied: Vec::new(),
            analysis: String::new(),
            error_digest: error_digest.to_string(),
            code_excerpt: code.chars().take(300).collect(),
            outcome,
            score: 0.0,
        }
    }
}

/// Internal per-attempt outcome
enum AttemptResult {
    Passed {
        code: String,
        score: f64,
    },
    Failed {
        code: String,
        error_digest: String,
        fixes_applied: Vec<String>,
        analysis: String,
        score: f64,
    },
}

impl AttemptResult {
    fn failed(code: String, error_digest: String) -> Self {
        AttemptResult::Failed {
            code,
            error_digest,
            fixes_applied: Vec::new(),
            analysis: String::new(),
            score: 0.0,
        }
    }
}
