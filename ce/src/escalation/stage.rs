//! The escalation stage policy
//!
//! Six attempts across three stages, plus an optional best-available
//! seventh. The schedule is static: model role and temperature are fixed
//! per attempt, so repair behaviour is reproducible up to model sampling.

use serde::{Deserialize, Serialize};

/// Which phase of the policy an attempt belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    BaselineFix,
    LoggingAssisted,
    PowerfulModel,
    BestAvailable,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::BaselineFix => "baseline-fix",
            Stage::LoggingAssisted => "logging-assisted",
            Stage::PowerfulModel => "powerful-model",
            Stage::BestAvailable => "best-available",
        };
        write!(f, "{}", s)
    }
}

/// One slot of the schedule
#[derive(Debug, Clone, Copy)]
pub struct AttemptPlan {
    pub attempt_num: u32,
    pub stage: Stage,
    pub model_role: &'static str,
    pub temperature: f64,
    pub inject_logging: bool,
}

/// The full attempt schedule
///
/// `allow_last_resort` appends the seventh best-available attempt.
pub fn schedule(allow_last_resort: bool) -> Vec<AttemptPlan> {
    let mut plans = vec![
        AttemptPlan {
            attempt_num: 1,
            stage: Stage::BaselineFix,
            model_role: "generator",
            temperature: 0.1,
            inject_logging: false,
        },
        AttemptPlan {
            attempt_num: 2,
            stage: Stage::BaselineFix,
            model_role: "generator",
            temperature: 0.2,
            inject_logging: false,
        },
        AttemptPlan {
            attempt_num: 3,
            stage: Stage::LoggingAssisted,
            model_role: "generator",
            temperature: 0.3,
            inject_logging: true,
        },
        AttemptPlan {
            attempt_num: 4,
            stage: Stage::LoggingAssisted,
            model_role: "generator",
            temperature: 0.4,
            inject_logging: true,
        },
        AttemptPlan {
            attempt_num: 5,
            stage: Stage::PowerfulModel,
            model_role: "escalation",
            temperature: 0.5,
            inject_logging: true,
        },
        AttemptPlan {
            attempt_num: 6,
            stage: Stage::PowerfulModel,
            model_role: "escalation",
            temperature: 0.6,
            inject_logging: true,
        },
    ];

    if allow_last_resort {
        plans.push(AttemptPlan {
            attempt_num: 7,
            stage: Stage::BestAvailable,
            model_role: "god",
            temperature: 0.7,
            inject_logging: true,
        });
    }
    plans
}

/// Terminal state of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    Pass,
    Fail,
    Escalate,
}

/// One attempt's record, threaded into every later prompt and persisted
/// with the terminal artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationAttempt {
    pub attempt_num: u32,
    pub stage: Stage,
    pub model_role: String,
    pub temperature: f64,
    #[serde(default)]
    pub fixes_applied: Vec<String>,
    #[serde(default)]
    pub analysis: String,
    pub error_digest: String,
    pub code_excerpt: String,
    pub outcome: AttemptOutcome,
    /// Evaluator score for best-attempt selection on exhaustion
    #[serde(default)]
    pub score: f64,
}

impl EscalationAttempt {
    /// One line of the attempt history shown to later attempts
    pub fn summary_line(&self) -> String {
        let fixes = if self.fixes_applied.is_empty() {
            "none".to_string()
        } else {
            self.fixes_applied.join(", ")
        };
        format!(
            "attempt {} [{} / {} @ t={}]: fixes: {}; analysis: {}; error: {}",
            self.attempt_num,
            self.stage,
            self.model_role,
            self.temperature,
            fixes,
            if self.analysis.is_empty() { "-" } else { &self.analysis },
            self.error_digest,
        )
    }
}
