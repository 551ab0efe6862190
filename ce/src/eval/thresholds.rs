//! Pass thresholds with bounded auto-adjustment
//!
//! Each evaluation kind carries a configured threshold. Once enough samples
//! of a kind accumulate, the effective threshold tracks the observed median
//! (scaled by the adjustment factor) instead of the static value, and never
//! crosses the configured floor.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Which pipeline step an evaluation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalKind {
    Strategy,
    Code,
    Tests,
    Final,
}

impl std::fmt::Display for EvalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EvalKind::Strategy => "strategy",
            EvalKind::Code => "code",
            EvalKind::Tests => "tests",
            EvalKind::Final => "final",
        };
        write!(f, "{}", s)
    }
}

/// Configured per-step thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub strategy: f64,
    pub code: f64,
    pub tests: f64,
    #[serde(rename = "final")]
    pub final_step: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            strategy: 0.6,
            code: 0.7,
            tests: 0.6,
            final_step: 0.7,
        }
    }
}

impl Thresholds {
    pub fn for_kind(&self, kind: EvalKind) -> f64 {
        match kind {
            EvalKind::Strategy => self.strategy,
            EvalKind::Code => self.code,
            EvalKind::Tests => self.tests,
            EvalKind::Final => self.final_step,
        }
    }
}

/// Bounded number of retained samples per kind
const SAMPLE_WINDOW: usize = 512;

/// Thresholds that adapt to the observed score distribution
pub struct AdaptiveThresholds {
    configured: Thresholds,
    floor: f64,
    margin: f64,
    factor: f64,
    min_samples: usize,
    state: Mutex<HashMap<EvalKind, KindState>>,
}

#[derive(Default)]
struct KindState {
    samples: Vec<f64>,
    effective: Option<f64>,
}

impl AdaptiveThresholds {
    pub fn new(configured: Thresholds, floor: f64, margin: f64, factor: f64, min_samples: usize) -> Self {
        Self {
            configured,
            floor,
            margin,
            factor,
            min_samples,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// The threshold currently in force for a kind
    pub fn threshold(&self, kind: EvalKind) -> f64 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .get(&kind)
            .and_then(|s| s.effective)
            .unwrap_or_else(|| self.configured.for_kind(kind))
    }

    /// Record an observed score and adjust when the distribution warrants it
    pub fn record(&self, kind: EvalKind, score: f64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry = state.entry(kind).or_default();

        entry.samples.push(score.clamp(0.0, 1.0));
        if entry.samples.len() > SAMPLE_WINDOW {
            entry.samples.remove(0);
        }
        if entry.samples.len() < self.min_samples {
            return;
        }

        let current = entry.effective.unwrap_or_else(|| self.configured.for_kind(kind));
        let median = median_of(&entry.samples);
        if median > current + self.margin {
            let adjusted = (median * self.factor).max(self.floor);
            if (adjusted - current).abs() > f64::EPSILON {
                debug!(kind = %kind, current, median, adjusted, "Adjusting effective threshold");
                entry.effective = Some(adjusted);
            }
        }
    }
}

fn median_of(samples: &[f64]) -> f64 {
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
