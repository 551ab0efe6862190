//! Multi-tier evaluation
//!
//! Cheap deterministic triage first, a full LLM rubric when it matters, and
//! pass thresholds that adapt to the observed score distribution.

mod evaluator;
mod thresholds;
mod triage;

pub use evaluator::{ArtifactClass, Evaluation, Evaluator};
pub use thresholds::{AdaptiveThresholds, EvalKind, Thresholds};
pub use triage::{Triage, TriageReport, TriageVerdict, triage_rules};
