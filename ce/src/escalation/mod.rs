//! Adaptive escalation
//!
//! Six-stage progressive repair of failing candidates with deterministic
//! trace injection and post-success cleanup.

mod escalator;
mod logging;
mod stage;

pub use escalator::{EscalationContext, EscalationReport, Escalator};
pub use logging::{TRACE_MARKER, has_injected, inject_trace, strip_trace};
pub use stage::{AttemptOutcome, AttemptPlan, EscalationAttempt, Stage, schedule};
