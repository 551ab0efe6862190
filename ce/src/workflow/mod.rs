//! Workflow decomposition and execution
//!
//! An LLM plans a dependency DAG of steps; the executor runs it level by
//! level with bounded concurrency.

mod executor;
mod planner;
mod spec;

pub use executor::{StepResult, WorkflowExecutor, WorkflowRun};
pub use planner::WorkflowPlanner;
pub use spec::{RetryPolicy, Step, StepKind, WorkflowError, WorkflowSpec};
