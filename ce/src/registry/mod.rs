//! Tool registry
//!
//! Catalogue of invocable units with semantic selection backed by the
//! artifact memory, and a generic fallback guaranteed to answer any task.

mod core;
mod tool;

pub use self::core::{ToolOutcome, ToolRegistry};
pub use tool::{Invocation, Tool, ToolConstraints, ToolKind, ToolScope};
