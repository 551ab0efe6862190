//! Generation pipeline
//!
//! The structured generation contract and the end-to-end loop from task
//! text to stored artifact.

pub mod contract;
mod generation;

pub use contract::{ContractError, GenerationEnvelope, RepairEnvelope, parse_generation, parse_repair, strip_code_fences};
pub use generation::{GenerationPipeline, PipelineResult, WorkflowSummary};
