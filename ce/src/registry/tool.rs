//! Tool records
//!
//! A tool is an invocable unit: a specialist LLM role, an executable, a
//! sub-workflow, or the generic fallback that answers anything. Tool
//! descriptions are mirrored into the artifact memory so selection can
//! retrieve them by meaning.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use artifactstore::{Artifact, ArtifactKind};

/// What sort of unit a tool is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolKind {
    LlmSpecialist,
    Executable,
    Workflow,
    GenericFallback,
}

/// How long a runtime instance of a tool is reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolScope {
    Process,
    Workflow,
    #[default]
    Call,
}

/// How to invoke a tool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Invocation {
    /// Routed through a logical role, optionally with a category override
    Role {
        role: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        category: Option<String>,
    },

    /// Explicit model and endpoints, bypassing role resolution
    Model {
        model: String,
        #[serde(default)]
        endpoints: Vec<String>,
    },

    /// A command template; `{input}` in an argument is replaced by the input
    Command { program: String, args: Vec<String> },

    /// A stored workflow spec executed by the workflow engine
    WorkflowRef { workflow_id: String },
}

/// Optional resource limits for a tool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_tier: Option<String>,
}

/// A registered invocable unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub tool_id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub kind: ToolKind,
    pub invocation: Invocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<ToolConstraints>,
    #[serde(default)]
    pub scope: ToolScope,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    pub quality_score: f64,
    #[serde(default)]
    pub deprecated: bool,
}

impl Tool {
    fn base(name: &str, description: &str, kind: ToolKind, invocation: Invocation) -> Self {
        Self {
            tool_id: format!("tool-{}", Uuid::now_v7().simple()),
            name: name.to_string(),
            description: description.to_string(),
            tags: BTreeSet::new(),
            kind,
            invocation,
            constraints: None,
            scope: ToolScope::Call,
            usage_count: 0,
            failure_count: 0,
            quality_score: 0.5,
            deprecated: false,
        }
    }

    /// A specialist LLM behind a routed role
    pub fn specialist(name: &str, description: &str, role: &str) -> Self {
        Self::base(
            name,
            description,
            ToolKind::LlmSpecialist,
            Invocation::Role {
                role: role.to_string(),
                category: None,
            },
        )
    }

    /// An external executable
    pub fn executable(name: &str, description: &str, program: &str, args: Vec<String>) -> Self {
        Self::base(
            name,
            description,
            ToolKind::Executable,
            Invocation::Command {
                program: program.to_string(),
                args,
            },
        )
    }

    /// A stored workflow
    pub fn workflow(name: &str, description: &str, workflow_id: &str) -> Self {
        Self::base(
            name,
            description,
            ToolKind::Workflow,
            Invocation::WorkflowRef {
                workflow_id: workflow_id.to_string(),
            },
        )
    }

    /// The one tool guaranteed to answer any task
    pub fn generic_fallback() -> Self {
        let mut tool = Self::base(
            "generic",
            "General-purpose assistant that handles any task no specialist covers",
            ToolKind::GenericFallback,
            Invocation::Role {
                role: "general".to_string(),
                category: None,
            },
        );
        tool.tool_id = "tool-generic-fallback".to_string();
        tool
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_scope(mut self, scope: ToolScope) -> Self {
        self.scope = scope;
        self
    }

    /// The TOOL artifact mirrored into the memory for semantic selection
    pub fn artifact(&self) -> Artifact {
        Artifact::with_id(
            format!("artifact-{}", self.tool_id),
            ArtifactKind::Tool,
            self.name.clone(),
            self.description.clone(),
            serde_json::to_string(self).unwrap_or_default(),
        )
        .with_tags(self.tags.iter().cloned())
        .with_meta("tool_id", serde_json::json!(self.tool_id))
        .with_meta("tool_kind", serde_json::json!(self.kind))
    }
}
