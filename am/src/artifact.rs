//! The Artifact record - the single polymorphic unit of persisted memory
//!
//! An artifact is a tagged variant on [`ArtifactKind`] with a common header,
//! not an inheritance hierarchy. This keeps persistence flat and makes the
//! vector-DB payload trivial.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// What an artifact is, driving which rubric evaluates it and how it is
/// retrieved later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactKind {
    Plan,
    Function,
    Workflow,
    SubWorkflow,
    Tool,
    Prompt,
    Pattern,
    CodeFix,
    Failure,
    PerfRecord,
    Evaluation,
    Conversation,
}

impl ArtifactKind {
    /// All kinds, in declaration order
    pub fn all() -> &'static [ArtifactKind] {
        &[
            ArtifactKind::Plan,
            ArtifactKind::Function,
            ArtifactKind::Workflow,
            ArtifactKind::SubWorkflow,
            ArtifactKind::Tool,
            ArtifactKind::Prompt,
            ArtifactKind::Pattern,
            ArtifactKind::CodeFix,
            ArtifactKind::Failure,
            ArtifactKind::PerfRecord,
            ArtifactKind::Evaluation,
            ArtifactKind::Conversation,
        ]
    }

    /// Parse from the wire form used in the index and CLI (`FUNCTION`, `PLAN`, ...)
    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_uppercase())).ok()
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Reuse the serde rename so display and wire form agree
        let s = serde_json::to_value(self).map_err(|_| std::fmt::Error)?;
        write!(f, "{}", s.as_str().unwrap_or("UNKNOWN"))
    }
}

/// A typed, persisted unit of memory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Stable unique id (content hash by default, assigned for mutable records)
    pub artifact_id: String,

    /// Discriminant for the payload in `content`
    pub kind: ArtifactKind,

    /// Short human-readable name
    pub name: String,

    /// One or two sentences of what this artifact is
    pub description: String,

    /// The payload: source text for code, JSON for workflows, prose for plans
    pub content: String,

    /// Coarse filter tags
    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Free-form provenance (strategy used, tool id, task hash, ...)
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    /// Dense vector of the configured dimension, or None for exact-only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,

    /// Rolling quality estimate in [0,1]
    pub quality_score: f64,

    /// How many times this artifact has been retrieved and used
    pub usage_count: u64,

    /// Last time the artifact was used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Artifact {
    /// Create an artifact whose id is a content hash
    pub fn new(
        kind: ArtifactKind,
        name: impl Into<String>,
        description: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        let id = content_id(kind, &content);
        Self::with_id(id, kind, name, description, content)
    }

    /// Create an artifact with an explicitly assigned id
    pub fn with_id(
        artifact_id: impl Into<String>,
        kind: ArtifactKind,
        name: impl Into<String>,
        description: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            artifact_id: artifact_id.into(),
            kind,
            name: name.into(),
            description: description.into(),
            content: content.into(),
            tags: BTreeSet::new(),
            metadata: serde_json::Map::new(),
            embedding: None,
            quality_score: 0.5,
            usage_count: 0,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Add a tag (builder style)
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Add tags from an iterator (builder style)
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Set a metadata key (builder style)
    pub fn with_meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Set the embedding (builder style)
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Whether this artifact participates in semantic search
    pub fn is_searchable(&self) -> bool {
        self.embedding.is_some()
    }

    /// Fold a new quality sample into the rolling score
    ///
    /// Exponential moving average with weight `alpha` on the new sample.
    /// The result is clamped to [0,1]. A pass also counts as a use.
    pub fn apply_quality_sample(&mut self, score: f64, alpha: f64) {
        let sample = score.clamp(0.0, 1.0);
        self.quality_score = (alpha * sample + (1.0 - alpha) * self.quality_score).clamp(0.0, 1.0);
        self.usage_count += 1;
        self.last_used_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }

    /// Record a retrieval without a quality sample
    pub fn touch_usage(&mut self) {
        self.usage_count += 1;
        self.last_used_at = Some(Utc::now());
    }

    /// Whether any of the given tags matches (empty filter matches everything)
    pub fn matches_tags(&self, tags: &[String]) -> bool {
        tags.is_empty() || tags.iter().any(|t| self.tags.contains(t))
    }
}

/// Content-addressed id: kind plus the first 16 hex chars of SHA-256(content)
pub fn content_id(kind: ArtifactKind, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    format!("{}-{}", kind.to_string().to_lowercase().replace('_', "-"), hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_id_stable() {
        let a = content_id(ArtifactKind::Function, "def add(a, b): return a + b");
        let b = content_id(ArtifactKind::Function, "def add(a, b): return a + b");
        assert_eq!(a, b);
        assert!(a.starts_with("function-"));
    }

    #[test]
    fn test_content_id_kind_sensitive() {
        let a = content_id(ArtifactKind::Function, "x");
        let b = content_id(ArtifactKind::Plan, "x");
        assert_ne!(a, b);
    }

    #[test]
    fn test_kind_roundtrip() {
        for kind in ArtifactKind::all() {
            let wire = kind.to_string();
            assert_eq!(ArtifactKind::parse(&wire), Some(*kind), "kind {}", wire);
        }
        assert_eq!(ArtifactKind::parse("function"), Some(ArtifactKind::Function));
        assert_eq!(ArtifactKind::parse("nonsense"), None);
    }

    #[test]
    fn test_quality_ema() {
        let mut artifact = Artifact::new(ArtifactKind::Function, "add", "adds", "code");
        assert_eq!(artifact.quality_score, 0.5);

        artifact.apply_quality_sample(1.0, 0.3);
        assert!((artifact.quality_score - 0.65).abs() < 1e-9);
        assert_eq!(artifact.usage_count, 1);
        assert!(artifact.last_used_at.is_some());

        // Out-of-range samples are clamped before averaging
        artifact.apply_quality_sample(7.0, 0.3);
        assert!(artifact.quality_score <= 1.0);
    }

    #[test]
    fn test_builder_tags_and_meta() {
        let artifact = Artifact::new(ArtifactKind::Plan, "strategy", "plan", "do it")
            .with_tag("math")
            .with_tags(["addition", "arithmetic"])
            .with_meta("strategy", serde_json::json!("direct"));

        assert!(artifact.tags.contains("math"));
        assert!(artifact.tags.contains("addition"));
        assert_eq!(artifact.metadata["strategy"], "direct");
        assert!(artifact.matches_tags(&["math".to_string()]));
        assert!(artifact.matches_tags(&[]));
        assert!(!artifact.matches_tags(&["sorting".to_string()]));
    }

    #[test]
    fn test_serde_roundtrip() {
        let artifact = Artifact::new(ArtifactKind::Function, "add", "adds two ints", "def add(): pass")
            .with_embedding(vec![0.1, 0.2, 0.3]);

        let json = serde_json::to_string(&artifact).unwrap();
        let back: Artifact = serde_json::from_str(&json).unwrap();

        assert_eq!(back.artifact_id, artifact.artifact_id);
        assert_eq!(back.kind, ArtifactKind::Function);
        assert_eq!(back.embedding, Some(vec![0.1, 0.2, 0.3]));
    }

    #[test]
    fn test_kind_wire_form() {
        assert_eq!(ArtifactKind::PerfRecord.to_string(), "PERF_RECORD");
        assert_eq!(ArtifactKind::SubWorkflow.to_string(), "SUB_WORKFLOW");
    }
}
