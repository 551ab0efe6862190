//! The ArtifactStore contract shared by local and remote backends

use async_trait::async_trait;

use crate::artifact::{Artifact, ArtifactKind};
use crate::error::StoreError;

/// A semantic search request
#[derive(Debug, Clone)]
pub struct SearchQuery {
    /// Pre-computed query embedding
    pub vector: Vec<f32>,

    /// Restrict to one artifact kind
    pub kind: Option<ArtifactKind>,

    /// Keep artifacts matching any of these tags (empty = no tag filter)
    pub tags: Vec<String>,

    /// Maximum number of hits
    pub k: usize,

    /// Hits below this cosine similarity are dropped
    pub min_similarity: f64,
}

impl SearchQuery {
    /// Query with the default k and similarity floor
    pub fn new(vector: Vec<f32>) -> Self {
        Self {
            vector,
            kind: None,
            tags: Vec::new(),
            k: 10,
            min_similarity: crate::DEFAULT_MIN_SIMILARITY,
        }
    }

    pub fn with_kind(mut self, kind: ArtifactKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_min_similarity(mut self, min: f64) -> Self {
        self.min_similarity = min;
        self
    }
}

/// One semantic search result
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub artifact: Artifact,
    pub similarity: f64,
}

/// Contract shared by the local file-backed store and the remote vector DB
///
/// Semantics every backend must honour:
/// - `put` with an existing id is last-writer-wins on metadata, but
///   `created_at` is preserved and `usage_count` never decreases.
/// - `search` is read-consistent with the latest committed `put` from the
///   same task; cross-task visibility is "by next search".
/// - `delete` removes vector and metadata together.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Insert or update an artifact
    async fn put(&self, artifact: Artifact) -> Result<(), StoreError>;

    /// Exact lookup by id
    async fn get(&self, artifact_id: &str) -> Result<Option<Artifact>, StoreError>;

    /// Top-k cosine similarity search with kind/tag filters
    async fn search(&self, query: SearchQuery) -> Result<Vec<SearchHit>, StoreError>;

    /// Non-semantic listing, newest first
    async fn list(
        &self,
        kind: Option<ArtifactKind>,
        tags: &[String],
        limit: usize,
    ) -> Result<Vec<Artifact>, StoreError>;

    /// Fold an evaluator sample into the artifact's quality score
    async fn update_quality(&self, artifact_id: &str, score: f64, passed: bool) -> Result<(), StoreError>;

    /// Remove an artifact and its vector. Returns whether it existed.
    async fn delete(&self, artifact_id: &str) -> Result<bool, StoreError>;

    /// Number of stored artifacts
    async fn count(&self) -> Result<usize, StoreError>;
}

/// Cosine similarity between two vectors
///
/// Returns 0.0 for mismatched lengths or zero-magnitude inputs, so callers
/// can treat "no meaningful similarity" uniformly.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_opposite() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_degenerate() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_query_builder() {
        let q = SearchQuery::new(vec![0.5; 4])
            .with_kind(ArtifactKind::Tool)
            .with_tags(vec!["code".to_string()])
            .with_k(5)
            .with_min_similarity(0.6);

        assert_eq!(q.kind, Some(ArtifactKind::Tool));
        assert_eq!(q.k, 5);
        assert_eq!(q.min_similarity, 0.6);
        assert_eq!(q.tags, vec!["code".to_string()]);
    }
}
