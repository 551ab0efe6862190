//! Memory facade over the artifact store
//!
//! Wires the router's embedder into the store: `save` computes a missing
//! embedding before persisting, `find` embeds the query text. When embedding
//! is unavailable the memory degrades instead of refusing: artifacts are
//! persisted non-searchable and search falls back to tag/substring
//! filtering, with a single warning per process.

use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};

use eyre::{Context, Result};
use tracing::{debug, warn};

use artifactstore::{Artifact, ArtifactKind, ArtifactStore, Embedder, SearchHit, SearchQuery};

static DEGRADED_WARNING: Once = Once::new();

/// Process-wide semantic memory
pub struct Memory {
    store: Arc<dyn ArtifactStore>,
    embedder: Arc<dyn Embedder>,
    min_similarity: f64,
    degraded: AtomicBool,
}

impl Memory {
    pub fn new(store: Arc<dyn ArtifactStore>, embedder: Arc<dyn Embedder>, min_similarity: f64) -> Self {
        Self {
            store,
            embedder,
            min_similarity,
            degraded: AtomicBool::new(false),
        }
    }

    /// Whether semantic search has degraded to tag/substring filtering
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn enter_degraded(&self, reason: &str) {
        self.degraded.store(true, Ordering::SeqCst);
        let reason = reason.to_string();
        DEGRADED_WARNING.call_once(|| {
            warn!(
                reason = %reason,
                "Embedding unavailable; memory degrades to exact-lookup mode for this session"
            );
        });
    }

    /// What gets embedded for an artifact: its header text
    ///
    /// Content stays out on purpose: payloads (code, JSON) drown the
    /// descriptive signal retrieval actually matches on.
    fn embed_source(artifact: &Artifact) -> String {
        let tags: Vec<&str> = artifact.tags.iter().map(|t| t.as_str()).collect();
        format!("{}\n{}\n{}", artifact.name, artifact.description, tags.join(" "))
    }

    /// Persist an artifact, computing its embedding when absent
    ///
    /// A failed embedding downgrades the artifact to non-searchable rather
    /// than refusing the put.
    pub async fn save(&self, mut artifact: Artifact) -> Result<Artifact> {
        if artifact.embedding.is_none() && !self.is_degraded() {
            match self.embedder.embed(&Self::embed_source(&artifact)).await {
                Ok(vector) => artifact.embedding = Some(vector),
                Err(e) => {
                    self.enter_degraded(&e.to_string());
                    artifact
                        .metadata
                        .insert("searchable".to_string(), serde_json::json!(false));
                }
            }
        } else if artifact.embedding.is_none() {
            artifact
                .metadata
                .insert("searchable".to_string(), serde_json::json!(false));
        }

        debug!(id = %artifact.artifact_id, kind = %artifact.kind, "Saving artifact");
        self.store
            .put(artifact.clone())
            .await
            .context("Failed to persist artifact")?;
        Ok(artifact)
    }

    /// Semantic search by query text, degrading to substring filtering
    pub async fn find(
        &self,
        query_text: &str,
        kind: Option<ArtifactKind>,
        tags: &[String],
        k: usize,
        min_similarity: Option<f64>,
    ) -> Result<Vec<SearchHit>> {
        let min_similarity = min_similarity.unwrap_or(self.min_similarity);

        if !self.is_degraded() {
            match self.embedder.embed(query_text).await {
                Ok(vector) => {
                    let mut query = SearchQuery::new(vector)
                        .with_k(k)
                        .with_min_similarity(min_similarity)
                        .with_tags(tags.to_vec());
                    if let Some(kind) = kind {
                        query = query.with_kind(kind);
                    }
                    return self.store.search(query).await.context("Semantic search failed");
                }
                Err(e) => self.enter_degraded(&e.to_string()),
            }
        }

        self.degraded_find(query_text, kind, tags, k).await
    }

    /// Tag/substring fallback used while degraded
    async fn degraded_find(
        &self,
        query_text: &str,
        kind: Option<ArtifactKind>,
        tags: &[String],
        k: usize,
    ) -> Result<Vec<SearchHit>> {
        let candidates = self
            .store
            .list(kind, tags, k.saturating_mul(20).max(100))
            .await
            .context("Degraded listing failed")?;

        let needle = query_text.to_lowercase();
        let words: Vec<&str> = needle.split_whitespace().collect();
        let hits = candidates
            .into_iter()
            .filter(|a| {
                let haystack = format!("{} {} {}", a.name, a.description, a.tags.iter().cloned().collect::<Vec<_>>().join(" "))
                    .to_lowercase();
                words.iter().any(|w| haystack.contains(w))
            })
            .take(k)
            .map(|artifact| SearchHit {
                artifact,
                similarity: 0.0,
            })
            .collect();
        Ok(hits)
    }

    /// Exact lookup
    pub async fn get(&self, artifact_id: &str) -> Result<Option<Artifact>> {
        self.store.get(artifact_id).await.context("Artifact lookup failed")
    }

    /// Non-semantic listing
    pub async fn list(&self, kind: Option<ArtifactKind>, tags: &[String], limit: usize) -> Result<Vec<Artifact>> {
        self.store.list(kind, tags, limit).await.context("Artifact listing failed")
    }

    /// Fold an evaluation sample into an artifact's quality
    pub async fn update_quality(&self, artifact_id: &str, score: f64, passed: bool) -> Result<()> {
        self.store
            .update_quality(artifact_id, score, passed)
            .await
            .context("Quality update failed")
    }

    /// Admin-path deletion
    pub async fn delete(&self, artifact_id: &str) -> Result<bool> {
        self.store.delete(artifact_id).await.context("Artifact deletion failed")
    }

    pub async fn count(&self) -> Result<usize> {
        self.store.count().await.context("Artifact count failed")
    }
}
