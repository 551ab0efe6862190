//! Remote vector-DB backend
//!
//! Speaks a minimal points API (Qdrant-style): `upsert`, `search`, `delete`,
//! `count`, `scroll`. The payload of each point carries the full artifact
//! metadata, so the remote collection is self-describing.
//!
//! The remote store is eventually consistent: after an upsert, a search for
//! the same point may miss it for a short window. Recently upserted
//! artifacts are therefore kept in a local side cache and merged into
//! search results until they show up remotely or the consistency window
//! expires.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::artifact::{Artifact, ArtifactKind};
use crate::error::StoreError;
use crate::store::{ArtifactStore, SearchHit, SearchQuery, cosine_similarity};

/// Connection settings for the remote collection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteStoreConfig {
    /// Base URL of the vector DB, e.g. `http://localhost:6333`
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Collection name
    pub collection: String,

    /// How long a fresh upsert is served from the local side cache
    #[serde(rename = "consistency-window-ms")]
    pub consistency_window_ms: u64,

    /// Per-request timeout
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for RemoteStoreConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:6333".to_string(),
            collection: "artifacts".to_string(),
            consistency_window_ms: 10_000,
            timeout_ms: 30_000,
        }
    }
}

/// HTTP client for the remote points API
pub struct RemoteStore {
    config: RemoteStoreConfig,
    dimension: usize,
    ema_alpha: f64,
    http: reqwest::Client,
    recent: RwLock<HashMap<String, (Artifact, Instant)>>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct ScoredPoint {
    id: String,
    #[serde(default)]
    score: f64,
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RetrievedPoint {
    payload: serde_json::Value,
    #[serde(default)]
    vector: Option<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct CountResult {
    count: usize,
}

#[derive(Debug, Deserialize)]
struct ScrollResult {
    points: Vec<RetrievedPoint>,
}

impl RemoteStore {
    /// Connect to the remote store, creating the collection when missing
    pub async fn connect(
        config: RemoteStoreConfig,
        dimension: usize,
        ema_alpha: f64,
    ) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        let store = Self {
            config,
            dimension,
            ema_alpha,
            http,
            recent: RwLock::new(HashMap::new()),
        };

        store.ensure_collection().await?;
        info!(
            base_url = %store.config.base_url,
            collection = %store.config.collection,
            "Connected to remote artifact store"
        );
        Ok(store)
    }

    fn collection_url(&self, suffix: &str) -> String {
        format!(
            "{}/collections/{}{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.collection,
            suffix
        )
    }

    async fn ensure_collection(&self) -> Result<(), StoreError> {
        let body = serde_json::json!({
            "vectors": { "size": self.dimension, "distance": "Cosine" }
        });

        let response = self.http.put(self.collection_url("")).json(&body).send().await?;
        // 409 means the collection already exists, which is fine
        if !response.status().is_success() && response.status().as_u16() != 409 {
            return Err(StoreError::Remote(format!(
                "create collection failed: HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Build the upsert body for one artifact. Exact-only artifacts get a
    /// zero vector and a `searchable: false` payload flag so they never rank.
    fn upsert_body(&self, artifact: &Artifact) -> serde_json::Value {
        let vector = artifact
            .embedding
            .clone()
            .unwrap_or_else(|| vec![0.0; self.dimension]);

        let mut stripped = artifact.clone();
        stripped.embedding = None;
        let mut payload = serde_json::to_value(&stripped).unwrap_or(serde_json::Value::Null);
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("searchable".to_string(), serde_json::json!(artifact.is_searchable()));
        }

        serde_json::json!({
            "points": [{
                "id": artifact.artifact_id,
                "vector": vector,
                "payload": payload,
            }]
        })
    }

    /// Build the search body, pushing the kind filter down to the server
    fn search_body(query: &SearchQuery) -> serde_json::Value {
        let mut body = serde_json::json!({
            "vector": query.vector,
            "limit": query.k.max(1) * 4,
            "score_threshold": query.min_similarity,
            "with_payload": true,
        });

        if let Some(kind) = query.kind {
            body["filter"] = serde_json::json!({
                "must": [{ "key": "kind", "match": { "value": kind.to_string() } }]
            });
        }

        body
    }

    fn artifact_from_payload(payload: &serde_json::Value) -> Result<Artifact, StoreError> {
        serde_json::from_value(payload.clone())
            .map_err(|e| StoreError::Remote(format!("undecodable payload: {}", e)))
    }

    /// Merge side-cached recent upserts into the remote hits, preferring the
    /// remote copy once it is visible
    fn merge_recent_hits(
        remote: Vec<SearchHit>,
        recent: &HashMap<String, (Artifact, Instant)>,
        query: &SearchQuery,
        window: Duration,
    ) -> Vec<SearchHit> {
        let mut hits = remote;
        let seen: std::collections::HashSet<String> =
            hits.iter().map(|h| h.artifact.artifact_id.clone()).collect();

        for (id, (artifact, at)) in recent {
            if seen.contains(id) || at.elapsed() > window {
                continue;
            }
            if query.kind.is_some_and(|k| artifact.kind != k) || !artifact.matches_tags(&query.tags) {
                continue;
            }
            let Some(embedding) = &artifact.embedding else { continue };
            let similarity = cosine_similarity(&query.vector, embedding);
            if similarity >= query.min_similarity {
                hits.push(SearchHit {
                    artifact: artifact.clone(),
                    similarity,
                });
            }
        }

        hits.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(query.k);
        hits
    }

    /// Drop cache entries that are visible remotely or past the window
    async fn prune_recent(&self, visible: &[String]) {
        let window = Duration::from_millis(self.config.consistency_window_ms);
        let mut recent = self.recent.write().await;
        recent.retain(|id, (_, at)| at.elapsed() <= window && !visible.iter().any(|v| v == id));
    }
}

#[async_trait]
impl ArtifactStore for RemoteStore {
    async fn put(&self, mut artifact: Artifact) -> Result<(), StoreError> {
        if let Some(embedding) = &artifact.embedding
            && embedding.len() != self.dimension
        {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                found: embedding.len(),
            });
        }
        artifact.quality_score = artifact.quality_score.clamp(0.0, 1.0);

        // Preserve creation time and monotone usage across overwrites
        if let Ok(Some(existing)) = self.get(&artifact.artifact_id).await {
            artifact.created_at = existing.created_at;
            artifact.usage_count = artifact.usage_count.max(existing.usage_count);
        }

        let body = self.upsert_body(&artifact);
        let response = self
            .http
            .put(self.collection_url("/points"))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StoreError::Remote(format!("upsert failed: HTTP {}", response.status())));
        }

        self.recent
            .write()
            .await
            .insert(artifact.artifact_id.clone(), (artifact, Instant::now()));
        Ok(())
    }

    async fn get(&self, artifact_id: &str) -> Result<Option<Artifact>, StoreError> {
        // Read-your-writes: prefer the side cache within the window
        {
            let recent = self.recent.read().await;
            if let Some((artifact, at)) = recent.get(artifact_id)
                && at.elapsed() <= Duration::from_millis(self.config.consistency_window_ms)
            {
                return Ok(Some(artifact.clone()));
            }
        }

        let body = serde_json::json!({
            "ids": [artifact_id],
            "with_payload": true,
            "with_vector": true,
        });
        let response = self
            .http
            .post(self.collection_url("/points"))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StoreError::Remote(format!("get failed: HTTP {}", response.status())));
        }

        let parsed: ApiResponse<Vec<RetrievedPoint>> = response.json().await?;
        let Some(point) = parsed.result.into_iter().next() else {
            return Ok(None);
        };

        let mut artifact = Self::artifact_from_payload(&point.payload)?;
        let searchable = point
            .payload
            .get("searchable")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        if searchable {
            artifact.embedding = point.vector;
        }
        Ok(Some(artifact))
    }

    async fn search(&self, query: SearchQuery) -> Result<Vec<SearchHit>, StoreError> {
        let body = Self::search_body(&query);
        let response = self
            .http
            .post(self.collection_url("/points/search"))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StoreError::Remote(format!("search failed: HTTP {}", response.status())));
        }

        let parsed: ApiResponse<Vec<ScoredPoint>> = response.json().await?;
        let mut remote_hits = Vec::with_capacity(parsed.result.len());
        let mut visible = Vec::new();
        for point in parsed.result {
            visible.push(point.id.clone());
            let searchable = point
                .payload
                .get("searchable")
                .and_then(|v| v.as_bool())
                .unwrap_or(true);
            if !searchable {
                continue;
            }
            let artifact = match Self::artifact_from_payload(&point.payload) {
                Ok(a) => a,
                Err(e) => {
                    warn!(id = %point.id, error = %e, "Skipping undecodable remote point");
                    continue;
                }
            };
            if !artifact.matches_tags(&query.tags) {
                continue;
            }
            remote_hits.push(SearchHit {
                artifact,
                similarity: point.score,
            });
        }

        let window = Duration::from_millis(self.config.consistency_window_ms);
        let hits = {
            let recent = self.recent.read().await;
            Self::merge_recent_hits(remote_hits, &recent, &query, window)
        };
        self.prune_recent(&visible).await;

        debug!(hits = hits.len(), "Remote search complete");
        Ok(hits)
    }

    async fn list(
        &self,
        kind: Option<ArtifactKind>,
        tags: &[String],
        limit: usize,
    ) -> Result<Vec<Artifact>, StoreError> {
        let mut body = serde_json::json!({
            "limit": limit.max(1) * 4,
            "with_payload": true,
        });
        if let Some(kind) = kind {
            body["filter"] = serde_json::json!({
                "must": [{ "key": "kind", "match": { "value": kind.to_string() } }]
            });
        }

        let response = self
            .http
            .post(self.collection_url("/points/scroll"))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StoreError::Remote(format!("scroll failed: HTTP {}", response.status())));
        }

        let parsed: ApiResponse<ScrollResult> = response.json().await?;
        let mut artifacts: Vec<Artifact> = parsed
            .result
            .points
            .iter()
            .filter_map(|p| Self::artifact_from_payload(&p.payload).ok())
            .filter(|a| a.matches_tags(tags))
            .collect();

        artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        artifacts.truncate(limit);
        Ok(artifacts)
    }

    async fn update_quality(&self, artifact_id: &str, score: f64, passed: bool) -> Result<(), StoreError> {
        let mut artifact = self
            .get(artifact_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(artifact_id.to_string()))?;

        artifact.apply_quality_sample(score, self.ema_alpha);
        let counter = if passed { "pass_count" } else { "fail_count" };
        let prior = artifact.metadata.get(counter).and_then(|v| v.as_u64()).unwrap_or(0);
        artifact.metadata.insert(counter.to_string(), serde_json::json!(prior + 1));

        self.put(artifact).await
    }

    async fn delete(&self, artifact_id: &str) -> Result<bool, StoreError> {
        let existed = self.get(artifact_id).await?.is_some();

        let body = serde_json::json!({ "points": [artifact_id] });
        let response = self
            .http
            .post(self.collection_url("/points/delete"))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StoreError::Remote(format!("delete failed: HTTP {}", response.status())));
        }

        self.recent.write().await.remove(artifact_id);
        Ok(existed)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let response = self
            .http
            .post(self.collection_url("/points/count"))
            .json(&serde_json::json!({}))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StoreError::Remote(format!("count failed: HTTP {}", response.status())));
        }

        let parsed: ApiResponse<CountResult> = response.json().await?;
        Ok(parsed.result.count)
    }
}
