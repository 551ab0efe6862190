//! Local file-backed store
//!
//! Persists a schema-versioned `index.json` (artifact metadata with row
//! pointers) next to `vectors.bin` (f32 little-endian matrix, one row per
//! embedded artifact, rows aligned with the index). The whole store is
//! rewritten on mutation via temp-file rename, so readers never observe a
//! torn state. An fs2 exclusive lock prevents two processes from owning the
//! same store directory.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::artifact::{Artifact, ArtifactKind};
use crate::error::StoreError;
use crate::store::{ArtifactStore, SearchHit, SearchQuery, cosine_similarity};
use crate::SCHEMA_VERSION;

const INDEX_FILE: &str = "index.json";
const VECTORS_FILE: &str = "vectors.bin";
const LOCK_FILE: &str = "store.lock";

/// Persisted index: artifact metadata plus row pointers into the matrix
#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    dimension: usize,
    artifacts: Vec<IndexEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    #[serde(flatten)]
    artifact: Artifact,
    /// Row in vectors.bin, None for exact-only artifacts
    row: Option<usize>,
}

struct Inner {
    entries: Vec<Artifact>,
    by_id: HashMap<String, usize>,
}

/// File-backed artifact store, preferred for small in-process caches
pub struct LocalStore {
    dir: PathBuf,
    dimension: usize,
    ema_alpha: f64,
    inner: RwLock<Inner>,
    // Held for the lifetime of the store; released on drop
    _lock: File,
}

impl LocalStore {
    /// Open (or create) a store directory
    pub fn open(dir: impl AsRef<Path>, dimension: usize, ema_alpha: f64) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let lock_path = dir.join(LOCK_FILE);
        let lock = OpenOptions::new().create(true).write(true).open(&lock_path)?;
        lock.try_lock_exclusive()
            .map_err(|_| StoreError::Locked(lock_path.display().to_string()))?;

        let (entries, by_id) = Self::load(&dir, dimension)?;
        info!(dir = %dir.display(), artifacts = entries.len(), "Opened local artifact store");

        Ok(Self {
            dir,
            dimension,
            ema_alpha,
            inner: RwLock::new(Inner { entries, by_id }),
            _lock: lock,
        })
    }

    /// Load index and matrix from disk, stitching embeddings back in
    fn load(dir: &Path, dimension: usize) -> Result<(Vec<Artifact>, HashMap<String, usize>), StoreError> {
        let index_path = dir.join(INDEX_FILE);
        if !index_path.exists() {
            return Ok((Vec::new(), HashMap::new()));
        }

        let raw = std::fs::read_to_string(&index_path)?;
        let index: IndexFile = serde_json::from_str(&raw)?;

        if index.version > SCHEMA_VERSION {
            return Err(StoreError::SchemaVersion {
                found: index.version,
                supported: SCHEMA_VERSION,
            });
        }

        let matrix = Self::read_matrix(&dir.join(VECTORS_FILE), dimension)?;

        let mut entries = Vec::with_capacity(index.artifacts.len());
        let mut by_id = HashMap::with_capacity(index.artifacts.len());
        for entry in index.artifacts {
            let mut artifact = entry.artifact;
            if let Some(row) = entry.row {
                let vector = matrix
                    .get(row)
                    .ok_or_else(|| StoreError::CorruptMatrix(format!("row {} out of bounds", row)))?;
                artifact.embedding = Some(vector.clone());
            }
            by_id.insert(artifact.artifact_id.clone(), entries.len());
            entries.push(artifact);
        }

        Ok((entries, by_id))
    }

    fn read_matrix(path: &Path, dimension: usize) -> Result<Vec<Vec<f32>>, StoreError> {
        if !path.exists() {
            return Ok(Vec::new());
        }

        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;

        let row_bytes = dimension * 4;
        if row_bytes == 0 || bytes.len() % row_bytes != 0 {
            return Err(StoreError::CorruptMatrix(format!(
                "{} bytes is not a multiple of the {}-byte row size",
                bytes.len(),
                row_bytes
            )));
        }

        let mut matrix = Vec::with_capacity(bytes.len() / row_bytes);
        for row in bytes.chunks_exact(row_bytes) {
            let vector = row
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            matrix.push(vector);
        }
        Ok(matrix)
    }

    /// Rewrite index.json and vectors.bin atomically (temp file + rename)
    fn persist(&self, inner: &Inner) -> Result<(), StoreError> {
        let mut artifacts = Vec::with_capacity(inner.entries.len());
        let mut matrix: Vec<u8> = Vec::new();
        let mut next_row = 0usize;

        for artifact in &inner.entries {
            let row = if let Some(embedding) = &artifact.embedding {
                for value in embedding {
                    matrix.extend_from_slice(&value.to_le_bytes());
                }
                let row = next_row;
                next_row += 1;
                Some(row)
            } else {
                None
            };

            let mut stripped = artifact.clone();
            stripped.embedding = None;
            artifacts.push(IndexEntry { artifact: stripped, row });
        }

        let index = IndexFile {
            version: SCHEMA_VERSION,
            dimension: self.dimension,
            artifacts,
        };

        let vectors_tmp = self.dir.join(format!("{}.tmp", VECTORS_FILE));
        File::create(&vectors_tmp)?.write_all(&matrix)?;
        std::fs::rename(&vectors_tmp, self.dir.join(VECTORS_FILE))?;

        let index_tmp = self.dir.join(format!("{}.tmp", INDEX_FILE));
        File::create(&index_tmp)?.write_all(serde_json::to_string_pretty(&index)?.as_bytes())?;
        std::fs::rename(&index_tmp, self.dir.join(INDEX_FILE))?;

        debug!(artifacts = inner.entries.len(), rows = next_row, "Persisted local store");
        Ok(())
    }

    fn check_dimension(&self, artifact: &Artifact) -> Result<(), StoreError> {
        if let Some(embedding) = &artifact.embedding
            && embedding.len() != self.dimension
        {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                found: embedding.len(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for LocalStore {
    async fn put(&self, mut artifact: Artifact) -> Result<(), StoreError> {
        self.check_dimension(&artifact)?;
        artifact.quality_score = artifact.quality_score.clamp(0.0, 1.0);

        let mut inner = self.inner.write().await;
        if let Some(&idx) = inner.by_id.get(&artifact.artifact_id) {
            // Last-writer-wins on metadata, but creation time and usage
            // history survive the overwrite.
            let existing = &inner.entries[idx];
            artifact.created_at = existing.created_at;
            artifact.usage_count = artifact.usage_count.max(existing.usage_count);
            inner.entries[idx] = artifact;
        } else {
            let idx = inner.entries.len();
            inner.by_id.insert(artifact.artifact_id.clone(), idx);
            inner.entries.push(artifact);
        }

        self.persist(&inner)
    }

    async fn get(&self, artifact_id: &str) -> Result<Option<Artifact>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.by_id.get(artifact_id).map(|&idx| inner.entries[idx].clone()))
    }

    async fn search(&self, query: SearchQuery) -> Result<Vec<SearchHit>, StoreError> {
        let inner = self.inner.read().await;

        let mut hits: Vec<SearchHit> = inner
            .entries
            .iter()
            .filter(|a| query.kind.is_none_or(|k| a.kind == k))
            .filter(|a| a.matches_tags(&query.tags))
            .filter_map(|a| {
                let embedding = a.embedding.as_ref()?;
                let similarity = cosine_similarity(&query.vector, embedding);
                (similarity >= query.min_similarity).then(|| SearchHit {
                    artifact: a.clone(),
                    similarity,
                })
            })
            .collect();

        hits.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(query.k);
        Ok(hits)
    }

    async fn list(
        &self,
        kind: Option<ArtifactKind>,
        tags: &[String],
        limit: usize,
    ) -> Result<Vec<Artifact>, StoreError> {
        let inner = self.inner.read().await;

        let mut matches: Vec<Artifact> = inner
            .entries
            .iter()
            .filter(|a| kind.is_none_or(|k| a.kind == k))
            .filter(|a| a.matches_tags(tags))
            .cloned()
            .collect();

        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn update_quality(&self, artifact_id: &str, score: f64, passed: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let idx = *inner
            .by_id
            .get(artifact_id)
            .ok_or_else(|| StoreError::NotFound(artifact_id.to_string()))?;

        let artifact = &mut inner.entries[idx];
        artifact.apply_quality_sample(score, self.ema_alpha);
        let counter = if passed { "pass_count" } else { "fail_count" };
        let prior = artifact.metadata.get(counter).and_then(|v| v.as_u64()).unwrap_or(0);
        artifact.metadata.insert(counter.to_string(), serde_json::json!(prior + 1));

        self.persist(&inner)
    }

    async fn delete(&self, artifact_id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(idx) = inner.by_id.remove(artifact_id) else {
            return Ok(false);
        };

        inner.entries.remove(idx);
        // Reindex everything after the removed slot
        let Inner { entries, by_id } = &mut *inner;
        for (i, artifact) in entries.iter().enumerate().skip(idx) {
            by_id.insert(artifact.artifact_id.clone(), i);
        }

        self.persist(&inner)?;
        Ok(true)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.inner.read().await.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &Path) -> LocalStore {
        LocalStore::open(dir, 3, 0.3).unwrap()
    }

    fn artifact(name: &str, embedding: Option<Vec<f32>>) -> Artifact {
        let mut a = Artifact::new(ArtifactKind::Function, name, format!("{} desc", name), format!("{} body", name));
        a.embedding = embedding;
        a
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let a = artifact("add", Some(vec![1.0, 0.0, 0.0]));
        let id = a.artifact_id.clone();
        store.put(a.clone()).await.unwrap();

        let back = store.get(&id).await.unwrap().unwrap();
        assert_eq!(back.name, "add");
        assert_eq!(back.content, a.content);
        assert_eq!(back.embedding, Some(vec![1.0, 0.0, 0.0]));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dimension_rejected_at_put() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let result = store.put(artifact("bad", Some(vec![1.0, 2.0]))).await;
        assert!(matches!(
            result,
            Err(StoreError::DimensionMismatch { expected: 3, found: 2 })
        ));
    }

    #[tokio::test]
    async fn test_lww_preserves_created_at_and_usage() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let mut first = artifact("add", None);
        first.usage_count = 5;
        let id = first.artifact_id.clone();
        let created = first.created_at;
        store.put(first).await.unwrap();

        let mut second = Artifact::with_id(&id, ArtifactKind::Function, "add-v2", "better", "new body");
        second.usage_count = 1;
        store.put(second).await.unwrap();

        let back = store.get(&id).await.unwrap().unwrap();
        assert_eq!(back.name, "add-v2");
        assert_eq!(back.created_at, created);
        assert_eq!(back.usage_count, 5, "usage_count never decreases");
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();

        let a = artifact("add", Some(vec![0.5, 0.5, 0.0]));
        let id = a.artifact_id.clone();
        {
            let store = store(dir.path());
            store.put(a).await.unwrap();
            store.put(artifact("exact-only", None)).await.unwrap();
        }

        let reopened = store(dir.path());
        let back = reopened.get(&id).await.unwrap().unwrap();
        assert_eq!(back.embedding, Some(vec![0.5, 0.5, 0.0]));
        assert_eq!(reopened.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_search_ranks_and_filters() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        store.put(artifact("close", Some(vec![1.0, 0.05, 0.0]))).await.unwrap();
        store.put(artifact("far", Some(vec![0.0, 1.0, 0.0]))).await.unwrap();
        store.put(artifact("unsearchable", None)).await.unwrap();

        let hits = store
            .search(SearchQuery::new(vec![1.0, 0.0, 0.0]).with_min_similarity(0.5))
            .await
            .unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].artifact.name, "close");
        assert!(hits[0].similarity > 0.9);
    }

    #[tokio::test]
    async fn test_search_kind_and_tag_filter() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let tool = Artifact::new(ArtifactKind::Tool, "translator", "translates", "spec")
            .with_tag("language")
            .with_embedding(vec![1.0, 0.0, 0.0]);
        store.put(tool).await.unwrap();
        store.put(artifact("func", Some(vec![1.0, 0.0, 0.0]))).await.unwrap();

        let hits = store
            .search(SearchQuery::new(vec![1.0, 0.0, 0.0]).with_kind(ArtifactKind::Tool))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].artifact.name, "translator");

        let hits = store
            .search(SearchQuery::new(vec![1.0, 0.0, 0.0]).with_tags(vec!["nope".to_string()]))
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_update_quality_ema_and_usage() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let a = artifact("add", None);
        let id = a.artifact_id.clone();
        store.put(a).await.unwrap();

        store.update_quality(&id, 1.0, true).await.unwrap();
        let back = store.get(&id).await.unwrap().unwrap();
        assert!((back.quality_score - 0.65).abs() < 1e-9);
        assert_eq!(back.usage_count, 1);
        assert_eq!(back.metadata["pass_count"], 1);

        store.update_quality(&id, 0.0, false).await.unwrap();
        let back = store.get(&id).await.unwrap().unwrap();
        assert_eq!(back.metadata["fail_count"], 1);

        let missing = store.update_quality("nope", 1.0, true).await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_removes_vector_and_metadata() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let a = artifact("gone", Some(vec![1.0, 0.0, 0.0]));
        let id = a.artifact_id.clone();
        store.put(a).await.unwrap();
        store.put(artifact("stays", Some(vec![0.0, 1.0, 0.0]))).await.unwrap();

        assert!(store.delete(&id).await.unwrap());
        assert!(!store.delete(&id).await.unwrap());
        assert!(store.get(&id).await.unwrap().is_none());

        // The survivor's vector is still aligned after compaction
        let hits = store.search(SearchQuery::new(vec![0.0, 1.0, 0.0])).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].artifact.name, "stays");
    }

    #[tokio::test]
    async fn test_refuses_newer_schema() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(INDEX_FILE),
            r#"{"version": 99, "dimension": 3, "artifacts": []}"#,
        )
        .unwrap();

        let result = LocalStore::open(dir.path(), 3, 0.3);
        assert!(matches!(result, Err(StoreError::SchemaVersion { found: 99, .. })));
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let mut old = artifact("old", None);
        old.created_at = chrono::Utc::now() - chrono::Duration::hours(1);
        store.put(old).await.unwrap();
        store.put(artifact("new", None)).await.unwrap();

        let listed = store.list(None, &[], 10).await.unwrap();
        assert_eq!(listed[0].name, "new");
        assert_eq!(listed[1].name, "old");

        let limited = store.list(None, &[], 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }
}
