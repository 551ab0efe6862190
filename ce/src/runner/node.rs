//! On-disk node storage
//!
//! A node is a directory named by its id holding the source, optional
//! tests, and a `node.json` with metadata and the last run's metrics. Nodes
//! live outside the artifact memory because the runner needs filesystem
//! paths.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;
use walkdir::WalkDir;

use super::ExecutionMetrics;

const SOURCE_FILE: &str = "main.py";
const TEST_FILE: &str = "test_main.py";
const META_FILE: &str = "node.json";

/// Node metadata persisted next to the source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMeta {
    pub node_id: String,
    pub name: String,
    pub description: String,

    /// Example input shape the generator promised to handle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema_hint: Option<serde_json::Value>,

    /// Metrics from the most recent run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_metrics: Option<ExecutionMetrics>,

    pub created_at: DateTime<Utc>,
}

/// Directory of runnable nodes
#[derive(Debug, Clone)]
pub struct NodeStore {
    dir: PathBuf,
}

impl NodeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn node_dir(&self, node_id: &str) -> PathBuf {
        self.dir.join(node_id)
    }

    /// Absolute-ish path of a node's source file
    pub fn source_path(&self, node_id: &str) -> PathBuf {
        self.node_dir(node_id).join(SOURCE_FILE)
    }

    /// Save a new node; returns its metadata
    pub fn save(
        &self,
        code: &str,
        test_code: Option<&str>,
        name: &str,
        description: &str,
        input_schema_hint: Option<serde_json::Value>,
    ) -> Result<NodeMeta> {
        let node_id = format!("node-{}", Uuid::now_v7().simple());
        let dir = self.node_dir(&node_id);
        std::fs::create_dir_all(&dir).context("Failed to create node directory")?;

        std::fs::write(dir.join(SOURCE_FILE), code).context("Failed to write node source")?;
        if let Some(tests) = test_code {
            std::fs::write(dir.join(TEST_FILE), tests).context("Failed to write node tests")?;
        }

        let meta = NodeMeta {
            node_id: node_id.clone(),
            name: name.to_string(),
            description: description.to_string(),
            input_schema_hint,
            last_metrics: None,
            created_at: Utc::now(),
        };
        self.write_meta(&meta)?;

        debug!(node_id = %node_id, "Saved node");
        Ok(meta)
    }

    /// Replace a node's source, e.g. with a repaired candidate
    pub fn update_code(&self, node_id: &str, code: &str) -> Result<()> {
        let path = self.source_path(node_id);
        if !path.parent().map(Path::exists).unwrap_or(false) {
            eyre::bail!("Unknown node: {}", node_id);
        }
        std::fs::write(&path, code).context("Failed to update node source")?;
        Ok(())
    }

    /// Load metadata and source
    pub fn load(&self, node_id: &str) -> Result<(NodeMeta, String)> {
        let meta = self.read_meta(node_id)?;
        let code = std::fs::read_to_string(self.source_path(node_id)).context("Failed to read node source")?;
        Ok((meta, code))
    }

    /// Record the latest run against the node
    pub fn record_metrics(&self, node_id: &str, metrics: &ExecutionMetrics) -> Result<()> {
        let mut meta = self.read_meta(node_id)?;
        meta.last_metrics = Some(metrics.clone());
        self.write_meta(&meta)
    }

    /// All node metadata, newest first
    pub fn list(&self) -> Result<Vec<NodeMeta>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut nodes = Vec::new();
        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = entry.context("Failed to walk nodes directory")?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let node_id = entry.file_name().to_string_lossy().to_string();
            if let Ok(meta) = self.read_meta(&node_id) {
                nodes.push(meta);
            }
        }
        nodes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(nodes)
    }

    pub fn exists(&self, node_id: &str) -> bool {
        self.source_path(node_id).exists()
    }

    fn read_meta(&self, node_id: &str) -> Result<NodeMeta> {
        let path = self.node_dir(node_id).join(META_FILE);
        let raw = std::fs::read_to_string(&path).context(format!("Unknown node: {}", node_id))?;
        serde_json::from_str(&raw).context("Failed to parse node metadata")
    }

    fn write_meta(&self, meta: &NodeMeta) -> Result<()> {
        let path = self.node_dir(&meta.node_id).join(META_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(meta)?).context("Failed to write node metadata")?;
        Ok(())
    }
}
