//! Configuration for artifactstore

use eyre::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::remote::RemoteStoreConfig;

/// Which backend serves the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend selection
    pub backend: BackendKind,

    /// Local store directory
    pub path: PathBuf,

    /// Embedding dimension D, fixed per deployment
    pub dimension: usize,

    /// EMA weight for quality updates
    #[serde(rename = "ema-alpha")]
    pub ema_alpha: f64,

    /// Default similarity floor for semantic search
    #[serde(rename = "min-similarity")]
    pub min_similarity: f64,

    /// Remote backend settings (used when `backend: remote`)
    pub remote: RemoteStoreConfig,
}

fn default_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("artifactstore")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            path: default_path(),
            dimension: crate::DEFAULT_DIMENSION,
            ema_alpha: crate::DEFAULT_EMA_ALPHA,
            min_similarity: crate::DEFAULT_MIN_SIMILARITY,
            remote: RemoteStoreConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Load config from file, or use defaults
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        if let Some(config_path) = path {
            let content = std::fs::read_to_string(config_path)?;
            let config: StoreConfig = serde_yaml::from_str(&content)?;
            return Ok(config);
        }

        let default_paths = [
            Some(PathBuf::from("artifactstore.yml")),
            dirs::config_dir().map(|p| p.join("artifactstore").join("config.yml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let config: StoreConfig = serde_yaml::from_str(&content)?;
                return Ok(config);
            }
        }

        Ok(StoreConfig::default())
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
