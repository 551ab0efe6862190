//! Configuration types, loading, and the role routing policy
//!
//! The routing policy is declarative: backends name provider protocols and
//! endpoints, roles map logical names (overseer, generator, ...) onto a
//! model, tier and endpoint list, and unresolved role fields inherit along
//! the cascade `very_fast -> fast -> general -> escalation -> god`.
//! Task-category overrides may substitute the model for a subset of roles.
//!
//! Every role must resolve at startup; a missing model or unknown backend
//! fails fast with the offending key path.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::eval::Thresholds;

/// Inheritance order for role resolution
pub const ROLE_CASCADE: [&str; 5] = ["very_fast", "fast", "general", "escalation", "god"];

/// Roles the daemon itself calls; all must resolve at startup
pub const CORE_ROLES: [&str; 10] = [
    "overseer",
    "generator",
    "evaluator",
    "triage",
    "escalation",
    "embedding",
    "general",
    "fast",
    "very_fast",
    "god",
];

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backends and the role routing policy
    pub llm: LlmPolicyConfig,

    /// Artifact memory settings
    pub memory: MemoryConfig,

    /// Sandbox runner settings
    pub runner: RunnerConfig,

    /// Evaluator thresholds and adjustment policy
    pub evaluator: EvaluatorConfig,

    /// Workflow executor settings
    pub workflow: WorkflowConfig,

    /// Tool registry settings
    pub registry: RegistryConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".codevolve.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("codevolve").join("codevolve.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Resolve every role the daemon can use; fail fast on the first bad key
    pub fn validate(&self) -> Result<()> {
        let mut roles: Vec<&str> = CORE_ROLES.to_vec();
        for role in self.llm.roles.keys() {
            if !roles.contains(&role.as_str()) {
                roles.push(role);
            }
        }

        for role in roles {
            self.llm
                .resolve(role, None)
                .context(format!("Invalid routing policy at llm.roles.{}", role))?;
        }

        if self.memory.store.dimension == 0 {
            bail!("memory.store.dimension must be positive");
        }
        Ok(())
    }
}

/// Request tier, which fixes the per-call timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tier {
    VeryFast,
    Fast,
    Medium,
    Slow,
    VerySlow,
}

impl Tier {
    /// Wall-clock budget for one endpoint attempt
    pub fn timeout(&self) -> Duration {
        match self {
            Tier::VeryFast => Duration::from_secs(30),
            Tier::Fast => Duration::from_secs(60),
            Tier::Medium => Duration::from_secs(120),
            Tier::Slow => Duration::from_secs(240),
            Tier::VerySlow => Duration::from_secs(480),
        }
    }
}

/// Which wire protocol a backend speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendProtocol {
    Ollama,
    Openai,
    Anthropic,
}

/// One configured provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub protocol: BackendProtocol,

    /// Used when a role resolves to no explicit endpoints
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Environment variable holding the API key, when the protocol needs one
    #[serde(rename = "api-key-env", default)]
    pub api_key_env: Option<String>,

    /// Endpoint pool shared by roles on this backend
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Outer HTTP client timeout; the router applies tier budgets within it
    #[serde(rename = "request-timeout-ms", default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    600_000
}

/// Per-role routing entry; unset fields inherit along the cascade
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleConfig {
    pub model: Option<String>,
    pub backend: Option<String>,
    pub endpoints: Vec<String>,
    pub tier: Option<Tier>,
    #[serde(rename = "context-window")]
    pub context_window: Option<usize>,
    pub temperature: Option<f64>,
    #[serde(rename = "max-tokens")]
    pub max_tokens: Option<u32>,
    #[serde(rename = "fallback-backends")]
    pub fallback_backends: Vec<String>,
}

/// A role fully resolved against the policy
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRole {
    pub role: String,
    pub model: String,
    pub backend: String,
    pub endpoints: Vec<String>,
    pub tier: Tier,
    pub context_window: usize,
    pub temperature: Option<f64>,
    pub max_tokens: u32,
    pub fallback_backends: Vec<String>,
}

/// Backends, roles and category overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmPolicyConfig {
    pub backends: BTreeMap<String, BackendConfig>,
    pub roles: BTreeMap<String, RoleConfig>,

    /// category -> role -> model substitution
    pub categories: BTreeMap<String, BTreeMap<String, String>>,

    /// Probe health and model listings at startup
    #[serde(rename = "verify-backends")]
    pub verify_backends: bool,

    /// Output budget subtracted from the context window before truncation
    #[serde(rename = "reserved-output-tokens")]
    pub reserved_output_tokens: usize,
}

impl LlmPolicyConfig {
    /// The inheritance chain for a role: itself, then the cascade tail
    fn chain(role: &str) -> Vec<&str> {
        let mut chain = vec![role];
        let start = ROLE_CASCADE.iter().position(|r| *r == role).map(|i| i + 1).unwrap_or(2);
        for cascade_role in &ROLE_CASCADE[start.min(ROLE_CASCADE.len())..] {
            if *cascade_role != role {
                chain.push(cascade_role);
            }
        }
        chain
    }

    /// Resolve a role, with an optional task-category model override
    pub fn resolve(&self, role: &str, category: Option<&str>) -> Result<ResolvedRole> {
        let chain = Self::chain(role);

        let mut model = None;
        let mut backend = None;
        let mut endpoints: Vec<String> = Vec::new();
        let mut tier = None;
        let mut context_window = None;
        let mut temperature = None;
        let mut max_tokens = None;
        let mut fallback_backends: Vec<String> = Vec::new();

        for member in &chain {
            if let Some(entry) = self.roles.get(*member) {
                model = model.or_else(|| entry.model.clone());
                backend = backend.or_else(|| entry.backend.clone());
                if endpoints.is_empty() {
                    endpoints = entry.endpoints.clone();
                }
                tier = tier.or(entry.tier);
                context_window = context_window.or(entry.context_window);
                temperature = temperature.or(entry.temperature);
                max_tokens = max_tokens.or(entry.max_tokens);
                if fallback_backends.is_empty() {
                    fallback_backends = entry.fallback_backends.clone();
                }
            }
        }

        // A category override substitutes the model only
        if let Some(cat) = category
            && let Some(overrides) = self.categories.get(cat)
            && let Some(substituted) = overrides.get(role)
        {
            model = Some(substituted.clone());
        }

        let Some(model) = model.filter(|m| !m.is_empty()) else {
            bail!("no model resolves for role '{}' (cascade: {})", role, chain.join(" -> "));
        };

        let backend = match backend {
            Some(name) => name,
            None if self.backends.len() == 1 => self.backends.keys().next().cloned().unwrap_or_default(),
            None => bail!(
                "no backend resolves for role '{}' and {} backends are configured",
                role,
                self.backends.len()
            ),
        };

        let Some(backend_config) = self.backends.get(&backend) else {
            bail!("role '{}' references unknown backend '{}'", role, backend);
        };

        if endpoints.is_empty() {
            endpoints = backend_config.endpoints.clone();
        }
        if endpoints.is_empty() {
            endpoints = vec![backend_config.base_url.clone()];
        }

        for fb in &fallback_backends {
            if !self.backends.contains_key(fb) {
                bail!("role '{}' references unknown fallback backend '{}'", role, fb);
            }
        }

        Ok(ResolvedRole {
            role: role.to_string(),
            model,
            backend,
            endpoints,
            tier: tier.unwrap_or(Tier::Fast),
            context_window: context_window.unwrap_or(8192),
            temperature,
            max_tokens: max_tokens.unwrap_or(4096),
            fallback_backends,
        })
    }
}

impl Default for LlmPolicyConfig {
    fn default() -> Self {
        let mut backends = BTreeMap::new();
        backends.insert(
            "ollama".to_string(),
            BackendConfig {
                protocol: BackendProtocol::Ollama,
                base_url: "http://localhost:11434".to_string(),
                api_key_env: None,
                endpoints: Vec::new(),
                request_timeout_ms: default_request_timeout_ms(),
            },
        );

        let mut roles = BTreeMap::new();
        roles.insert(
            "general".to_string(),
            RoleConfig {
                model: Some("llama3.1:8b".to_string()),
                tier: Some(Tier::Fast),
                context_window: Some(8192),
                ..Default::default()
            },
        );
        roles.insert(
            "very_fast".to_string(),
            RoleConfig {
                model: Some("llama3.2:1b".to_string()),
                tier: Some(Tier::VeryFast),
                context_window: Some(4096),
                ..Default::default()
            },
        );
        roles.insert(
            "triage".to_string(),
            RoleConfig {
                model: Some("llama3.2:1b".to_string()),
                tier: Some(Tier::VeryFast),
                ..Default::default()
            },
        );
        roles.insert(
            "overseer".to_string(),
            RoleConfig {
                model: Some("llama3.1:8b".to_string()),
                tier: Some(Tier::Medium),
                context_window: Some(16384),
                ..Default::default()
            },
        );
        roles.insert(
            "generator".to_string(),
            RoleConfig {
                model: Some("qwen2.5-coder:7b".to_string()),
                tier: Some(Tier::Medium),
                context_window: Some(16384),
                max_tokens: Some(8192),
                ..Default::default()
            },
        );
        roles.insert(
            "evaluator".to_string(),
            RoleConfig {
                model: Some("llama3.1:8b".to_string()),
                tier: Some(Tier::Fast),
                ..Default::default()
            },
        );
        roles.insert(
            "escalation".to_string(),
            RoleConfig {
                model: Some("qwen2.5-coder:32b".to_string()),
                tier: Some(Tier::Slow),
                context_window: Some(32768),
                max_tokens: Some(8192),
                ..Default::default()
            },
        );
        roles.insert(
            "god".to_string(),
            RoleConfig {
                model: Some("llama3.1:70b".to_string()),
                tier: Some(Tier::VerySlow),
                context_window: Some(32768),
                ..Default::default()
            },
        );
        roles.insert(
            "embedding".to_string(),
            RoleConfig {
                model: Some("nomic-embed-text".to_string()),
                tier: Some(Tier::VeryFast),
                ..Default::default()
            },
        );

        Self {
            backends,
            roles,
            categories: BTreeMap::new(),
            verify_backends: false,
            reserved_output_tokens: 2048,
        }
    }
}

/// Artifact memory settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub store: artifactstore::StoreConfig,
}

/// Sandbox runner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Interpreter argv prefix; the node source path is appended
    pub interpreter: Vec<String>,

    /// Where node directories live
    #[serde(rename = "nodes-dir")]
    pub nodes_dir: PathBuf,

    /// Default per-run wall-clock budget
    #[serde(rename = "default-timeout-ms")]
    pub default_timeout_ms: u64,

    /// RSS ceiling reported against, in megabytes
    #[serde(rename = "memory-limit-mb")]
    pub memory_limit_mb: u64,

    /// Peak-RSS sampling interval
    #[serde(rename = "sample-interval-ms")]
    pub sample_interval_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            interpreter: vec!["python3".to_string()],
            nodes_dir: PathBuf::from(".codevolve/nodes"),
            default_timeout_ms: 30_000,
            memory_limit_mb: 512,
            sample_interval_ms: 50,
        }
    }
}

/// Evaluator thresholds and the auto-adjustment policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    pub thresholds: Thresholds,

    /// Effective thresholds never adjust below this
    #[serde(rename = "threshold-floor")]
    pub threshold_floor: f64,

    /// Median must exceed the threshold by this margin before adjusting
    #[serde(rename = "adjustment-margin")]
    pub adjustment_margin: f64,

    /// New effective threshold = median * factor
    #[serde(rename = "adjustment-factor")]
    pub adjustment_factor: f64,

    /// Samples of one kind needed before any adjustment
    #[serde(rename = "min-samples")]
    pub min_samples: usize,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            threshold_floor: 0.3,
            adjustment_margin: 0.1,
            adjustment_factor: 0.9,
            min_samples: 100,
        }
    }
}

/// Workflow executor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Concurrent steps per level; None = CPU count
    #[serde(rename = "pool-size")]
    pub pool_size: Option<usize>,

    /// How often an invalid plan is re-requested with a stricter prompt
    #[serde(rename = "max-plan-retries")]
    pub max_plan_retries: u32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            pool_size: None,
            max_plan_retries: 1,
        }
    }
}

impl WorkflowConfig {
    /// Effective pool size
    pub fn effective_pool_size(&self) -> usize {
        self.pool_size.unwrap_or_else(|| {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        })
    }
}

/// Tool registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Specialist selection requires at least this similarity
    #[serde(rename = "min-similarity")]
    pub min_similarity: f64,

    /// Failures before deprecation is considered
    #[serde(rename = "deprecation-failure-threshold")]
    pub deprecation_failure_threshold: u64,

    /// Quality below this (with enough failures) deprecates the tool
    #[serde(rename = "deprecation-quality-threshold")]
    pub deprecation_quality_threshold: f64,

    /// The generic fallback's quality never drops below this
    #[serde(rename = "fallback-quality-floor")]
    pub fallback_quality_floor: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            min_similarity: 0.6,
            deprecation_failure_threshold: 5,
            deprecation_quality_threshold: 0.3,
            fallback_quality_floor: 0.2,
        }
    }
}
