//! Daemon assembly
//!
//! Builds the full component graph from a validated configuration: router,
//! memory, registry, runner, evaluator, escalator, workflow engine, and the
//! generation pipeline, all sharing one cancellation token.

use std::sync::Arc;

use eyre::{Context, Result};
use tracing::info;

use artifactstore::{ArtifactStore, Embedder, LocalStore, RemoteStore};

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::escalation::Escalator;
use crate::eval::{AdaptiveThresholds, Evaluator};
use crate::llm::Router;
use crate::memory::Memory;
use crate::pipeline::GenerationPipeline;
use crate::registry::ToolRegistry;
use crate::runner::SandboxRunner;
use crate::workflow::{WorkflowExecutor, WorkflowPlanner};

/// The assembled daemon
pub struct App {
    pub config: Config,
    pub router: Arc<Router>,
    pub memory: Arc<Memory>,
    pub registry: Arc<ToolRegistry>,
    pub runner: Arc<SandboxRunner>,
    pub pipeline: GenerationPipeline,
    pub cancel: CancelToken,
}

impl App {
    /// Validate the configuration and wire every component
    pub async fn build(config: Config) -> Result<Self> {
        config.validate().context("Configuration rejected")?;

        let cancel = CancelToken::new();
        let dimension = config.memory.store.dimension;
        let router = Arc::new(Router::new(config.llm.clone(), dimension, cancel.clone())?);

        if config.llm.verify_backends {
            router
                .verify_backends()
                .await
                .context("Backend verification failed")?;
            info!("All backends verified");
        }

        let store: Arc<dyn ArtifactStore> = match config.memory.store.backend {
            artifactstore::config::BackendKind::Local => Arc::new(
                LocalStore::open(
                    &config.memory.store.path,
                    dimension,
                    config.memory.store.ema_alpha,
                )
                .context("Failed to open local artifact store")?,
            ),
            artifactstore::config::BackendKind::Remote => Arc::new(
                RemoteStore::connect(
                    config.memory.store.remote.clone(),
                    dimension,
                    config.memory.store.ema_alpha,
                )
                .await
                .context("Failed to connect to remote artifact store")?,
            ),
        };

        let embedder: Arc<dyn Embedder> = router.clone();
        let memory = Arc::new(Memory::new(store, embedder, config.memory.store.min_similarity));

        let runner = Arc::new(SandboxRunner::new(config.runner.clone()));
        let registry = Arc::new(ToolRegistry::new(
            memory.clone(),
            router.clone(),
            runner.clone(),
            config.registry.clone(),
        ));
        registry.bootstrap().await?;

        let thresholds = Arc::new(AdaptiveThresholds::new(
            config.evaluator.thresholds.clone(),
            config.evaluator.threshold_floor,
            config.evaluator.adjustment_margin,
            config.evaluator.adjustment_factor,
            config.evaluator.min_samples,
        ));
        let evaluator = Arc::new(Evaluator::new(router.clone(), memory.clone(), thresholds));

        let escalator = Escalator::new(
            router.clone(),
            runner.clone(),
            evaluator.clone(),
            memory.clone(),
            true,
            cancel.clone(),
        );
        let planner = WorkflowPlanner::new(router.clone(), config.workflow.max_plan_retries);
        let executor = WorkflowExecutor::new(
            router.clone(),
            registry.clone(),
            runner.clone(),
            memory.clone(),
            config.workflow.effective_pool_size(),
            cancel.clone(),
        );

        let pipeline = GenerationPipeline::new(
            router.clone(),
            memory.clone(),
            registry.clone(),
            runner.clone(),
            evaluator,
            escalator,
            planner,
            executor,
            cancel.clone(),
        );

        info!("Daemon assembled");
        Ok(Self {
            config,
            router,
            memory,
            registry,
            runner,
            pipeline,
            cancel,
        })
    }
}
