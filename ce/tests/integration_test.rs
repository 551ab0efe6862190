//! Integration tests for the generation daemon
//!
//! These drive the public API end to end with the in-process mock backend
//! and sh-based nodes, so the suite needs no network and no Python.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use artifactstore::{ArtifactKind, ArtifactStore, EmbedError, Embedder, LocalStore};
use codevolve::cancel::CancelToken;
use codevolve::config::{BackendConfig, BackendProtocol, Config, LlmPolicyConfig, RegistryConfig, RunnerConfig};
use codevolve::escalation::Escalator;
use codevolve::eval::{AdaptiveThresholds, Evaluator, Thresholds};
use codevolve::llm::backend::mock::MockBackend;
use codevolve::llm::{GenerateOptions, LlmBackend, Router};
use codevolve::memory::Memory;
use codevolve::pipeline::GenerationPipeline;
use codevolve::registry::{Tool, ToolRegistry};
use codevolve::runner::SandboxRunner;
use codevolve::workflow::{WorkflowExecutor, WorkflowPlanner};

struct WordEmbedder;

#[async_trait]
impl Embedder for WordEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        Ok(MockBackend::embed_text(64, text))
    }

    fn dimension(&self) -> usize {
        64
    }
}

fn mock_policy(endpoints: Vec<&str>) -> LlmPolicyConfig {
    let mut policy = LlmPolicyConfig::default();
    policy.backends.clear();
    policy.backends.insert(
        "mock".to_string(),
        BackendConfig {
            protocol: BackendProtocol::Ollama,
            base_url: endpoints.first().map(|s| s.to_string()).unwrap_or_else(|| "http://mock".to_string()),
            api_key_env: None,
            endpoints: endpoints.iter().map(|s| s.to_string()).collect(),
            request_timeout_ms: 600_000,
        },
    );
    for role in policy.roles.values_mut() {
        role.backend = Some("mock".to_string());
    }
    policy
}

struct Stack {
    pipeline: GenerationPipeline,
    registry: Arc<ToolRegistry>,
    memory: Arc<Memory>,
    runner: Arc<SandboxRunner>,
    mock: Arc<MockBackend>,
}

async fn stack(dir: &std::path::Path, responses: Vec<String>) -> Stack {
    let mock = Arc::new(MockBackend::new(responses));
    let mut backends: BTreeMap<String, Arc<dyn LlmBackend>> = BTreeMap::new();
    backends.insert("mock".to_string(), mock.clone() as Arc<dyn LlmBackend>);
    let router = Arc::new(Router::with_backends(
        mock_policy(vec!["http://mock"]),
        64,
        backends,
        CancelToken::new(),
    ));

    let store: Arc<dyn ArtifactStore> = Arc::new(LocalStore::open(dir.join("store"), 64, 0.3).unwrap());
    let memory = Arc::new(Memory::new(store, Arc::new(WordEmbedder), 0.3));
    let runner = Arc::new(SandboxRunner::new(RunnerConfig {
        interpreter: vec!["sh".to_string()],
        nodes_dir: dir.join("nodes"),
        default_timeout_ms: 5_000,
        memory_limit_mb: 512,
        sample_interval_ms: 20,
    }));
    let registry = Arc::new(ToolRegistry::new(
        memory.clone(),
        router.clone(),
        runner.clone(),
        RegistryConfig::default(),
    ));
    registry.bootstrap().await.unwrap();

    let thresholds = Arc::new(AdaptiveThresholds::new(Thresholds::default(), 0.3, 0.1, 0.9, 100));
    let evaluator = Arc::new(Evaluator::new(router.clone(), memory.clone(), thresholds));
    let escalator = Escalator::new(
        router.clone(),
        runner.clone(),
        evaluator.clone(),
        memory.clone(),
        true,
        CancelToken::new(),
    );
    let planner = WorkflowPlanner::new(router.clone(), 1);
    let executor = WorkflowExecutor::new(
        router.clone(),
        registry.clone(),
        runner.clone(),
        memory.clone(),
        4,
        CancelToken::new(),
    );
    let pipeline = GenerationPipeline::new(
        router,
        memory.clone(),
        registry.clone(),
        runner.clone(),
        evaluator,
        escalator,
        planner,
        executor,
        CancelToken::new(),
    );

    Stack {
        pipeline,
        registry,
        memory,
        runner,
        mock,
    }
}

const STRATEGY: &str = "SINGLE-STEP\nRead the integers, add them, print the sum as a JSON object.";
const GOOD_VERDICT: &str =
    r#"{"score": 0.9, "pass": true, "strengths": ["correct"], "weaknesses": [], "suggestions": []}"#;

fn envelope(code: &str, description: &str, tags: &[&str]) -> String {
    serde_json::json!({ "code": code, "description": description, "tags": tags }).to_string()
}

fn repair(code: &str, fix: &str) -> String {
    serde_json::json!({ "code": code, "fixes_applied": [fix], "analysis": "diagnosed from the error digest" }).to_string()
}

// =============================================================================
// Scenario: trivial math task end to end
// =============================================================================

#[tokio::test]
async fn test_trivial_math_task() {
    let dir = TempDir::new().unwrap();
    let s = stack(
        dir.path(),
        vec![
            STRATEGY.to_string(),
            envelope(
                "cat > /dev/null\necho '{\"result\":8}'",
                "adds two integers from stdin",
                &["math", "addition"],
            ),
            GOOD_VERDICT.to_string(),
        ],
    )
    .await;

    let result = s
        .pipeline
        .handle_with_input(
            "write a function that adds two integers from stdin and prints the sum as JSON",
            Some(r#"{"a":5,"b":3}"#),
        )
        .await
        .unwrap();

    assert!(result.success);
    assert!(result.score >= 0.7);

    // The node runs and honours the stdin/stdout contract
    let node_id = result.node_id.unwrap();
    let metrics = s.runner.run_node(&node_id, r#"{"a":5,"b":3}"#, None).await.unwrap();
    assert_eq!(metrics.exit_code, 0);
    assert_eq!(metrics.stdout.trim(), r#"{"result":8}"#);

    // A FUNCTION artifact landed with the envelope's tags
    let functions = s.memory.list(Some(ArtifactKind::Function), &[], 10).await.unwrap();
    assert_eq!(functions.len(), 1);
    assert!(
        functions[0].tags.contains("math")
            || functions[0].tags.contains("addition")
            || functions[0].tags.contains("arithmetic")
    );

    // And a PLAN artifact for the strategy
    let plans = s.memory.list(Some(ArtifactKind::Plan), &[], 10).await.unwrap();
    assert_eq!(plans.len(), 1);
}

// =============================================================================
// Scenario: generator answers raw code without the JSON envelope
// =============================================================================

#[tokio::test]
async fn test_parse_fallback_path() {
    let dir = TempDir::new().unwrap();
    let raw_code = "cat > /dev/null\necho '{\"result\":4}'";
    let s = stack(
        dir.path(),
        vec![STRATEGY.to_string(), raw_code.to_string(), GOOD_VERDICT.to_string()],
    )
    .await;

    let result = s
        .pipeline
        .handle_with_input("add two integers", Some(r#"{"a":2,"b":2}"#))
        .await
        .unwrap();

    assert!(result.success);
    assert!(result.parse_fallback);

    let functions = s.memory.list(Some(ArtifactKind::Function), &[], 10).await.unwrap();
    assert_eq!(functions[0].metadata["parse_fallback"], true);

    // The demoted code still executes correctly
    let metrics = s
        .runner
        .run_node(&result.node_id.unwrap(), r#"{"a":2,"b":2}"#, None)
        .await
        .unwrap();
    assert_eq!(metrics.stdout.trim(), r#"{"result":4}"#);
}

// =============================================================================
// Scenario: escalation repairs a failing candidate
// =============================================================================

#[tokio::test]
async fn test_escalation_repairs_failure() {
    let dir = TempDir::new().unwrap();
    let s = stack(
        dir.path(),
        vec![
            STRATEGY.to_string(),
            // First candidate crashes
            envelope("exit 1", "broken first try", &["math"]),
            // Attempt 1 still crashes, attempt 2 fixes it
            repair("exit 2", "changed the exit code"),
            repair("cat > /dev/null\necho '{\"result\":8}'", "actually print the result"),
            GOOD_VERDICT.to_string(),
        ],
    )
    .await;

    let result = s
        .pipeline
        .handle_with_input("add two integers", Some(r#"{"a":5,"b":3}"#))
        .await
        .unwrap();

    assert!(result.success);
    assert!(result.attempts.len() >= 2, "trajectory records both attempts");

    // Each later attempt saw the previous attempts' error digests
    let calls = s.mock.calls();
    let second_repair_prompt = &calls[3].prompt;
    assert!(second_repair_prompt.contains("attempt 1"));
    assert!(second_repair_prompt.contains("exit 2"));

    // The trajectory is retrievable as a PATTERN artifact
    let patterns = s.memory.list(Some(ArtifactKind::Pattern), &[], 10).await.unwrap();
    assert_eq!(patterns.len(), 1);
}

// =============================================================================
// Scenario: unrelated task selects the generic fallback
// =============================================================================

#[tokio::test]
async fn test_fallback_tool_path() {
    let dir = TempDir::new().unwrap();
    let s = stack(
        dir.path(),
        vec![
            STRATEGY.to_string(),
            envelope("cat > /dev/null\necho '{}'", "does the thing", &[]),
            GOOD_VERDICT.to_string(),
        ],
    )
    .await;

    // Registry holds the fallback plus one unrelated specialist
    s.registry
        .register(Tool::specialist(
            "haiku-writer",
            "writes haiku poetry about seasons",
            "general",
        ))
        .await
        .unwrap();

    let result = s
        .pipeline
        .handle_with_input("compute orbital mechanics trajectories", Some("{}"))
        .await
        .unwrap();

    assert!(result.used_fallback_tool, "the trajectory records the fallback selection");
    assert_eq!(result.tool_used, "generic");
}

// =============================================================================
// Round-robin fairness over the full router
// =============================================================================

#[tokio::test]
async fn test_round_robin_fairness_over_ten_calls() {
    let endpoints = vec!["http://a", "http://b", "http://c"];
    let mock = Arc::new(MockBackend::new(vec!["ok".to_string(); 10]));
    let mut backends: BTreeMap<String, Arc<dyn LlmBackend>> = BTreeMap::new();
    backends.insert("mock".to_string(), mock.clone() as Arc<dyn LlmBackend>);
    let router = Router::with_backends(mock_policy(endpoints.clone()), 64, backends, CancelToken::new());

    for _ in 0..10 {
        router.generate("general", "hi", &GenerateOptions::default()).await.unwrap();
    }

    // 10 calls over 3 endpoints: each used floor(10/3) or ceil(10/3) times
    let calls = mock.calls();
    for endpoint in endpoints {
        let used = calls.iter().filter(|c| c.endpoint == endpoint).count();
        assert!((3..=4).contains(&used), "endpoint {} used {} times", endpoint, used);
    }
}

// =============================================================================
// Configuration validation
// =============================================================================

#[test]
fn test_default_config_is_valid() {
    let config = Config::default();
    config.validate().expect("default config must validate");
}

#[test]
fn test_config_rejects_unknown_backend() {
    let mut config = Config::default();
    config
        .llm
        .roles
        .get_mut("generator")
        .unwrap()
        .backend = Some("no-such-backend".to_string());

    let err = config.validate().unwrap_err();
    assert!(format!("{:#}", err).contains("llm.roles.generator"));
}

// =============================================================================
// Memory reuse across the pipeline
// =============================================================================

#[tokio::test]
async fn test_artifacts_are_searchable_after_generation() {
    let dir = TempDir::new().unwrap();
    let s = stack(
        dir.path(),
        vec![
            STRATEGY.to_string(),
            envelope(
                "cat > /dev/null\necho '{\"result\":8}'",
                "adds two integers arithmetic",
                &["math"],
            ),
            GOOD_VERDICT.to_string(),
        ],
    )
    .await;

    s.pipeline
        .handle_with_input("adds two integers arithmetic", Some("{}"))
        .await
        .unwrap();

    let hits = s
        .memory
        .find("adds two integers", Some(ArtifactKind::Function), &[], 5, Some(0.2))
        .await
        .unwrap();
    assert!(!hits.is_empty(), "the stored function is retrievable by meaning");
}
