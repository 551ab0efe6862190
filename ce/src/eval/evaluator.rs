//! Full quality evaluation
//!
//! One LLM call with a rubric chosen by artifact class (code vs writing),
//! returning a numeric score, a pass flag and structured feedback. When the
//! evaluator role is unavailable the verdict degrades to triage-only and is
//! marked low-confidence instead of failing the pipeline.

use std::sync::Arc;

use eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use artifactstore::{Artifact, ArtifactKind};

use super::thresholds::{AdaptiveThresholds, EvalKind};
use crate::llm::{GenerateOptions, Router};
use crate::memory::Memory;
use crate::pipeline::contract::parse_json_object;
use crate::prompts::PromptLoader;
use crate::runner::ExecutionMetrics;

/// Which rubric grades the artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactClass {
    Code,
    Writing,
}

/// A full evaluation verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub score: f64,
    pub pass: bool,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    /// Set when the evaluator role was unavailable and triage decided
    #[serde(default)]
    pub low_confidence: bool,
}

/// Grades artifacts and folds verdicts back into the memory
pub struct Evaluator {
    router: Arc<Router>,
    memory: Arc<Memory>,
    thresholds: Arc<AdaptiveThresholds>,
    prompts: PromptLoader,
}

impl Evaluator {
    pub fn new(router: Arc<Router>, memory: Arc<Memory>, thresholds: Arc<AdaptiveThresholds>) -> Self {
        Self {
            router,
            memory,
            thresholds,
            prompts: PromptLoader::embedded_only(),
        }
    }

    /// Thresholds currently in force
    pub fn thresholds(&self) -> &AdaptiveThresholds {
        &self.thresholds
    }

    /// Evaluate `content` against `task`
    ///
    /// `execution` feeds the rubric and the degraded path; `target_artifact_id`
    /// receives the quality update. A Final evaluation is itself recorded as
    /// an EVALUATION artifact.
    pub async fn evaluate(
        &self,
        kind: EvalKind,
        class: ArtifactClass,
        task: &str,
        content: &str,
        execution: Option<&ExecutionMetrics>,
        target_artifact_id: Option<&str>,
    ) -> Result<Evaluation> {
        let threshold = self.thresholds.threshold(kind);
        let evaluation = match self.ask_model(class, task, content, execution).await {
            Some(mut evaluation) => {
                evaluation.score = evaluation.score.clamp(0.0, 1.0);
                evaluation.pass = evaluation.pass && evaluation.score >= threshold;
                self.thresholds.record(kind, evaluation.score);
                evaluation
            }
            None => {
                // EvalUnavailable: triage verdict, marked low-confidence
                let passed = execution.map(|m| m.success).unwrap_or(false);
                Evaluation {
                    score: if passed { threshold } else { 0.0 },
                    pass: passed,
                    strengths: Vec::new(),
                    weaknesses: vec!["full evaluation unavailable".to_string()],
                    suggestions: Vec::new(),
                    low_confidence: true,
                }
            }
        };

        debug!(
            kind = %kind,
            score = evaluation.score,
            pass = evaluation.pass,
            low_confidence = evaluation.low_confidence,
            "Evaluation complete"
        );

        if kind == EvalKind::Final {
            let record = Artifact::new(
                ArtifactKind::Evaluation,
                format!("evaluation of {}", target_artifact_id.unwrap_or("candidate")),
                format!("score {:.2}, pass {}", evaluation.score, evaluation.pass),
                serde_json::to_string(&evaluation)?,
            )
            .with_meta("target", json!(target_artifact_id))
            .with_meta("kind", json!(kind.to_string()));
            if let Err(e) = self.memory.save(record).await {
                warn!(error = %e, "Failed to record evaluation artifact");
            }
        }

        if let Some(target) = target_artifact_id
            && let Err(e) = self.memory.update_quality(target, evaluation.score, evaluation.pass).await
        {
            warn!(target, error = %e, "Failed to update target quality");
        }

        Ok(evaluation)
    }

    /// One rubric call; None when the model is unavailable or unparseable
    async fn ask_model(
        &self,
        class: ArtifactClass,
        task: &str,
        content: &str,
        execution: Option<&ExecutionMetrics>,
    ) -> Option<Evaluation> {
        let system_name = match class {
            ArtifactClass::Code => "evaluate-code-system",
            ArtifactClass::Writing => "evaluate-writing-system",
        };
        let system = self.prompts.raw(system_name).ok()?;
        let prompt = self
            .prompts
            .render(
                "evaluate-task",
                &json!({
                    "task": task,
                    "content": content,
                    "execution": execution.map(|m| m.error_digest(500)),
                }),
            )
            .ok()?;

        let options = GenerateOptions::default().with_system_prompt(system);
        let response = match self.router.generate("evaluator", &prompt, &options).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Evaluator role unavailable");
                return None;
            }
        };

        let value = match parse_json_object(&response) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Evaluator response was not a JSON verdict");
                return None;
            }
        };

        Some(Evaluation {
            score: value.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0),
            pass: value.get("pass").and_then(|v| v.as_bool()).unwrap_or(false),
            strengths: string_list(value.get("strengths")),
            weaknesses: string_list(value.get("weaknesses")),
            suggestions: string_list(value.get("suggestions")),
            low_confidence: false,
        })
    }
}

fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use artifactstore::{ArtifactStore, EmbedError, Embedder, LocalStore};
    use async_trait::async_trait;
    use tempfile::tempdir;

    use crate::cancel::CancelToken;
    use crate::config::{BackendConfig, BackendProtocol, LlmPolicyConfig};
    use crate::eval::thresholds::Thresholds;
    use crate::llm::backend::mock::MockBackend;

    struct WordEmbedder;

    #[async_trait]
    impl Embedder for WordEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
            Ok(MockBackend::embed_text(16, text))
        }

        fn dimension(&self) -> usize {
            16
        }
    }

    fn mock_policy() -> LlmPolicyConfig {
        let mut policy = LlmPolicyConfig::default();
        policy.backends.clear();
        policy.backends.insert(
            "mock".to_string(),
            BackendConfig {
                protocol: BackendProtocol::Ollama,
                base_url: "http://mock".to_string(),
                api_key_env: None,
                endpoints: Vec::new(),
                request_timeout_ms: 600_000,
            },
        );
        for role in policy.roles.values_mut() {
            role.backend = Some("mock".to_string());
        }
        policy
    }

    fn harness(dir: &std::path::Path, responses: Vec<String>) -> (Evaluator, Arc<Memory>, Arc<MockBackend>) {
        let mock = Arc::new(MockBackend::new(responses));
        let mut backends: BTreeMap<String, Arc<dyn crate::llm::LlmBackend>> = BTreeMap::new();
        backends.insert("mock".to_string(), mock.clone() as Arc<dyn crate::llm::LlmBackend>);
        let router = Arc::new(crate::llm::Router::with_backends(
            mock_policy(),
            16,
            backends,
            CancelToken::new(),
        ));

        let store: Arc<dyn ArtifactStore> = Arc::new(LocalStore::open(dir, 16, 0.3).unwrap());
        let memory = Arc::new(Memory::new(store, Arc::new(WordEmbedder), 0.3));
        let thresholds = Arc::new(AdaptiveThresholds::new(Thresholds::default(), 0.3, 0.1, 0.9, 100));
        let evaluator = Evaluator::new(router, memory.clone(), thresholds);
        (evaluator, memory, mock)
    }

    #[tokio::test]
    async fn test_parses_verdict_and_applies_threshold() {
        let dir = tempdir().unwrap();
        let verdict = r#"{"score": 0.9, "pass": true, "strengths": ["works"], "weaknesses": [], "suggestions": []}"#;
        let (evaluator, _, _) = harness(dir.path(), vec![verdict.to_string()]);

        let evaluation = evaluator
            .evaluate(EvalKind::Code, ArtifactClass::Code, "task", "code", None, None)
            .await
            .unwrap();

        assert!(evaluation.pass);
        assert_eq!(evaluation.score, 0.9);
        assert_eq!(evaluation.strengths, vec!["works".to_string()]);
        assert!(!evaluation.low_confidence);
    }

    #[tokio::test]
    async fn test_model_pass_below_threshold_fails() {
        let dir = tempdir().unwrap();
        let verdict = r#"{"score": 0.5, "pass": true, "strengths": [], "weaknesses": [], "suggestions": []}"#;
        let (evaluator, _, _) = harness(dir.path(), vec![verdict.to_string()]);

        let evaluation = evaluator
            .evaluate(EvalKind::Code, ArtifactClass::Code, "task", "code", None, None)
            .await
            .unwrap();

        // Model said pass but 0.5 < 0.7 threshold
        assert!(!evaluation.pass);
    }

    #[tokio::test]
    async fn test_garbage_response_degrades_to_triage() {
        let dir = tempdir().unwrap();
        let (evaluator, _, _) = harness(dir.path(), vec!["utter nonsense".to_string()]);

        let good_run = ExecutionMetrics {
            exit_code: 0,
            success: true,
            stdout: "{}".to_string(),
            ..Default::default()
        };
        let evaluation = evaluator
            .evaluate(EvalKind::Code, ArtifactClass::Code, "task", "code", Some(&good_run), None)
            .await
            .unwrap();

        assert!(evaluation.pass, "clean run passes in degraded mode");
        assert!(evaluation.low_confidence);
    }

    #[tokio::test]
    async fn test_final_evaluation_records_artifact_and_quality() {
        let dir = tempdir().unwrap();
        let verdict = r#"{"score": 0.8, "pass": true, "strengths": [], "weaknesses": [], "suggestions": []}"#;
        let (evaluator, memory, _) = harness(dir.path(), vec![verdict.to_string()]);

        let target = memory
            .save(Artifact::new(ArtifactKind::Function, "adder", "adds", "code"))
            .await
            .unwrap();

        evaluator
            .evaluate(
                EvalKind::Final,
                ArtifactClass::Code,
                "task",
                "code",
                None,
                Some(&target.artifact_id),
            )
            .await
            .unwrap();

        let evaluations = memory.list(Some(ArtifactKind::Evaluation), &[], 10).await.unwrap();
        assert_eq!(evaluations.len(), 1);

        let updated = memory.get(&target.artifact_id).await.unwrap().unwrap();
        assert!(updated.quality_score > 0.5);
        assert_eq!(updated.usage_count, 1);
    }

    #[tokio::test]
    async fn test_writing_rubric_used_for_writing_class() {
        let dir = tempdir().unwrap();
        let verdict = r#"{"score": 0.9, "pass": true}"#;
        let (evaluator, _, mock) = harness(dir.path(), vec![verdict.to_string()]);

        evaluator
            .evaluate(EvalKind::Final, ArtifactClass::Writing, "write a joke", "the joke", None, None)
            .await
            .unwrap();

        let call = &mock.calls()[0];
        assert!(call.prompt.contains("clarity"), "writing rubric mentions clarity");
    }
}
