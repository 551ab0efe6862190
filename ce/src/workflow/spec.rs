//! Workflow specifications
//!
//! A workflow is a DAG of steps with explicit dependencies, parallel
//! groups, and input mappings from workflow inputs and prior step outputs.
//! Unknown JSON fields are ignored so specs stay forward-compatible.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Workflow validation and execution errors
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Invalid workflow: {0}")]
    Invalid(String),

    #[error("Circular dependency: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Step '{step}' references '{name}' which no dependency produces")]
    DanglingReference { step: String, name: String },

    #[error("Parallel group '{group}' spans steps with different dependencies")]
    GroupMismatch { group: String },

    #[error("Planner produced no valid workflow: {0}")]
    PlanInvalid(String),

    #[error("Planner unavailable: {0}")]
    Unavailable(String),

    #[error("Cancelled")]
    Cancelled,
}

/// What kind of work a step performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    LlmCall,
    CodeTool,
    SubWorkflow,
    ExistingTool,
}

/// Per-step retry policy; retry-as-is, never escalation
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// An optional step's failure does not fail the workflow
    pub optional: bool,
}

/// One step of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    pub kind: StepKind,

    /// Role name, node id, tool id, or workflow artifact id depending on kind
    pub tool_ref: String,

    /// parameter name -> workflow input or producing step's output name
    #[serde(default)]
    pub input_mapping: BTreeMap<String, String>,

    pub output_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,

    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

/// A validated-on-demand workflow DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub workflow_id: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    pub steps: Vec<Step>,
}

impl WorkflowSpec {
    /// Check every structural invariant: non-empty, unique ids, known
    /// dependencies, acyclic, produced references, consistent groups
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.steps.is_empty() {
            return Err(WorkflowError::Invalid("workflow has no steps".to_string()));
        }

        let mut by_id: HashMap<&str, &Step> = HashMap::new();
        for step in &self.steps {
            if by_id.insert(step.step_id.as_str(), step).is_some() {
                return Err(WorkflowError::Invalid(format!("duplicate step id '{}'", step.step_id)));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if !by_id.contains_key(dep.as_str()) {
                    return Err(WorkflowError::Invalid(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.step_id, dep
                    )));
                }
            }
        }

        self.check_acyclic(&by_id)?;
        self.check_references(&by_id)?;
        self.check_groups()?;
        Ok(())
    }

    /// DFS cycle detection over the dependency edges
    fn check_acyclic(&self, by_id: &HashMap<&str, &Step>) -> Result<(), WorkflowError> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut cycle_path = Vec::new();

        for step in &self.steps {
            if !visited.contains(step.step_id.as_str())
                && has_cycle_dfs(&step.step_id, by_id, &mut visited, &mut rec_stack, &mut cycle_path)
            {
                return Err(WorkflowError::Cycle(cycle_path));
            }
        }
        Ok(())
    }

    /// Every mapped name must be a workflow input or an output produced
    /// inside the step's dependency closure
    fn check_references(&self, by_id: &HashMap<&str, &Step>) -> Result<(), WorkflowError> {
        for step in &self.steps {
            let closure = self.dependency_closure(&step.step_id, by_id);
            let mut producible: HashSet<&str> = self.inputs.iter().map(|s| s.as_str()).collect();
            for dep_id in &closure {
                if let Some(dep) = by_id.get(dep_id.as_str()) {
                    producible.insert(dep.output_name.as_str());
                }
            }

            for source in step.input_mapping.values() {
                if !producible.contains(source.as_str()) {
                    return Err(WorkflowError::DanglingReference {
                        step: step.step_id.clone(),
                        name: source.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Steps sharing a parallel group must share their dependency closure
    fn check_groups(&self) -> Result<(), WorkflowError> {
        let by_id: HashMap<&str, &Step> = self.steps.iter().map(|s| (s.step_id.as_str(), s)).collect();
        let mut group_closures: HashMap<&str, HashSet<String>> = HashMap::new();

        for step in &self.steps {
            let Some(group) = &step.parallel_group else { continue };
            let closure = self.dependency_closure(&step.step_id, &by_id);
            match group_closures.get(group.as_str()) {
                None => {
                    group_closures.insert(group.as_str(), closure);
                }
                Some(existing) if *existing == closure => {}
                Some(_) => {
                    return Err(WorkflowError::GroupMismatch { group: group.clone() });
                }
            }
        }
        Ok(())
    }

    /// All transitive dependencies of a step (excluding the step itself)
    pub fn dependency_closure(&self, step_id: &str, by_id: &HashMap<&str, &Step>) -> HashSet<String> {
        let mut closure = HashSet::new();
        let mut stack: Vec<&str> = by_id
            .get(step_id)
            .map(|s| s.depends_on.iter().map(|d| d.as_str()).collect())
            .unwrap_or_default();

        while let Some(dep) = stack.pop() {
            if closure.insert(dep.to_string())
                && let Some(step) = by_id.get(dep)
            {
                stack.extend(step.depends_on.iter().map(|d| d.as_str()));
            }
        }
        closure
    }

    /// Group step indices into topological levels
    ///
    /// Every step in level k has all dependencies in levels < k, so a level
    /// can run concurrently once the previous levels finished.
    pub fn topological_levels(&self) -> Result<Vec<Vec<usize>>, WorkflowError> {
        self.validate()?;

        let index: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.step_id.as_str(), i))
            .collect();

        let mut level_of: Vec<Option<usize>> = vec![None; self.steps.len()];
        let mut remaining = self.steps.len();
        while remaining > 0 {
            let mut progressed = false;
            for (i, step) in self.steps.iter().enumerate() {
                if level_of[i].is_some() {
                    continue;
                }
                let deps_level = step
                    .depends_on
                    .iter()
                    .map(|d| level_of[index[d.as_str()]])
                    .collect::<Option<Vec<usize>>>();
                if let Some(levels) = deps_level {
                    level_of[i] = Some(levels.into_iter().max().map(|l| l + 1).unwrap_or(0));
                    remaining -= 1;
                    progressed = true;
                }
            }
            if !progressed {
                // validate() already rejected cycles, so this cannot happen
                return Err(WorkflowError::Invalid("unresolvable level assignment".to_string()));
            }
        }

        let max_level = level_of.iter().filter_map(|l| *l).max().unwrap_or(0);
        let mut levels = vec![Vec::new(); max_level + 1];
        for (i, level) in level_of.iter().enumerate() {
            if let Some(level) = level {
                levels[*level].push(i);
            }
        }
        Ok(levels)
    }
}

/// DFS helper for cycle detection
fn has_cycle_dfs<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, &'a Step>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    cycle_path: &mut Vec<String>,
) -> bool {
    visited.insert(node);
    rec_stack.insert(node);
    cycle_path.push(node.to_string());

    if let Some(step) = graph.get(node) {
        for dep in &step.depends_on {
            if !visited.contains(dep.as_str()) {
                if graph.contains_key(dep.as_str())
                    && has_cycle_dfs(dep.as_str(), graph, visited, rec_stack, cycle_path)
                {
                    return true;
                }
            } else if rec_stack.contains(dep.as_str()) {
                cycle_path.push(dep.clone());
                return true;
            }
        }
    }

    rec_stack.remove(node);
    cycle_path.pop();
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> Step {
        Step {
            step_id: id.to_string(),
            kind: StepKind::LlmCall,
            tool_ref: "general".to_string(),
            input_mapping: BTreeMap::new(),
            output_name: format!("{}_out", id),
            parallel_group: None,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            timeout_ms: None,
            retry_policy: RetryPolicy::default(),
        }
    }

    fn spec(steps: Vec<Step>) -> WorkflowSpec {
        WorkflowSpec {
            workflow_id: "wf-test".to_string(),
            inputs: vec!["task".to_string()],
            outputs: vec![],
            steps,
        }
    }

    #[test]
    fn test_valid_linear_chain() {
        let wf = spec(vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])]);
        wf.validate().unwrap();

        let levels = wf.topological_levels().unwrap();
        assert_eq!(levels, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn test_diamond_levels() {
        let wf = spec(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
        ]);
        let levels = wf.topological_levels().unwrap();
        assert_eq!(levels[0], vec![0]);
        assert_eq!(levels[1], vec![1, 2]);
        assert_eq!(levels[2], vec![3]);
    }

    #[test]
    fn test_empty_workflow_rejected() {
        let wf = spec(vec![]);
        assert!(matches!(wf.validate(), Err(WorkflowError::Invalid(_))));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let wf = spec(vec![step("a", &[]), step("a", &[])]);
        assert!(matches!(wf.validate(), Err(WorkflowError::Invalid(_))));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let wf = spec(vec![step("a", &["ghost"])]);
        assert!(matches!(wf.validate(), Err(WorkflowError::Invalid(_))));
    }

    #[test]
    fn test_cycle_rejected() {
        let wf = spec(vec![step("a", &["b"]), step("b", &["a"])]);
        assert!(matches!(wf.validate(), Err(WorkflowError::Cycle(_))));
    }

    #[test]
    fn test_dangling_input_reference_rejected() {
        let mut s = step("b", &[]);
        s.input_mapping.insert("text".to_string(), "a_out".to_string());
        // 'a' exists but 'b' does not depend on it
        let wf = spec(vec![step("a", &[]), s]);
        assert!(matches!(
            wf.validate(),
            Err(WorkflowError::DanglingReference { step, name }) if step == "b" && name == "a_out"
        ));
    }

    #[test]
    fn test_reference_through_closure_accepted() {
        let mut c = step("c", &["b"]);
        // a_out is produced two hops up the dependency chain
        c.input_mapping.insert("text".to_string(), "a_out".to_string());
        let wf = spec(vec![step("a", &[]), step("b", &["a"]), c]);
        wf.validate().unwrap();
    }

    #[test]
    fn test_workflow_input_reference_accepted() {
        let mut a = step("a", &[]);
        a.input_mapping.insert("text".to_string(), "task".to_string());
        let wf = spec(vec![a]);
        wf.validate().unwrap();
    }

    #[test]
    fn test_parallel_group_with_matching_deps() {
        let mut b = step("b", &["a"]);
        b.parallel_group = Some("translations".to_string());
        let mut c = step("c", &["a"]);
        c.parallel_group = Some("translations".to_string());
        let wf = spec(vec![step("a", &[]), b, c]);
        wf.validate().unwrap();
    }

    #[test]
    fn test_parallel_group_with_mismatched_deps_rejected() {
        let mut b = step("b", &["a"]);
        b.parallel_group = Some("g".to_string());
        let mut c = step("c", &[]);
        c.parallel_group = Some("g".to_string());
        let wf = spec(vec![step("a", &[]), b, c]);
        assert!(matches!(wf.validate(), Err(WorkflowError::GroupMismatch { .. })));
    }

    #[test]
    fn test_single_step_plan_is_legal() {
        let wf = spec(vec![step("only", &[])]);
        wf.validate().unwrap();
        assert_eq!(wf.topological_levels().unwrap(), vec![vec![0]]);
    }

    #[test]
    fn test_unknown_json_fields_ignored() {
        let raw = r#"{
            "workflow_id": "wf-x",
            "inputs": ["task"],
            "outputs": [],
            "future_field": {"ignored": true},
            "steps": [{
                "step_id": "a",
                "kind": "LLM_CALL",
                "tool_ref": "general",
                "output_name": "a_out",
                "mystery": 42
            }]
        }"#;
        let wf: WorkflowSpec = serde_json::from_str(raw).unwrap();
        assert_eq!(wf.steps.len(), 1);
        wf.validate().unwrap();
    }
}
