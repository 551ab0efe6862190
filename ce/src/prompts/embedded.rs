//! Embedded fallback prompts
//!
//! These are compiled into the binary and used when template files are not found.

/// System prompt for the overseer strategy call
pub const OVERSEER_SYSTEM: &str = r#"You are the overseer of a code generation system.

Given a user task and the tool selected to handle it, produce a short
strategy: what the generated program must do, what input it receives on
stdin, what JSON it must print on stdout, and what could go wrong.

Be concrete and brief (under 200 words). If the task naturally splits into
several independent pieces of work, say MULTI-STEP on its own line and list
the steps; otherwise say SINGLE-STEP.
"#;

/// Strategy request template
pub const OVERSEER_TASK: &str = r#"## Task

{{task}}

## Selected tool

{{tool_name}}: {{tool_description}}

Write the strategy now.
"#;

/// System prompt for code generation
pub const GENERATOR_SYSTEM: &str = r#"You write small, self-contained Python programs.

The program reads exactly one JSON object from standard input and writes
exactly one JSON object to standard output. Nothing else may be printed to
standard output. Diagnostics go to standard error.

Respond with a single JSON object and nothing else:

{"code": "<the full program source>", "description": "<one sentence>", "tags": ["<tag>", ...]}

Do not wrap the JSON in markdown fences. Do not add commentary.
"#;

/// Generation request template
pub const GENERATOR_TASK: &str = r#"## Task

{{task}}

## Strategy

{{strategy}}

Write the program now and respond with the JSON envelope.
"#;

/// System prompt for escalation repair attempts
pub const ESCALATION_SYSTEM: &str = r#"You repair a failing Python program.

The program must read one JSON object from standard input and write one
JSON object to standard output. Fix the error without changing what the
program is for.

Respond with a single JSON object and nothing else:

{"code": "<the full fixed source>", "fixes_applied": ["<short description>", ...], "analysis": "<one sentence on the root cause>"}

Do not wrap the JSON in markdown fences.
"#;

/// Repair request template
pub const ESCALATION_TASK: &str = r#"## Task

{{task}}

## Strategy

{{strategy}}

## Current code

{{code}}

## Last error

{{error}}

{{#if attempts}}
## Previous attempts

{{attempts}}
{{/if}}

{{#if inject_logging}}
Add debug trace lines to standard error at the entry and exit of every
function so the next failure is easier to localise.
{{/if}}

Produce the fixed program now and respond with the JSON envelope.
"#;

/// System prompt for workflow planning
pub const PLANNER_SYSTEM: &str = r#"You decompose a task into a workflow of steps.

Respond with a single JSON object and nothing else:

{
  "workflow_id": "<short-slug>",
  "inputs": ["<name>", ...],
  "outputs": ["<name>", ...],
  "steps": [
    {
      "step_id": "<short-slug>",
      "kind": "LLM_CALL" | "CODE_TOOL" | "SUB_WORKFLOW" | "EXISTING_TOOL",
      "tool_ref": "<role or tool id>",
      "input_mapping": {"<param>": "<workflow input or step output name>"},
      "output_name": "<name>",
      "parallel_group": "<group>" (optional),
      "depends_on": ["<step_id>", ...]
    }
  ]
}

Rules:
- Dependencies must form a DAG (no cycles).
- Every name used in an input_mapping must be a workflow input or the
  output_name of a step listed in depends_on (directly or transitively).
- Steps sharing a parallel_group must have identical dependencies.
- A single-step plan is legal when the task does not decompose.
- Do not wrap the JSON in markdown fences.
"#;

/// Planning request template
pub const PLANNER_TASK: &str = r#"## Task

{{task}}

{{#if strict}}
The previous plan was invalid: {{validation_error}}

Produce a corrected plan. Obey every rule exactly.
{{/if}}

Respond with the workflow JSON now.
"#;

/// System prompt for full code evaluation
pub const EVALUATE_CODE_SYSTEM: &str = r#"You grade a generated program against its task.

Score each dimension from 0.0 to 1.0: correctness, robustness, style,
tests. The overall score is your weighted judgement, correctness first.

Respond with a single JSON object and nothing else:

{"score": 0.0, "pass": true, "strengths": ["..."], "weaknesses": ["..."], "suggestions": ["..."]}

Do not wrap the JSON in markdown fences.
"#;

/// System prompt for full writing evaluation
pub const EVALUATE_WRITING_SYSTEM: &str = r#"You grade a piece of generated writing against its task.

Score each dimension from 0.0 to 1.0: clarity, accuracy, structure,
completeness. The overall score is your weighted judgement.

Respond with a single JSON object and nothing else:

{"score": 0.0, "pass": true, "strengths": ["..."], "weaknesses": ["..."], "suggestions": ["..."]}

Do not wrap the JSON in markdown fences.
"#;

/// Evaluation request template
pub const EVALUATE_TASK: &str = r#"## Task

{{task}}

## Produced artifact

{{content}}

{{#if execution}}
## Execution result

{{execution}}
{{/if}}

Grade it now and respond with the JSON verdict.
"#;

/// Triage prompt for runs the deterministic rules cannot classify
pub const TRIAGE_TASK: &str = r#"A generated program ran with exit code {{exit_code}}.

stdout:
{{stdout}}

stderr:
{{stderr}}

Did the run succeed? Answer with exactly one word: PASS or FAIL.
"#;

/// Get the embedded prompt by name
pub fn get_embedded(name: &str) -> Option<&'static str> {
    match name {
        "overseer-system" => Some(OVERSEER_SYSTEM),
        "overseer-task" => Some(OVERSEER_TASK),
        "generator-system" => Some(GENERATOR_SYSTEM),
        "generator-task" => Some(GENERATOR_TASK),
        "escalation-system" => Some(ESCALATION_SYSTEM),
        "escalation-task" => Some(ESCALATION_TASK),
        "planner-system" => Some(PLANNER_SYSTEM),
        "planner-task" => Some(PLANNER_TASK),
        "evaluate-code-system" => Some(EVALUATE_CODE_SYSTEM),
        "evaluate-writing-system" => Some(EVALUATE_WRITING_SYSTEM),
        "evaluate-task" => Some(EVALUATE_TASK),
        "triage-task" => Some(TRIAGE_TASK),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_embedded_known_names() {
        for name in [
            "overseer-system",
            "overseer-task",
            "generator-system",
            "generator-task",
            "escalation-system",
            "escalation-task",
            "planner-system",
            "planner-task",
            "evaluate-code-system",
            "evaluate-writing-system",
            "evaluate-task",
            "triage-task",
        ] {
            assert!(get_embedded(name).is_some(), "missing embedded prompt: {}", name);
        }
    }

    #[test]
    fn test_get_embedded_unknown() {
        assert!(get_embedded("nonexistent").is_none());
    }

    #[test]
    fn test_envelopes_are_fence_free() {
        // The generator contract forbids fenced output; the prompts must not
        // show fenced examples the model would imitate.
        assert!(!GENERATOR_SYSTEM.contains("```"));
        assert!(!ESCALATION_SYSTEM.contains("```"));
    }
}
