//! Prompt Loader
//!
//! Loads prompt templates from files or falls back to embedded defaults.

use std::path::{Path, PathBuf};

use eyre::{Result, eyre};
use handlebars::Handlebars;
use serde::Serialize;
use tracing::debug;

use super::embedded;

/// Loads and renders prompt templates
pub struct PromptLoader {
    hbs: Handlebars<'static>,
    /// User override directory (e.g. `.codevolve/prompts/`)
    user_dir: Option<PathBuf>,
    /// Repo default directory (e.g. `prompts/`)
    repo_dir: Option<PathBuf>,
}

impl PromptLoader {
    /// Create a loader rooted at the working directory
    ///
    /// # Arguments
    /// * `root` - Where to look for `.codevolve/prompts/` and `prompts/`
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let user_dir = root.join(".codevolve/prompts");
        let repo_dir = root.join("prompts");

        Self {
            hbs: plain_text_handlebars(),
            user_dir: if user_dir.exists() { Some(user_dir) } else { None },
            repo_dir: if repo_dir.exists() { Some(repo_dir) } else { None },
        }
    }

    /// Create a loader that only uses embedded prompts
    pub fn embedded_only() -> Self {
        Self {
            hbs: plain_text_handlebars(),
            user_dir: None,
            repo_dir: None,
        }
    }

    /// Load a template by name
    ///
    /// Checks in order:
    /// 1. User override: `.codevolve/prompts/{name}.pmt`
    /// 2. Repo default: `prompts/{name}.pmt`
    /// 3. Embedded fallback
    fn load_template(&self, name: &str) -> Result<String> {
        if let Some(ref user_dir) = self.user_dir {
            let path = user_dir.join(format!("{}.pmt", name));
            if path.exists() {
                debug!("Loading prompt from user override: {:?}", path);
                return std::fs::read_to_string(&path)
                    .map_err(|e| eyre!("Failed to read user prompt {}: {}", path.display(), e));
            }
        }

        if let Some(ref repo_dir) = self.repo_dir {
            let path = repo_dir.join(format!("{}.pmt", name));
            if path.exists() {
                debug!("Loading prompt from repo: {:?}", path);
                return std::fs::read_to_string(&path)
                    .map_err(|e| eyre!("Failed to read repo prompt {}: {}", path.display(), e));
            }
        }

        if let Some(content) = embedded::get_embedded(name) {
            debug!("Using embedded prompt: {}", name);
            return Ok(content.to_string());
        }

        Err(eyre!("Prompt template not found: {}", name))
    }

    /// Render a template with the given context
    pub fn render<T: Serialize>(&self, template_name: &str, context: &T) -> Result<String> {
        let template = self.load_template(template_name)?;
        self.hbs
            .render_template(&template, context)
            .map_err(|e| eyre!("Failed to render template {}: {}", template_name, e))
    }

    /// Load a template verbatim (for system prompts with no placeholders)
    pub fn raw(&self, template_name: &str) -> Result<String> {
        self.load_template(template_name)
    }
}

/// Prompts are plain text; HTML escaping would corrupt code and JSON
fn plain_text_handlebars() -> Handlebars<'static> {
    let mut hbs = Handlebars::new();
    hbs.register_escape_fn(handlebars::no_escape);
    hbs
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_render_embedded_with_context() {
        let loader = PromptLoader::embedded_only();
        let out = loader
            .render("overseer-task", &json!({"task": "add numbers", "tool_name": "generic", "tool_description": "any task"}))
            .unwrap();
        assert!(out.contains("add numbers"));
        assert!(out.contains("generic"));
    }

    #[test]
    fn test_raw_system_prompt() {
        let loader = PromptLoader::embedded_only();
        let out = loader.raw("generator-system").unwrap();
        assert!(out.contains("JSON object"));
    }

    #[test]
    fn test_user_override_wins() {
        let dir = tempdir().unwrap();
        let override_dir = dir.path().join(".codevolve/prompts");
        std::fs::create_dir_all(&override_dir).unwrap();
        std::fs::write(override_dir.join("generator-system.pmt"), "custom {{x}}").unwrap();

        let loader = PromptLoader::new(dir.path());
        let out = loader.render("generator-system", &json!({"x": "prompt"})).unwrap();
        assert_eq!(out, "custom prompt");
    }

    #[test]
    fn test_no_html_escaping_of_code() {
        let loader = PromptLoader::embedded_only();
        let out = loader
            .render(
                "escalation-task",
                &json!({
                    "task": "t", "strategy": "s",
                    "code": "print(\"a\" < 'b' && x)",
                    "error": "e", "attempts": "", "inject_logging": false
                }),
            )
            .unwrap();
        assert!(out.contains("print(\"a\" < 'b' && x)"), "got: {}", out);
        assert!(!out.contains("&quot;"));
        assert!(!out.contains("&lt;"));
    }

    #[test]
    fn test_unknown_template_errors() {
        let loader = PromptLoader::embedded_only();
        assert!(loader.raw("nope").is_err());
    }

    #[test]
    fn test_conditional_sections_render() {
        let loader = PromptLoader::embedded_only();
        let with = loader
            .render(
                "escalation-task",
                &json!({
                    "task": "t", "strategy": "s", "code": "c", "error": "e",
                    "attempts": "attempt log", "inject_logging": true
                }),
            )
            .unwrap();
        assert!(with.contains("Previous attempts"));
        assert!(with.contains("debug trace"));

        let without = loader
            .render(
                "escalation-task",
                &json!({"task": "t", "strategy": "s", "code": "c", "error": "e", "attempts": "", "inject_logging": false}),
            )
            .unwrap();
        assert!(!without.contains("Previous attempts"));
        assert!(!without.contains("debug trace"));
    }
}
