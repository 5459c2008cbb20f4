//! Prompts sent to the agent for sub-tasks.
//!
//! Templates embed the marker vocabulary so agent output round-trips through
//! the extractors.

use anyhow::Result;
use minijinja::{Environment, context};

use crate::core::markers::{
    EXECUTION_JSON_BEGIN, EXECUTION_JSON_END, PERSPECTIVES_JSON_BEGIN, PERSPECTIVES_JSON_END,
};

const PERSPECTIVES_TEMPLATE: &str = include_str!("prompts/perspectives.md");
const TEST_EXECUTION_TEMPLATE: &str = include_str!("prompts/test_execution.md");

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("perspectives", PERSPECTIVES_TEMPLATE)
            .expect("perspectives template should be valid");
        env.add_template("test_execution", TEST_EXECUTION_TEMPLATE)
            .expect("test_execution template should be valid");
        Self { env }
    }

    /// Prompt for the perspective sub-task; `target` is the main generation prompt.
    pub fn render_perspectives(&self, target: &str) -> Result<String> {
        let template = self.env.get_template("perspectives")?;
        let target = if target.trim().is_empty() {
            "(no target description was provided; inspect the workspace)"
        } else {
            target.trim()
        };
        let rendered = template.render(context! {
            json_begin => PERSPECTIVES_JSON_BEGIN,
            json_end => PERSPECTIVES_JSON_END,
            target => target,
        })?;
        Ok(rendered)
    }

    /// Constrained prompt for delegated test execution.
    pub fn render_test_execution(&self, command: &str) -> Result<String> {
        let template = self.env.get_template("test_execution")?;
        let rendered = template.render(context! {
            command => command.trim(),
            json_begin => EXECUTION_JSON_BEGIN,
            json_end => EXECUTION_JSON_END,
        })?;
        Ok(rendered)
    }
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}
