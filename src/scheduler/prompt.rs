//! Agent task prompt rendering
//!
//! Prompts are handlebars templates over the agent persona, the step, the
//! enriched input map, and the outputs of completed prerequisite steps.

use std::collections::BTreeMap;

use eyre::WrapErr;
use handlebars::Handlebars;
use serde_json::json;

use crate::process::{Agent, Step};

const TASK_TEMPLATE: &str = "\
You are {{agent.name}}: {{agent.persona}}
{{#if agent.skills}}Skills: {{agent.skills}}
{{/if}}
Overall goal: {{goal}}

## Task: {{step.name}}
{{step.description}}
{{#if dependencies}}

## Results from prerequisite steps
{{#each dependencies}}### {{this.name}}
{{this.outputs}}
{{/each}}{{/if}}
{{#if inputs}}

## Context
{{#each inputs}}### {{@key}}
{{this}}
{{/each}}{{/if}}
{{#if step.expected_output}}

## Expected output
{{step.expected_output}}
{{/if}}";

/// Output of one completed dependency step, for prompt inclusion
#[derive(Debug, Clone, serde::Serialize)]
pub struct DependencyOutput {
    pub name: String,
    pub outputs: String,
}

/// Renders agent task prompts
pub struct PromptBuilder {
    handlebars: Handlebars<'static>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(handlebars::no_escape);
        Self { handlebars }
    }

    /// Render the task prompt for one step
    pub fn build(
        &self,
        agent: &Agent,
        step: &Step,
        goal: &str,
        dependencies: &[DependencyOutput],
    ) -> eyre::Result<String> {
        // BTreeMap so context sections render in a stable order; empty
        // sections become null so the template drops their headers
        let inputs: BTreeMap<&str, &str> = step.input.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let inputs = if inputs.is_empty() {
            serde_json::Value::Null
        } else {
            json!(inputs)
        };
        let dependencies = if dependencies.is_empty() {
            serde_json::Value::Null
        } else {
            json!(dependencies)
        };

        let context = json!({
            "agent": {
                "name": agent.name,
                "persona": agent.persona,
                "skills": agent.skills.join(", "),
            },
            "goal": goal,
            "step": {
                "name": step.name,
                "description": step.description,
                "expected_output": step.expected_output,
            },
            "inputs": inputs,
            "dependencies": dependencies,
        });

        self.handlebars
            .render_template(TASK_TEMPLATE, &context)
            .wrap_err("failed to render task prompt")
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}
