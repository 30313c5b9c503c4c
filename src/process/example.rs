//! Reference process for the `example` CLI verb

use std::collections::HashMap;

use super::model::{Agent, Budget, Process, Settings, Step, Validation};

impl Process {
    /// A small two-agent research-then-build process demonstrating tools,
    /// budgets, dependencies, and validation.
    pub fn example() -> Self {
        let researcher = Agent {
            id: "researcher".to_string(),
            name: "Researcher".to_string(),
            persona: "A meticulous analyst who gathers context before anyone writes code".to_string(),
            description: "Collects workspace and web context for the builder".to_string(),
            skills: vec!["code search".to_string(), "summarization".to_string()],
            model: String::new(),
            priority: 100,
            depends_on: Vec::new(),
            config: HashMap::new(),
            budget: Budget {
                max_tokens: 200_000,
                token_warning: 150_000,
                alert_on_limit: true,
                ..Default::default()
            },
        };

        let builder = Agent {
            id: "builder".to_string(),
            name: "Builder".to_string(),
            persona: "A pragmatic engineer who ships small, tested changes".to_string(),
            description: "Implements the change described by the goal".to_string(),
            skills: vec!["implementation".to_string(), "testing".to_string()],
            model: String::new(),
            priority: 100,
            depends_on: vec!["researcher".to_string()],
            config: HashMap::new(),
            budget: Budget {
                max_tokens: 500_000,
                max_cost: 5.0,
                token_warning: 400_000,
                cost_warning: 4.0,
                alert_on_limit: true,
                stop_on_limit: true,
            },
        };

        let survey = Step {
            id: "survey".to_string(),
            name: "Survey the workspace".to_string(),
            description: "Build a picture of the project layout and the code relevant to the goal".to_string(),
            agent_id: "researcher".to_string(),
            input: [
                ("workspace_tree".to_string(), "true".to_string()),
                ("workspace_search".to_string(), "TODO".to_string()),
            ]
            .into(),
            tools: HashMap::new(),
            expected_output: "A summary of the relevant modules and open questions".to_string(),
            status: Default::default(),
            depends_on: Vec::new(),
            timeout: 0,
            retries: 0,
            attempts: 0,
            last_attempt_at: None,
            result: None,
            history: Vec::new(),
        };

        let implement = Step {
            id: "implement".to_string(),
            name: "Implement the change".to_string(),
            description: "Apply the change the goal describes, guided by the survey".to_string(),
            agent_id: "builder".to_string(),
            input: HashMap::new(),
            tools: [("llm_tools".to_string(), "true".to_string())].into(),
            expected_output: "Compiling code with passing tests".to_string(),
            status: Default::default(),
            depends_on: vec!["survey".to_string()],
            timeout: 600,
            retries: 2,
            attempts: 0,
            last_attempt_at: None,
            result: None,
            history: Vec::new(),
        };

        let verify = Step {
            id: "verify".to_string(),
            name: "Verify the result".to_string(),
            description: "Re-read the diff and confirm it satisfies the goal".to_string(),
            agent_id: "builder".to_string(),
            input: HashMap::new(),
            tools: HashMap::new(),
            expected_output: "A short verification report".to_string(),
            status: Default::default(),
            depends_on: vec!["implement".to_string()],
            timeout: 0,
            retries: 0,
            attempts: 0,
            last_attempt_at: None,
            result: None,
            history: Vec::new(),
        };

        Self {
            version: "1.0".to_string(),
            goal: "Add input validation to the public API".to_string(),
            description: "Example process: survey, implement, verify".to_string(),
            base_model: "claude-sonnet-4".to_string(),
            agents: vec![researcher, builder],
            steps: vec![survey, implement, verify],
            validation: Validation {
                build_command: "cargo build".to_string(),
                test_command: "cargo test".to_string(),
                lint_command: String::new(),
                custom_checks: vec!["!cargo clippy -- -D warnings".to_string()],
                required: false,
            },
            settings: Settings::default(),
        }
    }
}
