//! Shared fixtures for unit tests

use std::collections::HashMap;

use crate::process::{Agent, Process, Step};

/// An agent with sensible defaults for tests
pub fn agent(id: &str) -> Agent {
    Agent {
        id: id.to_string(),
        name: format!("Agent {id}"),
        persona: "A careful engineer".to_string(),
        description: String::new(),
        skills: Vec::new(),
        model: String::new(),
        priority: 100,
        depends_on: Vec::new(),
        config: HashMap::new(),
        budget: Default::default(),
    }
}

/// A step bound to `agent_id` with the given dependencies
pub fn step(id: &str, agent_id: &str, depends_on: &[&str]) -> Step {
    Step {
        id: id.to_string(),
        name: format!("Step {id}"),
        description: format!("Do the work of {id}"),
        agent_id: agent_id.to_string(),
        input: HashMap::new(),
        tools: HashMap::new(),
        expected_output: String::new(),
        status: Default::default(),
        depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        timeout: 0,
        retries: 0,
        attempts: 0,
        last_attempt_at: None,
        result: None,
        history: Vec::new(),
    }
}

/// One agent, three steps in a chain: s1 <- s2 <- s3
pub fn linear_process() -> Process {
    Process {
        version: "1.0".to_string(),
        goal: "Ship the feature".to_string(),
        description: String::new(),
        base_model: "claude-sonnet-4".to_string(),
        agents: vec![agent("a1")],
        steps: vec![step("s1", "a1", &[]), step("s2", "a1", &["s1"]), step("s3", "a1", &["s2"])],
        validation: Default::default(),
        settings: Default::default(),
    }
}
