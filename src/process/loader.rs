//! Process loading, validation, and defaults
//!
//! Loading parses raw JSON, validates every invariant the scheduler later
//! relies on (unique IDs, referential integrity, acyclic step graph), and
//! applies defaults. A process that makes it past here cannot deadlock the
//! scheduler except through a bug.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use tracing::debug;

use crate::error::EngineError;

use super::model::{Process, Step};

impl Process {
    /// Load and validate a process from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::from_slice(&bytes)
    }

    /// Load and validate a process from raw JSON bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EngineError> {
        let mut process: Process =
            serde_json::from_slice(bytes).map_err(|e| EngineError::InvalidProcess(e.to_string()))?;

        process.apply_defaults();
        process.validate()?;

        debug!(
            goal = %process.goal,
            agents = process.agents.len(),
            steps = process.steps.len(),
            "Process loaded"
        );
        Ok(process)
    }

    /// Fill absent (zero-valued) fields with their defaults
    fn apply_defaults(&mut self) {
        if self.version.is_empty() {
            self.version = "1.0".to_string();
        }

        for agent in &mut self.agents {
            if agent.priority == 0 {
                agent.priority = 100;
            }
        }

        for step in &mut self.steps {
            if step.timeout == 0 {
                step.timeout = self.settings.step_timeout;
            }
            if step.retries == 0 {
                step.retries = self.settings.max_retries;
            }
        }
    }

    /// Check every load-time invariant, naming the offending field on failure
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.goal.trim().is_empty() {
            return Err(EngineError::InvalidProcess("goal must not be empty".into()));
        }
        if self.agents.is_empty() {
            return Err(EngineError::InvalidProcess("at least one agent is required".into()));
        }
        if self.steps.is_empty() {
            return Err(EngineError::InvalidProcess("at least one step is required".into()));
        }

        let mut agent_ids = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(EngineError::InvalidProcess(format!(
                    "agent '{}' has an empty id",
                    agent.name
                )));
            }
            if !agent_ids.insert(agent.id.as_str()) {
                return Err(EngineError::InvalidProcess(format!("duplicate agent id '{}'", agent.id)));
            }
        }
        for agent in &self.agents {
            for dep in &agent.depends_on {
                if dep == &agent.id {
                    return Err(EngineError::InvalidProcess(format!(
                        "agent '{}' depends on itself",
                        agent.id
                    )));
                }
                if !agent_ids.contains(dep.as_str()) {
                    return Err(EngineError::InvalidProcess(format!(
                        "agent '{}' depends on unknown agent '{}'",
                        agent.id, dep
                    )));
                }
            }
        }

        let mut step_ids = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(EngineError::InvalidProcess(format!("step '{}' has an empty id", step.name)));
            }
            if !step_ids.insert(step.id.as_str()) {
                return Err(EngineError::InvalidProcess(format!("duplicate step id '{}'", step.id)));
            }
            if !agent_ids.contains(step.agent_id.as_str()) {
                return Err(EngineError::InvalidProcess(format!(
                    "step '{}' references unknown agent '{}'",
                    step.id, step.agent_id
                )));
            }
        }
        for step in &self.steps {
            for dep in &step.depends_on {
                if dep == &step.id {
                    return Err(EngineError::InvalidProcess(format!("step '{}' depends on itself", step.id)));
                }
                if !step_ids.contains(dep.as_str()) {
                    return Err(EngineError::InvalidProcess(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    )));
                }
            }
        }

        if let Err(cycle) = check_step_cycles(&self.steps) {
            return Err(EngineError::InvalidProcess(format!(
                "circular step dependency: {}",
                cycle.join(" -> ")
            )));
        }

        Ok(())
    }
}

/// Detect cycles in the step dependency graph via DFS with a recursion stack.
///
/// Returns one offending cycle path on failure.
pub fn check_step_cycles(steps: &[Step]) -> Result<(), Vec<String>> {
    let graph: HashMap<&str, &Step> = steps.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    for id in graph.keys() {
        if !visited.contains(id) && cycle_dfs(id, &graph, &mut visited, &mut rec_stack, &mut path) {
            return Err(path);
        }
    }

    Ok(())
}

fn cycle_dfs<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, &'a Step>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    path: &mut Vec<String>,
) -> bool {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node.to_string());

    if let Some(step) = graph.get(node) {
        for dep in &step.depends_on {
            if !visited.contains(dep.as_str()) {
                if graph.contains_key(dep.as_str()) && cycle_dfs(dep.as_str(), graph, visited, rec_stack, path) {
                    return true;
                }
            } else if rec_stack.contains(dep.as_str()) {
                path.push(dep.clone());
                return true;
            }
        }
    }

    rec_stack.remove(node);
    path.pop();
    false
}
