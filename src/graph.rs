//! Step dependency graph: runnable-set computation and topological order
//!
//! The loader has already rejected cycles and dangling references by the
//! time a graph is built, so the checks here are safety nets: the scheduler
//! consults [`DependencyGraph::runnable`] every iteration and falls back to
//! input order if Kahn's algorithm ever fails to drain.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::warn;

use crate::error::EngineError;
use crate::plan::Plan;
use crate::process::{Step, StepStatus, check_step_cycles};

/// Immutable view of the step dependency structure
pub struct DependencyGraph {
    /// Step IDs in input order
    ids: Vec<String>,

    /// step id -> its dependency ids
    deps: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Build the graph from a validated step list
    pub fn build(steps: &[Step]) -> Self {
        let ids = steps.iter().map(|s| s.id.clone()).collect();
        let deps = steps.iter().map(|s| (s.id.clone(), s.depends_on.clone())).collect();
        Self { ids, deps }
    }

    /// Steps that can be dispatched right now.
    ///
    /// A step is runnable when it is pending, every dependency is completed,
    /// and its agent has not been halted with `stop_on_limit`. The result is
    /// sorted ascending by step ID so dispatch order is deterministic.
    pub fn runnable(&self, plan: &Plan) -> Vec<String> {
        let statuses = plan.step_statuses();

        let mut out: Vec<String> = plan
            .steps
            .iter()
            .filter(|step| step.status == StepStatus::Pending)
            .filter(|step| step.deps_satisfied(&statuses))
            .filter(|step| !agent_blocked(plan, &step.agent_id))
            .map(|step| step.id.clone())
            .collect();

        out.sort();
        out
    }

    /// Dependency-respecting step order via Kahn's algorithm.
    ///
    /// Cycles cannot occur after loader validation; if one slips through,
    /// this warns and returns the input order rather than dropping steps.
    pub fn topological_order<'a>(&self, steps: &'a [Step]) -> Vec<&'a Step> {
        let by_id: HashMap<&str, &Step> = steps.iter().map(|s| (s.id.as_str(), s)).collect();

        // dep -> dependents, plus in-degree per step
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut in_degree: HashMap<&str, usize> = steps.iter().map(|s| (s.id.as_str(), 0)).collect();
        for step in steps {
            for dep in &step.depends_on {
                if by_id.contains_key(dep.as_str()) {
                    dependents.entry(dep.as_str()).or_default().push(step.id.as_str());
                    *in_degree.entry(step.id.as_str()).or_insert(0) += 1;
                }
            }
        }

        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        ready.sort();
        let mut queue: VecDeque<&str> = ready.into();

        let mut order = Vec::with_capacity(steps.len());
        while let Some(id) = queue.pop_front() {
            if let Some(step) = by_id.get(id) {
                order.push(*step);
            }
            let mut unlocked = Vec::new();
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        unlocked.push(*dependent);
                    }
                }
            }
            unlocked.sort();
            queue.extend(unlocked);
        }

        if order.len() != steps.len() {
            warn!(
                ordered = order.len(),
                total = steps.len(),
                "Step graph did not drain (cycle survived validation), using input order"
            );
            return steps.iter().collect();
        }

        order
    }

    /// Re-check referential integrity and acyclicity against a plan
    pub fn validate(&self, plan: &Plan) -> Result<(), EngineError> {
        let known: HashSet<&str> = self.ids.iter().map(|s| s.as_str()).collect();

        for step in &plan.steps {
            if !known.contains(step.id.as_str()) {
                return Err(EngineError::InvalidProcess(format!(
                    "step '{}' is not part of the dependency graph",
                    step.id
                )));
            }
            for dep in step.depends_on.iter().chain(self.deps.get(&step.id).into_iter().flatten()) {
                if !known.contains(dep.as_str()) {
                    return Err(EngineError::InvalidProcess(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    )));
                }
            }
        }

        check_step_cycles(&plan.steps).map_err(|cycle| {
            EngineError::InvalidProcess(format!("circular step dependency: {}", cycle.join(" -> ")))
        })
    }
}

/// True when the step's agent has been halted and its budget stops dispatch
fn agent_blocked(plan: &Plan, agent_id: &str) -> bool {
    let halted = plan.agent_statuses.get(agent_id).is_some_and(|s| s.halted);
    let stops = plan.agent(agent_id).is_some_and(|a| a.budget.stop_on_limit);
    halted && stops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::StepStatus;
    use crate::testutil::{linear_process, step};

    #[test]
    fn test_runnable_initial() {
        let process = linear_process();
        let graph = DependencyGraph::build(&process.steps);
        let plan = Plan::from_process(&process);

        assert_eq!(graph.runnable(&plan), vec!["s1"]);
    }

    #[test]
    fn test_runnable_unlocks_after_completion() {
        let process = linear_process();
        let graph = DependencyGraph::build(&process.steps);
        let mut plan = Plan::from_process(&process);

        plan.update_step("s1", |s| s.status = StepStatus::Completed);
        assert_eq!(graph.runnable(&plan), vec!["s2"]);
    }

    #[test]
    fn test_runnable_is_sorted() {
        let mut process = linear_process();
        process.steps = vec![step("s9", "a1", &[]), step("s1", "a1", &[]), step("s5", "a1", &[])];
        let graph = DependencyGraph::build(&process.steps);
        let plan = Plan::from_process(&process);

        assert_eq!(graph.runnable(&plan), vec!["s1", "s5", "s9"]);
    }

    #[test]
    fn test_runnable_excludes_halted_agent_with_stop_on_limit() {
        let mut process = linear_process();
        process.agents[0].budget.stop_on_limit = true;
        let graph = DependencyGraph::build(&process.steps);
        let mut plan = Plan::from_process(&process);

        plan.agent_statuses.get_mut("a1").unwrap().halted = true;
        assert!(graph.runnable(&plan).is_empty());
    }

    #[test]
    fn test_runnable_keeps_halted_agent_without_stop_on_limit() {
        let process = linear_process();
        let graph = DependencyGraph::build(&process.steps);
        let mut plan = Plan::from_process(&process);

        plan.agent_statuses.get_mut("a1").unwrap().halted = true;
        assert_eq!(graph.runnable(&plan), vec!["s1"]);
    }

    #[test]
    fn test_runnable_failed_dep_blocks_dependent() {
        let process = linear_process();
        let graph = DependencyGraph::build(&process.steps);
        let mut plan = Plan::from_process(&process);

        plan.update_step("s1", |s| s.status = StepStatus::Failed);
        assert!(graph.runnable(&plan).is_empty());
    }

    #[test]
    fn test_topological_order_linear() {
        let process = linear_process();
        let graph = DependencyGraph::build(&process.steps);

        let order: Vec<&str> = graph
            .topological_order(&process.steps)
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(order, vec!["s1", "s2", "s3"]);
    }

    #[test]
    fn test_topological_order_diamond() {
        let steps = vec![
            step("d", "a1", &["b", "c"]),
            step("b", "a1", &["a"]),
            step("c", "a1", &["a"]),
            step("a", "a1", &[]),
        ];
        let graph = DependencyGraph::build(&steps);

        let order: Vec<&str> = graph.topological_order(&steps).iter().map(|s| s.id.as_str()).collect();
        let pos = |id: &str| order.iter().position(|s| *s == id).unwrap();

        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }

    #[test]
    fn test_topological_order_cycle_falls_back_to_input() {
        let steps = vec![step("x", "a1", &["y"]), step("y", "a1", &["x"])];
        let graph = DependencyGraph::build(&steps);

        let order: Vec<&str> = graph.topological_order(&steps).iter().map(|s| s.id.as_str()).collect();
        assert_eq!(order, vec!["x", "y"]);
    }

    #[test]
    fn test_validate_catches_dangling_ref() {
        let process = linear_process();
        let graph = DependencyGraph::build(&process.steps);
        let mut plan = Plan::from_process(&process);

        plan.steps[2].depends_on = vec!["ghost".to_string()];
        assert!(graph.validate(&plan).is_err());
    }

    #[test]
    fn test_validate_ok() {
        let process = linear_process();
        let graph = DependencyGraph::build(&process.steps);
        let plan = Plan::from_process(&process);

        assert!(graph.validate(&plan).is_ok());
    }
}
