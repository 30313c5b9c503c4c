//! Mutable execution state
//!
//! A [`Plan`] is created from a [`Process`] when execution starts (or
//! restored from disk on resume) and mutated as steps run. It is the single
//! shared resource of the scheduler: all mutation happens through
//! [`Plan::update_step`] and the agent-status helpers while the scheduler
//! holds its lock.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::process::{Agent, Process, Step, StepStatus};

/// Overall plan status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// What an agent is currently doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentWorkStatus {
    #[default]
    Idle,
    Working,
    Completed,
    Failed,
}

impl std::fmt::Display for AgentWorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Working => write!(f, "working"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Runtime status of one agent
///
/// `token_usage` and `cost` are monotonically non-decreasing; only the
/// budget guard adds to them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub status: AgentWorkStatus,

    /// Step the agent is currently on, empty when idle
    #[serde(default)]
    pub current_step: String,

    /// Completion estimate 0..=100
    #[serde(default)]
    pub progress: u8,

    pub last_update: DateTime<Utc>,

    #[serde(default)]
    pub token_usage: u64,

    #[serde(default)]
    pub cost: f64,

    /// Set when a hard budget limit was crossed
    #[serde(default)]
    pub halted: bool,

    #[serde(default)]
    pub halt_reason: String,

    #[serde(default)]
    pub errors: Vec<String>,

    /// Last output produced by the agent
    #[serde(default)]
    pub output: String,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self {
            status: AgentWorkStatus::Idle,
            current_step: String::new(),
            progress: 0,
            last_update: Utc::now(),
            token_usage: 0,
            cost: 0.0,
            halted: false,
            halt_reason: String::new(),
            errors: Vec::new(),
            output: String::new(),
        }
    }
}

/// The mutable execution state of a process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,

    #[serde(default)]
    pub base_model: String,

    pub agents: Vec<Agent>,
    pub steps: Vec<Step>,

    /// ID of the most recently dispatched step
    #[serde(default)]
    pub current_step: String,

    #[serde(default)]
    pub status: PlanStatus,

    #[serde(default)]
    pub attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub agent_statuses: HashMap<String, AgentStatus>,

    #[serde(default)]
    pub total_tokens: u64,

    #[serde(default)]
    pub total_cost: f64,
}

impl Plan {
    /// Build a fresh plan from a validated process
    pub fn from_process(process: &Process) -> Self {
        let agent_statuses = process
            .agents
            .iter()
            .map(|a| (a.id.clone(), AgentStatus::default()))
            .collect();

        Self {
            goal: process.goal.clone(),
            base_model: process.base_model.clone(),
            agents: process.agents.clone(),
            steps: process.steps.clone(),
            current_step: String::new(),
            status: PlanStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            completed_at: None,
            agent_statuses,
            total_tokens: 0,
            total_cost: 0.0,
        }
    }

    /// Look up a step by ID
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Look up an agent by ID
    pub fn agent(&self, id: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.id == id)
    }

    /// Apply a mutation to a step, returning false when the ID is unknown
    pub fn update_step<F>(&mut self, id: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut Step),
    {
        match self.steps.iter_mut().find(|s| s.id == id) {
            Some(step) => {
                mutate(step);
                true
            }
            None => false,
        }
    }

    /// Status of every step, keyed by ID
    pub fn step_statuses(&self) -> HashMap<&str, StepStatus> {
        self.steps.iter().map(|s| (s.id.as_str(), s.status)).collect()
    }

    /// IDs of steps still pending
    pub fn pending_ids(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .map(|s| s.id.clone())
            .collect()
    }

    /// True when every step is completed or failed
    pub fn all_steps_terminal(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }

    /// True when every step completed successfully
    pub fn all_steps_completed(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Completed)
    }

    /// Number of completed steps
    pub fn completed_count(&self) -> usize {
        self.steps.iter().filter(|s| s.status == StepStatus::Completed).count()
    }

    /// Recompute plan aggregates as the sum over agent statuses
    pub fn recompute_totals(&mut self) {
        self.total_tokens = self.agent_statuses.values().map(|s| s.token_usage).sum();
        self.total_cost = self.agent_statuses.values().map(|s| s.cost).sum();
    }

    /// Update one agent's status fields and stamp the update time
    pub fn set_agent_status(&mut self, agent_id: &str, status: AgentWorkStatus, current_step: &str, progress: u8) {
        let entry = self.agent_statuses.entry(agent_id.to_string()).or_default();
        entry.status = status;
        entry.current_step = current_step.to_string();
        entry.progress = progress.min(100);
        entry.last_update = Utc::now();
    }
}
