//! Declarative process model
//!
//! A `Process` is the static definition loaded from JSON: the goal, the
//! agents that work toward it, the steps they execute, and the validation
//! that gates the result. It is immutable after load; all runtime state
//! lives in [`crate::plan::Plan`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::budget::TokenUsage;

/// A declarative multi-agent process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    /// Schema version, defaulted to "1.0"
    #[serde(default)]
    pub version: String,

    /// What the process is trying to achieve
    pub goal: String,

    /// Free-form description
    #[serde(default)]
    pub description: String,

    /// Model used when an agent does not name its own
    #[serde(default)]
    pub base_model: String,

    /// LLM-backed workers
    pub agents: Vec<Agent>,

    /// Units of work, each assigned to one agent
    pub steps: Vec<Step>,

    /// Post-execution validation commands
    #[serde(default)]
    pub validation: Validation,

    /// Engine settings
    #[serde(default)]
    pub settings: Settings,
}

/// An LLM-backed worker with a persona, skills, and an optional budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub persona: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub skills: Vec<String>,

    /// Model override; empty means inherit the process base model
    #[serde(default)]
    pub model: String,

    /// Scheduling priority, defaulted to 100
    #[serde(default)]
    pub priority: u32,

    /// IDs of agents this agent depends on
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Agent-specific config overrides (merged over the process config)
    #[serde(default)]
    pub config: HashMap<String, String>,

    /// Token/cost limits; zero-valued fields mean "no limit"
    #[serde(default)]
    pub budget: Budget,
}

/// Token and cost limits for a single agent
///
/// A zero value disables the corresponding limit. Warning thresholds fire
/// before the hard limits; `stop_on_limit` decides whether crossing a hard
/// limit halts the agent or merely warns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Budget {
    pub max_tokens: u64,
    pub max_cost: f64,
    pub token_warning: u64,
    pub cost_warning: f64,
    pub alert_on_limit: bool,
    pub stop_on_limit: bool,
}

impl Budget {
    /// True when no field constrains anything
    pub fn is_unlimited(&self) -> bool {
        self.max_tokens == 0 && self.max_cost == 0.0 && self.token_warning == 0 && self.cost_warning == 0.0
    }
}

/// Step lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl StepStatus {
    /// Terminal states are never left once entered
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A unit of work assigned to exactly one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// The agent that executes this step
    pub agent_id: String,

    /// Inputs handed to the agent; tool triggers are read from here first
    #[serde(default)]
    pub input: HashMap<String, String>,

    /// Tool trigger defaults, consulted after `input`
    #[serde(default)]
    pub tools: HashMap<String, String>,

    #[serde(default)]
    pub expected_output: String,

    #[serde(default)]
    pub status: StepStatus,

    /// IDs of steps that must complete before this one starts
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Per-step timeout in seconds; zero inherits `settings.step_timeout`
    #[serde(default)]
    pub timeout: u64,

    /// Retry count; zero inherits `settings.max_retries`
    #[serde(default)]
    pub retries: u32,

    /// Attempts consumed so far (runtime state, persisted for resume)
    #[serde(default)]
    pub attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StepResult>,

    /// One entry per attempt, oldest first
    #[serde(default)]
    pub history: Vec<StepAttempt>,
}

impl Step {
    /// Whether every listed dependency appears completed in `lookup`
    pub fn deps_satisfied(&self, lookup: &HashMap<&str, StepStatus>) -> bool {
        self.depends_on
            .iter()
            .all(|dep| lookup.get(dep.as_str()).is_some_and(|s| *s == StepStatus::Completed))
    }
}

/// Outcome status of a step result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failure,
}

/// The recorded outcome of a step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub status: ResultStatus,

    /// Named outputs, fed into the prompts of dependent steps
    #[serde(default)]
    pub output: HashMap<String, String>,

    /// Paths modified while the step ran
    #[serde(default)]
    pub files: Vec<String>,

    #[serde(default)]
    pub errors: Vec<String>,

    #[serde(default)]
    pub warnings: Vec<String>,

    /// Log lines produced during the step
    #[serde(default)]
    pub logs: Vec<String>,

    #[serde(default)]
    pub duration_s: f64,

    /// Per-category usage splits when the executor reports them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,

    /// Total tokens consumed by the step
    #[serde(default)]
    pub tokens: u64,

    /// Incremental cost of the step in USD
    #[serde(default)]
    pub cost: f64,
}

/// One step attempt, recorded in `Step::history`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepAttempt {
    /// Zero-based attempt index
    pub attempt: u32,
    pub status: ResultStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default)]
    pub files: Vec<String>,
}

/// Post-execution validation commands
///
/// Commands run in order: build, test, lint, then custom checks. A custom
/// check whose trimmed string begins with `!` is non-blocking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Validation {
    pub build_command: String,
    pub test_command: String,
    pub lint_command: String,
    pub custom_checks: Vec<String>,

    /// When true, a blocking validation failure fails the execution
    pub required: bool,
}

impl Validation {
    /// True when no command is configured
    pub fn is_empty(&self) -> bool {
        self.build_command.is_empty()
            && self.test_command.is_empty()
            && self.lint_command.is_empty()
            && self.custom_checks.is_empty()
    }
}

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub max_retries: u32,

    /// Default per-step timeout in seconds
    pub step_timeout: u64,

    pub parallel_execution: bool,
    pub stop_on_failure: bool,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            step_timeout: 300,
            parallel_execution: false,
            stop_on_failure: true,
            log_level: "info".to_string(),
        }
    }
}
