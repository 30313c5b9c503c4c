//! Engine error types and exit-code mapping

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the state store
#[derive(Debug, Error)]
pub enum StateError {
    #[error("No state file at {path}")]
    NotFound { path: PathBuf },

    #[error("State file at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("State path {path} is locked by another process")]
    Locked { path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced by the orchestration engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Schema or semantic error in the process definition. Fatal before
    /// execution begins.
    #[error("Invalid process: {0}")]
    InvalidProcess(String),

    /// Resume attempted against a changed process.
    #[error("Saved state is incompatible: {0}")]
    IncompatibleState(String),

    /// Pending steps exist but none are runnable.
    #[error("Deadlock: no runnable steps, still pending: {}", .pending.join(", "))]
    Deadlock { pending: Vec<String> },

    /// A step attempt exceeded its timeout.
    #[error("Step '{step}' timed out after {seconds}s")]
    StepTimeout { step: String, seconds: u64 },

    /// Failure returned by the external agent executor.
    #[error("Agent '{agent}' failed on step '{step}': {message}")]
    Agent {
        agent: String,
        step: String,
        message: String,
    },

    /// A hard budget limit was crossed with stop_on_limit set.
    #[error("Budget exceeded for agent '{agent}': {reason}")]
    BudgetExceeded { agent: String, reason: String },

    /// A blocking validation stage failed and validation is required.
    #[error("Validation failed: {}", .stages.join(", "))]
    ValidationFailed { stages: Vec<String> },

    /// External cancellation after state was persisted.
    #[error("Execution cancelled")]
    Cancelled,

    #[error(transparent)]
    State(#[from] StateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Process exit code for this error.
    ///
    /// 1 = execution failed (step or validation), 2 = invalid process,
    /// 3 = incompatible resume, 130 = cancelled.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidProcess(_) => 2,
            Self::IncompatibleState(_) => 3,
            Self::Cancelled => 130,
            _ => 1,
        }
    }
}
