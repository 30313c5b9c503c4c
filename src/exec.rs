//! External execution interfaces
//!
//! The engine never talks to an LLM or a VCS directly. It drives these
//! traits; the embedding binary (or a test) supplies the implementations.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use walkdir::WalkDir;

use crate::budget::TokenUsage;

/// Everything an executor needs to run one step for one agent
#[derive(Debug, Clone)]
pub struct AgentTask {
    pub agent_id: String,
    pub step_id: String,

    /// Resolved model for this agent
    pub model: String,

    /// Rendered task prompt
    pub prompt: String,

    /// Derived agent config (process defaults overlaid with agent overrides)
    pub config: HashMap<String, String>,
}

/// What came back from one agent run
#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    /// The agent's textual output
    pub output: String,

    /// Token usage, with category splits when the transport reports them
    pub usage: TokenUsage,
}

/// The LLM transport: runs a task to completion and reports usage
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn run(&self, task: &AgentTask) -> eyre::Result<AgentOutcome>;
}

/// Optional single-round-trip task refinement
///
/// When a step opts in via `tools.llm_tools`, the scheduler offers the
/// rendered prompt to the refiner once; the refined text replaces the
/// prompt. A refinement failure keeps the original.
#[async_trait]
pub trait TaskRefiner: Send + Sync {
    async fn refine(&self, task: &AgentTask) -> eyre::Result<String>;
}

/// Reports which files changed after a given instant
#[async_trait]
pub trait ChangeTracker: Send + Sync {
    async fn changed_files_since(&self, since: DateTime<Utc>) -> eyre::Result<Vec<PathBuf>>;
}

/// Executor that bridges agent tasks to an external command.
///
/// The command runs through `sh -c` with the rendered prompt on stdin and
/// the agent/step/model identifiers in the environment; whatever it prints
/// on stdout becomes the agent output. Token usage is estimated at four
/// characters per token since a generic command reports none.
pub struct CommandExecutor {
    command: String,
    workdir: PathBuf,
}

impl CommandExecutor {
    pub fn new(command: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl AgentExecutor for CommandExecutor {
    async fn run(&self, task: &AgentTask) -> eyre::Result<AgentOutcome> {
        use eyre::{WrapErr, bail};
        use tokio::io::AsyncWriteExt;

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("CONDUCTOR_AGENT_ID", &task.agent_id)
            .env("CONDUCTOR_STEP_ID", &task.step_id)
            .env("CONDUCTOR_MODEL", &task.model)
            .current_dir(&self.workdir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .wrap_err_with(|| format!("failed to spawn agent command '{}'", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(task.prompt.as_bytes())
                .await
                .wrap_err("failed to write prompt to agent command")?;
        }

        let output = child.wait_with_output().await.wrap_err("agent command failed")?;
        if !output.status.success() {
            bail!(
                "agent command exited with {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let text = String::from_utf8_lossy(&output.stdout).to_string();
        let tokens = ((task.prompt.len() + text.len()) / 4) as u64;

        Ok(AgentOutcome {
            output: text,
            usage: TokenUsage::total_only(tokens),
        })
    }
}

/// Tracker that reports nothing; for tests and change-agnostic setups
pub struct NoopChangeTracker;

#[async_trait]
impl ChangeTracker for NoopChangeTracker {
    async fn changed_files_since(&self, _since: DateTime<Utc>) -> eyre::Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }
}

/// Tracker that scans the workspace for files modified after the anchor.
///
/// Coarser than a VCS-backed tracker but needs no repository.
pub struct ScanChangeTracker {
    root: PathBuf,
}

impl ScanChangeTracker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ChangeTracker for ScanChangeTracker {
    async fn changed_files_since(&self, since: DateTime<Utc>) -> eyre::Result<Vec<PathBuf>> {
        let since: std::time::SystemTime = since.into();
        let root = self.root.clone();

        let mut changed = Vec::new();
        for entry in WalkDir::new(&root)
            .into_iter()
            .filter_entry(|e| {
                if e.depth() == 0 {
                    return true;
                }
                let name = e.file_name().to_string_lossy();
                !name.starts_with('.') && name != "target" && name != "node_modules"
            })
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let modified = entry.metadata().ok().and_then(|m| m.modified().ok());
            if let Some(modified) = modified
                && modified > since
            {
                let rel = entry.path().strip_prefix(&root).unwrap_or(entry.path());
                changed.push(rel.to_path_buf());
            }
        }

        debug!(count = changed.len(), "Change scan complete");
        changed.sort();
        Ok(changed)
    }
}
