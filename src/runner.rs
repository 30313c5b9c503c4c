//! Per-agent derived configuration and log tailing
//!
//! Each agent gets a config derived once at init: the process-level
//! defaults shallow-copied, the agent's own entries overlaid, and the
//! model keys resolved. Status transitions never happen here; the
//! scheduler owns the plan and its lock.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::budget::ModelSet;
use crate::process::Agent;
use crate::tools::is_truthy;

/// Derived, immutable per-agent execution config
#[derive(Debug, Clone)]
pub struct AgentRunner {
    pub agent_id: String,

    /// Process defaults overlaid with agent-specific overrides
    pub config: HashMap<String, String>,

    /// Resolved primary model for the agent
    pub model: String,

    /// Models each cost category bills against
    pub models: ModelSet,
}

impl AgentRunner {
    /// Derive the runner for one agent.
    ///
    /// Model precedence: `agent.model` > `base_model` > `default_model`.
    /// `edit_model`/`orchestration_model` config keys override the billing
    /// models; `skip_prompt` forces non-interactive tools for this agent.
    pub fn derive(agent: &Agent, defaults: &HashMap<String, String>, base_model: &str, default_model: &str) -> Self {
        let mut config = defaults.clone();
        for (key, value) in &agent.config {
            config.insert(key.clone(), value.clone());
        }

        let model = if !agent.model.is_empty() {
            agent.model.clone()
        } else if !base_model.is_empty() {
            base_model.to_string()
        } else {
            default_model.to_string()
        };

        let edit_model = config.get("edit_model").cloned().unwrap_or_else(|| model.clone());
        let orchestration_model = config
            .get("orchestration_model")
            .cloned()
            .unwrap_or_else(|| model.clone());

        Self {
            agent_id: agent.id.clone(),
            config,
            model,
            models: ModelSet {
                edit_model,
                orchestration_model,
            },
        }
    }

    /// Whether this agent's tools must not prompt the user
    pub fn skip_prompt(&self) -> bool {
        self.config.get("skip_prompt").is_some_and(|v| is_truthy(v))
    }

    /// Whether this agent requests stop-on-failure regardless of settings
    pub fn stop_on_failure(&self) -> bool {
        self.config.get("stop_on_failure").is_some_and(|v| v == "true")
    }
}

/// Byte-offset anchor into a log file
///
/// Capture an anchor before an agent runs, then ask for the lines appended
/// since; those lines become the step result's logs.
#[derive(Debug, Clone)]
pub struct LogTail {
    path: PathBuf,
    offset: u64,
}

impl LogTail {
    /// Anchor at the current end of the file (0 when it does not exist yet)
    pub fn anchor(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let offset = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Self { path, offset }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines appended to the file after the anchor was taken
    pub fn lines_since(&self) -> Vec<String> {
        let Ok(mut file) = std::fs::File::open(&self.path) else {
            return Vec::new();
        };
        if file.seek(SeekFrom::Start(self.offset)).is_err() {
            return Vec::new();
        }

        let mut buf = String::new();
        if file.read_to_string(&mut buf).is_err() {
            return Vec::new();
        }

        buf.lines().map(|l| l.to_string()).collect()
    }
}
