//! Plan persistence with atomic writes and resume compatibility
//!
//! Saves go to `<path>.tmp` followed by an atomic rename, so a crash at any
//! point leaves either the previous state or no state file, never a torn
//! one. An advisory lock on `<path>.lock` keeps two engines from sharing a
//! state path.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::{EngineError, StateError};
use crate::plan::Plan;
use crate::process::Process;

/// File-backed plan store
pub struct StateStore {
    path: PathBuf,

    /// Held for the lifetime of the store; the lock releases on drop
    _lock: File,
}

impl StateStore {
    /// Default state file name inside a workspace
    pub const DEFAULT_FILE: &'static str = "state.json";

    /// Open a store at `path`, acquiring the advisory lock
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let lock_path = path.with_extension("json.lock");
        let lock = OpenOptions::new().create(true).write(true).open(&lock_path)?;
        lock.try_lock_exclusive().map_err(|_| StateError::Locked { path: path.clone() })?;

        Ok(Self { path, _lock: lock })
    }

    /// The state file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the backup copy
    pub fn backup_path(&self) -> PathBuf {
        let mut os = self.path.clone().into_os_string();
        os.push(".backup");
        PathBuf::from(os)
    }

    fn temp_path(&self) -> PathBuf {
        let mut os = self.path.clone().into_os_string();
        os.push(".tmp");
        PathBuf::from(os)
    }

    /// Persist the plan: write `<path>.tmp`, then rename atomically.
    ///
    /// The temp file is removed when any step fails.
    pub async fn save(&self, plan: &Plan) -> Result<(), StateError> {
        let json = serde_json::to_vec_pretty(plan).map_err(|e| StateError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        let tmp = self.temp_path();
        if let Err(e) = tokio::fs::write(&tmp, &json).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(path = %self.path.display(), bytes = json.len(), "State persisted");
        Ok(())
    }

    /// Load the plan from this store's path
    pub async fn load(&self) -> Result<Plan, StateError> {
        Self::load_from(&self.path).await
    }

    /// Load a plan from an arbitrary path
    pub async fn load_from(path: impl AsRef<Path>) -> Result<Plan, StateError> {
        let path = path.as_ref();
        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateError::NotFound { path: path.to_path_buf() });
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&bytes).map_err(|e| StateError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Copy the current state file to `<path>.backup`
    pub async fn backup(&self) -> Result<(), StateError> {
        tokio::fs::copy(&self.path, self.backup_path()).await?;
        Ok(())
    }

    /// Replace the state file with the backup
    pub async fn restore(&self) -> Result<(), StateError> {
        tokio::fs::rename(self.backup_path(), &self.path).await?;
        Ok(())
    }

    /// Age of the state file from its modification time
    pub fn age(&self) -> Result<Duration, StateError> {
        let modified = std::fs::metadata(&self.path)?.modified()?;
        Ok(modified.elapsed().unwrap_or(Duration::ZERO))
    }

    /// The resume guard: a saved plan may replace a fresh one only when it
    /// describes the same goal, base model, agents, and step structure as
    /// the loaded process. The first mismatch is named in the error.
    pub fn ensure_compatible(saved: &Plan, current: &Process) -> Result<(), EngineError> {
        if saved.goal != current.goal {
            return Err(EngineError::IncompatibleState(format!(
                "goal changed: saved '{}', current '{}'",
                saved.goal, current.goal
            )));
        }
        if saved.base_model != current.base_model {
            return Err(EngineError::IncompatibleState(format!(
                "base model changed: saved '{}', current '{}'",
                saved.base_model, current.base_model
            )));
        }

        if saved.agents.len() != current.agents.len() {
            return Err(EngineError::IncompatibleState(format!(
                "agent count changed: saved {}, current {}",
                saved.agents.len(),
                current.agents.len()
            )));
        }
        for agent in &current.agents {
            let Some(prev) = saved.agents.iter().find(|a| a.id == agent.id) else {
                return Err(EngineError::IncompatibleState(format!(
                    "agent '{}' missing from saved state",
                    agent.id
                )));
            };
            if prev.name != agent.name || prev.persona != agent.persona || prev.model != agent.model {
                return Err(EngineError::IncompatibleState(format!("agent '{}' changed", agent.id)));
            }
        }

        if saved.steps.len() != current.steps.len() {
            return Err(EngineError::IncompatibleState(format!(
                "step count changed: saved {}, current {}",
                saved.steps.len(),
                current.steps.len()
            )));
        }
        for step in &current.steps {
            let Some(prev) = saved.steps.iter().find(|s| s.id == step.id) else {
                return Err(EngineError::IncompatibleState(format!(
                    "step '{}' missing from saved state",
                    step.id
                )));
            };
            if prev.name != step.name || prev.agent_id != step.agent_id {
                return Err(EngineError::IncompatibleState(format!("step '{}' changed", step.id)));
            }
            let mut saved_deps = prev.depends_on.clone();
            let mut current_deps = step.depends_on.clone();
            saved_deps.sort();
            current_deps.sort();
            if saved_deps != current_deps {
                return Err(EngineError::IncompatibleState(format!(
                    "step '{}' dependencies changed",
                    step.id
                )));
            }
        }

        Ok(())
    }
}

/// Resolve the state path: explicit override or `<workspace>/state.json`
pub fn default_state_path(workspace: &Path, explicit: Option<&Path>) -> PathBuf {
    match explicit {
        Some(p) => p.to_path_buf(),
        None => workspace.join(StateStore::DEFAULT_FILE),
    }
}

impl Drop for StateStore {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self._lock) {
            warn!(error = %e, "Failed to release state lock");
        }
    }
}
