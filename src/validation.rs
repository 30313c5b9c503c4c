//! Post-execution validation pipeline
//!
//! Runs the configured build, test, and lint commands, then the custom
//! checks, each through a shell. Exit code 0 passes. A custom check whose
//! trimmed command starts with `!` is non-blocking: its failure is logged
//! and never fails the pipeline.

use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::WrapErr;
use tracing::{info, warn};

use crate::process::Validation;

/// Outcome of one validation stage
#[derive(Debug, Clone)]
pub struct StageResult {
    pub name: String,
    pub command: String,

    /// Non-blocking stages log failures instead of failing validation
    pub blocking: bool,

    pub exit_code: i32,

    /// Combined stdout and stderr
    pub output: String,

    pub duration_ms: u64,
}

impl StageResult {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// All stage outcomes, in execution order
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub stages: Vec<StageResult>,
}

impl ValidationReport {
    /// Names of blocking stages that failed
    pub fn blocking_failures(&self) -> Vec<String> {
        self.stages
            .iter()
            .filter(|s| s.blocking && !s.passed())
            .map(|s| s.name.clone())
            .collect()
    }

    /// True when no blocking stage failed
    pub fn passed(&self) -> bool {
        self.blocking_failures().is_empty()
    }
}

/// Runs validation commands in a workspace
pub struct ValidationPipeline {
    workspace: PathBuf,
    stage_timeout: Duration,
}

impl ValidationPipeline {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            stage_timeout: Duration::from_secs(600),
        }
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    /// Run every configured stage in order: build, test, lint, customs.
    ///
    /// All stages run even after a failure so the report is complete.
    pub async fn run(&self, validation: &Validation) -> eyre::Result<ValidationReport> {
        let mut report = ValidationReport::default();

        let named = [
            ("build", &validation.build_command),
            ("test", &validation.test_command),
            ("lint", &validation.lint_command),
        ];
        for (name, command) in named {
            if command.is_empty() {
                continue;
            }
            report.stages.push(self.run_stage(name, command, true).await?);
        }

        for (i, check) in validation.custom_checks.iter().enumerate() {
            let trimmed = check.trim();
            if trimmed.is_empty() {
                continue;
            }
            let (blocking, command) = match trimmed.strip_prefix('!') {
                Some(rest) => (false, rest.trim()),
                None => (true, trimmed),
            };
            let name = format!("check-{}", i + 1);
            report.stages.push(self.run_stage(&name, command, blocking).await?);
        }

        for stage in &report.stages {
            if stage.passed() {
                info!(stage = %stage.name, "Validation stage passed");
            } else if stage.blocking {
                warn!(stage = %stage.name, exit_code = stage.exit_code, "Validation stage failed");
            } else {
                warn!(stage = %stage.name, exit_code = stage.exit_code, "Non-blocking check failed, ignoring");
            }
        }

        Ok(report)
    }

    async fn run_stage(&self, name: &str, command: &str, blocking: bool) -> eyre::Result<StageResult> {
        let start = std::time::Instant::now();

        let output = tokio::time::timeout(
            self.stage_timeout,
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(&self.workspace)
                .output(),
        )
        .await
        .map_err(|_| eyre::eyre!("validation stage '{name}' timed out after {:?}", self.stage_timeout))?
        .wrap_err_with(|| format!("failed to spawn validation stage '{name}'"))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }

        Ok(StageResult {
            name: name.to_string(),
            command: command.to_string(),
            blocking,
            exit_code: output.status.code().unwrap_or(-1),
            output: combined,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Convenience for callers that only need pass/fail against a workspace
pub async fn run_validation(validation: &Validation, workspace: &Path) -> eyre::Result<ValidationReport> {
    ValidationPipeline::new(workspace).run(validation).await
}
