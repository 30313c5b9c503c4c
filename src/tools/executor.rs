//! Step-input enrichment
//!
//! Before a step is handed to its agent, recognized tool triggers in the
//! step's input (and the tools map, which acts as defaults) are executed
//! and their outputs written back into the input map. Tool failures are
//! logged and skipped; enrichment never fails a step.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::process::Step;

use super::request::ToolRequest;
use super::workspace::Workspace;
use super::ExecutionMode;

/// Deterministic tool dispatcher used by the scheduler
pub struct ToolExecutor {
    workspace: Arc<dyn Workspace>,

    /// When false, enrichment is a no-op
    enabled: bool,
}

impl ToolExecutor {
    pub fn new(workspace: Arc<dyn Workspace>, enabled: bool) -> Self {
        Self { workspace, enabled }
    }

    /// Execute every trigger found on the step and write outputs into
    /// `step.input`. Triggers from `input` win over the `tools` defaults;
    /// an output key that is already populated is left alone.
    pub async fn enrich(&self, step: &mut Step, mode: ExecutionMode) {
        if !self.enabled {
            debug!(step_id = %step.id, "Code tools disabled, skipping enrichment");
            return;
        }

        for request in collect_requests(step) {
            let output_key = request.output_key();
            if step.input.contains_key(output_key) {
                continue;
            }

            match self.execute(&request, mode).await {
                Ok(content) => {
                    debug!(step_id = %step.id, tool = request.name(), chars = content.len(), "Tool output attached");
                    step.input.insert(output_key.to_string(), content);
                }
                Err(e) => {
                    warn!(step_id = %step.id, tool = request.name(), error = %e, "Tool failed, continuing without it");
                }
            }
        }
    }

    async fn execute(&self, request: &ToolRequest, mode: ExecutionMode) -> eyre::Result<String> {
        match request {
            ToolRequest::WorkspaceTree => self.workspace.tree().await,
            ToolRequest::WorkspaceSummary => self.workspace.summary().await,
            ToolRequest::WorkspaceSearch { query } => self.workspace.keyword_search(query).await,
            ToolRequest::WorkspaceEmbeddings { query } => self.workspace.embedding_search(query).await,
            ToolRequest::WebSearch { query } => self.workspace.web_search(query).await,
            ToolRequest::ReadFile { path } => self.workspace.read_file(path).await,
            ToolRequest::RunShell { command } => self.workspace.run_shell(command).await,
            ToolRequest::AskUser { question } => self.workspace.ask_user(question, mode).await,
        }
    }
}

/// Triggers in deterministic order: input entries first, then tools-map
/// defaults, each sorted by key; duplicates resolve to the first seen.
fn collect_requests(step: &Step) -> Vec<ToolRequest> {
    let mut requests: Vec<ToolRequest> = Vec::new();

    for map in [&step.input, &step.tools] {
        let mut entries: Vec<(&String, &String)> = map.iter().collect();
        entries.sort_by_key(|(k, _)| k.as_str());
        for (key, value) in entries {
            if let Some(request) = ToolRequest::from_entry(key, value)
                && !requests.iter().any(|r| r.output_key() == request.output_key())
            {
                requests.push(request);
            }
        }
    }

    requests
}
