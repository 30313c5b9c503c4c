//! Progress reporting
//!
//! The scheduler emits a snapshot after every settled step. Where it goes
//! is the sink's business: plain colored rows on a terminal, structured
//! events on a channel when a UI is attached, or nowhere when suppressed.

use colored::Colorize;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::plan::Plan;

/// Environment variable that silences progress output
pub const SUPPRESS_PROGRESS_ENV: &str = "SUPPRESS_PROGRESS";

/// One agent's line in a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRow {
    pub name: String,
    pub status: String,
    pub step: String,
    pub tokens: u64,
    pub cost: f64,
}

/// Point-in-time view of an executing plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub completed: usize,
    pub total: usize,
    pub rows: Vec<AgentRow>,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub base_model: String,
}

impl ProgressSnapshot {
    pub fn of_plan(plan: &Plan) -> Self {
        let rows = plan
            .agents
            .iter()
            .map(|agent| {
                let status = plan.agent_statuses.get(&agent.id);
                AgentRow {
                    name: agent.name.clone(),
                    status: status.map(|s| s.status.to_string()).unwrap_or_else(|| "idle".into()),
                    step: status.map(|s| s.current_step.clone()).unwrap_or_default(),
                    tokens: status.map(|s| s.token_usage).unwrap_or(0),
                    cost: status.map(|s| s.cost).unwrap_or(0.0),
                }
            })
            .collect();

        Self {
            completed: plan.completed_count(),
            total: plan.steps.len(),
            rows,
            total_tokens: plan.total_tokens,
            total_cost: plan.total_cost,
            base_model: plan.base_model.clone(),
        }
    }
}

/// Where snapshots go
pub trait ProgressSink: Send + Sync {
    fn emit(&self, snapshot: &ProgressSnapshot);

    /// Concise failure summary: step name plus trimmed errors
    fn failure(&self, step_name: &str, errors: &[String]);
}

/// Plain text rows on stderr
pub struct TextSink;

impl ProgressSink for TextSink {
    fn emit(&self, snapshot: &ProgressSnapshot) {
        eprintln!(
            "{} {}/{} steps  {} tokens  ${:.4}  [{}]",
            "progress:".bold(),
            snapshot.completed,
            snapshot.total,
            snapshot.total_tokens,
            snapshot.total_cost,
            snapshot.base_model
        );
        for row in &snapshot.rows {
            let status = match row.status.as_str() {
                "working" => row.status.yellow(),
                "completed" => row.status.green(),
                "failed" => row.status.red(),
                _ => row.status.normal(),
            };
            eprintln!(
                "  {:<20} {:<10} {:<20} {:>10} tok  ${:.4}",
                row.name, status, row.step, row.tokens, row.cost
            );
        }
    }

    fn failure(&self, step_name: &str, errors: &[String]) {
        let detail = errors
            .iter()
            .map(|e| e.trim())
            .filter(|e| !e.is_empty())
            .collect::<Vec<_>>()
            .join("; ");
        eprintln!("{} step '{}': {}", "failed".red().bold(), step_name, detail);
    }
}

/// Structured events on a channel, for an attached UI
pub struct EventSink {
    tx: mpsc::UnboundedSender<ProgressSnapshot>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<ProgressSnapshot>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for EventSink {
    fn emit(&self, snapshot: &ProgressSnapshot) {
        if self.tx.send(snapshot.clone()).is_err() {
            debug!("Progress receiver dropped");
        }
    }

    fn failure(&self, step_name: &str, errors: &[String]) {
        debug!(step = %step_name, ?errors, "Step failure reported to event bus");
    }
}

/// Discards everything
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _snapshot: &ProgressSnapshot) {}
    fn failure(&self, _step_name: &str, _errors: &[String]) {}
}

/// Snapshot emitter handed to the scheduler
pub struct ProgressReporter {
    sink: Box<dyn ProgressSink>,
}

impl ProgressReporter {
    pub fn new(sink: Box<dyn ProgressSink>) -> Self {
        Self { sink }
    }

    /// Text sink, unless `SUPPRESS_PROGRESS=1` asks for silence
    pub fn from_env() -> Self {
        if suppressed() {
            Self::new(Box::new(NullSink))
        } else {
            Self::new(Box::new(TextSink))
        }
    }

    pub fn null() -> Self {
        Self::new(Box::new(NullSink))
    }

    /// Event-bus reporter for an attached UI
    pub fn events(tx: mpsc::UnboundedSender<ProgressSnapshot>) -> Self {
        Self::new(Box::new(EventSink::new(tx)))
    }

    pub fn snapshot(&self, plan: &Plan) {
        self.sink.emit(&ProgressSnapshot::of_plan(plan));
    }

    pub fn failure(&self, step_name: &str, errors: &[String]) {
        self.sink.failure(step_name, errors);
    }
}

fn suppressed() -> bool {
    std::env::var(SUPPRESS_PROGRESS_ENV).map(|v| v == "1").unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::AgentWorkStatus;
    use crate::testutil::linear_process;

    #[test]
    fn test_snapshot_of_plan() {
        let process = linear_process();
        let mut plan = Plan::from_process(&process);
        plan.set_agent_status("a1", AgentWorkStatus::Working, "s1", 10);
        plan.agent_statuses.get_mut("a1").unwrap().token_usage = 42;
        plan.recompute_totals();

        let snapshot = ProgressSnapshot::of_plan(&plan);
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.completed, 0);
        assert_eq!(snapshot.rows.len(), 1);
        assert_eq!(snapshot.rows[0].status, "working");
        assert_eq!(snapshot.rows[0].tokens, 42);
        assert_eq!(snapshot.total_tokens, 42);
    }

    #[tokio::test]
    async fn test_event_sink_delivers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reporter = ProgressReporter::events(tx);

        let plan = Plan::from_process(&linear_process());
        reporter.snapshot(&plan);

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.total, 3);
    }

    #[test]
    fn test_snapshot_serializes() {
        let plan = Plan::from_process(&linear_process());
        let snapshot = ProgressSnapshot::of_plan(&plan);
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"total\":3"));
    }
}
