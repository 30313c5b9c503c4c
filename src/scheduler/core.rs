//! The orchestration loop
//!
//! `Scheduler::execute` drives one process to a terminal state: build or
//! resume the plan, derive per-agent runners, then repeatedly compute the
//! runnable set and dispatch it, serially or as bounded-concurrency
//! batches, until every step is terminal. Validation runs at the end.
//!
//! The plan lives behind one mutex; step workers mutate it and persist it
//! under that lock. Panics in workers are trapped and recorded as failed
//! attempts, never allowed to tear down the loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, Semaphore, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::budget::BudgetGuard;
use crate::config::Config;
use crate::error::{EngineError, StateError};
use crate::exec::{AgentExecutor, ChangeTracker, NoopChangeTracker, TaskRefiner};
use crate::graph::DependencyGraph;
use crate::plan::{Plan, PlanStatus};
use crate::process::{Process, Settings, StepStatus};
use crate::progress::ProgressReporter;
use crate::runner::AgentRunner;
use crate::state::{StateStore, default_state_path};
use crate::tools::{ExecutionMode, LocalWorkspace, ToolExecutor};
use crate::validation::run_validation;

use super::prompt::PromptBuilder;
use super::step::StepContext;

/// Options for one `execute` invocation
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Try to pick up a previously persisted plan
    pub resume: bool,

    /// Fail (exit 3) instead of starting fresh when the saved state
    /// cannot be resumed
    pub require_resume: bool,

    /// Override for the state file path
    pub state_path: Option<PathBuf>,

    /// Worker count; defaults to 1, or min(4, cores) when the process
    /// enables parallel execution
    pub concurrency: Option<usize>,
}

/// Drives a process to completion
pub struct Scheduler {
    process: Process,
    config: Config,
    executor: Arc<dyn AgentExecutor>,
    refiner: Option<Arc<dyn TaskRefiner>>,
    tracker: Arc<dyn ChangeTracker>,
    tools: Arc<ToolExecutor>,
    budget: Arc<BudgetGuard>,
    reporter: Arc<ProgressReporter>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Scheduler {
    /// Build a scheduler with default collaborators: local workspace
    /// tools, no change tracking, table-priced budgets, env-driven
    /// progress output.
    pub fn new(process: Process, config: Config, executor: Arc<dyn AgentExecutor>) -> Self {
        let workspace = LocalWorkspace::new(&config.workspace);
        let tools = Arc::new(ToolExecutor::new(Arc::new(workspace), config.code_tools));
        let reporter = if config.suppress_progress {
            Arc::new(ProgressReporter::null())
        } else {
            Arc::new(ProgressReporter::from_env())
        };

        Self {
            process,
            config,
            executor,
            refiner: None,
            tracker: Arc::new(NoopChangeTracker),
            tools,
            budget: Arc::new(BudgetGuard::default()),
            reporter,
            shutdown: None,
        }
    }

    pub fn with_refiner(mut self, refiner: Arc<dyn TaskRefiner>) -> Self {
        self.refiner = Some(refiner);
        self
    }

    pub fn with_change_tracker(mut self, tracker: Arc<dyn ChangeTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_tools(mut self, tools: Arc<ToolExecutor>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_budget(mut self, budget: Arc<BudgetGuard>) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Wire a cancellation signal; when it turns true, no further steps
    /// are dispatched and `execute` returns `Cancelled` after persisting.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Run the process to a terminal state
    pub async fn execute(&self, opts: ExecuteOptions) -> Result<(), EngineError> {
        let run_id = Uuid::now_v7();
        info!(%run_id, goal = %self.process.goal, "Starting execution");

        let state_path = default_state_path(&self.config.workspace, opts.state_path.as_deref());
        let store = Arc::new(StateStore::open(state_path)?);

        let mut plan = Plan::from_process(&self.process);
        if opts.resume {
            match self.try_resume(&store, opts.require_resume).await {
                Ok(Some(saved)) => plan = saved,
                Ok(None) => {}
                Err(e) => return Err(e),
            }
        }
        plan.status = PlanStatus::InProgress;
        plan.attempts += 1;

        let runners: HashMap<String, AgentRunner> = self
            .process
            .agents
            .iter()
            .map(|a| {
                let runner = AgentRunner::derive(
                    a,
                    &self.config.agent_defaults,
                    &self.process.base_model,
                    &self.config.default_model,
                );
                (a.id.clone(), runner)
            })
            .collect();

        let stop_on_failure = self.process.settings.stop_on_failure || runners.values().any(|r| r.stop_on_failure());

        let graph = DependencyGraph::build(&plan.steps);
        let plan = Arc::new(Mutex::new(plan));

        let ctx = StepContext {
            plan: plan.clone(),
            store: store.clone(),
            tools: self.tools.clone(),
            executor: self.executor.clone(),
            refiner: self.refiner.clone(),
            tracker: self.tracker.clone(),
            budget: self.budget.clone(),
            runners: Arc::new(runners),
            reporter: self.reporter.clone(),
            prompts: Arc::new(PromptBuilder::new()),
            settings: self.process.settings.clone(),
            goal: self.process.goal.clone(),
            mode: if self.config.interactive {
                ExecutionMode::Interactive
            } else {
                ExecutionMode::NonInteractive
            },
            agent_log: self.config.agent_log.clone(),
        };

        {
            let p = plan.lock().await;
            ctx.persist_and_report(&p).await;
        }

        let concurrency = resolve_concurrency(&opts, &self.process.settings);
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        debug!(concurrency, stop_on_failure, "Scheduler loop starting");

        let mut last_step_error: Option<EngineError> = None;

        loop {
            if self.is_cancelled() {
                return self.cancel(&ctx).await;
            }

            let runnable = {
                let p = plan.lock().await;
                graph.runnable(&p)
            };

            if runnable.is_empty() {
                let mut p = plan.lock().await;
                if p.all_steps_terminal() {
                    break;
                }

                // Steps downstream of a failure can never run; fail them
                // so the plan reaches a terminal state instead of spinning.
                if propagate_dependency_failures(&mut p) {
                    ctx.persist_and_report(&p).await;
                    continue;
                }

                let pending = p.pending_ids();
                if pending.is_empty() {
                    break;
                }

                if let Some(err) = budget_block(&p) {
                    drop(p);
                    return self.fail(&ctx, err).await;
                }

                drop(p);
                return self.fail(&ctx, EngineError::Deadlock { pending }).await;
            }

            if concurrency <= 1 || runnable.len() == 1 {
                for step_id in runnable {
                    if self.is_cancelled() {
                        return self.cancel(&ctx).await;
                    }

                    // An earlier step in this pass may have halted the
                    // agent or failed a dependency; re-check before dispatch.
                    let still_runnable = {
                        let p = plan.lock().await;
                        graph.runnable(&p).contains(&step_id)
                    };
                    if !still_runnable {
                        continue;
                    }

                    if let Err(err) = ctx.run_step(&step_id).await {
                        if stop_on_failure {
                            return self.fail(&ctx, err).await;
                        }
                        warn!(step_id = %step_id, error = %err, "Continuing past failed step");
                        last_step_error = Some(err);
                    }
                }
            } else {
                let batch: Vec<String> = runnable.into_iter().take(concurrency).collect();
                debug!(?batch, "Dispatching batch");

                let mut handles = Vec::with_capacity(batch.len());
                for step_id in batch {
                    let ctx = ctx.clone();
                    let semaphore = semaphore.clone();
                    let id = step_id.clone();
                    let handle = tokio::spawn(async move {
                        // The semaphore is never closed; a failed acquire
                        // just means we run unthrottled.
                        let _permit = semaphore.acquire_owned().await.ok();
                        ctx.run_step(&id).await
                    });
                    handles.push((step_id, handle));
                }

                let mut batch_error: Option<EngineError> = None;
                for (step_id, handle) in handles {
                    match handle.await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            if batch_error.is_none() {
                                batch_error = Some(err);
                            } else {
                                last_step_error = Some(err);
                            }
                        }
                        Err(join_err) => {
                            let err = self.trap_panic(&ctx, &step_id, join_err).await;
                            if batch_error.is_none() {
                                batch_error = Some(err);
                            }
                        }
                    }
                }

                {
                    let p = plan.lock().await;
                    ctx.persist_and_report(&p).await;
                }

                if let Some(err) = batch_error {
                    if stop_on_failure {
                        return self.fail(&ctx, err).await;
                    }
                    last_step_error = Some(err);
                }
            }
        }

        self.finalize(&ctx, last_step_error).await
    }

    /// Attempt to load and reconcile saved state. `Ok(None)` means start
    /// fresh; an error is returned only under `require_resume`.
    async fn try_resume(&self, store: &StateStore, require_resume: bool) -> Result<Option<Plan>, EngineError> {
        match store.load().await {
            Ok(saved) => match StateStore::ensure_compatible(&saved, &self.process) {
                Ok(()) => {
                    info!(
                        completed = saved.completed_count(),
                        total = saved.steps.len(),
                        "Resuming from saved state"
                    );
                    Ok(Some(saved))
                }
                Err(e) => {
                    if require_resume {
                        return Err(e);
                    }
                    warn!(error = %e, "Saved state incompatible, starting fresh");
                    Ok(None)
                }
            },
            Err(StateError::NotFound { .. }) => {
                debug!("No saved state found, starting fresh");
                Ok(None)
            }
            Err(e) => {
                if require_resume {
                    return Err(e.into());
                }
                warn!(error = %e, "Could not load saved state, starting fresh");
                Ok(None)
            }
        }
    }

    /// Abort: mark the plan failed, persist, summarize, return the error
    async fn fail(&self, ctx: &StepContext, err: EngineError) -> Result<(), EngineError> {
        error!(error = %err, "Execution failed");

        {
            let mut p = ctx.plan.lock().await;
            p.status = PlanStatus::Failed;
            p.completed_at = Some(Utc::now());
            p.last_error = Some(err.to_string());
            ctx.persist_and_report(&p).await;
        }

        match &err {
            EngineError::Deadlock { pending } => {
                self.reporter.failure("scheduler", &[format!("deadlocked on: {}", pending.join(", "))]);
            }
            EngineError::BudgetExceeded { agent, reason } => {
                self.reporter.failure(agent, std::slice::from_ref(reason));
            }
            _ => {}
        }

        Err(err)
    }

    /// Stop dispatch, persist, and report cancellation
    async fn cancel(&self, ctx: &StepContext) -> Result<(), EngineError> {
        info!("Cancellation requested, persisting state");
        {
            let p = ctx.plan.lock().await;
            ctx.persist_and_report(&p).await;
        }
        Err(EngineError::Cancelled)
    }

    /// Convert a worker panic into a recorded step failure
    async fn trap_panic(&self, ctx: &StepContext, step_id: &str, join_err: tokio::task::JoinError) -> EngineError {
        let message = if join_err.is_panic() {
            format!("step task panicked: {join_err}")
        } else {
            format!("step task aborted: {join_err}")
        };
        error!(step_id, %message, "Worker died");

        let mut p = ctx.plan.lock().await;
        let agent_id = p.step(step_id).map(|s| s.agent_id.clone()).unwrap_or_default();
        p.update_step(step_id, |s| {
            s.attempts += 1;
            s.status = StepStatus::Failed;
        });
        p.last_error = Some(message.clone());
        ctx.persist_and_report(&p).await;

        EngineError::Agent {
            agent: agent_id,
            step: step_id.to_string(),
            message,
        }
    }

    /// Run validation, settle the final plan status, persist (fatally on
    /// error), and translate the outcome into the scheduler's result.
    async fn finalize(&self, ctx: &StepContext, last_step_error: Option<EngineError>) -> Result<(), EngineError> {
        let validation = &self.process.validation;
        let mut failed_stages = Vec::new();

        if !validation.is_empty() {
            match run_validation(validation, &self.config.workspace).await {
                Ok(report) => {
                    let failures = report.blocking_failures();
                    if !failures.is_empty() {
                        if validation.required {
                            failed_stages = failures;
                        } else {
                            warn!(?failures, "Validation failed but is not required, continuing");
                        }
                    }
                }
                Err(e) => {
                    if validation.required {
                        failed_stages = vec![format!("pipeline: {e}")];
                    } else {
                        warn!(error = %e, "Validation pipeline error, continuing (not required)");
                    }
                }
            }
        }

        let (success, summary) = {
            let mut p = ctx.plan.lock().await;
            let success = p.all_steps_completed() && failed_stages.is_empty();
            p.status = if success { PlanStatus::Completed } else { PlanStatus::Failed };
            p.completed_at = Some(Utc::now());
            if !failed_stages.is_empty() {
                p.last_error = Some(format!("validation failed: {}", failed_stages.join(", ")));
            }

            // Finalization persistence is the one save that must not fail
            ctx.store.save(&p).await?;
            ctx.reporter.snapshot(&p);

            (success, p.last_error.clone())
        };

        if !failed_stages.is_empty() {
            let err = EngineError::ValidationFailed { stages: failed_stages };
            self.reporter.failure("validation", &[err.to_string()]);
            return Err(err);
        }
        if let Some(err) = last_step_error {
            return Err(err);
        }
        if !success {
            return Err(EngineError::Agent {
                agent: String::new(),
                step: String::new(),
                message: summary.unwrap_or_else(|| "steps did not complete".to_string()),
            });
        }

        info!("Execution completed");
        Ok(())
    }
}

/// Worker count: explicit option, else 1, else min(4, cores) when the
/// process enables parallelism
fn resolve_concurrency(opts: &ExecuteOptions, settings: &Settings) -> usize {
    if let Some(n) = opts.concurrency {
        return n.max(1);
    }
    if settings.parallel_execution {
        let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        return cores.min(4).max(1);
    }
    1
}

/// Fail pending steps whose dependencies are terminally failed.
///
/// Returns true when any step changed, so the caller can re-derive the
/// runnable set instead of declaring a deadlock.
fn propagate_dependency_failures(plan: &mut Plan) -> bool {
    let statuses = plan.step_statuses();
    let doomed: Vec<String> = plan
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Pending)
        .filter(|s| {
            s.depends_on
                .iter()
                .any(|d| statuses.get(d.as_str()) == Some(&StepStatus::Failed))
        })
        .map(|s| s.id.clone())
        .collect();

    for id in &doomed {
        warn!(step_id = %id, "Failing step whose dependency failed");
        plan.update_step(id, |s| {
            s.status = StepStatus::Failed;
        });
    }

    !doomed.is_empty()
}

/// When everything still pending belongs to hard-halted agents, surface
/// the budget error instead of a deadlock
fn budget_block(plan: &Plan) -> Option<EngineError> {
    let pending = plan.pending_ids();
    if pending.is_empty() {
        return None;
    }

    let all_blocked = pending.iter().all(|id| {
        plan.step(id)
            .map(|s| {
                let halted = plan.agent_statuses.get(&s.agent_id).is_some_and(|st| st.halted);
                let stops = plan.agent(&s.agent_id).is_some_and(|a| a.budget.stop_on_limit);
                halted && stops
            })
            .unwrap_or(false)
    });
    if !all_blocked {
        return None;
    }

    let step = plan.step(&pending[0])?;
    let status = plan.agent_statuses.get(&step.agent_id)?;
    Some(EngineError::BudgetExceeded {
        agent: step.agent_id.clone(),
        reason: status.halt_reason.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Plan;
    use crate::testutil::{linear_process, step};

    #[test]
    fn test_resolve_concurrency() {
        let serial = Settings::default();
        assert_eq!(resolve_concurrency(&ExecuteOptions::default(), &serial), 1);

        let parallel = Settings {
            parallel_execution: true,
            ..Default::default()
        };
        let n = resolve_concurrency(&ExecuteOptions::default(), &parallel);
        assert!((1..=4).contains(&n));

        let explicit = ExecuteOptions {
            concurrency: Some(8),
            ..Default::default()
        };
        assert_eq!(resolve_concurrency(&explicit, &serial), 8);

        let zero = ExecuteOptions {
            concurrency: Some(0),
            ..Default::default()
        };
        assert_eq!(resolve_concurrency(&zero, &serial), 1);
    }

    #[test]
    fn test_propagate_dependency_failures() {
        let process = linear_process();
        let mut plan = Plan::from_process(&process);

        plan.update_step("s1", |s| s.status = StepStatus::Failed);
        assert!(propagate_dependency_failures(&mut plan));
        assert_eq!(plan.step("s2").unwrap().status, StepStatus::Failed);

        // Second pass fails s3 (its dependency s2 just failed)
        assert!(propagate_dependency_failures(&mut plan));
        assert_eq!(plan.step("s3").unwrap().status, StepStatus::Failed);

        assert!(!propagate_dependency_failures(&mut plan));
    }

    #[test]
    fn test_budget_block_detects_halted_agent() {
        let mut process = linear_process();
        process.agents[0].budget.stop_on_limit = true;
        let mut plan = Plan::from_process(&process);

        assert!(budget_block(&plan).is_none());

        let status = plan.agent_statuses.get_mut("a1").unwrap();
        status.halted = true;
        status.halt_reason = "budget exceeded: 120 tokens over limit of 100".to_string();

        let err = budget_block(&plan).unwrap();
        assert!(matches!(err, EngineError::BudgetExceeded { .. }));
        assert!(err.to_string().contains("budget exceeded"));
    }

    #[test]
    fn test_budget_block_mixed_agents_is_not_budget() {
        let mut process = linear_process();
        process.agents[0].budget.stop_on_limit = true;
        process.agents.push(crate::testutil::agent("a2"));
        process.steps.push(step("s4", "a2", &[]));
        let mut plan = Plan::from_process(&process);

        let status = plan.agent_statuses.get_mut("a1").unwrap();
        status.halted = true;

        // a2 still has a dispatchable step, so this is not a budget block
        assert!(budget_block(&plan).is_none());
    }
}
