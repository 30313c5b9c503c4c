//! Per-step execution: retry with backoff, timeout, and dispatch
//!
//! A [`StepContext`] is a cheaply-cloneable bundle of the capabilities one
//! step execution needs. The plan mutex is the only shared mutable state;
//! it is held for snapshots and mutations, never across an external call.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::budget::BudgetGuard;
use crate::error::EngineError;
use crate::exec::{AgentExecutor, AgentTask, ChangeTracker, TaskRefiner};
use crate::plan::{AgentWorkStatus, Plan};
use crate::process::{ResultStatus, Settings, StepAttempt, StepResult, StepStatus};
use crate::progress::ProgressReporter;
use crate::runner::{AgentRunner, LogTail};
use crate::state::StateStore;
use crate::tools::{ExecutionMode, ToolExecutor, is_truthy};

use super::prompt::{DependencyOutput, PromptBuilder};

/// Base delay of the exponential retry backoff
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Everything one step execution needs
#[derive(Clone)]
pub(crate) struct StepContext {
    pub plan: Arc<Mutex<Plan>>,
    pub store: Arc<StateStore>,
    pub tools: Arc<ToolExecutor>,
    pub executor: Arc<dyn AgentExecutor>,
    pub refiner: Option<Arc<dyn TaskRefiner>>,
    pub tracker: Arc<dyn ChangeTracker>,
    pub budget: Arc<BudgetGuard>,
    pub runners: Arc<HashMap<String, AgentRunner>>,
    pub reporter: Arc<ProgressReporter>,
    pub prompts: Arc<PromptBuilder>,
    pub settings: Settings,
    pub goal: String,

    /// Default execution mode; a per-agent `skip_prompt` forces
    /// non-interactive regardless
    pub mode: ExecutionMode,

    /// Agent log file tailed into step results, when configured
    pub agent_log: Option<PathBuf>,
}

impl StepContext {
    /// Run one step to a terminal status, retrying failed attempts.
    ///
    /// Attempt `n > 0` sleeps `500ms * 2^(n-1)` first. A timeout counts as
    /// a failed attempt. Budget refusals are not retried; waiting cannot
    /// un-spend tokens.
    pub async fn run_step(&self, step_id: &str) -> Result<(), EngineError> {
        let (retries, timeout_s, agent_id, step_name) = {
            let plan = self.plan.lock().await;
            let step = plan
                .step(step_id)
                .ok_or_else(|| EngineError::InvalidProcess(format!("unknown step '{step_id}'")))?;
            let retries = if step.retries > 0 { step.retries } else { self.settings.max_retries };
            let timeout_s = if step.timeout > 0 { step.timeout } else { self.settings.step_timeout };
            (retries, timeout_s, step.agent_id.clone(), step.name.clone())
        };

        let mut last_error: Option<EngineError> = None;

        for attempt in 0..=retries {
            if attempt > 0 {
                let backoff = BACKOFF_BASE * 2u32.pow(attempt - 1);
                debug!(step_id, attempt, ?backoff, "Backing off before retry");
                tokio::time::sleep(backoff).await;
            }

            let started_at = Utc::now();
            let outcome = if timeout_s > 0 {
                match tokio::time::timeout(Duration::from_secs(timeout_s), self.dispatch(step_id)).await {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::StepTimeout {
                        step: step_id.to_string(),
                        seconds: timeout_s,
                    }),
                }
            } else {
                self.dispatch(step_id).await
            };
            let finished_at = Utc::now();

            match outcome {
                Ok(result) => {
                    let mut plan = self.plan.lock().await;
                    plan.update_step(step_id, |s| {
                        s.attempts += 1;
                        s.last_attempt_at = Some(started_at);
                        s.history.push(StepAttempt {
                            attempt,
                            status: ResultStatus::Success,
                            started_at,
                            finished_at,
                            error: None,
                            files: result.files.clone(),
                        });
                        s.result = Some(result);
                        s.status = StepStatus::Completed;
                    });
                    settle_agent(&mut plan, &agent_id);
                    plan.recompute_totals();
                    self.persist_and_report(&plan).await;

                    info!(step_id, attempt = attempt + 1, "Step completed");
                    return Ok(());
                }
                Err(err) => {
                    warn!(step_id, attempt = attempt + 1, error = %err, "Step attempt failed");
                    let budget_refusal = matches!(err, EngineError::BudgetExceeded { .. });

                    {
                        let mut plan = self.plan.lock().await;
                        let message = err.to_string();
                        plan.update_step(step_id, |s| {
                            s.attempts += 1;
                            s.last_attempt_at = Some(started_at);
                            s.history.push(StepAttempt {
                                attempt,
                                status: ResultStatus::Failure,
                                started_at,
                                finished_at,
                                error: Some(message),
                                files: Vec::new(),
                            });
                        });
                        self.persist_and_report(&plan).await;
                    }

                    last_error = Some(err);
                    if budget_refusal {
                        break;
                    }
                }
            }
        }

        let err = last_error.unwrap_or_else(|| EngineError::Agent {
            agent: agent_id.clone(),
            step: step_id.to_string(),
            message: "no attempts were made".to_string(),
        });

        let errors = {
            let mut plan = self.plan.lock().await;
            plan.update_step(step_id, |s| s.status = StepStatus::Failed);
            plan.last_error = Some(err.to_string());

            let errors: Vec<String> = plan
                .step(step_id)
                .map(|s| s.history.iter().filter_map(|a| a.error.clone()).collect())
                .unwrap_or_default();

            let progress = agent_progress(&plan, &agent_id);
            plan.set_agent_status(&agent_id, AgentWorkStatus::Failed, step_id, progress);
            if let Some(status) = plan.agent_statuses.get_mut(&agent_id) {
                status.errors.push(err.to_string());
            }
            plan.recompute_totals();
            self.persist_and_report(&plan).await;
            errors
        };

        self.reporter.failure(&step_name, &errors);
        Err(err)
    }

    /// One attempt: enrich, build the prompt, check the budget, run the
    /// agent, then account the outcome into the plan.
    async fn dispatch(&self, step_id: &str) -> Result<StepResult, EngineError> {
        // Snapshot the step, its agent, and prerequisite outputs
        let (mut step, agent, dependencies) = {
            let mut plan = self.plan.lock().await;
            plan.current_step = step_id.to_string();
            plan.update_step(step_id, |s| s.status = StepStatus::InProgress);

            let step = plan
                .step(step_id)
                .cloned()
                .ok_or_else(|| EngineError::InvalidProcess(format!("unknown step '{step_id}'")))?;
            let agent = plan.agent(&step.agent_id).cloned().ok_or_else(|| {
                EngineError::InvalidProcess(format!("step '{step_id}' references unknown agent '{}'", step.agent_id))
            })?;

            let progress = agent_progress(&plan, &agent.id);
            plan.set_agent_status(&agent.id, AgentWorkStatus::Working, step_id, progress);

            let dependencies = dependency_outputs(&plan, &step);
            (step, agent, dependencies)
        };

        let runner = self
            .runners
            .get(&agent.id)
            .cloned()
            .unwrap_or_else(|| AgentRunner::derive(&agent, &HashMap::new(), "", ""));

        let mode = if runner.skip_prompt() {
            ExecutionMode::NonInteractive
        } else {
            self.mode
        };
        self.tools.enrich(&mut step, mode).await;

        let mut prompt = self
            .prompts
            .build(&agent, &step, &self.goal, &dependencies)
            .map_err(|e| EngineError::Agent {
                agent: agent.id.clone(),
                step: step.id.clone(),
                message: format!("prompt rendering failed: {e}"),
            })?;

        // Opt-in single refinement round-trip
        if step.tools.get("llm_tools").is_some_and(|v| is_truthy(v))
            && let Some(refiner) = &self.refiner
        {
            let draft = AgentTask {
                agent_id: agent.id.clone(),
                step_id: step.id.clone(),
                model: runner.model.clone(),
                prompt: prompt.clone(),
                config: runner.config.clone(),
            };
            match refiner.refine(&draft).await {
                Ok(refined) if !refined.trim().is_empty() => prompt = refined,
                Ok(_) => {}
                Err(e) => warn!(step_id = %step.id, error = %e, "Task refinement failed, keeping original prompt"),
            }
        }

        // Refuse dispatch when the agent is hard-limited
        {
            let plan = self.plan.lock().await;
            if let Some(status) = plan.agent_statuses.get(&agent.id) {
                self.budget.check(&agent, status)?;
            }
        }

        let tail = self.agent_log.as_ref().map(LogTail::anchor);
        let run_started = Utc::now();
        let clock = std::time::Instant::now();

        let task = AgentTask {
            agent_id: agent.id.clone(),
            step_id: step.id.clone(),
            model: runner.model.clone(),
            prompt,
            config: runner.config.clone(),
        };
        let outcome = self.executor.run(&task).await.map_err(|e| EngineError::Agent {
            agent: agent.id.clone(),
            step: step.id.clone(),
            message: e.to_string(),
        })?;

        let files: Vec<String> = match self.tracker.changed_files_since(run_started).await {
            Ok(paths) => paths.iter().map(|p| p.display().to_string()).collect(),
            Err(e) => {
                warn!(step_id = %step.id, error = %e, "Change tracking failed");
                Vec::new()
            }
        };
        let logs = tail.map(|t| t.lines_since()).unwrap_or_default();

        let mut plan = self.plan.lock().await;
        let status = plan.agent_statuses.entry(agent.id.clone()).or_default();
        let cost = self.budget.update(&agent, status, &outcome.usage, &runner.models);
        status.output = outcome.output.clone();
        plan.recompute_totals();

        let mut output = HashMap::new();
        output.insert("output".to_string(), outcome.output);

        Ok(StepResult {
            status: ResultStatus::Success,
            output,
            files,
            errors: Vec::new(),
            warnings: Vec::new(),
            logs,
            duration_s: clock.elapsed().as_secs_f64(),
            tokens: outcome.usage.total,
            token_usage: Some(outcome.usage),
            cost,
        })
    }

    /// Persist while holding the plan lock, then snapshot.
    ///
    /// Mid-run save failures are logged, not fatal; finalization saves go
    /// through the scheduler and are.
    pub(crate) async fn persist_and_report(&self, plan: &Plan) {
        if let Err(e) = self.store.save(plan).await {
            warn!(error = %e, "Failed to persist state, continuing");
        }
        self.reporter.snapshot(plan);
    }
}

/// Outputs of the step's completed dependencies, rendered for the prompt
fn dependency_outputs(plan: &Plan, step: &crate::process::Step) -> Vec<DependencyOutput> {
    step.depends_on
        .iter()
        .filter_map(|dep_id| plan.step(dep_id))
        .filter(|dep| dep.status == StepStatus::Completed)
        .filter_map(|dep| {
            let result = dep.result.as_ref()?;
            let rendered: BTreeMap<&str, &str> = result.output.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            let outputs = rendered
                .iter()
                .map(|(k, v)| format!("{k}: {v}"))
                .collect::<Vec<_>>()
                .join("\n");
            Some(DependencyOutput {
                name: dep.name.clone(),
                outputs,
            })
        })
        .collect()
}

/// Percentage of the agent's steps that are completed
fn agent_progress(plan: &Plan, agent_id: &str) -> u8 {
    let (done, total) = plan
        .steps
        .iter()
        .filter(|s| s.agent_id == agent_id)
        .fold((0usize, 0usize), |(done, total), s| {
            (done + usize::from(s.status == StepStatus::Completed), total + 1)
        });
    if total == 0 {
        return 0;
    }
    ((done * 100) / total) as u8
}

/// Settle an agent's status after one of its steps completed
fn settle_agent(plan: &mut Plan, agent_id: &str) {
    let steps: Vec<_> = plan.steps.iter().filter(|s| s.agent_id == agent_id).collect();
    let all_terminal = steps.iter().all(|s| s.status.is_terminal());
    let any_failed = steps.iter().any(|s| s.status == StepStatus::Failed);

    let next = if !all_terminal {
        AgentWorkStatus::Idle
    } else if any_failed {
        AgentWorkStatus::Failed
    } else {
        AgentWorkStatus::Completed
    };

    let progress = agent_progress(plan, agent_id);
    plan.set_agent_status(agent_id, next, "", progress);
}
