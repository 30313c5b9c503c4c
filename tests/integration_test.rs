//! Integration tests for the orchestration engine
//!
//! These drive the scheduler end-to-end against a scripted executor and
//! verify the contracts the rest of the system leans on: dependency
//! ordering, retry/backoff/timeout, budget halting, persistence/resume,
//! and validation semantics.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use conductor::budget::TokenUsage;
use conductor::config::Config;
use conductor::error::EngineError;
use conductor::exec::{AgentExecutor, AgentOutcome, AgentTask};
use conductor::plan::Plan;
use conductor::process::{Agent, Process, Step, StepStatus, Validation};
use conductor::progress::ProgressReporter;
use conductor::scheduler::{ExecuteOptions, Scheduler};
use conductor::state::StateStore;

// =============================================================================
// Fixtures
// =============================================================================

fn agent(id: &str) -> Agent {
    Agent {
        id: id.to_string(),
        name: format!("Agent {id}"),
        persona: "A careful engineer".to_string(),
        description: String::new(),
        skills: Vec::new(),
        model: String::new(),
        priority: 100,
        depends_on: Vec::new(),
        config: HashMap::new(),
        budget: Default::default(),
    }
}

fn step(id: &str, agent_id: &str, depends_on: &[&str]) -> Step {
    Step {
        id: id.to_string(),
        name: format!("Step {id}"),
        description: format!("Do the work of {id}"),
        agent_id: agent_id.to_string(),
        input: HashMap::new(),
        tools: HashMap::new(),
        expected_output: String::new(),
        status: Default::default(),
        depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        timeout: 0,
        retries: 0,
        attempts: 0,
        last_attempt_at: None,
        result: None,
        history: Vec::new(),
    }
}

fn process(agents: Vec<Agent>, steps: Vec<Step>) -> Process {
    Process {
        version: "1.0".to_string(),
        goal: "Ship the feature".to_string(),
        description: String::new(),
        base_model: "claude-sonnet-4".to_string(),
        agents,
        steps,
        validation: Default::default(),
        settings: Default::default(),
    }
}

fn config(workspace: &Path) -> Config {
    Config {
        workspace: workspace.to_path_buf(),
        ..Default::default()
    }
}

/// One scripted reply for a step
enum Reply {
    Ok(u64),
    Fail(&'static str),
    Sleep(Duration),
}

/// Executor that replays a per-step script and records every call
struct FakeExecutor {
    script: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<(String, Instant)>>,
}

impl FakeExecutor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    async fn script_step(&self, step_id: &str, replies: Vec<Reply>) {
        self.script.lock().await.insert(step_id.to_string(), replies.into());
    }

    async fn calls(&self) -> Vec<(String, Instant)> {
        self.calls.lock().await.clone()
    }

    async fn call_ids(&self) -> Vec<String> {
        self.calls.lock().await.iter().map(|(id, _)| id.clone()).collect()
    }
}

#[async_trait]
impl AgentExecutor for FakeExecutor {
    async fn run(&self, task: &AgentTask) -> eyre::Result<AgentOutcome> {
        self.calls.lock().await.push((task.step_id.clone(), Instant::now()));

        let reply = self
            .script
            .lock()
            .await
            .get_mut(&task.step_id)
            .and_then(|q| q.pop_front());

        match reply {
            Some(Reply::Ok(tokens)) => Ok(AgentOutcome {
                output: format!("done: {}", task.step_id),
                usage: TokenUsage::total_only(tokens),
            }),
            Some(Reply::Fail(message)) => eyre::bail!("{message}"),
            Some(Reply::Sleep(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(AgentOutcome {
                    output: "slow".to_string(),
                    usage: TokenUsage::total_only(10),
                })
            }
            // Unscripted steps succeed with a small usage
            None => Ok(AgentOutcome {
                output: format!("done: {}", task.step_id),
                usage: TokenUsage::total_only(10),
            }),
        }
    }
}

fn scheduler(process: Process, workspace: &Path, executor: Arc<FakeExecutor>) -> Scheduler {
    Scheduler::new(process, config(workspace), executor).with_reporter(Arc::new(ProgressReporter::null()))
}

async fn load_state(workspace: &Path) -> Plan {
    StateStore::load_from(workspace.join("state.json")).await.unwrap()
}

// =============================================================================
// Scenario 1: linear chain
// =============================================================================

#[tokio::test]
async fn test_linear_chain_runs_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();

    let p = process(
        vec![agent("a1")],
        vec![step("s1", "a1", &[]), step("s2", "a1", &["s1"]), step("s3", "a1", &["s2"])],
    );

    scheduler(p, dir.path(), executor.clone())
        .execute(ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(executor.call_ids().await, vec!["s1", "s2", "s3"]);

    let plan = load_state(dir.path()).await;
    assert_eq!(plan.status.to_string(), "completed");
    for s in &plan.steps {
        assert_eq!(s.status, StepStatus::Completed);
        assert_eq!(s.attempts, 1);
        assert!(s.result.is_some());
    }
}

// =============================================================================
// Scenario 2: cycles rejected at load; deadlock caught by the scheduler
// =============================================================================

#[test]
fn test_loader_rejects_cycle() {
    let mut p = process(vec![agent("a1")], vec![step("s1", "a1", &["s2"]), step("s2", "a1", &["s1"])]);
    p.version = String::new();

    let json = serde_json::to_vec(&p).unwrap();
    let err = Process::from_slice(&json).unwrap_err();

    assert!(matches!(err, EngineError::InvalidProcess(_)));
    let msg = err.to_string();
    assert!(msg.contains("s1") && msg.contains("s2"), "message was: {msg}");
}

#[tokio::test]
async fn test_scheduler_detects_deadlock_directly() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();

    // Handed to the scheduler without going through the loader
    let p = process(vec![agent("a1")], vec![step("s1", "a1", &["s2"]), step("s2", "a1", &["s1"])]);

    let err = scheduler(p, dir.path(), executor.clone())
        .execute(ExecuteOptions::default())
        .await
        .unwrap_err();

    match err {
        EngineError::Deadlock { pending } => {
            assert!(pending.contains(&"s1".to_string()));
            assert!(pending.contains(&"s2".to_string()));
        }
        other => panic!("expected Deadlock, got: {other}"),
    }
    assert!(executor.call_ids().await.is_empty());
}

// =============================================================================
// Scenario 3: retry with exponential backoff
// =============================================================================

#[tokio::test]
async fn test_retry_with_backoff() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();

    let mut s = step("s1", "a1", &[]);
    s.retries = 2;
    let p = process(vec![agent("a1")], vec![s]);

    executor
        .script_step("s1", vec![Reply::Fail("flaky"), Reply::Fail("flaky"), Reply::Ok(10)])
        .await;

    scheduler(p, dir.path(), executor.clone())
        .execute(ExecuteOptions::default())
        .await
        .unwrap();

    let calls = executor.calls().await;
    assert_eq!(calls.len(), 3);
    assert!(calls[1].1 - calls[0].1 >= Duration::from_millis(500));
    assert!(calls[2].1 - calls[1].1 >= Duration::from_millis(1000));

    let plan = load_state(dir.path()).await;
    let s1 = plan.step("s1").unwrap();
    assert_eq!(s1.status, StepStatus::Completed);
    assert_eq!(s1.attempts, 3);
    assert_eq!(s1.history.len(), 3);
    assert!(s1.history[0].error.is_some());
    assert!(s1.history[2].error.is_none());
}

// =============================================================================
// Scenario 4: timeout
// =============================================================================

#[tokio::test]
async fn test_step_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();

    let mut s = step("s1", "a1", &[]);
    s.timeout = 1;
    s.retries = 1;
    let p = process(vec![agent("a1")], vec![s]);

    executor
        .script_step(
            "s1",
            vec![Reply::Sleep(Duration::from_secs(5)), Reply::Sleep(Duration::from_secs(5))],
        )
        .await;

    let started = Instant::now();
    let err = scheduler(p, dir.path(), executor.clone())
        .execute(ExecuteOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::StepTimeout { .. }), "got: {err}");
    // Two 1s attempts plus 500ms backoff, nowhere near the 5s sleeps
    assert!(started.elapsed() < Duration::from_secs(4));

    let plan = load_state(dir.path()).await;
    let s1 = plan.step("s1").unwrap();
    assert_eq!(s1.status, StepStatus::Failed);
    assert_eq!(s1.attempts, 2); // retries + 1
}

// =============================================================================
// Scenario 5: budget halt
// =============================================================================

#[tokio::test]
async fn test_budget_halt_blocks_further_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();

    let mut a = agent("a1");
    a.budget.max_tokens = 100;
    a.budget.stop_on_limit = true;

    let p = process(vec![a], vec![step("s1", "a1", &[]), step("s2", "a1", &["s1"])]);

    executor.script_step("s1", vec![Reply::Ok(120)]).await;

    let err = scheduler(p, dir.path(), executor.clone())
        .execute(ExecuteOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::BudgetExceeded { .. }), "got: {err}");
    assert_eq!(executor.call_ids().await, vec!["s1"]);

    let plan = load_state(dir.path()).await;
    let status = &plan.agent_statuses["a1"];
    assert!(status.halted);
    assert!(status.halt_reason.contains("budget exceeded"));
    assert_eq!(status.token_usage, 120);
    assert_eq!(plan.step("s2").unwrap().status, StepStatus::Pending);
}

// =============================================================================
// Scenario 6: non-blocking validation check
// =============================================================================

#[tokio::test]
async fn test_non_blocking_check_does_not_fail_required_validation() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();

    let mut p = process(vec![agent("a1")], vec![step("s1", "a1", &[])]);
    p.validation = Validation {
        custom_checks: vec!["!false".to_string()],
        required: true,
        ..Default::default()
    };

    scheduler(p, dir.path(), executor)
        .execute(ExecuteOptions::default())
        .await
        .unwrap();

    let plan = load_state(dir.path()).await;
    assert_eq!(plan.status.to_string(), "completed");
}

#[tokio::test]
async fn test_blocking_check_fails_required_validation() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();

    let mut p = process(vec![agent("a1")], vec![step("s1", "a1", &[])]);
    p.validation = Validation {
        custom_checks: vec!["false".to_string()],
        required: true,
        ..Default::default()
    };

    let err = scheduler(p, dir.path(), executor)
        .execute(ExecuteOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::ValidationFailed { .. }));
    let plan = load_state(dir.path()).await;
    assert_eq!(plan.status.to_string(), "failed");
}

// =============================================================================
// Scenario 7: resume
// =============================================================================

#[tokio::test]
async fn test_resume_skips_completed_steps() {
    let dir = tempfile::tempdir().unwrap();

    let p = process(
        vec![agent("a1")],
        vec![step("s1", "a1", &[]), step("s2", "a1", &["s1"]), step("s3", "a1", &["s2"])],
    );

    // Persist state mid-execution: s1 done, s2/s3 pending
    {
        let store = StateStore::open(dir.path().join("state.json")).unwrap();
        let mut plan = Plan::from_process(&p);
        plan.update_step("s1", |s| {
            s.status = StepStatus::Completed;
            s.attempts = 1;
        });
        store.save(&plan).await.unwrap();
    }

    let executor = FakeExecutor::new();
    scheduler(p, dir.path(), executor.clone())
        .execute(ExecuteOptions {
            resume: true,
            ..Default::default()
        })
        .await
        .unwrap();

    // s1 was never re-executed; s2 dispatched first
    assert_eq!(executor.call_ids().await, vec!["s2", "s3"]);

    let plan = load_state(dir.path()).await;
    assert!(plan.all_steps_completed());
    assert_eq!(plan.step("s1").unwrap().attempts, 1);
}

#[tokio::test]
async fn test_incompatible_resume_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();

    let old = process(vec![agent("a1")], vec![step("s1", "a1", &[])]);
    {
        let store = StateStore::open(dir.path().join("state.json")).unwrap();
        let mut plan = Plan::from_process(&old);
        plan.goal = "A different goal entirely".to_string();
        plan.update_step("s1", |s| s.status = StepStatus::Completed);
        store.save(&plan).await.unwrap();
    }

    let executor = FakeExecutor::new();
    let p = process(vec![agent("a1")], vec![step("s1", "a1", &[])]);
    scheduler(p, dir.path(), executor.clone())
        .execute(ExecuteOptions {
            resume: true,
            ..Default::default()
        })
        .await
        .unwrap();

    // Fresh plan: s1 executed despite the saved state claiming completion
    assert_eq!(executor.call_ids().await, vec!["s1"]);
}

#[tokio::test]
async fn test_require_resume_fails_on_mismatch() {
    let dir = tempfile::tempdir().unwrap();

    let old = process(vec![agent("a1")], vec![step("s1", "a1", &[])]);
    {
        let store = StateStore::open(dir.path().join("state.json")).unwrap();
        let mut plan = Plan::from_process(&old);
        plan.goal = "A different goal entirely".to_string();
        store.save(&plan).await.unwrap();
    }

    let executor = FakeExecutor::new();
    let p = process(vec![agent("a1")], vec![step("s1", "a1", &[])]);
    let err = scheduler(p, dir.path(), executor)
        .execute(ExecuteOptions {
            resume: true,
            require_resume: true,
            ..Default::default()
        })
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::IncompatibleState(_)));
    assert_eq!(err.exit_code(), 3);
}

// =============================================================================
// Properties
// =============================================================================

#[tokio::test]
async fn test_idempotent_reexecution_of_completed_plan() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();

    let p = process(vec![agent("a1")], vec![step("s1", "a1", &[]), step("s2", "a1", &["s1"])]);

    scheduler(p.clone(), dir.path(), executor.clone())
        .execute(ExecuteOptions::default())
        .await
        .unwrap();
    let first = load_state(dir.path()).await;
    let first_calls = executor.call_ids().await.len();

    scheduler(p, dir.path(), executor.clone())
        .execute(ExecuteOptions {
            resume: true,
            ..Default::default()
        })
        .await
        .unwrap();

    // No step re-ran; step state is unchanged
    assert_eq!(executor.call_ids().await.len(), first_calls);
    let second = load_state(dir.path()).await;
    for (a, b) in first.steps.iter().zip(second.steps.iter()) {
        assert_eq!(a.status, b.status);
        assert_eq!(a.attempts, b.attempts);
    }
}

#[tokio::test]
async fn test_parallel_diamond_respects_dependency_order() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();

    let mut p = process(
        vec![agent("a1"), agent("a2")],
        vec![
            step("a", "a1", &[]),
            step("b", "a1", &["a"]),
            step("c", "a2", &["a"]),
            step("d", "a2", &["b", "c"]),
        ],
    );
    p.settings.parallel_execution = true;

    scheduler(p, dir.path(), executor.clone())
        .execute(ExecuteOptions {
            concurrency: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();

    let calls = executor.calls().await;
    let pos = |id: &str| calls.iter().position(|(c, _)| c == id).unwrap();

    assert_eq!(calls.len(), 4);
    assert!(pos("a") < pos("b"));
    assert!(pos("a") < pos("c"));
    assert!(pos("b") < pos("d"));
    assert!(pos("c") < pos("d"));

    let plan = load_state(dir.path()).await;
    assert!(plan.all_steps_completed());
}

#[tokio::test]
async fn test_continue_past_failure_when_not_stopping() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();

    let mut p = process(
        vec![agent("a1")],
        vec![step("s1", "a1", &[]), step("s2", "a1", &["s1"]), step("s3", "a1", &[])],
    );
    p.settings.stop_on_failure = false;
    p.settings.max_retries = 1;

    // s1 fails all attempts; s3 is independent and must still run
    let mut s1_replies = Vec::new();
    for _ in 0..=p.settings.max_retries {
        s1_replies.push(Reply::Fail("permanently broken"));
    }
    executor.script_step("s1", s1_replies).await;

    let err = scheduler(p, dir.path(), executor.clone())
        .execute(ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Agent { .. }));

    let calls = executor.call_ids().await;
    assert!(calls.contains(&"s3".to_string()));

    let plan = load_state(dir.path()).await;
    assert_eq!(plan.step("s1").unwrap().status, StepStatus::Failed);
    // s2 depends on the failed step and is failed by propagation
    assert_eq!(plan.step("s2").unwrap().status, StepStatus::Failed);
    assert_eq!(plan.step("s3").unwrap().status, StepStatus::Completed);
    assert_eq!(plan.status.to_string(), "failed");
}

#[tokio::test]
async fn test_totals_equal_sum_over_agents() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();

    let p = process(
        vec![agent("a1"), agent("a2")],
        vec![step("s1", "a1", &[]), step("s2", "a2", &[])],
    );

    executor.script_step("s1", vec![Reply::Ok(100)]).await;
    executor.script_step("s2", vec![Reply::Ok(250)]).await;

    scheduler(p, dir.path(), executor)
        .execute(ExecuteOptions::default())
        .await
        .unwrap();

    let plan = load_state(dir.path()).await;
    assert_eq!(plan.total_tokens, 350);
    let agent_sum: u64 = plan.agent_statuses.values().map(|s| s.token_usage).sum();
    assert_eq!(plan.total_tokens, agent_sum);

    let cost_sum: f64 = plan.agent_statuses.values().map(|s| s.cost).sum();
    assert!((plan.total_cost - cost_sum).abs() < 1e-9);
}

// =============================================================================
// Serde round-trip (proptest)
// =============================================================================

mod roundtrip {
    use super::*;
    use proptest::prelude::*;

    fn arb_status() -> impl Strategy<Value = StepStatus> {
        prop_oneof![
            Just(StepStatus::Pending),
            Just(StepStatus::InProgress),
            Just(StepStatus::Completed),
            Just(StepStatus::Failed),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn plan_round_trips_through_json(
            statuses in proptest::collection::vec(arb_status(), 1..6),
            tokens in proptest::collection::vec(0u64..1_000_000, 1..6),
            attempts in proptest::collection::vec(0u32..5, 1..6),
        ) {
            let steps: Vec<Step> = statuses
                .iter()
                .enumerate()
                .map(|(i, status)| {
                    let mut s = step(&format!("s{i}"), "a1", &[]);
                    s.status = *status;
                    s.attempts = attempts[i % attempts.len()];
                    s
                })
                .collect();
            let p = process(vec![agent("a1")], steps);

            let mut plan = Plan::from_process(&p);
            for (i, t) in tokens.iter().enumerate() {
                let status = plan.agent_statuses.get_mut("a1").unwrap();
                status.token_usage += t;
                status.cost += (i as f64) * 0.25;
            }
            plan.recompute_totals();

            let value = serde_json::to_value(&plan).unwrap();
            let reloaded: Plan = serde_json::from_value(value.clone()).unwrap();
            let revalue = serde_json::to_value(&reloaded).unwrap();
            prop_assert_eq!(value, revalue);
        }
    }
}

// =============================================================================
// CLI surface
// =============================================================================

mod cli {
    use assert_cmd::Command;
    use predicates::prelude::*;
    use serial_test::serial;

    fn conductor() -> Command {
        Command::cargo_bin("conductor").unwrap()
    }

    #[test]
    #[serial]
    fn test_example_then_validate() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("process.json");

        conductor()
            .args(["example"])
            .arg(&out)
            .current_dir(dir.path())
            .assert()
            .success();

        conductor()
            .args(["validate"])
            .arg(&out)
            .current_dir(dir.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("valid"));
    }

    #[test]
    #[serial]
    fn test_validate_rejects_cycle_with_exit_2() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(
            &path,
            r#"{
                "goal": "g",
                "agents": [{"id": "a1", "name": "A", "persona": "p"}],
                "steps": [
                    {"id": "s1", "name": "S1", "agent_id": "a1", "depends_on": ["s2"]},
                    {"id": "s2", "name": "S2", "agent_id": "a1", "depends_on": ["s1"]}
                ]
            }"#,
        )
        .unwrap();

        conductor()
            .args(["validate"])
            .arg(&path)
            .current_dir(dir.path())
            .assert()
            .failure()
            .code(2);
    }

    #[test]
    #[serial]
    fn test_execute_with_command_bridge() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".conductor.yml"),
            format!("workspace: {}\nagent-command: cat\n", dir.path().display()),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("process.json"),
            r#"{
                "goal": "Echo through the bridge",
                "agents": [{"id": "a1", "name": "Echo", "persona": "repeats what it hears"}],
                "steps": [{"id": "s1", "name": "Echo step", "agent_id": "a1"}]
            }"#,
        )
        .unwrap();

        conductor()
            .args(["execute", "process.json"])
            .current_dir(dir.path())
            .env("SUPPRESS_PROGRESS", "1")
            .assert()
            .success();

        assert!(dir.path().join("state.json").exists());
    }

    #[test]
    #[serial]
    fn test_execute_invalid_process_exit_2() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("empty.json"), r#"{"goal": "", "agents": [], "steps": []}"#).unwrap();

        conductor()
            .args(["execute", "empty.json"])
            .current_dir(dir.path())
            .assert()
            .failure()
            .code(2);
    }
}
