mod support;

use jobflow::core::workflow::{
    recover, FileRunStateStore, RunState, RunStateStore, TaskExecutorRegistry, TaskKind,
    TaskStatus, WorkflowEngine, WorkflowEvent, WorkflowStatus, INTERRUPTED_MESSAGE,
};
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use support::{context, job, workflows, ScriptedExecutor};
use tempfile::TempDir;

fn run_of(workflow: &str, statuses: &[TaskStatus], status: WorkflowStatus) -> RunState {
    let registered = workflows().get(workflow).unwrap();
    let mut state = RunState::new(job("job-r"), &registered, context(&[("seed", json!("s"))]));
    let kinds: Vec<TaskKind> = state.task_states.keys().cloned().collect();
    for (kind, task_status) in kinds.iter().zip(statuses) {
        state.set_task_status(kind, *task_status);
    }
    state.status = status;
    state
}

#[test]
fn running_tasks_of_a_running_run_are_failed() {
    let stale = run_of(
        "chain",
        &[TaskStatus::Running, TaskStatus::Pending],
        WorkflowStatus::Running,
    );
    let recovered = recover(stale.clone());

    assert!(recovered.was_stale);
    let state = recovered.state;
    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(state.task_status(&"t1".into()), Some(TaskStatus::Failed));
    assert_eq!(state.task_status(&"t2".into()), Some(TaskStatus::Pending));
    assert_eq!(state.error.as_deref(), Some(INTERRUPTED_MESSAGE));
    assert_eq!(state.task_errors[&TaskKind::from("t1")], INTERRUPTED_MESSAGE);
    assert_eq!(state.updated_at, stale.updated_at);
    assert_eq!(state.run_id, stale.run_id);
}

#[test]
fn failed_run_with_a_task_in_flight_is_stale() {
    let mut stale = run_of(
        "parallel",
        &[TaskStatus::Failed, TaskStatus::Running],
        WorkflowStatus::Failed,
    );
    stale.error = Some("task t1 failed: invalid api key".into());
    stale
        .task_errors
        .insert("t1".into(), "invalid api key".into());
    let recovered = recover(stale);

    assert!(recovered.was_stale);
    let state = recovered.state;
    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(state.task_status(&"t3".into()), Some(TaskStatus::Failed));
    assert_eq!(state.task_errors[&TaskKind::from("t3")], INTERRUPTED_MESSAGE);
    assert_eq!(state.task_errors[&TaskKind::from("t1")], "invalid api key");
    // The failure that stopped the run stays the reported cause.
    assert_eq!(
        state.error.as_deref(),
        Some("task t1 failed: invalid api key")
    );
}

#[test]
fn settled_runs_pass_through() {
    for status in [
        WorkflowStatus::Completed,
        WorkflowStatus::Failed,
        WorkflowStatus::Idle,
    ] {
        let state = run_of("chain", &[TaskStatus::Completed, TaskStatus::Failed], status);
        let recovered = recover(state.clone());
        assert!(!recovered.was_stale);
        assert_eq!(recovered.state, state);
    }
}

fn arb_task_status() -> impl Strategy<Value = TaskStatus> {
    prop_oneof![
        Just(TaskStatus::Pending),
        Just(TaskStatus::Running),
        Just(TaskStatus::Completed),
        Just(TaskStatus::Failed),
    ]
}

fn arb_workflow_status() -> impl Strategy<Value = WorkflowStatus> {
    prop_oneof![
        Just(WorkflowStatus::Idle),
        Just(WorkflowStatus::Running),
        Just(WorkflowStatus::Completed),
        Just(WorkflowStatus::Failed),
    ]
}

proptest! {
    /// Recovering twice is the same as recovering once, and never leaves a running run behind.
    #[test]
    fn recovery_is_idempotent(
        first in arb_task_status(),
        second in arb_task_status(),
        status in arb_workflow_status(),
    ) {
        let state = run_of("chain", &[first, second], status);
        let once = recover(state.clone());
        let twice = recover(once.state.clone());

        prop_assert!(!twice.was_stale);
        prop_assert_eq!(&twice.state, &once.state);
        prop_assert_ne!(once.state.status, WorkflowStatus::Running);
        let in_flight = first == TaskStatus::Running || second == TaskStatus::Running;
        prop_assert_eq!(once.was_stale, status == WorkflowStatus::Running || in_flight);
        prop_assert!(!once.state.has_running_tasks());
        // Completed work is never discarded.
        for (kind, before) in &state.task_states {
            if *before == TaskStatus::Completed {
                prop_assert_eq!(once.state.task_status(kind), Some(TaskStatus::Completed));
            }
        }
    }
}

fn engine_over(store: Arc<FileRunStateStore>, t2: Arc<ScriptedExecutor>) -> WorkflowEngine {
    let mut executors = TaskExecutorRegistry::builder();
    for kind in ["t1", "t3", "stream", "audit"] {
        executors
            .register(kind, Arc::new(ScriptedExecutor::returning(json!(kind))))
            .unwrap();
    }
    executors.register("t2", t2).unwrap();
    WorkflowEngine::builder(workflows())
        .executors(executors.build())
        .store(store)
        .build()
        .unwrap()
}

#[tokio::test]
async fn interrupted_run_is_persisted_as_failed_and_retried_explicitly() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileRunStateStore::new(dir.path()));
    let job_id = job("job-r");
    // What a crashed process leaves behind: t1 done, t2 mid-flight.
    let mut stale = run_of(
        "chain",
        &[TaskStatus::Completed, TaskStatus::Running],
        WorkflowStatus::Running,
    );
    stale.context.insert("x".into(), json!("from t1"));
    store.save(&job_id, &stale).unwrap();

    let t2 = Arc::new(ScriptedExecutor::returning(json!("y")));
    let engine = engine_over(store.clone(), t2.clone());
    let (_subscription, mut events) = engine.events().channel();

    let attached = engine.attach(&job_id).await.unwrap().unwrap();
    assert_eq!(attached.status, WorkflowStatus::Failed);
    assert_eq!(attached.task_status(&"t2".into()), Some(TaskStatus::Failed));
    assert_eq!(store.load(&job_id).unwrap().unwrap(), attached);

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, WorkflowEvent::StateChanged(ref e) if e.state == attached));

    // Attaching never resumes work.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(t2.calls(), 0);

    let outcome = engine.retry(&job_id).await.unwrap();
    assert_eq!(outcome.failed_tasks, vec![TaskKind::from("t2")]);
    let settled = engine.wait_until_settled(&job_id).await.unwrap();
    assert_eq!(settled.status, WorkflowStatus::Completed);
    assert_eq!(settled.context["y"], json!("y"));
    assert_eq!(t2.last_input().unwrap()["x"], json!("from t1"));
}

#[tokio::test]
async fn retry_refuses_runs_of_a_changed_definition() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileRunStateStore::new(dir.path()));
    let job_id = job("job-r");
    let mut failed = run_of(
        "chain",
        &[TaskStatus::Failed, TaskStatus::Pending],
        WorkflowStatus::Failed,
    );
    failed.definition_hash = "0".repeat(64);
    store.save(&job_id, &failed).unwrap();

    let engine = engine_over(store, Arc::new(ScriptedExecutor::returning(json!("y"))));
    let err = engine.retry(&job_id).await.unwrap_err();
    assert_eq!(err.code, "JF-RETRY-003");
}

#[tokio::test]
async fn sibling_left_running_after_a_failure_is_retried_after_reload() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileRunStateStore::new(dir.path()));
    let job_id = job("job-r");
    // t1 failed and the process died while t3 was still running.
    let mut stale = run_of(
        "parallel",
        &[TaskStatus::Failed, TaskStatus::Running],
        WorkflowStatus::Failed,
    );
    stale.error = Some("task t1 failed: invalid api key".into());
    store.save(&job_id, &stale).unwrap();

    let engine = engine_over(store.clone(), Arc::new(ScriptedExecutor::returning(json!("y"))));
    let attached = engine.attach(&job_id).await.unwrap().unwrap();
    assert_eq!(attached.task_status(&"t3".into()), Some(TaskStatus::Failed));
    assert!(!attached.has_running_tasks());
    assert_eq!(store.load(&job_id).unwrap().unwrap(), attached);

    let outcome = engine.retry(&job_id).await.unwrap();
    assert_eq!(
        outcome.failed_tasks,
        vec![TaskKind::from("t1"), TaskKind::from("t3")]
    );
    let settled = tokio::time::timeout(Duration::from_secs(5), engine.wait_until_settled(&job_id))
        .await
        .expect("retried run settles")
        .unwrap();
    assert_eq!(settled.status, WorkflowStatus::Completed);
    assert_eq!(settled.context["z"], json!("t3"));
}
