mod support;

use jobflow::core::types::ErrorCategory;
use jobflow::core::workflow::{
    EngineSettings, RetryPolicy, RunStateStore, TaskError, TaskErrorKind,
    TaskExecutorRegistry, TaskKind, TaskStatus, WorkflowEngine, WorkflowStatus,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use support::{context, harness, harness_with, job, wait_for, workflows, ScriptedExecutor};
use tokio::sync::Semaphore;

fn kind(name: &str) -> TaskKind {
    TaskKind::from(name)
}

#[tokio::test]
async fn downstream_task_waits_for_its_dependency() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(vec![(
        "t1",
        ScriptedExecutor::returning(json!(5)).gated(gate.clone()),
    )]);
    let job_id = job("job-a");

    let started = h
        .engine
        .start("chain", &job_id, context(&[("seed", json!("s"))]))
        .await
        .unwrap();
    assert_eq!(started.status, WorkflowStatus::Running);
    assert_eq!(started.task_status(&kind("t1")), Some(TaskStatus::Running));
    assert_eq!(started.task_status(&kind("t2")), Some(TaskStatus::Pending));

    gate.add_permits(1);
    let settled = h.engine.wait_until_settled(&job_id).await.unwrap();
    assert_eq!(settled.status, WorkflowStatus::Completed);
    assert_eq!(settled.context["x"], json!(5));
    assert_eq!(settled.context["y"], json!({"from": "t2"}));

    // t2 saw only its declared input, with t1's output merged in.
    let input = h.executor("t2").last_input().unwrap();
    assert_eq!(input.len(), 1);
    assert_eq!(input["x"], json!(5));
}

#[tokio::test]
async fn independent_tasks_start_together() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(vec![
        ("t1", ScriptedExecutor::returning(json!(1)).gated(gate.clone())),
        ("t3", ScriptedExecutor::returning(json!(3)).gated(gate.clone())),
    ]);
    let job_id = job("job-b");

    let started = h
        .engine
        .start("parallel", &job_id, context(&[("seed", json!("s"))]))
        .await
        .unwrap();
    assert_eq!(started.task_status(&kind("t1")), Some(TaskStatus::Running));
    assert_eq!(started.task_status(&kind("t3")), Some(TaskStatus::Running));

    gate.add_permits(2);
    let settled = h.engine.wait_until_settled(&job_id).await.unwrap();
    assert_eq!(settled.status, WorkflowStatus::Completed);
    assert_eq!(h.executor("t1").calls(), 1);
    assert_eq!(h.executor("t3").calls(), 1);
}

#[tokio::test]
async fn retry_resets_only_failed_tasks() {
    let h = harness(vec![(
        "t2",
        ScriptedExecutor::returning(json!("ok"))
            .then(Err(TaskError::new(TaskErrorKind::Auth, "bad key"))),
    )]);
    let job_id = job("job-d");
    h.engine
        .start("chain", &job_id, context(&[("seed", json!("s"))]))
        .await
        .unwrap();

    let failed = h.engine.wait_until_settled(&job_id).await.unwrap();
    assert_eq!(failed.status, WorkflowStatus::Failed);
    assert_eq!(failed.task_status(&kind("t1")), Some(TaskStatus::Completed));
    assert_eq!(failed.task_status(&kind("t2")), Some(TaskStatus::Failed));
    assert!(failed.task_errors[&kind("t2")].contains("bad key"));
    assert!(failed.error.as_deref().unwrap().contains("t2"));

    let outcome = h.engine.retry(&job_id).await.unwrap();
    assert_eq!(outcome.failed_tasks, vec![kind("t2")]);
    assert_eq!(outcome.state.status, WorkflowStatus::Running);
    assert_eq!(outcome.state.run_id, failed.run_id);
    assert_eq!(
        outcome.state.task_status(&kind("t1")),
        Some(TaskStatus::Completed)
    );
    assert_ne!(
        outcome.state.task_status(&kind("t2")),
        Some(TaskStatus::Failed)
    );
    assert!(outcome.state.task_errors.is_empty());
    assert!(outcome.state.error.is_none());

    let settled = h.engine.wait_until_settled(&job_id).await.unwrap();
    assert_eq!(settled.status, WorkflowStatus::Completed);
    assert_eq!(h.executor("t1").calls(), 1);
    assert_eq!(h.executor("t2").calls(), 2);
}

#[tokio::test]
async fn missing_initial_context_is_rejected_before_persisting() {
    let h = harness(vec![]);
    let job_id = job("job-e");

    let err = h
        .engine
        .start("chain", &job_id, context(&[]))
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::MissingInitialContext);
    assert_eq!(err.code, "JF-START-001");
    assert!(err.message.contains("seed"));
    assert!(h.engine.get_state(&job_id).await.unwrap().is_none());
    assert!(h.engine.list_jobs().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_workflow_is_rejected() {
    let h = harness(vec![]);
    let err = h
        .engine
        .start("nope", &job("job-x"), context(&[]))
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::UnknownWorkflow);
    assert_eq!(err.code, "JF-WF-001");
}

#[tokio::test]
async fn retry_without_a_run_fails() {
    let h = harness(vec![]);
    let err = h.engine.retry(&job("ghost")).await.unwrap_err();
    assert_eq!(err.category, ErrorCategory::NoActiveWorkflow);
    assert_eq!(err.code, "JF-RETRY-001");
}

#[tokio::test]
async fn retry_of_a_completed_run_changes_nothing() {
    let h = harness(vec![]);
    let job_id = job("job-done");
    h.engine
        .start("chain", &job_id, context(&[("seed", json!("s"))]))
        .await
        .unwrap();
    let settled = h.engine.wait_until_settled(&job_id).await.unwrap();
    assert_eq!(settled.status, WorkflowStatus::Completed);

    let err = h.engine.retry(&job_id).await.unwrap_err();
    assert_eq!(err.category, ErrorCategory::NotFailed);
    assert_eq!(err.code, "JF-RETRY-002");
    let after = h.engine.get_state(&job_id).await.unwrap().unwrap();
    assert_eq!(after, settled);
}

#[tokio::test]
async fn new_start_supersedes_the_active_run() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(vec![(
        "t1",
        ScriptedExecutor::returning(json!("x")).gated(gate.clone()),
    )]);
    let job_id = job("job-super");

    let first = h
        .engine
        .start("chain", &job_id, context(&[("seed", json!("first"))]))
        .await
        .unwrap();
    let second = h
        .engine
        .start("parallel", &job_id, context(&[("seed", json!("second"))]))
        .await
        .unwrap();
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(second.workflow_name, "parallel");

    gate.add_permits(2);
    let settled = h.engine.wait_until_settled(&job_id).await.unwrap();
    assert_eq!(settled.run_id, second.run_id);
    assert_eq!(settled.status, WorkflowStatus::Completed);
    assert!(settled.context.get("y").is_none());
    // The stale t1 outcome never triggered t2.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.executor("t2").calls(), 0);
}

#[tokio::test]
async fn failed_save_rolls_back_the_transition() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(vec![(
        "t1",
        ScriptedExecutor::returning(json!(1)).gated(gate.clone()),
    )]);
    let job_id = job("job-disk");
    let started = h
        .engine
        .start("chain", &job_id, context(&[("seed", json!("s"))]))
        .await
        .unwrap();

    h.store.fail_saves(true);
    gate.add_permits(1);
    let err = h.engine.wait_until_settled(&job_id).await.unwrap_err();
    assert_eq!(err.category, ErrorCategory::PersistenceError);

    let current = h.engine.get_state(&job_id).await.unwrap().unwrap();
    assert_eq!(current.task_states, started.task_states);
    assert_eq!(current.updated_at, started.updated_at);
}

#[tokio::test]
async fn failed_save_on_start_leaves_no_run() {
    let h = harness(vec![]);
    h.store.fail_saves(true);
    let job_id = job("job-nostart");
    let err = h
        .engine
        .start("chain", &job_id, context(&[("seed", json!("s"))]))
        .await
        .unwrap_err();
    assert_eq!(err.category, ErrorCategory::PersistenceError);
    assert!(h.engine.get_state(&job_id).await.unwrap().is_none());
    assert_eq!(h.executor("t1").calls(), 0);
}

#[tokio::test]
async fn start_persists_the_first_batch_in_one_save() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(vec![(
        "t1",
        ScriptedExecutor::returning(json!(1)).gated(gate.clone()),
    )]);
    let job_id = job("job-batch");
    let started = h
        .engine
        .start("chain", &job_id, context(&[("seed", json!("s"))]))
        .await
        .unwrap();

    assert_eq!(h.store.saves(), 1);
    assert_eq!(started.task_status(&kind("t1")), Some(TaskStatus::Running));
    let stored = h.store.load(&job_id).unwrap().unwrap();
    assert_eq!(stored, started);
    gate.add_permits(1);
    let settled = h.engine.wait_until_settled(&job_id).await.unwrap();
    assert_eq!(settled.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn failed_save_on_retry_keeps_the_run_retryable() {
    let h = harness(vec![(
        "t1",
        ScriptedExecutor::returning(json!(1))
            .then(Err(TaskError::new(TaskErrorKind::Auth, "invalid api key"))),
    )]);
    let job_id = job("job-retry-disk");
    h.engine
        .start("chain", &job_id, context(&[("seed", json!("s"))]))
        .await
        .unwrap();
    let failed = h.engine.wait_until_settled(&job_id).await.unwrap();
    assert_eq!(failed.status, WorkflowStatus::Failed);

    h.store.fail_saves(true);
    let err = h.engine.retry(&job_id).await.unwrap_err();
    assert_eq!(err.category, ErrorCategory::PersistenceError);
    let unchanged = h.engine.get_state(&job_id).await.unwrap().unwrap();
    assert_eq!(unchanged, failed);
    assert_eq!(h.store.load(&job_id).unwrap().unwrap(), failed);

    h.store.fail_saves(false);
    h.engine.retry(&job_id).await.unwrap();
    let settled = tokio::time::timeout(
        Duration::from_secs(5),
        h.engine.wait_until_settled(&job_id),
    )
    .await
    .expect("retried run settles")
    .unwrap();
    assert_eq!(settled.status, WorkflowStatus::Completed);
    assert_eq!(h.executor("t1").calls(), 2);
}

#[tokio::test]
async fn retryable_errors_follow_the_policy() {
    let settings = EngineSettings {
        default_retry: RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        },
        task_timeout: None,
    };
    let h = harness_with(
        vec![(
            "t1",
            ScriptedExecutor::returning(json!(1))
                .then(Err(TaskError::new(TaskErrorKind::RateLimited, "slow down")))
                .then(Err(TaskError::new(TaskErrorKind::Network, "reset"))),
        )],
        settings,
    );
    let job_id = job("job-retry-policy");
    h.engine
        .start("chain", &job_id, context(&[("seed", json!("s"))]))
        .await
        .unwrap();
    let settled = h.engine.wait_until_settled(&job_id).await.unwrap();
    assert_eq!(settled.status, WorkflowStatus::Completed);
    assert_eq!(h.executor("t1").calls(), 3);
}

#[tokio::test]
async fn attempts_are_bounded_by_the_engine_timeout() {
    let gate = Arc::new(Semaphore::new(0));
    let settings = EngineSettings {
        default_retry: RetryPolicy::default(),
        task_timeout: Some(Duration::from_millis(30)),
    };
    let h = harness_with(
        vec![("t1", ScriptedExecutor::returning(json!(1)).gated(gate))],
        settings,
    );
    let job_id = job("job-timeout");
    h.engine
        .start("chain", &job_id, context(&[("seed", json!("s"))]))
        .await
        .unwrap();
    let settled = h.engine.wait_until_settled(&job_id).await.unwrap();
    assert_eq!(settled.status, WorkflowStatus::Failed);
    assert!(settled.task_errors[&kind("t1")].contains("timed out"));
    assert_eq!(settled.task_status(&kind("t2")), Some(TaskStatus::Pending));
}

#[tokio::test]
async fn outputs_without_a_context_slot_are_not_merged() {
    let h = harness(vec![]);
    let job_id = job("job-audit");
    h.engine
        .start("audited", &job_id, context(&[("seed", json!("s"))]))
        .await
        .unwrap();
    let settled = h.engine.wait_until_settled(&job_id).await.unwrap();
    assert_eq!(settled.status, WorkflowStatus::Completed);
    assert_eq!(settled.context.len(), 1);
}

#[tokio::test]
async fn jobs_are_isolated() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(vec![(
        "t1",
        ScriptedExecutor::returning(json!(1)).gated(gate.clone()),
    )]);
    let (a, b) = (job("job-one"), job("job-two"));
    h.engine
        .start("chain", &a, context(&[("seed", json!("a"))]))
        .await
        .unwrap();
    h.engine
        .start("chain", &b, context(&[("seed", json!("b"))]))
        .await
        .unwrap();

    let a_running = wait_for(&h.engine, &a, |state| state.has_running_tasks()).await;
    assert_eq!(a_running.context["seed"], json!("a"));
    gate.add_permits(2);
    let a_state = h.engine.wait_until_settled(&a).await.unwrap();
    let b_state = h.engine.wait_until_settled(&b).await.unwrap();
    assert_eq!(a_state.context["seed"], json!("a"));
    assert_eq!(b_state.context["seed"], json!("b"));
    assert_eq!(h.engine.list_jobs().unwrap(), vec![a, b]);
}

#[test]
fn engine_requires_an_executor_for_every_task() {
    let err = WorkflowEngine::builder(workflows())
        .executors(TaskExecutorRegistry::default())
        .build()
        .err()
        .unwrap();
    assert_eq!(err.code, "JF-CONTRACT-004");
}
