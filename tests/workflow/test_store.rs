mod support;

use jobflow::core::workflow::{FileRunStateStore, RunState, RunStateStore, TaskStatus};
use serde_json::json;
use std::fs;
use support::{context, job, workflows};
use tempfile::TempDir;

fn chain_state(id: &str) -> RunState {
    let registered = workflows().get("chain").unwrap();
    let mut state = RunState::new(job(id), &registered, context(&[("seed", json!({"a": 1}))]));
    state.set_task_status(&"t1".into(), TaskStatus::Completed);
    state.context.insert("x".into(), json!(["one", "two"]));
    state
}

#[test]
fn saved_runs_load_back_unchanged() {
    let dir = TempDir::new().unwrap();
    let store = FileRunStateStore::new(dir.path());
    let state = chain_state("job-1");

    store.save(&state.job_id, &state).unwrap();
    let loaded = store.load(&state.job_id).unwrap().unwrap();
    assert_eq!(loaded, state);

    let path = dir.path().join("jobs").join("job-1").join("run_state.json");
    assert_eq!(store.state_file(&state.job_id), path);
    let raw: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    assert_eq!(raw["workflowName"], json!("chain"));
    assert_eq!(raw["taskStates"]["t1"], json!("completed"));
    assert_eq!(raw["status"], json!("running"));
}

#[test]
fn saving_replaces_the_previous_run_without_leftovers() {
    let dir = TempDir::new().unwrap();
    let store = FileRunStateStore::new(dir.path());
    let first = chain_state("job-1");
    let second = chain_state("job-1");

    store.save(&first.job_id, &first).unwrap();
    store.save(&second.job_id, &second).unwrap();

    let loaded = store.load(&first.job_id).unwrap().unwrap();
    assert_eq!(loaded.run_id, second.run_id);
    let entries: Vec<String> = fs::read_dir(dir.path().join("jobs").join("job-1"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(entries, vec!["run_state.json"]);
}

#[test]
fn unknown_jobs_load_as_none() {
    let dir = TempDir::new().unwrap();
    let store = FileRunStateStore::new(dir.path().join("never-created"));
    assert!(store.load(&job("missing")).unwrap().is_none());
    assert!(store.list().unwrap().is_empty());
}

#[test]
fn list_is_sorted_and_skips_stray_directories() {
    let dir = TempDir::new().unwrap();
    let store = FileRunStateStore::new(dir.path());
    for id in ["job-c", "job-a", "job-b"] {
        let state = chain_state(id);
        store.save(&state.job_id, &state).unwrap();
    }
    fs::create_dir_all(dir.path().join("jobs").join("empty")).unwrap();

    let ids: Vec<String> = store
        .list()
        .unwrap()
        .into_iter()
        .map(|id| id.to_string())
        .collect();
    assert_eq!(ids, vec!["job-a", "job-b", "job-c"]);
}

#[test]
fn corrupt_files_are_reported() {
    let dir = TempDir::new().unwrap();
    let store = FileRunStateStore::new(dir.path());
    let job_id = job("job-bad");
    let path = store.state_file(&job_id);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, b"{ not json").unwrap();

    let err = store.load(&job_id).unwrap_err();
    assert_eq!(err.code, "JF-STORE-002");
    assert_eq!(err.context.get("job_id").map(String::as_str), Some("job-bad"));
}

#[test]
fn workspace_store_lives_under_dot_jobflow() {
    let dir = TempDir::new().unwrap();
    let store = FileRunStateStore::for_workspace(dir.path());
    assert_eq!(store.root(), dir.path().join(".jobflow/state").as_path());
}
