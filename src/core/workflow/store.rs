#![allow(clippy::result_large_err)] // Store module returns AppError to preserve structured diagnostic context; boxing would discard run-time state.

use crate::core::error::AppError;
use crate::core::workflow::state::{JobId, RunState};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const DEFAULT_STATE_DIR: &str = ".jobflow/state";
const RUN_STATE_FILE: &str = "run_state.json";

/// Durable home of the single active [`RunState`] per job.
///
/// Calls are synchronous: the engine treats a transition as complete only once
/// `save` has returned `Ok`.
pub trait RunStateStore: Send + Sync {
    fn save(&self, job_id: &JobId, state: &RunState) -> Result<(), AppError>;
    fn load(&self, job_id: &JobId) -> Result<Option<RunState>, AppError>;
    /// Jobs that have a persisted run, in lexical order.
    fn list(&self) -> Result<Vec<JobId>, AppError>;
}

/// Stores each run as `<state_dir>/jobs/<job_id>/run_state.json`.
#[derive(Debug, Clone)]
pub struct FileRunStateStore {
    root: PathBuf,
}

impl FileRunStateStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: state_dir.into(),
        }
    }

    pub fn for_workspace(workspace_root: &Path) -> Self {
        Self::new(workspace_root.join(DEFAULT_STATE_DIR))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    pub fn state_file(&self, job_id: &JobId) -> PathBuf {
        self.jobs_dir().join(job_id.as_str()).join(RUN_STATE_FILE)
    }
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            AppError::persistence(format!(
                "failed to create directory {}: {}",
                parent.display(),
                err
            ))
        })?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, data).map_err(|err| {
        AppError::persistence(format!("failed to write {}: {}", tmp_path.display(), err))
    })?;
    fs::rename(&tmp_path, path).map_err(|err| {
        AppError::persistence(format!(
            "failed to rename {} -> {}: {}",
            tmp_path.display(),
            path.display(),
            err
        ))
    })?;
    Ok(())
}

impl RunStateStore for FileRunStateStore {
    fn save(&self, job_id: &JobId, state: &RunState) -> Result<(), AppError> {
        let content = serde_json::to_vec_pretty(state).map_err(|err| {
            AppError::persistence(format!("failed to serialize run state: {}", err))
                .with_code("JF-STORE-002")
        })?;
        atomic_write(&self.state_file(job_id), &content)
            .map_err(|err| err.with_context("job_id", job_id.as_str()))
    }

    fn load(&self, job_id: &JobId) -> Result<Option<RunState>, AppError> {
        let path = self.state_file(job_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(AppError::persistence(format!(
                    "failed to read {}: {}",
                    path.display(),
                    err
                ))
                .with_code("JF-STORE-003")
                .with_context("job_id", job_id.as_str()))
            }
        };
        serde_json::from_slice(&bytes).map(Some).map_err(|err| {
            AppError::persistence(format!("failed to deserialize {}: {}", path.display(), err))
                .with_code("JF-STORE-002")
                .with_context("job_id", job_id.as_str())
        })
    }

    fn list(&self) -> Result<Vec<JobId>, AppError> {
        let entries = match fs::read_dir(self.jobs_dir()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(AppError::persistence(format!(
                    "failed to list {}: {}",
                    self.jobs_dir().display(),
                    err
                ))
                .with_code("JF-STORE-003"))
            }
        };
        let mut jobs = Vec::new();
        for entry in entries.flatten() {
            if !entry.path().join(RUN_STATE_FILE).is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(job_id) = JobId::parse(name) {
                    jobs.push(job_id);
                }
            }
        }
        jobs.sort();
        Ok(jobs)
    }
}

/// Process-local store used when embedding the engine without a state directory.
#[derive(Debug, Default)]
pub struct InMemoryRunStateStore {
    states: Mutex<BTreeMap<JobId, RunState>>,
}

impl InMemoryRunStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<JobId, RunState>>, AppError> {
        self.states
            .lock()
            .map_err(|_| AppError::persistence("in-memory run state store is poisoned"))
    }
}

impl RunStateStore for InMemoryRunStateStore {
    fn save(&self, job_id: &JobId, state: &RunState) -> Result<(), AppError> {
        self.guard()?.insert(job_id.clone(), state.clone());
        Ok(())
    }

    fn load(&self, job_id: &JobId) -> Result<Option<RunState>, AppError> {
        Ok(self.guard()?.get(job_id).cloned())
    }

    fn list(&self) -> Result<Vec<JobId>, AppError> {
        Ok(self.guard()?.keys().cloned().collect())
    }
}
