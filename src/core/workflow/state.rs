#![allow(clippy::result_large_err)] // State helpers return AppError to keep structured diagnostics for job ids.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::contract::{TaskContractRegistry, TaskKind};
use crate::core::workflow::definition::RegisteredWorkflow;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Version embedded in persisted run state files.
pub const RUN_STATE_FORMAT_VERSION: &str = "1";

const MAX_JOB_ID_LEN: usize = 128;

/// Identifier of the job-application record a run is bound to.
///
/// Job ids double as directory names in the file store, so only ASCII
/// alphanumerics, `-`, `_` and `.` are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn parse(value: impl Into<String>) -> Result<Self, AppError> {
        let value = value.into();
        let valid_chars = value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if value.is_empty()
            || value.len() > MAX_JOB_ID_LEN
            || !valid_chars
            || value.chars().all(|c| c == '.')
        {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                format!("invalid job id '{}'", value),
            )
            .with_code("JF-JOB-001")
            .with_suggestion("use letters, digits, '-', '_' or '.' (max 128 chars)"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobId::parse(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Idle => "idle",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted record of one workflow run bound to one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub format_version: String,
    /// Generation id; a new `start` for the same job gets a new one.
    pub run_id: Uuid,
    pub job_id: JobId,
    pub workflow_name: String,
    pub definition_hash: String,
    /// Definition order is preserved.
    pub task_states: IndexMap<TaskKind, TaskStatus>,
    #[serde(default)]
    pub status: WorkflowStatus,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub task_errors: IndexMap<TaskKind, String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    /// Fresh run with every task pending and status `running`.
    pub fn new(job_id: JobId, workflow: &RegisteredWorkflow, context: Map<String, Value>) -> Self {
        let now = Utc::now();
        RunState {
            format_version: RUN_STATE_FORMAT_VERSION.to_string(),
            run_id: Uuid::new_v4(),
            job_id,
            workflow_name: workflow.definition.name.clone(),
            definition_hash: workflow.fingerprint.clone(),
            task_states: workflow
                .definition
                .tasks
                .iter()
                .map(|task| (task.kind.clone(), TaskStatus::Pending))
                .collect(),
            status: WorkflowStatus::Running,
            context,
            error: None,
            task_errors: IndexMap::new(),
            started_at: now,
            updated_at: now,
        }
    }

    pub fn task_status(&self, kind: &TaskKind) -> Option<TaskStatus> {
        self.task_states.get(kind).copied()
    }

    pub fn set_task_status(&mut self, kind: &TaskKind, status: TaskStatus) {
        if let Some(slot) = self.task_states.get_mut(kind) {
            *slot = status;
        }
    }

    pub fn tasks_with(&self, status: TaskStatus) -> Vec<TaskKind> {
        self.task_states
            .iter()
            .filter(|(_, s)| **s == status)
            .map(|(kind, _)| kind.clone())
            .collect()
    }

    pub fn has_running_tasks(&self) -> bool {
        self.task_states.values().any(|s| *s == TaskStatus::Running)
    }

    pub fn all_completed(&self) -> bool {
        self.task_states
            .values()
            .all(|s| *s == TaskStatus::Completed)
    }

    /// True once no task is in flight and the run is no longer `running`.
    pub fn is_settled(&self) -> bool {
        self.status != WorkflowStatus::Running && !self.has_running_tasks()
    }

    /// Pending tasks whose dependencies are all completed and whose input keys
    /// are present in the context, in definition order.
    pub fn ready_tasks(
        &self,
        workflow: &RegisteredWorkflow,
        contracts: &TaskContractRegistry,
    ) -> Vec<TaskKind> {
        workflow
            .definition
            .tasks
            .iter()
            .filter(|task| self.task_status(&task.kind) == Some(TaskStatus::Pending))
            .filter(|task| {
                task.depends_on
                    .iter()
                    .all(|dep| self.task_status(dep) == Some(TaskStatus::Completed))
            })
            .filter(|task| match contracts.lookup(&task.kind) {
                Ok(contract) => contract
                    .input_keys
                    .iter()
                    .all(|key| self.context.contains_key(key.as_str())),
                Err(_) => false,
            })
            .map(|task| task.kind.clone())
            .collect()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
