#![allow(clippy::result_large_err)] // Executor registry returns AppError directly for structured diagnostics without boxing.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::contract::{OutputType, TaskKind};
use crate::core::workflow::definition::RetryPolicy;
use crate::core::workflow::events::{AiPartialEvent, EventNotifier, WorkflowEvent};
use crate::core::workflow::state::JobId;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

/// Everything a task implementation gets to see for one attempt.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub job_id: JobId,
    pub run_id: Uuid,
    pub kind: TaskKind,
    /// Only the keys declared in the task's contract.
    pub input: Map<String, Value>,
    /// 1-based attempt number within the current `running` interval.
    pub attempt: usize,
}

impl TaskRequest {
    pub fn input_value(&self, key: &str) -> Result<&Value, TaskError> {
        self.input.get(key).ok_or_else(|| {
            TaskError::new(
                TaskErrorKind::InvalidInput,
                format!("input '{}' missing for task {}", key, self.kind),
            )
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutput {
    pub value: Value,
    pub auxiliary: Option<Value>,
}

impl TaskOutput {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            auxiliary: None,
        }
    }

    pub fn with_auxiliary(mut self, auxiliary: Value) -> Self {
        self.auxiliary = Some(auxiliary);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    RateLimited,
    Auth,
    Network,
    Timeout,
    MalformedOutput,
    InvalidOutput,
    InvalidInput,
    Provider,
    Cancelled,
    Internal,
}

impl TaskErrorKind {
    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            TaskErrorKind::RateLimited
                | TaskErrorKind::Network
                | TaskErrorKind::Timeout
                | TaskErrorKind::MalformedOutput
                | TaskErrorKind::InvalidOutput
                | TaskErrorKind::Provider
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            TaskErrorKind::RateLimited => "JF-TASK-001",
            TaskErrorKind::Auth => "JF-TASK-002",
            TaskErrorKind::Network => "JF-TASK-003",
            TaskErrorKind::Timeout => "JF-TASK-004",
            TaskErrorKind::MalformedOutput => "JF-TASK-005",
            TaskErrorKind::InvalidOutput => "JF-TASK-006",
            TaskErrorKind::InvalidInput => "JF-TASK-007",
            TaskErrorKind::Provider => "JF-TASK-008",
            TaskErrorKind::Cancelled => "JF-TASK-009",
            TaskErrorKind::Internal => "JF-TASK-010",
        }
    }
}

impl fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskErrorKind::RateLimited => "rate limited",
            TaskErrorKind::Auth => "authentication failed",
            TaskErrorKind::Network => "network error",
            TaskErrorKind::Timeout => "timed out",
            TaskErrorKind::MalformedOutput => "malformed output",
            TaskErrorKind::InvalidOutput => "invalid output",
            TaskErrorKind::InvalidInput => "invalid input",
            TaskErrorKind::Provider => "provider error",
            TaskErrorKind::Cancelled => "cancelled",
            TaskErrorKind::Internal => "internal error",
        };
        f.write_str(name)
    }
}

/// Terminal failure of a task invocation. The engine only looks at `retryable`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.default_retryable(),
        }
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }
}

impl From<TaskError> for AppError {
    fn from(err: TaskError) -> Self {
        AppError::new(ErrorCategory::TaskError, err.message.clone())
            .with_code(err.code())
            .with_context("kind", err.kind.to_string())
            .with_context("retryable", err.retryable.to_string())
    }
}

/// Callback handed to executors for intermediate results.
///
/// The engine closes the sink as soon as the executor returns, so a partial can
/// never arrive after the task's terminal event.
#[derive(Clone)]
pub struct PartialSink {
    target: Option<(EventNotifier, JobId, Uuid, TaskKind)>,
    closed: Arc<RwLock<bool>>,
}

impl PartialSink {
    pub(crate) fn new(notifier: EventNotifier, job_id: JobId, run_id: Uuid, kind: TaskKind) -> Self {
        Self {
            target: Some((notifier, job_id, run_id, kind)),
            closed: Arc::new(RwLock::new(false)),
        }
    }

    /// A sink that drops everything; used for non-streaming tasks.
    pub fn detached() -> Self {
        Self {
            target: None,
            closed: Arc::new(RwLock::new(false)),
        }
    }

    pub fn emit(&self, partial: Value) {
        // The read guard is held while publishing so `close` cannot slip in between.
        let closed = self.closed.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *closed {
            return;
        }
        if let Some((notifier, job_id, run_id, kind)) = &self.target {
            notifier.publish(WorkflowEvent::AiPartial(AiPartialEvent {
                job_id: job_id.clone(),
                run_id: *run_id,
                kind: kind.clone(),
                partial,
            }));
        }
    }

    /// True when nothing listens to this sink.
    pub fn is_detached(&self) -> bool {
        self.target.is_none()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn close(&self) {
        *self.closed.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
    }
}

/// Side-effecting implementation of one or more task kinds.
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    async fn execute(
        &self,
        request: TaskRequest,
        partials: PartialSink,
    ) -> Result<TaskOutput, TaskError>;
}

/// Builder used to bind executors to task kinds before the engine starts.
#[derive(Default)]
pub struct TaskExecutorRegistryBuilder {
    executors: HashMap<TaskKind, Arc<dyn TaskExecutor>>,
}

impl TaskExecutorRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        kind: impl Into<TaskKind>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<&mut Self, AppError> {
        let kind = kind.into();
        if self.executors.contains_key(&kind) {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                format!("duplicate executor registered for {}", kind),
            )
            .with_code("JF-CONTRACT-003"));
        }
        self.executors.insert(kind, executor);
        Ok(self)
    }

    pub fn build(self) -> TaskExecutorRegistry {
        TaskExecutorRegistry {
            inner: Arc::new(self.executors),
        }
    }
}

#[derive(Clone, Default)]
pub struct TaskExecutorRegistry {
    inner: Arc<HashMap<TaskKind, Arc<dyn TaskExecutor>>>,
}

impl TaskExecutorRegistry {
    pub fn builder() -> TaskExecutorRegistryBuilder {
        TaskExecutorRegistryBuilder::new()
    }

    pub fn get(&self, kind: &TaskKind) -> Option<Arc<dyn TaskExecutor>> {
        self.inner.get(kind).cloned()
    }
}

/// Run one task to a terminal outcome, retrying retryable errors per `policy`
/// and bounding every attempt by `attempt_timeout`.
pub(crate) async fn execute_with_policy(
    executor: Arc<dyn TaskExecutor>,
    request: TaskRequest,
    output_type: &OutputType,
    policy: &RetryPolicy,
    attempt_timeout: Option<Duration>,
    partials: PartialSink,
) -> Result<TaskOutput, TaskError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut backoff_ms = policy.backoff_ms;
    let multiplier = policy.backoff_multiplier.unwrap_or(1.0);
    let jitter_ms = policy.jitter_ms.unwrap_or(0);
    let mut attempt = 0usize;

    loop {
        attempt += 1;
        let mut attempt_request = request.clone();
        attempt_request.attempt = attempt;
        let execution = executor.execute(attempt_request, partials.clone());
        let result = match attempt_timeout {
            Some(limit) => match timeout(limit, execution).await {
                Ok(result) => result,
                Err(_) => Err(TaskError::new(
                    TaskErrorKind::Timeout,
                    format!("task {} timed out after {:?}", request.kind, limit),
                )),
            },
            None => execution.await,
        };
        let result = result.and_then(|output| {
            output_type
                .validate(&output.value)
                .map_err(|message| TaskError::new(TaskErrorKind::InvalidOutput, message))?;
            Ok(output)
        });

        match result {
            Ok(output) => return Ok(output),
            Err(err) if err.retryable && attempt < max_attempts => {
                let sleep_ms = backoff_ms.saturating_add(jitter(jitter_ms));
                tracing::warn!(
                    job_id = %request.job_id,
                    task = %request.kind,
                    attempt,
                    max_attempts,
                    delay_ms = sleep_ms,
                    error = %err,
                    "task attempt failed; retrying"
                );
                if sleep_ms > 0 {
                    sleep(Duration::from_millis(sleep_ms)).await;
                }
                backoff_ms = ((backoff_ms as f32) * multiplier) as u64;
            }
            Err(err) => return Err(err),
        }
    }
}

fn jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..=max_ms)
}
