#![allow(clippy::result_large_err)] // Engine returns AppError to preserve full diagnostic context; boxing would discard run-time state.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::contract::{TaskContractRegistry, TaskKind};
use crate::core::workflow::definition::{RegisteredWorkflow, RetryPolicy, WorkflowRegistry};
use crate::core::workflow::events::{
    EventNotifier, StateChangedEvent, TaskCompletedEvent, TaskFailedEvent, WorkflowCompletedEvent,
    WorkflowEvent,
};
use crate::core::workflow::executor::{
    execute_with_policy, PartialSink, TaskError, TaskErrorKind, TaskExecutorRegistry,
    TaskOutput, TaskRequest,
};
use crate::core::workflow::recovery::recover;
use crate::core::workflow::state::{JobId, RunState, TaskStatus, WorkflowStatus};
use crate::core::workflow::store::{InMemoryRunStateStore, RunStateStore};
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::Instrument;
use uuid::Uuid;

/// Engine-wide defaults applied to tasks that do not carry their own policy.
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub default_retry: RetryPolicy,
    pub task_timeout: Option<Duration>,
}

/// Result of a successful `retry`.
#[derive(Debug, Clone)]
pub struct RetryOutcome {
    pub state: RunState,
    /// Tasks that were reset from `failed` to `pending`.
    pub failed_tasks: Vec<TaskKind>,
}

/// Tasks marked `running` by a transition, spawned once that transition is durable.
struct Dispatch {
    workflow: Arc<RegisteredWorkflow>,
    job_id: JobId,
    run_id: Uuid,
    tasks: Vec<(TaskKind, Map<String, Value>)>,
}

#[derive(Default)]
struct JobRecord {
    state: Option<RunState>,
    /// Set when a background transition could not be persisted.
    fault: Option<String>,
}

struct JobSlot {
    record: Mutex<JobRecord>,
    changes: watch::Sender<u64>,
}

impl JobSlot {
    fn new(state: Option<RunState>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            record: Mutex::new(JobRecord { state, fault: None }),
            changes,
        }
    }

    fn bump(&self) {
        self.changes.send_modify(|version| *version += 1);
    }
}

struct EngineInner {
    workflows: WorkflowRegistry,
    executors: TaskExecutorRegistry,
    store: Arc<dyn RunStateStore>,
    notifier: EventNotifier,
    settings: EngineSettings,
    jobs: DashMap<JobId, Arc<JobSlot>>,
}

pub struct WorkflowEngineBuilder {
    workflows: WorkflowRegistry,
    executors: TaskExecutorRegistry,
    store: Option<Arc<dyn RunStateStore>>,
    notifier: Option<EventNotifier>,
    settings: EngineSettings,
}

impl WorkflowEngineBuilder {
    pub fn executors(mut self, executors: TaskExecutorRegistry) -> Self {
        self.executors = executors;
        self
    }

    pub fn store(mut self, store: Arc<dyn RunStateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn notifier(mut self, notifier: EventNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Every task kind used by a registered workflow must have an executor.
    /// Must be called from within a tokio runtime when no notifier was supplied.
    pub fn build(self) -> Result<WorkflowEngine, AppError> {
        for workflow in self.workflows.list() {
            for task in &workflow.definition.tasks {
                if self.executors.get(&task.kind).is_none() {
                    return Err(AppError::new(
                        ErrorCategory::ValidationError,
                        format!(
                            "no executor registered for task '{}' used by workflow '{}'",
                            task.kind, workflow.definition.name
                        ),
                    )
                    .with_code("JF-CONTRACT-004"));
                }
            }
        }
        Ok(WorkflowEngine {
            inner: Arc::new(EngineInner {
                workflows: self.workflows,
                executors: self.executors,
                store: self
                    .store
                    .unwrap_or_else(|| Arc::new(InMemoryRunStateStore::new())),
                notifier: self.notifier.unwrap_or_default(),
                settings: self.settings,
                jobs: DashMap::new(),
            }),
        })
    }
}

/// Orchestrates workflow runs: one active [`RunState`] per job, guarded by a
/// per-job lock, persisted after every transition.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn builder(workflows: WorkflowRegistry) -> WorkflowEngineBuilder {
        WorkflowEngineBuilder {
            workflows,
            executors: TaskExecutorRegistry::default(),
            store: None,
            notifier: None,
            settings: EngineSettings::default(),
        }
    }

    pub fn events(&self) -> &EventNotifier {
        &self.inner.notifier
    }

    pub fn workflows(&self) -> &WorkflowRegistry {
        &self.inner.workflows
    }

    /// Jobs with a persisted run.
    pub fn list_jobs(&self) -> Result<Vec<JobId>, AppError> {
        self.inner.store.list()
    }

    /// Start `workflow_name` for `job_id`, superseding any prior run of that job.
    ///
    /// Structural problems (unknown workflow, missing initial context) are
    /// returned before anything is persisted.
    pub async fn start(
        &self,
        workflow_name: &str,
        job_id: &JobId,
        initial_context: Map<String, Value>,
    ) -> Result<RunState, AppError> {
        let workflow = self.inner.workflows.get(workflow_name)?;
        let missing = workflow
            .definition
            .missing_initial_keys(self.inner.workflows.contracts(), &initial_context)?;
        if !missing.is_empty() {
            let keys: Vec<&str> = missing.iter().map(|key| key.as_str()).collect();
            return Err(AppError::new(
                ErrorCategory::MissingInitialContext,
                format!(
                    "workflow '{}' requires initial context keys: {}",
                    workflow_name,
                    keys.join(", ")
                ),
            )
            .with_code("JF-START-001")
            .with_context("workflow", workflow_name)
            .with_context("missing", keys.join(",")));
        }

        let slot = self.slot(job_id);
        let mut record = slot.record.lock().await;
        if let Some(previous) = record.state.as_ref() {
            if previous.status == WorkflowStatus::Running || previous.has_running_tasks() {
                tracing::info!(
                    job_id = %job_id,
                    previous_run = %previous.run_id,
                    previous_workflow = %previous.workflow_name,
                    "superseding active run"
                );
            }
        }

        let mut state = RunState::new(job_id.clone(), &workflow, initial_context);
        tracing::info!(
            job_id = %job_id,
            run_id = %state.run_id,
            workflow = %workflow_name,
            tasks = state.task_states.len(),
            "starting workflow"
        );
        let mut events = Vec::new();
        let dispatch = self.advance(&mut state, &mut events)?;
        self.commit(&slot, &mut record, state, events)?;
        record.fault = None;
        self.launch(&slot, dispatch);
        current_state(&record)
    }

    /// Reset failed tasks to pending and resume scheduling.
    pub async fn retry(&self, job_id: &JobId) -> Result<RetryOutcome, AppError> {
        let Some(slot) = self.tracked_slot(job_id).await? else {
            return Err(no_active_workflow(job_id));
        };
        let mut record = slot.record.lock().await;
        let Some(current) = record.state.as_ref() else {
            return Err(no_active_workflow(job_id));
        };
        if current.status != WorkflowStatus::Failed {
            return Err(AppError::new(
                ErrorCategory::NotFailed,
                format!(
                    "run for job '{}' is {}, only failed runs can be retried",
                    job_id, current.status
                ),
            )
            .with_code("JF-RETRY-002")
            .with_context("status", current.status.as_str()));
        }
        let workflow = self.inner.workflows.get(&current.workflow_name)?;
        if workflow.fingerprint != current.definition_hash {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                format!(
                    "workflow '{}' changed since job '{}' started; start it again instead",
                    current.workflow_name, job_id
                ),
            )
            .with_code("JF-RETRY-003"));
        }

        let failed_tasks = current.tasks_with(TaskStatus::Failed);
        let mut candidate = current.clone();
        for kind in &failed_tasks {
            candidate.set_task_status(kind, TaskStatus::Pending);
            candidate.task_errors.shift_remove(kind);
        }
        candidate.status = WorkflowStatus::Running;
        candidate.error = None;
        candidate.touch();

        tracing::info!(
            job_id = %job_id,
            run_id = %candidate.run_id,
            reset = failed_tasks.len(),
            "retrying failed tasks"
        );
        let mut events = Vec::new();
        let dispatch = self.advance(&mut candidate, &mut events)?;
        self.commit(&slot, &mut record, candidate, events)?;
        record.fault = None;
        self.launch(&slot, dispatch);
        Ok(RetryOutcome {
            state: current_state(&record)?,
            failed_tasks,
        })
    }

    /// Point-in-time snapshot of the job's run. Untracked jobs are attached
    /// from the store first.
    pub async fn get_state(&self, job_id: &JobId) -> Result<Option<RunState>, AppError> {
        match self.tracked_slot(job_id).await? {
            Some(slot) => Ok(slot.record.lock().await.state.clone()),
            None => Ok(None),
        }
    }

    /// Load a persisted run, pass it through recovery and start tracking it.
    /// Never resumes scheduling; an interrupted run needs an explicit `retry`.
    pub async fn attach(&self, job_id: &JobId) -> Result<Option<RunState>, AppError> {
        self.get_state(job_id).await
    }

    /// Resolve once the run has no task in flight and is no longer `running`.
    pub async fn wait_until_settled(&self, job_id: &JobId) -> Result<RunState, AppError> {
        let Some(slot) = self.tracked_slot(job_id).await? else {
            return Err(no_active_workflow(job_id));
        };
        let mut changes = slot.changes.subscribe();
        loop {
            {
                let record = slot.record.lock().await;
                if let Some(fault) = &record.fault {
                    return Err(AppError::persistence(fault.clone())
                        .with_context("job_id", job_id.as_str()));
                }
                match &record.state {
                    Some(state) if state.is_settled() => return Ok(state.clone()),
                    Some(_) => {}
                    None => return Err(no_active_workflow(job_id)),
                }
            }
            if changes.changed().await.is_err() {
                return Err(AppError::new(
                    ErrorCategory::InternalError,
                    "job slot dropped while waiting",
                ));
            }
        }
    }

    fn slot(&self, job_id: &JobId) -> Arc<JobSlot> {
        self.inner
            .jobs
            .entry(job_id.clone())
            .or_insert_with(|| Arc::new(JobSlot::new(None)))
            .clone()
    }

    async fn tracked_slot(&self, job_id: &JobId) -> Result<Option<Arc<JobSlot>>, AppError> {
        if let Some(slot) = self.inner.jobs.get(job_id).map(|entry| entry.clone()) {
            return Ok(Some(slot));
        }

        let Some(stored) = self.inner.store.load(job_id)? else {
            return Ok(None);
        };
        let recovered = recover(stored);
        if recovered.was_stale {
            tracing::warn!(
                job_id = %job_id,
                run_id = %recovered.state.run_id,
                workflow = %recovered.state.workflow_name,
                "run was interrupted; marked failed"
            );
            self.inner.store.save(job_id, &recovered.state)?;
        }
        let state = recovered.state;
        let slot = self
            .inner
            .jobs
            .entry(job_id.clone())
            .or_insert_with(|| Arc::new(JobSlot::new(Some(state.clone()))))
            .clone();
        if recovered.was_stale {
            self.inner
                .notifier
                .publish(WorkflowEvent::StateChanged(StateChangedEvent {
                    job_id: job_id.clone(),
                    state,
                }));
        }
        Ok(Some(slot))
    }

    /// Persist `candidate`, then make it the in-memory state and publish.
    /// On save failure nothing changes and the error is returned.
    fn commit(
        &self,
        slot: &JobSlot,
        record: &mut JobRecord,
        mut candidate: RunState,
        events: Vec<WorkflowEvent>,
    ) -> Result<(), AppError> {
        candidate.touch();
        if let Err(err) = self.inner.store.save(&candidate.job_id, &candidate) {
            tracing::error!(
                job_id = %candidate.job_id,
                run_id = %candidate.run_id,
                error = %err,
                "failed to persist run state; transition rolled back"
            );
            return Err(err);
        }
        let job_id = candidate.job_id.clone();
        record.state = Some(candidate.clone());
        self.inner
            .notifier
            .publish(WorkflowEvent::StateChanged(StateChangedEvent {
                job_id,
                state: candidate,
            }));
        for event in events {
            self.inner.notifier.publish(event);
        }
        slot.bump();
        Ok(())
    }

    /// Move `candidate` forward in place: mark every ready task `running`, or
    /// settle the run when nothing is ready and nothing is in flight. The
    /// returned batch must only be spawned after `candidate` is committed.
    fn advance(
        &self,
        candidate: &mut RunState,
        events: &mut Vec<WorkflowEvent>,
    ) -> Result<Option<Dispatch>, AppError> {
        if candidate.status != WorkflowStatus::Running {
            return Ok(None);
        }
        let workflow = self.inner.workflows.get(&candidate.workflow_name)?;
        let contracts = self.inner.workflows.contracts();
        let ready = candidate.ready_tasks(&workflow, contracts);

        if ready.is_empty() {
            if candidate.has_running_tasks() {
                return Ok(None);
            }
            if candidate.all_completed() {
                candidate.status = WorkflowStatus::Completed;
            } else {
                let pending: Vec<String> = candidate
                    .tasks_with(TaskStatus::Pending)
                    .iter()
                    .map(|kind| kind.to_string())
                    .collect();
                candidate.status = WorkflowStatus::Failed;
                candidate.error = Some(format!(
                    "workflow stalled: no runnable task among {}",
                    pending.join(", ")
                ));
                tracing::warn!(job_id = %candidate.job_id, "workflow stalled");
            }
            events.push(workflow_completed(candidate));
            return Ok(None);
        }

        for kind in &ready {
            candidate.set_task_status(kind, TaskStatus::Running);
        }
        let snapshot: &RunState = candidate;
        let tasks = ready
            .iter()
            .map(|kind| (kind.clone(), declared_inputs(snapshot, contracts, kind)))
            .collect();
        Ok(Some(Dispatch {
            workflow,
            job_id: candidate.job_id.clone(),
            run_id: candidate.run_id,
            tasks,
        }))
    }

    fn launch(&self, slot: &Arc<JobSlot>, dispatch: Option<Dispatch>) {
        let Some(dispatch) = dispatch else {
            return;
        };
        for (kind, input) in dispatch.tasks {
            tracing::debug!(job_id = %dispatch.job_id, task = %kind, "scheduling task");
            self.spawn_task(
                slot.clone(),
                dispatch.workflow.clone(),
                dispatch.job_id.clone(),
                dispatch.run_id,
                kind,
                input,
            );
        }
    }

    // Synchronous so on_outcome -> launch -> spawn_task does not make a recursive future type.
    fn spawn_task(
        &self,
        slot: Arc<JobSlot>,
        workflow: Arc<RegisteredWorkflow>,
        job_id: JobId,
        run_id: Uuid,
        kind: TaskKind,
        input: Map<String, Value>,
    ) {
        let engine = self.clone();
        // Root span per task; file and OTLP sinks key on these fields.
        let span = tracing::info_span!(
            parent: None,
            "task",
            job_id = %job_id,
            run_id = %run_id,
            task = %kind
        );
        tokio::spawn(
            async move {
                let result = engine
                    .invoke(&workflow, &job_id, run_id, &kind, input)
                    .await;
                engine.on_outcome(&slot, run_id, &kind, result).await;
            }
            .instrument(span),
        );
    }

    async fn invoke(
        &self,
        workflow: &RegisteredWorkflow,
        job_id: &JobId,
        run_id: Uuid,
        kind: &TaskKind,
        input: Map<String, Value>,
    ) -> Result<TaskOutput, TaskError> {
        let contract = self
            .inner
            .workflows
            .contracts()
            .lookup(kind)
            .map_err(|err| TaskError::new(TaskErrorKind::Internal, err.message))?
            .clone();
        let executor = self.inner.executors.get(kind).ok_or_else(|| {
            TaskError::new(
                TaskErrorKind::Internal,
                format!("no executor registered for {}", kind),
            )
        })?;
        let definition_task = workflow.definition.task(kind);
        let policy = definition_task
            .and_then(|task| task.retry.clone())
            .unwrap_or_else(|| self.inner.settings.default_retry.clone());
        let attempt_timeout = definition_task
            .and_then(|task| task.timeout_ms)
            .map(Duration::from_millis)
            .or(self.inner.settings.task_timeout);

        let partials = if contract.streaming {
            PartialSink::new(
                self.inner.notifier.clone(),
                job_id.clone(),
                run_id,
                kind.clone(),
            )
        } else {
            PartialSink::detached()
        };
        let request = TaskRequest {
            job_id: job_id.clone(),
            run_id,
            kind: kind.clone(),
            input,
            attempt: 1,
        };
        let result = execute_with_policy(
            executor,
            request,
            &contract.output,
            &policy,
            attempt_timeout,
            partials.clone(),
        )
        .await;
        partials.close();
        result
    }

    async fn on_outcome(
        &self,
        slot: &Arc<JobSlot>,
        run_id: Uuid,
        kind: &TaskKind,
        result: Result<TaskOutput, TaskError>,
    ) {
        let mut record = slot.record.lock().await;
        let Some(current) = record.state.as_ref() else {
            return;
        };
        if current.run_id != run_id {
            tracing::debug!(
                job_id = %current.job_id,
                task = %kind,
                stale_run = %run_id,
                "discarding outcome of superseded run"
            );
            return;
        }
        if current.task_status(kind) != Some(TaskStatus::Running) {
            tracing::warn!(
                job_id = %current.job_id,
                task = %kind,
                "discarding outcome for task that is not running"
            );
            return;
        }

        let job_id = current.job_id.clone();
        let mut candidate = current.clone();
        let mut events = Vec::new();
        match result {
            Ok(output) => {
                let provides = self
                    .inner
                    .workflows
                    .contracts()
                    .lookup(kind)
                    .ok()
                    .and_then(|contract| contract.provides.clone());
                if let Some(key) = provides {
                    candidate
                        .context
                        .insert(key.as_str().to_string(), output.value.clone());
                }
                candidate.set_task_status(kind, TaskStatus::Completed);
                tracing::info!(job_id = %job_id, task = %kind, "task completed");
                events.push(WorkflowEvent::TaskCompleted(TaskCompletedEvent {
                    job_id: job_id.clone(),
                    run_id,
                    kind: kind.clone(),
                    output: output.value,
                    auxiliary: output.auxiliary,
                }));
                if candidate.status == WorkflowStatus::Running && candidate.all_completed() {
                    candidate.status = WorkflowStatus::Completed;
                    tracing::info!(job_id = %job_id, run_id = %run_id, "workflow completed");
                    events.push(workflow_completed(&candidate));
                }
            }
            Err(err) => {
                let message = err.to_string();
                candidate.set_task_status(kind, TaskStatus::Failed);
                candidate.task_errors.insert(kind.clone(), message.clone());
                candidate.status = WorkflowStatus::Failed;
                candidate.error = Some(format!("task {} failed: {}", kind, message));
                tracing::warn!(
                    job_id = %job_id,
                    task = %kind,
                    code = err.code(),
                    error = %message,
                    "task failed"
                );
                events.push(WorkflowEvent::TaskFailed(TaskFailedEvent {
                    job_id: job_id.clone(),
                    run_id,
                    kind: kind.clone(),
                    error: message,
                    error_kind: err.kind,
                }));
            }
        }
        if candidate.status == WorkflowStatus::Failed && !candidate.has_running_tasks() {
            events.push(workflow_completed(&candidate));
        }

        let dispatch = match self.advance(&mut candidate, &mut events) {
            Ok(dispatch) => dispatch,
            Err(err) => {
                self.record_fault(slot, &mut record, err);
                return;
            }
        };
        if let Err(err) = self.commit(slot, &mut record, candidate, events) {
            self.record_fault(slot, &mut record, err);
            return;
        }
        self.launch(slot, dispatch);
    }

    fn record_fault(&self, slot: &JobSlot, record: &mut JobRecord, err: AppError) {
        record.fault = Some(err.message);
        slot.bump();
    }
}

/// The slice of context a task is allowed to see: its declared inputs only.
fn declared_inputs(
    state: &RunState,
    contracts: &TaskContractRegistry,
    kind: &TaskKind,
) -> Map<String, Value> {
    let Ok(contract) = contracts.lookup(kind) else {
        return Map::new();
    };
    contract
        .input_keys
        .iter()
        .filter_map(|key| {
            state
                .context
                .get(key.as_str())
                .map(|value| (key.as_str().to_string(), value.clone()))
        })
        .collect()
}

fn workflow_completed(state: &RunState) -> WorkflowEvent {
    WorkflowEvent::WorkflowCompleted(WorkflowCompletedEvent {
        job_id: state.job_id.clone(),
        run_id: state.run_id,
        status: state.status,
        error: state.error.clone(),
    })
}

fn current_state(record: &JobRecord) -> Result<RunState, AppError> {
    record
        .state
        .clone()
        .ok_or_else(|| AppError::new(ErrorCategory::InternalError, "run state vanished"))
}

fn no_active_workflow(job_id: &JobId) -> AppError {
    AppError::new(
        ErrorCategory::NoActiveWorkflow,
        format!("no workflow run exists for job '{}'", job_id),
    )
    .with_code("JF-RETRY-001")
    .with_context("job_id", job_id.as_str())
}
