use crate::core::workflow::state::{RunState, TaskStatus, WorkflowStatus};

/// Error recorded on runs that were persisted mid-execution by a process that is gone.
pub const INTERRUPTED_MESSAGE: &str =
    "workflow was interrupted before it finished; retry to resume the failed tasks";

#[derive(Debug, Clone, PartialEq)]
pub struct Recovered {
    pub state: RunState,
    pub was_stale: bool,
}

/// Rewrite a run loaded from storage that still has work in flight.
///
/// A run is stale when it claims to be `running`, or when it already failed
/// while a sibling task was still running. Running tasks become failed,
/// pending tasks stay pending and the run is marked failed. A run that was
/// still `running` gets [`INTERRUPTED_MESSAGE`] as its error; a run that had
/// already failed keeps the error that failed it. Anything else passes
/// through unchanged. The caller persists the result and never resumes
/// scheduling.
pub fn recover(mut state: RunState) -> Recovered {
    if state.status != WorkflowStatus::Running && !state.has_running_tasks() {
        return Recovered {
            state,
            was_stale: false,
        };
    }

    for (kind, status) in state.task_states.iter_mut() {
        if *status == TaskStatus::Running {
            *status = TaskStatus::Failed;
            state
                .task_errors
                .insert(kind.clone(), INTERRUPTED_MESSAGE.to_string());
        }
    }
    if state.status == WorkflowStatus::Running || state.error.is_none() {
        state.error = Some(INTERRUPTED_MESSAGE.to_string());
    }
    state.status = WorkflowStatus::Failed;

    Recovered {
        state,
        was_stale: true,
    }
}
