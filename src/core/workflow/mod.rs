//! Workflow orchestration: task contracts, definitions, run state, and the engine.

pub mod contract;
pub mod definition;
pub mod engine;
pub mod events;
pub mod executor;
pub mod lint;
pub mod recovery;
pub mod state;
pub mod store;

pub use contract::{ContextKey, OutputType, TaskContract, TaskContractRegistry, TaskKind};
pub use definition::{
    RegisteredWorkflow, RetryPolicy, WorkflowCatalogDocument, WorkflowDefinition,
    WorkflowRegistry, WorkflowTask,
};
pub use engine::{EngineSettings, RetryOutcome, WorkflowEngine};
pub use events::{EventNotifier, EventTopic, Subscription, WorkflowEvent};
pub use executor::{
    PartialSink, TaskError, TaskErrorKind, TaskExecutor, TaskExecutorRegistry, TaskOutput,
    TaskRequest,
};
pub use recovery::{recover, Recovered, INTERRUPTED_MESSAGE};
pub use state::{JobId, RunState, TaskStatus, WorkflowStatus};
pub use store::{FileRunStateStore, InMemoryRunStateStore, RunStateStore};
