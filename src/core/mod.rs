pub mod config;
pub mod error;
pub mod provider;
pub mod tasks;
pub mod types;
pub mod workflow;

pub use config::{ConfigLoader, ConfigValidator, JobflowConfig};
pub use error::AppError;
pub use types::*;
pub use workflow::{
    EventNotifier, JobId, RunState, TaskContractRegistry, TaskExecutorRegistry, WorkflowEngine,
    WorkflowEvent, WorkflowRegistry, WorkflowStatus,
};
