#![allow(clippy::result_large_err)] // Catalog assembly returns AppError so startup failures keep their codes.

//! Built-in task kinds and workflows for the job-application pipeline.

pub mod catalog;
pub mod llm;
pub mod score;

pub use llm::{LlmTaskExecutor, PromptSpec};
pub use score::{score_checklist, ScoreExecutor};

use crate::core::error::AppError;
use crate::core::provider::LlmProvider;
use crate::core::workflow::contract::TaskContractRegistry;
use crate::core::workflow::definition::{WorkflowCatalogDocument, WorkflowRegistryBuilder};
use crate::core::workflow::executor::TaskExecutorRegistry;
use std::path::PathBuf;
use std::sync::Arc;

const BUILTIN_WORKFLOWS: &str = include_str!("workflows.yaml");

pub fn builtin_contracts() -> Result<TaskContractRegistry, AppError> {
    let mut builder = TaskContractRegistry::builder();
    for contract in catalog::contracts() {
        builder.register(contract)?;
    }
    Ok(builder.build())
}

pub fn builtin_workflows() -> Result<WorkflowCatalogDocument, AppError> {
    WorkflowCatalogDocument::from_yaml(BUILTIN_WORKFLOWS)
        .map_err(|err| err.with_context("source", "built-in workflows"))
}

/// Registry builder pre-loaded with the built-in workflows plus any extra
/// definition files.
pub fn workflow_registry_builder(
    contracts: TaskContractRegistry,
    extra_files: &[PathBuf],
) -> Result<WorkflowRegistryBuilder, AppError> {
    let mut builder = WorkflowRegistryBuilder::new(contracts);
    builder.register_document(builtin_workflows()?)?;
    for file in extra_files {
        builder.register_document(WorkflowCatalogDocument::load_from_file(file)?)?;
    }
    Ok(builder)
}

/// Executors for every built-in kind. Returns the LLM executor too so callers
/// can cancel in-flight calls.
pub fn builtin_executors(
    provider: Arc<dyn LlmProvider>,
    model: Option<String>,
) -> Result<(TaskExecutorRegistry, Arc<LlmTaskExecutor>), AppError> {
    let mut llm = LlmTaskExecutor::new(provider);
    if let Some(model) = model {
        llm = llm.with_model(model);
    }
    for (kind, prompt) in catalog::prompts() {
        llm = llm.with_prompt(kind, prompt);
    }
    let llm = Arc::new(llm);

    let mut builder = TaskExecutorRegistry::builder();
    for kind in llm.kinds() {
        builder.register(kind, llm.clone())?;
    }
    builder.register(catalog::SCORE_CALCULATION, Arc::new(ScoreExecutor))?;
    Ok((builder.build(), llm))
}
