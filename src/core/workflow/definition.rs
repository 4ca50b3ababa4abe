#![allow(clippy::result_large_err)] // Definition APIs return AppError to preserve structured validation context without boxing.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::contract::{ContextKey, TaskContractRegistry, TaskKind};
use crate::core::workflow::lint::{LintRegistry, LintResult, LintSeverity};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Named, fixed dependency graph over task kinds.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Context keys the caller is expected to supply at start.
    #[serde(default)]
    pub initial_context: BTreeSet<ContextKey>,
    pub tasks: Vec<WorkflowTask>,
}

/// One node of a workflow graph.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WorkflowTask {
    pub kind: TaskKind,
    #[serde(default)]
    pub depends_on: BTreeSet<TaskKind>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl WorkflowTask {
    pub fn new(kind: impl Into<TaskKind>) -> Self {
        Self {
            kind: kind.into(),
            depends_on: BTreeSet::new(),
            retry: None,
            timeout_ms: None,
        }
    }

    pub fn after(mut self, dependency: impl Into<TaskKind>) -> Self {
        self.depends_on.insert(dependency.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Retry configuration applied to retryable task errors within one run of a task.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    #[serde(default)]
    pub backoff_ms: u64,
    #[serde(default)]
    pub backoff_multiplier: Option<f32>,
    #[serde(default)]
    pub jitter_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
            backoff_multiplier: None,
            jitter_ms: None,
        }
    }
}

impl RetryPolicy {
    /// Ensure the retry policy is sane.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_attempts == 0 {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                "retry.max_attempts must be >= 1",
            )
            .with_code("JF-DEF-007"));
        }
        Ok(())
    }
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            initial_context: BTreeSet::new(),
            tasks: Vec::new(),
        }
    }

    pub fn with_initial(mut self, key: impl Into<ContextKey>) -> Self {
        self.initial_context.insert(key.into());
        self
    }

    pub fn with_task(mut self, task: WorkflowTask) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn task(&self, kind: &TaskKind) -> Option<&WorkflowTask> {
        self.tasks.iter().find(|task| &task.kind == kind)
    }

    /// Transitive dependencies of `kind`. Unknown dependencies and cycles are tolerated.
    pub fn ancestors(&self, kind: &TaskKind) -> BTreeSet<TaskKind> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<TaskKind> = self
            .task(kind)
            .map(|task| task.depends_on.iter().cloned().collect())
            .unwrap_or_default();
        while let Some(next) = stack.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            if let Some(task) = self.task(&next) {
                stack.extend(task.depends_on.iter().cloned());
            }
        }
        seen
    }

    /// Input keys of `kind` that no ancestor provides and must therefore come from
    /// the initial context.
    pub fn external_inputs(
        &self,
        kind: &TaskKind,
        contracts: &TaskContractRegistry,
    ) -> Result<BTreeSet<ContextKey>, AppError> {
        let contract = contracts.lookup(kind)?;
        let mut provided = BTreeSet::new();
        for ancestor in self.ancestors(kind) {
            if let Some(key) = &contracts.lookup(&ancestor)?.provides {
                provided.insert(key.clone());
            }
        }
        Ok(contract
            .input_keys
            .iter()
            .filter(|key| !provided.contains(*key))
            .cloned()
            .collect())
    }

    /// Every key the caller has to supply when starting this workflow.
    pub fn required_initial_keys(
        &self,
        contracts: &TaskContractRegistry,
    ) -> Result<BTreeSet<ContextKey>, AppError> {
        let mut keys = BTreeSet::new();
        for task in &self.tasks {
            keys.extend(self.external_inputs(&task.kind, contracts)?);
        }
        Ok(keys)
    }

    /// Required initial keys absent from `context`, in lexical order.
    pub fn missing_initial_keys(
        &self,
        contracts: &TaskContractRegistry,
        context: &Map<String, Value>,
    ) -> Result<Vec<ContextKey>, AppError> {
        Ok(self
            .required_initial_keys(contracts)?
            .into_iter()
            .filter(|key| !context.contains_key(key.as_str()))
            .collect())
    }

    /// SHA-256 over the canonical JSON encoding of the definition.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hex::encode(hasher.finalize())
    }
}

/// YAML document holding one or more workflow definitions.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowCatalogDocument {
    pub workflows: Vec<WorkflowDefinition>,
}

impl WorkflowCatalogDocument {
    pub fn from_yaml(text: &str) -> Result<Self, AppError> {
        serde_yaml::from_str(text).map_err(|err| {
            AppError::new(
                ErrorCategory::ValidationError,
                format!("failed to parse workflow definitions: {}", err),
            )
            .with_code("JF-DEF-000")
        })
    }

    pub fn load_from_file(path: &Path) -> Result<Self, AppError> {
        let text = fs::read_to_string(path).map_err(|err| {
            AppError::new(
                ErrorCategory::IoError,
                format!("failed to read {}: {}", path.display(), err),
            )
        })?;
        Self::from_yaml(&text).map_err(|err| err.with_context("file", path.display().to_string()))
    }
}

/// A definition accepted by the registry, with its fingerprint precomputed.
#[derive(Debug, Clone)]
pub struct RegisteredWorkflow {
    pub definition: WorkflowDefinition,
    pub fingerprint: String,
}

/// Builder that validates definitions against the contract catalog as they are added.
pub struct WorkflowRegistryBuilder {
    contracts: TaskContractRegistry,
    lint: LintRegistry,
    workflows: HashMap<String, Arc<RegisteredWorkflow>>,
}

impl std::fmt::Debug for WorkflowRegistryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRegistryBuilder")
            .field("workflows", &self.workflows.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl WorkflowRegistryBuilder {
    pub fn new(contracts: TaskContractRegistry) -> Self {
        Self {
            contracts,
            lint: LintRegistry::new(),
            workflows: HashMap::new(),
        }
    }

    /// Validate and register a definition. Definitions with lint errors are rejected.
    pub fn register(&mut self, definition: WorkflowDefinition) -> Result<&mut Self, AppError> {
        if self.workflows.contains_key(&definition.name) {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                format!("workflow '{}' is already registered", definition.name),
            )
            .with_code("JF-DEF-008"));
        }
        let results = self.lint.run(&definition, &self.contracts);
        reject_on_errors(&definition.name, &results)?;
        for result in results
            .iter()
            .filter(|r| r.severity == LintSeverity::Warning)
        {
            tracing::warn!(
                workflow = %definition.name,
                code = %result.code,
                "{}",
                result.message
            );
        }
        let fingerprint = definition.fingerprint();
        self.workflows.insert(
            definition.name.clone(),
            Arc::new(RegisteredWorkflow {
                definition,
                fingerprint,
            }),
        );
        Ok(self)
    }

    pub fn register_document(
        &mut self,
        document: WorkflowCatalogDocument,
    ) -> Result<&mut Self, AppError> {
        for definition in document.workflows {
            self.register(definition)?;
        }
        Ok(self)
    }

    pub fn build(self) -> WorkflowRegistry {
        WorkflowRegistry {
            contracts: self.contracts,
            workflows: Arc::new(self.workflows),
        }
    }
}

fn reject_on_errors(workflow: &str, results: &[LintResult]) -> Result<(), AppError> {
    let errors: Vec<&LintResult> = results
        .iter()
        .filter(|r| r.severity == LintSeverity::Error)
        .collect();
    let Some(first) = errors.first() else {
        return Ok(());
    };
    let summary = errors
        .iter()
        .map(|r| format!("{}: {}", r.code, r.message))
        .collect::<Vec<_>>()
        .join("; ");
    Err(AppError::new(
        ErrorCategory::ValidationError,
        format!("workflow '{}' is invalid: {}", workflow, summary),
    )
    .with_code(first.code.clone())
    .with_context("workflow", workflow))
}

/// Immutable set of validated workflow definitions.
#[derive(Clone)]
pub struct WorkflowRegistry {
    contracts: TaskContractRegistry,
    workflows: Arc<HashMap<String, Arc<RegisteredWorkflow>>>,
}

impl WorkflowRegistry {
    pub fn builder(contracts: TaskContractRegistry) -> WorkflowRegistryBuilder {
        WorkflowRegistryBuilder::new(contracts)
    }

    pub fn get(&self, name: &str) -> Result<Arc<RegisteredWorkflow>, AppError> {
        self.workflows
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::unknown_workflow(name))
    }

    pub fn contracts(&self) -> &TaskContractRegistry {
        &self.contracts
    }

    /// Registered workflows sorted by name.
    pub fn list(&self) -> Vec<Arc<RegisteredWorkflow>> {
        let mut all: Vec<Arc<RegisteredWorkflow>> = self.workflows.values().cloned().collect();
        all.sort_by(|a, b| a.definition.name.cmp(&b.definition.name));
        all
    }
}
