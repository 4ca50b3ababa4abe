#![allow(clippy::result_large_err)] // Registry lookups return AppError directly for structured diagnostics without boxing.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Identifier naming one step, e.g. `resume.parsing`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKind(String);

impl TaskKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskKind {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Name of a slot in the shared workflow context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextKey(String);

impl ContextKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContextKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Declared output type of a task: a name plus the JSON schema handed to providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputType {
    pub name: String,
    pub schema: Value,
}

impl OutputType {
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }

    /// Output type that accepts any JSON value.
    pub fn any(name: impl Into<String>) -> Self {
        Self::new(name, Value::Object(Default::default()))
    }

    /// Check the top-level `type` and the object `required` keys of the schema.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        if let Some(expected) = self.schema.get("type").and_then(Value::as_str) {
            let matches = match expected {
                "object" => value.is_object(),
                "array" => value.is_array(),
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "null" => value.is_null(),
                _ => true,
            };
            if !matches {
                return Err(format!(
                    "{} output must be of type {}, got {}",
                    self.name,
                    expected,
                    json_type_name(value)
                ));
            }
        }
        if let (Some(required), Some(object)) = (
            self.schema.get("required").and_then(Value::as_array),
            value.as_object(),
        ) {
            let missing: Vec<&str> = required
                .iter()
                .filter_map(Value::as_str)
                .filter(|key| !object.contains_key(*key))
                .collect();
            if !missing.is_empty() {
                return Err(format!(
                    "{} output is missing required fields: {}",
                    self.name,
                    missing.join(", ")
                ));
            }
        }
        Ok(())
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Static contract describing what a task kind consumes and produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContract {
    pub kind: TaskKind,
    pub input_keys: BTreeSet<ContextKey>,
    pub output: OutputType,
    /// Context slot the output is merged into. `None` means the result belongs
    /// to the owning business record and is never visible to later tasks.
    pub provides: Option<ContextKey>,
    #[serde(default)]
    pub streaming: bool,
}

impl TaskContract {
    pub fn new(kind: impl Into<TaskKind>, output: OutputType) -> Self {
        Self {
            kind: kind.into(),
            input_keys: BTreeSet::new(),
            output,
            provides: None,
            streaming: false,
        }
    }

    pub fn input(mut self, key: impl Into<ContextKey>) -> Self {
        self.input_keys.insert(key.into());
        self
    }

    pub fn provides(mut self, key: impl Into<ContextKey>) -> Self {
        self.provides = Some(key.into());
        self
    }

    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }
}

impl From<String> for TaskKind {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<String> for ContextKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Builder used to register task contracts at startup.
#[derive(Default)]
pub struct TaskContractRegistryBuilder {
    contracts: HashMap<TaskKind, TaskContract>,
}

impl TaskContractRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, contract: TaskContract) -> Result<&mut Self, AppError> {
        if self.contracts.contains_key(&contract.kind) {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                format!("duplicate task contract registered: {}", contract.kind),
            )
            .with_code("JF-CONTRACT-002"));
        }
        self.contracts.insert(contract.kind.clone(), contract);
        Ok(self)
    }

    pub fn build(self) -> TaskContractRegistry {
        TaskContractRegistry {
            inner: Arc::new(self.contracts),
        }
    }
}

/// Immutable catalog of task contracts, shared by the engine and the definition validator.
#[derive(Clone, Default)]
pub struct TaskContractRegistry {
    inner: Arc<HashMap<TaskKind, TaskContract>>,
}

impl TaskContractRegistry {
    pub fn builder() -> TaskContractRegistryBuilder {
        TaskContractRegistryBuilder::new()
    }

    pub fn lookup(&self, kind: &TaskKind) -> Result<&TaskContract, AppError> {
        self.inner
            .get(kind)
            .ok_or_else(|| AppError::unknown_task_kind(kind.as_str()))
    }

    pub fn contains(&self, kind: &TaskKind) -> bool {
        self.inner.contains_key(kind)
    }

    /// Registered kinds in lexical order.
    pub fn kinds(&self) -> Vec<&TaskKind> {
        let mut kinds: Vec<&TaskKind> = self.inner.keys().collect();
        kinds.sort();
        kinds
    }
}
