use crate::core::workflow::contract::{ContextKey, TaskContractRegistry, TaskKind};
use crate::core::workflow::definition::WorkflowDefinition;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Diagnostic severity levels emitted by definition lint rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LintSeverity {
    Error,
    Warning,
    Info,
}

impl LintSeverity {
    fn rank(&self) -> u8 {
        match self {
            LintSeverity::Error => 3,
            LintSeverity::Warning => 2,
            LintSeverity::Info => 1,
        }
    }
}

impl fmt::Display for LintSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LintSeverity::Error => write!(f, "error"),
            LintSeverity::Warning => write!(f, "warning"),
            LintSeverity::Info => write!(f, "info"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LintResult {
    pub code: String,
    pub severity: LintSeverity,
    pub message: String,
    /// Task kind the finding is attached to, if any.
    pub location: Option<String>,
    pub suggestion: Option<String>,
}

impl LintResult {
    pub fn new(
        code: impl Into<String>,
        severity: LintSeverity,
        message: impl Into<String>,
        location: Option<String>,
        suggestion: Option<String>,
    ) -> Self {
        Self {
            code: code.into(),
            severity,
            message: message.into(),
            location,
            suggestion,
        }
    }
}

pub trait DefinitionLintRule: Send + Sync {
    fn validate(
        &self,
        definition: &WorkflowDefinition,
        contracts: &TaskContractRegistry,
    ) -> Vec<LintResult>;
}

/// Runs the structural checks every definition must pass before registration.
pub struct LintRegistry {
    rules: Vec<Box<dyn DefinitionLintRule>>,
}

impl LintRegistry {
    pub fn new() -> Self {
        let rules: Vec<Box<dyn DefinitionLintRule>> = vec![
            Box::new(EmptyWorkflowRule),
            Box::new(DuplicateTaskRule),
            Box::new(UnknownTaskKindRule),
            Box::new(UnknownDependencyRule),
            Box::new(DependencyCycleRule),
            Box::new(UnsatisfiedInputRule),
            Box::new(RetryPolicyRule),
            Box::new(SharedProvidesKeyRule),
            Box::new(UnusedInitialKeyRule),
        ];
        Self { rules }
    }

    /// Results are sorted by `(severity desc, code asc, location asc)`.
    pub fn run(
        &self,
        definition: &WorkflowDefinition,
        contracts: &TaskContractRegistry,
    ) -> Vec<LintResult> {
        let mut results = Vec::new();
        for rule in &self.rules {
            results.extend(rule.validate(definition, contracts));
        }
        results.sort_by(|a, b| {
            b.severity
                .rank()
                .cmp(&a.severity.rank())
                .then(a.code.cmp(&b.code))
                .then(a.location.cmp(&b.location))
        });
        results
    }
}

impl Default for LintRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct EmptyWorkflowRule;

impl DefinitionLintRule for EmptyWorkflowRule {
    fn validate(&self, definition: &WorkflowDefinition, _: &TaskContractRegistry) -> Vec<LintResult> {
        if definition.tasks.is_empty() {
            return vec![LintResult::new(
                "JF-DEF-001",
                LintSeverity::Error,
                format!("workflow '{}' declares no tasks", definition.name),
                None,
                None,
            )];
        }
        Vec::new()
    }
}

struct DuplicateTaskRule;

impl DefinitionLintRule for DuplicateTaskRule {
    fn validate(&self, definition: &WorkflowDefinition, _: &TaskContractRegistry) -> Vec<LintResult> {
        let mut counts: BTreeMap<&TaskKind, usize> = BTreeMap::new();
        for task in &definition.tasks {
            *counts.entry(&task.kind).or_insert(0) += 1;
        }
        counts
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(kind, count)| {
                LintResult::new(
                    "JF-DEF-002",
                    LintSeverity::Error,
                    format!("task '{}' appears {} times", kind, count),
                    Some(kind.to_string()),
                    Some("a task kind may appear once per workflow".to_string()),
                )
            })
            .collect()
    }
}

struct UnknownTaskKindRule;

impl DefinitionLintRule for UnknownTaskKindRule {
    fn validate(
        &self,
        definition: &WorkflowDefinition,
        contracts: &TaskContractRegistry,
    ) -> Vec<LintResult> {
        definition
            .tasks
            .iter()
            .filter(|task| !contracts.contains(&task.kind))
            .map(|task| {
                LintResult::new(
                    "JF-DEF-003",
                    LintSeverity::Error,
                    format!("task kind '{}' has no registered contract", task.kind),
                    Some(task.kind.to_string()),
                    Some("register a TaskContract for this kind".to_string()),
                )
            })
            .collect()
    }
}

struct UnknownDependencyRule;

impl DefinitionLintRule for UnknownDependencyRule {
    fn validate(&self, definition: &WorkflowDefinition, _: &TaskContractRegistry) -> Vec<LintResult> {
        let known: BTreeSet<&TaskKind> = definition.tasks.iter().map(|task| &task.kind).collect();
        let mut out = Vec::new();
        for task in &definition.tasks {
            for dependency in &task.depends_on {
                if dependency == &task.kind {
                    out.push(LintResult::new(
                        "JF-DEF-004",
                        LintSeverity::Error,
                        format!("task '{}' depends on itself", task.kind),
                        Some(task.kind.to_string()),
                        None,
                    ));
                } else if !known.contains(dependency) {
                    out.push(LintResult::new(
                        "JF-DEF-004",
                        LintSeverity::Error,
                        format!(
                            "task '{}' depends on '{}', which is not part of the workflow",
                            task.kind, dependency
                        ),
                        Some(task.kind.to_string()),
                        Some("add the dependency as a task or drop it".to_string()),
                    ));
                }
            }
        }
        out
    }
}

struct DependencyCycleRule;

impl DefinitionLintRule for DependencyCycleRule {
    fn validate(&self, definition: &WorkflowDefinition, _: &TaskContractRegistry) -> Vec<LintResult> {
        let mut graph: DiGraph<&TaskKind, ()> = DiGraph::new();
        let mut nodes: HashMap<&TaskKind, NodeIndex> = HashMap::new();
        for task in &definition.tasks {
            nodes
                .entry(&task.kind)
                .or_insert_with(|| graph.add_node(&task.kind));
        }
        for task in &definition.tasks {
            for dependency in &task.depends_on {
                if let (Some(from), Some(to)) = (nodes.get(dependency), nodes.get(&task.kind)) {
                    graph.add_edge(*from, *to, ());
                }
            }
        }

        let mut out = Vec::new();
        for component in tarjan_scc(&graph) {
            // Self-loops are reported by the dependency rule.
            if component.len() < 2 {
                continue;
            }
            let mut members: Vec<String> = component
                .iter()
                .map(|index| graph[*index].to_string())
                .collect();
            members.sort();
            out.push(LintResult::new(
                "JF-DEF-005",
                LintSeverity::Error,
                format!("dependency cycle between {}", members.join(", ")),
                members.first().cloned(),
                Some("workflow dependencies must form a DAG".to_string()),
            ));
        }
        out
    }
}

struct UnsatisfiedInputRule;

impl DefinitionLintRule for UnsatisfiedInputRule {
    fn validate(
        &self,
        definition: &WorkflowDefinition,
        contracts: &TaskContractRegistry,
    ) -> Vec<LintResult> {
        let mut out = Vec::new();
        for task in &definition.tasks {
            // Unknown kinds are reported elsewhere.
            let Ok(external) = definition.external_inputs(&task.kind, contracts) else {
                continue;
            };
            for key in external {
                if !definition.initial_context.contains(&key) {
                    out.push(LintResult::new(
                        "JF-DEF-006",
                        LintSeverity::Error,
                        format!(
                            "input '{}' of task '{}' is neither initial context nor provided by an ancestor",
                            key, task.kind
                        ),
                        Some(task.kind.to_string()),
                        Some(format!(
                            "declare '{}' in initial_context or depend on the task that provides it",
                            key
                        )),
                    ));
                }
            }
        }
        out
    }
}

struct RetryPolicyRule;

impl DefinitionLintRule for RetryPolicyRule {
    fn validate(&self, definition: &WorkflowDefinition, _: &TaskContractRegistry) -> Vec<LintResult> {
        let mut out = Vec::new();
        for task in &definition.tasks {
            if let Some(Err(err)) = task.retry.as_ref().map(|retry| retry.validate()) {
                out.push(LintResult::new(
                    "JF-DEF-007",
                    LintSeverity::Error,
                    format!("task '{}': {}", task.kind, err.message),
                    Some(task.kind.to_string()),
                    None,
                ));
            }
            if task.timeout_ms == Some(0) {
                out.push(LintResult::new(
                    "JF-DEF-007",
                    LintSeverity::Error,
                    format!("task '{}': timeout_ms must be > 0", task.kind),
                    Some(task.kind.to_string()),
                    None,
                ));
            }
        }
        out
    }
}

struct SharedProvidesKeyRule;

impl DefinitionLintRule for SharedProvidesKeyRule {
    fn validate(
        &self,
        definition: &WorkflowDefinition,
        contracts: &TaskContractRegistry,
    ) -> Vec<LintResult> {
        let mut providers: BTreeMap<&ContextKey, Vec<&TaskKind>> = BTreeMap::new();
        for task in &definition.tasks {
            if let Ok(contract) = contracts.lookup(&task.kind) {
                if let Some(key) = &contract.provides {
                    providers.entry(key).or_default().push(&task.kind);
                }
            }
        }
        providers
            .into_iter()
            .filter(|(_, tasks)| tasks.len() > 1)
            .map(|(key, tasks)| {
                let names: Vec<String> = tasks.iter().map(|t| t.to_string()).collect();
                LintResult::new(
                    "JF-DEF-101",
                    LintSeverity::Warning,
                    format!(
                        "context key '{}' is written by several tasks: {}",
                        key,
                        names.join(", ")
                    ),
                    None,
                    Some("the last writer wins; order the writers with depends_on".to_string()),
                )
            })
            .collect()
    }
}

struct UnusedInitialKeyRule;

impl DefinitionLintRule for UnusedInitialKeyRule {
    fn validate(
        &self,
        definition: &WorkflowDefinition,
        contracts: &TaskContractRegistry,
    ) -> Vec<LintResult> {
        let consumed: BTreeSet<&ContextKey> = definition
            .tasks
            .iter()
            .filter_map(|task| contracts.lookup(&task.kind).ok())
            .flat_map(|contract| contract.input_keys.iter())
            .collect();
        definition
            .initial_context
            .iter()
            .filter(|key| !consumed.contains(key))
            .map(|key| {
                LintResult::new(
                    "JF-DEF-102",
                    LintSeverity::Info,
                    format!("initial context key '{}' is never read", key),
                    None,
                    None,
                )
            })
            .collect()
    }
}
