mod support;

use jobflow::core::tasks::{builtin_contracts, builtin_workflows, workflow_registry_builder};
use jobflow::core::workflow::lint::{LintRegistry, LintSeverity};
use jobflow::core::workflow::{
    ContextKey, RetryPolicy, WorkflowCatalogDocument, WorkflowDefinition, WorkflowRegistry,
    WorkflowTask,
};
use serde_json::json;
use std::fs;
use support::{context, contracts};
use tempfile::TempDir;

fn register(definition: WorkflowDefinition) -> Result<(), String> {
    let mut builder = WorkflowRegistry::builder(contracts());
    builder
        .register(definition)
        .map(|_| ())
        .map_err(|err| err.code)
}

#[test]
fn well_formed_definitions_register() {
    let definition = WorkflowDefinition::new("ok")
        .with_initial("seed")
        .with_task(WorkflowTask::new("t1"))
        .with_task(WorkflowTask::new("t2").after("t1"))
        .with_task(WorkflowTask::new("t3"));
    assert_eq!(register(definition), Ok(()));
}

#[test]
fn structural_errors_are_rejected_with_their_code() {
    let cases = [
        (
            WorkflowDefinition::new("empty").with_initial("seed"),
            "JF-DEF-001",
        ),
        (
            WorkflowDefinition::new("twice")
                .with_initial("seed")
                .with_task(WorkflowTask::new("t1"))
                .with_task(WorkflowTask::new("t1")),
            "JF-DEF-002",
        ),
        (
            WorkflowDefinition::new("unknown-kind")
                .with_initial("seed")
                .with_task(WorkflowTask::new("resume.unknown")),
            "JF-DEF-003",
        ),
        (
            WorkflowDefinition::new("dangling")
                .with_initial("seed")
                .with_task(WorkflowTask::new("t1").after("t9")),
            "JF-DEF-004",
        ),
        (
            WorkflowDefinition::new("cycle")
                .with_initial("seed")
                .with_task(WorkflowTask::new("t1").after("t2"))
                .with_task(WorkflowTask::new("t2").after("t1")),
            "JF-DEF-005",
        ),
        (
            // t2 reads x but nothing upstream provides it.
            WorkflowDefinition::new("unsatisfied")
                .with_initial("seed")
                .with_task(WorkflowTask::new("t1"))
                .with_task(WorkflowTask::new("t2")),
            "JF-DEF-006",
        ),
        (
            WorkflowDefinition::new("zero-attempts")
                .with_initial("seed")
                .with_task(WorkflowTask::new("t1").with_retry(RetryPolicy {
                    max_attempts: 0,
                    ..RetryPolicy::default()
                })),
            "JF-DEF-007",
        ),
    ];
    for (definition, code) in cases {
        let name = definition.name.clone();
        assert_eq!(register(definition), Err(code.to_string()), "{}", name);
    }
}

#[test]
fn duplicate_workflow_names_are_rejected() {
    let mut builder = WorkflowRegistry::builder(contracts());
    let definition = WorkflowDefinition::new("dup")
        .with_initial("seed")
        .with_task(WorkflowTask::new("t1"));
    builder.register(definition.clone()).unwrap();
    let err = builder.register(definition).unwrap_err();
    assert_eq!(err.code, "JF-DEF-008");
}

#[test]
fn warnings_do_not_block_registration() {
    let definition = WorkflowDefinition::new("noisy")
        .with_initial("seed")
        .with_initial("unused")
        .with_task(WorkflowTask::new("t1"));
    let results = LintRegistry::new().run(&definition, &contracts());
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].code, "JF-DEF-102");
    assert_eq!(results[0].severity, LintSeverity::Info);
    assert_eq!(register(definition), Ok(()));
}

#[test]
fn missing_initial_keys_account_for_upstream_providers() {
    let definition = WorkflowDefinition::new("chain")
        .with_initial("seed")
        .with_task(WorkflowTask::new("t1"))
        .with_task(WorkflowTask::new("t2").after("t1"));
    let registry = contracts();

    let required = definition.required_initial_keys(&registry).unwrap();
    assert_eq!(
        required.into_iter().collect::<Vec<_>>(),
        vec![ContextKey::from("seed")]
    );
    let missing = definition
        .missing_initial_keys(&registry, &context(&[("x", json!(1))]))
        .unwrap();
    assert_eq!(missing, vec![ContextKey::from("seed")]);
    assert!(definition
        .missing_initial_keys(&registry, &context(&[("seed", json!(null))]))
        .unwrap()
        .is_empty());
}

#[test]
fn fingerprints_track_definition_content() {
    let base = WorkflowDefinition::new("chain")
        .with_initial("seed")
        .with_task(WorkflowTask::new("t1"))
        .with_task(WorkflowTask::new("t2").after("t1"));
    assert_eq!(base.fingerprint(), base.clone().fingerprint());
    assert_eq!(base.fingerprint().len(), 64);

    let changed = base.clone().with_task(WorkflowTask::new("t3"));
    assert_ne!(base.fingerprint(), changed.fingerprint());

    let mut timed = base.clone();
    timed.tasks[1].timeout_ms = Some(1_000);
    assert_ne!(base.fingerprint(), timed.fingerprint());
}

#[test]
fn yaml_documents_parse_and_report_errors() {
    let document = WorkflowCatalogDocument::from_yaml(
        r#"
workflows:
  - name: from-yaml
    initial_context: [seed]
    tasks:
      - kind: t1
      - kind: t2
        depends_on: [t1]
        retry:
          max_attempts: 3
          backoff_ms: 10
"#,
    )
    .unwrap();
    let definition = &document.workflows[0];
    assert_eq!(definition.tasks[1].retry.as_ref().unwrap().max_attempts, 3);
    assert_eq!(register(definition.clone()), Ok(()));

    let err = WorkflowCatalogDocument::from_yaml("workflows: [ {name: broken").unwrap_err();
    assert_eq!(err.code, "JF-DEF-000");
}

#[test]
fn extra_definition_files_extend_the_builtin_catalog() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("extra.yaml");
    fs::write(
        &path,
        r#"
workflows:
  - name: resume.reparse
    initial_context: [resumeText]
    tasks:
      - kind: resume.parsing
"#,
    )
    .unwrap();

    let registry = workflow_registry_builder(builtin_contracts().unwrap(), &[path.clone()])
        .unwrap()
        .build();
    assert!(registry.get("resume.reparse").is_ok());
    assert!(registry.get("job.analysis").is_ok());

    // Redefining a built-in name is a duplicate.
    fs::write(
        &path,
        r#"
workflows:
  - name: resume.import
    initial_context: [resumeText]
    tasks:
      - kind: resume.parsing
"#,
    )
    .unwrap();
    let err = workflow_registry_builder(builtin_contracts().unwrap(), &[path])
        .err()
        .unwrap();
    assert_eq!(err.code, "JF-DEF-008");
}

#[test]
fn builtin_workflows_lint_clean_of_errors() {
    let contracts = builtin_contracts().unwrap();
    for definition in builtin_workflows().unwrap().workflows {
        let errors: Vec<_> = LintRegistry::new()
            .run(&definition, &contracts)
            .into_iter()
            .filter(|result| result.severity == LintSeverity::Error)
            .collect();
        assert!(errors.is_empty(), "{}: {:?}", definition.name, errors);
    }
}

#[test]
fn job_analysis_needs_description_and_resume() {
    let contracts = builtin_contracts().unwrap();
    let registry = workflow_registry_builder(contracts.clone(), &[])
        .unwrap()
        .build();
    let analysis = registry.get("job.analysis").unwrap();
    let missing = analysis
        .definition
        .missing_initial_keys(&contracts, &context(&[("jobDescription", json!("Rust dev"))]))
        .unwrap();
    assert_eq!(missing, vec![ContextKey::from("parsedResume")]);
}
