use crate::{
    cli::args::{
        JobsArgs, LintArgs, OutputFormat, RetryArgs, StartArgs, StatusArgs, WorkflowsArgs,
        WorkspaceArgs,
    },
    core::{
        config::{ConfigLoader, ConfigValidator, JobflowConfig},
        error::AppError,
        provider::OpenAiCompatibleProvider,
        tasks,
        workflow::{
            lint::{LintRegistry, LintSeverity},
            FileRunStateStore, JobId, RunState, Subscription, WorkflowCatalogDocument,
            WorkflowEngine, WorkflowEvent, WorkflowStatus,
        },
    },
    Result,
};
use anyhow::{anyhow, Context};
use serde_json::{json, Map, Value};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const EVENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) fn resolve_workspace(args: &WorkspaceArgs) -> Result<PathBuf> {
    match &args.workspace {
        Some(path) => Ok(path.clone()),
        None => env::current_dir().context("failed to resolve current directory"),
    }
}

fn load_config(workspace: &Path) -> Result<JobflowConfig> {
    let config = ConfigLoader::load_from_workspace(workspace)?;
    ConfigValidator::validate(&config)?;
    Ok(config)
}

/// Wire config, built-in catalog, provider and file store into an engine.
fn build_engine(workspace: &Path) -> Result<WorkflowEngine> {
    let config = load_config(workspace)?;
    let contracts = tasks::builtin_contracts()?;
    let extra_files: Vec<PathBuf> = config
        .workflows
        .files
        .iter()
        .map(|file| workspace.join(file))
        .collect();
    let workflows = tasks::workflow_registry_builder(contracts, &extra_files)?.build();
    let provider = Arc::new(OpenAiCompatibleProvider::from_config(&config.provider)?);
    let (executors, _llm) = tasks::builtin_executors(provider, None)?;
    let store = Arc::new(FileRunStateStore::new(
        config.engine.resolve_state_dir(workspace),
    ));
    let engine = WorkflowEngine::builder(workflows)
        .executors(executors)
        .store(store)
        .settings(config.engine.settings()?)
        .build()?;
    Ok(engine)
}

fn parse_job(raw: &str) -> Result<JobId> {
    Ok(JobId::parse(raw)?)
}

/// Merge `--context FILE` and `--set` pairs; later `--set` values win.
pub(crate) fn initial_context(
    context_file: Option<&Path>,
    pairs: &[String],
) -> Result<Map<String, Value>> {
    let mut context = match context_file {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read context file {}", path.display()))?;
            match serde_json::from_str::<Value>(&raw)
                .with_context(|| format!("context file {} is not JSON", path.display()))?
            {
                Value::Object(map) => map,
                _ => return Err(anyhow!("context file {} must hold a JSON object", path.display())),
            }
        }
        None => Map::new(),
    };

    for pair in pairs {
        let (key, raw_value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("--set expects KEY=VALUE, got '{}'", pair))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(anyhow!("--set key must not be empty"));
        }
        let value = if let Some(path) = raw_value.strip_prefix('@') {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read {} for --set {}", path, key))?;
            Value::String(text)
        } else {
            serde_json::from_str(raw_value).unwrap_or_else(|_| Value::String(raw_value.to_string()))
        };
        context.insert(key.to_string(), value);
    }
    Ok(context)
}

pub async fn start(args: StartArgs) -> Result<()> {
    let workspace = resolve_workspace(&args.workspace)?;
    let job_id = parse_job(&args.job)?;
    let context = initial_context(args.context.as_deref(), &args.set)?;
    let engine = build_engine(&workspace)?;

    let (subscription, events) = engine.events().channel();
    let state = engine.start(&args.workflow, &job_id, context).await?;
    tracing::info!(job_id = %job_id, run_id = %state.run_id, "run started");
    let printer = tokio::spawn(print_events(events, job_id.clone(), args.json_events));

    let settled = engine.wait_until_settled(&job_id).await;
    finish(subscription, printer, settled).await
}

pub async fn retry(args: RetryArgs) -> Result<()> {
    let workspace = resolve_workspace(&args.workspace)?;
    let job_id = parse_job(&args.job)?;
    let engine = build_engine(&workspace)?;

    let (subscription, events) = engine.events().channel();
    let outcome = engine.retry(&job_id).await?;
    if !args.json_events {
        let reset: Vec<&str> = outcome.failed_tasks.iter().map(|kind| kind.as_str()).collect();
        println!("Retrying {}: {}", job_id, reset.join(", "));
    }
    let printer = tokio::spawn(print_events(events, job_id.clone(), args.json_events));

    let settled = engine.wait_until_settled(&job_id).await;
    finish(subscription, printer, settled).await
}

async fn finish(
    subscription: Subscription,
    printer: JoinHandle<()>,
    settled: std::result::Result<RunState, AppError>,
) -> Result<()> {
    // The dispatcher may still be delivering the terminal event.
    let _ = timeout(EVENT_DRAIN_TIMEOUT, printer).await;
    drop(subscription);
    let state = settled?;
    match state.status {
        WorkflowStatus::Completed => Ok(()),
        _ => Err(anyhow!(
            "workflow {} {} for job {}: {}",
            state.workflow_name,
            state.status,
            state.job_id,
            state.error.as_deref().unwrap_or("no error recorded")
        )),
    }
}

async fn print_events(mut events: UnboundedReceiver<WorkflowEvent>, job_id: JobId, json: bool) {
    while let Some(event) = events.recv().await {
        if event.job_id() != &job_id {
            continue;
        }
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(err) => tracing::warn!(error = %err, "failed to serialize event"),
            }
        } else {
            match &event {
                WorkflowEvent::TaskCompleted(e) => println!("✓ {}", e.kind),
                WorkflowEvent::TaskFailed(e) => println!("✗ {} ({}): {}", e.kind, e.error_kind, e.error),
                WorkflowEvent::WorkflowCompleted(e) => match &e.error {
                    Some(error) => println!("{} {}: {}", job_id, e.status, error),
                    None => println!("{} {}", job_id, e.status),
                },
                WorkflowEvent::StateChanged(_) | WorkflowEvent::AiPartial(_) => {}
            }
        }
        if matches!(event, WorkflowEvent::WorkflowCompleted(_)) {
            break;
        }
    }
}

pub async fn status(args: StatusArgs) -> Result<()> {
    let workspace = resolve_workspace(&args.workspace)?;
    let job_id = parse_job(&args.job)?;
    let engine = build_engine(&workspace)?;
    let Some(state) = engine.get_state(&job_id).await? else {
        return Err(anyhow!("no run recorded for job {}", job_id));
    };

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&state)?),
        OutputFormat::Text => print_state(&state),
    }
    Ok(())
}

fn print_state(state: &RunState) {
    println!("Job: {}", state.job_id);
    println!("Workflow: {}", state.workflow_name);
    println!("Run: {}", state.run_id);
    println!("Status: {}", state.status);
    println!("Started: {}", state.started_at);
    println!("Updated: {}", state.updated_at);
    println!("Tasks:");
    for (kind, status) in &state.task_states {
        match state.task_errors.get(kind) {
            Some(error) => println!("  {:<20} {:<10} {}", kind.as_str(), status.as_str(), error),
            None => println!("  {:<20} {}", kind.as_str(), status.as_str()),
        }
    }
    if let Some(error) = &state.error {
        println!("Error: {}", error);
    }
}

pub async fn jobs(args: JobsArgs) -> Result<()> {
    let workspace = resolve_workspace(&args.workspace)?;
    let engine = build_engine(&workspace)?;
    let jobs = engine.list_jobs()?;
    if jobs.is_empty() {
        println!("No jobs recorded");
        return Ok(());
    }
    for job_id in jobs {
        match engine.get_state(&job_id).await? {
            Some(state) => println!(
                "{:<24} {:<20} {:<10} {}",
                job_id.as_str(),
                state.workflow_name,
                state.status.as_str(),
                state.updated_at
            ),
            None => println!("{:<24} (no state)", job_id.as_str()),
        }
    }
    Ok(())
}

pub async fn workflows(args: WorkflowsArgs) -> Result<()> {
    let workspace = resolve_workspace(&args.workspace)?;
    let config = load_config(&workspace)?;
    let extra_files: Vec<PathBuf> = config
        .workflows
        .files
        .iter()
        .map(|file| workspace.join(file))
        .collect();
    let registry =
        tasks::workflow_registry_builder(tasks::builtin_contracts()?, &extra_files)?.build();

    match args.format {
        OutputFormat::Json => {
            let listing: Vec<Value> = registry
                .list()
                .iter()
                .map(|workflow| {
                    json!({
                        "name": workflow.definition.name,
                        "description": workflow.definition.description,
                        "initialContext": workflow.definition.initial_context,
                        "tasks": workflow.definition.tasks.iter().map(|t| &t.kind).collect::<Vec<_>>(),
                        "fingerprint": workflow.fingerprint,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
        OutputFormat::Text => {
            for workflow in registry.list() {
                let definition = &workflow.definition;
                println!("{}", definition.name);
                if let Some(description) = &definition.description {
                    println!("  {}", description);
                }
                let initial: Vec<&str> =
                    definition.initial_context.iter().map(|key| key.as_str()).collect();
                println!("  initial context: {}", initial.join(", "));
                for task in &definition.tasks {
                    if task.depends_on.is_empty() {
                        println!("  - {}", task.kind);
                    } else {
                        let deps: Vec<&str> =
                            task.depends_on.iter().map(|kind| kind.as_str()).collect();
                        println!("  - {} (after {})", task.kind, deps.join(", "));
                    }
                }
            }
        }
    }
    Ok(())
}

pub async fn lint(args: LintArgs) -> Result<()> {
    let document = WorkflowCatalogDocument::load_from_file(&args.file)?;
    let contracts = tasks::builtin_contracts()?;
    let registry = LintRegistry::new();

    let mut errors = 0usize;
    let mut report = Vec::new();
    for definition in &document.workflows {
        let results = registry.run(definition, &contracts);
        errors += results
            .iter()
            .filter(|result| result.severity == LintSeverity::Error)
            .count();
        report.push((definition.name.clone(), results));
    }

    match args.format {
        OutputFormat::Json => {
            let listing: Vec<Value> = report
                .iter()
                .map(|(name, results)| json!({"workflow": name, "results": results}))
                .collect();
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
        OutputFormat::Text => {
            for (name, results) in &report {
                if results.is_empty() {
                    println!("{}: ok", name);
                    continue;
                }
                for result in results {
                    let location = result.location.as_deref().unwrap_or("-");
                    println!(
                        "{}: {} {} [{}] {}",
                        name, result.severity, result.code, location, result.message
                    );
                    if let Some(suggestion) = &result.suggestion {
                        println!("    hint: {}", suggestion);
                    }
                }
            }
        }
    }

    if errors > 0 {
        return Err(anyhow!(
            "{} lint error(s) in {}",
            errors,
            args.file.display()
        ));
    }
    Ok(())
}
