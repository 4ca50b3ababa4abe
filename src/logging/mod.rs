pub mod config;
pub mod context;
pub mod layers;

pub use context::{detect_context, ExecutionContext};
pub use layers::console::ConsoleOutput;

use crate::logging::config::LoggingConfig;
use crate::logging::layers::{console, file, opentelemetry, BoxLayer};
use crate::{cli::Command, Result};
use anyhow::{anyhow, Context};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::Registry;
use url::Url;

static LOGGER_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Guards that keep logging sinks active for the duration of the command.
pub struct LoggingGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
    _otel_guard: Option<opentelemetry::OtlpGuard>,
    console_output: ConsoleOutput,
    log_dir: PathBuf,
}

impl LoggingGuard {
    /// Returns the console output configuration used during initialization.
    pub fn console_output(&self) -> ConsoleOutput {
        self.console_output
    }

    /// Directory holding the daily JSON log files.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

/// Initialize the logging framework for the provided CLI command.
///
/// Filters come from `RUST_LOG`, then the configured default level. Logs go
/// as daily JSON lines under `.jobflow/logs` in the workspace, to stderr
/// unless the context is headless, and to an OTLP collector when one is
/// configured.
/// Errors when invoked more than once per process.
pub fn init(command: &Command) -> Result<LoggingGuard> {
    if LOGGER_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Err(anyhow!("logging already initialized"));
    }

    let context = detect_context(command);
    let workspace_root = resolve_workspace_path(command);
    let config = LoggingConfig::load(workspace_root.as_deref())?;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.default_level))
        .context("failed to configure tracing level")?;
    let log_dir = file::log_dir(&config, workspace_root.as_deref())?;
    type BaseRegistry = Registry;
    type FileSubscriber = file::FileLayerStack<BaseRegistry>;
    type ConsoleSubscriber = console::ConsoleLayerStack<FileSubscriber>;

    let (file_layer, file_guard) =
        file::file_layer::<BaseRegistry>(&log_dir, config.enable_file)?;

    let subscriber = tracing_subscriber::registry();
    let subscriber = subscriber.with(file_layer);

    let console_output = console::select_console_output(context, config.console_output);
    let console_layer = console::console_layer::<FileSubscriber>(console_output);
    let subscriber = subscriber.with(console_layer);

    let mut otel_warning = None;
    let (otel_layer, otel_guard): (BoxLayer<ConsoleSubscriber>, _) =
        match otel_endpoint(&config) {
            Some(endpoint) => match opentelemetry::otlp_layer::<ConsoleSubscriber>(
                &endpoint,
                &config.opentelemetry,
                workspace_root.as_deref(),
            ) {
                Ok((layer, guard)) => (layer, Some(guard)),
                Err(err) => {
                    otel_warning = Some(err.to_string());
                    (layers::noop_layer(), None)
                }
            },
            None => (layers::noop_layer(), None),
        };

    let subscriber = subscriber.with(otel_layer);
    let subscriber = subscriber.with(env_filter);
    subscriber.init();

    if let Some(warning) = otel_warning {
        tracing::warn!("OpenTelemetry disabled: {}", warning);
    }

    Ok(LoggingGuard {
        _file_guard: file_guard,
        _otel_guard: otel_guard,
        console_output,
        log_dir,
    })
}

fn otel_endpoint(config: &LoggingConfig) -> Option<Url> {
    if !config.opentelemetry.enabled {
        return None;
    }
    // Validated by LoggingConfig::load.
    config
        .opentelemetry
        .endpoint
        .as_deref()
        .and_then(|endpoint| Url::parse(endpoint).ok())
}

fn resolve_workspace_path(command: &Command) -> Option<PathBuf> {
    let explicit = match command {
        Command::Start(args) => args.workspace.workspace.clone(),
        Command::Retry(args) => args.workspace.workspace.clone(),
        Command::Status(args) => args.workspace.workspace.clone(),
        Command::Jobs(args) => args.workspace.workspace.clone(),
        Command::Workflows(args) => args.workspace.workspace.clone(),
        Command::Lint(_) => None,
    };
    explicit.or_else(|| env::current_dir().ok())
}
