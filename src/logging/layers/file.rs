//! JSON-lines file sink.
//!
//! One file per day under the workspace's `.jobflow/logs`. Every record is
//! flattened and carries the enclosing `task` span, so the lines of a single
//! job can be pulled out with `jq 'select(.span.job_id == "job-42")'`.

use crate::logging::config::LoggingConfig;
use crate::Result;
use anyhow::{anyhow, Context};
use std::fs::create_dir_all;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::{self as tracing_fmt, format, writer::BoxMakeWriter};
use tracing_subscriber::registry::LookupSpan;

const FILE_PREFIX: &str = "jobflow";
const FILE_SUFFIX: &str = "log";
const RETAINED_FILES: usize = 14;

pub type FileFmtLayer<S> =
    tracing_fmt::Layer<S, format::JsonFields, format::Format<format::Json>, BoxMakeWriter>;

pub type FileLayerStack<S> = tracing_subscriber::layer::Layered<FileFmtLayer<S>, S>;

/// Directory holding the daily log files.
///
/// Defaults to `<workspace>/.jobflow/logs`, or the platform data dir when no
/// workspace is known. A relative `logging.log_dir` is resolved against the
/// same anchor and may not climb out of it.
pub fn log_dir(config: &LoggingConfig, workspace_root: Option<&Path>) -> Result<PathBuf> {
    match &config.log_dir {
        Some(custom) if custom.is_absolute() => Ok(custom.clone()),
        Some(custom) => {
            if custom
                .components()
                .any(|component| matches!(component, Component::ParentDir))
            {
                return Err(anyhow!(
                    "logging.log_dir '{}' must stay inside {}",
                    custom.display(),
                    anchor(workspace_root)?.display()
                ));
            }
            Ok(anchor(workspace_root)?.join(custom))
        }
        None => Ok(anchor(workspace_root)?.join("logs")),
    }
}

fn anchor(workspace_root: Option<&Path>) -> Result<PathBuf> {
    match workspace_root {
        Some(workspace) => Ok(workspace.join(".jobflow")),
        None => dirs_next::data_local_dir()
            .map(|dir| dir.join("jobflow"))
            .ok_or_else(|| anyhow!("no workspace and no local data directory for logs")),
    }
}

/// Build the JSON file layer. A disabled sink still yields a layer so the
/// subscriber stack keeps one shape.
pub fn file_layer<S>(dir: &Path, enabled: bool) -> Result<(FileFmtLayer<S>, Option<WorkerGuard>)>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    if !enabled {
        return Ok((json_layer(BoxMakeWriter::new(io::sink)), None));
    }
    create_dir_all(dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(FILE_PREFIX)
        .filename_suffix(FILE_SUFFIX)
        .max_log_files(RETAINED_FILES)
        .build(dir)
        .with_context(|| format!("failed to open log files in {}", dir.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);
    Ok((json_layer(BoxMakeWriter::new(writer)), Some(guard)))
}

fn json_layer<S>(writer: BoxMakeWriter) -> FileFmtLayer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_fmt::layer()
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(false)
        .with_ansi(false)
        .with_writer(writer)
}
