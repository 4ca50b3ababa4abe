use clap::{Args, ValueEnum};
use std::path::PathBuf;

#[derive(Args, Clone, Debug, Default)]
pub struct WorkspaceArgs {
    /// Workspace holding jobflow.toml and the state directory (default: current directory)
    #[arg(long, value_name = "PATH")]
    pub workspace: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Registered workflow to run (see `jobflow workflows`)
    #[arg(value_name = "WORKFLOW")]
    pub workflow: String,

    /// Job the run belongs to; starting again supersedes the previous run
    #[arg(long, value_name = "JOB_ID")]
    pub job: String,

    /// JSON object file seeding the initial context
    #[arg(long, value_name = "FILE", help_heading = "Initial Context")]
    pub context: Option<PathBuf>,

    /// Set one context key. VALUE is parsed as JSON when possible, `@path` reads a text file
    #[arg(long = "set", value_name = "KEY=VALUE", help_heading = "Initial Context")]
    pub set: Vec<String>,

    /// Print every event, partial results included, as one JSON object per line
    #[arg(long, help_heading = "Output Options")]
    pub json_events: bool,

    #[command(flatten)]
    pub workspace: WorkspaceArgs,
}

#[derive(Args, Debug)]
pub struct RetryArgs {
    /// Job whose failed run should be resumed
    #[arg(long, value_name = "JOB_ID")]
    pub job: String,

    /// Print every event as one JSON object per line
    #[arg(long, help_heading = "Output Options")]
    pub json_events: bool,

    #[command(flatten)]
    pub workspace: WorkspaceArgs,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    #[arg(long, value_name = "JOB_ID")]
    pub job: String,

    /// Output format (default: text)
    #[arg(long, value_enum, default_value = "text")]
    pub format: OutputFormat,

    #[command(flatten)]
    pub workspace: WorkspaceArgs,
}

#[derive(Args, Debug)]
pub struct JobsArgs {
    #[command(flatten)]
    pub workspace: WorkspaceArgs,
}

#[derive(Args, Debug)]
pub struct WorkflowsArgs {
    /// Output format (default: text)
    #[arg(long, value_enum, default_value = "text")]
    pub format: OutputFormat,

    #[command(flatten)]
    pub workspace: WorkspaceArgs,
}

#[derive(Args, Debug)]
pub struct LintArgs {
    /// YAML file with a top-level `workflows` list
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Output format (default: text)
    #[arg(long, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}
