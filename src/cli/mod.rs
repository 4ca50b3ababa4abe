pub mod args;
pub mod commands;

pub use args::{
    JobsArgs, LintArgs, OutputFormat, RetryArgs, StartArgs, StatusArgs, WorkflowsArgs,
    WorkspaceArgs,
};
use clap::{Parser, Subcommand};

const HELP_TEMPLATE: &str = "\
{name} {version}\n\
{about-with-newline}\n\
USAGE:\n    {usage}\n\
\nOPTIONS:\n{options}\n\
WORKFLOW COMMANDS:\n{subcommands}\n";

#[derive(Parser)]
#[command(name = "jobflow")]
#[command(version = crate::VERSION)]
#[command(about = "Workflow engine for AI-backed job-application pipelines")]
#[command(help_template = HELP_TEMPLATE)]
#[command(
    after_long_help = "Typical flow: import a resume, analyse a job against it, tailor the resume, and retry any step that failed."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[command(
        about = "Start a workflow for a job",
        long_about = "Start runs every task of the workflow in dependency order, streaming task events until the run settles. Starting again for the same job supersedes the previous run.",
        after_help = "Example:\n    jobflow start resume.import --job job-42 --set resumeText=@resume.txt"
    )]
    Start(StartArgs),
    #[command(
        about = "Resume a failed run",
        long_about = "Retry resets the failed tasks of a job's run to pending and schedules them again. Completed tasks and their outputs are kept.",
        after_help = "Example:\n    jobflow retry --job job-42"
    )]
    Retry(RetryArgs),
    #[command(
        about = "Show the persisted run of a job",
        long_about = "Status loads the job's run state. A run interrupted while tasks were in flight is reported as failed.",
        after_help = "Example:\n    jobflow status --job job-42 --format json"
    )]
    Status(StatusArgs),
    #[command(about = "List jobs with a recorded run")]
    Jobs(JobsArgs),
    #[command(
        about = "List registered workflows",
        after_help = "Example:\n    jobflow workflows --format json"
    )]
    Workflows(WorkflowsArgs),
    #[command(
        about = "Check workflow definitions against the task catalog",
        long_about = "Lint validates every definition in a YAML file: unknown task kinds, dependency cycles, inputs that no ancestor or initial key provides.",
        after_help = "Example:\n    jobflow lint workflows/custom.yaml"
    )]
    Lint(LintArgs),
}

pub async fn run(args: Args) -> crate::Result<()> {
    match args.command {
        Command::Start(start_args) => commands::start(start_args).await,
        Command::Retry(retry_args) => commands::retry(retry_args).await,
        Command::Status(status_args) => commands::status(status_args).await,
        Command::Jobs(jobs_args) => commands::jobs(jobs_args).await,
        Command::Workflows(workflows_args) => commands::workflows(workflows_args).await,
        Command::Lint(lint_args) => commands::lint(lint_args).await,
    }
}
