use crate::cli::Command;
use std::env;

/// Execution contexts that influence how logging is routed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionContext {
    /// Long-running commands that stream task events to stdout.
    Streaming,
    /// One-shot queries that print a report and exit.
    Query,
    /// Embedded or scripted use where the console must stay quiet.
    Headless,
}

impl ExecutionContext {
    /// Returns `true` when console sinks should be disabled.
    pub fn disables_console(self) -> bool {
        matches!(self, ExecutionContext::Headless)
    }
}

/// Derive the active execution context from a parsed CLI command plus overrides.
pub fn detect_context(command: &Command) -> ExecutionContext {
    if headless_override_enabled() {
        return ExecutionContext::Headless;
    }

    match command {
        Command::Start(_) | Command::Retry(_) => ExecutionContext::Streaming,
        Command::Status(_) | Command::Jobs(_) | Command::Workflows(_) | Command::Lint(_) => {
            ExecutionContext::Query
        }
    }
}

fn headless_override_enabled() -> bool {
    env::var("JOBFLOW_HEADLESS")
        .map(|value| value.trim() == "1")
        .unwrap_or(false)
}
