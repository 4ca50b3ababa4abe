#![allow(clippy::result_large_err)]

pub mod loader;
pub mod validation;

pub use loader::ConfigLoader;
pub use validation::ConfigValidator;

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::definition::RetryPolicy;
use crate::core::workflow::engine::EngineSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "jobflow.toml";

/// Main configuration loaded from jobflow.toml. The `[logging]` table is read
/// separately by `logging::config`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobflowConfig {
    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub workflows: WorkflowsConfig,
}

/// LLM provider connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of an OpenAI-compatible API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Per-request timeout, humantime format (e.g. "90s")
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,
}

/// Engine defaults applied to tasks without their own retry/timeout policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Per-attempt task timeout, humantime format. Unset means no limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_timeout: Option<String>,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f32,

    #[serde(default)]
    pub jitter_ms: u64,
}

/// Additional workflow definition files, relative to the workspace
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkflowsConfig {
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_request_timeout() -> String {
    "120s".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(crate::core::workflow::store::DEFAULT_STATE_DIR)
}

fn default_max_attempts() -> usize {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f32 {
    2.0
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            task_timeout: None,
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_ms: 0,
        }
    }
}

pub(crate) fn parse_duration(field: &str, raw: &str) -> Result<Duration, AppError> {
    humantime::parse_duration(raw.trim()).map_err(|err| {
        AppError::new(
            ErrorCategory::ConfigError,
            format!("{} must be a duration like \"30s\" or \"2m\": {}", field, err),
        )
        .with_code("JF-CONFIG-002")
    })
}

impl ProviderConfig {
    pub fn request_timeout(&self) -> Result<Duration, AppError> {
        parse_duration("provider.request_timeout", &self.request_timeout)
    }
}

impl EngineConfig {
    pub fn task_timeout(&self) -> Result<Option<Duration>, AppError> {
        self.task_timeout
            .as_deref()
            .map(|raw| parse_duration("engine.task_timeout", raw))
            .transpose()
    }

    /// State directory, resolved against the workspace when relative.
    pub fn resolve_state_dir(&self, workspace: &Path) -> PathBuf {
        if self.state_dir.is_absolute() {
            self.state_dir.clone()
        } else {
            workspace.join(&self.state_dir)
        }
    }

    pub fn settings(&self) -> Result<EngineSettings, AppError> {
        Ok(EngineSettings {
            default_retry: RetryPolicy {
                max_attempts: self.max_attempts,
                backoff_ms: self.backoff_ms,
                backoff_multiplier: Some(self.backoff_multiplier),
                jitter_ms: Some(self.jitter_ms),
            },
            task_timeout: self.task_timeout()?,
        })
    }
}
