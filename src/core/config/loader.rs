#![allow(clippy::result_large_err)]

use super::{JobflowConfig, CONFIG_FILE_NAME};
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use std::env;
use std::path::{Path, PathBuf};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load config from `<workspace>/jobflow.toml`, falling back to defaults when
    /// the file is absent. Environment variables override file values.
    pub fn load_from_workspace(workspace_path: &Path) -> Result<JobflowConfig, AppError> {
        let config_path = workspace_path.join(CONFIG_FILE_NAME);
        let mut config = Self::load_from_file(&config_path)?.unwrap_or_default();
        Self::apply_env_overrides(&mut config);
        Ok(config)
    }

    /// Returns Ok(None) if the file doesn't exist
    pub fn load_from_file(path: &Path) -> Result<Option<JobflowConfig>, AppError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::new(
                ErrorCategory::IoError,
                format!("Failed to read config file {}: {}", path.display(), e),
            )
        })?;

        let config: JobflowConfig = toml::from_str(&content).map_err(|e| {
            AppError::new(
                ErrorCategory::ConfigError,
                format!("Failed to parse config file {}: {}", path.display(), e),
            )
            .with_code("JF-CONFIG-001")
        })?;

        Ok(Some(config))
    }

    fn apply_env_overrides(config: &mut JobflowConfig) {
        if let Ok(base_url) = env::var("JOBFLOW_PROVIDER_BASE_URL") {
            config.provider.base_url = base_url;
        }

        if let Ok(model) = env::var("JOBFLOW_PROVIDER_MODEL") {
            config.provider.model = model;
        }

        if let Ok(state_dir) = env::var("JOBFLOW_STATE_DIR") {
            config.engine.state_dir = PathBuf::from(state_dir);
        }

        if let Ok(task_timeout) = env::var("JOBFLOW_TASK_TIMEOUT") {
            config.engine.task_timeout = Some(task_timeout);
        }

        if let Ok(max_attempts) = env::var("JOBFLOW_MAX_ATTEMPTS") {
            if let Ok(max_attempts) = max_attempts.parse::<usize>() {
                config.engine.max_attempts = max_attempts;
            }
        }
    }

    pub fn env_var_documentation() -> &'static [&'static str] {
        &[
            "JOBFLOW_PROVIDER_BASE_URL - Override provider base URL (default: https://api.openai.com/v1)",
            "JOBFLOW_PROVIDER_MODEL - Override provider model (default: gpt-4o-mini)",
            "JOBFLOW_STATE_DIR - Override run state directory (default: .jobflow/state)",
            "JOBFLOW_TASK_TIMEOUT - Override per-attempt task timeout (e.g. 90s)",
            "JOBFLOW_MAX_ATTEMPTS - Override default attempts per task (default: 3)",
        ]
    }
}
