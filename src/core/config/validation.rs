#![allow(clippy::result_large_err)]

use super::JobflowConfig;
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use url::Url;

pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &JobflowConfig) -> Result<(), AppError> {
        let base_url = Url::parse(&config.provider.base_url).map_err(|err| {
            invalid(format!(
                "provider.base_url '{}' is not a valid URL: {}",
                config.provider.base_url, err
            ))
        })?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(invalid("provider.base_url must use http or https"));
        }

        if config.provider.model.trim().is_empty() {
            return Err(invalid("provider.model cannot be empty"));
        }

        if config.provider.api_key_env.trim().is_empty() {
            return Err(invalid("provider.api_key_env cannot be empty"));
        }

        config.provider.request_timeout()?;
        config.engine.task_timeout()?;

        if config.engine.max_attempts == 0 {
            return Err(invalid("engine.max_attempts must be >= 1"));
        }

        let multiplier = config.engine.backoff_multiplier;
        if multiplier.is_nan() || multiplier < 1.0 {
            return Err(invalid("engine.backoff_multiplier must be >= 1.0"));
        }

        if config.engine.state_dir.as_os_str().is_empty() {
            return Err(invalid("engine.state_dir cannot be empty"));
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> AppError {
    AppError::new(ErrorCategory::ConfigError, message).with_code("JF-CONFIG-003")
}
