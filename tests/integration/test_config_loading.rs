use jobflow::core::config::{ConfigLoader, ConfigValidator, JobflowConfig};
use serial_test::serial;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

fn clear_jobflow_env() {
    for v in &[
        "JOBFLOW_PROVIDER_BASE_URL",
        "JOBFLOW_PROVIDER_MODEL",
        "JOBFLOW_STATE_DIR",
        "JOBFLOW_TASK_TIMEOUT",
        "JOBFLOW_MAX_ATTEMPTS",
    ] {
        env::remove_var(v);
    }
}

/// Test integration of config loading with environment variables
#[test]
#[serial]
fn test_config_loading_integration() {
    clear_jobflow_env();
    let temp_dir = TempDir::new().unwrap();
    let workspace_path = temp_dir.path();

    let config_content = r#"
[provider]
base_url = "http://localhost:11434/v1"
api_key_env = "LOCAL_LLM_KEY"
model = "llama3.1"
request_timeout = "45s"

[engine]
state_dir = ".custom/state"
task_timeout = "2m"
max_attempts = 5
backoff_ms = 250
backoff_multiplier = 1.5

[workflows]
files = ["workflows/extra.yaml"]

[logging]
log_level = "debug"
"#;
    fs::write(workspace_path.join("jobflow.toml"), config_content).unwrap();

    let config = ConfigLoader::load_from_workspace(workspace_path).unwrap();
    ConfigValidator::validate(&config).unwrap();

    assert_eq!(config.provider.base_url, "http://localhost:11434/v1");
    assert_eq!(config.provider.api_key_env, "LOCAL_LLM_KEY");
    assert_eq!(config.provider.model, "llama3.1");
    assert_eq!(
        config.provider.request_timeout().unwrap(),
        Duration::from_secs(45)
    );
    assert_eq!(
        config.engine.resolve_state_dir(workspace_path),
        workspace_path.join(".custom/state")
    );
    assert_eq!(
        config.engine.task_timeout().unwrap(),
        Some(Duration::from_secs(120))
    );
    assert_eq!(
        config.workflows.files,
        vec![PathBuf::from("workflows/extra.yaml")]
    );

    let settings = config.engine.settings().unwrap();
    assert_eq!(settings.default_retry.max_attempts, 5);
    assert_eq!(settings.default_retry.backoff_ms, 250);
    assert_eq!(settings.default_retry.backoff_multiplier, Some(1.5));
}

/// Environment variables win over file values
#[test]
#[serial]
fn test_env_overrides_file_values() {
    clear_jobflow_env();
    let temp_dir = TempDir::new().unwrap();
    let workspace_path = temp_dir.path();
    fs::write(
        workspace_path.join("jobflow.toml"),
        r#"
[provider]
base_url = "http://file.example/v1"
model = "file-model"

[engine]
max_attempts = 2
"#,
    )
    .unwrap();

    env::set_var("JOBFLOW_PROVIDER_BASE_URL", "http://env.example/v1");
    env::set_var("JOBFLOW_PROVIDER_MODEL", "env-model");
    env::set_var("JOBFLOW_STATE_DIR", "/var/lib/jobflow");
    env::set_var("JOBFLOW_TASK_TIMEOUT", "90s");
    env::set_var("JOBFLOW_MAX_ATTEMPTS", "7");

    let config = ConfigLoader::load_from_workspace(workspace_path).unwrap();
    clear_jobflow_env();

    assert_eq!(config.provider.base_url, "http://env.example/v1");
    assert_eq!(config.provider.model, "env-model");
    assert_eq!(
        config.engine.resolve_state_dir(workspace_path),
        PathBuf::from("/var/lib/jobflow")
    );
    assert_eq!(
        config.engine.task_timeout().unwrap(),
        Some(Duration::from_secs(90))
    );
    assert_eq!(config.engine.max_attempts, 7);
}

/// A non-numeric attempt override is ignored
#[test]
#[serial]
fn test_invalid_numeric_override_is_ignored() {
    clear_jobflow_env();
    let temp_dir = TempDir::new().unwrap();
    env::set_var("JOBFLOW_MAX_ATTEMPTS", "many");
    let config = ConfigLoader::load_from_workspace(temp_dir.path()).unwrap();
    clear_jobflow_env();
    assert_eq!(config.engine.max_attempts, 3);
}

/// Missing file yields defaults
#[test]
#[serial]
fn test_defaults_without_config_file() {
    clear_jobflow_env();
    let temp_dir = TempDir::new().unwrap();

    let config = ConfigLoader::load_from_workspace(temp_dir.path()).unwrap();
    ConfigValidator::validate(&config).unwrap();

    let defaults = JobflowConfig::default();
    assert_eq!(config.provider.base_url, defaults.provider.base_url);
    assert_eq!(config.provider.model, "gpt-4o-mini");
    assert_eq!(config.provider.api_key_env, "OPENAI_API_KEY");
    assert_eq!(
        config.engine.resolve_state_dir(temp_dir.path()),
        temp_dir.path().join(".jobflow/state")
    );
    assert!(config.workflows.files.is_empty());
}

/// Malformed TOML is a parse error
#[test]
#[serial]
fn test_malformed_config_is_reported() {
    clear_jobflow_env();
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join("jobflow.toml"),
        "[provider\nmodel = \"x\"",
    )
    .unwrap();

    let err = ConfigLoader::load_from_workspace(temp_dir.path()).unwrap_err();
    assert_eq!(err.code, "JF-CONFIG-001");
    assert!(err.message.contains("jobflow.toml"));
}

/// Semantically invalid values are rejected by the validator
#[test]
#[serial]
fn test_validation_failures() {
    clear_jobflow_env();
    let cases = [
        ("[provider]\nbase_url = \"not a url\"", "JF-CONFIG-003"),
        ("[provider]\nbase_url = \"ftp://llm.example\"", "JF-CONFIG-003"),
        ("[provider]\nmodel = \"  \"", "JF-CONFIG-003"),
        ("[provider]\nrequest_timeout = \"soon\"", "JF-CONFIG-002"),
        ("[engine]\nmax_attempts = 0", "JF-CONFIG-003"),
        ("[engine]\nbackoff_multiplier = 0.5", "JF-CONFIG-003"),
        ("[engine]\ntask_timeout = \"forever\"", "JF-CONFIG-002"),
    ];
    for (content, code) in cases {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("jobflow.toml"), content).unwrap();
        let config = ConfigLoader::load_from_workspace(temp_dir.path()).unwrap();
        let err = ConfigValidator::validate(&config).unwrap_err();
        assert_eq!(err.code, code, "{}", content);
    }
}
