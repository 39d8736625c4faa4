//! Configuration loading: main.toml, secrets.toml and environment overrides

use serial_test::serial;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

use conductor::config::manager::env;
use conductor::config::{Config, ExecutionEnvironment};
use conductor::ConfigManager;

fn write_config_dir(root: &Path, main: Option<&str>, secrets: Option<&str>) -> String {
    let config_dir = root.join("config");
    fs::create_dir(&config_dir).unwrap();
    if let Some(main) = main {
        fs::write(config_dir.join("main.toml"), main).unwrap();
    }
    if let Some(secrets) = secrets {
        fs::write(config_dir.join("secrets.toml"), secrets).unwrap();
    }
    config_dir.display().to_string()
}

#[test]
fn test_parse_main_config() {
    let main_toml = r#"
host = "127.0.0.1"
port = 9000
database_path = "/var/lib/conductor/conductor.db"
callback_url = "http://conductor:9000"

[dirs]
run_dir = "/srv/run"
stack_dir = "/srv/stack"
tmp_dir = "/srv/tmp"

[executor]
default_environment = "celery"
runner_url = "http://runner:8745"

[scheduler]
poll_interval_ms = 250

[config_rotation]
enabled = false
schedule = "0 30 3 * * *"
keep_count = 5

[maintenance_actions]
turn_on = "mm_on"
turn_off = "mm_off"
host_turn_on = "host_mm_on"
host_turn_off = "host_mm_off"
"#;

    let config: Config = toml::from_str(main_toml).unwrap();

    assert_eq!(config.host, "127.0.0.1");
    assert_eq!(config.port, 9000);
    assert_eq!(config.dirs.job_dir(42), Path::new("/srv/run/42"));
    assert_eq!(config.executor.default_environment, ExecutionEnvironment::Celery);
    assert_eq!(config.executor.runner_url, "http://runner:8745");
    assert_eq!(config.scheduler.poll_interval_ms, 250);
    assert!(!config.config_rotation.enabled);
    assert_eq!(config.config_rotation.keep_count, 5);
    assert_eq!(config.maintenance_actions.host_turn_off, "host_mm_off");
    assert!(config.secret_key.is_empty());
}

#[test]
fn test_sections_default_when_missing() {
    let config: Config = toml::from_str("port = 8100").unwrap();
    let defaults = Config::default();

    assert_eq!(config.port, 8100);
    assert_eq!(config.host, defaults.host);
    assert_eq!(config.executor.default_environment, ExecutionEnvironment::Local);
    assert_eq!(config.executor.ansible_command, "ansible-playbook");
    assert_eq!(
        config.scheduler.supervisor_interval_seconds,
        defaults.scheduler.supervisor_interval_seconds
    );
    assert!(config.config_rotation.enabled);
    assert_eq!(config.maintenance_actions.turn_on, "adcm_turn_on_maintenance_mode");
}

#[test]
fn test_unknown_environment_rejected() {
    let result: Result<Config, _> = toml::from_str(
        r#"
[executor]
default_environment = "kubernetes"
"#,
    );
    assert!(result.is_err());
}

#[tokio::test]
#[serial]
async fn test_manager_merges_secrets() {
    let temp_dir = TempDir::new().unwrap();
    let config_dir = write_config_dir(
        temp_dir.path(),
        Some("port = 8200\n"),
        Some("secret_key = \"file-key\"\nrunner_api_key = \"runner-token\"\n"),
    );

    let manager = ConfigManager::new(config_dir).await.unwrap();
    let config = manager.get_current_config();

    assert_eq!(config.port, 8200);
    assert_eq!(config.secret_key, "file-key");
    assert_eq!(config.executor.runner_api_key, "runner-token");
}

#[tokio::test]
#[serial]
async fn test_manager_without_files_uses_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let config_dir = write_config_dir(temp_dir.path(), None, None);

    let config = ConfigManager::new(config_dir).await.unwrap().get_current_config();

    assert_eq!(config.port, Config::default().port);
    assert!(config.secret_key.is_empty());
}

#[tokio::test]
#[serial]
async fn test_environment_overrides_file_settings() {
    let temp_dir = TempDir::new().unwrap();
    let config_dir = write_config_dir(
        temp_dir.path(),
        Some("[maintenance_actions]\nturn_on = \"from_file\"\nturn_off = \"off\"\nhost_turn_on = \"h_on\"\nhost_turn_off = \"h_off\"\n"),
        Some("status_secret_key = \"from-secrets\"\n"),
    );

    std::env::set_var(env::TURN_ON_MM_ACTION_NAME, "from_env");
    std::env::set_var(env::STATUS_SECRET_KEY, "from-env");
    let loaded = ConfigManager::new(config_dir).await;
    std::env::remove_var(env::TURN_ON_MM_ACTION_NAME);
    std::env::remove_var(env::STATUS_SECRET_KEY);

    let config = loaded.unwrap().get_current_config();
    assert_eq!(config.maintenance_actions.turn_on, "from_env");
    assert_eq!(config.maintenance_actions.turn_off, "off");
    assert_eq!(config.status.secret_key, "from-env");
}
