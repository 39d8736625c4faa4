// File: conductor/src/config/mod.rs
pub mod manager;
pub mod secrets;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub use manager::ConfigManager;

/// Process-wide settings, loaded once and passed down by `Arc`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub dirs: DirsConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub config_rotation: RotationConfig,
    #[serde(default)]
    pub maintenance_actions: MaintenanceActionNames,
    /// Base URL scripts use to reach the plugin callback endpoint
    #[serde(default = "default_callback_url")]
    pub callback_url: String,
    /// Platform-wide settings exposed to jobs as `adcm.config`
    #[serde(default = "default_global_settings")]
    pub global_settings: serde_json::Value,
    /// Key material for reversible password encryption (from secrets.toml)
    #[serde(skip)]
    pub secret_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirsConfig {
    pub run_dir: PathBuf,
    pub stack_dir: PathBuf,
    pub tmp_dir: PathBuf,
}

impl Default for DirsConfig {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from("data/run"),
            stack_dir: PathBuf::from("data/stack"),
            tmp_dir: PathBuf::from("data/tmp"),
        }
    }
}

impl DirsConfig {
    /// Directory holding unpacked bundle files, keyed by bundle hash
    pub fn bundle_dir(&self, bundle_hash: &str) -> PathBuf {
        self.stack_dir.join("bundle").join(bundle_hash)
    }

    /// Scratch area for file-typed config leaves
    pub fn file_dir(&self) -> PathBuf {
        self.stack_dir.join("data").join("file")
    }

    pub fn job_dir(&self, job_id: i64) -> PathBuf {
        self.run_dir.join(job_id.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusConfig {
    /// Status server base URL; empty disables notifications
    #[serde(default)]
    pub url: String,
    #[serde(skip)]
    pub secret_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionEnvironment {
    Local,
    Celery,
}

impl ExecutionEnvironment {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionEnvironment::Local => "local",
            ExecutionEnvironment::Celery => "celery",
        }
    }
}

impl fmt::Display for ExecutionEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionEnvironment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(ExecutionEnvironment::Local),
            "celery" => Ok(ExecutionEnvironment::Celery),
            other => Err(anyhow::anyhow!("Unknown job execution environment: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_environment")]
    pub default_environment: ExecutionEnvironment,
    /// Runner agent URL used by the `celery` environment
    #[serde(default)]
    pub runner_url: String,
    #[serde(skip)]
    pub runner_api_key: String,
    #[serde(default = "default_runner_poll_seconds")]
    pub runner_poll_seconds: u64,
    #[serde(default = "default_ansible_command")]
    pub ansible_command: String,
    #[serde(default = "default_python_command")]
    pub python_command: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_environment: default_environment(),
            runner_url: String::new(),
            runner_api_key: String::new(),
            runner_poll_seconds: default_runner_poll_seconds(),
            ansible_command: default_ansible_command(),
            python_command: default_python_command(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_supervisor_interval")]
    pub supervisor_interval_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            supervisor_interval_seconds: default_supervisor_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 6-field cron expression (sec min hour day month dow)
    #[serde(default = "default_rotation_schedule")]
    pub schedule: String,
    #[serde(default = "default_rotation_age_days")]
    pub max_age_days: i64,
    #[serde(default = "default_rotation_keep")]
    pub keep_count: i64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: default_rotation_schedule(),
            max_age_days: default_rotation_age_days(),
            keep_count: default_rotation_keep(),
        }
    }
}

/// Names of the built-in actions launched by maintenance-mode toggles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceActionNames {
    pub turn_on: String,
    pub turn_off: String,
    pub host_turn_on: String,
    pub host_turn_off: String,
}

impl Default for MaintenanceActionNames {
    fn default() -> Self {
        Self {
            turn_on: "adcm_turn_on_maintenance_mode".to_string(),
            turn_off: "adcm_turn_off_maintenance_mode".to_string(),
            host_turn_on: "adcm_host_turn_on_maintenance_mode".to_string(),
            host_turn_off: "adcm_host_turn_off_maintenance_mode".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database_path: default_database_path(),
            dirs: DirsConfig::default(),
            status: StatusConfig::default(),
            executor: ExecutorConfig::default(),
            scheduler: SchedulerConfig::default(),
            config_rotation: RotationConfig::default(),
            maintenance_actions: MaintenanceActionNames::default(),
            callback_url: default_callback_url(),
            global_settings: default_global_settings(),
            secret_key: String::new(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_database_path() -> String {
    "data/conductor.db".to_string()
}

fn default_callback_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_global_settings() -> serde_json::Value {
    serde_json::json!({})
}

fn default_environment() -> ExecutionEnvironment {
    ExecutionEnvironment::Local
}

fn default_runner_poll_seconds() -> u64 {
    5
}

fn default_ansible_command() -> String {
    "ansible-playbook".to_string()
}

fn default_python_command() -> String {
    "python3".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_supervisor_interval() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_rotation_schedule() -> String {
    "0 0 3 * * *".to_string()
}

fn default_rotation_age_days() -> i64 {
    30
}

fn default_rotation_keep() -> i64 {
    10
}
