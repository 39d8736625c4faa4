// File: conductor/src/config/manager.rs
use super::secrets::SecretsLoader;
use super::Config;
use anyhow::{anyhow, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

/// Environment variables that override file settings
pub mod env {
    pub const TURN_ON_MM_ACTION_NAME: &str = "ADCM_TURN_ON_MM_ACTION_NAME";
    pub const TURN_OFF_MM_ACTION_NAME: &str = "ADCM_TURN_OFF_MM_ACTION_NAME";
    pub const HOST_TURN_ON_MM_ACTION_NAME: &str = "ADCM_HOST_TURN_ON_MM_ACTION_NAME";
    pub const HOST_TURN_OFF_MM_ACTION_NAME: &str = "ADCM_HOST_TURN_OFF_MM_ACTION_NAME";
    pub const STATUS_SECRET_KEY: &str = "STATUS_SECRET_KEY";
    pub const DEFAULT_JOB_EXECUTION_ENVIRONMENT: &str = "DEFAULT_JOB_EXECUTION_ENVIRONMENT";
}

pub struct ConfigManager {
    current_config: Arc<Config>,
}

impl ConfigManager {
    pub async fn new(config_dir: String) -> Result<Self> {
        let config = Self::load_configuration(&config_dir).await?;
        Ok(Self {
            current_config: Arc::new(config),
        })
    }

    /// Wrap an already built config (tests, embedding)
    pub fn from_config(config: Config) -> Self {
        Self {
            current_config: Arc::new(config),
        }
    }

    pub fn get_current_config(&self) -> Arc<Config> {
        self.current_config.clone()
    }

    async fn load_configuration(config_dir: &str) -> Result<Config> {
        let main_config_path = format!("{}/main.toml", config_dir);

        let mut config: Config = if Path::new(&main_config_path).exists() {
            let main_config_content = fs::read_to_string(&main_config_path)
                .await
                .map_err(|e| anyhow!("Failed to read main config {}: {}", main_config_path, e))?;
            toml::from_str(&main_config_content)
                .map_err(|e| anyhow!("Failed to parse main config: {}", e))?
        } else {
            warn!(
                "Main config {} not found, starting with defaults",
                main_config_path
            );
            Config::default()
        };

        let secrets = SecretsLoader::load(&Path::new(config_dir).join("secrets.toml"))?;
        secrets.apply(&mut config);

        apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;

        if config.secret_key.is_empty() {
            warn!("No secret_key configured, password fields will use an ephemeral key");
        }

        info!(
            "Configuration loaded: db={}, executor={}, run_dir={}",
            config.database_path,
            config.executor.default_environment,
            config.dirs.run_dir.display()
        );

        Ok(config)
    }
}

/// Apply environment overrides through a lookup function so callers can test
/// without touching the process environment.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(name) = lookup(env::TURN_ON_MM_ACTION_NAME) {
        config.maintenance_actions.turn_on = name;
    }
    if let Some(name) = lookup(env::TURN_OFF_MM_ACTION_NAME) {
        config.maintenance_actions.turn_off = name;
    }
    if let Some(name) = lookup(env::HOST_TURN_ON_MM_ACTION_NAME) {
        config.maintenance_actions.host_turn_on = name;
    }
    if let Some(name) = lookup(env::HOST_TURN_OFF_MM_ACTION_NAME) {
        config.maintenance_actions.host_turn_off = name;
    }
    if let Some(key) = lookup(env::STATUS_SECRET_KEY) {
        config.status.secret_key = key;
    }
    if let Some(environment) = lookup(env::DEFAULT_JOB_EXECUTION_ENVIRONMENT) {
        config.executor.default_environment = environment.parse()?;
    }
    Ok(())
}
