// File: conductor/src/config/secrets.rs
//! Secrets loader for key material.
//!
//! Secrets live in a separate TOML file (config/secrets.toml) that should be
//! excluded from version control. Environment variables still take priority
//! for the status server key.
//!
//! Example secrets.toml:
//! ```toml
//! secret_key = "base64-or-passphrase"
//! status_secret_key = "status-token"
//! runner_api_key = "runner-token"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::{info, warn};

use super::Config;

/// Structure matching the secrets.toml file format
#[derive(Debug, Deserialize, Default)]
pub struct SecretsFile {
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub status_secret_key: Option<String>,
    #[serde(default)]
    pub runner_api_key: Option<String>,
}

/// Loader for secrets from the secrets.toml file
pub struct SecretsLoader {
    secrets: SecretsFile,
}

impl SecretsLoader {
    /// Load secrets from the specified file path.
    /// Returns an empty loader if the file doesn't exist.
    pub fn load(secrets_path: &Path) -> Result<Self> {
        if !secrets_path.exists() {
            warn!(
                "Secrets file not found at {:?}, keys will need to come from the environment",
                secrets_path
            );
            return Ok(Self {
                secrets: SecretsFile::default(),
            });
        }

        let content = std::fs::read_to_string(secrets_path)
            .with_context(|| format!("Failed to read secrets file: {:?}", secrets_path))?;

        let secrets: SecretsFile = toml::from_str(&content)
            .with_context(|| format!("Failed to parse secrets file: {:?}", secrets_path))?;

        info!("Loaded secrets from {:?}", secrets_path);

        Ok(Self { secrets })
    }

    /// Copy loaded secrets into the config
    pub fn apply(&self, config: &mut Config) {
        if let Some(key) = &self.secrets.secret_key {
            config.secret_key = key.clone();
        }
        if let Some(key) = &self.secrets.status_secret_key {
            config.status.secret_key = key.clone();
        }
        if let Some(key) = &self.secrets.runner_api_key {
            config.executor.runner_api_key = key.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_secrets() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
secret_key = "abc"
runner_api_key = "runner"
"#
        )
        .unwrap();

        let loader = SecretsLoader::load(file.path()).unwrap();
        let mut config = Config::default();
        loader.apply(&mut config);

        assert_eq!(config.secret_key, "abc");
        assert_eq!(config.executor.runner_api_key, "runner");
        assert!(config.status.secret_key.is_empty());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let loader = SecretsLoader::load(Path::new("/nonexistent/secrets.toml")).unwrap();
        let mut config = Config::default();
        loader.apply(&mut config);
        assert!(config.secret_key.is_empty());
    }
}
