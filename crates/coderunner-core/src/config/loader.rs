//! Configuration loader for YAML files and environment overrides

use crate::config::types::*;
use crate::errors::RunnerError;
use std::env;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Staging directory on the host
pub const ENV_EXCHANGE_DIR: &str = "EXCHANGE_DIR";
/// Volume name or host path mounted into sandbox containers
pub const ENV_EXCHANGE_VOLUME: &str = "EXCHANGE_VOLUME_NAME";
pub const ENV_IMAGE: &str = "CODERUNNER_IMAGE";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<RunnerConfig, RunnerError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await.map_err(|e| {
            RunnerError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_str(&content)
    }

    /// Load from `path` when given, otherwise start from defaults. Environment
    /// overrides apply either way.
    pub async fn from_file_or_default(path: Option<&Path>) -> Result<RunnerConfig, RunnerError> {
        match path {
            Some(path) => Self::from_file(path).await,
            None => {
                log::debug!("No config file given, using defaults");
                let mut config = RunnerConfig::default();
                Self::apply_env_overrides(&mut config, |key| env::var(key).ok());
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Load configuration from a YAML string
    pub fn from_str(content: &str) -> Result<RunnerConfig, RunnerError> {
        let mut config: RunnerConfig = if content.trim().is_empty() {
            RunnerConfig::default()
        } else {
            serde_yaml::from_str(content)
                .map_err(|e| RunnerError::Config(format!("Failed to parse YAML config: {}", e)))?
        };

        Self::apply_env_overrides(&mut config, |key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup. Empty values are ignored.
    pub fn apply_env_overrides<F>(config: &mut RunnerConfig, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(dir) = get(ENV_EXCHANGE_DIR) {
            log::debug!("{} overrides exchange dir: {}", ENV_EXCHANGE_DIR, dir);
            config.docker.exchange_dir = PathBuf::from(dir);
        }
        if let Some(mount) = get(ENV_EXCHANGE_VOLUME) {
            log::debug!("{} overrides exchange mount: {}", ENV_EXCHANGE_VOLUME, mount);
            config.docker.exchange_mount = mount;
        }
        if let Some(image) = get(ENV_IMAGE) {
            log::debug!("{} overrides image: {}", ENV_IMAGE, image);
            config.docker.image = image;
        }
    }
}
