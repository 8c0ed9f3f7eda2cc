//! Sanity checks applied after loading and environment resolution

use crate::config::types::RunnerConfig;
use crate::errors::RunnerError;

const LOG_LEVELS: &[&str] = &["off", "error", "warn", "info", "debug", "trace"];

impl RunnerConfig {
    pub fn validate(&self) -> Result<(), RunnerError> {
        let docker = &self.docker;

        if docker.image.trim().is_empty() {
            return Err(RunnerError::Config("Docker image cannot be empty".to_string()));
        }
        if docker.exchange_mount.trim().is_empty() {
            return Err(RunnerError::Config("Exchange mount cannot be empty".to_string()));
        }
        if !docker.container_exchange_dir.starts_with('/') {
            return Err(RunnerError::Config(format!(
                "Container exchange dir must be absolute, got '{}'",
                docker.container_exchange_dir
            )));
        }
        if docker.code_file.is_empty() || docker.code_file.contains('/') {
            return Err(RunnerError::Config(format!(
                "Code file must be a bare file name, got '{}'",
                docker.code_file
            )));
        }
        if docker.memory_limit <= 0 {
            return Err(RunnerError::Config("Memory limit must be greater than 0".to_string()));
        }
        if docker.pids_limit <= 0 {
            return Err(RunnerError::Config("Pids limit must be greater than 0".to_string()));
        }
        if docker.cpu_period <= 0 || docker.cpu_quota <= 0 {
            return Err(RunnerError::Config(
                "CPU quota and period must be greater than 0".to_string(),
            ));
        }

        if self.engine.output_limit == 0 {
            return Err(RunnerError::Config("Output limit must be greater than 0".to_string()));
        }
        if self.intake.max_concurrent_jobs == 0 {
            return Err(RunnerError::Config(
                "Intake max_concurrent_jobs must be greater than 0".to_string(),
            ));
        }

        let level = self.logging.level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(RunnerError::Config(format!(
                "Unknown log level '{}'",
                self.logging.level
            )));
        }

        Ok(())
    }
}
