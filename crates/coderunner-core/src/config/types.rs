//! Configuration types for the runner

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::engine::EngineSettings;

/// Top-level configuration read from `coderunner.yaml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Container resource ceilings and isolation options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DockerConfig {
    #[serde(default = "default_image")]
    pub image: String,

    /// Directory on this host where submissions are staged
    #[serde(default = "default_exchange_dir")]
    pub exchange_dir: PathBuf,

    /// Volume name or host path mounted read-only at `container_exchange_dir`
    #[serde(default = "default_exchange_mount")]
    pub exchange_mount: String,

    #[serde(default = "default_container_exchange_dir")]
    pub container_exchange_dir: String,

    #[serde(default = "default_entry_point")]
    pub entry_point: String,

    #[serde(default = "default_code_file")]
    pub code_file: String,

    #[serde(default = "default_memory_limit")]
    pub memory_limit: i64,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
    #[serde(default = "default_cpu_quota")]
    pub cpu_quota: i64,
    #[serde(default = "default_cpu_period")]
    pub cpu_period: i64,

    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_tmpfs_options")]
    pub tmpfs_options: String,

    /// Seconds the container gets beyond the inner deadline
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,

    /// When set, a missing image is built from this directory at startup
    #[serde(default)]
    pub build_context: Option<PathBuf>,
    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            exchange_dir: default_exchange_dir(),
            exchange_mount: default_exchange_mount(),
            container_exchange_dir: default_container_exchange_dir(),
            entry_point: default_entry_point(),
            code_file: default_code_file(),
            memory_limit: default_memory_limit(),
            pids_limit: default_pids_limit(),
            cpu_quota: default_cpu_quota(),
            cpu_period: default_cpu_period(),
            user: default_user(),
            tmpfs_options: default_tmpfs_options(),
            grace_secs: default_grace_secs(),
            build_context: None,
            dockerfile: default_dockerfile(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeConfig {
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub const DEFAULT_IMAGE: &str = "coderunner-sandbox:latest";

fn default_image() -> String { DEFAULT_IMAGE.to_string() }
fn default_exchange_dir() -> PathBuf { PathBuf::from("/exchange") }
fn default_exchange_mount() -> String { "code-exchange".to_string() }
fn default_container_exchange_dir() -> String { "/exchange".to_string() }
fn default_entry_point() -> String { "/usr/local/bin/inspector".to_string() }
fn default_code_file() -> String { "student_solution.rhai".to_string() }
fn default_memory_limit() -> i64 { 256 * 1024 * 1024 }
fn default_pids_limit() -> i64 { 20 }
fn default_cpu_quota() -> i64 { 50_000 }
fn default_cpu_period() -> i64 { 100_000 }
fn default_user() -> String { "sandbox".to_string() }
fn default_tmpfs_options() -> String { "size=10m,noexec,nosuid".to_string() }
fn default_grace_secs() -> u64 { 2 }
fn default_dockerfile() -> String { "docker/Dockerfile.inspector".to_string() }
fn default_max_concurrent_jobs() -> usize { 4 }
fn default_log_level() -> String { "info".to_string() }
