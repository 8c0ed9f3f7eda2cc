//! Sandbox orchestrator: one disposable, locked-down container per submission.
//!
//! The orchestrator stages the submission on the exchange volume, runs the
//! `inspector` entry point in a fresh container with tight resource ceilings
//! and no network, waits for it with an outer deadline a little longer than
//! the inner one, and parses the single JSON line the engine prints. Container
//! and staging directory are removed on every path.

pub mod image;
pub mod staging;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, KillContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::config::{DockerConfig, RunnerConfig};
use crate::engine::EngineSettings;
use crate::errors::RunnerError;
use crate::isolation::parse_report;
use crate::types::{ExecutionRequest, ExecutionResult, StagedConfig};
pub use image::{ensure_image, ImageStatus};
pub use staging::{sanitize_id, StagedSubmission};

pub const CONTAINER_TIMEOUT: &str = "Container timeout";
pub const INVALID_OUTPUT: &str = "Invalid output from engine";
pub const INVALID_TIMEOUT: &str = "Invalid timeout: must be at least 1 second";

/// Raw output kept for diagnosis when the engine's output does not parse.
const RAW_OUTPUT_EXCERPT: usize = 1000;

/// Anything that turns a request into exactly one result.
#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> ExecutionResult;
}

enum ContainerOutcome {
    Completed { stdout: String, stderr: String },
    TimedOut,
}

pub struct DockerSandbox {
    docker: Docker,
    config: DockerConfig,
    engine: EngineSettings,
}

impl DockerSandbox {
    pub fn connect(config: &RunnerConfig) -> Result<Self, RunnerError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::with_client(docker, config))
    }

    pub fn with_client(docker: Docker, config: &RunnerConfig) -> Self {
        Self {
            docker,
            config: config.docker.clone(),
            engine: config.engine.clone(),
        }
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    pub async fn ensure_image(&self) -> Result<ImageStatus, RunnerError> {
        image::ensure_image(&self.docker, &self.config).await
    }

    async fn run_staged(
        &self,
        container_name: &str,
        staged: &StagedSubmission,
        timeout_secs: u64,
    ) -> Result<ContainerOutcome, RunnerError> {
        let (code_path, config_path) = staged.container_paths(&self.config.container_exchange_dir);
        let body = container_body(&self.config, code_path, config_path, timeout_secs);

        let options = Some(CreateContainerOptions {
            name: Some(container_name.to_string()),
            ..Default::default()
        });
        let container = self.docker.create_container(options, body).await?;
        for warning in &container.warnings {
            log::warn!("Docker warning for {}: {}", container_name, warning);
        }

        self.docker
            .start_container(container_name, None::<StartContainerOptions>)
            .await?;
        log::debug!("Started container {}", container_name);

        let mut wait_stream = self
            .docker
            .wait_container(container_name, None::<WaitContainerOptions>);
        let outer_deadline = outer_deadline(timeout_secs, self.config.grace_secs);

        let wait_outcome = tokio::select! {
            res = wait_stream.next() => res,
            _ = tokio::time::sleep(outer_deadline) => {
                log::warn!("Container {} exceeded {:?}, killing it", container_name, outer_deadline);
                if let Err(e) = self
                    .docker
                    .kill_container(container_name, None::<KillContainerOptions>)
                    .await
                {
                    log::warn!("Failed to kill container {}: {}", container_name, e);
                }
                return Ok(ContainerOutcome::TimedOut);
            }
        };

        match wait_outcome {
            Some(Ok(response)) => {
                log::debug!("Container {} exited with {}", container_name, response.status_code);
            }
            // Non-zero exits are reported as errors by the wait endpoint; the
            // engine's output decides the result, not the exit code.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => {
                log::debug!("Container {} exited with {}", container_name, code);
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Err(RunnerError::WaitStreamEnded),
        }

        let (stdout, stderr) = self.collect_logs(container_name).await?;
        if !stderr.is_empty() {
            log::debug!("Container {} stderr: {}", container_name, stderr.trim_end());
        }
        Ok(ContainerOutcome::Completed { stdout, stderr })
    }

    async fn collect_logs(&self, container_name: &str) -> Result<(String, String), RunnerError> {
        let mut logs = self.docker.logs(
            container_name,
            Some(LogsOptions {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(chunk) = logs.next().await {
            match chunk? {
                LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                _ => {}
            }
        }
        Ok((
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
        ))
    }

    async fn remove_container(&self, container_name: &str) {
        let options = Some(RemoveContainerOptions {
            force: true,
            ..Default::default()
        });
        match self.docker.remove_container(container_name, options).await {
            Ok(()) => log::debug!("Removed container {}", container_name),
            Err(e) if image::is_not_found(&e) => {}
            Err(e) => log::warn!("Failed to remove container {}: {}", container_name, e),
        }
    }
}

#[async_trait]
impl SandboxExecutor for DockerSandbox {
    async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let submission_id = request.submission_id.clone();
        let safe_id = sanitize_id(&submission_id);
        log::info!("Executing submission {} (timeout {}s)", submission_id, request.timeout);
        if request.timeout == 0 {
            log::warn!("Rejecting submission {} with a zero timeout", submission_id);
            return ExecutionResult::system_failure(submission_id, INVALID_TIMEOUT);
        }

        let staged_config = StagedConfig {
            blacklist: request.config.blacklist.clone(),
            engine: Some(self.engine.clone()),
        };
        let staged = match StagedSubmission::create(
            &self.config.exchange_dir,
            &safe_id,
            &self.config.code_file,
            &request.code,
            &staged_config,
        )
        .await
        {
            Ok(staged) => staged,
            Err(e) => {
                log::error!("Failed to stage submission {}: {}", submission_id, e);
                return ExecutionResult::system_failure(submission_id, e.to_string());
            }
        };

        let container_name = format!("coderunner-{}-{}", safe_id, Uuid::new_v4().simple());
        let outcome = self.run_staged(&container_name, &staged, request.timeout).await;

        self.remove_container(&container_name).await;
        staged.cleanup().await;

        let result = match outcome {
            Ok(ContainerOutcome::Completed { stdout, .. }) => interpret_output(&submission_id, &stdout),
            Ok(ContainerOutcome::TimedOut) => {
                ExecutionResult::system_failure(&submission_id, CONTAINER_TIMEOUT)
            }
            Err(e) => {
                log::error!("Container run for {} failed: {}", submission_id, e);
                ExecutionResult::system_failure(&submission_id, e.to_string())
            }
        };
        log::info!(
            "Submission {} finished: success={} system_error={:?}",
            submission_id,
            result.success,
            result.system_error
        );
        result
    }
}

/// Deadline for the whole container: the engine's own limit plus a grace period.
pub fn outer_deadline(timeout_secs: u64, grace_secs: u64) -> Duration {
    Duration::from_secs(timeout_secs.saturating_add(grace_secs))
}

/// Container definition for one run.
pub fn container_body(
    config: &DockerConfig,
    code_path: String,
    config_path: String,
    timeout_secs: u64,
) -> ContainerCreateBody {
    let mut tmpfs = HashMap::new();
    tmpfs.insert("/tmp".to_string(), config.tmpfs_options.clone());

    ContainerCreateBody {
        image: Some(config.image.clone()),
        cmd: Some(vec![
            config.entry_point.clone(),
            code_path,
            config_path,
            "--timeout".to_string(),
            timeout_secs.to_string(),
        ]),
        user: Some(config.user.clone()),
        network_disabled: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        host_config: Some(HostConfig {
            binds: Some(vec![format!(
                "{}:{}:ro",
                config.exchange_mount, config.container_exchange_dir
            )]),
            memory: Some(config.memory_limit),
            memory_swap: Some(config.memory_limit),
            pids_limit: Some(config.pids_limit),
            cpu_quota: Some(config.cpu_quota),
            cpu_period: Some(config.cpu_period),
            network_mode: Some("none".to_string()),
            readonly_rootfs: Some(true),
            tmpfs: Some(tmpfs),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Turns the container's stdout into a result for `submission_id`.
pub fn interpret_output(submission_id: &str, stdout: &str) -> ExecutionResult {
    match parse_report(stdout.as_bytes()) {
        Some(report) => ExecutionResult::from_report(submission_id, report),
        None => {
            log::error!("Engine output for {} is not a report", submission_id);
            let excerpt: String = stdout.chars().take(RAW_OUTPUT_EXCERPT).collect();
            ExecutionResult::system_failure(submission_id, INVALID_OUTPUT).with_output(excerpt)
        }
    }
}
