//! Runs the execution engine in a child process with a hard wall-clock deadline.
//!
//! The child is the `inspector` binary re-executed in worker mode. The parent
//! writes one [`WorkerPayload`] to the child's stdin and reads the child's
//! stdout to EOF; the last non-empty line is the child's [`EngineReport`].
//! Three outcomes are possible: the report arrives in time and is returned
//! unchanged, the deadline fires and the child is killed, or the child exits
//! without a readable report and the run is recorded as a crash.

use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::engine::{EngineSettings, ExecutionEngine};
use crate::errors::EngineError;
use crate::types::{EngineReport, ForbiddenRule};

/// Flag that switches the `inspector` binary into worker mode.
pub const WORKER_FLAG: &str = "--worker";

/// Upper bound on draining the child's stdout once it has exited. A grandchild
/// holding the pipe open must not stall the runner.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything the worker needs to run one submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPayload {
    pub code: String,
    #[serde(default)]
    pub blacklist: Vec<ForbiddenRule>,
    #[serde(default)]
    pub settings: EngineSettings,
}

impl WorkerPayload {
    /// Worker side of the protocol: run the payload in this process.
    pub fn execute(&self) -> EngineReport {
        ExecutionEngine::new(self.settings.clone()).execute(&self.code, &self.blacklist)
    }
}

/// Program and arguments used to start a worker.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// The running executable in worker mode.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?).arg(WORKER_FLAG))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn spawn(&self) -> Result<Child, EngineError> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(EngineError::Spawn)
    }
}

pub fn time_limit_message(timeout_secs: u64) -> String {
    format!(
        "Time Limit Exceeded: execution exceeded {} seconds.",
        timeout_secs
    )
}

pub fn crash_message(status: Option<ExitStatus>) -> String {
    match status {
        Some(status) => format!("System Error: Process crashed ({})", status),
        None => "System Error: Process crashed".to_string(),
    }
}

pub struct IsolatedRunner {
    command: WorkerCommand,
    settings: EngineSettings,
}

impl IsolatedRunner {
    pub fn new(command: WorkerCommand, settings: EngineSettings) -> Self {
        Self { command, settings }
    }

    /// Runs `code` in a fresh child bounded by `timeout_secs`.
    ///
    /// Never fails: every infrastructure problem becomes a failed report.
    pub async fn run(&self, code: &str, blacklist: &[ForbiddenRule], timeout_secs: u64) -> EngineReport {
        let payload = WorkerPayload {
            code: code.to_string(),
            blacklist: blacklist.to_vec(),
            settings: self.settings.clone(),
        };

        match self.try_run(&payload, timeout_secs).await {
            Ok(report) => report,
            Err(e) => {
                log::error!("Worker process failed: {}", e);
                EngineReport::failure(format!("System Error: {}", e), None)
            }
        }
    }

    async fn try_run(&self, payload: &WorkerPayload, timeout_secs: u64) -> Result<EngineReport, EngineError> {
        let bytes = serde_json::to_vec(payload)?;
        let mut child = self.command.spawn()?;
        log::debug!("Spawned worker pid {:?} with {}s deadline", child.id(), timeout_secs);

        let feeder = feed_stdin(&mut child, bytes)?;
        let drain = drain_stdout(&mut child)?;

        let deadline = Duration::from_secs(timeout_secs);
        let status = match tokio::time::timeout(deadline, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                log::warn!("Worker exceeded {}s deadline, killing it", timeout_secs);
                if let Err(e) = child.kill().await {
                    log::warn!("Failed to kill worker: {}", e);
                }
                feeder.abort();
                drain.abort();
                return Ok(EngineReport {
                    success: false,
                    output: String::new(),
                    error: Some(time_limit_message(timeout_secs)),
                    truncated: false,
                    memory_peak_mb: None,
                    execution_time: Some(timeout_secs as f64),
                    variables: None,
                });
            }
        };

        match feeder.await {
            Ok(Err(e)) => log::debug!("Worker did not read its whole payload: {}", e),
            Err(e) => log::debug!("Payload writer task failed: {}", e),
            Ok(Ok(())) => {}
        }

        let stdout = match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
            Ok(Ok(Ok(bytes))) => bytes,
            Ok(Ok(Err(e))) => return Err(EngineError::Handoff(e)),
            Ok(Err(e)) => {
                log::warn!("Stdout reader task failed: {}", e);
                Vec::new()
            }
            Err(_) => {
                log::warn!("Worker stdout still open after exit, giving up on it");
                Vec::new()
            }
        };

        match parse_report(&stdout) {
            Some(report) => Ok(report),
            None => {
                log::warn!("Worker exited with {} and no readable report", status);
                Ok(EngineReport::failure(crash_message(Some(status)), None))
            }
        }
    }
}

fn feed_stdin(child: &mut Child, bytes: Vec<u8>) -> Result<JoinHandle<std::io::Result<()>>, EngineError> {
    let mut stdin = child.stdin.take().ok_or_else(|| {
        EngineError::Handoff(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "worker stdin is not piped",
        ))
    })?;
    Ok(tokio::spawn(async move {
        stdin.write_all(&bytes).await?;
        stdin.shutdown().await
    }))
}

fn drain_stdout(child: &mut Child) -> Result<JoinHandle<std::io::Result<Vec<u8>>>, EngineError> {
    let mut stdout = child.stdout.take().ok_or_else(|| {
        EngineError::Handoff(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "worker stdout is not piped",
        ))
    })?;
    Ok(tokio::spawn(async move {
        let mut buffer = Vec::new();
        stdout.read_to_end(&mut buffer).await?;
        Ok(buffer)
    }))
}

/// Parses the last non-empty line of the worker's stdout.
pub fn parse_report(stdout: &[u8]) -> Option<EngineReport> {
    let text = String::from_utf8_lossy(stdout);
    let line = text.lines().rev().find(|line| !line.trim().is_empty())?;
    serde_json::from_str(line.trim()).ok()
}
