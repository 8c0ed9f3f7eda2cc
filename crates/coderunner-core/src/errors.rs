//! Error types for the orchestration side of the sandbox
//!
//! Failures of the untrusted code itself are never represented here: they are
//! data carried by [`crate::types::ExecutionResult`]. These enums cover the
//! infrastructure around it (configuration, staging, the container runtime and
//! the worker protocol), which the orchestrator converts into `system_error`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Staging failed: {0}")]
    Staging(String),
    #[error("Docker operation failed: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("Image build failed: {0}")]
    ImageBuild(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Container wait stream ended unexpectedly")]
    WaitStreamEnded,
}

// Errors raised while setting up or talking to the worker process
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("Failed to hand payload to worker: {0}")]
    Handoff(#[source] std::io::Error),
    #[error("Invalid worker payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
