//! Two-tier sandbox for running untrusted script submissions.
//!
//! The outer tier is a disposable container per submission with hard resource
//! ceilings and no network. Inside it, the `inspector` entry point runs the
//! script in a killable child process with its own deadline, and the child
//! runs the script on an embedded engine whose standard-library surface and
//! module loading are restricted.
//!
//! # Architecture Overview
//!
//! - **Capability guard** (`guard`): fixed import baseline plus per-run blacklist of host functions
//! - **Bounded output sink** (`sink`): capped capture of everything the script prints
//! - **Resource instrumentation** (`instrument`): wall-clock time and peak heap usage
//! - **Execution engine** (`engine`): compile, run and snapshot one script in-process
//! - **Isolated runner** (`isolation`): the engine in a child process under a deadline
//! - **Sandbox orchestrator** (`orchestrator`): container provisioning, staging and cleanup
//! - **Job intake** (`intake`): line-delimited JSON dispatcher in front of the orchestrator

pub mod config;
pub mod engine;
pub mod errors;
pub mod guard;
pub mod instrument;
pub mod intake;
pub mod isolation;
pub mod orchestrator;
pub mod sink;
pub mod types;

pub use config::{ConfigLoader, RunnerConfig};
pub use engine::{EngineSettings, ExecutionEngine};
pub use errors::{EngineError, RunnerError};
pub use intake::JobIntake;
pub use isolation::{IsolatedRunner, WorkerCommand, WorkerPayload};
pub use orchestrator::{DockerSandbox, SandboxExecutor};
pub use types::{EngineReport, ExecutionRequest, ExecutionResult};
