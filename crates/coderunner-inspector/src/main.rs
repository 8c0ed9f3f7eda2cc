use anyhow::{Context, Result};
use clap::Parser;
use coderunner_core::instrument::TracingAllocator;
use coderunner_core::isolation::{IsolatedRunner, WorkerCommand, WorkerPayload};
use coderunner_core::types::{EngineReport, StagedConfig, DEFAULT_TIMEOUT_SECS};
use log::LevelFilter;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

#[global_allocator]
static ALLOCATOR: TracingAllocator = TracingAllocator;

#[derive(Parser, Debug)]
#[clap(
    name = "inspector",
    version,
    about = "Runs one submission under a deadline and prints a JSON report"
)]
struct Cli {
    /// Path to the submitted script
    #[clap(required_unless_present = "worker")]
    code_path: Option<PathBuf>,

    /// Path to the JSON config holding the blacklist
    #[clap(required_unless_present = "worker")]
    config_path: Option<PathBuf>,

    #[clap(long, default_value_t = DEFAULT_TIMEOUT_SECS, value_parser = clap::value_parser!(u64).range(1..))]
    timeout: u64,

    /// Read a worker payload from stdin and run it in this process
    #[clap(long, hide = true)]
    worker: bool,

    #[clap(long, default_value = "warn")]
    log_level: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.log_level.parse().unwrap_or(LevelFilter::Warn))
        .target(env_logger::Target::Stderr)
        .init();

    if cli.worker {
        return run_worker();
    }

    let (Some(code_path), Some(config_path)) = (cli.code_path, cli.config_path) else {
        anyhow::bail!("code_path and config_path are required");
    };

    let code = match std::fs::read_to_string(&code_path) {
        Ok(code) => code,
        Err(e) => {
            log::error!("Cannot read {}: {}", code_path.display(), e);
            emit(&serde_json::json!({
                "success": false,
                "error": "System Error: Code file not found"
            }))?;
            std::process::exit(1);
        }
    };
    let staged = load_staged_config(&config_path);

    let command = WorkerCommand::current_exe()
        .context("cannot locate the inspector executable")?
        .arg("--log-level")
        .arg(cli.log_level.as_str());
    let runner = IsolatedRunner::new(command, staged.engine.unwrap_or_default());

    let report = runner.run(&code, &staged.blacklist, cli.timeout).await;
    emit(&report)
}

/// Worker side: payload on stdin, one report line on stdout.
fn run_worker() -> Result<()> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("failed to read worker payload")?;

    let report = match serde_json::from_str::<WorkerPayload>(&input) {
        Ok(payload) => payload.execute(),
        Err(e) => {
            log::error!("Invalid worker payload: {}", e);
            EngineReport::failure(format!("System Error: Invalid worker payload: {}", e), None)
        }
    };
    emit(&report)
}

/// Unreadable or malformed config means no restrictions beyond the baseline.
fn load_staged_config(path: &Path) -> StagedConfig {
    let parsed = std::fs::read_to_string(path)
        .map_err(anyhow::Error::from)
        .and_then(|text| serde_json::from_str::<StagedConfig>(&text).map_err(anyhow::Error::from));
    match parsed {
        Ok(config) => config,
        Err(e) => {
            log::warn!("Ignoring config {}: {}", path.display(), e);
            StagedConfig::default()
        }
    }
}

fn emit<T: serde::Serialize>(value: &T) -> Result<()> {
    let line = serde_json::to_string(value)?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", line)?;
    stdout.flush()?;
    Ok(())
}
