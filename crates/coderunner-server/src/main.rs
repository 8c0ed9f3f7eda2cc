use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coderunner_core::config::ConfigLoader;
use coderunner_core::orchestrator::{DockerSandbox, ImageStatus, SandboxExecutor};
use coderunner_core::types::{ExecutionConfig, ExecutionRequest, DEFAULT_TIMEOUT_SECS};
use coderunner_core::{JobIntake, RunnerConfig};
use log::LevelFilter;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[clap(name = "coderunner", author, version, about = "Sandboxed runner for untrusted script submissions")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(long, short, help = "YAML configuration file (defaults are used when omitted)")]
    config: Option<PathBuf>,

    #[clap(long, short, help = "Log level, overrides the configuration file")]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read requests as JSON lines on stdin and write results as JSON lines on stdout
    Serve,
    /// Run a single script file and print its result
    Run {
        file: PathBuf,

        #[clap(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
        timeout: u64,

        #[clap(long, help = "JSON file with a {\"blacklist\": [...]} object")]
        blacklist: Option<PathBuf>,

        #[clap(long, help = "Submission identifier (random when omitted)")]
        id: Option<String>,
    },
    /// Check that the sandbox image exists, building it when a build context is configured
    Image,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::from_file_or_default(cli.config.as_deref())
        .await
        .context("failed to load configuration")?;

    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    env_logger::Builder::new()
        .filter_level(level.parse().unwrap_or(LevelFilter::Info))
        .init();

    match cli.command {
        Commands::Serve => serve(&config).await,
        Commands::Run {
            file,
            timeout,
            blacklist,
            id,
        } => run_once(&config, file, timeout, blacklist, id).await,
        Commands::Image => image(&config).await,
    }
}

async fn serve(config: &RunnerConfig) -> Result<()> {
    let sandbox = DockerSandbox::connect(config).context("cannot connect to Docker")?;
    match sandbox.ensure_image().await {
        Ok(ImageStatus::Missing) => log::warn!("Submissions will fail until {} exists", config.docker.image),
        Ok(_) => {}
        Err(e) => log::error!("Sandbox image check failed: {}", e),
    }

    log::info!(
        "Serving requests from stdin with up to {} concurrent jobs",
        config.intake.max_concurrent_jobs
    );
    let intake = JobIntake::new(Arc::new(sandbox), config.intake.max_concurrent_jobs);
    let reader = BufReader::new(tokio::io::stdin());
    intake.serve(reader, tokio::io::stdout()).await?;
    Ok(())
}

async fn run_once(
    config: &RunnerConfig,
    file: PathBuf,
    timeout: u64,
    blacklist: Option<PathBuf>,
    id: Option<String>,
) -> Result<()> {
    let code = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("cannot read {}", file.display()))?;

    let restrictions = match blacklist {
        Some(path) => {
            let text = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("cannot read {}", path.display()))?;
            serde_json::from_str::<ExecutionConfig>(&text)
                .with_context(|| format!("invalid blacklist file {}", path.display()))?
        }
        None => ExecutionConfig::default(),
    };

    let request = ExecutionRequest {
        submission_id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        code,
        config: restrictions,
        timeout,
    };

    let sandbox = DockerSandbox::connect(config).context("cannot connect to Docker")?;
    let result = sandbox.execute(request).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn image(config: &RunnerConfig) -> Result<()> {
    let sandbox = DockerSandbox::connect(config).context("cannot connect to Docker")?;
    match sandbox.ensure_image().await? {
        ImageStatus::Present => println!("{} is present", config.docker.image),
        ImageStatus::Built => println!("{} was built", config.docker.image),
        ImageStatus::Missing => anyhow::bail!(
            "{} is missing and no docker.build_context is configured",
            config.docker.image
        ),
    }
    Ok(())
}
