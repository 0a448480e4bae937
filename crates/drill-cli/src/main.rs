//! # drill-cli
//!
//! Binary entry point for Drill.
//!
//! This crate provides:
//! - CLI argument parsing using `clap`
//! - Logging to a per-command log file in the output directory
//! - Sample configuration via `drill init`
//! - DR test runs via `drill test run` and `drill test clean`
//! - Environment checks via `drill validate`

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use drill_core::validate;
use drill_core::{Backend, Command, Config, KubeOperations, Sample, create_sample};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Drill - disaster recovery testing for multi-cluster Kubernetes
#[derive(Parser, Debug)]
#[command(name = "drill", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, default_value = "drill.yaml", global = true)]
    config: PathBuf,

    /// Directory for reports, logs and gathered data
    #[arg(short, long, default_value = "drill.out", global = true)]
    output: PathBuf,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a sample configuration file
    Init(InitArgs),

    /// Run DR tests
    #[command(subcommand)]
    Test(TestCommands),

    /// Validate the environment
    #[command(subcommand)]
    Validate(ValidateCommands),
}

#[derive(Parser, Debug)]
struct InitArgs {
    /// Configuration file to create
    #[arg(default_value = "drill.yaml")]
    file: PathBuf,
}

#[derive(Subcommand, Debug)]
enum TestCommands {
    /// Run the DR flow for every configured test
    Run,

    /// Remove resources left by a previous run
    Clean,
}

#[derive(Subcommand, Debug)]
enum ValidateCommands {
    /// Validate clusters and S3 profiles
    Clusters,

    /// Validate a protected application
    Application(ApplicationArgs),
}

#[derive(Parser, Debug)]
struct ApplicationArgs {
    /// DRPlacementControl name
    #[arg(long)]
    name: String,

    /// DRPlacementControl namespace
    #[arg(long)]
    namespace: String,
}

impl Commands {
    /// Name used for the report and log files.
    fn name(&self) -> &'static str {
        match self {
            Commands::Init(_) => "init",
            Commands::Test(TestCommands::Run) => "test-run",
            Commands::Test(TestCommands::Clean) => "test-clean",
            Commands::Validate(ValidateCommands::Clusters) => "validate-clusters",
            Commands::Validate(ValidateCommands::Application(_)) => "validate-application",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init(args) = &cli.command {
        return init_command(&args.file);
    }

    let name = cli.command.name();
    init_logging(&cli.output, name, cli.verbose)?;
    info!("Starting {} with config {:?}", name, cli.config);

    let config = Config::load(&cli.config)?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration {:?}", cli.config))?;

    let cmd = Command::new(
        name,
        config.clone(),
        Arc::new(Backend::new(&config)),
        Arc::new(KubeOperations::new(&config)),
        &cli.output,
    );

    match cli.command {
        Commands::Test(TestCommands::Run) => run_command(&cmd).await,
        Commands::Test(TestCommands::Clean) => clean_command(&cmd).await,
        Commands::Validate(ValidateCommands::Clusters) => {
            validate::clusters(&cmd).await?;
            Ok(())
        }
        Commands::Validate(ValidateCommands::Application(args)) => {
            validate::application(&cmd, &args.name, &args.namespace).await?;
            Ok(())
        }
        Commands::Init(_) => Ok(()),
    }
}

/// Logs to `<output>/<name>.log`. `RUST_LOG` overrides the default level.
fn init_logging(output: &Path, name: &str, verbose: bool) -> Result<()> {
    fs::create_dir_all(output)
        .with_context(|| format!("Failed to create output directory {output:?}"))?;
    let log_path = output.join(format!("{name}.log"));
    let file = fs::File::create(&log_path)
        .with_context(|| format!("Failed to create log file {log_path:?}"))?;

    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

fn init_command(path: &Path) -> Result<()> {
    create_sample(path, &Sample::new("drill"))?;
    println!("Created config file {path:?} - please modify for your clusters");
    Ok(())
}

async fn run_command(cmd: &Command) -> Result<()> {
    if !cmd.validate().await {
        return Err(cmd.failed().into());
    }
    if !cmd.setup().await {
        return Err(cmd.failed().into());
    }
    if !cmd.run_tests().await {
        cmd.gather_failed().await;
        return Err(cmd.failed().into());
    }
    cmd.passed();
    Ok(())
}

async fn clean_command(cmd: &Command) -> Result<()> {
    if !cmd.validate().await {
        return Err(cmd.failed().into());
    }
    if !cmd.clean_tests().await {
        cmd.gather_failed().await;
        return Err(cmd.failed().into());
    }
    if !cmd.cleanup().await {
        return Err(cmd.failed().into());
    }
    cmd.passed();
    Ok(())
}
