//! Twinsync - Trigger-Based Bidirectional Database Synchronization
//!
//! Command line entry point: validate or generate configuration, run a
//! single replication pass, or start the continuous replication loop.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use twinsync::config::SyncConfig;
use twinsync::db::Session;
use twinsync::handlers::HandlerRegistry;
use twinsync::runner::ReplicationRunner;

/// Twinsync - Trigger-Based Bidirectional Database Synchronization
#[derive(Parser)]
#[command(name = "twinsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "twinsync.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the continuous replication loop
    Replicate,

    /// Execute a single replication run and exit
    Run,

    /// Validate the configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "twinsync.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Replicate => run_replicate(cli.config, false).await,
        Commands::Run => run_replicate(cli.config, true).await,
        Commands::Validate => run_validate(cli.config),
        Commands::Init { output } => run_init(output),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Load the configuration or report why it cannot be used
fn load_config(config_path: &PathBuf) -> anyhow::Result<SyncConfig> {
    SyncConfig::from_file(config_path).with_context(|| {
        format!(
            "Failed to load configuration from {:?}; check that the file exists and is valid TOML",
            config_path
        )
    })
}

/// Start replication (continuous loop or a single run)
async fn run_replicate(config_path: PathBuf, once: bool) -> anyhow::Result<()> {
    let config = load_config(&config_path)?;
    tracing::info!(
        "Connecting left={}:{}/{} right={}:{}/{}",
        config.left.host,
        config.left.port,
        config.left.database,
        config.right.host,
        config.right.port,
        config.right.database
    );

    // Custom handlers and event filters are registered here when twinsync is
    // embedded as a library; the stock binary runs with an empty registry.
    let session = Session::connect(config, HandlerRegistry::new())
        .await
        .context("Failed to connect to the databases")?;

    let runner = ReplicationRunner::new(session);
    if once {
        let timed_out = runner.run_once().await?;
        if timed_out {
            anyhow::bail!("replication run timed out");
        }
        tracing::info!("Replication run completed");
    } else {
        runner.install_signal_handler()?;
        runner.run().await?;
    }
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    let config = load_config(&config_path)?;
    println!("Configuration OK");
    println!("  left:  {}:{}/{}", config.left.host, config.left.port, config.left.database);
    println!("  right: {}:{}/{}", config.right.host, config.right.port, config.right.database);
    println!("  replicated tables with overrides: {}", config.tables.len());
    Ok(())
}

/// Write a sample configuration file
fn run_init(output: PathBuf) -> anyhow::Result<()> {
    if output.exists() {
        anyhow::bail!("{:?} already exists, refusing to overwrite", output);
    }
    std::fs::write(&output, SyncConfig::sample())
        .with_context(|| format!("Failed to write {:?}", output))?;
    println!("Wrote sample configuration to {:?}", output);
    println!("Edit the connection settings, then check with: twinsync validate -c {:?}", output);
    Ok(())
}
