// ABOUTME: CLI entry point for tosh-sync
// ABOUTME: Parses commands, initializes logging and routes to command handlers

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tosh_sync::commands;
use tosh_sync::config::{PipelineConfig, DEFAULT_CONFIG_PATH};

#[derive(Parser)]
#[command(name = "tosh-sync")]
#[command(about = "Sync local SQLite change history to PostgreSQL", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the pipeline configuration file
    #[arg(long, global = true, env = "TOSH_SYNC_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Emit logs as JSON lines
    #[arg(long = "json-logs", global = true, default_value_t = false)]
    json_logs: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch every source and deliver continuously until interrupted
    Run,
    /// Run one detection pass per source, then drain the queue
    Once {
        /// Only these sources (comma-separated)
        #[arg(long = "source", value_delimiter = ',')]
        sources: Vec<String>,
    },
    /// Show health, queue depth and cursors
    Status {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect, retry or purge dead-lettered entries
    DeadLetters {
        #[command(flatten)]
        args: commands::dead_letters::DeadLetterArgs,
    },
    /// Validate configuration, sources and destination connectivity
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config = PipelineConfig::load(&cli.config)?;

    let code = match cli.command {
        Commands::Run => commands::run(config).await?,
        Commands::Once { sources } => commands::once(config, sources).await?,
        Commands::Status { json } => commands::status(config, json).await?,
        Commands::DeadLetters { args } => commands::dead_letters::command(config, args).await?,
        Commands::Check => commands::check(config).await?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
