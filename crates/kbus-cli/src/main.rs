//! kbus - mailbox and quota engine driver
//!
//! Runs the bus in-process: prints the effective limits or drives a
//! built-in scenario and reports what the engine admitted and rejected.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kbus_core::BusConfig;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

/// kbus - mailbox and quota engine driver
#[derive(Parser, Debug)]
#[command(name = "kbus")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a TOML file overriding the bus limits
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the effective limits as TOML
    Limits,

    /// Run a built-in scenario against an in-process bus
    Scenario(commands::scenario::ScenarioArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = match &cli.config {
        Some(path) => BusConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => BusConfig::default(),
    };

    match cli.command {
        Commands::Limits => commands::limits::run(&config),
        Commands::Scenario(args) => commands::scenario::run(config.limits, &args),
    }
}
