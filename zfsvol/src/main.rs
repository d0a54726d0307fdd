mod cli;
mod config;
mod driver;
mod naming;
mod state;
mod storage;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cli::VolumeCommand;

#[derive(Parser)]
#[command(name = "zfsvol", about = "ZFS datasets as named container volumes")]
struct Cli {
    /// Path to config file (TOML).
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a volume, or adopt an existing unmounted dataset.
    Create {
        /// Volume name, or a full dataset path.
        name: String,
        /// Create option as key=value (mountpoint, keep, or any zfs property).
        #[arg(long = "opt", short = 'o', value_parser = cli::parse_option)]
        options: Vec<(String, String)>,
    },
    /// Stop tracking a volume, destroying its dataset unless it is kept.
    Remove { name: String },
    /// Show a single volume as JSON.
    Inspect { name: String },
    /// List tracked volumes.
    List,
    /// Print the mountpoint of a volume.
    Path { name: String },
    /// Print the mountpoint a container should use for a volume.
    Mount { name: String },
    /// Release a volume from a container (no-op).
    Unmount { name: String },
    /// Print driver capabilities.
    Capabilities,
    /// Show tracked volume names from the state file (no zfs calls).
    Status,
    /// Verify prerequisites: zfs binary, parent dataset, directories, state file.
    Check,
}

/// `DEBUG=1` (or any true-ish value) raises the default log level.
fn debug_requested() -> bool {
    std::env::var("DEBUG")
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "t" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> Result<()> {
    let default_level = if debug_requested() { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let cli = Cli::parse();
    let config = cli::load_config(cli.config)?;

    let command = match cli.command {
        Commands::Status => return cli::run_status(&config).await,
        Commands::Check => return cli::run_check(&config).await,
        Commands::Create { name, options } => VolumeCommand::Create {
            name,
            options: options.into_iter().collect(),
        },
        Commands::Remove { name } => VolumeCommand::Remove { name },
        Commands::Inspect { name } => VolumeCommand::Inspect { name },
        Commands::List => VolumeCommand::List,
        Commands::Path { name } => VolumeCommand::Path { name },
        Commands::Mount { name } => VolumeCommand::Mount { name },
        Commands::Unmount { name } => VolumeCommand::Unmount { name },
        Commands::Capabilities => VolumeCommand::Capabilities,
    };

    cli::run_volume(&config, command).await
}
