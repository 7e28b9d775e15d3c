//! Strata - unified CLI entrypoint.
//!
//! Usage:
//!   strata start --config config/strata.toml
//!   strata validate --config config/strata.toml
//!   strata inspect --wal-dir data/wal [--verify]
//!   strata snapshot <file>

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use strata::cli::commands::{run_inspect, run_snapshot, run_start, run_validate};
use strata::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/strata.toml"));

    match cli.command {
        Commands::Start(_args) => run_start(&config_path).await,
        Commands::Validate(_args) => run_validate(&config_path),
        Commands::Inspect(args) => run_inspect(args),
        Commands::Snapshot(args) => run_snapshot(args),
    }
}
