//! Command-line interface.

pub mod commands;

use clap::{Parser, Subcommand};

/// Strata - strongly consistent distributed key-value store.
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a store member.
    Start(commands::StartArgs),
    /// Validate a configuration file.
    Validate(commands::ValidateArgs),
    /// Inspect WAL segments.
    Inspect(commands::InspectArgs),
    /// Inspect snapshot files.
    Snapshot(commands::SnapshotArgs),
}
