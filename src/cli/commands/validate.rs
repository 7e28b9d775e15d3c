//! Configuration validation command.

use crate::core::config::Config;
use anyhow::Result;
use clap::Args;
use std::path::Path;

/// Validate a configuration file without starting anything.
#[derive(Args, Debug)]
pub struct ValidateArgs {}

/// Run the validate command.
pub fn run_validate(config_path: &Path) -> Result<()> {
    let config = Config::from_file(config_path)?;
    println!(
        "ok: member {} of {} with data dir {}",
        config.node_id,
        config.initial_cluster.len(),
        config.data_dir.display()
    );
    Ok(())
}
