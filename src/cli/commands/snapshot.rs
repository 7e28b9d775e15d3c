//! Snapshot inspection command.

use crate::storage::snap;
use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

/// Inspect a snapshot file.
#[derive(Args, Debug)]
pub struct SnapshotArgs {
    /// Snapshot file path.
    #[arg(required = true)]
    pub path: PathBuf,
}

/// Run the snapshot command.
pub fn run_snapshot(args: SnapshotArgs) -> Result<()> {
    let snapshot = snap::read_snapshot(&args.path)
        .with_context(|| format!("failed to read snapshot {}", args.path.display()))?;
    println!(
        "index={} term={} voters={:?} data={}B",
        snapshot.meta.index,
        snapshot.meta.term,
        snapshot.meta.conf_state.voters,
        snapshot.data.len(),
    );
    Ok(())
}
