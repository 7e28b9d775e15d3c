//! Start command.

use crate::core::config::Config;
use crate::core::error::{Error, ExitCode};
use crate::raft::transport::{LocalMesh, Transport};
use crate::server::Node;
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;
use std::sync::Arc;

/// Start a store member.
#[derive(Args, Debug)]
pub struct StartArgs {
    // Configuration is handled by the global --config flag.
}

/// Initialize the tracing subscriber when telemetry is enabled.
#[cfg(feature = "telemetry")]
fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

#[cfg(not(feature = "telemetry"))]
fn init_tracing() {}

/// Run the start command. Startup failures map to distinct exit codes.
pub async fn run_start(config_path: &Path) -> Result<()> {
    init_tracing();

    let config = match Config::from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("strata: bad configuration: {e:#}");
            std::process::exit(ExitCode::BadConfig.code());
        }
    };

    // A single-binary deployment hosts one member; multi-member
    // clusters run one process per member behind a real transport.
    let mesh = LocalMesh::new();
    let incoming = mesh.register(config.node_id);
    let transport: Arc<dyn Transport> = mesh;

    let node = match Node::start(config, transport, incoming).await {
        Ok(node) => node,
        Err(e) => {
            eprintln!("strata: startup failed: {e}");
            std::process::exit(exit_code_of(&e));
        }
    };

    tracing::info!(id = node.id(), cluster_id = node.cluster_id(), "member started");
    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    tracing::info!("shutting down");
    node.stop().await;
    Ok(())
}

fn exit_code_of(error: &Error) -> i32 {
    let text = error.to_string();
    if text.contains("data directory is locked") {
        ExitCode::DataDirInUse.code()
    } else if text.contains("wal:") {
        ExitCode::UnrecoverableWal.code()
    } else if matches!(error, Error::Corrupt { .. }) {
        ExitCode::BackendCorrupt.code()
    } else if matches!(error, Error::Membership { .. }) {
        ExitCode::JoinFailed.code()
    } else {
        1
    }
}
