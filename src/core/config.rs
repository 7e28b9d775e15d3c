//! Configuration parsing and validation.
//!
//! Configuration is loaded from a TOML file with CLI overrides. Durations
//! are expressed in milliseconds, sizes in bytes; every knob carries a
//! default tuned for a three-node cluster on local disks.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Unique member id of this node. Must be non-zero.
    pub node_id: u64,

    /// Data directory holding `wal/`, `snap/`, and the backend `db` file.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Initial cluster membership: `member id → peer address`.
    #[serde(default)]
    pub initial_cluster: Vec<PeerConfig>,

    /// Raft timing and sizing.
    #[serde(default)]
    pub raft: RaftConfig,

    /// Storage tuning.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Lease manager tuning.
    #[serde(default)]
    pub lease: LeaseConfig,

    /// Watcher hub tuning.
    #[serde(default)]
    pub watch: WatchConfig,
}

/// One peer of the initial cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Member id.
    pub id: u64,
    /// Peer address used by the transport.
    pub addr: String,
}

/// Raft timing and sizing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Logical tick interval in milliseconds.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Election timeout in ticks; the randomized timeout is drawn from
    /// `[election_ticks, 2 * election_ticks)`.
    #[serde(default = "default_election_ticks")]
    pub election_ticks: u64,

    /// Heartbeat interval in ticks.
    #[serde(default = "default_heartbeat_ticks")]
    pub heartbeat_ticks: u64,

    /// Run a pre-vote round before incrementing the term.
    #[serde(default = "default_true")]
    pub pre_vote: bool,

    /// Leader steps down when it cannot reach a quorum within an
    /// election window.
    #[serde(default = "default_true")]
    pub check_quorum: bool,

    /// Number of applied entries between snapshots.
    #[serde(default = "default_snapshot_count")]
    pub snapshot_count: u64,

    /// A follower lagging more than this many entries behind the latest
    /// snapshot is caught up with a snapshot instead of log appends.
    #[serde(default = "default_snapshot_catchup_entries")]
    pub snapshot_catchup_entries: u64,

    /// Maximum size of one proposal payload.
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,

    /// Maximum number of in-flight proposal waiters.
    #[serde(default = "default_max_inflight_proposals")]
    pub max_inflight_proposals: usize,
}

/// Storage tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// WAL segment size before a cut, in bytes.
    #[serde(default = "default_wal_segment_bytes")]
    pub wal_segment_bytes: u64,

    /// Backend write batch flushes after this many pending operations.
    #[serde(default = "default_backend_batch_limit")]
    pub backend_batch_limit: usize,

    /// Backend write batch flushes after this age in milliseconds.
    #[serde(default = "default_backend_batch_interval_ms")]
    pub backend_batch_interval_ms: u64,

    /// Number of value-log records removed per compaction batch.
    #[serde(default = "default_compaction_batch_limit")]
    pub compaction_batch_limit: usize,

    /// Maximum key length accepted from clients.
    #[serde(default = "default_max_key_bytes")]
    pub max_key_bytes: usize,
}

/// Lease manager tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Expiry check interval in milliseconds.
    #[serde(default = "default_lease_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Minimum TTL granted, in seconds.
    #[serde(default = "default_min_lease_ttl_secs")]
    pub min_ttl_secs: i64,
}

/// Watcher hub tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Catch-up loop cadence in milliseconds.
    #[serde(default = "default_watch_catchup_interval_ms")]
    pub catchup_interval_ms: u64,

    /// Events drained per watcher per catch-up iteration.
    #[serde(default = "default_watch_batch_limit")]
    pub batch_limit: usize,

    /// Outbound channel capacity per watcher.
    #[serde(default = "default_watch_channel_capacity")]
    pub channel_capacity: usize,

    /// Catch-up iterations an unsynced watcher may fail to progress
    /// before it is cancelled.
    #[serde(default = "default_watch_stall_budget")]
    pub stall_budget: u32,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_tick_interval_ms() -> u64 {
    100
}
fn default_election_ticks() -> u64 {
    10
}
fn default_heartbeat_ticks() -> u64 {
    1
}
fn default_true() -> bool {
    true
}
fn default_snapshot_count() -> u64 {
    10_000
}
fn default_snapshot_catchup_entries() -> u64 {
    5_000
}
fn default_max_request_bytes() -> usize {
    1536 * 1024
}
fn default_max_inflight_proposals() -> usize {
    4096
}
fn default_wal_segment_bytes() -> u64 {
    64 * 1024 * 1024
}
fn default_backend_batch_limit() -> usize {
    10_000
}
fn default_backend_batch_interval_ms() -> u64 {
    100
}
fn default_compaction_batch_limit() -> usize {
    1_000
}
fn default_max_key_bytes() -> usize {
    1536
}
fn default_lease_tick_interval_ms() -> u64 {
    500
}
fn default_min_lease_ttl_secs() -> i64 {
    1
}
fn default_watch_catchup_interval_ms() -> u64 {
    100
}
fn default_watch_batch_limit() -> usize {
    1_000
}
fn default_watch_channel_capacity() -> usize {
    128
}
fn default_watch_stall_budget() -> u32 {
    10
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            election_ticks: default_election_ticks(),
            heartbeat_ticks: default_heartbeat_ticks(),
            pre_vote: true,
            check_quorum: true,
            snapshot_count: default_snapshot_count(),
            snapshot_catchup_entries: default_snapshot_catchup_entries(),
            max_request_bytes: default_max_request_bytes(),
            max_inflight_proposals: default_max_inflight_proposals(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            wal_segment_bytes: default_wal_segment_bytes(),
            backend_batch_limit: default_backend_batch_limit(),
            backend_batch_interval_ms: default_backend_batch_interval_ms(),
            compaction_batch_limit: default_compaction_batch_limit(),
            max_key_bytes: default_max_key_bytes(),
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_lease_tick_interval_ms(),
            min_ttl_secs: default_min_lease_ttl_secs(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            catchup_interval_ms: default_watch_catchup_interval_ms(),
            batch_limit: default_watch_batch_limit(),
            channel_capacity: default_watch_channel_capacity(),
            stall_budget: default_watch_stall_budget(),
        }
    }
}

impl Config {
    /// Load and validate a configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a single-node configuration rooted at `data_dir`, used by
    /// tests and bootstrap tooling.
    pub fn single_node(node_id: u64, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id,
            data_dir: data_dir.into(),
            initial_cluster: vec![PeerConfig {
                id: node_id,
                addr: String::from("local"),
            }],
            raft: RaftConfig::default(),
            storage: StorageConfig::default(),
            lease: LeaseConfig::default(),
            watch: WatchConfig::default(),
        }
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.node_id == 0 {
            anyhow::bail!("node_id must be non-zero");
        }
        if self.initial_cluster.is_empty() {
            anyhow::bail!("initial_cluster must name at least one member");
        }
        if !self.initial_cluster.iter().any(|p| p.id == self.node_id) {
            anyhow::bail!("node_id {} is not part of initial_cluster", self.node_id);
        }
        let mut ids: Vec<u64> = self.initial_cluster.iter().map(|p| p.id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.initial_cluster.len() {
            anyhow::bail!("initial_cluster contains duplicate member ids");
        }
        if self.raft.heartbeat_ticks == 0 || self.raft.election_ticks <= self.raft.heartbeat_ticks {
            anyhow::bail!("election_ticks must exceed heartbeat_ticks and both must be non-zero");
        }
        if self.raft.tick_interval_ms == 0 {
            anyhow::bail!("tick_interval_ms must be > 0");
        }
        if self.storage.backend_batch_limit == 0 {
            anyhow::bail!("backend_batch_limit must be > 0");
        }
        if self.lease.min_ttl_secs <= 0 {
            anyhow::bail!("lease min_ttl_secs must be positive");
        }
        Ok(())
    }

    /// Logical tick interval as a [`Duration`].
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.raft.tick_interval_ms)
    }

    /// Lease expiry check interval as a [`Duration`].
    pub fn lease_tick_interval(&self) -> Duration {
        Duration::from_millis(self.lease.tick_interval_ms)
    }

    /// Watch catch-up cadence as a [`Duration`].
    pub fn watch_catchup_interval(&self) -> Duration {
        Duration::from_millis(self.watch.catchup_interval_ms)
    }

    /// Member ids of the initial cluster, sorted.
    pub fn initial_member_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.initial_cluster.iter().map(|p| p.id).collect();
        ids.sort_unstable();
        ids
    }

    /// Directory holding WAL segments.
    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }

    /// Directory holding snapshot files.
    pub fn snap_dir(&self) -> PathBuf {
        self.data_dir.join("snap")
    }

    /// Path of the backend data file.
    pub fn backend_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }
}
