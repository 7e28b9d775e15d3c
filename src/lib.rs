//! Strata - strongly consistent distributed key-value store.
//!
//! Strata replicates an MVCC key space across a cluster with a
//! consensus log, retains bounded history keyed by a monotonically
//! increasing revision, expires ephemeral keys through server-side
//! leases, and streams in-order change notifications to watchers. It
//! survives process crashes and minority node failures.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Request Surface                           │
//! │   Range │ Put │ DeleteRange │ Txn │ Watch │ Lease │ Members     │
//! └─────────────────────────────────────────────────────────────────┘
//!                                 │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Apply Pipeline                            │
//! │       command interpreter │ compares │ proposal waiters         │
//! └─────────────────────────────────────────────────────────────────┘
//!                                 │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      MVCC State Machine                         │
//! │   revision index │ value log │ leases │ watch hub │ compaction  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                 │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Consensus Core                            │
//! │        WAL │ snapshots │ replication │ elections │ reads        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::error`] - Error taxonomy and exit codes
//!
//! ## Consensus
//! - [`raft::core`] - Deterministic consensus state machine
//! - [`raft::log`] - In-memory log with durability cursors
//! - [`raft::node`] - Cooperative driver and the Ready/Advance protocol
//! - [`raft::transport`] - Peer transport seam and in-memory mesh
//!
//! ## Storage
//! - [`storage::wal`] - Segmented, CRC-chained write-ahead log
//! - [`storage::backend`] - Transactional bucketed byte store
//! - [`storage::snap`] - Snapshot files
//!
//! ## State machine
//! - [`mvcc::index`] - Key → revision-generation index
//! - [`mvcc::store`] - Revisioned store: transactions, compaction, hash
//! - [`watch`] - Watcher hub with synced/unsynced populations
//! - [`lease`] - TTL leases with consensus-driven expiry
//!
//! ## Server
//! - [`server::command`] - Typed request surface and command envelope
//! - [`server::apply`] - Committed-command interpreter
//! - [`server::runtime`] - Node assembly and task loops
//!
//! # Key invariants
//!
//! - Revisions are dense: each mutating apply step allocates exactly one
//!   new main revision; no-ops allocate none.
//! - The WAL holds every entry before any message or acknowledgment
//!   depends on it.
//! - Applying the same log prefix yields bitwise-identical value-log
//!   content on every member; the FNV fingerprint checks it.
//! - Watchers see each event exactly once, in revision order, or a
//!   `compacted` cancellation.

pub mod cli;
pub mod core;
pub mod lease;
pub mod mvcc;
pub mod raft;
pub mod server;
pub mod storage;
pub mod watch;

pub use crate::core::{config, error};
pub use server::{Node, ServerStatus};
