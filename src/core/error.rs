//! Error types observable by clients and the process exit-code mapping.
//!
//! Errors produced inside the apply pipeline are captured into the result
//! of the proposal they belong to and never abort the pipeline. Errors
//! from WAL sync, snapshot install, or backend commit are fatal: the node
//! raises an alarm and refuses further writes.

use thiserror::Error;

/// Common error conditions surfaced to clients.
#[derive(Debug, Error)]
pub enum Error {
    /// Requested revision has not been applied locally yet.
    #[error("revision {revision} is in the future; current revision is {current}")]
    FutureRev { revision: i64, current: i64 },

    /// Requested revision is below the compaction floor.
    #[error("revision {revision} has been compacted; compaction floor is {floor}")]
    Compacted { revision: i64, floor: i64 },

    /// No leader is currently known to this node.
    #[error("no leader")]
    NoLeader,

    /// This node is not the leader; the hint names the member to retry against.
    #[error("not leader; current leader is member {hint}")]
    NotLeader { hint: u64 },

    /// Referenced lease id is unknown.
    #[error("lease {lease_id} not found")]
    LeaseNotFound { lease_id: i64 },

    /// Lease id already granted.
    #[error("lease {lease_id} already exists")]
    LeaseExists { lease_id: i64 },

    /// Proposal payload exceeds the configured entry cap.
    #[error("request of {size} bytes exceeds the {limit} byte limit")]
    RequestTooLarge { size: usize, limit: usize },

    /// Backpressure: proposal queue or waiter table is full, or the node is draining.
    #[error("unavailable: {reason}")]
    Unavailable { reason: String },

    /// The request was cancelled before commit or apply.
    #[error("request cancelled")]
    Cancelled,

    /// A peer detected a state-hash mismatch; writes are refused until cleared.
    #[error("corruption detected: {detail}")]
    Corrupt { detail: String },

    /// Key does not exist at the requested revision.
    #[error("key not found")]
    KeyNotFound,

    /// Authentication or permission failure.
    #[error("permission denied: {message}")]
    PermissionDenied { message: String },

    /// User or role bookkeeping failure.
    #[error("auth: {message}")]
    AuthFailed { message: String },

    /// The backend was shut down; no further transactions are accepted.
    #[error("backend closed")]
    BackendClosed,

    /// Membership change rejected (duplicate member, pending conf change, unknown id).
    #[error("membership: {message}")]
    Membership { message: String },

    /// Malformed request (empty key, oversized key, bad range bounds).
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// Unclassified internal failure.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Build an [`Error::Unavailable`] with the given reason.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Build an [`Error::Internal`] with the given message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the caller may retry the operation unchanged.
    ///
    /// `FutureRev` retries once the applied index catches up; `NoLeader`,
    /// `NotLeader`, and `Unavailable` retry elsewhere or after backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::FutureRev { .. }
                | Self::NoLeader
                | Self::NotLeader { .. }
                | Self::Unavailable { .. }
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Process exit codes for startup failures.
///
/// Each failure class maps to a distinct non-zero code so supervisors can
/// distinguish a bad config from a damaged data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Configuration failed to parse or validate.
    BadConfig = 2,
    /// Another process holds the data directory.
    DataDirInUse = 3,
    /// Joining an existing cluster failed.
    JoinFailed = 4,
    /// WAL replay hit a CRC mismatch or other unrecoverable damage.
    UnrecoverableWal = 5,
    /// The backend journal failed its integrity check.
    BackendCorrupt = 6,
}

impl ExitCode {
    /// The numeric process exit code.
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Alarm kinds raised on fatal storage errors.
///
/// An active alarm puts the node into read-only mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alarm {
    /// Storage medium is full or write failed.
    NoSpace,
    /// State divergence detected between peers.
    Corrupt,
}

impl std::fmt::Display for Alarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSpace => write!(f, "NOSPACE"),
            Self::Corrupt => write!(f, "CORRUPT"),
        }
    }
}
