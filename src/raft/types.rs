//! Wire and state types shared by the consensus core, the driver, and
//! the storage layer.

use serde::{Deserialize, Serialize};

/// Member id. Zero means "none" (no leader, no vote).
pub type NodeId = u64;

/// Sentinel id for "no node".
pub const NONE: NodeId = 0;

/// A single replicated log entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Term in which the entry was proposed.
    pub term: u64,
    /// Position in the log.
    pub index: u64,
    /// Normal command or membership change.
    pub kind: EntryKind,
    /// Payload. For normal entries this decodes to one command; for
    /// conf-change entries to a [`ConfChange`].
    pub data: Vec<u8>,
}

/// Log entry payload discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// A state-machine command.
    #[default]
    Normal,
    /// A one-at-a-time membership change.
    ConfChange,
}

/// Durable consensus state. Persisted before any entry is acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    /// Current term.
    pub term: u64,
    /// Member voted for in `term`, or [`NONE`].
    pub vote: NodeId,
    /// Highest log index known committed.
    pub commit: u64,
}

/// Volatile role and leadership view, reported through [`Ready`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftState {
    /// Current leader, or [`NONE`].
    pub leader: NodeId,
    /// Role of this node.
    pub role: Role,
}

/// Consensus role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    PreCandidate,
    Candidate,
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Follower => write!(f, "follower"),
            Self::PreCandidate => write!(f, "pre-candidate"),
            Self::Candidate => write!(f, "candidate"),
            Self::Leader => write!(f, "leader"),
        }
    }
}

/// Voting membership at a point in the log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfState {
    /// Ids of voting members, sorted.
    pub voters: Vec<NodeId>,
}

impl ConfState {
    /// Build a conf state from an iterator of voter ids.
    pub fn new(voters: impl IntoIterator<Item = NodeId>) -> Self {
        let mut voters: Vec<NodeId> = voters.into_iter().collect();
        voters.sort_unstable();
        voters.dedup();
        Self { voters }
    }

    /// Whether `id` is a voting member.
    pub fn contains(&self, id: NodeId) -> bool {
        self.voters.binary_search(&id).is_ok()
    }
}

/// Metadata identifying the log position a snapshot covers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Last log index included in the snapshot.
    pub index: u64,
    /// Term of that index.
    pub term: u64,
    /// Membership as of `index`.
    pub conf_state: ConfState,
}

/// A point-in-time image of the state machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Log position and membership the image covers.
    pub meta: SnapshotMeta,
    /// Opaque binary image of the MVCC, lease, auth, and membership state.
    pub data: Vec<u8>,
}

impl Snapshot {
    /// Whether this snapshot carries no state.
    pub fn is_empty(&self) -> bool {
        self.meta.index == 0
    }
}

/// A membership change, carried in a conf-change entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfChange {
    /// Kind of change.
    pub kind: ConfChangeKind,
    /// Member being added, removed, or updated.
    pub node_id: NodeId,
    /// Opaque payload (peer address for add/update).
    pub context: Vec<u8>,
}

/// Membership change kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfChangeKind {
    AddNode,
    RemoveNode,
    UpdateNode,
}

/// Kinds of messages exchanged between peers (plus local vote handling).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Log replication from the leader.
    Append,
    /// Follower response to an append.
    AppendResponse,
    /// Pre-vote solicitation (term is prospective, not adopted).
    PreVote,
    /// Pre-vote response.
    PreVoteResponse,
    /// Vote solicitation.
    Vote,
    /// Vote response.
    VoteResponse,
    /// Leader liveness and commit propagation.
    Heartbeat,
    /// Follower response to a heartbeat; carries read-index context back.
    HeartbeatResponse,
    /// Snapshot installation for a lagging follower.
    Snapshot,
    /// Leadership-transfer hint: start an election immediately.
    TimeoutNow,
    /// Linearizable read fence request.
    ReadIndex,
    /// Read fence response from the leader.
    ReadIndexResponse,
}

/// A consensus message. One struct covers every kind; unused fields stay
/// at their defaults and cost nothing on the wire after encoding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    pub kind: Option<MessageKind>,
    pub from: NodeId,
    pub to: NodeId,
    /// Sender's term (for pre-vote: the term it would campaign at).
    pub term: u64,
    /// Term of the entry at `index` (append, vote).
    pub log_term: u64,
    /// Log position the message refers to.
    pub index: u64,
    /// Entries to append.
    pub entries: Vec<Entry>,
    /// Sender's commit index.
    pub commit: u64,
    /// Snapshot payload for [`MessageKind::Snapshot`].
    pub snapshot: Option<Snapshot>,
    /// Set on negative append/vote responses.
    pub reject: bool,
    /// On append rejection: the follower's last index, as a hint for the
    /// leader's `next` regression.
    pub reject_hint: u64,
    /// Read-index token, echoed through heartbeats.
    pub context: Vec<u8>,
}

impl Message {
    /// Build a message of `kind` addressed to `to`.
    pub fn new(kind: MessageKind, from: NodeId, to: NodeId, term: u64) -> Self {
        Self {
            kind: Some(kind),
            from,
            to,
            term,
            ..Default::default()
        }
    }

    /// The message kind; defaults are never sent.
    pub fn kind(&self) -> MessageKind {
        self.kind.expect("message without kind")
    }

    /// Whether this kind carries a prospective term that must not cause
    /// the receiver to adopt it.
    pub fn is_prevote(&self) -> bool {
        matches!(
            self.kind,
            Some(MessageKind::PreVote) | Some(MessageKind::PreVoteResponse)
        )
    }
}

/// A satisfied linearizable-read fence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadState {
    /// Commit index the read must wait for before serving locally.
    pub index: u64,
    /// Caller-supplied token identifying the read.
    pub request_ctx: Vec<u8>,
}

/// The bundle of work the consensus core hands its host in one pass.
///
/// The host must: persist `hard_state` and `entries` to the WAL and sync;
/// persist and install `snapshot`; send `messages`; apply
/// `committed_entries` in order; then signal consumption so the next
/// `Ready` can be produced.
#[derive(Debug, Default)]
pub struct Ready {
    /// Role/leader change, if any.
    pub soft_state: Option<SoftState>,
    /// Durable state change, if any.
    pub hard_state: Option<HardState>,
    /// New entries to persist before `messages` are sent.
    pub entries: Vec<Entry>,
    /// Entries ready to apply, in log order.
    pub committed_entries: Vec<Entry>,
    /// A received snapshot to install, if any.
    pub snapshot: Option<Snapshot>,
    /// Messages to deliver to peers after `entries` are durable.
    pub messages: Vec<Message>,
    /// Satisfied read-index fences.
    pub read_states: Vec<ReadState>,
}

impl Ready {
    /// Whether this ready carries any work at all.
    pub fn is_empty(&self) -> bool {
        self.soft_state.is_none()
            && self.hard_state.is_none()
            && self.entries.is_empty()
            && self.committed_entries.is_empty()
            && self.snapshot.is_none()
            && self.messages.is_empty()
            && self.read_states.is_empty()
    }
}
