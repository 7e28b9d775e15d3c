//! Per-peer replication progress, kept by the leader.

/// Replication state of one follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    /// Next index unknown; send one probe append at a time.
    Probe,
    /// Pipeline appends freely.
    Replicate,
    /// Snapshot in flight; appends paused until it lands.
    Snapshot,
}

/// Leader's view of one peer.
#[derive(Debug, Clone)]
pub struct Progress {
    /// Highest index known replicated to the peer.
    pub matched: u64,
    /// Next index to send.
    pub next: u64,
    pub state: ProgressState,
    /// Index of the in-flight snapshot, if any.
    pub pending_snapshot: u64,
    /// Heard from the peer within the current check-quorum window.
    pub recent_active: bool,
}

impl Progress {
    /// Fresh progress for a peer whose log we have not probed yet.
    pub fn new(next: u64) -> Self {
        Self {
            matched: 0,
            next,
            state: ProgressState::Probe,
            pending_snapshot: 0,
            recent_active: false,
        }
    }

    /// Record a successful append response up to `index`. Returns whether
    /// the match advanced.
    pub fn maybe_update(&mut self, index: u64) -> bool {
        let updated = index > self.matched;
        if updated {
            self.matched = index;
            if self.state == ProgressState::Probe {
                self.state = ProgressState::Replicate;
            }
        }
        if index + 1 > self.next {
            self.next = index + 1;
        }
        updated
    }

    /// Regress `next` after a rejected append of `rejected`, using the
    /// follower's last index as a hint. Returns whether anything changed.
    pub fn maybe_decr_to(&mut self, rejected: u64, hint: u64) -> bool {
        if self.state == ProgressState::Replicate {
            // Stale rejection if the peer already matched past it.
            if rejected <= self.matched {
                return false;
            }
            self.next = self.matched + 1;
            return true;
        }
        // Probe: the rejection refers to the probe we sent.
        if self.next - 1 != rejected {
            return false;
        }
        self.next = (hint + 1).min(rejected).max(1);
        self.state = ProgressState::Probe;
        true
    }

    /// Enter snapshot state for a transfer covering `index`.
    pub fn become_snapshot(&mut self, index: u64) {
        self.state = ProgressState::Snapshot;
        self.pending_snapshot = index;
    }

    /// Snapshot landed (or failed); resume probing from the peer's
    /// reported position.
    pub fn snapshot_done(&mut self) {
        self.state = ProgressState::Probe;
        self.next = self.matched.max(self.pending_snapshot) + 1;
        self.pending_snapshot = 0;
    }

    /// Whether the leader should hold off sending appends.
    pub fn is_paused(&self) -> bool {
        self.state == ProgressState::Snapshot
    }
}
