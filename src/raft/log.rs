//! The in-memory raft log.
//!
//! Entries live in a contiguous vector starting at `offset`; everything
//! below `offset` has been folded into a snapshot. Three cursors track
//! progress through the log: `persisted` (durable in the WAL),
//! `committed` (durable on a quorum), and `applied` (executed by the
//! state machine). `applied <= committed` always; `persisted` may lag
//! `committed` on a follower that learned the commit index before
//! syncing.

use crate::raft::types::{Entry, Snapshot};

/// The log.
#[derive(Debug, Default)]
pub struct RaftLog {
    /// Entries with indices `offset ..= offset + len - 1`.
    entries: Vec<Entry>,
    /// Index of `entries[0]`.
    offset: u64,
    /// Position covered by the latest snapshot.
    snapshot_index: u64,
    snapshot_term: u64,
    /// Highest index known committed.
    pub committed: u64,
    /// Highest index executed by the state machine.
    pub applied: u64,
    /// Highest index durable in the WAL.
    pub persisted: u64,
}

impl RaftLog {
    /// An empty log starting after `snapshot_index`.
    pub fn new(snapshot_index: u64, snapshot_term: u64) -> Self {
        Self {
            entries: Vec::new(),
            offset: snapshot_index + 1,
            snapshot_index,
            snapshot_term,
            committed: snapshot_index,
            applied: snapshot_index,
            persisted: snapshot_index,
        }
    }

    /// Rebuild from replayed WAL state: entries already durable.
    pub fn recover(snapshot_index: u64, snapshot_term: u64, entries: Vec<Entry>) -> Self {
        let persisted = entries.last().map(|e| e.index).unwrap_or(snapshot_index);
        Self {
            entries,
            offset: snapshot_index + 1,
            snapshot_index,
            snapshot_term,
            committed: snapshot_index,
            applied: snapshot_index,
            persisted,
        }
    }

    /// First index still held in memory.
    pub fn first_index(&self) -> u64 {
        self.offset
    }

    /// Index of the last entry (or of the snapshot when empty).
    pub fn last_index(&self) -> u64 {
        self.offset + self.entries.len() as u64 - 1
    }

    /// Term of the last entry.
    pub fn last_term(&self) -> u64 {
        self.term(self.last_index()).unwrap_or(0)
    }

    /// Term of the entry at `index`, if known.
    pub fn term(&self, index: u64) -> Option<u64> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        if index < self.offset || index > self.last_index() {
            return None;
        }
        Some(self.entries[(index - self.offset) as usize].term)
    }

    /// Whether the entry at `index` carries `term`.
    pub fn match_term(&self, index: u64, term: u64) -> bool {
        self.term(index) == Some(term)
    }

    /// Whether a candidate log at `(last_index, last_term)` is at least
    /// as up to date as ours.
    pub fn is_up_to_date(&self, last_index: u64, last_term: u64) -> bool {
        last_term > self.last_term()
            || (last_term == self.last_term() && last_index >= self.last_index())
    }

    /// Append entries after the current last index. Leader-side path;
    /// indices must be contiguous.
    pub fn append(&mut self, entries: Vec<Entry>) {
        debug_assert!(entries
            .first()
            .is_none_or(|e| e.index == self.last_index() + 1));
        self.entries.extend(entries);
    }

    /// Follower-side append: accept iff our entry at `prev_index` has
    /// `prev_term`. Conflicting suffixes are truncated; already-matching
    /// entries are skipped. Returns the new last index on acceptance.
    pub fn maybe_append(
        &mut self,
        prev_index: u64,
        prev_term: u64,
        leader_commit: u64,
        entries: Vec<Entry>,
    ) -> Option<u64> {
        if !self.match_term(prev_index, prev_term) {
            return None;
        }
        let last_new = prev_index + entries.len() as u64;
        let conflict = self.find_conflict(&entries);
        if conflict != 0 {
            debug_assert!(
                conflict > self.committed,
                "conflict {conflict} below commit {}",
                self.committed
            );
            let keep = (conflict - self.offset) as usize;
            self.entries.truncate(keep);
            // Truncated entries may have been synced already; the WAL
            // replay keeps the re-appended versions, the cursor follows.
            self.persisted = self.persisted.min(conflict - 1);
            let skip = (conflict - prev_index - 1) as usize;
            self.entries.extend(entries.into_iter().skip(skip));
        }
        self.commit_to(leader_commit.min(last_new));
        Some(last_new)
    }

    /// First index where `entries` disagrees with the log, or 0 when
    /// every entry is already present with the same term.
    fn find_conflict(&self, entries: &[Entry]) -> u64 {
        for entry in entries {
            if !self.match_term(entry.index, entry.term) {
                return entry.index;
            }
        }
        0
    }

    /// Raise the commit cursor.
    pub fn commit_to(&mut self, index: u64) {
        if index > self.committed {
            debug_assert!(
                index <= self.last_index(),
                "commit {index} beyond last {}",
                self.last_index()
            );
            self.committed = index;
        }
    }

    /// Record application progress.
    pub fn applied_to(&mut self, index: u64) {
        if index > self.applied {
            debug_assert!(index <= self.committed);
            self.applied = index;
        }
    }

    /// Record WAL durability progress.
    pub fn persisted_to(&mut self, index: u64) {
        if index > self.persisted {
            self.persisted = index;
        }
    }

    /// Entries not yet durable in the WAL.
    pub fn unstable_entries(&self) -> &[Entry] {
        if self.persisted >= self.last_index() {
            return &[];
        }
        &self.entries[(self.persisted + 1 - self.offset) as usize..]
    }

    /// Committed entries not yet applied, in order.
    pub fn next_committed_entries(&self) -> Vec<Entry> {
        self.slice(self.applied + 1, self.committed)
    }

    /// Entries in `[lo, hi]`, clamped to what is held in memory.
    pub fn slice(&self, lo: u64, hi: u64) -> Vec<Entry> {
        if lo > hi || hi < self.offset {
            return Vec::new();
        }
        let lo = lo.max(self.offset);
        let hi = hi.min(self.last_index());
        if lo > hi {
            return Vec::new();
        }
        self.entries[(lo - self.offset) as usize..=(hi - self.offset) as usize].to_vec()
    }

    /// Entries from `from` to the end, for replication.
    pub fn entries_from(&self, from: u64) -> Vec<Entry> {
        self.slice(from, self.last_index())
    }

    /// Fold the prefix up to `index` into a snapshot position, dropping
    /// the covered entries.
    pub fn compact_to(&mut self, index: u64, term: u64) {
        if index <= self.snapshot_index {
            return;
        }
        debug_assert!(index <= self.applied, "compacting unapplied entries");
        let drop = (index + 1).saturating_sub(self.offset) as usize;
        self.entries.drain(..drop.min(self.entries.len()));
        self.offset = index + 1;
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// Reset the whole log to a received snapshot.
    pub fn restore(&mut self, snapshot: &Snapshot) {
        self.entries.clear();
        self.offset = snapshot.meta.index + 1;
        self.snapshot_index = snapshot.meta.index;
        self.snapshot_term = snapshot.meta.term;
        self.committed = snapshot.meta.index;
        self.applied = snapshot.meta.index;
        self.persisted = snapshot.meta.index;
    }

    /// Position of the latest snapshot.
    pub fn snapshot_position(&self) -> (u64, u64) {
        (self.snapshot_index, self.snapshot_term)
    }
}
