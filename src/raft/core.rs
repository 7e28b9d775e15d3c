//! The consensus state machine.
//!
//! Pure state: no I/O, no clock. Ticks and messages arrive as inputs;
//! outputs accumulate in the outbox and the cursors the driver collects
//! into a [`Ready`](crate::raft::types::Ready). The rules follow the
//! classic single-decree-per-index formulation: randomized elections
//! with an optional pre-vote round, log matching with rejection hints,
//! quorum commit restricted to the current term, one-at-a-time
//! membership changes, snapshot transfer for followers that fell behind
//! the compacted prefix, check-quorum step-down, and read-index fences.

use crate::core::error::{Error, Result};
use crate::raft::log::RaftLog;
use crate::raft::progress::{Progress, ProgressState};
use crate::raft::types::{
    ConfChange, ConfChangeKind, ConfState, Entry, EntryKind, HardState, Message, MessageKind,
    NodeId, ReadState, Role, Snapshot, SoftState, NONE,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Timing and behavior knobs for the core.
#[derive(Debug, Clone)]
pub struct RaftOptions {
    /// Election timeout in ticks; the effective timeout is randomized in
    /// `[election_ticks, 2 * election_ticks)`.
    pub election_ticks: u64,
    /// Heartbeat interval in ticks.
    pub heartbeat_ticks: u64,
    /// Run a pre-vote round before adopting a new term.
    pub pre_vote: bool,
    /// Leader steps down when a quorum goes quiet for a full election
    /// window.
    pub check_quorum: bool,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            election_ticks: 10,
            heartbeat_ticks: 1,
            pre_vote: true,
            check_quorum: true,
        }
    }
}

/// A pending linearizable-read fence.
#[derive(Debug)]
struct ReadIndexStatus {
    ctx: Vec<u8>,
    /// Commit index captured when the fence was requested.
    index: u64,
    /// Origin: [`NONE`] for a local request, otherwise the follower to
    /// answer.
    from: NodeId,
    acks: BTreeSet<NodeId>,
}

/// The consensus core.
pub struct Raft {
    pub id: NodeId,
    pub term: u64,
    pub vote: NodeId,
    pub role: Role,
    pub leader_id: NodeId,
    pub log: RaftLog,

    /// Voting membership.
    voters: BTreeSet<NodeId>,
    /// Per-peer progress; leader only.
    prs: BTreeMap<NodeId, Progress>,
    /// Votes received while campaigning.
    votes: HashMap<NodeId, bool>,

    /// Outbox drained by the driver.
    msgs: Vec<Message>,
    /// Satisfied read fences drained by the driver.
    read_states: Vec<ReadState>,
    /// Received snapshot awaiting installation by the host.
    pending_snapshot: Option<Snapshot>,
    /// Latest local snapshot, cloned into transfers for slow followers.
    latest_snapshot: Option<Snapshot>,

    /// Log index of the latest unapplied membership change.
    pending_conf_index: u64,
    read_only: VecDeque<ReadIndexStatus>,

    election_elapsed: u64,
    heartbeat_elapsed: u64,
    randomized_election_timeout: u64,
    opts: RaftOptions,
    rng: StdRng,
}

impl Raft {
    /// Build a core for `id` with the given voters and recovered state.
    pub fn new(
        id: NodeId,
        voters: impl IntoIterator<Item = NodeId>,
        opts: RaftOptions,
        log: RaftLog,
        hard_state: Option<HardState>,
    ) -> Raft {
        let voters: BTreeSet<NodeId> = voters.into_iter().collect();
        debug_assert!(!voters.is_empty());
        let mut raft = Raft {
            id,
            term: 0,
            vote: NONE,
            role: Role::Follower,
            leader_id: NONE,
            log,
            voters,
            prs: BTreeMap::new(),
            votes: HashMap::new(),
            msgs: Vec::new(),
            read_states: Vec::new(),
            pending_snapshot: None,
            latest_snapshot: None,
            pending_conf_index: 0,
            read_only: VecDeque::new(),
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            randomized_election_timeout: 0,
            opts,
            rng: StdRng::from_entropy(),
        };
        if let Some(hs) = hard_state {
            raft.term = hs.term;
            raft.vote = hs.vote;
            raft.log.commit_to(hs.commit);
        }
        raft.reset_randomized_election_timeout();
        raft
    }

    /// Current durable state.
    pub fn hard_state(&self) -> HardState {
        HardState {
            term: self.term,
            vote: self.vote,
            commit: self.log.committed,
        }
    }

    /// Current volatile state.
    pub fn soft_state(&self) -> SoftState {
        SoftState {
            leader: self.leader_id,
            role: self.role,
        }
    }

    /// Voting membership at the applied index.
    pub fn conf_state(&self) -> ConfState {
        ConfState::new(self.voters.iter().copied())
    }

    /// Drain the outbox.
    pub fn take_msgs(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.msgs)
    }

    /// Drain satisfied read fences.
    pub fn take_read_states(&mut self) -> Vec<ReadState> {
        std::mem::take(&mut self.read_states)
    }

    /// Take a received snapshot pending installation.
    pub fn take_pending_snapshot(&mut self) -> Option<Snapshot> {
        self.pending_snapshot.take()
    }

    /// Install the newest local snapshot image for follower catch-up.
    /// The log keeps `keep_entries` entries below the snapshot point so
    /// mildly lagging followers catch up by appends instead of a
    /// snapshot transfer.
    pub fn store_snapshot(&mut self, snapshot: Snapshot, keep_entries: u64) {
        let compact_to = snapshot
            .meta
            .index
            .saturating_sub(keep_entries)
            .min(self.log.applied);
        if let Some(term) = self.log.term(compact_to) {
            self.log.compact_to(compact_to, term);
        }
        self.latest_snapshot = Some(snapshot);
    }

    /// One logical clock step.
    pub fn tick(&mut self) {
        match self.role {
            Role::Leader => self.tick_heartbeat(),
            _ => self.tick_election(),
        }
    }

    fn tick_election(&mut self) {
        self.election_elapsed += 1;
        if self.election_elapsed >= self.randomized_election_timeout {
            self.election_elapsed = 0;
            self.campaign(self.opts.pre_vote);
        }
    }

    fn tick_heartbeat(&mut self) {
        self.heartbeat_elapsed += 1;
        self.election_elapsed += 1;
        if self.election_elapsed >= self.opts.election_ticks {
            self.election_elapsed = 0;
            if self.opts.check_quorum && !self.check_quorum_active() {
                tracing::warn!(id = self.id, term = self.term, "leader lost quorum contact");
                let term = self.term;
                self.become_follower(term, NONE);
                return;
            }
        }
        if self.heartbeat_elapsed >= self.opts.heartbeat_ticks {
            self.heartbeat_elapsed = 0;
            self.bcast_heartbeat(Vec::new());
        }
    }

    /// Count peers heard from in the last window, clearing the flags.
    fn check_quorum_active(&mut self) -> bool {
        let mut active = 1; // self
        for (id, pr) in self.prs.iter_mut() {
            if *id == self.id {
                continue;
            }
            if pr.recent_active {
                active += 1;
            }
            pr.recent_active = false;
        }
        active >= self.quorum()
    }

    fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    fn reset_randomized_election_timeout(&mut self) {
        self.randomized_election_timeout =
            self.opts.election_ticks + self.rng.gen_range(0..self.opts.election_ticks.max(1));
    }

    fn reset(&mut self, term: u64) {
        if self.term != term {
            self.term = term;
            self.vote = NONE;
        }
        self.leader_id = NONE;
        self.election_elapsed = 0;
        self.heartbeat_elapsed = 0;
        self.votes.clear();
        self.read_only.clear();
        self.reset_randomized_election_timeout();
    }

    fn become_follower(&mut self, term: u64, leader: NodeId) {
        let was = self.role;
        self.reset(term);
        self.role = Role::Follower;
        self.leader_id = leader;
        if was != Role::Follower {
            tracing::info!(id = self.id, term, leader, "became follower");
        }
    }

    fn become_pre_candidate(&mut self) {
        // Term and vote stay put; a pre-vote that fails must leave no
        // trace.
        self.role = Role::PreCandidate;
        self.leader_id = NONE;
        self.votes.clear();
        tracing::info!(id = self.id, term = self.term, "became pre-candidate");
    }

    fn become_candidate(&mut self) {
        let term = self.term + 1;
        self.reset(term);
        self.role = Role::Candidate;
        self.vote = self.id;
        tracing::info!(id = self.id, term = self.term, "became candidate");
    }

    fn become_leader(&mut self) {
        let term = self.term;
        self.reset(term);
        self.role = Role::Leader;
        self.leader_id = self.id;
        self.prs = self
            .voters
            .iter()
            .map(|&id| {
                let mut pr = Progress::new(self.log.last_index() + 1);
                if id == self.id {
                    pr.matched = self.log.last_index();
                    pr.state = ProgressState::Replicate;
                }
                (id, pr)
            })
            .collect();
        // Block conf changes until the no-op below commits.
        self.pending_conf_index = self.log.last_index() + 1;
        tracing::info!(id = self.id, term = self.term, "became leader");
        // Commit an entry in the new term before answering anything.
        self.append_entries(vec![Entry {
            term: self.term,
            index: 0,
            kind: EntryKind::Normal,
            data: Vec::new(),
        }]);
        self.bcast_append();
    }

    /// Start an election (or a pre-vote round).
    pub fn campaign(&mut self, pre: bool) {
        if self.voters.len() == 1 && self.voters.contains(&self.id) {
            // Sole voter: win immediately.
            self.become_candidate();
            self.become_leader();
            return;
        }
        let (kind, term) = if pre {
            self.become_pre_candidate();
            (MessageKind::PreVote, self.term + 1)
        } else {
            self.become_candidate();
            (MessageKind::Vote, self.term)
        };
        self.votes.insert(self.id, true);

        let last_index = self.log.last_index();
        let last_term = self.log.last_term();
        for &peer in self.voters.clone().iter() {
            if peer == self.id {
                continue;
            }
            let mut m = Message::new(kind, self.id, peer, term);
            m.index = last_index;
            m.log_term = last_term;
            self.msgs.push(m);
        }
    }

    fn poll(&mut self, from: NodeId, granted: bool) -> (usize, usize) {
        self.votes.entry(from).or_insert(granted);
        let granted_n = self.votes.values().filter(|g| **g).count();
        let rejected_n = self.votes.len() - granted_n;
        (granted_n, rejected_n)
    }

    /// Propose a command. Leader only; returns the entry's index.
    pub fn propose(&mut self, data: Vec<u8>) -> Result<u64> {
        self.ensure_leader()?;
        self.append_entries(vec![Entry {
            term: self.term,
            index: 0,
            kind: EntryKind::Normal,
            data,
        }]);
        self.bcast_append();
        Ok(self.log.last_index())
    }

    /// Propose a membership change; `data` is the host's encoding of the
    /// change. At most one may be in flight between proposal and apply.
    pub fn propose_conf_change(&mut self, data: Vec<u8>) -> Result<u64> {
        self.ensure_leader()?;
        if self.pending_conf_index > self.log.applied {
            return Err(Error::unavailable(
                "a configuration change is already pending",
            ));
        }
        self.append_entries(vec![Entry {
            term: self.term,
            index: 0,
            kind: EntryKind::ConfChange,
            data,
        }]);
        self.pending_conf_index = self.log.last_index();
        self.bcast_append();
        Ok(self.log.last_index())
    }

    /// Apply a committed membership change to the voter set. Called by
    /// the host after the entry went through the state machine.
    pub fn apply_conf_change(&mut self, cc: &ConfChange) -> ConfState {
        match cc.kind {
            ConfChangeKind::AddNode => {
                if self.voters.insert(cc.node_id) && self.role == Role::Leader {
                    self.prs
                        .insert(cc.node_id, Progress::new(self.log.last_index() + 1));
                }
            }
            ConfChangeKind::RemoveNode => {
                self.voters.remove(&cc.node_id);
                self.prs.remove(&cc.node_id);
                // A smaller quorum may already be satisfied.
                if self.role == Role::Leader {
                    self.maybe_commit();
                }
            }
            ConfChangeKind::UpdateNode => {}
        }
        self.conf_state()
    }

    /// Request a linearizable-read fence with a caller-unique token.
    pub fn read_index(&mut self, ctx: Vec<u8>) -> Result<()> {
        match self.role {
            Role::Leader => {
                self.process_read_index(ctx, NONE);
                Ok(())
            }
            _ => {
                if self.leader_id == NONE {
                    return Err(Error::NoLeader);
                }
                let mut m =
                    Message::new(MessageKind::ReadIndex, self.id, self.leader_id, self.term);
                m.context = ctx;
                self.msgs.push(m);
                Ok(())
            }
        }
    }

    fn process_read_index(&mut self, ctx: Vec<u8>, from: NodeId) {
        let index = self.log.committed;
        if self.quorum() == 1 {
            self.release_read(ReadIndexStatus {
                ctx,
                index,
                from,
                acks: BTreeSet::new(),
            });
            return;
        }
        self.read_only.push_back(ReadIndexStatus {
            ctx: ctx.clone(),
            index,
            from,
            acks: BTreeSet::new(),
        });
        self.bcast_heartbeat(ctx);
    }

    fn release_read(&mut self, status: ReadIndexStatus) {
        if status.from == NONE {
            self.read_states.push(ReadState {
                index: status.index,
                request_ctx: status.ctx,
            });
        } else {
            let mut m = Message::new(
                MessageKind::ReadIndexResponse,
                self.id,
                status.from,
                self.term,
            );
            m.index = status.index;
            m.context = status.ctx;
            self.msgs.push(m);
        }
    }

    fn recv_read_ack(&mut self, from: NodeId, ctx: &[u8]) {
        let Some(pos) = self.read_only.iter().position(|s| s.ctx == ctx) else {
            return;
        };
        self.read_only[pos].acks.insert(from);
        // Self plus ackers.
        if self.read_only[pos].acks.len() + 1 >= self.quorum() {
            let status = self.read_only.remove(pos).expect("position just found");
            self.release_read(status);
        }
    }

    fn ensure_leader(&self) -> Result<()> {
        match self.role {
            Role::Leader => Ok(()),
            _ if self.leader_id != NONE => Err(Error::NotLeader {
                hint: self.leader_id,
            }),
            _ => Err(Error::NoLeader),
        }
    }

    /// Feed one message into the state machine.
    pub fn step(&mut self, mut m: Message) -> Result<()> {
        let kind = m.kind();

        if m.term > self.term {
            if matches!(kind, MessageKind::Vote | MessageKind::PreVote)
                && self.opts.check_quorum
                && self.leader_id != NONE
                && self.election_elapsed < self.opts.election_ticks
            {
                // Still under the current leader's lease; a partitioned
                // peer must not disrupt it.
                return Ok(());
            }
            match kind {
                // A pre-vote never moves the term.
                MessageKind::PreVote => {}
                // Winning pre-vote responses carry the prospective term.
                MessageKind::PreVoteResponse if !m.reject => {}
                _ => {
                    let leader = match kind {
                        MessageKind::Append | MessageKind::Heartbeat | MessageKind::Snapshot => {
                            m.from
                        }
                        _ => NONE,
                    };
                    self.become_follower(m.term, leader);
                }
            }
        } else if m.term < self.term {
            match kind {
                MessageKind::PreVote => {
                    let mut resp =
                        Message::new(MessageKind::PreVoteResponse, self.id, m.from, self.term);
                    resp.reject = true;
                    self.msgs.push(resp);
                }
                MessageKind::Append | MessageKind::Heartbeat => {
                    // Tell the stale leader about the newer term.
                    let resp =
                        Message::new(MessageKind::AppendResponse, self.id, m.from, self.term);
                    self.msgs.push(resp);
                }
                _ => {}
            }
            return Ok(());
        }

        match kind {
            MessageKind::Vote | MessageKind::PreVote => {
                self.handle_vote_request(&m);
                return Ok(());
            }
            _ => {}
        }

        match self.role {
            Role::Leader => self.step_leader(m),
            Role::Candidate | Role::PreCandidate => self.step_candidate(m),
            Role::Follower => self.step_follower(&mut m),
        }
        Ok(())
    }

    fn handle_vote_request(&mut self, m: &Message) {
        let kind = m.kind();
        let resp_kind = match kind {
            MessageKind::PreVote => MessageKind::PreVoteResponse,
            _ => MessageKind::VoteResponse,
        };
        let can_vote = match kind {
            MessageKind::PreVote => m.term > self.term,
            _ => self.vote == NONE || self.vote == m.from,
        };
        let grant = can_vote && self.log.is_up_to_date(m.index, m.log_term);

        // A pre-vote grant echoes the prospective term; any rejection
        // carries our real term so a losing round cannot inflate terms.
        let resp_term = if grant && kind == MessageKind::PreVote {
            m.term
        } else {
            self.term
        };
        let mut resp = Message::new(resp_kind, self.id, m.from, resp_term);
        resp.reject = !grant;
        self.msgs.push(resp);

        if grant && kind == MessageKind::Vote {
            self.vote = m.from;
            self.election_elapsed = 0;
        }
    }

    fn step_leader(&mut self, m: Message) {
        let from = m.from;
        match m.kind() {
            MessageKind::AppendResponse => {
                let Some(pr) = self.prs.get_mut(&from) else {
                    return;
                };
                pr.recent_active = true;
                if m.reject {
                    if pr.maybe_decr_to(m.index, m.reject_hint) {
                        self.send_append(from);
                    }
                } else {
                    let advanced = pr.maybe_update(m.index);
                    if pr.state == ProgressState::Snapshot && pr.matched >= pr.pending_snapshot {
                        pr.snapshot_done();
                    }
                    if advanced && self.maybe_commit() {
                        self.bcast_append();
                    } else if self.prs[&from].next <= self.log.last_index() {
                        self.send_append(from);
                    }
                }
            }
            MessageKind::HeartbeatResponse => {
                if let Some(pr) = self.prs.get_mut(&from) {
                    pr.recent_active = true;
                    if pr.matched < self.log.last_index() && !pr.is_paused() {
                        self.send_append(from);
                    }
                }
                if !m.context.is_empty() {
                    self.recv_read_ack(from, &m.context);
                }
            }
            MessageKind::ReadIndex => {
                self.process_read_index(m.context, from);
            }
            MessageKind::VoteResponse | MessageKind::PreVoteResponse => {}
            MessageKind::TimeoutNow => {}
            _ => {}
        }
    }

    fn step_candidate(&mut self, m: Message) {
        let expected = match self.role {
            Role::PreCandidate => MessageKind::PreVoteResponse,
            _ => MessageKind::VoteResponse,
        };
        match m.kind() {
            kind if kind == expected => {
                let (granted, rejected) = self.poll(m.from, !m.reject);
                if granted >= self.quorum() {
                    match self.role {
                        Role::PreCandidate => self.campaign(false),
                        _ => self.become_leader(),
                    }
                } else if rejected >= self.quorum() {
                    let term = self.term;
                    self.become_follower(term, NONE);
                }
            }
            MessageKind::Append => {
                self.become_follower(m.term, m.from);
                self.handle_append(m);
            }
            MessageKind::Heartbeat => {
                self.become_follower(m.term, m.from);
                self.handle_heartbeat(m);
            }
            MessageKind::Snapshot => {
                self.become_follower(m.term, m.from);
                self.handle_snapshot(m);
            }
            _ => {}
        }
    }

    fn step_follower(&mut self, m: &mut Message) {
        match m.kind() {
            MessageKind::Append => {
                self.election_elapsed = 0;
                self.leader_id = m.from;
                self.handle_append(std::mem::take(m));
            }
            MessageKind::Heartbeat => {
                self.election_elapsed = 0;
                self.leader_id = m.from;
                self.handle_heartbeat(std::mem::take(m));
            }
            MessageKind::Snapshot => {
                self.election_elapsed = 0;
                self.leader_id = m.from;
                self.handle_snapshot(std::mem::take(m));
            }
            MessageKind::TimeoutNow => {
                tracing::info!(id = self.id, from = m.from, "timeout-now: campaigning");
                self.campaign(false);
            }
            MessageKind::ReadIndex => {
                // Relay to the leader.
                if self.leader_id != NONE {
                    let mut fwd = Message::new(
                        MessageKind::ReadIndex,
                        m.from,
                        self.leader_id,
                        self.term,
                    );
                    fwd.context = std::mem::take(&mut m.context);
                    self.msgs.push(fwd);
                }
            }
            MessageKind::ReadIndexResponse => {
                self.read_states.push(ReadState {
                    index: m.index,
                    request_ctx: std::mem::take(&mut m.context),
                });
            }
            _ => {}
        }
    }

    fn handle_append(&mut self, m: Message) {
        if m.index < self.log.committed {
            let mut resp = Message::new(MessageKind::AppendResponse, self.id, m.from, self.term);
            resp.index = self.log.committed;
            self.msgs.push(resp);
            return;
        }
        match self
            .log
            .maybe_append(m.index, m.log_term, m.commit, m.entries)
        {
            Some(last) => {
                let mut resp =
                    Message::new(MessageKind::AppendResponse, self.id, m.from, self.term);
                resp.index = last;
                self.msgs.push(resp);
            }
            None => {
                tracing::debug!(
                    id = self.id,
                    index = m.index,
                    log_term = m.log_term,
                    "rejecting append: log mismatch"
                );
                let mut resp =
                    Message::new(MessageKind::AppendResponse, self.id, m.from, self.term);
                resp.reject = true;
                resp.index = m.index;
                resp.reject_hint = self.log.last_index();
                self.msgs.push(resp);
            }
        }
    }

    fn handle_heartbeat(&mut self, m: Message) {
        self.log.commit_to(m.commit);
        let mut resp = Message::new(MessageKind::HeartbeatResponse, self.id, m.from, self.term);
        resp.context = m.context;
        self.msgs.push(resp);
    }

    fn handle_snapshot(&mut self, m: Message) {
        let Some(snapshot) = m.snapshot else {
            return;
        };
        let (index, term) = (snapshot.meta.index, snapshot.meta.term);
        let mut resp = Message::new(MessageKind::AppendResponse, self.id, m.from, self.term);
        if index <= self.log.committed {
            resp.index = self.log.committed;
        } else if self.log.match_term(index, term) {
            // We already hold the entries; just advance the commit.
            self.log.commit_to(index);
            resp.index = self.log.committed;
        } else {
            tracing::info!(id = self.id, index, term, "installing received snapshot");
            self.log.restore(&snapshot);
            self.voters = snapshot.meta.conf_state.voters.iter().copied().collect();
            self.pending_snapshot = Some(snapshot);
            resp.index = self.log.last_index();
        }
        self.msgs.push(resp);
    }

    /// Append entries as leader, stamping term and contiguous indices.
    fn append_entries(&mut self, mut entries: Vec<Entry>) {
        let mut index = self.log.last_index();
        for entry in entries.iter_mut() {
            index += 1;
            entry.term = self.term;
            entry.index = index;
        }
        self.log.append(entries);
        if let Some(pr) = self.prs.get_mut(&self.id) {
            pr.maybe_update(index);
        }
        self.maybe_commit();
    }

    /// Advance the commit index to the quorum match point, but only for
    /// entries of the current term.
    fn maybe_commit(&mut self) -> bool {
        let mut matches: Vec<u64> = self
            .voters
            .iter()
            .map(|id| self.prs.get(id).map(|pr| pr.matched).unwrap_or(0))
            .collect();
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let mid = matches[self.quorum() - 1];
        if mid > self.log.committed && self.log.term(mid) == Some(self.term) {
            self.log.commit_to(mid);
            return true;
        }
        false
    }

    /// Send appends to every peer.
    fn bcast_append(&mut self) {
        for peer in self.voters.clone() {
            if peer != self.id {
                self.send_append(peer);
            }
        }
    }

    fn send_append(&mut self, to: NodeId) {
        let Some(pr) = self.prs.get(&to) else {
            return;
        };
        if pr.is_paused() {
            return;
        }
        let prev_index = pr.next - 1;
        match self.log.term(prev_index) {
            Some(prev_term) => {
                let entries = self.log.entries_from(pr.next);
                let mut m = Message::new(MessageKind::Append, self.id, to, self.term);
                m.index = prev_index;
                m.log_term = prev_term;
                m.entries = entries;
                m.commit = self.log.committed;
                self.msgs.push(m);
            }
            None => {
                // The prefix the peer needs is compacted away.
                let Some(snapshot) = self.latest_snapshot.clone() else {
                    tracing::warn!(
                        to,
                        next = pr.next,
                        "peer needs a snapshot but none is stored yet"
                    );
                    return;
                };
                let index = snapshot.meta.index;
                tracing::info!(to, index, "sending snapshot to lagging peer");
                let mut m = Message::new(MessageKind::Snapshot, self.id, to, self.term);
                m.snapshot = Some(snapshot);
                self.msgs.push(m);
                if let Some(pr) = self.prs.get_mut(&to) {
                    pr.become_snapshot(index);
                }
            }
        }
    }

    fn bcast_heartbeat(&mut self, ctx: Vec<u8>) {
        for peer in self.voters.clone() {
            if peer == self.id {
                continue;
            }
            let commit = self
                .prs
                .get(&peer)
                .map(|pr| pr.matched.min(self.log.committed))
                .unwrap_or(0);
            let mut m = Message::new(MessageKind::Heartbeat, self.id, peer, self.term);
            m.commit = commit;
            m.context = ctx.clone();
            self.msgs.push(m);
        }
    }

    /// Ask `to` to campaign immediately (leadership transfer).
    pub fn send_timeout_now(&mut self, to: NodeId) {
        let m = Message::new(MessageKind::TimeoutNow, self.id, to, self.term);
        self.msgs.push(m);
    }

    /// Whether there is buffered output for the driver.
    pub fn has_output(&self) -> bool {
        !self.msgs.is_empty()
            || !self.read_states.is_empty()
            || self.pending_snapshot.is_some()
            || !self.log.unstable_entries().is_empty()
            || self.log.applied < self.log.committed
    }
}
