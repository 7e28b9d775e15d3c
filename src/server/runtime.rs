//! Node assembly and the request surface.
//!
//! [`Node::start`] recovers durable state, spawns the cooperative task
//! set (consensus driver, ready loop, tick, lease expiry, watch
//! catch-up, compaction worker, transport intake), and exposes the typed
//! request surface clients talk to.
//!
//! The ready loop is the heart: for every `Ready` it persists to the
//! WAL, installs snapshots, sends messages, applies committed entries
//! through the [`Applier`], triggers proposal waiters, and signals the
//! driver. Fatal storage errors raise an alarm and stop acknowledging
//! writes; the node keeps serving reads.

use crate::core::config::Config;
use crate::core::error::{Alarm, Error, Result};
use crate::lease::Lessor;
use crate::mvcc::store::KvStore;
use crate::mvcc::KeyRange;
use crate::raft::core::{Raft, RaftOptions};
use crate::raft::log::RaftLog;
use crate::raft::node::{self, NodeHandle, NodeStatus};
use crate::raft::transport::Transport;
use crate::raft::types::{
    ConfChange, ConfChangeKind, ConfState, Entry, EntryKind, Message, NodeId, Ready, Role,
    Snapshot, SnapshotMeta,
};
use crate::server::apply::{Applier, CompactionJob, META_CONSISTENT_INDEX};
use crate::server::auth::AuthStore;
use crate::server::command::{
    CommandOp, CommandResponse, ConfChangeCommand, RaftCommand, RangeRequest, RangeResponse,
    ResponseHeader,
};
use crate::server::membership::{Member, MemberListResponse, MemberStore};
use crate::server::proposal::Wait;
use crate::storage::backend::{bucket, Backend};
use crate::storage::snap::Snapshotter;
use crate::storage::wal::{SnapshotPointer, Wal, WalError, WalMetadata};
use crate::watch::{WatchCreateRequest, WatchFilters, WatchResponse, WatcherHub};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// End-to-end deadline for one proposal.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(7);

/// Progress-notify cadence, in catch-up iterations.
const PROGRESS_EVERY: u32 = 50;

/// Leadership and term as last reported by the driver.
#[derive(Debug, Clone, Copy)]
struct View {
    leader: NodeId,
    term: u64,
    role: Role,
}

/// Pending linearizable-read fences.
#[derive(Default)]
struct ReadWait {
    slots: Mutex<HashMap<u64, oneshot::Sender<u64>>>,
}

impl ReadWait {
    fn register(&self, id: u64) -> oneshot::Receiver<u64> {
        let (tx, rx) = oneshot::channel();
        self.slots.lock().insert(id, tx);
        rx
    }

    fn trigger(&self, id: u64, index: u64) {
        if let Some(tx) = self.slots.lock().remove(&id) {
            let _ = tx.send(index);
        }
    }

    fn cancel(&self, id: u64) {
        self.slots.lock().remove(&id);
    }
}

/// Server-level status, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub node: NodeStatus,
    pub revision: i64,
    pub compact_revision: i64,
    pub alarm: Option<Alarm>,
}

/// A running member.
pub struct Node {
    cfg: Config,
    backend: Arc<Backend>,
    store: Arc<KvStore>,
    lessor: Arc<Lessor>,
    hub: Arc<WatcherHub>,
    auth: Arc<AuthStore>,
    members: Arc<MemberStore>,
    raft: NodeHandle,
    wait: Arc<Wait>,
    read_wait: Arc<ReadWait>,
    view: Arc<RwLock<View>>,
    applied_rx: watch::Receiver<u64>,
    alarm: Arc<RwLock<Option<Alarm>>>,
    shutdown: watch::Sender<bool>,
    next_id: AtomicU64,
    /// Held for the process lifetime; the OS lock guards the data dir.
    _dir_lock: std::fs::File,
}

impl Node {
    /// Recover state and start every task of this member.
    ///
    /// `transport` carries outbound peer messages; `incoming` delivers
    /// inbound ones.
    pub async fn start(
        cfg: Config,
        transport: Arc<dyn Transport>,
        incoming: mpsc::UnboundedReceiver<Message>,
    ) -> Result<Arc<Node>> {
        cfg.validate()
            .map_err(|e| Error::InvalidRequest {
                message: e.to_string(),
            })?;
        std::fs::create_dir_all(&cfg.data_dir).map_err(io_internal)?;
        let dir_lock = lock_data_dir(&cfg)?;

        let snapshotter = Snapshotter::new(&cfg.snap_dir())
            .map_err(|e| Error::internal(format!("snapshot dir: {e}")))?;
        let snapshot = snapshotter
            .load()
            .map_err(|e| Error::internal(format!("snapshot load: {e}")))?;
        let (snap_index, snap_term) = snapshot
            .as_ref()
            .map(|s| (s.meta.index, s.meta.term))
            .unwrap_or((0, 0));

        let backend = Arc::new(Backend::open(
            &cfg.backend_path(),
            cfg.storage.backend_batch_limit,
            Duration::from_millis(cfg.storage.backend_batch_interval_ms),
        )?);
        {
            let mut tx = backend.batch_tx().lock()?;
            tx.create_bucket(bucket::META);
            tx.commit()?;
        }
        let mut consistent_index = read_consistent_index(&backend)?;
        if let Some(snap) = &snapshot {
            // A snapshot newer than the backend means the crash hit
            // between snapshot save and backend flush; the image wins.
            if snap.meta.index > consistent_index {
                backend.restore_image(&snap.data)?;
                consistent_index = snap.meta.index;
            }
        }

        let metadata = WalMetadata {
            node_id: cfg.node_id,
            cluster_id: 0,
        };
        let (wal, hard_state, entries) =
            open_wal(&cfg, metadata, SnapshotPointer {
                index: snap_index,
                term: snap_term,
            })?;

        let lessor = Lessor::recover(Arc::clone(&backend), cfg.lease.min_ttl_secs)?;
        let store = Arc::new(KvStore::recover(Arc::clone(&backend), Arc::clone(&lessor))?);
        let auth = AuthStore::recover(Arc::clone(&backend))?;
        let initial_members: Vec<Member> = cfg
            .initial_cluster
            .iter()
            .map(|p| Member {
                id: p.id,
                peer_addr: p.addr.clone(),
            })
            .collect();
        let members = MemberStore::recover(Arc::clone(&backend), &initial_members)?;
        let hub = WatcherHub::new(
            Arc::clone(&store),
            cfg.watch.channel_capacity,
            cfg.watch.stall_budget,
        );

        let mut log = RaftLog::recover(snap_index, snap_term, entries);
        if let Some(hs) = &hard_state {
            log.commit_to(hs.commit.min(log.last_index()));
            log.applied_to(consistent_index.min(log.committed));
        }
        let voters: Vec<NodeId> = snapshot
            .as_ref()
            .map(|s| s.meta.conf_state.voters.clone())
            .unwrap_or_else(|| cfg.initial_member_ids());
        let raft_core = Raft::new(
            cfg.node_id,
            voters,
            RaftOptions {
                election_ticks: cfg.raft.election_ticks,
                heartbeat_ticks: cfg.raft.heartbeat_ticks,
                pre_vote: cfg.raft.pre_vote,
                check_quorum: cfg.raft.check_quorum,
            },
            log,
            hard_state,
        );
        let initial_term = hard_state.map(|h| h.term).unwrap_or(snap_term);
        let (raft, ready_rx) = node::spawn(raft_core);
        if let Some(snap) = snapshot.clone() {
            raft.store_snapshot(snap, cfg.raft.snapshot_catchup_entries)
                .await?;
        }

        let (applied_tx, applied_rx) = watch::channel(consistent_index);
        let (compaction_tx, compaction_rx) = mpsc::channel(8);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let applier = Applier::new(
            Arc::clone(&backend),
            Arc::clone(&store),
            Arc::clone(&lessor),
            Arc::clone(&auth),
            Arc::clone(&hub),
            compaction_tx,
        );

        let node = Arc::new(Node {
            cfg: cfg.clone(),
            backend,
            store,
            lessor,
            hub,
            auth,
            members,
            raft,
            wait: Arc::new(Wait::new(cfg.raft.max_inflight_proposals)),
            read_wait: Arc::new(ReadWait::default()),
            view: Arc::new(RwLock::new(View {
                leader: 0,
                term: initial_term,
                role: Role::Follower,
            })),
            applied_rx,
            alarm: Arc::new(RwLock::new(None)),
            shutdown,
            next_id: AtomicU64::new(1),
            _dir_lock: dir_lock,
        });

        Node::spawn_ready_loop(
            &node,
            ready_rx,
            wal,
            snapshotter,
            applier,
            Arc::clone(&transport),
            applied_tx,
            consistent_index,
            snap_index,
        );
        Node::spawn_tick_task(&node, shutdown_rx.clone());
        Node::spawn_transport_intake(&node, incoming, shutdown_rx.clone());
        Node::spawn_lease_tick(&node, shutdown_rx.clone());
        Node::spawn_watch_catchup(&node, shutdown_rx.clone());
        Node::spawn_compaction_worker(&node, compaction_rx, shutdown_rx);

        Ok(node)
    }

    /// Configured member id.
    pub fn id(&self) -> NodeId {
        self.cfg.node_id
    }

    /// Cluster id shared by all members.
    pub fn cluster_id(&self) -> u64 {
        self.members.cluster_id()
    }

    /// Current leader as last observed, or 0.
    pub fn leader(&self) -> NodeId {
        self.view.read().leader
    }

    /// Whether this member currently leads.
    pub fn is_leader(&self) -> bool {
        self.view.read().role == Role::Leader
    }

    /// Force an election on this member (tests, admin tooling).
    pub async fn campaign(&self) -> Result<()> {
        self.raft.campaign().await
    }

    /// Hand leadership to `to`.
    pub async fn transfer_leadership(&self, to: NodeId) -> Result<()> {
        self.raft.transfer_leader(to).await
    }

    /// Diagnostic snapshot of this member.
    pub async fn status(&self) -> Result<ServerStatus> {
        Ok(ServerStatus {
            node: self.raft.status().await?,
            revision: self.store.current_revision(),
            compact_revision: self.store.compact_revision(),
            alarm: *self.alarm.read(),
        })
    }

    /// Consistency fingerprint at `rev` (0 = current).
    pub fn hash_kv(&self, rev: i64) -> Result<u32> {
        self.store.hash_kv(rev)
    }

    /// Compare the local fingerprint at `rev` against one reported by a
    /// peer. A mismatch means the replicated state diverged: the CORRUPT
    /// alarm goes up and the member keeps serving reads while refusing
    /// writes until an operator clears it.
    pub fn verify_hash(&self, rev: i64, peer_hash: u32) -> Result<()> {
        let local = self.store.hash_kv(rev)?;
        if local != peer_hash {
            tracing::error!(rev, local, peer_hash, "state hash mismatch; raising CORRUPT alarm");
            *self.alarm.write() = Some(Alarm::Corrupt);
            return Err(Error::Corrupt {
                detail: format!(
                    "hash mismatch at revision {rev}: local {local:08x}, peer {peer_hash:08x}"
                ),
            });
        }
        Ok(())
    }

    /// Operational surface: activate an alarm. The member degrades to
    /// reads only.
    pub fn raise_alarm(&self, alarm: Alarm) {
        tracing::warn!(%alarm, "alarm raised");
        *self.alarm.write() = Some(alarm);
    }

    /// Operational surface: deactivate the active alarm, resuming
    /// writes.
    pub fn clear_alarm(&self) {
        if let Some(alarm) = self.alarm.write().take() {
            tracing::warn!(%alarm, "alarm cleared");
        }
    }

    /// The active alarm, if any.
    pub fn active_alarm(&self) -> Option<Alarm> {
        *self.alarm.read()
    }

    /// Range read. Serializable requests read local applied state;
    /// linearizable ones wait on a read fence first.
    pub async fn range(&self, req: RangeRequest) -> Result<RangeResponse> {
        validate_key(&self.cfg, &req.key)?;
        if !req.serializable {
            self.linearizable_fence().await?;
        }
        let range = KeyRange::canonicalize(req.key.clone(), req.range_end.clone());
        let read = self.store.read_tx()?;
        let result = read.range(&range, &req.options())?;
        drop(read);
        Ok(RangeResponse {
            header: self.header(result.rev),
            kvs: result.kvs,
            count: result.count as i64,
            more: result.more,
        })
    }

    /// Put one key.
    pub async fn put(&self, req: crate::server::command::PutRequest) -> Result<CommandResponse> {
        validate_key(&self.cfg, &req.key)?;
        self.propose(CommandOp::Put(req)).await
    }

    /// Delete a range of keys.
    pub async fn delete_range(
        &self,
        req: crate::server::command::DeleteRangeRequest,
    ) -> Result<CommandResponse> {
        validate_key(&self.cfg, &req.key)?;
        self.propose(CommandOp::DeleteRange(req)).await
    }

    /// Compare-and-branch transaction.
    pub async fn txn(&self, req: crate::server::command::TxnRequest) -> Result<CommandResponse> {
        for op in req.success.iter().chain(req.failure.iter()) {
            let key = match op {
                crate::server::command::RequestOp::Range(r) => &r.key,
                crate::server::command::RequestOp::Put(r) => &r.key,
                crate::server::command::RequestOp::DeleteRange(r) => &r.key,
            };
            validate_key(&self.cfg, key)?;
        }
        self.propose(CommandOp::Txn(req)).await
    }

    /// Compact history up to `revision`.
    pub async fn compact(&self, revision: i64, physical: bool) -> Result<CommandResponse> {
        self.propose(CommandOp::Compaction(
            crate::server::command::CompactionRequest { revision, physical },
        ))
        .await
    }

    /// Grant a lease; id 0 lets the server allocate one.
    pub async fn lease_grant(&self, mut id: i64, ttl: i64) -> Result<CommandResponse> {
        if id == 0 {
            id = self.allocate_lease_id();
        }
        self.propose(CommandOp::LeaseGrant(
            crate::server::command::LeaseGrantRequest { id, ttl },
        ))
        .await
    }

    /// Revoke a lease, deleting its attached keys.
    pub async fn lease_revoke(&self, id: i64) -> Result<CommandResponse> {
        self.propose(CommandOp::LeaseRevoke(
            crate::server::command::LeaseRevokeRequest { id },
        ))
        .await
    }

    /// Renew a lease. Leader only: followers answer `NotLeader` with a
    /// hint and the client (or gateway) retries there. Returns the
    /// remaining TTL, or 0 when the lease is gone.
    pub fn lease_keep_alive(&self, id: i64) -> Result<i64> {
        if !self.is_leader() {
            let hint = self.leader();
            return Err(if hint == 0 {
                Error::NoLeader
            } else {
                Error::NotLeader { hint }
            });
        }
        match self.lessor.renew(id) {
            Ok(ttl) => Ok(ttl),
            Err(Error::LeaseNotFound { .. }) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Remaining TTL and attached keys of a lease.
    pub fn lease_time_to_live(&self, id: i64) -> Result<(i64, Vec<Vec<u8>>)> {
        let lease = self
            .lessor
            .get(id)
            .ok_or(Error::LeaseNotFound { lease_id: id })?;
        Ok((lease.remaining_secs(), lease.keys()))
    }

    /// Register a watcher over `(key, range_end)` with the wire
    /// conventions of [`RangeRequest`].
    pub fn watch(
        &self,
        key: Vec<u8>,
        range_end: Vec<u8>,
        start_revision: i64,
        filters: WatchFilters,
        progress_notify: bool,
    ) -> Result<(i64, mpsc::Receiver<WatchResponse>)> {
        self.hub.watch(WatchCreateRequest {
            range: KeyRange::canonicalize(key, range_end),
            start_revision,
            filters,
            progress_notify,
        })
    }

    /// Cancel a watcher.
    pub fn cancel_watch(&self, watch_id: i64) -> bool {
        self.hub.cancel(watch_id)
    }

    /// Client-requested progress: emit a revision heartbeat to every
    /// watcher that opted into progress notification.
    pub fn watch_progress(&self) {
        self.hub.progress()
    }

    /// Add a member.
    pub async fn member_add(&self, id: NodeId, peer_addr: &str) -> Result<MemberListResponse> {
        self.member_change(ConfChange {
            kind: ConfChangeKind::AddNode,
            node_id: id,
            context: peer_addr.as_bytes().to_vec(),
        })
        .await
    }

    /// Remove a member.
    pub async fn member_remove(&self, id: NodeId) -> Result<MemberListResponse> {
        self.member_change(ConfChange {
            kind: ConfChangeKind::RemoveNode,
            node_id: id,
            context: Vec::new(),
        })
        .await
    }

    /// Update a member's peer address.
    pub async fn member_update(&self, id: NodeId, peer_addr: &str) -> Result<MemberListResponse> {
        self.member_change(ConfChange {
            kind: ConfChangeKind::UpdateNode,
            node_id: id,
            context: peer_addr.as_bytes().to_vec(),
        })
        .await
    }

    /// Current member roster.
    pub fn member_list(&self) -> MemberListResponse {
        MemberListResponse {
            header: self.header(self.store.current_revision()),
            members: self.members.list(),
        }
    }

    /// Enable authentication (requires a root user).
    pub async fn auth_enable(&self) -> Result<CommandResponse> {
        self.propose(CommandOp::AuthEnable).await
    }

    /// Disable authentication.
    pub async fn auth_disable(&self) -> Result<CommandResponse> {
        self.propose(CommandOp::AuthDisable).await
    }

    /// Authenticate and mint a token.
    pub async fn authenticate(&self, name: &str, password: &str) -> Result<CommandResponse> {
        self.propose(CommandOp::Authenticate(
            crate::server::command::AuthenticateRequest {
                name: name.to_string(),
                password: password.to_string(),
            },
        ))
        .await
    }

    /// Propose a user or role bookkeeping command.
    pub async fn auth_admin(&self, op: CommandOp) -> Result<CommandResponse> {
        debug_assert!(matches!(
            op,
            CommandOp::UserAdd(_)
                | CommandOp::UserDelete(_)
                | CommandOp::UserChangePassword(_)
                | CommandOp::UserGrantRole(_)
                | CommandOp::UserRevokeRole(_)
                | CommandOp::RoleAdd(_)
                | CommandOp::RoleDelete(_)
                | CommandOp::RoleGrantPermission(_)
                | CommandOp::RoleRevokePermission(_)
        ));
        self.propose(op).await
    }

    /// The auth store, for permission checks at the request edge.
    pub fn auth_store(&self) -> &Arc<AuthStore> {
        &self.auth
    }

    /// Stop every task and flush storage.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.raft.stop().await;
        if let Err(e) = self.backend.close() {
            tracing::warn!(error = %e, "backend close failed");
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn header(&self, revision: i64) -> ResponseHeader {
        let view = self.view.read();
        ResponseHeader {
            cluster_id: self.members.cluster_id(),
            member_id: self.cfg.node_id,
            revision,
            raft_term: view.term,
        }
    }

    fn next_request_id(&self) -> u64 {
        let counter = self.next_id.fetch_add(1, Ordering::Relaxed);
        (self.cfg.node_id << 48) | (counter & 0xffff_ffff_ffff)
    }

    fn allocate_lease_id(&self) -> i64 {
        loop {
            let id = (rand::thread_rng().gen::<i64>() & i64::MAX).max(1);
            if self.lessor.get(id).is_none() {
                return id;
            }
        }
    }

    fn check_alarm(&self) -> Result<()> {
        match *self.alarm.read() {
            None => Ok(()),
            Some(Alarm::NoSpace) => Err(Error::unavailable("alarm NOSPACE active")),
            Some(Alarm::Corrupt) => Err(Error::Corrupt {
                detail: "alarm CORRUPT active".to_string(),
            }),
        }
    }

    async fn propose(&self, op: CommandOp) -> Result<CommandResponse> {
        self.check_alarm()?;
        let id = self.next_request_id();
        let cmd = RaftCommand { id, op };
        let data = cmd.encode()?;
        if data.len() > self.cfg.raft.max_request_bytes {
            return Err(Error::RequestTooLarge {
                size: data.len(),
                limit: self.cfg.raft.max_request_bytes,
            });
        }
        let rx = self.wait.register(id)?;
        if let Err(e) = self.raft.propose(data).await {
            self.wait.cancel(id);
            return Err(e);
        }
        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                // The entry may still commit later; the effect stands
                // but this caller stops waiting.
                self.wait.cancel(id);
                Err(Error::NoLeader)
            }
        }
    }

    async fn member_change(&self, cc: ConfChange) -> Result<MemberListResponse> {
        self.check_alarm()?;
        self.members.validate(&cc)?;
        let id = self.next_request_id();
        let data = bincode::serialize(&ConfChangeCommand { id, cc })
            .map_err(|e| Error::internal(format!("conf change encode: {e}")))?;
        let rx = self.wait.register(id)?;
        if let Err(e) = self.raft.propose_conf_change(data).await {
            self.wait.cancel(id);
            return Err(e);
        }
        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(Ok(CommandResponse::Membership(resp)))) => Ok(resp),
            Ok(Ok(Ok(_))) => Err(Error::internal("unexpected conf change response")),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                self.wait.cancel(id);
                Err(Error::NoLeader)
            }
        }
    }

    /// Obtain a read fence from the leader and wait until this member
    /// has applied up to it.
    async fn linearizable_fence(&self) -> Result<()> {
        let id = self.next_request_id();
        let rx = self.read_wait.register(id);
        if let Err(e) = self.raft.read_index(id.to_be_bytes().to_vec()).await {
            self.read_wait.cancel(id);
            return Err(e);
        }
        let index = match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(index)) => index,
            Ok(Err(_)) => return Err(Error::Cancelled),
            Err(_) => {
                self.read_wait.cancel(id);
                return Err(Error::NoLeader);
            }
        };
        let mut applied = self.applied_rx.clone();
        while *applied.borrow() < index {
            applied
                .changed()
                .await
                .map_err(|_| Error::unavailable("node stopping"))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Task loops
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn spawn_ready_loop(
        node: &Arc<Node>,
        mut ready_rx: mpsc::Receiver<Ready>,
        mut wal: Wal,
        snapshotter: Snapshotter,
        applier: Applier,
        transport: Arc<dyn Transport>,
        applied_tx: watch::Sender<u64>,
        mut consistent_index: u64,
        mut last_snap_index: u64,
    ) {
        let node = Arc::clone(node);
        tokio::spawn(async move {
            while let Some(ready) = ready_rx.recv().await {
                if node
                    .process_ready(
                        ready,
                        &mut wal,
                        &snapshotter,
                        &applier,
                        &transport,
                        &applied_tx,
                        &mut consistent_index,
                        &mut last_snap_index,
                    )
                    .await
                    .is_err()
                {
                    // Alarm raised; stop acknowledging writes.
                    break;
                }
            }
            if let Err(e) = wal.sync() {
                tracing::warn!(error = %e, "final wal sync failed");
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_ready(
        &self,
        ready: Ready,
        wal: &mut Wal,
        snapshotter: &Snapshotter,
        applier: &Applier,
        transport: &Arc<dyn Transport>,
        applied_tx: &watch::Sender<u64>,
        consistent_index: &mut u64,
        last_snap_index: &mut u64,
    ) -> Result<()> {
        if let Some(ss) = ready.soft_state {
            let was_leader = {
                let mut view = self.view.write();
                let was = view.role == Role::Leader;
                view.leader = ss.leader;
                view.role = ss.role;
                was
            };
            if ss.role == Role::Leader && !was_leader {
                tracing::info!(id = self.cfg.node_id, "leadership acquired");
                self.lessor.promote();
            } else if ss.role != Role::Leader && was_leader {
                tracing::info!(id = self.cfg.node_id, "leadership lost");
                self.lessor.demote();
            }
        }
        if let Some(hs) = ready.hard_state {
            self.view.write().term = hs.term;
        }

        // 1. Durability first: nothing leaves this node before the WAL
        //    holds it.
        if ready.hard_state.is_some() || !ready.entries.is_empty() {
            let persisted = wal
                .append(ready.hard_state.as_ref(), &ready.entries)
                .and_then(|()| wal.sync());
            if let Err(e) = persisted {
                tracing::error!(error = %e, "wal write failed; raising NOSPACE alarm");
                *self.alarm.write() = Some(Alarm::NoSpace);
                return Err(Error::unavailable("wal write failed"));
            }
        }

        // 2. Install a received snapshot.
        if let Some(snapshot) = &ready.snapshot {
            if let Err(e) = self
                .install_snapshot(snapshot, wal, snapshotter, applier, applied_tx)
                .await
            {
                tracing::error!(error = %e, "snapshot install failed; raising alarm");
                *self.alarm.write() = Some(alarm_of(&e));
                return Err(e);
            }
            *consistent_index = snapshot.meta.index;
            *last_snap_index = snapshot.meta.index;
        }

        // 3. Messages go out only after local durability.
        for msg in ready.messages {
            transport.send(msg.to, msg);
        }

        // 4. Apply committed entries in order.
        let mut progress: Option<(u64, u64)> = None;
        for entry in &ready.committed_entries {
            self.apply_entry(entry, applier, *consistent_index).await?;
            *consistent_index = (*consistent_index).max(entry.index);
            progress = Some((entry.index, entry.term));
        }

        if let Some((index, term)) = progress {
            applied_tx.send_replace(index);
            self.raft.advance(index).await?;
            if index - *last_snap_index >= self.cfg.raft.snapshot_count {
                if let Err(e) = self
                    .take_snapshot(index, term, wal, snapshotter)
                    .await
                {
                    tracing::warn!(error = %e, "snapshot failed");
                } else {
                    *last_snap_index = index;
                }
            }
        }

        // 5. Release the next Ready.
        self.raft.ready_consumed().await?;

        for rs in ready.read_states {
            if let Ok(bytes) = <[u8; 8]>::try_from(rs.request_ctx.as_slice()) {
                self.read_wait.trigger(u64::from_be_bytes(bytes), rs.index);
            }
        }
        Ok(())
    }

    async fn install_snapshot(
        &self,
        snapshot: &Snapshot,
        wal: &mut Wal,
        snapshotter: &Snapshotter,
        applier: &Applier,
        applied_tx: &watch::Sender<u64>,
    ) -> Result<()> {
        tracing::info!(
            index = snapshot.meta.index,
            term = snapshot.meta.term,
            "installing snapshot"
        );
        self.backend.restore_image(&snapshot.data)?;
        self.store.reload()?;
        self.lessor.reload()?;
        self.auth.reload()?;
        self.members.reload()?;
        applier.record_applied(snapshot.meta.index)?;
        self.backend.force_commit()?;

        snapshotter
            .save(snapshot)
            .map_err(|e| Error::internal(format!("snapshot save: {e}")))?;
        wal.save_snapshot_pointer(SnapshotPointer {
            index: snapshot.meta.index,
            term: snapshot.meta.term,
        })
        .map_err(|e| {
            *self.alarm.write() = Some(Alarm::NoSpace);
            Error::internal(format!("snapshot pointer: {e}"))
        })?;
        let _ = wal.release_lock_to(snapshot.meta.index);
        applied_tx.send_replace(snapshot.meta.index);
        self.raft
            .store_snapshot(snapshot.clone(), self.cfg.raft.snapshot_catchup_entries)
            .await?;
        Ok(())
    }

    async fn apply_entry(
        &self,
        entry: &Entry,
        applier: &Applier,
        consistent_index: u64,
    ) -> Result<()> {
        let replayed = entry.index <= consistent_index;
        match entry.kind {
            EntryKind::Normal => {
                if entry.data.is_empty() || replayed {
                    return Ok(());
                }
                let cmd = match RaftCommand::decode(&entry.data) {
                    Ok(cmd) => cmd,
                    Err(e) => {
                        tracing::error!(index = entry.index, error = %e, "undecodable command");
                        return Ok(());
                    }
                };
                let mut result = applier.apply(entry.index, &cmd);
                if let Err(Error::Corrupt { detail }) = &result {
                    tracing::error!(index = entry.index, %detail, "corruption during apply");
                    *self.alarm.write() = Some(Alarm::Corrupt);
                }
                if let Ok(resp) = &mut result {
                    let view = *self.view.read();
                    resp.fill_header(self.members.cluster_id(), self.cfg.node_id, view.term);
                }
                // Durability precedes the externally observable
                // acknowledgment; only the originating member pays the
                // flush.
                if self.wait.contains(cmd.id) {
                    if let Err(e) = self.backend.force_commit() {
                        tracing::error!(error = %e, "pre-ack flush failed; raising alarm");
                        *self.alarm.write() = Some(alarm_of(&e));
                        result = Err(e);
                    }
                    self.wait.trigger(cmd.id, result);
                }
            }
            EntryKind::ConfChange => {
                let ccc: ConfChangeCommand = match bincode::deserialize(&entry.data) {
                    Ok(ccc) => ccc,
                    Err(e) => {
                        tracing::error!(index = entry.index, error = %e, "undecodable conf change");
                        return Ok(());
                    }
                };
                if !replayed {
                    // Roster change and applied cursor in one section,
                    // like any other command.
                    let tx = self.backend.batch_tx();
                    let mut batch = tx.lock()?;
                    if let Err(e) = self.members.apply(&ccc.cc, &mut batch) {
                        batch.unlock()?;
                        self.wait.trigger(ccc.id, Err(e));
                        return Ok(());
                    }
                    batch.put(
                        bucket::META,
                        META_CONSISTENT_INDEX,
                        &entry.index.to_be_bytes(),
                    );
                    batch.unlock()?;
                }
                // The voter set must be rebuilt even when the backend
                // already holds the roster.
                self.raft.apply_conf_change(ccc.cc.clone()).await?;
                if self.wait.contains(ccc.id) {
                    if let Err(e) = self.backend.force_commit() {
                        tracing::error!(error = %e, "pre-ack flush failed; raising alarm");
                        *self.alarm.write() = Some(alarm_of(&e));
                        self.wait.trigger(ccc.id, Err(e));
                        return Ok(());
                    }
                    let resp = MemberListResponse {
                        header: self.header(self.store.current_revision()),
                        members: self.members.list(),
                    };
                    self.wait.trigger(ccc.id, Ok(CommandResponse::Membership(resp)));
                }
            }
        }
        Ok(())
    }

    async fn take_snapshot(
        &self,
        index: u64,
        term: u64,
        wal: &mut Wal,
        snapshotter: &Snapshotter,
    ) -> Result<()> {
        let data = self.backend.snapshot_image()?;
        let snapshot = Snapshot {
            meta: SnapshotMeta {
                index,
                term,
                conf_state: ConfState::new(self.members.list().iter().map(|m| m.id)),
            },
            data,
        };
        snapshotter
            .save(&snapshot)
            .map_err(|e| Error::internal(format!("snapshot save: {e}")))?;
        wal.save_snapshot_pointer(SnapshotPointer { index, term })
            .map_err(|e| Error::internal(format!("snapshot pointer: {e}")))?;
        let keep = self.cfg.raft.snapshot_catchup_entries;
        let _ = wal.release_lock_to(index.saturating_sub(keep));
        self.raft.store_snapshot(snapshot, keep).await?;
        if let Err(e) = snapshotter.cleanup(index) {
            tracing::debug!(error = %e, "snapshot cleanup failed");
        }
        tracing::info!(index, term, "state snapshot taken");
        Ok(())
    }

    fn spawn_tick_task(node: &Arc<Node>, mut shutdown: watch::Receiver<bool>) {
        let raft = node.raft.clone();
        let interval = node.cfg.tick_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if raft.tick().await.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    fn spawn_transport_intake(
        node: &Arc<Node>,
        mut incoming: mpsc::UnboundedReceiver<Message>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let raft = node.raft.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = incoming.recv() => match msg {
                        Some(msg) => {
                            if raft.step(msg).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    fn spawn_lease_tick(node: &Arc<Node>, mut shutdown: watch::Receiver<bool>) {
        let node = Arc::clone(node);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(node.cfg.lease_tick_interval());
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !node.is_leader() {
                            continue;
                        }
                        for id in node.lessor.tick() {
                            tracing::info!(lease_id = id, "lease expired; proposing revoke");
                            // Fire-and-forget: the revoke applies on every
                            // member through the log.
                            let cmd = RaftCommand {
                                id: node.next_request_id(),
                                op: CommandOp::LeaseRevoke(
                                    crate::server::command::LeaseRevokeRequest { id },
                                ),
                            };
                            match cmd.encode() {
                                Ok(data) => {
                                    if let Err(e) = node.raft.propose(data).await {
                                        tracing::warn!(lease_id = id, error = %e, "lease revoke proposal failed");
                                    }
                                }
                                Err(e) => tracing::error!(error = %e, "lease revoke encode failed"),
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    fn spawn_watch_catchup(node: &Arc<Node>, mut shutdown: watch::Receiver<bool>) {
        let node = Arc::clone(node);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(node.cfg.watch_catchup_interval());
            let mut iterations = 0u32;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        node.hub.catchup(node.cfg.watch.batch_limit);
                        iterations = iterations.wrapping_add(1);
                        if iterations % PROGRESS_EVERY == 0 {
                            node.hub.progress();
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    fn spawn_compaction_worker(
        node: &Arc<Node>,
        mut jobs: mpsc::Receiver<CompactionJob>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let node = Arc::clone(node);
        let batch = node.cfg.storage.compaction_batch_limit.max(1);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    job = jobs.recv() => match job {
                        Some(job) => {
                            for chunk in job.removals.chunks(batch) {
                                if let Err(e) = node.store.purge_compacted(chunk) {
                                    tracing::warn!(error = %e, "compaction purge failed");
                                    break;
                                }
                                // Short transactions; let other work in.
                                tokio::task::yield_now().await;
                            }
                            tracing::debug!(removed = job.removals.len(), "compaction purge done");
                        }
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });
    }
}

fn validate_key(cfg: &Config, key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidRequest {
            message: "key is empty".to_string(),
        });
    }
    if key.len() > cfg.storage.max_key_bytes {
        return Err(Error::InvalidRequest {
            message: format!(
                "key of {} bytes exceeds the {} byte limit",
                key.len(),
                cfg.storage.max_key_bytes
            ),
        });
    }
    Ok(())
}

fn lock_data_dir(cfg: &Config) -> Result<std::fs::File> {
    let path = cfg.data_dir.join("lock");
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .map_err(io_internal)?;
    file.try_lock().map_err(|_| Error::unavailable("data directory is locked by another process"))?;
    Ok(file)
}

fn read_consistent_index(backend: &Backend) -> Result<u64> {
    Ok(backend
        .read_tx()?
        .get(bucket::META, META_CONSISTENT_INDEX)
        .and_then(|v| v.try_into().ok().map(u64::from_be_bytes))
        .unwrap_or(0))
}

fn open_wal(
    cfg: &Config,
    metadata: WalMetadata,
    snap: SnapshotPointer,
) -> Result<(Wal, Option<crate::raft::types::HardState>, Vec<Entry>)> {
    let wal_dir = cfg.wal_dir();
    std::fs::create_dir_all(&wal_dir).map_err(io_internal)?;
    let empty = std::fs::read_dir(&wal_dir)
        .map_err(io_internal)?
        .next()
        .is_none();
    let segment_bytes = cfg.storage.wal_segment_bytes;
    if empty {
        let wal = Wal::create(&wal_dir, metadata, segment_bytes).map_err(wal_fatal)?;
        return Ok((wal, None, Vec::new()));
    }
    match Wal::open(&wal_dir, snap, segment_bytes) {
        Ok(opened) => Ok(opened),
        Err(WalError::TornTail { .. }) => {
            tracing::warn!("torn wal tail detected; repairing");
            Wal::repair(&wal_dir).map_err(wal_fatal)?;
            Wal::open(&wal_dir, snap, segment_bytes).map_err(wal_fatal)
        }
        Err(e) => Err(wal_fatal(e)),
    }
}

fn wal_fatal(e: WalError) -> Error {
    Error::internal(format!("wal: {e}"))
}

/// Which alarm a fatal storage error maps to.
fn alarm_of(error: &Error) -> Alarm {
    match error {
        Error::Corrupt { .. } => Alarm::Corrupt,
        _ => Alarm::NoSpace,
    }
}

fn io_internal(e: std::io::Error) -> Error {
    Error::internal(format!("io: {e}"))
}
