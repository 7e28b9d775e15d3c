//! The consensus driver.
//!
//! A single cooperative task owns the [`Raft`] core and is its only
//! mutator. Inputs (proposals, transport messages, ticks, consumption
//! signals) arrive serialized over one channel; output leaves as a
//! stream of [`Ready`] bundles, at most one in flight.
//!
//! The host contract, per `Ready`:
//!
//! 1. persist `hard_state` and `entries` to the WAL and sync,
//! 2. persist and install `snapshot` if present,
//! 3. send `messages` to peers,
//! 4. apply `committed_entries` in order and call [`NodeHandle::advance`],
//! 5. call [`NodeHandle::ready_consumed`] to release the next `Ready`.

use crate::core::error::{Error, Result};
use crate::raft::core::Raft;
use crate::raft::types::{
    ConfChange, ConfState, HardState, NodeId, Ready, Role, Snapshot, SoftState,
};
use tokio::sync::{mpsc, oneshot};

/// Inputs multiplexed into the driver, one at a time.
enum Input {
    Propose {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<u64>>,
    },
    ProposeConfChange {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<u64>>,
    },
    Step(crate::raft::types::Message),
    Tick,
    ReadIndex {
        ctx: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    Advance {
        applied: u64,
    },
    ReadyConsumed,
    ApplyConfChange {
        cc: ConfChange,
        reply: oneshot::Sender<ConfState>,
    },
    StoreSnapshot {
        snapshot: Snapshot,
        keep_entries: u64,
    },
    Campaign,
    TransferLeader {
        to: NodeId,
    },
    Status {
        reply: oneshot::Sender<NodeStatus>,
    },
    Stop,
}

/// A point-in-time view of the driver's core, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub id: NodeId,
    pub term: u64,
    pub role: Role,
    pub leader_id: NodeId,
    pub committed: u64,
    pub applied: u64,
    pub last_index: u64,
}

/// Handle for talking to the driver task.
#[derive(Clone)]
pub struct NodeHandle {
    tx: mpsc::Sender<Input>,
}

impl NodeHandle {
    /// Propose a command; resolves to the entry's log index.
    pub async fn propose(&self, data: Vec<u8>) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.send(Input::Propose { data, reply }).await?;
        rx.await.map_err(|_| stopped())?
    }

    /// Propose a membership change; `data` is the encoded change
    /// envelope. Resolves to the entry's log index.
    pub async fn propose_conf_change(&self, data: Vec<u8>) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.send(Input::ProposeConfChange { data, reply }).await?;
        rx.await.map_err(|_| stopped())?
    }

    /// Feed a message from the transport.
    pub async fn step(&self, msg: crate::raft::types::Message) -> Result<()> {
        self.send(Input::Step(msg)).await
    }

    /// One logical clock step.
    pub async fn tick(&self) -> Result<()> {
        self.send(Input::Tick).await
    }

    /// Request a linearizable-read fence.
    pub async fn read_index(&self, ctx: Vec<u8>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Input::ReadIndex { ctx, reply }).await?;
        rx.await.map_err(|_| stopped())?
    }

    /// Move the applied cursor after executing committed entries.
    pub async fn advance(&self, applied: u64) -> Result<()> {
        self.send(Input::Advance { applied }).await
    }

    /// Signal that the previous `Ready` has been fully processed.
    pub async fn ready_consumed(&self) -> Result<()> {
        self.send(Input::ReadyConsumed).await
    }

    /// Fold a committed membership change into the voter set.
    pub async fn apply_conf_change(&self, cc: ConfChange) -> Result<ConfState> {
        let (reply, rx) = oneshot::channel();
        self.send(Input::ApplyConfChange { cc, reply }).await?;
        rx.await.map_err(|_| stopped())
    }

    /// Hand the core the newest local snapshot for follower catch-up,
    /// keeping `keep_entries` log entries below it.
    pub async fn store_snapshot(&self, snapshot: Snapshot, keep_entries: u64) -> Result<()> {
        self.send(Input::StoreSnapshot {
            snapshot,
            keep_entries,
        })
        .await
    }

    /// Force an election (tests and admin tooling).
    pub async fn campaign(&self) -> Result<()> {
        self.send(Input::Campaign).await
    }

    /// Ask `to` to campaign immediately.
    pub async fn transfer_leader(&self, to: NodeId) -> Result<()> {
        self.send(Input::TransferLeader { to }).await
    }

    /// Snapshot of the driver's state.
    pub async fn status(&self) -> Result<NodeStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Input::Status { reply }).await?;
        rx.await.map_err(|_| stopped())
    }

    /// Terminal: stop the driver task.
    pub async fn stop(&self) {
        let _ = self.tx.send(Input::Stop).await;
    }

    async fn send(&self, input: Input) -> Result<()> {
        self.tx.send(input).await.map_err(|_| stopped())
    }
}

fn stopped() -> Error {
    Error::unavailable("consensus driver stopped")
}

/// Spawn the driver task around `raft`. Returns the handle and the
/// `Ready` stream.
pub fn spawn(raft: Raft) -> (NodeHandle, mpsc::Receiver<Ready>) {
    let (tx, rx) = mpsc::channel(4096);
    let (ready_tx, ready_rx) = mpsc::channel(1);
    tokio::spawn(run(raft, rx, ready_tx));
    (NodeHandle { tx }, ready_rx)
}

async fn run(mut raft: Raft, mut rx: mpsc::Receiver<Input>, ready_tx: mpsc::Sender<Ready>) {
    let mut prev_hs = raft.hard_state();
    let mut prev_ss = raft.soft_state();
    // Explicit ready/advance state machine: at most one Ready in flight,
    // identified by the last entry it asked the host to persist.
    let mut in_flight: Option<(u64, u64)> = None;

    while let Some(input) = rx.recv().await {
        match input {
            Input::Propose { data, reply } => {
                let _ = reply.send(raft.propose(data));
            }
            Input::ProposeConfChange { data, reply } => {
                let _ = reply.send(raft.propose_conf_change(data));
            }
            Input::Step(msg) => {
                if let Err(e) = raft.step(msg) {
                    tracing::debug!(error = %e, "step failed");
                }
            }
            Input::Tick => raft.tick(),
            Input::ReadIndex { ctx, reply } => {
                let _ = reply.send(raft.read_index(ctx));
            }
            Input::Advance { applied } => raft.log.applied_to(applied),
            Input::ReadyConsumed => {
                if let Some((index, term)) = in_flight.take() {
                    // Entries replaced by a conflicting append while the
                    // host was persisting are not durable as written;
                    // they will be re-emitted.
                    if index > 0 && raft.log.match_term(index, term) {
                        raft.log.persisted_to(index);
                    }
                }
            }
            Input::ApplyConfChange { cc, reply } => {
                let _ = reply.send(raft.apply_conf_change(&cc));
            }
            Input::StoreSnapshot {
                snapshot,
                keep_entries,
            } => raft.store_snapshot(snapshot, keep_entries),
            Input::Campaign => raft.campaign(false),
            Input::TransferLeader { to } => raft.send_timeout_now(to),
            Input::Status { reply } => {
                let _ = reply.send(NodeStatus {
                    id: raft.id,
                    term: raft.term,
                    role: raft.role,
                    leader_id: raft.leader_id,
                    committed: raft.log.committed,
                    applied: raft.log.applied,
                    last_index: raft.log.last_index(),
                });
            }
            Input::Stop => break,
        }

        if in_flight.is_none() {
            if let Some((ready, persist_mark)) = build_ready(&mut raft, &mut prev_hs, &mut prev_ss)
            {
                in_flight = Some(persist_mark);
                if ready_tx.send(ready).await.is_err() {
                    break;
                }
            }
        }
    }
    tracing::info!(id = raft.id, "consensus driver stopped");
}

fn build_ready(
    raft: &mut Raft,
    prev_hs: &mut HardState,
    prev_ss: &mut SoftState,
) -> Option<(Ready, (u64, u64))> {
    let hs = raft.hard_state();
    let ss = raft.soft_state();
    if !raft.has_output() && hs == *prev_hs && ss == *prev_ss {
        return None;
    }

    let entries = raft.log.unstable_entries().to_vec();
    let persist_mark = entries
        .last()
        .map(|e| (e.index, e.term))
        .unwrap_or((0, 0));
    let ready = Ready {
        soft_state: (ss != *prev_ss).then_some(ss),
        hard_state: (hs != *prev_hs).then_some(hs),
        entries,
        committed_entries: raft.log.next_committed_entries(),
        snapshot: raft.take_pending_snapshot(),
        messages: raft.take_msgs(),
        read_states: raft.take_read_states(),
    };
    if ready.is_empty() {
        return None;
    }
    *prev_hs = hs;
    *prev_ss = ss;
    Some((ready, persist_mark))
}
