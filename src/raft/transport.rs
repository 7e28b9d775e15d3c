//! Peer transport seam.
//!
//! The consensus layer only needs "deliver this message to that member,
//! best effort, in per-peer order". Real deployments put an RPC stack
//! behind this trait; tests use the in-memory mesh below. Delivery
//! failures are silent: the protocol retries through its own timers.

use crate::raft::types::{Message, NodeId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Message delivery to peers.
pub trait Transport: Send + Sync + 'static {
    /// Queue `msg` for delivery to `to`. Must not block.
    fn send(&self, to: NodeId, msg: Message);
}

/// In-memory mesh connecting members of one process, used by tests and
/// single-binary clusters.
#[derive(Default)]
pub struct LocalMesh {
    routes: Mutex<HashMap<NodeId, mpsc::UnboundedSender<Message>>>,
    /// Pairs `(from, to)` currently dropped, for partition tests.
    blocked: Mutex<Vec<(NodeId, NodeId)>>,
}

impl LocalMesh {
    /// Create an empty mesh.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a member and get its inbound message stream.
    pub fn register(&self, id: NodeId) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().insert(id, tx);
        rx
    }

    /// Drop a member; subsequent sends to it vanish.
    pub fn deregister(&self, id: NodeId) {
        self.routes.lock().remove(&id);
    }

    /// Sever delivery in both directions between two members.
    pub fn partition(&self, a: NodeId, b: NodeId) {
        let mut blocked = self.blocked.lock();
        blocked.push((a, b));
        blocked.push((b, a));
    }

    /// Restore all severed links.
    pub fn heal(&self) {
        self.blocked.lock().clear();
    }
}

impl Transport for LocalMesh {
    fn send(&self, to: NodeId, msg: Message) {
        if self.blocked.lock().contains(&(msg.from, to)) {
            return;
        }
        if let Some(route) = self.routes.lock().get(&to) {
            // A closed route means the member is gone; the sender's
            // timers handle it.
            let _ = route.send(msg);
        }
    }
}
