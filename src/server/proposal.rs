//! Proposal waiters.
//!
//! Each proposal registers a completion slot under its request id before
//! entering consensus; the apply pipeline triggers the slot when the
//! command executes. Slots are capacity-bounded: a full table fails new
//! proposals fast instead of queueing unboundedly.

use crate::core::error::{Error, Result};
use crate::server::command::CommandResponse;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// The waiter table.
pub struct Wait {
    slots: Mutex<HashMap<u64, oneshot::Sender<Result<CommandResponse>>>>,
    capacity: usize,
}

impl Wait {
    /// A table admitting at most `capacity` in-flight proposals.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Register a slot for `id`. Fails with `Unavailable` at capacity.
    pub fn register(&self, id: u64) -> Result<oneshot::Receiver<Result<CommandResponse>>> {
        let mut slots = self.slots.lock();
        if slots.len() >= self.capacity {
            return Err(Error::unavailable("proposal table full"));
        }
        let (tx, rx) = oneshot::channel();
        slots.insert(id, tx);
        Ok(rx)
    }

    /// Deliver the result for `id`. Returns whether a waiter was present;
    /// a missing waiter means the proposal was cancelled or this member
    /// did not originate it.
    pub fn trigger(&self, id: u64, result: Result<CommandResponse>) -> bool {
        match self.slots.lock().remove(&id) {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Drop the slot for a cancelled proposal. A command already
    /// committed still applies; only the caller stops waiting.
    pub fn cancel(&self, id: u64) {
        self.slots.lock().remove(&id);
    }

    /// Whether a waiter is registered for `id`, i.e. this member
    /// originated the proposal and will acknowledge it.
    pub fn contains(&self, id: u64) -> bool {
        self.slots.lock().contains_key(&id)
    }

    /// In-flight proposal count.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether no proposals are waiting.
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}
