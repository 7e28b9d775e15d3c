//! Watch machinery.
//!
//! The hub keeps two watcher populations: **synced** watchers whose
//! cursor is at `current_revision + 1` and receive events on the direct
//! dispatch path at commit, and **unsynced** watchers that lag and catch
//! up from the value log on a fixed cadence, a bounded batch at a time.
//!
//! Slow consumers never block writers: each watcher's outbound channel is
//! bounded, dispatch uses non-blocking sends, and a watcher whose channel
//! overflows is demoted to unsynced. An unsynced watcher that cannot make
//! progress within the stall budget is cancelled.

use crate::core::error::Result;
use crate::mvcc::store::KvStore;
use crate::mvcc::{Event, EventKind, KeyRange};
use bitflags::bitflags;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

bitflags! {
    /// Event filters for a watcher.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct WatchFilters: u32 {
        /// Drop put events.
        const NOPUT = 0b01;
        /// Drop delete events.
        const NODELETE = 0b10;
    }
}

/// Inputs for creating a watcher.
#[derive(Debug, Clone)]
pub struct WatchCreateRequest {
    /// Range to watch, already canonicalized.
    pub range: KeyRange,
    /// First revision of interest; `0` means "from now on".
    pub start_revision: i64,
    /// Event filters.
    pub filters: WatchFilters,
    /// Emit periodic empty responses carrying the current revision.
    pub progress_notify: bool,
}

/// One batch of watch output.
#[derive(Debug, Clone, Default)]
pub struct WatchResponse {
    pub watch_id: i64,
    /// Set on the first response after creation.
    pub created: bool,
    /// Set on the final response; no more will follow.
    pub canceled: bool,
    /// When cancelled because the start revision was compacted: the
    /// compaction floor.
    pub compact_revision: i64,
    /// Store revision the response was generated at.
    pub header_revision: i64,
    pub events: Vec<Event>,
}

struct Watcher {
    id: i64,
    range: KeyRange,
    /// Next revision this watcher has not seen.
    cursor: i64,
    filters: WatchFilters,
    progress_notify: bool,
    tx: mpsc::Sender<WatchResponse>,
    /// Catch-up rounds without progress.
    stalled_rounds: u32,
}

impl Watcher {
    fn wants(&self, event: &Event) -> bool {
        let filtered = match event.kind {
            EventKind::Put => self.filters.contains(WatchFilters::NOPUT),
            EventKind::Delete => self.filters.contains(WatchFilters::NODELETE),
        };
        !filtered && self.range.contains(&event.kv.key)
    }
}

/// Watchers indexed for the dispatch path: single-key watchers by key,
/// range watchers scanned.
#[derive(Default)]
struct WatcherGroup {
    watchers: HashMap<i64, Watcher>,
    key_watchers: HashMap<Vec<u8>, HashSet<i64>>,
    range_watchers: HashSet<i64>,
}

impl WatcherGroup {
    fn add(&mut self, watcher: Watcher) {
        match &watcher.range {
            KeyRange::Single(key) => {
                self.key_watchers
                    .entry(key.clone())
                    .or_default()
                    .insert(watcher.id);
            }
            _ => {
                self.range_watchers.insert(watcher.id);
            }
        }
        self.watchers.insert(watcher.id, watcher);
    }

    fn remove(&mut self, id: i64) -> Option<Watcher> {
        let watcher = self.watchers.remove(&id)?;
        match &watcher.range {
            KeyRange::Single(key) => {
                if let Some(set) = self.key_watchers.get_mut(key) {
                    set.remove(&id);
                    if set.is_empty() {
                        self.key_watchers.remove(key);
                    }
                }
            }
            _ => {
                self.range_watchers.remove(&id);
            }
        }
        Some(watcher)
    }

    /// Ids of watchers whose range covers `key`.
    fn matching(&self, key: &[u8]) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .key_watchers
            .get(key)
            .into_iter()
            .flatten()
            .copied()
            .collect();
        for id in &self.range_watchers {
            if let Some(w) = self.watchers.get(id) {
                if w.range.contains(key) {
                    ids.push(*id);
                }
            }
        }
        ids
    }

    fn ids(&self) -> Vec<i64> {
        self.watchers.keys().copied().collect()
    }
}

struct HubInner {
    synced: WatcherGroup,
    unsynced: WatcherGroup,
    next_id: i64,
}

/// The watcher hub.
pub struct WatcherHub {
    store: Arc<KvStore>,
    inner: Mutex<HubInner>,
    channel_capacity: usize,
    stall_budget: u32,
}

impl WatcherHub {
    /// Create a hub over `store`.
    pub fn new(store: Arc<KvStore>, channel_capacity: usize, stall_budget: u32) -> Arc<Self> {
        Arc::new(Self {
            store,
            inner: Mutex::new(HubInner {
                synced: WatcherGroup::default(),
                unsynced: WatcherGroup::default(),
                next_id: 0,
            }),
            channel_capacity,
            stall_budget,
        })
    }

    /// Register a watcher. The first response on the returned channel
    /// acknowledges creation; a start revision below the compaction
    /// floor yields an immediate `compacted` cancellation instead.
    pub fn watch(&self, req: WatchCreateRequest) -> Result<(i64, mpsc::Receiver<WatchResponse>)> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let current = self.store.current_revision();
        let compact = self.store.compact_revision();
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;

        let created = WatchResponse {
            watch_id: id,
            created: true,
            header_revision: current,
            ..Default::default()
        };
        let _ = tx.try_send(created);

        if req.start_revision != 0 && req.start_revision < compact {
            let _ = tx.try_send(WatchResponse {
                watch_id: id,
                canceled: true,
                compact_revision: compact,
                header_revision: current,
                ..Default::default()
            });
            return Ok((id, rx));
        }

        let cursor = if req.start_revision == 0 {
            current + 1
        } else {
            req.start_revision
        };
        let watcher = Watcher {
            id,
            range: req.range,
            cursor,
            filters: req.filters,
            progress_notify: req.progress_notify,
            tx,
            stalled_rounds: 0,
        };
        if cursor > current {
            inner.synced.add(watcher);
        } else {
            inner.unsynced.add(watcher);
        }
        Ok((id, rx))
    }

    /// Cancel a watcher. Returns whether it existed.
    pub fn cancel(&self, id: i64) -> bool {
        let mut inner = self.inner.lock();
        let watcher = inner
            .synced
            .remove(id)
            .or_else(|| inner.unsynced.remove(id));
        drop(inner);
        match watcher {
            Some(w) => {
                let _ = w.tx.try_send(WatchResponse {
                    watch_id: id,
                    canceled: true,
                    header_revision: self.store.current_revision(),
                    ..Default::default()
                });
                true
            }
            None => false,
        }
    }

    /// Direct dispatch at commit: deliver the events of one applied
    /// revision to every synced watcher they match. Sends are
    /// non-blocking; an overflowing watcher demotes to unsynced and
    /// catches up from the value log later.
    pub fn notify(&self, rev: i64, events: &[Event]) {
        if events.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        let mut batches: HashMap<i64, Vec<Event>> = HashMap::new();
        for event in events {
            for id in inner.synced.matching(&event.kv.key) {
                let watcher = &inner.synced.watchers[&id];
                if watcher.wants(event) {
                    batches.entry(id).or_default().push(event.clone());
                }
            }
        }
        for (id, batch) in batches {
            let sent = {
                let Some(watcher) = inner.synced.watchers.get_mut(&id) else {
                    continue;
                };
                let response = WatchResponse {
                    watch_id: id,
                    header_revision: rev,
                    events: batch,
                    ..Default::default()
                };
                watcher.tx.try_send(response)
            };
            match sent {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow consumer: re-read this revision during
                    // catch-up instead of blocking the apply path.
                    if let Some(mut w) = inner.synced.remove(id) {
                        tracing::debug!(watch_id = id, rev, "watcher demoted to unsynced");
                        w.cursor = rev;
                        inner.unsynced.add(w);
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    inner.synced.remove(id);
                }
            }
        }
        // Every remaining synced watcher has observed this revision.
        for watcher in inner.synced.watchers.values_mut() {
            watcher.cursor = rev + 1;
        }
    }

    /// One catch-up pass: drain up to `budget` value-log records per
    /// unsynced watcher and promote those that reach the present.
    pub fn catchup(&self, budget: usize) {
        let mut inner = self.inner.lock();
        let current = self.store.current_revision();
        let compact = self.store.compact_revision();

        for id in inner.unsynced.ids() {
            let watcher = &inner.unsynced.watchers[&id];
            let cursor = watcher.cursor;

            if cursor < compact {
                if let Some(w) = inner.unsynced.remove(id) {
                    let _ = w.tx.try_send(WatchResponse {
                        watch_id: id,
                        canceled: true,
                        compact_revision: compact,
                        header_revision: current,
                        ..Default::default()
                    });
                }
                continue;
            }

            let (events, next) = match self.store.events_since(cursor, budget) {
                Ok(got) => got,
                Err(e) => {
                    tracing::warn!(watch_id = id, error = %e, "watch catch-up read failed");
                    continue;
                }
            };

            enum Outcome {
                Delivered,
                Full,
                Gone,
            }
            let outcome = {
                let watcher = inner.unsynced.watchers.get_mut(&id).expect("still present");
                let matching: Vec<Event> =
                    events.into_iter().filter(|e| watcher.wants(e)).collect();
                if matching.is_empty() {
                    Outcome::Delivered
                } else {
                    let response = WatchResponse {
                        watch_id: id,
                        header_revision: next - 1,
                        events: matching,
                        ..Default::default()
                    };
                    match watcher.tx.try_send(response) {
                        Ok(()) => Outcome::Delivered,
                        Err(mpsc::error::TrySendError::Full(_)) => Outcome::Full,
                        Err(mpsc::error::TrySendError::Closed(_)) => Outcome::Gone,
                    }
                }
            };

            match outcome {
                Outcome::Delivered => {
                    let watcher = inner.unsynced.watchers.get_mut(&id).expect("still present");
                    watcher.cursor = next;
                    watcher.stalled_rounds = 0;
                    if next > current {
                        if let Some(w) = inner.unsynced.remove(id) {
                            inner.synced.add(w);
                        }
                    }
                }
                Outcome::Full => {
                    let watcher = inner.unsynced.watchers.get_mut(&id).expect("still present");
                    watcher.stalled_rounds += 1;
                    if watcher.stalled_rounds > self.stall_budget {
                        if let Some(w) = inner.unsynced.remove(id) {
                            tracing::warn!(watch_id = id, "watcher cancelled: no progress");
                            let _ = w.tx.try_send(WatchResponse {
                                watch_id: id,
                                canceled: true,
                                header_revision: current,
                                ..Default::default()
                            });
                        }
                    }
                }
                Outcome::Gone => {
                    inner.unsynced.remove(id);
                }
            }
        }
    }

    /// Emit empty heartbeat responses to synced watchers that asked for
    /// progress notification.
    pub fn progress(&self) {
        let current = self.store.current_revision();
        let inner = self.inner.lock();
        for watcher in inner.synced.watchers.values() {
            if watcher.progress_notify {
                let _ = watcher.tx.try_send(WatchResponse {
                    watch_id: watcher.id,
                    header_revision: current,
                    ..Default::default()
                });
            }
        }
    }

    /// Number of registered watchers, synced and unsynced.
    pub fn watcher_counts(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.synced.watchers.len(), inner.unsynced.watchers.len())
    }
}
