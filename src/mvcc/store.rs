//! The revisioned key-value store.
//!
//! Values live in the backend `key` bucket, addressed by encoded revision
//! and ordered by it; the in-memory [`TreeIndex`] maps user keys to the
//! revisions that modified them. Writers are serialized by the store
//! write lock and allocate one `main` revision per transaction that
//! produced at least one mutation; readers take a backend snapshot and a
//! shared index guard.

use crate::core::error::{Error, Result};
use crate::lease::Lessor;
use crate::mvcc::index::TreeIndex;
use crate::mvcc::revision::Revision;
use crate::mvcc::{Event, EventKind, KeyRange, KeyValue};
use crate::storage::backend::{bucket, Backend, BatchTxGuard, ReadTx};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Meta-bucket key holding the persisted compaction floor.
const META_COMPACT_REV: &[u8] = b"compactRev";

/// Sort order for range results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    #[default]
    None,
    Ascend,
    Descend,
}

/// Sort key for range results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortTarget {
    #[default]
    Key,
    Version,
    CreateRevision,
    ModRevision,
    Value,
}

/// Options for a range read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RangeOptions {
    /// Maximum records returned; `0` is unbounded.
    pub limit: i64,
    /// Revision to read at; `0` means latest.
    pub rev: i64,
    pub sort_order: SortOrder,
    pub sort_target: SortTarget,
    /// Return only the count of matching keys.
    pub count_only: bool,
    /// Strip values from returned records.
    pub keys_only: bool,
}

/// Result of a range read.
#[derive(Debug, Clone, Default)]
pub struct RangeResult {
    pub kvs: Vec<KeyValue>,
    /// Revision the read was served at.
    pub rev: i64,
    /// Keys matching before `limit` was applied.
    pub count: usize,
    /// Set when `limit` truncated the result.
    pub more: bool,
}

#[derive(Debug, Clone, Copy)]
struct StoreState {
    current_rev: i64,
    compact_rev: i64,
}

/// The MVCC store.
pub struct KvStore {
    backend: Arc<Backend>,
    lessor: Arc<Lessor>,
    index: RwLock<TreeIndex>,
    state: RwLock<StoreState>,
    /// Serializes write transactions and compaction planning.
    write_lock: Mutex<()>,
}

impl KvStore {
    /// Open the store over `backend`, rebuilding the index from the
    /// value log.
    pub fn recover(backend: Arc<Backend>, lessor: Arc<Lessor>) -> Result<KvStore> {
        {
            let mut tx = backend.batch_tx().lock()?;
            tx.create_bucket(bucket::KEY);
            tx.create_bucket(bucket::META);
            tx.commit()?;
        }
        let store = KvStore {
            backend,
            lessor,
            index: RwLock::new(TreeIndex::new()),
            state: RwLock::new(StoreState {
                current_rev: 0,
                compact_rev: 0,
            }),
            write_lock: Mutex::new(()),
        };
        store.reload()?;
        Ok(store)
    }

    /// Rebuild the index and revision cursors from the backend, e.g.
    /// after a snapshot install replaced the bucket contents.
    pub fn reload(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut index = TreeIndex::new();
        let mut current_rev = 0i64;

        let reader = self.backend.read_tx()?;
        let compact_rev = reader
            .get(bucket::META, META_COMPACT_REV)
            .and_then(|v| v.try_into().ok().map(i64::from_be_bytes))
            .unwrap_or(0);

        for (log_key, value) in reader.scan(bucket::KEY) {
            let Some((rev, tombstone)) = Revision::decode(&log_key) else {
                return Err(Error::Corrupt {
                    detail: "undecodable value-log key".to_string(),
                });
            };
            let kv = KeyValue::from_bytes(&value).map_err(|e| Error::Corrupt {
                detail: format!("value-log record decode: {e}"),
            })?;
            if tombstone {
                // A tombstone always follows a surviving put of the same
                // generation, so the key is present.
                index.tombstone(&kv.key, rev)?;
            } else {
                index.restore_record(&kv.key, kv.create_revision, rev, kv.version);
            }
            current_rev = rev.main;
        }
        drop(reader);

        *self.index.write() = index;
        *self.state.write() = StoreState {
            // An empty store sits at revision 1, the revision of the
            // cluster's own bootstrap entry; the first put lands at 2.
            current_rev: current_rev.max(1),
            compact_rev,
        };
        Ok(())
    }

    /// Latest committed revision.
    pub fn current_revision(&self) -> i64 {
        self.state.read().current_rev
    }

    /// Compaction floor.
    pub fn compact_revision(&self) -> i64 {
        self.state.read().compact_rev
    }

    /// Begin a snapshot read transaction.
    pub fn read_tx(&self) -> Result<ReadTxn<'_>> {
        let state = *self.state.read();
        Ok(ReadTxn {
            index: self.index.read(),
            backend: self.backend.read_tx()?,
            state,
        })
    }

    /// Begin a write transaction staging through the caller's open batch
    /// critical section, so the mutation and whatever else the caller
    /// stages land in one journal record. Holds the store write lock for
    /// its lifetime; mutations share one `main` revision.
    pub fn write_tx<'b, 'g>(
        &self,
        batch: &'g mut BatchTxGuard<'b>,
    ) -> Result<WriteTxn<'_, 'b, 'g>> {
        let guard = self.write_lock.lock();
        let state = *self.state.read();
        Ok(WriteTxn {
            store: self,
            _serial: guard,
            batch,
            main: state.current_rev + 1,
            compact_rev: state.compact_rev,
            sub: 0,
            events: Vec::new(),
        })
    }

    /// Plan a compaction at `rev`: advance the floor, persist it through
    /// the caller's batch, trim the index, and return the value-log
    /// positions that are now safe to remove physically. Re-compacting
    /// at the exact floor is a no-op.
    pub fn compact(
        &self,
        rev: i64,
        batch: &mut BatchTxGuard<'_>,
    ) -> Result<Vec<(Revision, bool)>> {
        let _guard = self.write_lock.lock();
        let mut state = self.state.write();
        if rev == state.compact_rev {
            return Ok(Vec::new());
        }
        if rev < state.compact_rev {
            return Err(Error::Compacted {
                revision: rev,
                floor: state.compact_rev,
            });
        }
        if rev > state.current_rev {
            return Err(Error::FutureRev {
                revision: rev,
                current: state.current_rev,
            });
        }
        state.compact_rev = rev;
        drop(state);

        batch.put(bucket::META, META_COMPACT_REV, &rev.to_be_bytes());

        let removed = self.index.write().compact(rev);
        tracing::info!(rev, removable = removed.len(), "compaction planned");
        Ok(removed)
    }

    /// Physically remove a batch of compacted value-log records.
    /// Intended to run on the compaction worker in bounded chunks;
    /// deletions are idempotent, so this needs no coupling to the
    /// applied cursor.
    pub fn purge_compacted(&self, removals: &[(Revision, bool)]) -> Result<()> {
        let mut tx = self.backend.batch_tx().lock()?;
        for (rev, tombstone) in removals {
            tx.delete(bucket::KEY, &rev.encode(*tombstone));
        }
        tx.commit()
    }

    /// Consistency fingerprint: FNV-1a over the value-log records with
    /// `main` in `(compact_rev, rev]`, in revision order. Identical on
    /// every peer that applied the same log prefix.
    pub fn hash_kv(&self, rev: i64) -> Result<u32> {
        let state = *self.state.read();
        let rev = if rev == 0 { state.current_rev } else { rev };
        if rev < state.compact_rev {
            return Err(Error::Compacted {
                revision: rev,
                floor: state.compact_rev,
            });
        }
        if rev > state.current_rev {
            return Err(Error::FutureRev {
                revision: rev,
                current: state.current_rev,
            });
        }
        let begin = Revision::new(state.compact_rev + 1, 0).encode(false);
        let end = Revision::new(rev + 1, 0).encode(false);
        // Flush pending writes so peers hash the same committed view.
        self.backend.force_commit()?;
        let reader = self.backend.read_tx()?;

        // FNV-1a, 32-bit. The constant choice is part of the cross-peer
        // contract; do not change it.
        let mut hash: u32 = 0x811c_9dc5;
        let mut feed = |bytes: &[u8]| {
            for b in bytes {
                hash ^= u32::from(*b);
                hash = hash.wrapping_mul(0x0100_0193);
            }
        };
        for (log_key, value) in reader.range(bucket::KEY, &begin, &end, 0) {
            feed(&log_key);
            feed(&value);
        }
        Ok(hash)
    }

    /// Events in revision order starting at revision `from`, up to about
    /// `budget` value-log records; a trailing revision is never split
    /// across calls. Returns the events and the next revision to resume
    /// from. Used by the watcher catch-up loop.
    pub fn events_since(&self, from: i64, budget: usize) -> Result<(Vec<Event>, i64)> {
        let state = *self.state.read();
        if from < state.compact_rev {
            return Err(Error::Compacted {
                revision: from,
                floor: state.compact_rev,
            });
        }
        let begin = Revision::new(from, 0).encode(false);
        let end = Revision::new(state.current_rev + 1, 0).encode(false);
        let reader = self.backend.read_tx()?;
        let mut records = reader.range(bucket::KEY, &begin, &end, budget);
        if budget > 0 && records.len() == budget {
            // Pull the rest of the trailing revision so its events are
            // delivered in one piece.
            if let Some((last_key, _)) = records.last() {
                if let Some((last_rev, _)) = Revision::decode(last_key) {
                    let mut tail_begin = last_key.clone();
                    tail_begin.push(0);
                    let tail_end = Revision::new(last_rev.main + 1, 0).encode(false);
                    records.extend(reader.range(bucket::KEY, &tail_begin, &tail_end, 0));
                }
            }
        }
        let mut events = Vec::with_capacity(records.len());
        for (log_key, value) in &records {
            events.push(decode_event(log_key, value)?);
        }
        let next = events
            .last()
            .map(|e| e.revision() + 1)
            .unwrap_or(state.current_rev + 1);
        Ok((events, next))
    }
}

fn decode_event(log_key: &[u8], value: &[u8]) -> Result<Event> {
    let Some((rev, tombstone)) = Revision::decode(log_key) else {
        return Err(Error::Corrupt {
            detail: "undecodable value-log key".to_string(),
        });
    };
    let mut kv = KeyValue::from_bytes(value).map_err(|e| Error::Corrupt {
        detail: format!("value-log record decode: {e}"),
    })?;
    kv.mod_revision = rev.main;
    Ok(Event {
        kind: if tombstone {
            EventKind::Delete
        } else {
            EventKind::Put
        },
        kv,
        prev_kv: None,
    })
}

/// Shared read path for both transaction kinds.
fn range_impl(
    index: &TreeIndex,
    read_value: &dyn Fn(&Revision) -> Option<Vec<u8>>,
    current_rev: i64,
    compact_rev: i64,
    range: &KeyRange,
    opts: &RangeOptions,
) -> Result<RangeResult> {
    let at_rev = if opts.rev <= 0 { current_rev } else { opts.rev };
    if at_rev > current_rev {
        return Err(Error::FutureRev {
            revision: at_rev,
            current: current_rev,
        });
    }
    if at_rev < compact_rev {
        return Err(Error::Compacted {
            revision: at_rev,
            floor: compact_rev,
        });
    }

    if opts.count_only {
        return Ok(RangeResult {
            kvs: Vec::new(),
            rev: current_rev,
            count: index.count(range, at_rev),
            more: false,
        });
    }

    let pairs = index.range(range, at_rev);
    let count = pairs.len();
    let mut kvs = Vec::with_capacity(count);
    for (key, got) in pairs {
        let Some(raw) = read_value(&got.mod_rev) else {
            return Err(Error::internal(format!(
                "value-log record missing for key at revision {}",
                got.mod_rev
            )));
        };
        let mut kv = KeyValue::from_bytes(&raw)
            .map_err(|e| Error::internal(format!("value-log record decode: {e}")))?;
        debug_assert_eq!(kv.key, key);
        kv.mod_revision = got.mod_rev.main;
        if opts.keys_only {
            kv.value.clear();
        }
        kvs.push(kv);
    }

    match (opts.sort_order, opts.sort_target) {
        (SortOrder::None, _) => {}
        // Already in ascending key order from the index walk.
        (SortOrder::Ascend, SortTarget::Key) => {}
        (order, target) => {
            kvs.sort_by(|a, b| {
                let ord = match target {
                    SortTarget::Key => a.key.cmp(&b.key),
                    SortTarget::Version => a.version.cmp(&b.version),
                    SortTarget::CreateRevision => a.create_revision.cmp(&b.create_revision),
                    SortTarget::ModRevision => a.mod_revision.cmp(&b.mod_revision),
                    SortTarget::Value => a.value.cmp(&b.value),
                };
                match order {
                    SortOrder::Descend => ord.reverse(),
                    _ => ord,
                }
            });
        }
    }

    let mut more = false;
    if opts.limit > 0 && kvs.len() > opts.limit as usize {
        kvs.truncate(opts.limit as usize);
        more = true;
    }

    Ok(RangeResult {
        kvs,
        rev: current_rev,
        count,
        more,
    })
}

/// Snapshot read transaction.
pub struct ReadTxn<'a> {
    index: RwLockReadGuard<'a, TreeIndex>,
    backend: ReadTx<'a>,
    state: StoreState,
}

impl ReadTxn<'_> {
    /// Range read at `opts.rev` (or latest).
    pub fn range(&self, range: &KeyRange, opts: &RangeOptions) -> Result<RangeResult> {
        let read = |rev: &Revision| self.backend.get(bucket::KEY, &rev.encode(false));
        range_impl(
            &self.index,
            &read,
            self.state.current_rev,
            self.state.compact_rev,
            range,
            opts,
        )
    }
}

/// Serialized write transaction over a borrowed batch critical section.
pub struct WriteTxn<'s, 'b, 'g> {
    store: &'s KvStore,
    _serial: MutexGuard<'s, ()>,
    batch: &'g mut BatchTxGuard<'b>,
    /// Revision allocated to this transaction if it mutates.
    main: i64,
    compact_rev: i64,
    /// Next sub-revision within the transaction.
    sub: i64,
    events: Vec<Event>,
}

impl WriteTxn<'_, '_, '_> {
    /// Revision this transaction writes at.
    pub fn revision(&self) -> i64 {
        self.main
    }

    /// Put one key, attaching it to `lease` (0 detaches).
    pub fn put(&mut self, key: &[u8], value: &[u8], lease: i64) -> Result<Revision> {
        let rev = Revision::new(self.main, self.sub);
        let index = self.store.index.read();
        let prev = index.get(key, self.main);
        drop(index);

        let (create_revision, version, prev_kv) = match prev {
            Some(got) => {
                let prev_kv = self.read_at(&got.mod_rev)?;
                (got.create_rev.main, got.version + 1, Some(prev_kv))
            }
            None => (rev.main, 1, None),
        };

        let kv = KeyValue {
            key: key.to_vec(),
            create_revision,
            mod_revision: rev.main,
            version,
            value: value.to_vec(),
            lease,
        };
        self.batch.put(bucket::KEY, &rev.encode(false), &kv.to_bytes());
        self.store.index.write().put(key, rev);
        self.sub += 1;

        let prev_lease = prev_kv.as_ref().map(|p| p.lease).unwrap_or(0);
        if prev_lease != 0 {
            self.store.lessor.detach(prev_lease, key, self.batch);
        }
        if lease != 0 {
            self.store.lessor.attach(lease, key, self.batch)?;
        }

        self.events.push(Event {
            kind: EventKind::Put,
            kv,
            prev_kv,
        });
        Ok(rev)
    }

    /// Append tombstones for every live key in `range`. Returns the
    /// number of deleted keys and the transaction revision.
    pub fn delete_range(&mut self, range: &KeyRange) -> Result<(i64, Revision)> {
        let pairs = {
            let index = self.store.index.read();
            index.range(range, self.main)
        };
        let mut deleted = 0;
        for (key, got) in pairs {
            let rev = Revision::new(self.main, self.sub);
            let prev_kv = self.read_at(&got.mod_rev)?;
            let tomb = KeyValue {
                key: key.clone(),
                ..Default::default()
            };
            self.batch
                .put(bucket::KEY, &rev.encode(true), &tomb.to_bytes());
            self.store.index.write().tombstone(&key, rev)?;
            self.sub += 1;
            deleted += 1;

            if prev_kv.lease != 0 {
                self.store.lessor.detach(prev_kv.lease, &key, self.batch);
            }

            self.events.push(Event {
                kind: EventKind::Delete,
                kv: KeyValue {
                    key,
                    mod_revision: rev.main,
                    ..Default::default()
                },
                prev_kv: Some(prev_kv),
            });
        }
        Ok((deleted, Revision::new(self.main, 0)))
    }

    /// Range read inside the transaction; sees this transaction's own
    /// writes.
    pub fn range(&self, range: &KeyRange, opts: &RangeOptions) -> Result<RangeResult> {
        let current = if self.sub > 0 { self.main } else { self.main - 1 };
        let index = self.store.index.read();
        let read = |rev: &Revision| self.batch.get(bucket::KEY, &rev.encode(false));
        range_impl(&index, &read, current, self.compact_rev, range, opts)
    }

    /// Finish: advance the store revision if any mutation was staged and
    /// hand back the events to publish. The staged ops stay in the
    /// caller's open batch; the caller decides the flush boundary.
    pub fn end(self) -> (i64, Vec<Event>) {
        let rev = if self.sub > 0 {
            let mut state = self.store.state.write();
            state.current_rev = self.main;
            self.main
        } else {
            self.main - 1
        };
        (rev, self.events)
    }

    fn read_at(&self, rev: &Revision) -> Result<KeyValue> {
        let Some(raw) = self.batch.get(bucket::KEY, &rev.encode(false)) else {
            return Err(Error::internal(format!(
                "value-log record missing at revision {rev}"
            )));
        };
        let mut kv = KeyValue::from_bytes(&raw)
            .map_err(|e| Error::internal(format!("value-log record decode: {e}")))?;
        kv.mod_revision = rev.main;
        Ok(kv)
    }
}
