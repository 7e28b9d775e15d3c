//! Transactional bucketed byte store.
//!
//! Buckets are named namespaces (`key`, `lease`, `auth`, `meta`) of
//! arbitrary byte keys. Mutations go through the single shared
//! [`BatchTx`]: `lock()` enters its critical section, staged ops apply
//! to the in-memory bucket view at once and queue for the commit journal
//! on the `db` file, and `unlock()` leaves the section, flushing when
//! the batch crossed its count or age bound. Ops staged inside one
//! section can never be split across journal records. `force_commit`
//! flushes before anything externally observable depends on durability.
//! Opening a backend replays the journal; entries that were applied but
//! never journaled are recovered by the caller's log replay.
//!
//! A [`ReadTx`] holds the shared state lock: a consistent view, with
//! writers briefly blocked for its duration. A closed backend fails
//! every operation with `BackendClosed`; any other storage failure means
//! the medium is gone and is fatal to the process.

use crate::core::error::{Error, Result};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Well-known bucket names.
pub mod bucket {
    pub const KEY: &str = "key";
    pub const LEASE: &str = "lease";
    pub const AUTH: &str = "auth";
    pub const META: &str = "meta";
}

type Bucket = BTreeMap<Vec<u8>, Vec<u8>>;

/// One journaled mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum JournalOp {
    CreateBucket { bucket: String },
    Put { bucket: String, key: Vec<u8>, value: Vec<u8> },
    Delete { bucket: String, key: Vec<u8> },
}

#[derive(Default)]
struct State {
    buckets: HashMap<String, Bucket>,
}

impl State {
    fn apply(&mut self, op: &JournalOp) {
        match op {
            JournalOp::CreateBucket { bucket } => {
                self.buckets.entry(bucket.clone()).or_default();
            }
            JournalOp::Put { bucket, key, value } => {
                self.buckets
                    .entry(bucket.clone())
                    .or_default()
                    .insert(key.clone(), value.clone());
            }
            JournalOp::Delete { bucket, key } => {
                if let Some(b) = self.buckets.get_mut(bucket) {
                    b.remove(key);
                }
            }
        }
    }
}

/// Ops applied to memory but not yet journaled.
struct Pending {
    ops: Vec<JournalOp>,
    opened_at: Option<Instant>,
}

struct Journal {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl Journal {
    fn append(&mut self, ops: &[JournalOp]) -> std::io::Result<()> {
        let payload = bincode::serialize(ops).map_err(std::io::Error::other)?;
        let crc = crc32fast::hash(&payload);
        self.writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.writer.write_all(&crc.to_le_bytes())?;
        self.writer.write_all(&payload)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}

/// The backend.
pub struct Backend {
    state: RwLock<State>,
    pending: Mutex<Pending>,
    journal: Mutex<Journal>,
    closed: AtomicBool,
    batch_limit: usize,
    batch_interval: Duration,
}

impl Backend {
    /// Open (or create) a backend at `path`, replaying the commit journal.
    ///
    /// A truncated final journal record is discarded (its batch was never
    /// acknowledged as durable); a CRC mismatch earlier in the file is
    /// corruption.
    pub fn open(path: &Path, batch_limit: usize, batch_interval: Duration) -> Result<Backend> {
        let mut state = State::default();
        let mut valid_len = 0u64;
        match File::open(path) {
            Ok(file) => {
                let mut reader = BufReader::new(file);
                loop {
                    let mut len_buf = [0u8; 4];
                    match reader.read_exact(&mut len_buf) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                        Err(e) => return Err(io_fatal(e)),
                    }
                    let len = u32::from_le_bytes(len_buf) as usize;
                    let mut crc_buf = [0u8; 4];
                    let mut payload = vec![0u8; len];
                    let read = reader
                        .read_exact(&mut crc_buf)
                        .and_then(|()| reader.read_exact(&mut payload));
                    match read {
                        Ok(()) => {}
                        // Torn trailing record: the flush never finished.
                        Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                        Err(e) => return Err(io_fatal(e)),
                    }
                    if crc32fast::hash(&payload) != u32::from_le_bytes(crc_buf) {
                        return Err(Error::Corrupt {
                            detail: format!(
                                "backend journal crc mismatch at offset {valid_len} in {}",
                                path.display()
                            ),
                        });
                    }
                    let ops: Vec<JournalOp> = bincode::deserialize(&payload).map_err(|e| {
                        Error::Corrupt {
                            detail: format!("backend journal decode: {e}"),
                        }
                    })?;
                    for op in &ops {
                        state.apply(op);
                    }
                    valid_len += 8 + len as u64;
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io_fatal(e)),
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .map_err(io_fatal)?;
        file.set_len(valid_len).map_err(io_fatal)?;
        let file = OpenOptions::new().append(true).open(path).map_err(io_fatal)?;
        Ok(Backend {
            state: RwLock::new(state),
            pending: Mutex::new(Pending {
                ops: Vec::new(),
                opened_at: None,
            }),
            journal: Mutex::new(Journal {
                writer: BufWriter::new(file),
                path: path.to_path_buf(),
            }),
            closed: AtomicBool::new(false),
            batch_limit,
            batch_interval,
        })
    }

    /// The shared batch transaction. All mutators stage through this one
    /// transaction; [`BatchTx::lock`] serializes them.
    pub fn batch_tx(&self) -> BatchTx<'_> {
        BatchTx { backend: self }
    }

    /// Acquire a read transaction: a consistent view of every bucket.
    pub fn read_tx(&self) -> Result<ReadTx<'_>> {
        self.check_open()?;
        Ok(ReadTx {
            guard: self.state.read(),
        })
    }

    /// Flush the pending batch to the journal. Required before an
    /// externally observable acknowledgment that implies durability.
    pub fn force_commit(&self) -> Result<()> {
        self.check_open()?;
        let mut pending = self.pending.lock();
        self.flush_locked(&mut pending)
    }

    /// Serialize every bucket into one image, for snapshots. The pending
    /// batch is flushed first.
    pub fn snapshot_image(&self) -> Result<Vec<u8>> {
        self.force_commit()?;
        let state = self.state.read();
        let image: BTreeMap<&String, &Bucket> = state.buckets.iter().collect();
        bincode::serialize(&image).map_err(|e| Error::internal(format!("snapshot encode: {e}")))
    }

    /// Replace all buckets with the contents of a snapshot image and
    /// rewrite the journal compactly. Any pending batch is discarded:
    /// the snapshot supersedes it.
    pub fn restore_image(&self, image: &[u8]) -> Result<()> {
        self.check_open()?;
        let buckets: BTreeMap<String, Bucket> = bincode::deserialize(image)
            .map_err(|e| Error::Corrupt {
                detail: format!("snapshot image decode: {e}"),
            })?;
        // Lock order everywhere: pending, then journal, then state.
        let mut pending = self.pending.lock();
        pending.ops.clear();
        pending.opened_at = None;
        {
            let mut state = self.state.write();
            state.buckets = buckets.into_iter().collect();
        }
        self.rewrite_journal()
    }

    /// Rewrite the journal as one record holding the current state.
    pub fn defrag(&self) -> Result<()> {
        self.check_open()?;
        let mut pending = self.pending.lock();
        self.flush_locked(&mut pending)?;
        self.rewrite_journal()
    }

    /// Close the backend. Subsequent operations fail `BackendClosed`.
    pub fn close(&self) -> Result<()> {
        self.force_commit()?;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Caller must hold the pending lock with an empty batch.
    fn rewrite_journal(&self) -> Result<()> {
        let mut journal = self.journal.lock();
        let tmp = journal.path.with_extension("db.tmp");
        let mut ops = Vec::new();
        {
            let state = self.state.read();
            let buckets: BTreeMap<&String, &Bucket> = state.buckets.iter().collect();
            for (name, bucket) in buckets {
                ops.push(JournalOp::CreateBucket {
                    bucket: name.clone(),
                });
                for (k, v) in bucket {
                    ops.push(JournalOp::Put {
                        bucket: name.clone(),
                        key: k.clone(),
                        value: v.clone(),
                    });
                }
            }
        }
        {
            let file = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&tmp)
                .map_err(io_fatal)?;
            let mut fresh = Journal {
                writer: BufWriter::new(file),
                path: tmp.clone(),
            };
            fresh.append(&ops).map_err(io_fatal)?;
        }
        std::fs::rename(&tmp, &journal.path).map_err(io_fatal)?;
        let file = OpenOptions::new()
            .append(true)
            .open(&journal.path)
            .map_err(io_fatal)?;
        journal.writer = BufWriter::new(file);
        Ok(())
    }

    fn flush_locked(&self, pending: &mut MutexGuard<'_, Pending>) -> Result<()> {
        if pending.ops.is_empty() {
            return Ok(());
        }
        let ops = std::mem::take(&mut pending.ops);
        pending.opened_at = None;
        self.journal.lock().append(&ops).map_err(io_fatal)?;
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::BackendClosed);
        }
        Ok(())
    }
}

fn io_fatal(e: std::io::Error) -> Error {
    Error::internal(format!("backend io: {e}"))
}

/// Handle to the shared batch transaction. Cheap to obtain; all staging
/// goes through the critical section [`BatchTx::lock`] opens.
pub struct BatchTx<'a> {
    backend: &'a Backend,
}

impl<'a> BatchTx<'a> {
    /// Enter the transaction's critical section. Everything staged
    /// through the returned guard before [`BatchTxGuard::unlock`] lands
    /// in the same journal record, however the flush is triggered.
    pub fn lock(&self) -> Result<BatchTxGuard<'a>> {
        self.backend.check_open()?;
        Ok(BatchTxGuard {
            backend: self.backend,
            guard: self.backend.pending.lock(),
        })
    }
}

/// The locked batch transaction. Mutations land in the shared view at
/// once and queue for the next journal flush.
pub struct BatchTxGuard<'a> {
    backend: &'a Backend,
    guard: MutexGuard<'a, Pending>,
}

impl BatchTxGuard<'_> {
    /// Create a bucket if it does not already exist.
    pub fn create_bucket(&mut self, name: &str) {
        self.stage(JournalOp::CreateBucket {
            bucket: name.to_string(),
        });
    }

    /// Put one pair.
    pub fn put(&mut self, bucket: &str, key: &[u8], value: &[u8]) {
        self.stage(JournalOp::Put {
            bucket: bucket.to_string(),
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }

    /// Delete one pair.
    pub fn delete(&mut self, bucket: &str, key: &[u8]) {
        self.stage(JournalOp::Delete {
            bucket: bucket.to_string(),
            key: key.to_vec(),
        });
    }

    /// Range over `[begin, end)` in `bucket`, including this batch's own
    /// writes. An empty `end` means "only `begin`"; `limit == 0` is
    /// unbounded.
    pub fn range(
        &self,
        bucket: &str,
        begin: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let state = self.backend.state.read();
        let Some(b) = state.buckets.get(bucket) else {
            return Vec::new();
        };
        let iter = range_of(b, begin, end).map(|(k, v)| (k.clone(), v.clone()));
        if limit == 0 {
            iter.collect()
        } else {
            iter.take(limit).collect()
        }
    }

    /// Point lookup, including this batch's own writes.
    pub fn get(&self, bucket: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.backend
            .state
            .read()
            .buckets
            .get(bucket)
            .and_then(|b| b.get(key).cloned())
    }

    /// Leave the critical section, flushing to the journal when the
    /// batch crossed its count or age bound.
    pub fn unlock(mut self) -> Result<()> {
        self.maybe_flush()
    }

    /// Flush the pending batch to the journal immediately.
    pub fn commit(mut self) -> Result<()> {
        self.backend.flush_locked(&mut self.guard)
    }

    fn stage(&mut self, op: JournalOp) {
        if self.guard.opened_at.is_none() {
            self.guard.opened_at = Some(Instant::now());
        }
        self.backend.state.write().apply(&op);
        self.guard.ops.push(op);
    }

    fn maybe_flush(&mut self) -> Result<()> {
        let over_count = self.guard.ops.len() >= self.backend.batch_limit;
        let over_age = self
            .guard
            .opened_at
            .is_some_and(|t| t.elapsed() >= self.backend.batch_interval);
        if over_count || over_age {
            self.backend.flush_locked(&mut self.guard)?;
        }
        Ok(())
    }
}

impl Drop for BatchTxGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.maybe_flush() {
            // Medium failure on a background flush path.
            tracing::error!(error = %e, "backend batch flush failed");
        }
    }
}

/// Read transaction: a consistent view of committed and applied state.
pub struct ReadTx<'a> {
    guard: RwLockReadGuard<'a, State>,
}

impl ReadTx<'_> {
    /// Range over `[begin, end)` in `bucket`. An empty `end` means "only
    /// `begin`"; `limit == 0` is unbounded.
    pub fn range(
        &self,
        bucket: &str,
        begin: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let Some(b) = self.guard.buckets.get(bucket) else {
            return Vec::new();
        };
        let iter = range_of(b, begin, end).map(|(k, v)| (k.clone(), v.clone()));
        if limit == 0 {
            iter.collect()
        } else {
            iter.take(limit).collect()
        }
    }

    /// Point lookup.
    pub fn get(&self, bucket: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.guard.buckets.get(bucket).and_then(|b| b.get(key).cloned())
    }

    /// Every pair in `bucket`, in key order.
    pub fn scan(&self, bucket: &str) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.guard
            .buckets
            .get(bucket)
            .map(|b| b.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }
}

fn range_of<'a>(
    bucket: &'a Bucket,
    begin: &[u8],
    end: &[u8],
) -> Box<dyn Iterator<Item = (&'a Vec<u8>, &'a Vec<u8>)> + 'a> {
    if end.is_empty() {
        Box::new(bucket.get_key_value(begin).into_iter())
    } else {
        Box::new(bucket.range(begin.to_vec()..end.to_vec()))
    }
}
