//! Lease management.
//!
//! A lease is a cluster-wide TTL token; keys attached to it are deleted
//! atomically when it expires or is revoked. Only the primary lessor
//! (the one on the leader) tracks deadlines and reports expirations;
//! followers keep the id → lease map current through the apply pipeline
//! but never expire anything. Deadlines are not persisted: restart and
//! leadership transfer both reset them to `now + ttl`.
//!
//! Expiry itself happens through consensus: the lease tick task proposes
//! a revoke command for each expired lease, and the deletions apply on
//! every member at the same revision.

use crate::core::error::{Error, Result};
use crate::mvcc::LeaseRecord;
use crate::storage::backend::{bucket, Backend, BatchTxGuard};
use parking_lot::RwLock;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One live lease.
#[derive(Debug, Clone)]
pub struct Lease {
    pub id: i64,
    /// Granted TTL in seconds.
    pub ttl: i64,
    /// Expiry deadline; `None` on non-primary lessors.
    expiry: Option<Instant>,
    /// Keys currently attached.
    keys: BTreeSet<Vec<u8>>,
}

impl Lease {
    /// Remaining TTL in whole seconds, rounded up; `-1` when this lessor
    /// does not track deadlines.
    pub fn remaining_secs(&self) -> i64 {
        match self.expiry {
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    0
                } else {
                    (deadline - now).as_secs_f64().ceil() as i64
                }
            }
            None => -1,
        }
    }

    /// Attached keys, sorted.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.keys.iter().cloned().collect()
    }
}

struct LessorInner {
    leases: HashMap<i64, Lease>,
    /// Expiry queue; entries may be stale after a renew and are checked
    /// against the lease before reporting.
    heap: BinaryHeap<Reverse<(Instant, i64)>>,
    primary: bool,
}

/// The lease manager.
pub struct Lessor {
    backend: Arc<Backend>,
    inner: RwLock<LessorInner>,
    min_ttl_secs: i64,
}

impl Lessor {
    /// Create a lessor over `backend`, loading persisted lease records.
    pub fn recover(backend: Arc<Backend>, min_ttl_secs: i64) -> Result<Arc<Lessor>> {
        {
            let mut tx = backend.batch_tx().lock()?;
            tx.create_bucket(bucket::LEASE);
            tx.commit()?;
        }
        let lessor = Arc::new(Lessor {
            backend,
            inner: RwLock::new(LessorInner {
                leases: HashMap::new(),
                heap: BinaryHeap::new(),
                primary: false,
            }),
            min_ttl_secs,
        });
        lessor.reload()?;
        Ok(lessor)
    }

    /// Re-read lease records from the backend after a snapshot install.
    /// Deadlines restart from `now + ttl` on the next promotion.
    pub fn reload(&self) -> Result<()> {
        let mut leases = HashMap::new();
        for (_, value) in self.backend.read_tx()?.scan(bucket::LEASE) {
            let record = LeaseRecord::from_bytes(&value).map_err(|e| Error::Corrupt {
                detail: format!("lease record decode: {e}"),
            })?;
            leases.insert(
                record.id,
                Lease {
                    id: record.id,
                    ttl: record.ttl,
                    expiry: None,
                    keys: record.keys.into_iter().collect(),
                },
            );
        }
        let mut inner = self.inner.write();
        let primary = inner.primary;
        inner.leases = leases;
        inner.heap.clear();
        inner.primary = false;
        drop(inner);
        if primary {
            self.promote();
        }
        Ok(())
    }

    /// Grant a lease, persisting its record through the caller's batch.
    /// The id must already be allocated and non-zero; duplicates are
    /// rejected. Returns the granted TTL.
    pub fn grant(&self, id: i64, ttl: i64, tx: &mut BatchTxGuard<'_>) -> Result<i64> {
        if id == 0 {
            return Err(Error::internal("lease id 0 must be allocated before grant"));
        }
        let ttl = ttl.max(self.min_ttl_secs);
        let mut inner = self.inner.write();
        if inner.leases.contains_key(&id) {
            return Err(Error::LeaseExists { lease_id: id });
        }
        let expiry = inner
            .primary
            .then(|| Instant::now() + Duration::from_secs(ttl as u64));
        if let Some(deadline) = expiry {
            inner.heap.push(Reverse((deadline, id)));
        }
        let lease = Lease {
            id,
            ttl,
            expiry,
            keys: BTreeSet::new(),
        };
        tx.put(bucket::LEASE, &id.to_be_bytes(), &record_of(&lease).to_bytes());
        inner.leases.insert(id, lease);
        Ok(ttl)
    }

    /// Remove a lease through the caller's batch. The attached keys have
    /// already been deleted by the apply pipeline; this drops the record.
    pub fn revoke(&self, id: i64, tx: &mut BatchTxGuard<'_>) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.leases.remove(&id).is_none() {
            return Err(Error::LeaseNotFound { lease_id: id });
        }
        drop(inner);
        tx.delete(bucket::LEASE, &id.to_be_bytes());
        Ok(())
    }

    /// Reset a lease's deadline to `now + ttl`. Primary only; followers
    /// forward renewals to the leader. Returns the remaining TTL.
    pub fn renew(&self, id: i64) -> Result<i64> {
        let mut inner = self.inner.write();
        if !inner.primary {
            return Err(Error::NoLeader);
        }
        let Some(lease) = inner.leases.get_mut(&id) else {
            return Err(Error::LeaseNotFound { lease_id: id });
        };
        let ttl = lease.ttl;
        let deadline = Instant::now() + Duration::from_secs(ttl as u64);
        lease.expiry = Some(deadline);
        inner.heap.push(Reverse((deadline, id)));
        Ok(ttl)
    }

    /// Attach `key` to lease `id`, persisting through the caller's
    /// transaction so the attachment commits with the write it belongs to.
    pub fn attach(&self, id: i64, key: &[u8], tx: &mut BatchTxGuard<'_>) -> Result<()> {
        let mut inner = self.inner.write();
        let Some(lease) = inner.leases.get_mut(&id) else {
            return Err(Error::LeaseNotFound { lease_id: id });
        };
        lease.keys.insert(key.to_vec());
        let record = record_of(lease);
        tx.put(bucket::LEASE, &id.to_be_bytes(), &record.to_bytes());
        Ok(())
    }

    /// Detach `key` from lease `id` through the caller's transaction.
    /// Detaching from an unknown lease is ignored; the key's record is
    /// the authority.
    pub fn detach(&self, id: i64, key: &[u8], tx: &mut BatchTxGuard<'_>) {
        let mut inner = self.inner.write();
        let Some(lease) = inner.leases.get_mut(&id) else {
            tracing::warn!(lease_id = id, "detach from unknown lease");
            return;
        };
        lease.keys.remove(key);
        let record = record_of(lease);
        tx.put(bucket::LEASE, &id.to_be_bytes(), &record.to_bytes());
    }

    /// Look up a lease.
    pub fn get(&self, id: i64) -> Option<Lease> {
        self.inner.read().leases.get(&id).cloned()
    }

    /// Attached keys of `id`.
    pub fn keys(&self, id: i64) -> Result<Vec<Vec<u8>>> {
        self.inner
            .read()
            .leases
            .get(&id)
            .map(Lease::keys)
            .ok_or(Error::LeaseNotFound { lease_id: id })
    }

    /// Ids of every live lease.
    pub fn ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.inner.read().leases.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Whether this lessor tracks deadlines.
    pub fn is_primary(&self) -> bool {
        self.inner.read().primary
    }

    /// Become primary: every deadline resets to `now + ttl`.
    pub fn promote(&self) {
        let mut inner = self.inner.write();
        inner.primary = true;
        inner.heap.clear();
        let now = Instant::now();
        let mut deadlines = Vec::with_capacity(inner.leases.len());
        for lease in inner.leases.values_mut() {
            let deadline = now + Duration::from_secs(lease.ttl as u64);
            lease.expiry = Some(deadline);
            deadlines.push((deadline, lease.id));
        }
        for (deadline, id) in deadlines {
            inner.heap.push(Reverse((deadline, id)));
        }
    }

    /// Stop tracking deadlines.
    pub fn demote(&self) {
        let mut inner = self.inner.write();
        inner.primary = false;
        inner.heap.clear();
        for lease in inner.leases.values_mut() {
            lease.expiry = None;
        }
    }

    /// Pop expired leases. Primary only; the caller proposes a revoke
    /// command for each id returned.
    pub fn tick(&self) -> Vec<i64> {
        let mut inner = self.inner.write();
        if !inner.primary {
            return Vec::new();
        }
        let now = Instant::now();
        let mut expired = Vec::new();
        while let Some(Reverse((deadline, id))) = inner.heap.peek().copied() {
            if deadline > now {
                break;
            }
            inner.heap.pop();
            // Renewals leave stale heap entries behind; trust the lease.
            match inner.leases.get(&id) {
                Some(lease) if lease.expiry.is_some_and(|e| e <= now) => expired.push(id),
                _ => {}
            }
        }
        expired
    }
}

fn record_of(lease: &Lease) -> LeaseRecord {
    LeaseRecord {
        id: lease.id,
        ttl: lease.ttl,
        keys: lease.keys.iter().cloned().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn lessor() -> (Arc<Lessor>, Arc<Backend>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(
            Backend::open(&dir.path().join("db"), 128, Duration::from_millis(50)).unwrap(),
        );
        let lessor = Lessor::recover(Arc::clone(&backend), 1).unwrap();
        (lessor, backend, dir)
    }

    fn grant(lessor: &Lessor, backend: &Backend, id: i64, ttl: i64) -> Result<i64> {
        let mut tx = backend.batch_tx().lock()?;
        let granted = lessor.grant(id, ttl, &mut tx)?;
        tx.unlock()?;
        Ok(granted)
    }

    fn revoke(lessor: &Lessor, backend: &Backend, id: i64) -> Result<()> {
        let mut tx = backend.batch_tx().lock()?;
        lessor.revoke(id, &mut tx)?;
        tx.unlock()
    }

    #[test]
    fn grant_rejects_duplicates() {
        let (lessor, backend, _dir) = lessor();
        assert_eq!(grant(&lessor, &backend, 7, 5).unwrap(), 5);
        assert!(matches!(
            grant(&lessor, &backend, 7, 5),
            Err(Error::LeaseExists { lease_id: 7 })
        ));
    }

    #[test]
    fn grant_clamps_ttl_to_minimum() {
        let (lessor, backend, _dir) = lessor();
        assert_eq!(grant(&lessor, &backend, 1, 0).unwrap(), 1);
    }

    #[test]
    fn revoke_unknown_lease_fails() {
        let (lessor, backend, _dir) = lessor();
        assert!(matches!(
            revoke(&lessor, &backend, 9),
            Err(Error::LeaseNotFound { lease_id: 9 })
        ));
        grant(&lessor, &backend, 9, 5).unwrap();
        revoke(&lessor, &backend, 9).unwrap();
        assert!(matches!(
            revoke(&lessor, &backend, 9),
            Err(Error::LeaseNotFound { lease_id: 9 })
        ));
    }

    #[test]
    fn followers_never_expire() {
        let (lessor, backend, _dir) = lessor();
        grant(&lessor, &backend, 1, 1).unwrap();
        assert!(!lessor.is_primary());
        assert!(lessor.tick().is_empty());
    }

    #[test]
    fn promote_resets_deadlines() {
        let (lessor, backend, _dir) = lessor();
        grant(&lessor, &backend, 1, 60).unwrap();
        lessor.promote();
        let lease = lessor.get(1).unwrap();
        let remaining = lease.remaining_secs();
        assert!(remaining > 0 && remaining <= 60);
        lessor.demote();
        assert_eq!(lessor.get(1).unwrap().remaining_secs(), -1);
    }
}
