//! The apply pipeline.
//!
//! A single task interprets committed commands in log order. Each command
//! produces a result for its proposal waiter and, for mutations, the
//! events the watcher hub dispatches. Command-level failures are part of
//! the result and never abort the pipeline; the committed entry stands on
//! every member either way.

use crate::core::error::{Error, Result};
use crate::lease::Lessor;
use crate::mvcc::revision::Revision;
use crate::mvcc::store::{KvStore, WriteTxn};
use crate::mvcc::{KeyRange, KeyValue};
use crate::server::auth::AuthStore;
use crate::server::command::{
    AckResponse, AuthenticateResponse, CommandOp, CommandResponse, CompactionResponse, Compare,
    CompareResult, CompareTarget, DeleteRangeRequest, DeleteRangeResponse, LeaseGrantRequest,
    LeaseGrantResponse, LeaseRevokeResponse, OpResponse, PutRequest, PutResponse, RaftCommand,
    RangeRequest, RangeResponse, RequestOp, ResponseHeader, TxnRequest, TxnResponse,
};
use crate::storage::backend::{bucket, Backend, BatchTxGuard};
use crate::watch::WatcherHub;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Meta-bucket key tracking the highest applied log index.
pub const META_CONSISTENT_INDEX: &[u8] = b"consistentIndex";

/// Physical removal work handed to the compaction worker.
#[derive(Debug)]
pub struct CompactionJob {
    pub removals: Vec<(Revision, bool)>,
}

/// The command interpreter.
pub struct Applier {
    backend: Arc<Backend>,
    store: Arc<KvStore>,
    lessor: Arc<Lessor>,
    auth: Arc<AuthStore>,
    hub: Arc<WatcherHub>,
    compaction_tx: mpsc::Sender<CompactionJob>,
}

impl Applier {
    pub fn new(
        backend: Arc<Backend>,
        store: Arc<KvStore>,
        lessor: Arc<Lessor>,
        auth: Arc<AuthStore>,
        hub: Arc<WatcherHub>,
        compaction_tx: mpsc::Sender<CompactionJob>,
    ) -> Self {
        Self {
            backend,
            store,
            lessor,
            auth,
            hub,
            compaction_tx,
        }
    }

    /// Apply one committed command at log `index`.
    ///
    /// The whole command runs inside one batch critical section: its
    /// mutations and the applied-cursor bump stage together and land in
    /// the same journal record, so a crash can never separate an effect
    /// from the cursor that marks it applied.
    pub fn apply(&self, index: u64, cmd: &RaftCommand) -> Result<CommandResponse> {
        let tx = self.backend.batch_tx();
        let mut batch = tx.lock()?;
        let result = match &cmd.op {
            CommandOp::Range(req) => self.apply_range(req),
            CommandOp::Put(req) => self.apply_put(&mut batch, req),
            CommandOp::DeleteRange(req) => self.apply_delete_range(&mut batch, req),
            CommandOp::Txn(req) => self.apply_txn(&mut batch, req),
            CommandOp::Compaction(req) => self.apply_compaction(&mut batch, req.revision),
            CommandOp::LeaseGrant(req) => self.apply_lease_grant(&mut batch, req),
            CommandOp::LeaseRevoke(req) => self.apply_lease_revoke(&mut batch, req.id),
            CommandOp::AuthEnable => self.auth.enable(&mut batch).map(|()| self.ack()),
            CommandOp::AuthDisable => self.auth.disable(&mut batch).map(|()| self.ack()),
            CommandOp::Authenticate(req) => self
                .auth
                .authenticate(&req.name, &req.password, index)
                .map(|token| {
                    CommandResponse::Authenticate(AuthenticateResponse {
                        header: self.header(),
                        token,
                    })
                }),
            CommandOp::UserAdd(req) => self
                .auth
                .user_add(&req.name, &req.password, &mut batch)
                .map(|()| self.ack()),
            CommandOp::UserDelete(req) => self
                .auth
                .user_delete(&req.name, &mut batch)
                .map(|()| self.ack()),
            CommandOp::UserChangePassword(req) => self
                .auth
                .user_change_password(&req.name, &req.password, &mut batch)
                .map(|()| self.ack()),
            CommandOp::UserGrantRole(req) => self
                .auth
                .user_grant_role(&req.user, &req.role, &mut batch)
                .map(|()| self.ack()),
            CommandOp::UserRevokeRole(req) => self
                .auth
                .user_revoke_role(&req.user, &req.role, &mut batch)
                .map(|()| self.ack()),
            CommandOp::RoleAdd(req) => {
                self.auth.role_add(&req.name, &mut batch).map(|()| self.ack())
            }
            CommandOp::RoleDelete(req) => self
                .auth
                .role_delete(&req.name, &mut batch)
                .map(|()| self.ack()),
            CommandOp::RoleGrantPermission(req) => self
                .auth
                .role_grant_permission(&req.role, req.perm.clone(), &mut batch)
                .map(|()| self.ack()),
            CommandOp::RoleRevokePermission(req) => self
                .auth
                .role_revoke_permission(&req.role, &req.key, &req.range_end, &mut batch)
                .map(|()| self.ack()),
        };
        batch.put(bucket::META, META_CONSISTENT_INDEX, &index.to_be_bytes());
        batch.unlock()?;
        result
    }

    /// Persist the applied cursor on its own, for paths (snapshot
    /// install) whose effects were already made durable separately.
    pub fn record_applied(&self, index: u64) -> Result<()> {
        let mut tx = self.backend.batch_tx().lock()?;
        tx.put(bucket::META, META_CONSISTENT_INDEX, &index.to_be_bytes());
        tx.unlock()
    }

    fn header(&self) -> ResponseHeader {
        ResponseHeader {
            revision: self.store.current_revision(),
            ..Default::default()
        }
    }

    fn ack(&self) -> CommandResponse {
        CommandResponse::Ack(AckResponse {
            header: self.header(),
        })
    }

    fn apply_range(&self, req: &RangeRequest) -> Result<CommandResponse> {
        let range = KeyRange::canonicalize(req.key.clone(), req.range_end.clone());
        let read = self.store.read_tx()?;
        let result = read.range(&range, &req.options())?;
        Ok(CommandResponse::Range(RangeResponse {
            header: ResponseHeader {
                revision: result.rev,
                ..Default::default()
            },
            kvs: result.kvs,
            count: result.count as i64,
            more: result.more,
        }))
    }

    fn apply_put(
        &self,
        batch: &mut BatchTxGuard<'_>,
        req: &PutRequest,
    ) -> Result<CommandResponse> {
        if req.lease != 0 && self.lessor.get(req.lease).is_none() {
            return Err(Error::LeaseNotFound {
                lease_id: req.lease,
            });
        }
        let mut txn = self.store.write_tx(batch)?;
        txn.put(&req.key, &req.value, req.lease)?;
        let (rev, events) = txn.end();
        let prev_kv = req
            .prev_kv
            .then(|| events.first().and_then(|e| e.prev_kv.clone()))
            .flatten();
        self.hub.notify(rev, &events);
        Ok(CommandResponse::Put(PutResponse {
            header: ResponseHeader {
                revision: rev,
                ..Default::default()
            },
            prev_kv,
        }))
    }

    fn apply_delete_range(
        &self,
        batch: &mut BatchTxGuard<'_>,
        req: &DeleteRangeRequest,
    ) -> Result<CommandResponse> {
        let range = KeyRange::canonicalize(req.key.clone(), req.range_end.clone());
        let mut txn = self.store.write_tx(batch)?;
        let (deleted, _) = txn.delete_range(&range)?;
        let (rev, events) = txn.end();
        let prev_kvs = if req.prev_kv {
            events.iter().filter_map(|e| e.prev_kv.clone()).collect()
        } else {
            Vec::new()
        };
        self.hub.notify(rev, &events);
        Ok(CommandResponse::DeleteRange(DeleteRangeResponse {
            header: ResponseHeader {
                revision: rev,
                ..Default::default()
            },
            deleted,
            prev_kvs,
        }))
    }

    fn apply_txn(
        &self,
        batch: &mut BatchTxGuard<'_>,
        req: &TxnRequest,
    ) -> Result<CommandResponse> {
        let mut txn = self.store.write_tx(batch)?;
        // Compares see the pre-transaction state: nothing has been
        // staged yet, so reads resolve at the previous revision.
        let succeeded = req.compare.iter().all(|c| eval_compare(&txn, c));
        let branch = if succeeded { &req.success } else { &req.failure };

        // Every lease the branch references must be live before any of
        // it executes; a branch is all-or-nothing.
        for op in branch {
            if let RequestOp::Put(put) = op {
                if put.lease != 0 && self.lessor.get(put.lease).is_none() {
                    return Err(Error::LeaseNotFound {
                        lease_id: put.lease,
                    });
                }
            }
        }

        let mut responses = Vec::with_capacity(branch.len());
        for op in branch {
            responses.push(self.apply_txn_op(&mut txn, op)?);
        }
        let (rev, events) = txn.end();
        self.hub.notify(rev, &events);

        let header = ResponseHeader {
            revision: rev,
            ..Default::default()
        };
        for r in responses.iter_mut() {
            match r {
                OpResponse::Range(x) => x.header.revision = rev,
                OpResponse::Put(x) => x.header.revision = rev,
                OpResponse::DeleteRange(x) => x.header.revision = rev,
            }
        }
        Ok(CommandResponse::Txn(TxnResponse {
            header,
            succeeded,
            responses,
        }))
    }

    fn apply_txn_op(
        &self,
        txn: &mut WriteTxn<'_, '_, '_>,
        op: &RequestOp,
    ) -> Result<OpResponse> {
        match op {
            RequestOp::Range(req) => {
                let range = KeyRange::canonicalize(req.key.clone(), req.range_end.clone());
                let result = txn.range(&range, &req.options())?;
                Ok(OpResponse::Range(RangeResponse {
                    header: ResponseHeader::default(),
                    kvs: result.kvs,
                    count: result.count as i64,
                    more: result.more,
                }))
            }
            RequestOp::Put(req) => {
                txn.put(&req.key, &req.value, req.lease)?;
                Ok(OpResponse::Put(PutResponse::default()))
            }
            RequestOp::DeleteRange(req) => {
                let range = KeyRange::canonicalize(req.key.clone(), req.range_end.clone());
                let (deleted, _) = txn.delete_range(&range)?;
                Ok(OpResponse::DeleteRange(DeleteRangeResponse {
                    header: ResponseHeader::default(),
                    deleted,
                    prev_kvs: Vec::new(),
                }))
            }
        }
    }

    fn apply_compaction(
        &self,
        batch: &mut BatchTxGuard<'_>,
        revision: i64,
    ) -> Result<CommandResponse> {
        let removals = self.store.compact(revision, batch)?;
        if !removals.is_empty() {
            let job = CompactionJob { removals };
            if let Err(mpsc::error::TrySendError::Full(job)) = self.compaction_tx.try_send(job) {
                // Worker saturated; stage the removals into the open
                // section rather than dropping them.
                for (rev, tombstone) in &job.removals {
                    batch.delete(bucket::KEY, &rev.encode(*tombstone));
                }
            }
        }
        Ok(CommandResponse::Compaction(CompactionResponse {
            header: self.header(),
        }))
    }

    fn apply_lease_grant(
        &self,
        batch: &mut BatchTxGuard<'_>,
        req: &LeaseGrantRequest,
    ) -> Result<CommandResponse> {
        let ttl = self.lessor.grant(req.id, req.ttl, batch)?;
        Ok(CommandResponse::LeaseGrant(LeaseGrantResponse {
            header: self.header(),
            id: req.id,
            ttl,
        }))
    }

    fn apply_lease_revoke(
        &self,
        batch: &mut BatchTxGuard<'_>,
        id: i64,
    ) -> Result<CommandResponse> {
        // Delete every attached key under one revision, then drop the
        // lease record, all in the same section.
        let keys = self.lessor.keys(id)?;
        let mut txn = self.store.write_tx(batch)?;
        for key in &keys {
            txn.delete_range(&KeyRange::Single(key.clone()))?;
        }
        let (rev, events) = txn.end();
        self.hub.notify(rev, &events);
        self.lessor.revoke(id, batch)?;
        Ok(CommandResponse::LeaseRevoke(LeaseRevokeResponse {
            header: ResponseHeader {
                revision: rev,
                ..Default::default()
            },
        }))
    }
}

/// Evaluate one compare predicate against the pre-transaction state.
fn eval_compare(txn: &WriteTxn<'_, '_, '_>, compare: &Compare) -> bool {
    let kv = read_one(txn, &compare.key);
    match &compare.target {
        CompareTarget::Value(expected) => match &kv {
            // Comparing the value of an absent key always fails.
            None => false,
            Some(kv) => ordered(kv.value.as_slice().cmp(expected.as_slice()), compare.result),
        },
        CompareTarget::CreateRevision(expected) => ordered(
            kv.as_ref().map(|kv| kv.create_revision).unwrap_or(0).cmp(expected),
            compare.result,
        ),
        CompareTarget::ModRevision(expected) => ordered(
            kv.as_ref().map(|kv| kv.mod_revision).unwrap_or(0).cmp(expected),
            compare.result,
        ),
        CompareTarget::Version(expected) => ordered(
            kv.as_ref().map(|kv| kv.version).unwrap_or(0).cmp(expected),
            compare.result,
        ),
    }
}

fn read_one(txn: &WriteTxn<'_, '_, '_>, key: &[u8]) -> Option<KeyValue> {
    let range = KeyRange::Single(key.to_vec());
    txn.range(&range, &Default::default())
        .ok()
        .and_then(|r| r.kvs.into_iter().next())
}

fn ordered(ord: std::cmp::Ordering, want: CompareResult) -> bool {
    match want {
        CompareResult::Equal => ord.is_eq(),
        CompareResult::NotEqual => ord.is_ne(),
        CompareResult::Greater => ord.is_gt(),
        CompareResult::Less => ord.is_lt(),
    }
}
