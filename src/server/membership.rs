//! Cluster membership records.
//!
//! Members are persisted in the meta bucket and mutated only by applied
//! conf-change entries, so every node sees the same roster at the same
//! log position. The cluster id is derived from the sorted initial
//! membership and never changes.

use crate::core::error::{Error, Result};
use crate::raft::types::{ConfChange, ConfChangeKind, NodeId};
use crate::server::command::ResponseHeader;
use crate::storage::backend::{bucket, Backend, BatchTxGuard};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

const MEMBER_PREFIX: &str = "member/";

/// One cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    /// Address peers use to reach it.
    pub peer_addr: String,
}

/// Response to a membership operation: the roster after the change.
#[derive(Debug, Clone, Default)]
pub struct MemberListResponse {
    pub header: ResponseHeader,
    pub members: Vec<Member>,
}

/// The membership store.
pub struct MemberStore {
    backend: Arc<Backend>,
    cluster_id: u64,
    members: RwLock<BTreeMap<NodeId, Member>>,
}

impl MemberStore {
    /// Open the store, seeding from `initial` when the bucket holds no
    /// members yet.
    pub fn recover(backend: Arc<Backend>, initial: &[Member]) -> Result<Arc<MemberStore>> {
        let mut ids: Vec<NodeId> = initial.iter().map(|m| m.id).collect();
        ids.sort_unstable();
        let cluster_id = cluster_id_of(&ids);

        let mut members = BTreeMap::new();
        for (key, value) in backend.read_tx()?.scan(bucket::META) {
            let Ok(text) = std::str::from_utf8(&key) else {
                continue;
            };
            if text.starts_with(MEMBER_PREFIX) {
                let member: Member = bincode::deserialize(&value).map_err(|e| Error::Corrupt {
                    detail: format!("member record decode: {e}"),
                })?;
                members.insert(member.id, member);
            }
        }
        let store = Arc::new(MemberStore {
            backend,
            cluster_id,
            members: RwLock::new(members),
        });
        if store.members.read().is_empty() {
            let mut tx = store.backend.batch_tx().lock()?;
            for member in initial {
                persist(&mut tx, member)?;
                store.members.write().insert(member.id, member.clone());
            }
            tx.commit()?;
        }
        Ok(store)
    }

    /// The cluster id every response header carries.
    pub fn cluster_id(&self) -> u64 {
        self.cluster_id
    }

    /// Current roster, sorted by id.
    pub fn list(&self) -> Vec<Member> {
        self.members.read().values().cloned().collect()
    }

    /// Whether `id` is a member.
    pub fn contains(&self, id: NodeId) -> bool {
        self.members.read().contains_key(&id)
    }

    /// Validate a proposed change against the current roster.
    pub fn validate(&self, cc: &ConfChange) -> Result<()> {
        let members = self.members.read();
        match cc.kind {
            ConfChangeKind::AddNode => {
                if members.contains_key(&cc.node_id) {
                    return Err(Error::Membership {
                        message: format!("member {} already exists", cc.node_id),
                    });
                }
            }
            ConfChangeKind::RemoveNode | ConfChangeKind::UpdateNode => {
                if !members.contains_key(&cc.node_id) {
                    return Err(Error::Membership {
                        message: format!("member {} not found", cc.node_id),
                    });
                }
            }
        }
        Ok(())
    }

    /// Fold an applied conf change into the roster, persisting through
    /// the caller's batch.
    pub fn apply(&self, cc: &ConfChange, tx: &mut BatchTxGuard<'_>) -> Result<()> {
        match cc.kind {
            ConfChangeKind::AddNode | ConfChangeKind::UpdateNode => {
                let peer_addr = String::from_utf8(cc.context.clone()).map_err(|_| {
                    Error::Membership {
                        message: "peer address is not utf-8".to_string(),
                    }
                })?;
                let member = Member {
                    id: cc.node_id,
                    peer_addr,
                };
                persist(tx, &member)?;
                self.members.write().insert(cc.node_id, member);
            }
            ConfChangeKind::RemoveNode => {
                self.members.write().remove(&cc.node_id);
                tx.delete(
                    bucket::META,
                    format!("{MEMBER_PREFIX}{:016x}", cc.node_id).as_bytes(),
                );
            }
        }
        Ok(())
    }

    /// Re-read the roster from the backend after a snapshot install.
    pub fn reload(&self) -> Result<()> {
        let mut members = BTreeMap::new();
        for (key, value) in self.backend.read_tx()?.scan(bucket::META) {
            let Ok(text) = std::str::from_utf8(&key) else {
                continue;
            };
            if text.starts_with(MEMBER_PREFIX) {
                let member: Member = bincode::deserialize(&value).map_err(|e| Error::Corrupt {
                    detail: format!("member record decode: {e}"),
                })?;
                members.insert(member.id, member);
            }
        }
        *self.members.write() = members;
        Ok(())
    }
}

fn persist(tx: &mut BatchTxGuard<'_>, member: &Member) -> Result<()> {
    let value = bincode::serialize(member)
        .map_err(|e| Error::internal(format!("member record encode: {e}")))?;
    tx.put(
        bucket::META,
        format!("{MEMBER_PREFIX}{:016x}", member.id).as_bytes(),
        &value,
    );
    Ok(())
}

/// Deterministic cluster id from the sorted founding member ids.
fn cluster_id_of(sorted_ids: &[NodeId]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for id in sorted_ids {
        for b in id.to_be_bytes() {
            hash ^= u64::from(b);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_id_depends_on_membership_only() {
        assert_eq!(cluster_id_of(&[1, 2, 3]), cluster_id_of(&[1, 2, 3]));
        assert_ne!(cluster_id_of(&[1, 2, 3]), cluster_id_of(&[1, 2, 4]));
    }
}
