//! The replicated command envelope and the typed request surface.
//!
//! Every mutating client request becomes exactly one [`RaftCommand`]
//! carried in one log entry. The envelope encoding must be deterministic:
//! every member decodes and applies the same bytes.

use crate::core::error::{Error, Result};
use crate::mvcc::store::{RangeOptions, SortOrder, SortTarget};
use crate::mvcc::KeyValue;
use serde::{Deserialize, Serialize};

/// Header attached to every response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseHeader {
    pub cluster_id: u64,
    pub member_id: u64,
    /// Store revision when the response was produced.
    pub revision: i64,
    pub raft_term: u64,
}

/// One replicated command with its cluster-unique request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftCommand {
    pub id: u64,
    pub op: CommandOp,
}

impl RaftCommand {
    /// Deterministic envelope encoding for the log entry payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::internal(format!("command encode: {e}")))
    }

    /// Decode a log entry payload.
    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| Error::internal(format!("command decode: {e}")))
    }
}

/// A membership change wrapped with its request id, carried in
/// conf-change entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfChangeCommand {
    pub id: u64,
    pub cc: crate::raft::types::ConfChange,
}

/// Every operation the apply pipeline understands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CommandOp {
    Range(RangeRequest),
    Put(PutRequest),
    DeleteRange(DeleteRangeRequest),
    Txn(TxnRequest),
    Compaction(CompactionRequest),
    LeaseGrant(LeaseGrantRequest),
    LeaseRevoke(LeaseRevokeRequest),
    AuthEnable,
    AuthDisable,
    Authenticate(AuthenticateRequest),
    UserAdd(UserAddRequest),
    UserDelete(UserDeleteRequest),
    UserChangePassword(UserChangePasswordRequest),
    UserGrantRole(UserGrantRoleRequest),
    UserRevokeRole(UserRevokeRoleRequest),
    RoleAdd(RoleAddRequest),
    RoleDelete(RoleDeleteRequest),
    RoleGrantPermission(RoleGrantPermissionRequest),
    RoleRevokePermission(RoleRevokePermissionRequest),
}

/// Range read. `range_end` follows the wire conventions: empty for a
/// single key, `[0]` for from-key, anything else a half-open bound.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RangeRequest {
    pub key: Vec<u8>,
    pub range_end: Vec<u8>,
    /// `0` is unbounded.
    pub limit: i64,
    /// `0` means latest.
    pub revision: i64,
    pub sort_order: SortOrder,
    pub sort_target: SortTarget,
    /// Serve from local applied state without a read fence.
    pub serializable: bool,
    pub count_only: bool,
    pub keys_only: bool,
}

impl RangeRequest {
    /// The store-level read options.
    pub fn options(&self) -> RangeOptions {
        RangeOptions {
            limit: self.limit,
            rev: self.revision,
            sort_order: self.sort_order,
            sort_target: self.sort_target,
            count_only: self.count_only,
            keys_only: self.keys_only,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RangeResponse {
    pub header: ResponseHeader,
    pub kvs: Vec<KeyValue>,
    pub count: i64,
    pub more: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PutRequest {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Lease to attach; `0` clears any attachment.
    pub lease: i64,
    /// Return the record this put replaced.
    pub prev_kv: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PutResponse {
    pub header: ResponseHeader,
    pub prev_kv: Option<KeyValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteRangeRequest {
    pub key: Vec<u8>,
    pub range_end: Vec<u8>,
    pub prev_kv: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteRangeResponse {
    pub header: ResponseHeader,
    pub deleted: i64,
    pub prev_kvs: Vec<KeyValue>,
}

/// Compare predicate of a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compare {
    pub key: Vec<u8>,
    pub target: CompareTarget,
    pub result: CompareResult,
}

/// What of the key to compare. Comparing the value of an absent key
/// always fails; revision and version targets compare against 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CompareTarget {
    Value(Vec<u8>),
    CreateRevision(i64),
    ModRevision(i64),
    Version(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareResult {
    Equal,
    NotEqual,
    Greater,
    Less,
}

/// One branch operation of a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestOp {
    Range(RangeRequest),
    Put(PutRequest),
    DeleteRange(DeleteRangeRequest),
}

/// Compare-and-branch transaction. The compares form a conjunction
/// evaluated at the pre-transaction revision; the selected branch
/// executes atomically under one revision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxnRequest {
    pub compare: Vec<Compare>,
    pub success: Vec<RequestOp>,
    pub failure: Vec<RequestOp>,
}

#[derive(Debug, Clone, Default)]
pub struct TxnResponse {
    pub header: ResponseHeader,
    pub succeeded: bool,
    pub responses: Vec<OpResponse>,
}

/// Response of one transaction branch operation.
#[derive(Debug, Clone)]
pub enum OpResponse {
    Range(RangeResponse),
    Put(PutResponse),
    DeleteRange(DeleteRangeResponse),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompactionRequest {
    pub revision: i64,
    /// Wait for physical removal before responding.
    pub physical: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CompactionResponse {
    pub header: ResponseHeader,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaseGrantRequest {
    /// Requested id; `0` asks the server to allocate one.
    pub id: i64,
    pub ttl: i64,
}

#[derive(Debug, Clone, Default)]
pub struct LeaseGrantResponse {
    pub header: ResponseHeader,
    pub id: i64,
    /// Granted TTL in seconds.
    pub ttl: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaseRevokeRequest {
    pub id: i64,
}

#[derive(Debug, Clone, Default)]
pub struct LeaseRevokeResponse {
    pub header: ResponseHeader,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthenticateRequest {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Clone, Default)]
pub struct AuthenticateResponse {
    pub header: ResponseHeader,
    pub token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserAddRequest {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserDeleteRequest {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserChangePasswordRequest {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserGrantRoleRequest {
    pub user: String,
    pub role: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserRevokeRoleRequest {
    pub user: String,
    pub role: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleAddRequest {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleDeleteRequest {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleGrantPermissionRequest {
    pub role: String,
    pub perm: crate::server::auth::Permission,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleRevokePermissionRequest {
    pub role: String,
    pub key: Vec<u8>,
    pub range_end: Vec<u8>,
}

/// A generic acknowledgment for auth and role bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct AckResponse {
    pub header: ResponseHeader,
}

/// Result of applying one command.
#[derive(Debug, Clone)]
pub enum CommandResponse {
    Range(RangeResponse),
    Put(PutResponse),
    DeleteRange(DeleteRangeResponse),
    Txn(TxnResponse),
    Compaction(CompactionResponse),
    LeaseGrant(LeaseGrantResponse),
    LeaseRevoke(LeaseRevokeResponse),
    Authenticate(AuthenticateResponse),
    Ack(AckResponse),
    /// Membership change acknowledgment carrying the member list.
    Membership(crate::server::membership::MemberListResponse),
}

impl CommandResponse {
    /// The response header, whatever the variant.
    pub fn header(&self) -> &ResponseHeader {
        match self {
            Self::Range(r) => &r.header,
            Self::Put(r) => &r.header,
            Self::DeleteRange(r) => &r.header,
            Self::Txn(r) => &r.header,
            Self::Compaction(r) => &r.header,
            Self::LeaseGrant(r) => &r.header,
            Self::LeaseRevoke(r) => &r.header,
            Self::Authenticate(r) => &r.header,
            Self::Ack(r) => &r.header,
            Self::Membership(r) => &r.header,
        }
    }

    /// Stamp cluster identity and term onto the header.
    pub fn fill_header(&mut self, cluster_id: u64, member_id: u64, raft_term: u64) {
        let header = match self {
            Self::Range(r) => &mut r.header,
            Self::Put(r) => &mut r.header,
            Self::DeleteRange(r) => &mut r.header,
            Self::Txn(r) => &mut r.header,
            Self::Compaction(r) => &mut r.header,
            Self::LeaseGrant(r) => &mut r.header,
            Self::LeaseRevoke(r) => &mut r.header,
            Self::Authenticate(r) => &mut r.header,
            Self::Ack(r) => &mut r.header,
            Self::Membership(r) => &mut r.header,
        };
        header.cluster_id = cluster_id;
        header.member_id = member_id;
        header.raft_term = raft_term;
    }
}
