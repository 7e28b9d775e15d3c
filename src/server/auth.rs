//! Users, roles, and key-range permissions.
//!
//! All mutations arrive through the apply pipeline, so every member holds
//! the same records. Tokens are derived deterministically from the apply
//! index, which keeps the token table identical across members as well.
//!
//! Permission checks go through a per-user cache of flattened role
//! permissions. Any user or role mutation clears the entire cache; the
//! coarse invalidation is deliberate and correct, eviction granularity
//! was never worth the bookkeeping.

use crate::core::error::{Error, Result};
use crate::mvcc::KeyRange;
use crate::storage::backend::{bucket, Backend, BatchTxGuard};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

const ENABLED_KEY: &[u8] = b"enabled";
const USER_PREFIX: &str = "user/";
const ROLE_PREFIX: &str = "role/";

/// Access level of a permission grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionType {
    Read,
    Write,
    ReadWrite,
}

impl PermissionType {
    fn allows(self, need: PermissionType) -> bool {
        match (self, need) {
            (Self::ReadWrite, _) => true,
            (Self::Read, Self::Read) => true,
            (Self::Write, Self::Write) => true,
            _ => false,
        }
    }
}

/// A key-range permission attached to a role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permission {
    pub key: Vec<u8>,
    pub range_end: Vec<u8>,
    pub perm_type: PermissionType,
}

impl Default for Permission {
    fn default() -> Self {
        Self {
            key: Vec::new(),
            range_end: Vec::new(),
            perm_type: PermissionType::Read,
        }
    }
}

/// A user record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub password_hash: String,
    pub roles: BTreeSet<String>,
}

/// A role record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub permissions: Vec<Permission>,
}

struct AuthInner {
    enabled: bool,
    users: HashMap<String, User>,
    roles: HashMap<String, Role>,
    /// token → user name.
    tokens: HashMap<String, String>,
    /// user → flattened permissions, rebuilt lazily after invalidation.
    perm_cache: HashMap<String, Vec<(KeyRange, PermissionType)>>,
}

/// The auth store.
pub struct AuthStore {
    backend: Arc<Backend>,
    inner: RwLock<AuthInner>,
}

impl AuthStore {
    /// Open the store over `backend`, loading persisted records.
    pub fn recover(backend: Arc<Backend>) -> Result<Arc<AuthStore>> {
        {
            let mut tx = backend.batch_tx().lock()?;
            tx.create_bucket(bucket::AUTH);
            tx.commit()?;
        }
        let store = Arc::new(AuthStore {
            backend,
            inner: RwLock::new(AuthInner {
                enabled: false,
                users: HashMap::new(),
                roles: HashMap::new(),
                tokens: HashMap::new(),
                perm_cache: HashMap::new(),
            }),
        });
        store.reload()?;
        Ok(store)
    }

    /// Re-read records from the backend, e.g. after a snapshot install.
    pub fn reload(&self) -> Result<()> {
        let mut users = HashMap::new();
        let mut roles = HashMap::new();
        let mut enabled = false;
        for (key, value) in self.backend.read_tx()?.scan(bucket::AUTH) {
            if key == ENABLED_KEY {
                enabled = value == [1];
            } else if let Ok(text) = std::str::from_utf8(&key) {
                if let Some(name) = text.strip_prefix(USER_PREFIX) {
                    let user: User = decode(&value)?;
                    users.insert(name.to_string(), user);
                } else if let Some(name) = text.strip_prefix(ROLE_PREFIX) {
                    let role: Role = decode(&value)?;
                    roles.insert(name.to_string(), role);
                }
            }
        }
        let mut inner = self.inner.write();
        inner.enabled = enabled;
        inner.users = users;
        inner.roles = roles;
        inner.tokens.clear();
        inner.perm_cache.clear();
        Ok(())
    }

    /// Whether permission checks are in force.
    pub fn is_enabled(&self) -> bool {
        self.inner.read().enabled
    }

    /// Turn authentication on. Requires a root user.
    pub fn enable(&self, tx: &mut BatchTxGuard<'_>) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.users.contains_key("root") {
            return Err(Error::AuthFailed {
                message: "root user does not exist".to_string(),
            });
        }
        inner.enabled = true;
        inner.perm_cache.clear();
        drop(inner);
        persist_enabled(tx, true);
        Ok(())
    }

    /// Turn authentication off and invalidate every token.
    pub fn disable(&self, tx: &mut BatchTxGuard<'_>) -> Result<()> {
        let mut inner = self.inner.write();
        inner.enabled = false;
        inner.tokens.clear();
        inner.perm_cache.clear();
        drop(inner);
        persist_enabled(tx, false);
        Ok(())
    }

    /// Verify a password and mint a token. `apply_index` keys the token
    /// so every member mints the same one.
    pub fn authenticate(&self, name: &str, password: &str, apply_index: u64) -> Result<String> {
        let mut inner = self.inner.write();
        let Some(user) = inner.users.get(name) else {
            return Err(Error::AuthFailed {
                message: "authentication failed".to_string(),
            });
        };
        if user.password_hash != hash_password(name, password) {
            return Err(Error::AuthFailed {
                message: "authentication failed".to_string(),
            });
        }
        let token = format!("{name}.{apply_index}");
        inner.tokens.insert(token.clone(), name.to_string());
        Ok(token)
    }

    /// Resolve a token to its user.
    pub fn user_of_token(&self, token: &str) -> Option<String> {
        self.inner.read().tokens.get(token).cloned()
    }

    /// Add a user.
    pub fn user_add(&self, name: &str, password: &str, tx: &mut BatchTxGuard<'_>) -> Result<()> {
        if name.is_empty() {
            return Err(Error::AuthFailed {
                message: "empty user name".to_string(),
            });
        }
        let mut inner = self.inner.write();
        if inner.users.contains_key(name) {
            return Err(Error::AuthFailed {
                message: format!("user {name} already exists"),
            });
        }
        let user = User {
            name: name.to_string(),
            password_hash: hash_password(name, password),
            roles: BTreeSet::new(),
        };
        persist_user(tx, &user)?;
        inner.users.insert(name.to_string(), user);
        inner.perm_cache.clear();
        Ok(())
    }

    /// Delete a user.
    pub fn user_delete(&self, name: &str, tx: &mut BatchTxGuard<'_>) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.users.remove(name).is_none() {
            return Err(Error::AuthFailed {
                message: format!("user {name} does not exist"),
            });
        }
        inner.tokens.retain(|_, user| user != name);
        inner.perm_cache.clear();
        drop(inner);
        tx.delete(bucket::AUTH, format!("{USER_PREFIX}{name}").as_bytes());
        Ok(())
    }

    /// Replace a user's password and revoke their tokens.
    pub fn user_change_password(
        &self,
        name: &str,
        password: &str,
        tx: &mut BatchTxGuard<'_>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let Some(user) = inner.users.get_mut(name) else {
            return Err(Error::AuthFailed {
                message: format!("user {name} does not exist"),
            });
        };
        user.password_hash = hash_password(name, password);
        let user = user.clone();
        inner.tokens.retain(|_, u| u != name);
        inner.perm_cache.clear();
        drop(inner);
        persist_user(tx, &user)
    }

    /// Grant a role to a user.
    pub fn user_grant_role(&self, name: &str, role: &str, tx: &mut BatchTxGuard<'_>) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.roles.contains_key(role) {
            return Err(Error::AuthFailed {
                message: format!("role {role} does not exist"),
            });
        }
        let Some(user) = inner.users.get_mut(name) else {
            return Err(Error::AuthFailed {
                message: format!("user {name} does not exist"),
            });
        };
        user.roles.insert(role.to_string());
        let user = user.clone();
        inner.perm_cache.clear();
        drop(inner);
        persist_user(tx, &user)
    }

    /// Revoke a role from a user.
    pub fn user_revoke_role(
        &self,
        name: &str,
        role: &str,
        tx: &mut BatchTxGuard<'_>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let Some(user) = inner.users.get_mut(name) else {
            return Err(Error::AuthFailed {
                message: format!("user {name} does not exist"),
            });
        };
        user.roles.remove(role);
        let user = user.clone();
        inner.perm_cache.clear();
        drop(inner);
        persist_user(tx, &user)
    }

    /// Add a role.
    pub fn role_add(&self, name: &str, tx: &mut BatchTxGuard<'_>) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.roles.contains_key(name) {
            return Err(Error::AuthFailed {
                message: format!("role {name} already exists"),
            });
        }
        let role = Role {
            name: name.to_string(),
            permissions: Vec::new(),
        };
        persist_role(tx, &role)?;
        inner.roles.insert(name.to_string(), role);
        Ok(())
    }

    /// Delete a role and detach it from every user.
    pub fn role_delete(&self, name: &str, tx: &mut BatchTxGuard<'_>) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.roles.remove(name).is_none() {
            return Err(Error::AuthFailed {
                message: format!("role {name} does not exist"),
            });
        }
        let mut touched = Vec::new();
        for user in inner.users.values_mut() {
            if user.roles.remove(name) {
                touched.push(user.clone());
            }
        }
        inner.perm_cache.clear();
        drop(inner);
        tx.delete(bucket::AUTH, format!("{ROLE_PREFIX}{name}").as_bytes());
        for user in touched {
            persist_user(tx, &user)?;
        }
        Ok(())
    }

    /// Grant a key-range permission to a role. Granting over an existing
    /// range replaces its access level.
    pub fn role_grant_permission(
        &self,
        name: &str,
        perm: Permission,
        tx: &mut BatchTxGuard<'_>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let Some(role) = inner.roles.get_mut(name) else {
            return Err(Error::AuthFailed {
                message: format!("role {name} does not exist"),
            });
        };
        role.permissions
            .retain(|p| !(p.key == perm.key && p.range_end == perm.range_end));
        role.permissions.push(perm);
        let role = role.clone();
        inner.perm_cache.clear();
        drop(inner);
        persist_role(tx, &role)
    }

    /// Revoke a key-range permission from a role.
    pub fn role_revoke_permission(
        &self,
        name: &str,
        key: &[u8],
        range_end: &[u8],
        tx: &mut BatchTxGuard<'_>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let Some(role) = inner.roles.get_mut(name) else {
            return Err(Error::AuthFailed {
                message: format!("role {name} does not exist"),
            });
        };
        let before = role.permissions.len();
        role.permissions
            .retain(|p| !(p.key == key && p.range_end == range_end));
        if role.permissions.len() == before {
            return Err(Error::AuthFailed {
                message: "permission not granted to the role".to_string(),
            });
        }
        let role = role.clone();
        inner.perm_cache.clear();
        drop(inner);
        persist_role(tx, &role)
    }

    /// Check that `user` may perform `need` over `range`. Root bypasses.
    pub fn check(&self, user: &str, range: &KeyRange, need: PermissionType) -> Result<()> {
        if !self.is_enabled() || user == "root" {
            return Ok(());
        }
        {
            let inner = self.inner.read();
            if let Some(perms) = inner.perm_cache.get(user) {
                return check_cached(perms, range, need);
            }
        }
        let mut inner = self.inner.write();
        let Some(record) = inner.users.get(user) else {
            return Err(Error::PermissionDenied {
                message: format!("user {user} does not exist"),
            });
        };
        let mut perms = Vec::new();
        for role_name in &record.roles {
            if let Some(role) = inner.roles.get(role_name) {
                for p in &role.permissions {
                    perms.push((
                        KeyRange::canonicalize(p.key.clone(), p.range_end.clone()),
                        p.perm_type,
                    ));
                }
            }
        }
        let result = check_cached(&perms, range, need);
        inner.perm_cache.insert(user.to_string(), perms);
        result
    }
}

fn persist_user(tx: &mut BatchTxGuard<'_>, user: &User) -> Result<()> {
    tx.put(
        bucket::AUTH,
        format!("{USER_PREFIX}{}", user.name).as_bytes(),
        &encode(user)?,
    );
    Ok(())
}

fn persist_role(tx: &mut BatchTxGuard<'_>, role: &Role) -> Result<()> {
    tx.put(
        bucket::AUTH,
        format!("{ROLE_PREFIX}{}", role.name).as_bytes(),
        &encode(role)?,
    );
    Ok(())
}

fn persist_enabled(tx: &mut BatchTxGuard<'_>, enabled: bool) {
    tx.put(bucket::AUTH, ENABLED_KEY, &[u8::from(enabled)]);
}

fn check_cached(
    perms: &[(KeyRange, PermissionType)],
    range: &KeyRange,
    need: PermissionType,
) -> crate::core::error::Result<()> {
    let covered = perms
        .iter()
        .any(|(granted, level)| level.allows(need) && covers(granted, range));
    if covered {
        Ok(())
    } else {
        Err(Error::PermissionDenied {
            message: "permission denied".to_string(),
        })
    }
}

/// Whether `granted` covers every key of `requested`.
fn covers(granted: &KeyRange, requested: &KeyRange) -> bool {
    match requested {
        KeyRange::Single(key) => granted.contains(key),
        KeyRange::HalfOpen { begin, end } => match granted {
            KeyRange::Single(_) => false,
            KeyRange::HalfOpen {
                begin: gb,
                end: ge,
            } => gb.as_slice() <= begin.as_slice() && ge.as_slice() >= end.as_slice(),
            KeyRange::FromKey(gb) => gb.as_slice() <= begin.as_slice(),
        },
        KeyRange::FromKey(begin) => match granted {
            KeyRange::FromKey(gb) => gb.as_slice() <= begin.as_slice(),
            _ => false,
        },
    }
}

/// Salted FNV-1a fingerprint; stands in for a real password KDF.
fn hash_password(name: &str, password: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in name
        .as_bytes()
        .iter()
        .chain(b"\0".iter())
        .chain(password.as_bytes())
    {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    format!("{hash:016x}")
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::internal(format!("auth record encode: {e}")))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Corrupt {
        detail: format!("auth record decode: {e}"),
    })
}
