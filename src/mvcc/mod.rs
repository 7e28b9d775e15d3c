//! Multi-version key-value storage: the revision model, the in-memory
//! revision index, the durable record encodings, and the store itself.

pub mod index;
pub mod keyvalue;
pub mod revision;
pub mod store;

pub use keyvalue::{KeyValue, LeaseRecord};
pub use revision::Revision;

use serde::{Deserialize, Serialize};

/// A canonical key range. Requests arrive with `range_end` conventions
/// (`""` for a single key, `"\0"` for from-key); they are canonicalized
/// into this form once, at the edge, before reaching the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyRange {
    /// Exactly one key.
    Single(Vec<u8>),
    /// Half-open interval `[begin, end)`.
    HalfOpen { begin: Vec<u8>, end: Vec<u8> },
    /// Every key at or after `begin`.
    FromKey(Vec<u8>),
}

impl KeyRange {
    /// Canonicalize a request's `(key, range_end)` pair.
    pub fn canonicalize(key: Vec<u8>, range_end: Vec<u8>) -> Self {
        if range_end.is_empty() {
            Self::Single(key)
        } else if range_end == [0] {
            Self::FromKey(key)
        } else {
            Self::HalfOpen {
                begin: key,
                end: range_end,
            }
        }
    }

    /// The range covering every key sharing `prefix`. An all-`0xff`
    /// prefix has no upper bound and degrades to from-key.
    pub fn prefix(prefix: Vec<u8>) -> Self {
        match prefix_end(&prefix) {
            Some(end) => Self::HalfOpen {
                begin: prefix,
                end,
            },
            None => Self::FromKey(prefix),
        }
    }

    /// First key of the range.
    pub fn begin(&self) -> &[u8] {
        match self {
            Self::Single(k) | Self::FromKey(k) => k,
            Self::HalfOpen { begin, .. } => begin,
        }
    }

    /// Whether `key` falls inside the range.
    pub fn contains(&self, key: &[u8]) -> bool {
        match self {
            Self::Single(k) => key == k.as_slice(),
            Self::HalfOpen { begin, end } => {
                key >= begin.as_slice() && key < end.as_slice()
            }
            Self::FromKey(begin) => key >= begin.as_slice(),
        }
    }
}

/// Smallest key strictly greater than every key with `prefix`, or `None`
/// when no such key exists (`prefix` is all `0xff`).
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xff {
            *last += 1;
            return Some(end);
        }
        end.pop();
    }
    None
}

/// Kind of a key-change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// The key was created or updated.
    Put,
    /// The key was deleted.
    Delete,
}

/// One key-change event, delivered to watchers and carried in
/// mutation responses.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    /// For puts: the record as written. For deletes: a record carrying
    /// the key and the deletion's `mod_revision` only.
    pub kv: KeyValue,
    /// Previous record, populated when the request asked for it.
    pub prev_kv: Option<KeyValue>,
}

impl Event {
    /// The revision at which this event happened.
    pub fn revision(&self) -> i64 {
        self.kv.mod_revision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_forms() {
        assert_eq!(
            KeyRange::canonicalize(b"k".to_vec(), Vec::new()),
            KeyRange::Single(b"k".to_vec())
        );
        assert_eq!(
            KeyRange::canonicalize(b"k".to_vec(), vec![0]),
            KeyRange::FromKey(b"k".to_vec())
        );
        assert_eq!(
            KeyRange::canonicalize(b"a".to_vec(), b"c".to_vec()),
            KeyRange::HalfOpen {
                begin: b"a".to_vec(),
                end: b"c".to_vec()
            }
        );
    }

    #[test]
    fn prefix_end_increments_and_saturates() {
        assert_eq!(prefix_end(b"a"), Some(b"b".to_vec()));
        assert_eq!(prefix_end(&[b'a', 0xff]), Some(b"b".to_vec()));
        assert_eq!(prefix_end(&[0xff, 0xff]), None);
    }

    #[test]
    fn contains_respects_bounds() {
        let range = KeyRange::prefix(b"a".to_vec());
        assert!(range.contains(b"a"));
        assert!(range.contains(b"az"));
        assert!(!range.contains(b"b"));
    }
}
