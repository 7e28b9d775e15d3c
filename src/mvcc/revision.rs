//! Revisions and their value-log key encoding.

use serde::{Deserialize, Serialize};

/// Bytes of an encoded revision without the tombstone marker.
pub const REV_BYTES: usize = 8 + 1 + 4;

/// Marker byte appended to the value-log key of a tombstone record.
pub const TOMBSTONE_MARKER: u8 = b't';

/// A revision: `main` is assigned at most once per apply step, `sub`
/// orders mutations within one step. Ordering is lexicographic.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Revision {
    pub main: i64,
    pub sub: i64,
}

impl Revision {
    /// Build a revision.
    pub const fn new(main: i64, sub: i64) -> Self {
        Self { main, sub }
    }

    /// Encode into a value-log key: `main:u64-BE '_' sub:u32-BE` with an
    /// optional trailing tombstone marker.
    pub fn encode(&self, tombstone: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(REV_BYTES + 1);
        out.extend_from_slice(&(self.main as u64).to_be_bytes());
        out.push(b'_');
        out.extend_from_slice(&(self.sub as u32).to_be_bytes());
        if tombstone {
            out.push(TOMBSTONE_MARKER);
        }
        out
    }

    /// Decode a value-log key. Returns the revision and whether the
    /// record is a tombstone.
    pub fn decode(bytes: &[u8]) -> Option<(Revision, bool)> {
        if bytes.len() < REV_BYTES || bytes[8] != b'_' {
            return None;
        }
        let main = u64::from_be_bytes(bytes[..8].try_into().ok()?) as i64;
        let sub = u32::from_be_bytes(bytes[9..REV_BYTES].try_into().ok()?) as i64;
        let tombstone = match bytes.len() {
            REV_BYTES => false,
            l if l == REV_BYTES + 1 && bytes[REV_BYTES] == TOMBSTONE_MARKER => true,
            _ => return None,
        };
        Some((Revision::new(main, sub), tombstone))
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.main, self.sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_preserves_order() {
        let revs = [
            Revision::new(1, 0),
            Revision::new(1, 1),
            Revision::new(2, 0),
            Revision::new(10, 3),
        ];
        let mut encoded: Vec<Vec<u8>> = revs.iter().map(|r| r.encode(false)).collect();
        let sorted = encoded.clone();
        encoded.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn decode_round_trip() {
        let rev = Revision::new(42, 7);
        assert_eq!(Revision::decode(&rev.encode(false)), Some((rev, false)));
        assert_eq!(Revision::decode(&rev.encode(true)), Some((rev, true)));
        assert_eq!(Revision::decode(b"short"), None);
    }
}
