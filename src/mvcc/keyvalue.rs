//! Durable record encodings.
//!
//! Records stored in backend buckets use hand-written length-delimited
//! encodings with explicit field tags so the on-disk format stays stable
//! across releases; a tag, once assigned, is never reused. Peers hash the
//! encoded bytes directly, so the encoding must be identical on every
//! member for the same logical record.

use prost::{DecodeError, Message};

/// A revisioned key-value record in the value log.
///
/// A tombstone is stored as a `KeyValue` carrying only the key; its
/// revision is recoverable from the value-log key it is stored under.
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,         // field 1
    pub create_revision: i64, // field 2
    pub mod_revision: i64,    // field 3
    pub version: i64,         // field 4
    pub value: Vec<u8>,       // field 5
    pub lease: i64,           // field 6
}

impl KeyValue {
    /// Encode to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_raw(&mut buf);
        buf
    }

    /// Decode from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::decode(bytes)
    }
}

impl Message for KeyValue {
    fn encode_raw(&self, buf: &mut impl prost::bytes::BufMut)
    where
        Self: Sized,
    {
        if !self.key.is_empty() {
            prost::encoding::bytes::encode(1, &self.key, buf);
        }
        if self.create_revision != 0 {
            prost::encoding::int64::encode(2, &self.create_revision, buf);
        }
        if self.mod_revision != 0 {
            prost::encoding::int64::encode(3, &self.mod_revision, buf);
        }
        if self.version != 0 {
            prost::encoding::int64::encode(4, &self.version, buf);
        }
        if !self.value.is_empty() {
            prost::encoding::bytes::encode(5, &self.value, buf);
        }
        if self.lease != 0 {
            prost::encoding::int64::encode(6, &self.lease, buf);
        }
    }

    fn merge_field(
        &mut self,
        tag: u32,
        wire_type: prost::encoding::WireType,
        buf: &mut impl prost::bytes::Buf,
        ctx: prost::encoding::DecodeContext,
    ) -> Result<(), DecodeError>
    where
        Self: Sized,
    {
        match tag {
            1 => prost::encoding::bytes::merge(wire_type, &mut self.key, buf, ctx),
            2 => prost::encoding::int64::merge(wire_type, &mut self.create_revision, buf, ctx),
            3 => prost::encoding::int64::merge(wire_type, &mut self.mod_revision, buf, ctx),
            4 => prost::encoding::int64::merge(wire_type, &mut self.version, buf, ctx),
            5 => prost::encoding::bytes::merge(wire_type, &mut self.value, buf, ctx),
            6 => prost::encoding::int64::merge(wire_type, &mut self.lease, buf, ctx),
            _ => prost::encoding::skip_field(wire_type, tag, buf, ctx),
        }
    }

    fn encoded_len(&self) -> usize {
        let mut len = 0;
        if !self.key.is_empty() {
            len += prost::encoding::bytes::encoded_len(1, &self.key);
        }
        if self.create_revision != 0 {
            len += prost::encoding::int64::encoded_len(2, &self.create_revision);
        }
        if self.mod_revision != 0 {
            len += prost::encoding::int64::encoded_len(3, &self.mod_revision);
        }
        if self.version != 0 {
            len += prost::encoding::int64::encoded_len(4, &self.version);
        }
        if !self.value.is_empty() {
            len += prost::encoding::bytes::encoded_len(5, &self.value);
        }
        if self.lease != 0 {
            len += prost::encoding::int64::encoded_len(6, &self.lease);
        }
        len
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// A lease record in the `lease` bucket, keyed by the lease id in
/// big-endian. Deadlines are intentionally absent: they reset to
/// `now + ttl` on restart.
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct LeaseRecord {
    pub id: i64,             // field 1
    pub ttl: i64,            // field 2
    pub keys: Vec<Vec<u8>>,  // field 3
}

impl LeaseRecord {
    /// Encode to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_raw(&mut buf);
        buf
    }

    /// Decode from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::decode(bytes)
    }
}

impl Message for LeaseRecord {
    fn encode_raw(&self, buf: &mut impl prost::bytes::BufMut)
    where
        Self: Sized,
    {
        if self.id != 0 {
            prost::encoding::int64::encode(1, &self.id, buf);
        }
        if self.ttl != 0 {
            prost::encoding::int64::encode(2, &self.ttl, buf);
        }
        prost::encoding::bytes::encode_repeated(3, &self.keys, buf);
    }

    fn merge_field(
        &mut self,
        tag: u32,
        wire_type: prost::encoding::WireType,
        buf: &mut impl prost::bytes::Buf,
        ctx: prost::encoding::DecodeContext,
    ) -> Result<(), DecodeError>
    where
        Self: Sized,
    {
        match tag {
            1 => prost::encoding::int64::merge(wire_type, &mut self.id, buf, ctx),
            2 => prost::encoding::int64::merge(wire_type, &mut self.ttl, buf, ctx),
            3 => prost::encoding::bytes::merge_repeated(wire_type, &mut self.keys, buf, ctx),
            _ => prost::encoding::skip_field(wire_type, tag, buf, ctx),
        }
    }

    fn encoded_len(&self) -> usize {
        let mut len = 0;
        if self.id != 0 {
            len += prost::encoding::int64::encoded_len(1, &self.id);
        }
        if self.ttl != 0 {
            len += prost::encoding::int64::encoded_len(2, &self.ttl);
        }
        len += prost::encoding::bytes::encoded_len_repeated(3, &self.keys);
        len
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_value_round_trip() {
        let kv = KeyValue {
            key: b"k".to_vec(),
            create_revision: 2,
            mod_revision: 5,
            version: 3,
            value: b"v".to_vec(),
            lease: 7,
        };
        let decoded = KeyValue::from_bytes(&kv.to_bytes()).unwrap();
        assert_eq!(decoded, kv);
    }

    #[test]
    fn tombstone_carries_only_key() {
        let tomb = KeyValue {
            key: b"gone".to_vec(),
            ..Default::default()
        };
        let bytes = tomb.to_bytes();
        let decoded = KeyValue::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.key, b"gone");
        assert_eq!(decoded.version, 0);
        assert!(decoded.value.is_empty());
    }
}
