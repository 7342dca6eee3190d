//! Internal key layout and ordering.
//!
//! Every entry the engine stores is keyed by an internal key: the user key
//! followed by an 8-byte little-endian trailer packing a 56-bit sequence
//! number and a one-byte value type.
//!
//! ```text
//! | user key (var) | seq << 8 | type : fixed64 LE |
//! ```
//!
//! Internal ordering is ascending by user key, then descending by sequence,
//! then ascending by type. Entries for one user key therefore appear
//! newest-first, which lets a point lookup at a snapshot stop at the first
//! entry whose sequence is at or below the snapshot.

use std::cmp::Ordering;
use std::fmt;

use crate::coding::{decode_fixed64, put_fixed64};
use crate::corruption;
use crate::error::Result;

/// Sequence numbers are limited to 56 bits so they pack into the trailer
/// alongside the value type.
pub const MAX_SEQUENCE: u64 = (1 << 56) - 1;

pub const TRAILER_SIZE: usize = 8;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValueType {
    /// A point tombstone. The stored value is empty.
    Deletion = 0,
    /// A live key-value entry.
    Value = 1,
}

impl ValueType {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(ValueType::Deletion),
            1 => Ok(ValueType::Value),
            _ => Err(corruption!("unknown value type {v}")),
        }
    }
}

pub fn pack_sequence_and_type(seq: u64, vtype: ValueType) -> u64 {
    debug_assert!(seq <= MAX_SEQUENCE);
    (seq << 8) | vtype as u64
}

/// An owned, encoded internal key. Construction goes through `new` or
/// `decode`, so the trailer invariant always holds.
#[derive(Clone, PartialEq, Eq)]
pub struct InternalKey(Vec<u8>);

impl InternalKey {
    pub fn new(user_key: &[u8], seq: u64, vtype: ValueType) -> Self {
        let mut buf = Vec::with_capacity(user_key.len() + TRAILER_SIZE);
        buf.extend_from_slice(user_key);
        put_fixed64(&mut buf, pack_sequence_and_type(seq, vtype));
        InternalKey(buf)
    }

    pub fn decode(encoded: &[u8]) -> Result<Self> {
        if encoded.len() < TRAILER_SIZE {
            return Err(corruption!("internal key shorter than trailer"));
        }
        let trailer = decode_fixed64(&encoded[encoded.len() - TRAILER_SIZE..]);
        ValueType::from_u8((trailer & 0xff) as u8)?;
        Ok(InternalKey(encoded.to_vec()))
    }

    pub fn encoded(&self) -> &[u8] {
        &self.0
    }

    pub fn user_key(&self) -> &[u8] {
        &self.0[..self.0.len() - TRAILER_SIZE]
    }

    fn trailer(&self) -> u64 {
        decode_fixed64(&self.0[self.0.len() - TRAILER_SIZE..])
    }

    pub fn sequence(&self) -> u64 {
        self.trailer() >> 8
    }

    pub fn value_type(&self) -> ValueType {
        match self.trailer() & 0xff {
            0 => ValueType::Deletion,
            _ => ValueType::Value,
        }
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_key()
            .cmp(other.user_key())
            // Descending sequence: newer entries first.
            .then_with(|| other.sequence().cmp(&self.sequence()))
            .then_with(|| self.value_type().cmp(&other.value_type()))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InternalKey({:?} @ {} : {:?})",
            String::from_utf8_lossy(self.user_key()),
            self.sequence(),
            self.value_type()
        )
    }
}

/// The key a point lookup probes with: positioned at `(user_key, snapshot)`
/// with the tombstone type, so it sorts at or before every entry for
/// `user_key` whose sequence is at most `snapshot`.
pub struct LookupKey {
    key: InternalKey,
}

impl LookupKey {
    pub fn new(user_key: &[u8], snapshot: u64) -> Self {
        LookupKey {
            key: InternalKey::new(user_key, snapshot, ValueType::Deletion),
        }
    }

    pub fn internal_key(&self) -> &InternalKey {
        &self.key
    }

    pub fn user_key(&self) -> &[u8] {
        self.key.user_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_fields() {
        let key = InternalKey::new(b"alpha", 42, ValueType::Value);
        assert_eq!(key.user_key(), b"alpha");
        assert_eq!(key.sequence(), 42);
        assert_eq!(key.value_type(), ValueType::Value);

        let decoded = InternalKey::decode(key.encoded()).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn ordering_by_user_key() {
        let a = InternalKey::new(b"a", 100, ValueType::Value);
        let b = InternalKey::new(b"b", 1, ValueType::Value);
        assert!(a < b);
    }

    #[test]
    fn ordering_newest_first_within_user_key() {
        let newer = InternalKey::new(b"k", 9, ValueType::Value);
        let older = InternalKey::new(b"k", 3, ValueType::Deletion);
        assert!(newer < older);
    }

    #[test]
    fn lookup_key_sorts_at_or_before_visible_entries() {
        let lookup = LookupKey::new(b"k", 5);
        let at_snapshot = InternalKey::new(b"k", 5, ValueType::Value);
        let above_snapshot = InternalKey::new(b"k", 6, ValueType::Value);
        let below_snapshot = InternalKey::new(b"k", 4, ValueType::Value);
        assert!(lookup.internal_key() <= &at_snapshot);
        assert!(lookup.internal_key() > &above_snapshot);
        assert!(lookup.internal_key() < &below_snapshot);
    }

    #[test]
    fn short_encoding_is_corruption() {
        assert!(InternalKey::decode(b"abc").is_err());
    }

    #[test]
    fn unknown_type_is_corruption() {
        let mut buf = b"k".to_vec();
        put_fixed64(&mut buf, (7 << 8) | 9);
        assert!(InternalKey::decode(&buf).is_err());
    }
}
