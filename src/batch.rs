//! A batch of updates applied under consecutive sequence numbers.
//!
//! Wire format, which is also the WAL payload:
//!
//! ```text
//! | sequence : fixed64 LE | count : fixed32 LE | entries... |
//! entry := 0x01 keylen:varint32 key vallen:varint32 val   (put)
//!        | 0x00 keylen:varint32 key                       (delete)
//! ```
//!
//! Entry `i` of the batch carries sequence `sequence + i`.

use crate::coding::{
    decode_fixed32, decode_fixed64, get_length_prefixed, put_fixed32, put_fixed64,
    put_length_prefixed,
};
use crate::corruption;
use crate::error::{Error, Result};
use crate::format::ValueType;

pub const BATCH_HEADER_SIZE: usize = 12;

const TAG_DELETE: u8 = 0;
const TAG_PUT: u8 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        Self {
            rep: vec![0; BATCH_HEADER_SIZE],
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(TAG_PUT);
        put_length_prefixed(&mut self.rep, key);
        put_length_prefixed(&mut self.rep, value);
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(TAG_DELETE);
        put_length_prefixed(&mut self.rep, key);
    }

    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(BATCH_HEADER_SIZE, 0);
    }

    pub fn count(&self) -> u32 {
        decode_fixed32(&self.rep[8..12])
    }

    fn set_count(&mut self, count: u32) {
        let mut buf = Vec::with_capacity(4);
        put_fixed32(&mut buf, count);
        self.rep[8..12].copy_from_slice(&buf);
    }

    pub fn sequence(&self) -> u64 {
        decode_fixed64(&self.rep[0..8])
    }

    pub fn set_sequence(&mut self, seq: u64) {
        let mut buf = Vec::with_capacity(8);
        put_fixed64(&mut buf, seq);
        self.rep[0..8].copy_from_slice(&buf);
    }

    pub fn contents(&self) -> &[u8] {
        &self.rep
    }

    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    /// Adopts a serialized batch, e.g. a WAL payload during replay.
    pub fn from_contents(contents: &[u8]) -> Result<Self> {
        if contents.len() < BATCH_HEADER_SIZE {
            return Err(corruption!("write batch record too small"));
        }
        Ok(Self {
            rep: contents.to_vec(),
        })
    }

    /// Iterates entries, pairing each with its sequence number.
    pub fn iter(&self) -> BatchIter<'_> {
        BatchIter {
            rest: &self.rep[BATCH_HEADER_SIZE..],
            seq: self.sequence(),
            remaining: self.count(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct BatchEntry<'a> {
    pub seq: u64,
    pub vtype: ValueType,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

pub struct BatchIter<'a> {
    rest: &'a [u8],
    seq: u64,
    remaining: u32,
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = Result<BatchEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            if !self.rest.is_empty() {
                return Some(Err(corruption!("write batch has trailing bytes")));
            }
            return None;
        }
        self.remaining -= 1;
        Some(self.decode_one())
    }
}

impl<'a> BatchIter<'a> {
    fn decode_one(&mut self) -> Result<BatchEntry<'a>> {
        let (&tag, rest) = self
            .rest
            .split_first()
            .ok_or_else(|| -> Error { corruption!("write batch truncated at tag") })?;
        self.rest = rest;
        let seq = self.seq;
        self.seq += 1;

        match tag {
            TAG_PUT => {
                let key = get_length_prefixed(&mut self.rest)?;
                let value = get_length_prefixed(&mut self.rest)?;
                Ok(BatchEntry {
                    seq,
                    vtype: ValueType::Value,
                    key,
                    value,
                })
            }
            TAG_DELETE => {
                let key = get_length_prefixed(&mut self.rest)?;
                Ok(BatchEntry {
                    seq,
                    vtype: ValueType::Deletion,
                    key,
                    value: &[],
                })
            }
            other => Err(corruption!("unknown write batch tag {other}")),
        }
    }
}
