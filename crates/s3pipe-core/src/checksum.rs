//! Whole-stream MD5 accumulation and stream-order reconstruction
//!
//! The accumulator only accepts bytes in stream order. Parts that complete
//! out of order go through a [`ReorderBuffer`] first.

use md5::{Digest, Md5};
use std::collections::BTreeMap;
use std::fmt;

/// Finalized MD5 of a byte stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentDigest([u8; 16]);

impl ContentDigest {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 32 character hex string, surrounding whitespace ignored
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut out = [0u8; 16];
        hex::decode_to_slice(s.trim(), &mut out).ok()?;
        Some(Self(out))
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Running MD5 over a stream fed strictly in offset order
pub struct ChecksumAccumulator {
    hasher: Md5,
    next_offset: u64,
}

impl ChecksumAccumulator {
    pub fn new() -> Self {
        Self {
            hasher: Md5::new(),
            next_offset: 0,
        }
    }

    /// Number of bytes hashed so far
    pub fn position(&self) -> u64 {
        self.next_offset
    }

    /// Hash `data` located at `offset` in the stream.
    ///
    /// # Panics
    ///
    /// If `offset` is not exactly the end of the previously appended range.
    pub fn append(&mut self, offset: u64, data: &[u8]) {
        assert_eq!(
            offset, self.next_offset,
            "checksum fed out of order: got offset {}, expected {}",
            offset, self.next_offset
        );
        self.hasher.update(data);
        self.next_offset += data.len() as u64;
    }

    pub fn finalize(self) -> ContentDigest {
        let mut out = [0u8; 16];
        out.copy_from_slice(&self.hasher.finalize());
        ContentDigest(out)
    }
}

impl Default for ChecksumAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds out-of-order results until every earlier sequence number arrived
pub struct ReorderBuffer<T> {
    pending: BTreeMap<u64, T>,
    next: u64,
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            next: 0,
        }
    }

    /// Sequence number that will be released next
    pub fn next_sequence(&self) -> u64 {
        self.next
    }

    /// Results waiting for an earlier sequence number
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn insert(&mut self, sequence: u64, item: T) {
        debug_assert!(sequence >= self.next, "sequence {} already released", sequence);
        self.pending.insert(sequence, item);
    }

    /// Release the next in-order item, if it has arrived
    pub fn pop_ready(&mut self) -> Option<T> {
        let item = self.pending.remove(&self.next)?;
        self.next += 1;
        Some(item)
    }
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}
