//! Probabilistic membership filter for sorted run keys.
//!
//! A Bloom filter answers "definitely absent" or "maybe present" for a
//! key without touching disk, letting point lookups skip runs that
//! cannot contain the key. False positives are possible, false negatives
//! are not.
//!
//! The hash family is a seeded DJB2 variant: hash function `i` folds
//! every key byte as `hash = hash * 33 + byte + i` starting from 5381.
//! The bit layout and serialized form are part of the on-disk run format
//! and must not change without a format version bump.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::errdata;
use crate::error::Result;

/// Number of hash functions applied per key.
pub const DEFAULT_NUM_HASHES: u64 = 3;

/// Filter bits allocated per key when sizing for a record set.
pub const BITS_PER_KEY: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct BloomFilter {
    /// Bit array in 64-bit blocks.
    blocks: Vec<u64>,
    num_hashes: u64,
}

impl BloomFilter {
    /// Creates a filter with at least `bits` bits, rounded up to a whole
    /// number of 64-bit blocks. At least one block is always allocated
    /// so that an empty filter is still well-formed.
    pub fn new(bits: usize, num_hashes: u64) -> Self {
        let num_blocks = ((bits + 63) / 64).max(1);
        Self {
            blocks: vec![0; num_blocks],
            num_hashes,
        }
    }

    /// Creates a filter sized for `num_keys` keys at [`BITS_PER_KEY`].
    pub fn with_capacity(num_keys: usize) -> Self {
        Self::new(num_keys * BITS_PER_KEY, DEFAULT_NUM_HASHES)
    }

    /// Marks a key as present.
    pub fn add(&mut self, key: &[u8]) {
        for seed in 0..self.num_hashes {
            let bit = Self::hash(key, seed) % self.bits();
            self.blocks[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    /// Returns false only if the key was never added.
    pub fn might_contain(&self, key: &[u8]) -> bool {
        for seed in 0..self.num_hashes {
            let bit = Self::hash(key, seed) % self.bits();
            if self.blocks[(bit / 64) as usize] & (1 << (bit % 64)) == 0 {
                return false;
            }
        }
        true
    }

    /// Encodes the filter: hash count, block count, then each block,
    /// all little-endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.blocks.len() * 8);
        buf.write_u64::<LittleEndian>(self.num_hashes).unwrap();
        buf.write_u64::<LittleEndian>(self.blocks.len() as u64).unwrap();
        for block in &self.blocks {
            buf.write_u64::<LittleEndian>(*block).unwrap();
        }
        buf
    }

    /// Decodes a filter produced by [`encode`](Self::encode).
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(buf);
        let num_hashes = cursor
            .read_u64::<LittleEndian>()
            .map_err(|e| crate::Error::InvalidData(format!("filter hash count: {e}")))?;
        let num_blocks = cursor
            .read_u64::<LittleEndian>()
            .map_err(|e| crate::Error::InvalidData(format!("filter block count: {e}")))?;

        let remaining = buf.len() as u64 - cursor.position();
        if remaining != num_blocks * 8 {
            return errdata!(
                "filter body is {} bytes, expected {} blocks",
                remaining,
                num_blocks
            );
        }

        let mut blocks = Vec::with_capacity(num_blocks as usize);
        for _ in 0..num_blocks {
            blocks.push(
                cursor
                    .read_u64::<LittleEndian>()
                    .map_err(|e| crate::Error::InvalidData(format!("filter block: {e}")))?,
            );
        }
        Ok(Self { blocks, num_hashes })
    }

    fn bits(&self) -> u64 {
        self.blocks.len() as u64 * 64
    }

    fn hash(key: &[u8], seed: u64) -> u64 {
        let mut hash: u64 = 5381;
        for &byte in key {
            hash = hash
                .wrapping_mul(33)
                .wrapping_add(byte as u64)
                .wrapping_add(seed);
        }
        hash
    }
}
