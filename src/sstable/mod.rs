//! Immutable sorted runs on disk.
//!
//! A sorted run is the on-disk unit of the LSM tree: an immutable file of
//! records in ascending key order, paired with an in-memory index over
//! every record and a membership filter over every key.
//!
//! ## File Layout
//!
//! All integers are little-endian.
//!
//! ```text
//! +----------------------------+
//! | magic   u32  ("SSTB")      |
//! | version u32                |
//! | records u64                |
//! +----------------------------+
//! | key_len u32 | value_len u32|
//! | key bytes   | value bytes  |  x records, ascending by key
//! +----------------------------+
//! | filter_len u32             |
//! | membership filter          |
//! +----------------------------+
//! ```
//!
//! An empty value encodes a tombstone. The level a run belongs to is not
//! part of the file; it is carried in the run's path (`level-<L>/`) so
//! that bootstrap can restore it.

pub mod index;
pub mod table;

pub use index::Index;
pub use table::{SortedRun, SSTABLE_EXT, SSTABLE_MAGIC, SSTABLE_VERSION};
