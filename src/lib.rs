//! CinderDB: an embedded LSM-tree key/value storage engine.
//!
//! Writes are absorbed by an in-memory skip-list buffer; when the buffer
//! exhausts its byte budget it becomes immutable and is flushed to disk
//! as a sorted run at level 0. Compaction merges the runs of an
//! over-capacity level into the next one, resolving duplicate keys in
//! favor of the newest write and dropping deletion markers once nothing
//! older remains.
//!
//! ```text
//! ┌───────────────┐    ┌──────────────────┐
//! │ Active buffer │───►│ Immutable buffer │
//! │  (skip list)  │    │    (frozen)      │
//! └───────────────┘    └──────────────────┘
//!                               │ flush
//!                               ▼
//!                        ┌─────────────┐
//!                        │  Level 0    │  2MB
//!                        │ sorted runs │
//!                        └─────────────┘
//!                               │ compaction
//!                               ▼
//!                        ┌─────────────┐
//!                        │  Level 1    │  20MB
//!                        └─────────────┘
//!                               │
//!                               ▼
//!                              ...
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use cinderdb::Tree;
//!
//! let tree = Tree::open("./data")?;
//! tree.put(b"key", b"value")?;
//! assert_eq!(tree.get(b"key"), Some(b"value".to_vec()));
//! tree.delete(b"key")?;
//! tree.flush()?;
//! # Ok::<(), cinderdb::Error>(())
//! ```
//!
//! # Semantics
//!
//! - Keys and values are opaque byte strings ordered lexicographically
//!   by unsigned byte value.
//! - An empty value is the deletion marker (tombstone); `put` with an
//!   empty value behaves as `delete`, and deleted keys read as absent
//!   from every layer.
//! - Durability extends to the most recently completed `flush`. There is
//!   no write-ahead log: buffered writes are lost on a crash.
//! - A single coarse lock serializes all operations; flush and
//!   compaction run synchronously on the calling thread.

pub mod compaction;
pub mod config;
pub mod error;
pub mod filter;
pub mod memtable;
pub mod merge;
pub mod skiplist;
pub mod sstable;
pub mod tree;

pub use config::TreeConfig;
pub use error::{Error, Result};
pub use tree::{Tree, TreeMetrics};
