//! Sorted run lifecycle: construction, opening, and retrieval.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::index::{Index, IndexEntry};
use crate::errdata;
use crate::error::Result;
use crate::filter::BloomFilter;

/// File magic, "SSTB".
pub const SSTABLE_MAGIC: u32 = 0x5353_5442;
pub const SSTABLE_VERSION: u32 = 1;
/// Extension of run files on disk.
pub const SSTABLE_EXT: &str = "sst";

/// Bytes occupied by magic, version, and record count.
const HEADER_SIZE: u64 = 16;

/// An immutable sorted run: the on-disk file plus its in-memory index
/// and membership filter.
///
/// Runs never change after construction. Reads open the file per
/// operation and are serialized through a per-run mutex; different runs
/// can be read concurrently.
#[derive(Debug)]
pub struct SortedRun {
    path: PathBuf,
    level: u32,
    size: u64,
    index: Index,
    filter: BloomFilter,
    io: Mutex<()>,
}

impl SortedRun {
    /// Writes a new run file from entries already sorted by ascending
    /// key, assigned to the given level. The parent directory is created
    /// if missing and the file is synced before the run is returned.
    pub fn build(path: impl Into<PathBuf>, entries: &[(Vec<u8>, Vec<u8>)], level: u32) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        writer.write_u32::<LittleEndian>(SSTABLE_MAGIC)?;
        writer.write_u32::<LittleEndian>(SSTABLE_VERSION)?;
        writer.write_u64::<LittleEndian>(entries.len() as u64)?;

        let mut filter = BloomFilter::with_capacity(entries.len());
        let mut index = Index::new();
        let mut offset = HEADER_SIZE;
        for (key, value) in entries {
            writer.write_u32::<LittleEndian>(key.len() as u32)?;
            writer.write_u32::<LittleEndian>(value.len() as u32)?;
            writer.write_all(key)?;
            writer.write_all(value)?;

            filter.add(key);
            let record_len = key.len() as u64 + value.len() as u64 + 8;
            index.push(key.clone(), offset, record_len);
            offset += record_len;
        }

        let filter_bytes = filter.encode();
        writer.write_u32::<LittleEndian>(filter_bytes.len() as u32)?;
        writer.write_all(&filter_bytes)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        let size = fs::metadata(&path)?.len();
        Ok(Self {
            path,
            level,
            size,
            index,
            filter,
            io: Mutex::new(()),
        })
    }

    /// Opens an existing run file, rebuilding the index from the record
    /// walk and deserializing the filter trailer. The level is carried by
    /// the caller (parsed from the path at bootstrap), not by the file.
    pub fn open(path: impl Into<PathBuf>, level: u32) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let truncated = |what: &str, e: std::io::Error| {
            crate::Error::InvalidData(format!("run file {}: short read of {what}: {e}", path.display()))
        };

        let magic = reader
            .read_u32::<LittleEndian>()
            .map_err(|e| truncated("magic", e))?;
        if magic != SSTABLE_MAGIC {
            return errdata!("invalid run file {}: bad magic {:#010x}", path.display(), magic);
        }
        let version = reader
            .read_u32::<LittleEndian>()
            .map_err(|e| truncated("version", e))?;
        if version != SSTABLE_VERSION {
            return errdata!(
                "invalid run file {}: unsupported version {}",
                path.display(),
                version
            );
        }
        let num_records = reader
            .read_u64::<LittleEndian>()
            .map_err(|e| truncated("record count", e))?;

        let mut index = Index::new();
        let mut offset = HEADER_SIZE;
        for _ in 0..num_records {
            let key_len = reader
                .read_u32::<LittleEndian>()
                .map_err(|e| truncated("key length", e))? as u64;
            let value_len = reader
                .read_u32::<LittleEndian>()
                .map_err(|e| truncated("value length", e))? as u64;

            let mut key = vec![0u8; key_len as usize];
            reader
                .read_exact(&mut key)
                .map_err(|e| truncated("key", e))?;
            reader
                .seek_relative(value_len as i64)
                .map_err(|e| truncated("value", e))?;

            let record_len = key_len + value_len + 8;
            index.push(key, offset, record_len);
            offset += record_len;
        }

        let filter_len = reader
            .read_u32::<LittleEndian>()
            .map_err(|e| truncated("filter length", e))? as usize;
        let mut filter_bytes = vec![0u8; filter_len];
        reader
            .read_exact(&mut filter_bytes)
            .map_err(|e| truncated("filter", e))?;
        let filter = BloomFilter::decode(&filter_bytes)?;

        Ok(Self {
            path,
            level,
            size,
            index,
            filter,
            io: Mutex::new(()),
        })
    }

    /// Point lookup. Returns the stored value as-is: an empty value is a
    /// tombstone, which the tree coordinator interprets. Read failures
    /// degrade to a miss.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        if !self.filter.might_contain(key) {
            return None;
        }
        let entry = self.index.find(key)?;

        let _io = self.io.lock().unwrap();
        match self.read_value(entry) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "run read failed, treating as miss");
                None
            }
        }
    }

    /// Range retrieval, inclusive on both endpoints, ascending by key.
    /// Tombstones appear as empty values. Read failures degrade to an
    /// empty result.
    pub fn get_range(&self, start: &[u8], end: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let lo = self.index.lower_bound(start);
        let hi = self.index.upper_bound(end);
        if lo >= hi {
            return Vec::new();
        }

        let _io = self.io.lock().unwrap();
        match self.read_window(lo, hi) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "run range read failed, treating as empty");
                Vec::new()
            }
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    /// File size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn num_records(&self) -> u64 {
        self.index.len() as u64
    }

    pub fn smallest_key(&self) -> Option<&[u8]> {
        self.index.first_key()
    }

    pub fn largest_key(&self) -> Option<&[u8]> {
        self.index.last_key()
    }

    fn read_value(&self, entry: &IndexEntry) -> Result<Vec<u8>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(entry.offset))?;
        let key_len = file.read_u32::<LittleEndian>()?;
        let value_len = file.read_u32::<LittleEndian>()?;
        file.seek(SeekFrom::Current(key_len as i64))?;

        let mut value = vec![0u8; value_len as usize];
        file.read_exact(&mut value)?;
        Ok(value)
    }

    fn read_window(&self, lo: usize, hi: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut file = File::open(&self.path)?;
        let mut result = Vec::with_capacity(hi - lo);
        for entry in self.index.window(lo, hi) {
            file.seek(SeekFrom::Start(entry.offset))?;
            let key_len = file.read_u32::<LittleEndian>()?;
            let value_len = file.read_u32::<LittleEndian>()?;

            let mut key = vec![0u8; key_len as usize];
            let mut value = vec![0u8; value_len as usize];
            file.read_exact(&mut key)?;
            file.read_exact(&mut value)?;
            result.push((key, value));
        }
        Ok(result)
    }
}
