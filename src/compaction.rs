//! Merging of sorted runs across levels.
//!
//! Compaction takes the runs of an over-capacity level and rewrites them
//! as a single run one level deeper, resolving duplicate keys in favor
//! of the newest input and optionally dropping tombstones. Level
//! capacities grow exponentially: level 0 holds 2MB and each following
//! level ten times the previous one, so data migrates away from the
//! write path as it ages.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;
use crate::merge::MergeIterator;
use crate::sstable::{SortedRun, SSTABLE_EXT};

/// Byte capacity of level 0.
pub const BASE_LEVEL_CAPACITY: u64 = 2 * 1024 * 1024;

/// Capacity growth factor between adjacent levels.
pub const LEVEL_CAPACITY_MULTIPLIER: u64 = 10;

/// Most input runs consumed by a single compaction.
pub const MAX_COMPACTION_INPUTS: usize = 10;

/// The compaction engine. Stateless apart from the base directory it
/// writes output runs under.
#[derive(Debug)]
pub struct Compaction {
    base_dir: PathBuf,
}

impl Compaction {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Byte capacity of a level: 2MB at level 0, growing tenfold per level.
    pub fn capacity_of(level: u32) -> u64 {
        BASE_LEVEL_CAPACITY * LEVEL_CAPACITY_MULTIPLIER.pow(level)
    }

    /// True iff the runs' total size exceeds the level's capacity.
    pub fn should_compact(&self, runs: &[SortedRun], level: u32) -> bool {
        if runs.is_empty() {
            return false;
        }
        let total: u64 = runs.iter().map(|run| run.size()).sum();
        total > Self::capacity_of(level)
    }

    /// Merges the input runs (ordered oldest first) into a single run at
    /// `output_level`. Duplicate keys resolve to the newest input.
    ///
    /// With `elide_tombstones` set, tombstones are dropped from the
    /// output entirely. The caller asserts by passing it that no runs
    /// exist at the output level or deeper, since a dropped tombstone
    /// can no longer shadow anything.
    pub fn compact(
        &self,
        inputs: &[SortedRun],
        output_level: u32,
        elide_tombstones: bool,
    ) -> Result<SortedRun> {
        // The merge expects sources newest first.
        let sources: Vec<Vec<(Vec<u8>, Vec<u8>)>> = inputs
            .iter()
            .rev()
            .map(|run| match (run.smallest_key(), run.largest_key()) {
                (Some(start), Some(end)) => run.get_range(start, end),
                _ => Vec::new(),
            })
            .collect();

        let merged = MergeIterator::new(sources);
        let entries: Vec<(Vec<u8>, Vec<u8>)> = if elide_tombstones {
            merged.filter(|(_, value)| !value.is_empty()).collect()
        } else {
            merged.collect()
        };

        let path = self.run_path(output_level);
        let run = SortedRun::build(&path, &entries, output_level)?;
        tracing::info!(
            inputs = inputs.len(),
            output_level,
            records = run.num_records(),
            elide_tombstones,
            path = %path.display(),
            "compacted runs"
        );
        Ok(run)
    }

    /// Generates a fresh run path under the level's directory, named by
    /// creation time in nanoseconds.
    pub fn run_path(&self, level: u32) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        self.base_dir
            .join(format!("level-{level}"))
            .join(format!("sstable-{nanos}.{SSTABLE_EXT}"))
    }
}
