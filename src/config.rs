//! Configuration for index cells and the join cost model.
//!
//! All tuning values are explicit configuration passed into constructors;
//! there are no process-wide defaults, so multiple independent cells can
//! coexist in one process.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RwiError};
use crate::posting::row::{REF_KEY_LEN, ROW_WIDTH, TERM_HASH_LEN};
use crate::storage::Storage;

/// File name of the per-cell manifest.
pub const MANIFEST_FILE: &str = "cell.json";

/// Tuning configuration for an [`IndexCell`](crate::cell::IndexCell).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellConfig {
    /// Maximum number of term entries held in the RAM cache before the
    /// whole cache is dumped to a new segment.
    pub max_ram_entries: usize,

    /// A single container holding at least this many postings is always
    /// the preferred flush candidate (bounds worst-case memory from one
    /// hot term).
    pub max_chunk_size: usize,

    /// Run the cheap cache-cleanup check after every Nth write.
    pub clean_cache_interval: usize,

    /// Number of on-disk segments above which background compaction is
    /// considered.
    pub segment_limit: usize,

    /// Minimum seconds between two compaction checks.
    pub compaction_cooldown_secs: u64,

    /// Preferred size of a merged segment in bytes; pairs of segments
    /// below this are merged first.
    pub target_file_size: u64,

    /// Hard ceiling for a merged segment in bytes.
    pub max_file_size: u64,

    /// Route dumps and merges through the background dispatcher. When
    /// false, all disk I/O runs inline on the calling thread.
    pub background_io: bool,

    /// Capacity of the dispatcher's dump queue.
    pub dump_queue_len: usize,

    /// Capacity of the dispatcher's merge queue.
    pub merge_queue_len: usize,

    /// Number of tolerated corrupt records before the store flags the
    /// index for a full rebuild.
    pub corruption_threshold: usize,
}

impl Default for CellConfig {
    fn default() -> Self {
        CellConfig {
            max_ram_entries: 10_000,
            max_chunk_size: 10_000,
            clean_cache_interval: 1_000,
            segment_limit: 50,
            compaction_cooldown_secs: 10,
            target_file_size: 64 * 1024 * 1024,
            max_file_size: 512 * 1024 * 1024,
            background_io: true,
            dump_queue_len: 2,
            merge_queue_len: 4,
            corruption_threshold: 32,
        }
    }
}

impl CellConfig {
    /// Validate tuning values; zero queue capacities or limits are
    /// programmer errors.
    pub fn validate(&self) -> Result<()> {
        if self.max_ram_entries == 0 {
            return Err(RwiError::config("max_ram_entries must be positive"));
        }
        if self.clean_cache_interval == 0 {
            return Err(RwiError::config("clean_cache_interval must be positive"));
        }
        if self.dump_queue_len == 0 || self.merge_queue_len == 0 {
            return Err(RwiError::config("dispatcher queue capacity must be positive"));
        }
        if self.target_file_size > self.max_file_size {
            return Err(RwiError::config(
                "target_file_size must not exceed max_file_size",
            ));
        }
        Ok(())
    }
}

/// Cost model for choosing between the two set-join algorithms.
///
/// For a pair of posting lists with sizes `high >= low`, the estimated
/// cost of a full sorted merge walk is `merge_walk_factor * (high + low - 1)`
/// and the cost of probing the smaller list's keys into the larger list is
/// `probe_factor * log2(high) * low`. The defaults are empirical values
/// from long-running index deployments; treat them as a starting point for
/// benchmarking, not as exact constants.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct JoinCostModel {
    /// Per-step cost factor of the linear merge walk.
    pub merge_walk_factor: u64,

    /// Per-probe cost factor of the binary-search probe join.
    pub probe_factor: u64,
}

impl Default for JoinCostModel {
    fn default() -> Self {
        JoinCostModel {
            merge_walk_factor: 10,
            probe_factor: 12,
        }
    }
}

impl JoinCostModel {
    /// Estimated cost of a sorted merge walk over both lists.
    pub fn merge_walk_cost(&self, high: usize, low: usize) -> u64 {
        self.merge_walk_factor * (high + low).saturating_sub(1) as u64
    }

    /// Estimated cost of probing every key of the smaller list into the
    /// larger one.
    pub fn probe_cost(&self, high: usize, low: usize) -> u64 {
        self.probe_factor * bit_log2(high) * low as u64
    }

    /// True if the probe join is estimated cheaper than the merge walk.
    pub fn prefer_probe(&self, high: usize, low: usize) -> bool {
        self.merge_walk_cost(high, low) > self.probe_cost(high, low)
    }
}

/// Bit-length logarithm: number of bits needed to represent `x`
/// (`bit_log2(1) == 1`). The cost model depends on this variant.
pub(crate) fn bit_log2(mut x: usize) -> u64 {
    let mut l = 0;
    while x > 0 {
        x >>= 1;
        l += 1;
    }
    l
}

/// Schema manifest persisted inside each cell directory.
///
/// Reopening a cell with a library version that uses different key or row
/// widths must fail fast instead of misreading segment files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellManifest {
    /// Manifest format version.
    pub version: u16,

    /// Width of a term hash in bytes.
    pub term_hash_len: usize,

    /// Width of a reference key in bytes.
    pub ref_key_len: usize,

    /// Width of one encoded posting row in bytes.
    pub row_width: usize,
}

impl CellManifest {
    /// The manifest matching the compiled-in row schema.
    pub fn current() -> Self {
        CellManifest {
            version: 1,
            term_hash_len: TERM_HASH_LEN,
            ref_key_len: REF_KEY_LEN,
            row_width: ROW_WIDTH,
        }
    }

    /// Load the manifest from storage, or persist the current one if the
    /// cell is new. A schema mismatch is a configuration error.
    pub fn load_or_create(storage: &dyn Storage) -> Result<Self> {
        if storage.file_exists(MANIFEST_FILE) {
            let mut input = storage.open_input(MANIFEST_FILE)?;
            let mut buf = Vec::new();
            std::io::Read::read_to_end(&mut input, &mut buf)?;
            let manifest: CellManifest = serde_json::from_slice(&buf)?;
            let current = CellManifest::current();
            if manifest != current {
                return Err(RwiError::config(format!(
                    "cell schema mismatch: stored {manifest:?}, expected {current:?}"
                )));
            }
            Ok(manifest)
        } else {
            let manifest = CellManifest::current();
            let bytes = serde_json::to_vec_pretty(&manifest)?;
            let mut output = storage.create_output(MANIFEST_FILE)?;
            std::io::Write::write_all(&mut output, &bytes)?;
            output.close()?;
            Ok(manifest)
        }
    }
}
