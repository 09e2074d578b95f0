//! The concurrent in-memory write buffer of an index cell.
//!
//! Sixteen shards, each a `RwLock<AHashMap<TermHash, PostingList>>`.
//! Reads and key-disjoint writes run concurrently; writers for the same
//! term serialize on their shard lock, so a read-merge-write never loses
//! an update.

use std::collections::BTreeSet;
use std::hash::{BuildHasher, Hash, Hasher};

use ahash::{AHashMap, RandomState};
use log::info;
use parking_lot::RwLock;

use crate::error::Result;
use crate::posting::list::{now_secs, PostingList};
use crate::posting::row::{Posting, RefKey, TermHash, ROW_WIDTH};
use crate::segment::heap::SegmentWriter;
use crate::storage::Storage;

const SHARD_COUNT: usize = 16;

/// Concurrent map from term hash to its in-memory posting list.
pub struct RamCache {
    shards: Vec<RwLock<AHashMap<TermHash, PostingList>>>,
    hasher: RandomState,
}

impl std::fmt::Debug for RamCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RamCache").field("terms", &self.len()).finish()
    }
}

impl Default for RamCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RamCache {
    pub fn new() -> Self {
        RamCache {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(AHashMap::new())).collect(),
            hasher: RandomState::new(),
        }
    }

    fn shard(&self, term: &TermHash) -> &RwLock<AHashMap<TermHash, PostingList>> {
        let mut hasher = self.hasher.build_hasher();
        term.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }

    /// Add one posting, most-recent-wins on key collision.
    pub fn add(&self, term: TermHash, posting: Posting) -> bool {
        let mut shard = self.shard(&term).write();
        shard
            .entry(term)
            .or_insert_with(|| PostingList::new(term))
            .put_recent(posting)
    }

    /// Merge a whole list into the cache, most-recent-wins per key.
    pub fn add_list(&self, list: &PostingList) {
        if list.is_empty() {
            return;
        }
        let mut shard = self.shard(list.term()).write();
        shard
            .entry(*list.term())
            .or_insert_with(|| PostingList::new(*list.term()))
            .add_all_recent(list);
    }

    /// Cloned read of one container, optionally filtered to an allow-set
    /// of reference keys.
    pub fn get(&self, term: &TermHash, filter: Option<&BTreeSet<RefKey>>) -> Option<PostingList> {
        let shard = self.shard(term).read();
        let list = shard.get(term)?;
        let mut clone = list.clone();
        if let Some(keys) = filter {
            clone.retain_keys(keys);
        }
        if clone.is_empty() { None } else { Some(clone) }
    }

    pub fn has(&self, term: &TermHash) -> bool {
        self.shard(term).read().contains_key(term)
    }

    pub fn count(&self, term: &TermHash) -> usize {
        self.shard(term).read().get(term).map(|l| l.len()).unwrap_or(0)
    }

    /// Remove and return one container.
    pub fn delete(&self, term: &TermHash) -> Option<PostingList> {
        self.shard(term).write().remove(term)
    }

    /// Remove specific keys from one container, dropping it when it
    /// empties. Returns the number of postings removed.
    pub fn remove(&self, term: &TermHash, keys: &BTreeSet<RefKey>) -> usize {
        let mut shard = self.shard(term).write();
        let Some(list) = shard.get_mut(term) else {
            return 0;
        };
        let removed = list.remove_entries(keys);
        if list.is_empty() {
            shard.remove(term);
        }
        removed
    }

    /// Number of term containers.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }

    /// Size of the largest container.
    pub fn max_references(&self) -> usize {
        self.shards
            .iter()
            .flat_map(|s| s.read().values().map(|l| l.len()).collect::<Vec<_>>())
            .max()
            .unwrap_or(0)
    }

    /// Approximate heap use of the buffered postings.
    pub fn used_memory(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().values().map(|l| l.len() * ROW_WIDTH).sum::<usize>())
            .sum()
    }

    /// Consistent snapshot of all containers, sorted by term hash.
    pub fn sorted_lists(&self) -> Vec<PostingList> {
        let mut lists: Vec<PostingList> = self
            .shards
            .iter()
            .flat_map(|s| s.read().values().cloned().collect::<Vec<_>>())
            .collect();
        lists.sort_by(|a, b| a.term().cmp(b.term()));
        lists
    }

    /// All buffered term hashes in ascending order.
    pub fn terms(&self) -> Vec<TermHash> {
        let mut terms: Vec<TermHash> = self
            .shards
            .iter()
            .flat_map(|s| s.read().keys().copied().collect::<Vec<_>>())
            .collect();
        terms.sort();
        terms
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.write().clear();
        }
    }

    /// Write the whole cache as one new segment file.
    pub fn dump(&self, storage: &dyn Storage, name: &str) -> Result<()> {
        let lists = self.sorted_lists();
        let mut writer = SegmentWriter::create(storage, name)?;
        for list in &lists {
            writer.add(list)?;
        }
        let records = writer.records();
        writer.finish()?;
        info!("dumped {records} containers to {name}");
        Ok(())
    }

    /// Pick the container to flush first.
    ///
    /// A container of at least `max_chunk` postings always wins (largest
    /// first). Otherwise the score `entries * (age_secs + 1)` decides,
    /// ties broken by ascending term hash, so the choice is deterministic.
    ///
    /// The cell's eviction policy only asks once a container has reached
    /// `max_chunk`, so through that path the oversized branch always
    /// applies; the scoring fallback serves callers flushing below the
    /// threshold.
    pub fn flush_candidate(&self, max_chunk: usize) -> Option<TermHash> {
        let now = now_secs();
        let mut oversized: Option<(usize, TermHash)> = None;
        let mut best: Option<(u64, TermHash)> = None;
        for shard in &self.shards {
            for (term, list) in shard.read().iter() {
                if list.len() >= max_chunk {
                    let candidate = (list.len(), *term);
                    if oversized
                        .map(|(len, t)| candidate.0 > len || (candidate.0 == len && *term < t))
                        .unwrap_or(true)
                    {
                        oversized = Some(candidate);
                    }
                    continue;
                }
                let age = now.saturating_sub(list.last_wrote());
                let score = list.len() as u64 * (age + 1);
                if best
                    .map(|(s, t)| score > s || (score == s && *term < t))
                    .unwrap_or(true)
                {
                    best = Some((score, *term));
                }
            }
        }
        oversized.map(|(_, t)| t).or(best.map(|(_, t)| t))
    }
}
