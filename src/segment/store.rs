//! The on-disk half of an index cell: a mounted list of segment files.
//!
//! Reads merge container fragments for the same term across all mounted
//! segments. Compaction merges two segments into a new file; the merged
//! segment is mounted before its sources are unmounted and deleted, so
//! readers always see every posting.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{info, warn};
use parking_lot::RwLock;

use crate::error::{Result, RwiError};
use crate::posting::list::PostingList;
use crate::posting::row::{RefKey, TermHash, ROW_WIDTH};
use crate::segment::heap::{Segment, SegmentWriter};
use crate::storage::Storage;

const SEGMENT_SUFFIX: &str = ".seg";
const SEGMENT_PREFIX: &str = "rwi.";

/// Mounted collection of segment files inside one storage directory.
pub struct SegmentStore {
    storage: Arc<dyn Storage>,
    segments: RwLock<Vec<Arc<Segment>>>,
    /// Sequence number for new segment file names.
    seq: AtomicU64,
    /// Corrupt records tolerated before flagging a rebuild.
    corruption_threshold: usize,
}

impl std::fmt::Debug for SegmentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentStore")
            .field("segments", &self.entries())
            .finish()
    }
}

impl SegmentStore {
    /// Open the store, mounting every segment file found in storage.
    pub fn open(storage: Arc<dyn Storage>, corruption_threshold: usize) -> Result<Self> {
        let store = SegmentStore {
            storage: Arc::clone(&storage),
            segments: RwLock::new(Vec::new()),
            seq: AtomicU64::new(0),
            corruption_threshold,
        };

        let mut names: Vec<String> = storage
            .list_files()?
            .into_iter()
            .filter(|n| n.starts_with(SEGMENT_PREFIX) && n.ends_with(SEGMENT_SUFFIX))
            .collect();
        names.sort();
        for name in &names {
            store.mount(name)?;
        }
        if let Some(max) = names.iter().filter_map(|n| parse_seq(n)).max() {
            store.seq.store(max + 1, Ordering::Relaxed);
        }
        Ok(store)
    }

    /// Reserve the next segment file name.
    pub fn next_segment_name(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{SEGMENT_PREFIX}{seq:08}{SEGMENT_SUFFIX}")
    }

    /// Mount one segment file.
    pub fn mount(&self, name: &str) -> Result<()> {
        let segment = Segment::mount(Arc::clone(&self.storage), name)?;
        if segment.error_count() > 0 {
            warn!(
                "segment {name} mounted with {} corrupt records",
                segment.error_count()
            );
        }
        self.segments.write().push(Arc::new(segment));
        Ok(())
    }

    /// Unmount one segment, leaving its file in place.
    pub fn unmount(&self, name: &str) -> Option<Arc<Segment>> {
        let mut segments = self.segments.write();
        let idx = segments.iter().position(|s| s.name() == name)?;
        Some(segments.remove(idx))
    }

    /// Unmount one segment and delete its file.
    pub fn unmount_and_delete(&self, name: &str) -> Result<()> {
        if self.unmount(name).is_some() {
            self.storage.delete_file(name)?;
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<Arc<Segment>> {
        self.segments.read().clone()
    }

    /// Union read: merge the container fragments for `term` across all
    /// segments, most-recent-wins on duplicate keys.
    pub fn get(
        &self,
        term: &TermHash,
        filter: Option<&BTreeSet<RefKey>>,
    ) -> Result<Option<PostingList>> {
        let mut merged: Option<PostingList> = None;
        for segment in self.snapshot() {
            if let Some(list) = segment.get(term)? {
                merged = Some(match merged {
                    Some(acc) => acc.merge(&list),
                    None => list,
                });
            }
        }
        if let (Some(list), Some(keys)) = (merged.as_mut(), filter) {
            list.retain_keys(keys);
        }
        Ok(merged.filter(|l| !l.is_empty()))
    }

    pub fn has(&self, term: &TermHash) -> bool {
        self.snapshot().iter().any(|s| s.has(term))
    }

    /// Total number of postings stored for one term across all segments
    /// (duplicate keys counted per fragment).
    pub fn count(&self, term: &TermHash) -> usize {
        self.snapshot().iter().map(|s| s.count(term)).sum()
    }

    /// Remove one term everywhere, returning the union of its postings.
    pub fn delete(&self, term: &TermHash) -> Result<Option<PostingList>> {
        let removed = self.get(term, None)?;
        for segment in self.snapshot() {
            segment.delete(term)?;
        }
        Ok(removed)
    }

    /// Remove specific reference keys from one term everywhere. Returns
    /// the number of postings removed, derived from bytes rewritten.
    pub fn remove(&self, term: &TermHash, keys: &BTreeSet<RefKey>) -> Result<usize> {
        let mut bytes_removed = 0u64;
        for segment in self.snapshot() {
            bytes_removed += segment.replace(term, |mut list| {
                list.remove_entries(keys);
                Some(list)
            })?;
        }
        Ok((bytes_removed / ROW_WIDTH as u64) as usize)
    }

    /// Rewrite one term's container in every segment holding it.
    pub fn replace<F>(&self, term: &TermHash, rewrite: F) -> Result<u64>
    where
        F: Fn(PostingList) -> Option<PostingList>,
    {
        let mut bytes_removed = 0u64;
        for segment in self.snapshot() {
            bytes_removed += segment.replace(term, &rewrite)?;
        }
        Ok(bytes_removed)
    }

    /// Merge two mounted segments into one new segment file.
    ///
    /// The merged segment is mounted before the sources are unmounted and
    /// deleted. A source with no live containers short-circuits: its file
    /// is dropped and the other segment survives unchanged.
    pub fn merge_two(&self, a_name: &str, b_name: &str) -> Result<String> {
        let find = |name: &str| -> Result<Arc<Segment>> {
            self.segments
                .read()
                .iter()
                .find(|s| s.name() == name)
                .cloned()
                .ok_or_else(|| RwiError::segment(format!("segment {name} is not mounted")))
        };
        let a = find(a_name)?;
        let b = find(b_name)?;

        if a.is_empty() || b.is_empty() {
            let (empty, survivor) = if a.is_empty() { (&a, &b) } else { (&b, &a) };
            info!(
                "merge {a_name} + {b_name}: {} is empty, keeping {}",
                empty.name(),
                survivor.name()
            );
            self.unmount_and_delete(empty.name())?;
            survivor.set_merging(false);
            return Ok(survivor.name().to_string());
        }

        let out_name = self.next_segment_name();
        let tmp_name = format!("{out_name}.tmp");
        let mut writer = SegmentWriter::create(self.storage.as_ref(), &tmp_name)?;

        let mut terms: BTreeSet<TermHash> = a.terms().into_iter().collect();
        terms.extend(b.terms());
        for term in &terms {
            let merged = match (a.get(term)?, b.get(term)?) {
                (Some(x), Some(y)) => x.merge(&y),
                (Some(x), None) => x,
                (None, Some(y)) => y,
                (None, None) => continue,
            };
            writer.add(&merged)?;
        }
        let records = writer.records();
        writer.finish()?;
        self.storage.rename_file(&tmp_name, &out_name)?;

        // publish before retiring the sources
        self.mount(&out_name)?;
        self.unmount_and_delete(a_name)?;
        self.unmount_and_delete(b_name)?;
        info!("merged {a_name} + {b_name} -> {out_name} ({records} containers)");
        Ok(out_name)
    }

    /// Pick two segments worth merging, or None.
    ///
    /// Preference ladder: the pair that best fills `target_file_size`
    /// without exceeding it, else the two smallest segments if their
    /// combined size stays under `max_file_size`. Segments already being
    /// merged are skipped. The chosen pair is marked as merging.
    pub fn shrink_candidates(
        &self,
        target_file_size: u64,
        max_file_size: u64,
    ) -> Option<(String, String)> {
        let segments = self.segments.read();
        let mut idle: Vec<&Arc<Segment>> =
            segments.iter().filter(|s| !s.is_merging()).collect();
        if idle.len() < 2 {
            return None;
        }
        idle.sort_by_key(|s| s.file_size());

        let mut best: Option<(usize, usize, u64)> = None;
        for i in 0..idle.len() {
            for j in (i + 1)..idle.len() {
                let combined = idle[i].file_size() + idle[j].file_size();
                if combined <= target_file_size
                    && best.map(|(_, _, size)| combined > size).unwrap_or(true)
                {
                    best = Some((i, j, combined));
                }
            }
        }
        let (i, j) = match best {
            Some((i, j, _)) => (i, j),
            None => {
                // fall back to the two smallest under the hard ceiling
                if idle[0].file_size() + idle[1].file_size() <= max_file_size {
                    (0, 1)
                } else {
                    return None;
                }
            }
        };
        idle[i].set_merging(true);
        idle[j].set_merging(true);
        Some((idle[i].name().to_string(), idle[j].name().to_string()))
    }

    /// Clear the merging mark on a segment, making it eligible for the
    /// next compaction round (used when a queued merge job fails).
    pub fn release_merge_mark(&self, name: &str) {
        if let Some(segment) = self.segments.read().iter().find(|s| s.name() == name) {
            segment.set_merging(false);
        }
    }

    /// Number of mounted segments.
    pub fn entries(&self) -> usize {
        self.segments.read().len()
    }

    /// File sizes of all mounted segments.
    pub fn sizes(&self) -> Vec<u64> {
        self.segments.read().iter().map(|s| s.file_size()).collect()
    }

    /// Total bytes of all mounted segment files.
    pub fn backend_size(&self) -> u64 {
        self.segments.read().iter().map(|s| s.file_size()).sum()
    }

    /// Total number of live containers across all segments (a term split
    /// over several segments counts once per fragment).
    pub fn container_count(&self) -> usize {
        self.segments.read().iter().map(|s| s.len()).sum()
    }

    /// Sorted union of live term hashes, starting at `start` (inclusive).
    /// With `rotating`, terms below `start` follow at the end instead of
    /// being dropped.
    pub fn keys(&self, start: Option<&TermHash>, rotating: bool) -> Vec<TermHash> {
        let mut terms: BTreeSet<TermHash> = BTreeSet::new();
        for segment in self.snapshot() {
            terms.extend(segment.terms());
        }
        let sorted: Vec<TermHash> = terms.into_iter().collect();
        match start {
            None => sorted,
            Some(start) => {
                let split = sorted.partition_point(|t| t < start);
                let mut out = sorted[split..].to_vec();
                if rotating {
                    out.extend_from_slice(&sorted[..split]);
                }
                out
            }
        }
    }

    /// True once accumulated corruption crosses the configured threshold;
    /// surrounding tooling should rebuild the index from its source.
    pub fn needs_rebuild(&self) -> bool {
        let errors: usize = self.segments.read().iter().map(|s| s.error_count()).sum();
        errors > self.corruption_threshold
    }

    /// Unmount everything and delete all segment files.
    pub fn clear(&self) -> Result<()> {
        let names: Vec<String> = self
            .segments
            .read()
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        for name in names {
            self.unmount_and_delete(&name)?;
        }
        Ok(())
    }
}

fn parse_seq(name: &str) -> Option<u64> {
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posting::row::{Posting, REF_KEY_LEN, TERM_HASH_LEN};
    use crate::storage::MemoryStorage;

    fn term(tag: u8) -> TermHash {
        TermHash([tag; TERM_HASH_LEN])
    }

    fn key(tag: u8) -> RefKey {
        RefKey([tag; REF_KEY_LEN])
    }

    fn list(t: u8, entries: &[(u8, u64)]) -> PostingList {
        let mut out = PostingList::new(term(t));
        for &(k, modified) in entries {
            out.put_recent(Posting::new(key(k), modified, 0));
        }
        out
    }

    fn write_segment(store: &SegmentStore, lists: &[PostingList]) -> String {
        let name = store.next_segment_name();
        let mut writer = SegmentWriter::create(store.storage.as_ref(), &name).unwrap();
        for l in lists {
            writer.add(l).unwrap();
        }
        writer.finish().unwrap();
        store.mount(&name).unwrap();
        name
    }

    fn new_store() -> SegmentStore {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        SegmentStore::open(storage, 32).unwrap()
    }

    #[test]
    fn test_get_merges_across_segments() {
        let store = new_store();
        write_segment(&store, &[list(1, &[(1, 100), (2, 100)])]);
        write_segment(&store, &[list(1, &[(2, 500), (3, 100)])]);

        let merged = store.get(&term(1), None).unwrap().unwrap();
        assert_eq!(merged.len(), 3);
        assert_eq!(merged.get(&key(2)).unwrap().last_modified, 500);
        assert_eq!(store.count(&term(1)), 4);
    }

    #[test]
    fn test_merge_two_preserves_content() {
        let store = new_store();
        let a = write_segment(
            &store,
            &[list(1, &[(1, 100)]), list(2, &[(2, 100), (3, 300)])],
        );
        let b = write_segment(&store, &[list(2, &[(3, 100), (4, 100)]), list(3, &[(5, 100)])]);

        let merged = store.merge_two(&a, &b).unwrap();
        assert_eq!(store.entries(), 1);
        assert!(store.storage.file_exists(&merged));
        assert!(!store.storage.file_exists(&a));
        assert!(!store.storage.file_exists(&b));

        let t2 = store.get(&term(2), None).unwrap().unwrap();
        assert_eq!(t2.len(), 3);
        // most recent fragment wins for the duplicate key
        assert_eq!(t2.get(&key(3)).unwrap().last_modified, 300);
        assert!(store.has(&term(1)));
        assert!(store.has(&term(3)));
    }

    #[test]
    fn test_merge_two_with_empty_side_keeps_survivor() {
        let store = new_store();
        let a = write_segment(&store, &[list(1, &[(1, 100)])]);
        let b = write_segment(&store, &[list(2, &[(2, 100)])]);

        // hollow out segment a
        store
            .segments
            .read()
            .iter()
            .find(|s| s.name() == a)
            .unwrap()
            .delete(&term(1))
            .unwrap();

        let survivor = store.merge_two(&a, &b).unwrap();
        assert_eq!(survivor, b);
        assert_eq!(store.entries(), 1);
        assert!(!store.storage.file_exists(&a));
    }

    #[test]
    fn test_shrink_candidates_skips_merging_and_respects_limits() {
        let store = new_store();
        let a = write_segment(&store, &[list(1, &[(1, 100)])]);
        let b = write_segment(&store, &[list(2, &[(2, 100)])]);
        let c = write_segment(&store, &[list(3, &[(3, 100)]), list(4, &[(4, 100)])]);

        let pair = store.shrink_candidates(1 << 20, 1 << 22).unwrap();
        // the best-filling pair under target includes the largest file
        assert!(pair.0 == c || pair.1 == c);

        // marked pair is skipped on the next round; only one idle segment left
        assert!(store.shrink_candidates(1 << 20, 1 << 22).is_none());
        let _ = (a, b);
    }

    #[test]
    fn test_shrink_candidates_none_over_max() {
        let store = new_store();
        write_segment(&store, &[list(1, &[(1, 100)])]);
        write_segment(&store, &[list(2, &[(2, 100)])]);
        assert!(store.shrink_candidates(1, 1).is_none());
    }

    #[test]
    fn test_keys_rotating() {
        let store = new_store();
        write_segment(
            &store,
            &[list(1, &[(1, 100)]), list(3, &[(1, 100)]), list(5, &[(1, 100)])],
        );

        let from_three = store.keys(Some(&term(3)), false);
        assert_eq!(from_three, vec![term(3), term(5)]);

        let rotated = store.keys(Some(&term(3)), true);
        assert_eq!(rotated, vec![term(3), term(5), term(1)]);
    }

    #[test]
    fn test_delete_and_remove() {
        let store = new_store();
        write_segment(&store, &[list(1, &[(1, 100), (2, 100), (3, 100)])]);
        write_segment(&store, &[list(1, &[(4, 100)])]);

        let victims: BTreeSet<RefKey> = [key(2)].into_iter().collect();
        assert_eq!(store.remove(&term(1), &victims).unwrap(), 1);
        assert_eq!(store.count(&term(1)), 3);

        let removed = store.delete(&term(1)).unwrap().unwrap();
        assert_eq!(removed.len(), 3);
        assert!(!store.has(&term(1)));
    }

    #[test]
    fn test_reopen_remounts_segments() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        {
            let store = SegmentStore::open(Arc::clone(&storage), 32).unwrap();
            write_segment(&store, &[list(1, &[(1, 100)])]);
        }
        let reopened = SegmentStore::open(storage, 32).unwrap();
        assert_eq!(reopened.entries(), 1);
        assert!(reopened.has(&term(1)));
        // sequence numbering continues past the mounted file
        assert_eq!(reopened.next_segment_name(), "rwi.00000001.seg");
    }
}
