//! The index cell: one RAM cache in front of one segment store.
//!
//! Writes land in the cache; a two-tier maintenance policy moves them to
//! disk. The RAM tier dumps the whole cache as a new segment once it holds
//! too many terms (or on signaled memory pressure). The disk tier merges
//! segment pairs once there are too many files, throttled by a cooldown
//! and by dispatcher backlog. Both tiers trigger from the write path, so a
//! cell needs no timer thread of its own.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::cache::RamCache;
use crate::config::{CellConfig, CellManifest};
use crate::dispatcher::{Job, MergeDispatcher};
use crate::error::Result;
use crate::posting::list::PostingList;
use crate::posting::row::{Posting, RefKey, TermHash};
use crate::segment::heap::SegmentWriter;
use crate::segment::store::SegmentStore;
use crate::storage::{FileStorage, Storage, StorageConfig};

/// The public storage unit of the index.
pub struct IndexCell {
    config: CellConfig,
    storage: Arc<dyn Storage>,
    ram: Arc<RwLock<Arc<RamCache>>>,
    store: Arc<SegmentStore>,
    dispatcher: Option<MergeDispatcher>,
    write_count: AtomicUsize,
    memory_pressure: AtomicBool,
    last_shrink: Mutex<Instant>,
    closed: AtomicBool,
}

impl std::fmt::Debug for IndexCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexCell")
            .field("buffer_terms", &self.buffer_size())
            .field("segments", &self.store.entries())
            .finish()
    }
}

impl IndexCell {
    /// Open a cell in a directory on the file system.
    pub fn open_dir<P: AsRef<Path>>(dir: P, config: CellConfig) -> Result<Self> {
        let storage: Arc<dyn Storage> =
            Arc::new(FileStorage::new(dir, StorageConfig::default())?);
        Self::open(storage, config)
    }

    /// Open a cell on any storage backend. Creates or validates the
    /// schema manifest and mounts all existing segments.
    pub fn open(storage: Arc<dyn Storage>, config: CellConfig) -> Result<Self> {
        config.validate()?;
        CellManifest::load_or_create(storage.as_ref())?;
        let store = Arc::new(SegmentStore::open(
            Arc::clone(&storage),
            config.corruption_threshold,
        )?);
        let dispatcher = config
            .background_io
            .then(|| MergeDispatcher::new(config.dump_queue_len, config.merge_queue_len));
        info!("opened index cell with {} segments", store.entries());
        Ok(IndexCell {
            config,
            storage,
            ram: Arc::new(RwLock::new(Arc::new(RamCache::new()))),
            store,
            dispatcher,
            write_count: AtomicUsize::new(0),
            memory_pressure: AtomicBool::new(false),
            last_shrink: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        })
    }

    fn ram(&self) -> Arc<RamCache> {
        Arc::clone(&self.ram.read())
    }

    /// Add one posting for one term.
    pub fn add(&self, term: TermHash, posting: Posting) -> Result<()> {
        self.ram().add(term, posting);
        self.after_write()
    }

    /// Add a whole posting list, most-recent-wins per key.
    pub fn add_list(&self, list: &PostingList) -> Result<()> {
        self.ram().add_list(list);
        self.after_write()
    }

    fn after_write(&self) -> Result<()> {
        let writes = self.write_count.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % self.config.clean_cache_interval == 0 {
            self.clean_cache()?;
        }
        Ok(())
    }

    /// Run the maintenance policy now. Called automatically every Nth
    /// write.
    pub fn clean_cache(&self) -> Result<()> {
        let pressured = self.memory_pressure.swap(false, Ordering::AcqRel);
        if pressured || self.ram().len() >= self.config.max_ram_entries {
            self.dump_buffer(false)?;
        } else if self.ram().max_references() >= self.config.max_chunk_size {
            // one hot term can exhaust RAM long before the entry limit
            self.evict_container()?;
        }
        self.try_shrink();
        Ok(())
    }

    /// Move the best flush candidate out of the buffer into its own
    /// single-container segment.
    fn evict_container(&self) -> Result<()> {
        let ram = self.ram();
        let Some(term) = ram.flush_candidate(self.config.max_chunk_size) else {
            return Ok(());
        };
        let Some(list) = ram.delete(&term) else {
            return Ok(());
        };
        debug!("evicting container {term} with {} postings", list.len());

        let name = self.store.next_segment_name();
        let storage = Arc::clone(&self.storage);
        let store = Arc::clone(&self.store);
        let live = Arc::clone(&self.ram);
        let job: Job = Box::new(move || {
            let write = || -> Result<()> {
                let mut writer = SegmentWriter::create(storage.as_ref(), &name)?;
                writer.add(&list)?;
                writer.finish()?;
                store.mount(&name)
            };
            if let Err(e) = write() {
                warn!("container eviction to {name} failed, merging back: {e}");
                live.read().add_list(&list);
                return Err(e);
            }
            Ok(())
        });
        match &self.dispatcher {
            Some(dispatcher) => {
                dispatcher.submit_dump(job);
                Ok(())
            }
            None => job(),
        }
    }

    /// Signal external memory pressure; the next maintenance pass dumps
    /// the buffer regardless of its size.
    pub fn set_memory_pressure(&self) {
        self.memory_pressure.store(true, Ordering::Release);
    }

    /// Swap in a fresh cache and move the old one to disk. With `inline`
    /// (or with background I/O disabled) the dump runs on this thread and
    /// its error is returned; otherwise it is queued.
    fn dump_buffer(&self, inline: bool) -> Result<()> {
        let old = {
            let mut guard = self.ram.write();
            std::mem::replace(&mut *guard, Arc::new(RamCache::new()))
        };
        if old.is_empty() {
            return Ok(());
        }
        debug!("dumping buffer with {} containers", old.len());

        let name = self.store.next_segment_name();
        let storage = Arc::clone(&self.storage);
        let store = Arc::clone(&self.store);
        let live = Arc::clone(&self.ram);
        let job: Job = Box::new(move || {
            let dumped = old
                .dump(storage.as_ref(), &name)
                .and_then(|_| store.mount(&name));
            if let Err(e) = dumped {
                // keep the postings queryable until a dump succeeds
                warn!("buffer dump to {name} failed, merging back into cache: {e}");
                let cache = Arc::clone(&live.read());
                for list in old.sorted_lists() {
                    cache.add_list(&list);
                }
                return Err(e);
            }
            Ok(())
        });

        match (&self.dispatcher, inline) {
            (Some(dispatcher), false) => {
                dispatcher.submit_dump(job);
                Ok(())
            }
            _ => job(),
        }
    }

    /// Disk-tier maintenance: schedule one pairwise segment merge when
    /// the store has grown past its limit, at most once per cooldown.
    fn try_shrink(&self) {
        if self.store.entries() <= self.config.segment_limit {
            return;
        }
        if let Some(dispatcher) = &self.dispatcher {
            if dispatcher.queue_len() > 0 {
                return;
            }
        }
        {
            let mut last = self.last_shrink.lock();
            let cooldown = Duration::from_secs(self.config.compaction_cooldown_secs);
            if last.elapsed() < cooldown {
                return;
            }
            *last = Instant::now();
        }

        let Some((a, b)) = self
            .store
            .shrink_candidates(self.config.target_file_size, self.config.max_file_size)
        else {
            return;
        };
        let store = Arc::clone(&self.store);
        let job: Job = Box::new(move || {
            store.merge_two(&a, &b).map(|_| ()).inspect_err(|_| {
                store.release_merge_mark(&a);
                store.release_merge_mark(&b);
            })
        });
        match &self.dispatcher {
            Some(dispatcher) => dispatcher.submit_merge(job),
            None => {
                if let Err(e) = job() {
                    warn!("inline segment merge failed: {e}");
                }
            }
        }
    }

    /// Read one term's container, merged across RAM and disk. A term
    /// present on only one side is returned without copying work.
    pub fn get(
        &self,
        term: &TermHash,
        filter: Option<&BTreeSet<RefKey>>,
    ) -> Result<Option<PostingList>> {
        let ram_side = self.ram().get(term, filter);
        let disk_side = self.store.get(term, filter)?;
        Ok(match (ram_side, disk_side) {
            (Some(r), Some(d)) => Some(r.merge(&d)),
            (Some(r), None) => Some(r),
            (None, Some(d)) => Some(d),
            (None, None) => None,
        })
    }

    pub fn has(&self, term: &TermHash) -> bool {
        self.ram().has(term) || self.store.has(term)
    }

    /// Number of postings for one term across both layers (duplicates
    /// counted per fragment).
    pub fn count(&self, term: &TermHash) -> usize {
        self.ram().count(term) + self.store.count(term)
    }

    /// Remove one term everywhere and return the union of its postings.
    pub fn delete(&self, term: &TermHash) -> Result<Option<PostingList>> {
        let ram_side = self.ram().delete(term);
        let disk_side = self.store.delete(term)?;
        Ok(match (ram_side, disk_side) {
            (Some(r), Some(d)) => Some(r.merge(&d)),
            (Some(r), None) => Some(r),
            (None, Some(d)) => Some(d),
            (None, None) => None,
        })
    }

    /// Remove specific reference keys from one term everywhere. Returns
    /// the number of postings removed.
    pub fn remove(&self, term: &TermHash, keys: &BTreeSet<RefKey>) -> Result<usize> {
        let from_ram = self.ram().remove(term, keys);
        let from_disk = self.store.remove(term, keys)?;
        Ok(from_ram + from_disk)
    }

    /// Container count over both layers. A term buffered and stored at
    /// the same time counts once per layer.
    pub fn size(&self) -> usize {
        self.buffer_size() + self.backend_size()
    }

    /// Term containers currently buffered in RAM.
    pub fn buffer_size(&self) -> usize {
        self.ram().len()
    }

    /// Size of the largest buffered container.
    pub fn buffer_max_references(&self) -> usize {
        self.ram().max_references()
    }

    /// Approximate bytes of buffered postings.
    pub fn buffer_used_memory(&self) -> usize {
        self.ram().used_memory()
    }

    /// Live containers across all mounted segments.
    pub fn backend_size(&self) -> usize {
        self.store.container_count()
    }

    /// Total bytes of all segment files.
    pub fn backend_bytes(&self) -> u64 {
        self.store.backend_size()
    }

    /// Number of mounted segment files.
    pub fn segment_count(&self) -> usize {
        self.store.entries()
    }

    /// True once disk corruption crossed the configured threshold and the
    /// index should be rebuilt from its source.
    pub fn needs_rebuild(&self) -> bool {
        self.store.needs_rebuild()
    }

    /// Drop everything, RAM and disk.
    pub fn clear(&self) -> Result<()> {
        self.ram().clear();
        self.store.clear()
    }

    /// Dump the buffer to disk now, on this thread.
    pub fn flush(&self) -> Result<()> {
        self.dump_buffer(true)
    }

    /// Sorted term hashes over both layers, starting at `start`. With
    /// `rotating`, terms below `start` follow at the end.
    pub fn container_keys(&self, start: Option<&TermHash>, rotating: bool) -> Vec<TermHash> {
        let mut terms: BTreeSet<TermHash> = self.ram().terms().into_iter().collect();
        terms.extend(self.store.keys(None, false));
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

    /// Iterate merged containers in term order, starting at `start`.
    pub fn containers(&self, start: Option<&TermHash>, rotating: bool) -> ContainerIter<'_> {
        ContainerIter {
            cell: self,
            keys: self.container_keys(start, rotating).into_iter(),
        }
    }

    /// Cap every oversized container at `max_references` postings by
    /// dropping its oldest-modified entries. Returns the number of
    /// postings dropped.
    pub fn delete_old(&self, max_references: usize) -> Result<usize> {
        let mut dropped = 0;
        for term in self.container_keys(None, false) {
            if self.count(&term) <= max_references {
                continue;
            }
            let Some(mut merged) = self.get(&term, None)? else {
                continue;
            };
            let removed = merged.shrink_to(max_references);
            if removed == 0 {
                continue;
            }
            // rewrite the capped container through the buffer
            self.delete(&term)?;
            self.ram().add_list(&merged);
            dropped += removed;
        }
        if dropped > 0 {
            info!("delete_old dropped {dropped} postings");
        }
        Ok(dropped)
    }

    /// Final dump and shutdown. The buffer is written out unconditionally
    /// before the dispatcher is drained and stopped.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.dump_buffer(true);
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.terminate();
        }
        self.storage.sync()?;
        result
    }
}

impl Drop for IndexCell {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(e) = self.close() {
                warn!("error closing index cell: {e}");
            }
        }
    }
}

/// Iterator over merged containers in term-hash order.
pub struct ContainerIter<'a> {
    cell: &'a IndexCell,
    keys: std::vec::IntoIter<TermHash>,
}

impl Iterator for ContainerIter<'_> {
    type Item = Result<PostingList>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let term = self.keys.next()?;
            match self.cell.get(&term, None) {
                Ok(Some(list)) => return Some(Ok(list)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
