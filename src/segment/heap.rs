//! One segment file: sorted posting containers with an in-memory index.
//!
//! A segment is written once in ascending term-hash order and never grows
//! afterwards. Deletes punch a hole (`used = 0`) and container rewrites
//! shrink `used` in place, so the file stays sequentially scannable: the
//! record framing (`capacity`) is never touched after the initial write.

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use log::warn;
use parking_lot::RwLock;

use crate::error::{Result, RwiError};
use crate::posting::list::PostingList;
use crate::posting::row::{TermHash, ROW_WIDTH, TERM_HASH_LEN};
use crate::storage::{Storage, StorageInput, StorageOutput};

const MAGIC: &[u8; 4] = b"RWIS";
const FORMAT_VERSION: u16 = 1;

/// magic + version + term_len + row_width + crc32
const HEADER_LEN: u64 = 4 + 2 + 1 + 2 + 4;

/// term hash + capacity + used
const RECORD_HEADER_LEN: u64 = TERM_HASH_LEN as u64 + 4 + 4;

fn header_bytes() -> Vec<u8> {
    let mut header = Vec::with_capacity(HEADER_LEN as usize);
    header.extend_from_slice(MAGIC);
    let _ = header.write_u16::<LittleEndian>(FORMAT_VERSION);
    let _ = header.write_u8(TERM_HASH_LEN as u8);
    let _ = header.write_u16::<LittleEndian>(ROW_WIDTH as u16);
    let mut hasher = Hasher::new();
    hasher.update(&header);
    let _ = header.write_u32::<LittleEndian>(hasher.finalize());
    header
}

/// Location of one container record inside a segment file.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordPtr {
    /// Offset of the record (its term hash) from the file start.
    offset: u64,
    /// Reserved row bytes, fixed at write time.
    capacity: u32,
    /// Valid row bytes, `<= capacity`; shrinks on delete/rewrite.
    used: u32,
}

/// Sequential writer producing one segment file.
///
/// Containers must be added in strictly ascending term-hash order; empty
/// containers are skipped.
pub struct SegmentWriter {
    output: Box<dyn StorageOutput>,
    last_term: Option<TermHash>,
    records: usize,
}

impl SegmentWriter {
    pub fn create(storage: &dyn Storage, name: &str) -> Result<Self> {
        let mut output = storage.create_output(name)?;
        std::io::Write::write_all(&mut output, &header_bytes())?;
        Ok(SegmentWriter {
            output,
            last_term: None,
            records: 0,
        })
    }

    /// Append one container. Out-of-order terms are a segment error.
    pub fn add(&mut self, list: &PostingList) -> Result<()> {
        if list.is_empty() {
            return Ok(());
        }
        if let Some(last) = &self.last_term {
            if list.term() <= last {
                return Err(RwiError::segment(format!(
                    "out-of-order container {} after {}",
                    list.term(),
                    last
                )));
            }
        }
        let bytes = (list.len() * ROW_WIDTH) as u32;
        std::io::Write::write_all(&mut self.output, list.term().as_bytes())?;
        self.output.write_u32::<LittleEndian>(bytes)?;
        self.output.write_u32::<LittleEndian>(bytes)?;
        list.encode_into(&mut self.output)?;
        self.last_term = Some(*list.term());
        self.records += 1;
        Ok(())
    }

    /// Number of containers written so far.
    pub fn records(&self) -> usize {
        self.records
    }

    /// Flush, sync, and close the file.
    pub fn finish(mut self) -> Result<()> {
        self.output.close()
    }
}

/// One mounted segment file.
pub struct Segment {
    name: String,
    storage: Arc<dyn Storage>,
    index: RwLock<BTreeMap<TermHash, RecordPtr>>,
    file_size: u64,
    /// Corrupt records seen during scan or read.
    error_count: AtomicUsize,
    /// Set while this segment participates in a compaction merge.
    is_merging: AtomicBool,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("containers", &self.index.read().len())
            .field("file_size", &self.file_size)
            .finish()
    }
}

impl Segment {
    /// Mount a segment: validate the header and build the term index by a
    /// sequential scan. Corrupt records are logged, counted, and treated
    /// as absent; the rest of the segment stays readable.
    pub fn mount(storage: Arc<dyn Storage>, name: &str) -> Result<Self> {
        let file_size = storage.file_size(name)?;
        let mut input = storage.open_input(name)?;
        Self::check_header(name, &mut input)?;

        let mut index = BTreeMap::new();
        let mut errors = 0usize;
        let mut pos = HEADER_LEN;
        let mut last_term: Option<TermHash> = None;

        while pos + RECORD_HEADER_LEN <= file_size {
            let mut hash = [0u8; TERM_HASH_LEN];
            input.read_exact(&mut hash)?;
            let term = TermHash(hash);
            let capacity = input.read_u32::<LittleEndian>()?;
            let used = input.read_u32::<LittleEndian>()?;

            let end = pos + RECORD_HEADER_LEN + capacity as u64;
            if used > capacity
                || capacity as usize % ROW_WIDTH != 0
                || used as usize % ROW_WIDTH != 0
                || end > file_size
            {
                // framing is unreliable from here on
                warn!("segment {name}: corrupt record at offset {pos}, truncating scan");
                errors += 1;
                break;
            }
            if let Some(last) = &last_term {
                if term <= *last {
                    // framing intact, key order broken: skip the record
                    warn!("segment {name}: out-of-order record at offset {pos}, skipping");
                    errors += 1;
                    input.seek(SeekFrom::Start(end))?;
                    pos = end;
                    continue;
                }
            }
            last_term = Some(term);
            if used > 0 {
                index.insert(
                    term,
                    RecordPtr {
                        offset: pos,
                        capacity,
                        used,
                    },
                );
            }
            input.seek(SeekFrom::Start(end))?;
            pos = end;
        }

        Ok(Segment {
            name: name.to_string(),
            storage,
            index: RwLock::new(index),
            file_size,
            error_count: AtomicUsize::new(errors),
            is_merging: AtomicBool::new(false),
        })
    }

    fn check_header(name: &str, input: &mut Box<dyn StorageInput>) -> Result<()> {
        let mut fields = [0u8; 9];
        input.read_exact(&mut fields)?;
        if &fields[0..4] != MAGIC {
            return Err(RwiError::segment(format!("{name}: bad magic")));
        }
        let version = u16::from_le_bytes([fields[4], fields[5]]);
        if version != FORMAT_VERSION {
            return Err(RwiError::segment(format!(
                "{name}: unsupported format version {version}"
            )));
        }
        let term_len = fields[6] as usize;
        let row_width = u16::from_le_bytes([fields[7], fields[8]]) as usize;
        if term_len != TERM_HASH_LEN || row_width != ROW_WIDTH {
            return Err(RwiError::config(format!(
                "{name}: row schema mismatch (term_len {term_len}, row_width {row_width})"
            )));
        }
        let stored_crc = input.read_u32::<LittleEndian>()?;
        let mut hasher = Hasher::new();
        hasher.update(&fields);
        if stored_crc != hasher.finalize() {
            return Err(RwiError::segment(format!("{name}: header checksum mismatch")));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of live containers.
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn error_count(&self) -> usize {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn is_merging(&self) -> bool {
        self.is_merging.load(Ordering::Acquire)
    }

    pub fn set_merging(&self, merging: bool) {
        self.is_merging.store(merging, Ordering::Release);
    }

    pub fn has(&self, term: &TermHash) -> bool {
        self.index.read().contains_key(term)
    }

    /// Number of postings stored for one term.
    pub fn count(&self, term: &TermHash) -> usize {
        self.index
            .read()
            .get(term)
            .map(|ptr| ptr.used as usize / ROW_WIDTH)
            .unwrap_or(0)
    }

    /// Live term hashes in ascending order.
    pub fn terms(&self) -> Vec<TermHash> {
        self.index.read().keys().copied().collect()
    }

    /// Read one container. A record that fails to decode is counted as a
    /// corruption and reported as absent.
    pub fn get(&self, term: &TermHash) -> Result<Option<PostingList>> {
        let ptr = match self.index.read().get(term) {
            Some(ptr) => *ptr,
            None => return Ok(None),
        };
        let mut input = self.storage.open_input(&self.name)?;
        input.seek(SeekFrom::Start(ptr.offset + RECORD_HEADER_LEN))?;
        let count = ptr.used as usize / ROW_WIDTH;
        match PostingList::decode(*term, &mut input, count) {
            Ok(list) => Ok(Some(list)),
            Err(e) => {
                warn!("segment {}: unreadable container {term}: {e}", self.name);
                self.error_count.fetch_add(1, Ordering::Relaxed);
                self.index.write().remove(term);
                Ok(None)
            }
        }
    }

    /// Punch a hole for one term (`used = 0` in place). Returns the number
    /// of postings removed.
    pub fn delete(&self, term: &TermHash) -> Result<usize> {
        let ptr = match self.index.read().get(term) {
            Some(ptr) => *ptr,
            None => return Ok(0),
        };
        let mut rw = self.storage.open_rw(&self.name)?;
        rw.seek(SeekFrom::Start(ptr.offset + TERM_HASH_LEN as u64 + 4))?;
        rw.write_u32::<LittleEndian>(0)?;
        rw.close()?;
        self.index.write().remove(term);
        Ok(ptr.used as usize / ROW_WIDTH)
    }

    /// Rewrite one container in place. The rewriter receives the current
    /// container and returns its replacement; `None` (or an empty list)
    /// deletes the record. The replacement must fit the record's original
    /// capacity. Returns the number of row bytes removed.
    pub fn replace<F>(&self, term: &TermHash, rewrite: F) -> Result<u64>
    where
        F: FnOnce(PostingList) -> Option<PostingList>,
    {
        let ptr = match self.index.read().get(term) {
            Some(ptr) => *ptr,
            None => return Ok(0),
        };
        let current = match self.get(term)? {
            Some(list) => list,
            None => return Ok(0),
        };
        let replacement = match rewrite(current) {
            Some(list) if !list.is_empty() => list,
            _ => {
                let removed = self.delete(term)?;
                return Ok((removed * ROW_WIDTH) as u64);
            }
        };

        let new_used = (replacement.len() * ROW_WIDTH) as u32;
        if new_used > ptr.capacity {
            return Err(RwiError::segment(format!(
                "replacement for {term} exceeds record capacity ({new_used} > {})",
                ptr.capacity
            )));
        }

        let mut rw = self.storage.open_rw(&self.name)?;
        rw.seek(SeekFrom::Start(ptr.offset + TERM_HASH_LEN as u64 + 4))?;
        rw.write_u32::<LittleEndian>(new_used)?;
        replacement.encode_into(&mut rw)?;
        rw.close()?;

        self.index.write().insert(
            *term,
            RecordPtr {
                offset: ptr.offset,
                capacity: ptr.capacity,
                used: new_used,
            },
        );
        Ok((ptr.used - new_used) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posting::row::{Posting, RefKey, REF_KEY_LEN};
    use crate::storage::MemoryStorage;
    use std::collections::BTreeSet;

    fn term(tag: u8) -> TermHash {
        TermHash([tag; TERM_HASH_LEN])
    }

    fn key(tag: u8) -> RefKey {
        RefKey([tag; REF_KEY_LEN])
    }

    fn list(t: u8, keys: &[u8]) -> PostingList {
        let mut out = PostingList::new(term(t));
        for &k in keys {
            out.put_recent(Posting::new(key(k), 100, 0));
        }
        out
    }

    fn storage_with_segment(name: &str) -> Arc<dyn Storage> {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let mut writer = SegmentWriter::create(storage.as_ref(), name).unwrap();
        writer.add(&list(1, &[1, 2, 3])).unwrap();
        writer.add(&list(2, &[4])).unwrap();
        writer.add(&list(5, &[5, 6])).unwrap();
        writer.finish().unwrap();
        storage
    }

    #[test]
    fn test_write_mount_read() {
        let storage = storage_with_segment("s1.seg");
        let segment = Segment::mount(Arc::clone(&storage), "s1.seg").unwrap();

        assert_eq!(segment.len(), 3);
        assert_eq!(segment.count(&term(1)), 3);
        assert_eq!(segment.error_count(), 0);

        let loaded = segment.get(&term(5)).unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.has(&key(6)));
        assert!(segment.get(&term(9)).unwrap().is_none());
    }

    #[test]
    fn test_writer_rejects_out_of_order() {
        let storage = MemoryStorage::new_default();
        let mut writer = SegmentWriter::create(&storage, "s.seg").unwrap();
        writer.add(&list(5, &[1])).unwrap();
        assert!(writer.add(&list(2, &[1])).is_err());
    }

    #[test]
    fn test_delete_punches_hole_and_survives_remount() {
        let storage = storage_with_segment("s1.seg");
        let segment = Segment::mount(Arc::clone(&storage), "s1.seg").unwrap();

        assert_eq!(segment.delete(&term(2)).unwrap(), 1);
        assert!(!segment.has(&term(2)));

        // remount rebuilds the index from the file; the hole stays gone
        let remounted = Segment::mount(Arc::clone(&storage), "s1.seg").unwrap();
        assert_eq!(remounted.len(), 2);
        assert!(!remounted.has(&term(2)));
        assert!(remounted.has(&term(5)));
    }

    #[test]
    fn test_replace_shrinks_in_place() {
        let storage = storage_with_segment("s1.seg");
        let segment = Segment::mount(Arc::clone(&storage), "s1.seg").unwrap();

        let victims: BTreeSet<RefKey> = [key(1), key(3)].into_iter().collect();
        let removed = segment
            .replace(&term(1), |mut list| {
                list.remove_entries(&victims);
                Some(list)
            })
            .unwrap();
        assert_eq!(removed, (2 * ROW_WIDTH) as u64);
        assert_eq!(segment.count(&term(1)), 1);

        let remounted = Segment::mount(Arc::clone(&storage), "s1.seg").unwrap();
        let loaded = remounted.get(&term(1)).unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.has(&key(2)));
    }

    #[test]
    fn test_truncated_file_counts_corruption() {
        let storage = storage_with_segment("s1.seg");

        // chop the last record short
        let size = storage.file_size("s1.seg").unwrap();
        let mut input = storage.open_input("s1.seg").unwrap();
        let mut data = Vec::new();
        input.read_to_end(&mut data).unwrap();
        data.truncate(size as usize - ROW_WIDTH);
        let mut output = storage.create_output("s1.seg").unwrap();
        std::io::Write::write_all(&mut output, &data).unwrap();
        output.close().unwrap();

        let segment = Segment::mount(Arc::clone(&storage), "s1.seg").unwrap();
        assert_eq!(segment.error_count(), 1);
        // the intact prefix is still readable
        assert!(segment.has(&term(1)));
        assert!(segment.has(&term(2)));
        assert!(!segment.has(&term(5)));
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let storage = MemoryStorage::new_default();
        let mut output = storage.create_output("junk.seg").unwrap();
        std::io::Write::write_all(&mut output, b"not a segment file").unwrap();
        output.close().unwrap();

        let storage: Arc<dyn Storage> = Arc::new(storage);
        assert!(Segment::mount(storage, "junk.seg").is_err());
    }
}
