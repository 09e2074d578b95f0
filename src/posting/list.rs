//! Sorted, key-unique posting containers.

use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;
use crate::posting::row::{Posting, RefKey, TermHash};

/// Current wall clock in epoch seconds.
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// All postings for one term, sorted by reference key with unique keys.
///
/// On key collision the posting with the greater `last_modified` wins,
/// making merges commutative and idempotent.
#[derive(Debug, Clone)]
pub struct PostingList {
    term: TermHash,
    postings: Vec<Posting>,
    /// Epoch seconds of the last mutation; used by flush-candidate
    /// scoring.
    last_wrote: u64,
}

impl PostingList {
    pub fn new(term: TermHash) -> Self {
        PostingList {
            term,
            postings: Vec::new(),
            last_wrote: now_secs(),
        }
    }

    pub fn with_capacity(term: TermHash, capacity: usize) -> Self {
        PostingList {
            term,
            postings: Vec::with_capacity(capacity),
            last_wrote: now_secs(),
        }
    }

    pub fn term(&self) -> &TermHash {
        &self.term
    }

    pub fn len(&self) -> usize {
        self.postings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.postings.is_empty()
    }

    /// Epoch seconds of the last mutation.
    pub fn last_wrote(&self) -> u64 {
        self.last_wrote
    }

    pub fn postings(&self) -> &[Posting] {
        &self.postings
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Posting> {
        self.postings.iter()
    }

    fn find(&self, key: &RefKey) -> std::result::Result<usize, usize> {
        self.postings.binary_search_by(|p| p.ref_key.cmp(key))
    }

    pub fn get(&self, key: &RefKey) -> Option<&Posting> {
        self.find(key).ok().map(|i| &self.postings[i])
    }

    pub fn has(&self, key: &RefKey) -> bool {
        self.find(key).is_ok()
    }

    /// Insert a posting, keeping the most recently modified one on key
    /// collision. Returns true if the list changed.
    pub fn put_recent(&mut self, posting: Posting) -> bool {
        match self.find(&posting.ref_key) {
            Ok(i) => {
                if self.postings[i].last_modified < posting.last_modified {
                    self.postings[i] = posting;
                    self.last_wrote = now_secs();
                    true
                } else {
                    false
                }
            }
            Err(i) => {
                self.postings.insert(i, posting);
                self.last_wrote = now_secs();
                true
            }
        }
    }

    /// Insert every posting of `other`, most-recent-wins. Returns the
    /// number of postings that changed this list.
    pub fn add_all_recent(&mut self, other: &PostingList) -> usize {
        let mut changed = 0;
        for posting in &other.postings {
            if self.put_recent(*posting) {
                changed += 1;
            }
        }
        changed
    }

    /// Merge two lists into a new one, most-recent-wins on collisions.
    /// Commutative: `a.merge(b)` and `b.merge(a)` contain the same
    /// postings.
    pub fn merge(&self, other: &PostingList) -> PostingList {
        let mut out = PostingList::with_capacity(self.term, self.len() + other.len());
        let (a, b) = (&self.postings, &other.postings);
        let (mut i, mut j) = (0, 0);
        while i < a.len() && j < b.len() {
            match a[i].ref_key.cmp(&b[j].ref_key) {
                std::cmp::Ordering::Less => {
                    out.postings.push(a[i]);
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    out.postings.push(b[j]);
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    if a[i].last_modified >= b[j].last_modified {
                        out.postings.push(a[i]);
                    } else {
                        out.postings.push(b[j]);
                    }
                    i += 1;
                    j += 1;
                }
            }
        }
        out.postings.extend_from_slice(&a[i..]);
        out.postings.extend_from_slice(&b[j..]);
        out
    }

    /// Remove the posting for one key.
    pub fn remove(&mut self, key: &RefKey) -> Option<Posting> {
        match self.find(key) {
            Ok(i) => {
                self.last_wrote = now_secs();
                Some(self.postings.remove(i))
            }
            Err(_) => None,
        }
    }

    /// Remove every posting whose key is in `keys`. Returns the number
    /// removed.
    pub fn remove_entries(&mut self, keys: &BTreeSet<RefKey>) -> usize {
        let before = self.postings.len();
        self.postings.retain(|p| !keys.contains(&p.ref_key));
        let removed = before - self.postings.len();
        if removed > 0 {
            self.last_wrote = now_secs();
        }
        removed
    }

    /// Keep only postings whose key is in `keys`.
    pub fn retain_keys(&mut self, keys: &BTreeSet<RefKey>) {
        self.postings.retain(|p| keys.contains(&p.ref_key));
    }

    /// Re-establish the sorted-unique invariant after bulk decoding,
    /// most-recent-wins on duplicate keys.
    pub fn dedupe(&mut self) {
        if self.postings.len() < 2 {
            return;
        }
        self.postings
            .sort_by(|a, b| a.ref_key.cmp(&b.ref_key).then(a.last_modified.cmp(&b.last_modified)));
        // after the secondary sort the last duplicate is the most recent
        let mut deduped: Vec<Posting> = Vec::with_capacity(self.postings.len());
        for posting in self.postings.drain(..) {
            match deduped.last_mut() {
                Some(last) if last.ref_key == posting.ref_key => *last = posting,
                _ => deduped.push(posting),
            }
        }
        self.postings = deduped;
    }

    /// Cap the list at `max` postings by dropping the oldest-modified
    /// ones. Returns the number dropped.
    pub fn shrink_to(&mut self, max: usize) -> usize {
        if self.postings.len() <= max {
            return 0;
        }
        let excess = self.postings.len() - max;
        let mut by_age: Vec<(u64, RefKey)> = self
            .postings
            .iter()
            .map(|p| (p.last_modified, p.ref_key))
            .collect();
        by_age.sort();
        let victims: BTreeSet<RefKey> = by_age.iter().take(excess).map(|&(_, k)| k).collect();
        self.remove_entries(&victims)
    }

    /// Write all postings as concatenated fixed-width rows.
    pub fn encode_into<W: Write>(&self, writer: &mut W) -> Result<()> {
        for posting in &self.postings {
            posting.encode_into(writer)?;
        }
        Ok(())
    }

    /// Read `count` fixed-width rows. The decoded list is sorted and
    /// deduplicated in case the source was written unordered.
    pub fn decode<R: Read>(term: TermHash, reader: &mut R, count: usize) -> Result<Self> {
        let mut list = PostingList::with_capacity(term, count);
        for _ in 0..count {
            list.postings.push(Posting::decode(reader)?);
        }
        list.dedupe();
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posting::row::REF_KEY_LEN;
    use std::io::Cursor;

    fn term() -> TermHash {
        TermHash([9; 12])
    }

    fn key(tag: u8) -> RefKey {
        RefKey([tag; REF_KEY_LEN])
    }

    fn list_of(entries: &[(u8, u64)]) -> PostingList {
        let mut list = PostingList::new(term());
        for &(tag, modified) in entries {
            list.put_recent(Posting::new(key(tag), modified, 0));
        }
        list
    }

    #[test]
    fn test_put_recent_most_recent_wins() {
        let mut list = PostingList::new(term());
        assert!(list.put_recent(Posting::new(key(1), 200, 0)));
        // older posting for the same key is ignored
        assert!(!list.put_recent(Posting::new(key(1), 100, 0)));
        assert!(list.put_recent(Posting::new(key(1), 300, 0)));
        assert_eq!(list.len(), 1);
        assert_eq!(list.get(&key(1)).unwrap().last_modified, 300);
    }

    #[test]
    fn test_merge_is_commutative() {
        let a = list_of(&[(1, 100), (2, 500), (4, 50)]);
        let b = list_of(&[(2, 400), (3, 300)]);

        let ab = a.merge(&b);
        let ba = b.merge(&a);
        assert_eq!(ab.postings(), ba.postings());
        assert_eq!(ab.len(), 4);
        assert_eq!(ab.get(&key(2)).unwrap().last_modified, 500);
    }

    #[test]
    fn test_remove_entries() {
        let mut list = list_of(&[(1, 1), (2, 2), (3, 3)]);
        let victims: BTreeSet<RefKey> = [key(1), key(3), key(9)].into_iter().collect();
        assert_eq!(list.remove_entries(&victims), 2);
        assert_eq!(list.len(), 1);
        assert!(list.has(&key(2)));
    }

    #[test]
    fn test_shrink_to_drops_oldest() {
        let mut list = list_of(&[(1, 10), (2, 40), (3, 20), (4, 30)]);
        assert_eq!(list.shrink_to(2), 2);
        assert_eq!(list.len(), 2);
        assert!(list.has(&key(2)));
        assert!(list.has(&key(4)));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let list = list_of(&[(3, 30), (1, 10), (2, 20)]);
        let mut buf = Vec::new();
        list.encode_into(&mut buf).unwrap();

        let decoded = PostingList::decode(term(), &mut Cursor::new(&buf), list.len()).unwrap();
        assert_eq!(decoded.postings(), list.postings());
    }

    #[test]
    fn test_dedupe_keeps_most_recent() {
        let mut list = PostingList::new(term());
        list.postings.push(Posting::new(key(2), 100, 0));
        list.postings.push(Posting::new(key(1), 50, 0));
        list.postings.push(Posting::new(key(2), 300, 0));
        list.dedupe();
        assert_eq!(list.len(), 2);
        assert_eq!(list.get(&key(2)).unwrap().last_modified, 300);
    }
}
