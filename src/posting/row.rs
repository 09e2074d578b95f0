//! Fixed-width posting rows.
//!
//! A posting describes one "term occurs in document" fact together with
//! positional and document-level metadata. Rows are encoded little-endian
//! at a fixed width so segment files can be scanned and point-read without
//! per-record framing.

use std::fmt;
use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Result, RwiError};

/// Width of a term hash in bytes.
pub const TERM_HASH_LEN: usize = 12;

/// Width of a reference key (document identifier) in bytes.
pub const REF_KEY_LEN: usize = 12;

/// Width of the encoded posting body following the reference key.
pub const POSTING_BODY_LEN: usize = 40;

/// Total width of one encoded posting row.
pub const ROW_WIDTH: usize = REF_KEY_LEN + POSTING_BODY_LEN;

/// Opaque fixed-width hash identifying one term.
///
/// Ordering is plain byte-wise comparison; segment files and iteration
/// order depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TermHash(pub [u8; TERM_HASH_LEN]);

impl TermHash {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; TERM_HASH_LEN] = bytes
            .try_into()
            .map_err(|_| RwiError::index(format!("term hash must be {TERM_HASH_LEN} bytes")))?;
        Ok(TermHash(arr))
    }

    pub fn as_bytes(&self) -> &[u8; TERM_HASH_LEN] {
        &self.0
    }
}

impl fmt::Display for TermHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Opaque fixed-width key identifying one referenced document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefKey(pub [u8; REF_KEY_LEN]);

impl RefKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; REF_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| RwiError::index(format!("reference key must be {REF_KEY_LEN} bytes")))?;
        Ok(RefKey(arr))
    }

    pub fn as_bytes(&self) -> &[u8; REF_KEY_LEN] {
        &self.0
    }
}

impl fmt::Display for RefKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// One posting: a term occurrence in one document.
///
/// `last_modified` arbitrates collisions: wherever two postings for the
/// same reference key meet, the more recently modified one wins.
/// `distance` is zero in stored postings and only accumulates in join
/// results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Posting {
    pub ref_key: RefKey,
    /// Epoch seconds of the referenced document's last modification.
    pub last_modified: u64,
    /// Epoch seconds until which the reference is considered fresh.
    pub fresh_until: u64,
    /// Word position of the first occurrence of the term in the text.
    pub pos_in_text: u16,
    /// Position of the term inside its phrase (sentence).
    pub pos_in_phrase: u8,
    /// Index of the phrase containing the first occurrence.
    pub phrase_index: u8,
    /// Number of occurrences of the term in the document.
    pub hit_count: u8,
    pub words_in_text: u16,
    pub phrases_in_text: u16,
    pub words_in_title: u8,
    /// Outbound links to the same host.
    pub out_links_same: u8,
    /// Outbound links to other hosts.
    pub out_links_other: u8,
    /// ISO 639-1 language code bytes.
    pub language: [u8; 2],
    pub doc_type: u8,
    pub flags: u32,
    /// Accumulated word distance; meaningful only in join results.
    pub distance: u16,
}

impl Posting {
    /// Minimal posting for the given key and position; remaining metadata
    /// zeroed.
    pub fn new(ref_key: RefKey, last_modified: u64, pos_in_text: u16) -> Self {
        Posting {
            ref_key,
            last_modified,
            fresh_until: last_modified,
            pos_in_text,
            pos_in_phrase: 0,
            phrase_index: 0,
            hit_count: 1,
            words_in_text: 0,
            phrases_in_text: 0,
            words_in_title: 0,
            out_links_same: 0,
            out_links_other: 0,
            language: [0, 0],
            doc_type: 0,
            flags: 0,
            distance: 0,
        }
    }

    /// Encode this posting as one fixed-width row.
    pub fn encode_into<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.ref_key.0)?;
        writer.write_u64::<LittleEndian>(self.last_modified)?;
        writer.write_u64::<LittleEndian>(self.fresh_until)?;
        writer.write_u16::<LittleEndian>(self.pos_in_text)?;
        writer.write_u8(self.pos_in_phrase)?;
        writer.write_u8(self.phrase_index)?;
        writer.write_u8(self.hit_count)?;
        writer.write_u16::<LittleEndian>(self.words_in_text)?;
        writer.write_u16::<LittleEndian>(self.phrases_in_text)?;
        writer.write_u8(self.words_in_title)?;
        writer.write_u8(self.out_links_same)?;
        writer.write_u8(self.out_links_other)?;
        writer.write_all(&self.language)?;
        writer.write_u8(self.doc_type)?;
        writer.write_u32::<LittleEndian>(self.flags)?;
        writer.write_u16::<LittleEndian>(self.distance)?;
        // reserved padding
        writer.write_all(&[0u8; 3])?;
        Ok(())
    }

    /// Decode one fixed-width row.
    pub fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        let mut key = [0u8; REF_KEY_LEN];
        reader.read_exact(&mut key)?;
        let last_modified = reader.read_u64::<LittleEndian>()?;
        let fresh_until = reader.read_u64::<LittleEndian>()?;
        let pos_in_text = reader.read_u16::<LittleEndian>()?;
        let pos_in_phrase = reader.read_u8()?;
        let phrase_index = reader.read_u8()?;
        let hit_count = reader.read_u8()?;
        let words_in_text = reader.read_u16::<LittleEndian>()?;
        let phrases_in_text = reader.read_u16::<LittleEndian>()?;
        let words_in_title = reader.read_u8()?;
        let out_links_same = reader.read_u8()?;
        let out_links_other = reader.read_u8()?;
        let mut language = [0u8; 2];
        reader.read_exact(&mut language)?;
        let doc_type = reader.read_u8()?;
        let flags = reader.read_u32::<LittleEndian>()?;
        let distance = reader.read_u16::<LittleEndian>()?;
        let mut reserved = [0u8; 3];
        reader.read_exact(&mut reserved)?;
        Ok(Posting {
            ref_key: RefKey(key),
            last_modified,
            fresh_until,
            pos_in_text,
            pos_in_phrase,
            phrase_index,
            hit_count,
            words_in_text,
            phrases_in_text,
            words_in_title,
            out_links_same,
            out_links_other,
            language,
            doc_type,
            flags,
            distance,
        })
    }

    /// Combine two postings for the same document into one join result.
    ///
    /// Positional metadata takes the minimum of both sides and the word
    /// distance of the two first occurrences is added to the accumulated
    /// distance.
    pub fn join_with(&self, other: &Posting) -> Posting {
        debug_assert_eq!(self.ref_key, other.ref_key);
        let gap = self.pos_in_text.abs_diff(other.pos_in_text);
        let mut joined = *self;
        joined.last_modified = self.last_modified.max(other.last_modified);
        joined.fresh_until = self.fresh_until.max(other.fresh_until);
        joined.pos_in_text = self.pos_in_text.min(other.pos_in_text);
        joined.pos_in_phrase = self.pos_in_phrase.min(other.pos_in_phrase);
        joined.phrase_index = self.phrase_index.min(other.phrase_index);
        joined.hit_count = self.hit_count.saturating_add(other.hit_count);
        joined.flags = self.flags | other.flags;
        joined.distance = self
            .distance
            .saturating_add(other.distance)
            .saturating_add(gap);
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn key(tag: u8) -> RefKey {
        RefKey([tag; REF_KEY_LEN])
    }

    #[test]
    fn test_row_width() {
        let posting = Posting::new(key(1), 1_000, 5);
        let mut buf = Vec::new();
        posting.encode_into(&mut buf).unwrap();
        assert_eq!(buf.len(), ROW_WIDTH);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut posting = Posting::new(key(7), 1_700_000_000, 42);
        posting.hit_count = 3;
        posting.language = *b"en";
        posting.flags = 0b1011;
        posting.words_in_text = 812;

        let mut buf = Vec::new();
        posting.encode_into(&mut buf).unwrap();
        let decoded = Posting::decode(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded, posting);
    }

    #[test]
    fn test_join_accumulates_distance() {
        let mut a = Posting::new(key(1), 100, 10);
        a.distance = 2;
        let b = Posting::new(key(1), 200, 14);

        let joined = a.join_with(&b);
        assert_eq!(joined.distance, 6); // 2 + |10 - 14|
        assert_eq!(joined.pos_in_text, 10);
        assert_eq!(joined.last_modified, 200);
        assert_eq!(joined.hit_count, 2);
    }

    #[test]
    fn test_term_hash_rejects_wrong_width() {
        assert!(TermHash::from_bytes(b"short").is_err());
        assert!(TermHash::from_bytes(b"exactly12byt").is_ok());
    }
}
