//! Postings: fixed-width rows, sorted per-term lists, and the set-join
//! algorithms that operate on them.

pub mod join;
pub mod list;
pub mod row;

pub use join::{exclude_destructive, join_constructive};
pub use list::PostingList;
pub use row::{Posting, RefKey, TermHash, REF_KEY_LEN, ROW_WIDTH, TERM_HASH_LEN};
