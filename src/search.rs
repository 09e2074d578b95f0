//! Conjunctive multi-term search over an index cell.

use std::collections::BTreeSet;
use std::sync::Arc;

use log::debug;

use crate::cell::IndexCell;
use crate::config::JoinCostModel;
use crate::error::Result;
use crate::posting::join::{exclude_destructive, join_constructive};
use crate::posting::list::PostingList;
use crate::posting::row::{RefKey, TermHash, TERM_HASH_LEN};

/// Executes conjunctive queries with optional exclusion terms, an allow
/// list of reference keys, and a proximity cap.
pub struct JoinEngine {
    cell: Arc<IndexCell>,
    model: JoinCostModel,
}

impl JoinEngine {
    pub fn new(cell: Arc<IndexCell>, model: JoinCostModel) -> Self {
        JoinEngine { cell, model }
    }

    /// Find the documents containing every `include` term and none of the
    /// `exclude` terms.
    ///
    /// The conjunction is all-or-nothing: any include term without
    /// postings yields an empty result. Containers are joined smallest
    /// first so intermediate results only shrink. `max_distance` caps the
    /// accumulated word distance of a match; zero disables the cap.
    pub fn search(
        &self,
        include: &[TermHash],
        exclude: &[TermHash],
        filter: Option<&BTreeSet<RefKey>>,
        max_distance: u16,
    ) -> Result<PostingList> {
        let result_term = include
            .first()
            .copied()
            .unwrap_or(TermHash([0; TERM_HASH_LEN]));
        if include.is_empty() {
            return Ok(PostingList::new(result_term));
        }

        let mut containers = Vec::with_capacity(include.len());
        for term in include {
            match self.cell.get(term, filter)? {
                Some(list) if !list.is_empty() => containers.push(list),
                _ => {
                    debug!("include term {term} has no postings, empty result");
                    return Ok(PostingList::new(result_term));
                }
            }
        }
        containers.sort_by_key(|c| c.len());

        let mut iter = containers.into_iter();
        let mut joined = match iter.next() {
            Some(first) => first,
            None => return Ok(PostingList::new(result_term)),
        };
        for next in iter {
            joined = join_constructive(&self.model, &joined, &next, max_distance);
            if joined.is_empty() {
                return Ok(joined);
            }
        }

        for term in exclude {
            if joined.is_empty() {
                break;
            }
            if let Some(excl) = self.cell.get(term, None)? {
                exclude_destructive(&self.model, &mut joined, &excl);
            }
        }
        Ok(joined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CellConfig;
    use crate::posting::row::{Posting, REF_KEY_LEN};
    use crate::storage::{MemoryStorage, Storage};

    fn term(tag: u8) -> TermHash {
        TermHash([tag; TERM_HASH_LEN])
    }

    fn key(tag: u8) -> RefKey {
        RefKey([tag; REF_KEY_LEN])
    }

    fn engine_with(postings: &[(u8, u8, u16)]) -> JoinEngine {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let config = CellConfig {
            background_io: false,
            ..Default::default()
        };
        let cell = Arc::new(IndexCell::open(storage, config).unwrap());
        for &(t, k, pos) in postings {
            cell.add(term(t), Posting::new(key(k), 100, pos)).unwrap();
        }
        JoinEngine::new(cell, JoinCostModel::default())
    }

    fn keys(list: &PostingList) -> Vec<u8> {
        list.iter().map(|p| p.ref_key.0[0]).collect()
    }

    #[test]
    fn test_conjunction_is_all_or_nothing() {
        let engine = engine_with(&[(1, 1, 0), (1, 2, 0), (2, 2, 0)]);

        let both = engine.search(&[term(1), term(2)], &[], None, 0).unwrap();
        assert_eq!(keys(&both), vec![2]);

        // one term without postings empties the whole result
        let with_missing = engine
            .search(&[term(1), term(2), term(9)], &[], None, 0)
            .unwrap();
        assert!(with_missing.is_empty());
    }

    #[test]
    fn test_exclusion() {
        let engine = engine_with(&[(1, 1, 0), (1, 2, 0), (1, 3, 0), (2, 2, 0)]);

        let result = engine.search(&[term(1)], &[term(2)], None, 0).unwrap();
        assert_eq!(keys(&result), vec![1, 3]);
    }

    #[test]
    fn test_key_filter() {
        let engine = engine_with(&[(1, 1, 0), (1, 2, 0), (1, 3, 0)]);

        let allow: BTreeSet<RefKey> = [key(2), key(3)].into_iter().collect();
        let result = engine.search(&[term(1)], &[], Some(&allow), 0).unwrap();
        assert_eq!(keys(&result), vec![2, 3]);
    }

    #[test]
    fn test_proximity_cap() {
        let engine = engine_with(&[(1, 1, 10), (1, 2, 10), (2, 1, 12), (2, 2, 90)]);

        let anywhere = engine.search(&[term(1), term(2)], &[], None, 0).unwrap();
        assert_eq!(anywhere.len(), 2);

        let close = engine.search(&[term(1), term(2)], &[], None, 5).unwrap();
        assert_eq!(keys(&close), vec![1]);
    }

    #[test]
    fn test_empty_include_is_empty() {
        let engine = engine_with(&[(1, 1, 0)]);
        assert!(engine.search(&[], &[term(1)], None, 0).unwrap().is_empty());
    }
}
