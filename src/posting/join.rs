//! Pairwise set operations over posting lists.
//!
//! Conjunction and exclusion each exist in two algorithmic variants with
//! the same result set: a linear merge walk over both sorted lists, and a
//! probe loop that binary-searches each key of the smaller list in the
//! larger one. A cost estimate picks the variant per pair, so a query
//! mixing one huge and one tiny term list never pays for walking the huge
//! one.

use crate::config::JoinCostModel;
use crate::posting::list::PostingList;
use crate::posting::row::Posting;

/// Intersect two posting lists into a new list carrying `a`'s term.
///
/// Matched postings are combined with [`Posting::join_with`], so the word
/// distance between the two first-occurrence positions accumulates in the
/// result. When `max_distance` is nonzero, joined postings whose
/// accumulated distance exceeds it are dropped; zero disables the filter.
pub fn join_constructive(
    model: &JoinCostModel,
    a: &PostingList,
    b: &PostingList,
    max_distance: u16,
) -> PostingList {
    if a.is_empty() || b.is_empty() {
        return PostingList::new(*a.term());
    }
    let (high, low) = if a.len() >= b.len() {
        (a.len(), b.len())
    } else {
        (b.len(), a.len())
    };
    if model.prefer_probe(high, low) {
        join_by_test(a, b, max_distance)
    } else {
        join_by_enumeration(a, b, max_distance)
    }
}

fn within(max_distance: u16, posting: &Posting) -> bool {
    max_distance == 0 || posting.distance <= max_distance
}

/// Merge-walk intersection over both sorted lists.
fn join_by_enumeration(a: &PostingList, b: &PostingList, max_distance: u16) -> PostingList {
    let mut out = PostingList::with_capacity(*a.term(), a.len().min(b.len()));
    let (ap, bp) = (a.postings(), b.postings());
    let (mut i, mut j) = (0, 0);
    while i < ap.len() && j < bp.len() {
        match ap[i].ref_key.cmp(&bp[j].ref_key) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                let joined = ap[i].join_with(&bp[j]);
                if within(max_distance, &joined) {
                    out.put_recent(joined);
                }
                i += 1;
                j += 1;
            }
        }
    }
    out
}

/// Probe intersection: iterate the smaller list, binary-search the larger.
fn join_by_test(a: &PostingList, b: &PostingList, max_distance: u16) -> PostingList {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let mut out = PostingList::with_capacity(*a.term(), small.len());
    for posting in small.iter() {
        if let Some(hit) = large.get(&posting.ref_key) {
            // keep operand order so the result is identical to the walk
            let joined = if std::ptr::eq(small, a) {
                posting.join_with(hit)
            } else {
                hit.join_with(posting)
            };
            if within(max_distance, &joined) {
                out.put_recent(joined);
            }
        }
    }
    out
}

/// Remove from `pivot` every posting whose key appears in `excl`.
/// Returns the number removed.
pub fn exclude_destructive(
    model: &JoinCostModel,
    pivot: &mut PostingList,
    excl: &PostingList,
) -> usize {
    if pivot.is_empty() || excl.is_empty() {
        return 0;
    }
    let (high, low) = if pivot.len() >= excl.len() {
        (pivot.len(), excl.len())
    } else {
        (excl.len(), pivot.len())
    };
    if model.prefer_probe(high, low) {
        exclude_by_test(pivot, excl)
    } else {
        exclude_by_enumeration(pivot, excl)
    }
}

fn exclude_by_enumeration(pivot: &mut PostingList, excl: &PostingList) -> usize {
    let keys = excl.iter().map(|p| p.ref_key).collect();
    pivot.remove_entries(&keys)
}

fn exclude_by_test(pivot: &mut PostingList, excl: &PostingList) -> usize {
    if pivot.len() <= excl.len() {
        let keys: std::collections::BTreeSet<_> = pivot
            .iter()
            .map(|p| p.ref_key)
            .filter(|k| excl.has(k))
            .collect();
        pivot.remove_entries(&keys)
    } else {
        let mut removed = 0;
        for posting in excl.iter() {
            if pivot.remove(&posting.ref_key).is_some() {
                removed += 1;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posting::row::{Posting, RefKey, TermHash, REF_KEY_LEN};

    fn list(tag: u8, entries: &[(u8, u16)]) -> PostingList {
        let mut out = PostingList::new(TermHash([tag; 12]));
        for &(k, pos) in entries {
            out.put_recent(Posting::new(RefKey([k; REF_KEY_LEN]), 100, pos));
        }
        out
    }

    fn keys(list: &PostingList) -> Vec<u8> {
        list.iter().map(|p| p.ref_key.0[0]).collect()
    }

    /// Cost model that always picks the merge walk.
    fn walk_only() -> JoinCostModel {
        JoinCostModel {
            merge_walk_factor: 0,
            probe_factor: 1,
        }
    }

    /// Cost model that always picks the probe join.
    fn probe_only() -> JoinCostModel {
        JoinCostModel {
            merge_walk_factor: 1_000_000,
            probe_factor: 0,
        }
    }

    #[test]
    fn test_join_algorithms_are_equivalent() {
        let a = list(1, &[(1, 10), (3, 20), (5, 30), (7, 40)]);
        let b = list(2, &[(2, 11), (3, 25), (7, 44), (9, 50)]);

        let walked = join_constructive(&walk_only(), &a, &b, 0);
        let probed = join_constructive(&probe_only(), &a, &b, 0);
        assert_eq!(walked.postings(), probed.postings());
        assert_eq!(keys(&walked), vec![3, 7]);
    }

    #[test]
    fn test_join_accumulates_and_filters_distance() {
        let a = list(1, &[(1, 10), (2, 100)]);
        let b = list(2, &[(1, 12), (2, 50)]);

        let unfiltered = join_constructive(&JoinCostModel::default(), &a, &b, 0);
        assert_eq!(unfiltered.len(), 2);

        // key 1 has distance 2, key 2 has distance 50
        let close = join_constructive(&JoinCostModel::default(), &a, &b, 5);
        assert_eq!(keys(&close), vec![1]);
        assert_eq!(close.get(&RefKey([1; REF_KEY_LEN])).unwrap().distance, 2);
    }

    #[test]
    fn test_join_with_empty_side_is_empty() {
        let a = list(1, &[(1, 0), (2, 0)]);
        let empty = PostingList::new(TermHash([2; 12]));
        assert!(join_constructive(&JoinCostModel::default(), &a, &empty, 0).is_empty());
        assert!(join_constructive(&JoinCostModel::default(), &empty, &a, 0).is_empty());
    }

    #[test]
    fn test_exclude_variants_are_equivalent() {
        let excl = list(9, &[(2, 0), (4, 0), (6, 0)]);

        let mut walked = list(1, &[(1, 0), (2, 0), (3, 0), (4, 0), (5, 0)]);
        exclude_destructive(&walk_only(), &mut walked, &excl);

        let mut probed = list(1, &[(1, 0), (2, 0), (3, 0), (4, 0), (5, 0)]);
        exclude_destructive(&probe_only(), &mut probed, &excl);

        assert_eq!(walked.postings(), probed.postings());
        assert_eq!(keys(&walked), vec![1, 3, 5]);
    }

    #[test]
    fn test_exclude_is_idempotent() {
        let excl = list(9, &[(2, 0)]);
        let mut pivot = list(1, &[(1, 0), (2, 0), (3, 0)]);

        assert_eq!(exclude_destructive(&JoinCostModel::default(), &mut pivot, &excl), 1);
        assert_eq!(exclude_destructive(&JoinCostModel::default(), &mut pivot, &excl), 0);
        assert_eq!(keys(&pivot), vec![1, 3]);
    }
}
