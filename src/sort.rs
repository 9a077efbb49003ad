//! Generic combsort and binary search over opaque arrays (§4.B).
//!
//! The array is never materialized as a concrete type here — callers
//! supply `cmp`/`swap` closures, following the spec's "no inheritance or
//! dynamic dispatch in the tree class layer" design note applied to the
//! sort primitive too: a value-type table of closures, not a trait object
//! hierarchy.

use crate::error::{Result, VosError};

/// Comparison result requested by the caller's `cmp` closure: negative,
/// zero, or positive, matching C-style three-way comparisons used
/// throughout the rest of the engine's callback tables.
pub type CmpFn<'a> = dyn FnMut(usize, usize) -> std::cmp::Ordering + 'a;
pub type SwapFn<'a> = dyn FnMut(usize, usize) + 'a;

/// Sorts the logical range `[0, len)` in place using combsort (gap ratio
/// 10/13, never landing exactly on a gap of 9 or 10 — the "avoid 9/10"
/// tweak that keeps the shrink factor from stalling on nearly-sorted
/// input).
///
/// When `unique` is `true`, a duplicate detected mid-sort aborts with
/// `InvalidArgument` rather than silently keeping one copy: the caller
/// asked for a uniqueness guarantee the input did not satisfy.
pub fn comb_sort(len: usize, unique: bool, cmp: &mut CmpFn<'_>, swap: &mut SwapFn<'_>) -> Result<()> {
    if len < 2 {
        return Ok(());
    }
    let mut gap = len;
    let mut swapped = true;
    while gap > 1 || swapped {
        gap = next_gap(gap);
        swapped = false;
        let mut i = 0;
        while i + gap < len {
            let ordering = cmp(i, i + gap);
            match ordering {
                std::cmp::Ordering::Greater => {
                    swap(i, i + gap);
                    swapped = true;
                }
                std::cmp::Ordering::Equal if unique => {
                    return Err(VosError::InvalidArgument(
                        "duplicate key detected during unique sort".into(),
                    ));
                }
                _ => {}
            }
            i += 1;
        }
    }
    Ok(())
}

/// Computes the next combsort gap: shrink by 10/13, skipping the values 9
/// and 10 (replaced by 11), and clamping to a minimum of 1.
fn next_gap(gap: usize) -> usize {
    let shrunk = gap * 10 / 13;
    let shrunk = if shrunk == 9 || shrunk == 10 { 11 } else { shrunk };
    shrunk.max(1)
}

/// Binary search probe mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SearchMode {
    /// Require an exact match; `None` if absent.
    Exact,
    /// Greatest element `<=` the target ("glb").
    GreatestLowerEqual,
    /// Least element `>=` the target ("lub").
    LeastUpperEqual,
}

/// Binary searches a sorted range `[0, len)` via the caller's `cmp`
/// closure, which must return `Ordering` for `cmp(index, target)`
/// (i.e. how the element at `index` compares to the implicit target).
///
/// For ties, every mode returns the *first* occurrence in array order —
/// callers relying on stable duplicate ordering (e.g. B+tree leaves with
/// non-unique separator keys) get the leftmost match.
pub fn binary_search(
    len: usize,
    mode: SearchMode,
    mut cmp: impl FnMut(usize) -> std::cmp::Ordering,
) -> Option<usize> {
    use std::cmp::Ordering::*;

    if len == 0 {
        return None;
    }
    let mut lo = 0usize;
    let mut hi = len; // exclusive
    let mut last_eq: Option<usize> = None;
    let mut last_lt: Option<usize> = None; // rightmost index < target
    let mut first_gt: Option<usize> = None; // leftmost index > target

    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match cmp(mid) {
            Equal => {
                last_eq = Some(mid);
                hi = mid; // keep searching left for first occurrence
            }
            Less => {
                last_lt = Some(mid);
                lo = mid + 1;
            }
            Greater => {
                first_gt = Some(mid);
                hi = mid;
            }
        }
    }

    match mode {
        SearchMode::Exact => last_eq,
        SearchMode::GreatestLowerEqual => last_eq.or(last_lt),
        SearchMode::LeastUpperEqual => last_eq.or(first_gt),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comb_sort_orders_random_input() {
        let data: Vec<std::cell::Cell<i64>> = vec![9, 3, 7, 1, 8, 2, 2, 5, 0, 4, 6]
            .into_iter()
            .map(std::cell::Cell::new)
            .collect();
        let len = data.len();
        let mut cmp = |i: usize, j: usize| data[i].get().cmp(&data[j].get());
        let mut swap = |i: usize, j: usize| {
            let tmp = data[i].get();
            data[i].set(data[j].get());
            data[j].set(tmp);
        };
        comb_sort(len, false, &mut cmp, &mut swap).unwrap();
        let sorted: Vec<i64> = data.iter().map(|c| c.get()).collect();
        let mut expected = sorted.clone();
        expected.sort();
        assert_eq!(sorted, expected);
    }

    #[test]
    fn comb_sort_unique_rejects_duplicates() {
        let data: Vec<std::cell::Cell<i64>> = vec![1, 2, 2, 3]
            .into_iter()
            .map(std::cell::Cell::new)
            .collect();
        let len = data.len();
        let mut cmp = |i: usize, j: usize| data[i].get().cmp(&data[j].get());
        let mut swap = |i: usize, j: usize| {
            let tmp = data[i].get();
            data[i].set(data[j].get());
            data[j].set(tmp);
        };
        assert!(comb_sort(len, true, &mut cmp, &mut swap).is_err());
    }

    #[test]
    fn binary_search_exact_finds_first_of_ties() {
        let data = vec![1, 3, 3, 3, 5, 7];
        let idx = binary_search(data.len(), SearchMode::Exact, |i| data[i].cmp(&3));
        assert_eq!(idx, Some(1));
    }

    #[test]
    fn binary_search_glb_and_lub() {
        let data = vec![2, 4, 6, 8];
        let glb = binary_search(data.len(), SearchMode::GreatestLowerEqual, |i| data[i].cmp(&5));
        assert_eq!(glb, Some(1)); // value 4
        let lub = binary_search(data.len(), SearchMode::LeastUpperEqual, |i| data[i].cmp(&5));
        assert_eq!(lub, Some(2)); // value 6
    }

    #[test]
    fn binary_search_empty_array() {
        let data: Vec<i64> = vec![];
        assert_eq!(
            binary_search(data.len(), SearchMode::Exact, |i| data[i].cmp(&1)),
            None
        );
    }
}
