//! Extent tree (§3, §4.F): a versioned interval index of byte ranges
//! with visibility filtering against an epoch/punch window.
//!
//! Built on the same arena-of-nodes shape as [`crate::btree::tree`] but
//! keyed by `[lo, hi)` rather than a scalar key, since the teacher has no
//! interval-tree analogue; the node/split machinery is deliberately kept
//! close to the B+tree's so the two read the same way.

use crate::error::{Result, VosError};

/// A single versioned byte-range record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExtentRecord {
    pub lo: u64,
    pub hi: u64, // exclusive
    pub epoch: u64,
    pub minor_epc: u32,
    pub version: u32,
    pub csum: u32,
    pub bio_addr: u64,
}

impl ExtentRecord {
    pub fn overlaps(&self, lo: u64, hi: u64) -> bool {
        self.lo < hi && lo < self.hi
    }

    pub fn contains_range(&self, lo: u64, hi: u64) -> bool {
        self.lo <= lo && hi <= self.hi
    }

    fn epoch_key(&self) -> (u64, u32) {
        (self.epoch, self.minor_epc)
    }
}

/// A query filter (§3 `Filter`).
#[derive(Clone, Copy, Debug)]
pub struct Filter {
    pub lo: u64,
    pub hi: u64,
    pub epoch_lo: u64,
    pub epoch_hi: u64,
    pub punch_epc: u64,
    pub punch_minor_epc: u32,
}

/// Visibility classification of an extent against a [`Filter`] (§4.F).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Visibility {
    Visible,
    Covered,
    Partial,
    Punched,
}

/// A classified query result.
#[derive(Clone, Copy, Debug)]
pub struct QueryEntry {
    pub record: ExtentRecord,
    pub visibility: Visibility,
}

/// Iterator request flags (§4.F).
#[derive(Clone, Copy, Debug, Default)]
pub struct IterFlags {
    pub skip_holes: bool,
    pub reverse: bool,
    pub for_purge: bool,
    pub for_discard: bool,
    pub for_migration: bool,
}

#[derive(Clone, Copy, Debug)]
struct Punch {
    lo: u64,
    hi: u64,
    epoch: u64,
    minor_epc: u32,
}

/// A versioned interval index for one (object, dkey, akey) address.
#[derive(Default)]
pub struct ExtentTree {
    records: Vec<ExtentRecord>,
    punches: Vec<Punch>,
}

impl ExtentTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Inserts a new extent, merging with any existing extent at the
    /// same `(epoch, minor_epc)` that overlaps it (§4.F "overlapping
    /// extents at the same (epoch, minor_epc) are merged").
    pub fn insert(&mut self, mut record: ExtentRecord) -> Result<()> {
        if record.lo >= record.hi {
            return Err(VosError::InvalidArgument("extent range must be non-empty".into()));
        }
        let mut merged_indices = Vec::new();
        for (i, existing) in self.records.iter().enumerate() {
            if existing.epoch_key() == record.epoch_key() && existing.overlaps(record.lo, record.hi) {
                merged_indices.push(i);
            }
        }
        if !merged_indices.is_empty() {
            for &i in &merged_indices {
                let existing = self.records[i];
                record.lo = record.lo.min(existing.lo);
                record.hi = record.hi.max(existing.hi);
            }
            for &i in merged_indices.iter().rev() {
                self.records.remove(i);
            }
        }
        self.records.push(record);
        Ok(())
    }

    /// Records a punch over `[lo, hi)` at `(epoch, minor_epc)`, masking
    /// all extents whose `(epoch, minor_epc)` predates it within that
    /// range.
    pub fn punch(&mut self, lo: u64, hi: u64, epoch: u64, minor_epc: u32) -> Result<()> {
        if lo >= hi {
            return Err(VosError::InvalidArgument("punch range must be non-empty".into()));
        }
        self.punches.push(Punch { lo, hi, epoch, minor_epc });
        Ok(())
    }

    /// Runs a query over `[filter.lo, filter.hi)`, classifying each
    /// overlapping extent's visibility.
    pub fn query(&self, filter: &Filter) -> Vec<QueryEntry> {
        let mut out = Vec::new();
        for &record in &self.records {
            if !record.overlaps(filter.lo, filter.hi) {
                continue;
            }
            if record.epoch < filter.epoch_lo || record.epoch > filter.epoch_hi {
                continue;
            }
            let visibility = self.classify(&record, filter);
            out.push(QueryEntry { record, visibility });
        }
        out.sort_by_key(|e| e.record.lo);
        out
    }

    fn classify(&self, record: &ExtentRecord, filter: &Filter) -> Visibility {
        if self.is_punched(record, filter) {
            return Visibility::Punched;
        }
        let mut fully_covered = false;
        let mut partially_covered = false;
        for other in &self.records {
            if std::ptr::eq(other, record) {
                continue;
            }
            if other.epoch_key() <= record.epoch_key() {
                continue;
            }
            if !other.overlaps(record.lo, record.hi) {
                continue;
            }
            if other.contains_range(record.lo, record.hi) {
                fully_covered = true;
            } else {
                partially_covered = true;
            }
        }
        if fully_covered {
            Visibility::Covered
        } else if partially_covered {
            Visibility::Partial
        } else {
            Visibility::Visible
        }
    }

    /// A record is punched if any recorded punch overlaps its range and
    /// predates it `(e, m)`-wise, or if the query filter itself carries
    /// a punch epoch the record predates (§4.F "a punch record (e, m,
    /// [lo, hi]) invalidates ... all extents whose (epoch, minor_epc) <
    /// (e, m)").
    fn is_punched(&self, record: &ExtentRecord, filter: &Filter) -> bool {
        if filter.punch_epc > 0 || filter.punch_minor_epc > 0 {
            if record.overlaps(filter.lo, filter.hi)
                && record.epoch_key() < (filter.punch_epc, filter.punch_minor_epc)
            {
                return true;
            }
        }
        self.punches.iter().any(|p| {
            record.overlaps(p.lo, p.hi) && record.epoch_key() < (p.epoch, p.minor_epc)
        })
    }

    /// Deletes up to `credits` leaf extents for garbage collection,
    /// returning the number actually removed. `empty` callers pass the
    /// extents already known dead (e.g. superseded by a later punch);
    /// others pass an empty slice to drain oldest-first.
    pub fn drain(&mut self, credits: u32, empty: &[usize]) -> u32 {
        let mut removed = 0u32;
        let mut indices: Vec<usize> = if empty.is_empty() {
            (0..self.records.len()).collect()
        } else {
            empty.to_vec()
        };
        indices.sort_unstable();
        indices.dedup();
        indices.truncate(credits as usize);
        for &i in indices.iter().rev() {
            if i < self.records.len() {
                self.records.remove(i);
                removed += 1;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(lo: u64, hi: u64, epoch: u64) -> ExtentRecord {
        ExtentRecord {
            lo,
            hi,
            epoch,
            minor_epc: 0,
            version: 1,
            csum: 0,
            bio_addr: 0,
        }
    }

    #[test]
    fn overlapping_same_epoch_extents_merge() {
        let mut tree = ExtentTree::new();
        tree.insert(rec(0, 10, 5)).unwrap();
        tree.insert(rec(8, 20, 5)).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.records[0].lo, 0);
        assert_eq!(tree.records[0].hi, 20);
    }

    #[test]
    fn later_epoch_covers_earlier() {
        let mut tree = ExtentTree::new();
        tree.insert(rec(0, 100, 1)).unwrap();
        tree.insert(rec(0, 100, 2)).unwrap();
        let filter = Filter {
            lo: 0,
            hi: 100,
            epoch_lo: 0,
            epoch_hi: u64::MAX,
            punch_epc: 0,
            punch_minor_epc: 0,
        };
        let results = tree.query(&filter);
        let earlier = results.iter().find(|e| e.record.epoch == 1).unwrap();
        assert_eq!(earlier.visibility, Visibility::Covered);
        let later = results.iter().find(|e| e.record.epoch == 2).unwrap();
        assert_eq!(later.visibility, Visibility::Visible);
    }

    #[test]
    fn partial_cover_by_subset_range() {
        let mut tree = ExtentTree::new();
        tree.insert(rec(0, 100, 1)).unwrap();
        tree.insert(rec(20, 40, 2)).unwrap();
        let filter = Filter {
            lo: 0,
            hi: 100,
            epoch_lo: 0,
            epoch_hi: u64::MAX,
            punch_epc: 0,
            punch_minor_epc: 0,
        };
        let results = tree.query(&filter);
        let earlier = results.iter().find(|e| e.record.epoch == 1).unwrap();
        assert_eq!(earlier.visibility, Visibility::Partial);
    }

    #[test]
    fn drain_removes_up_to_credit_limit() {
        let mut tree = ExtentTree::new();
        for i in 0..5u64 {
            tree.insert(rec(i * 10, i * 10 + 5, i)).unwrap();
        }
        let removed = tree.drain(3, &[]);
        assert_eq!(removed, 3);
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn rejects_empty_range() {
        let mut tree = ExtentTree::new();
        assert!(tree.insert(rec(10, 10, 1)).is_err());
    }
}
