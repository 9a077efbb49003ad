//! Chunk and run allocator (§4.D).
//!
//! The free-chunk cache is a direct generalization of the teacher's
//! `sombra_pager::freelist::FreeCache`: a sorted, coalesced `Vec<Extent>`
//! mirrored into a `BinaryHeap` ordered by `(len, -start)` so "largest
//! extent, tie-broken by lowest offset" pops in O(log n). The spec calls
//! for first-fit per bucket rather than best-fit-by-size, so `pop_first_fit`
//! here walks the sorted extent list directly instead of popping the
//! heap; the heap is kept anyway because run buckets still want "biggest
//! available run" to minimize fragmentation when carving a new run out of
//! a huge free stretch.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::{Result, VosError};
use crate::heap::layout::MAX_CHUNKS_PER_ZONE;

/// A contiguous run of free chunk slots, `[start, start+len)`, within a
/// single zone.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChunkExtent {
    pub zone: u32,
    pub start: u32,
    pub len: u32,
}

impl ChunkExtent {
    pub fn coalesce_with(&mut self, other: &ChunkExtent) -> bool {
        if self.zone == other.zone && self.start + self.len == other.start {
            self.len += other.len;
            true
        } else {
            false
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct HeapExtent(ChunkExtent);

impl Ord for HeapExtent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len
            .cmp(&other.0.len)
            .then_with(|| other.0.zone.cmp(&self.0.zone))
            .then_with(|| other.0.start.cmp(&self.0.start))
    }
}

impl PartialOrd for HeapExtent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Coalescing free-chunk cache for one open pool. Chunk bodies themselves
/// live in the mmap; this structure tracks which chunk slots are free so
/// `reserve` can find a fit without scanning every `ChunkHeader`.
#[derive(Default)]
pub struct FreeChunkCache {
    extents: Vec<ChunkExtent>,
    heap: BinaryHeap<HeapExtent>,
}

impl FreeChunkCache {
    pub fn from_extents(extents: Vec<ChunkExtent>) -> Self {
        let mut cache = Self {
            extents,
            heap: BinaryHeap::new(),
        };
        cache.rebuild();
        cache
    }

    pub fn extents(&self) -> &[ChunkExtent] {
        &self.extents
    }

    /// First-fit: the first free extent (in zone/offset order) at least
    /// `nchunks` long. Splits the extent if it is larger than needed.
    pub fn take_first_fit(&mut self, nchunks: u32) -> Option<ChunkExtent> {
        let pos = self.extents.iter().position(|e| e.len >= nchunks)?;
        let extent = self.extents[pos];
        let taken = ChunkExtent {
            zone: extent.zone,
            start: extent.start,
            len: nchunks,
        };
        if extent.len == nchunks {
            self.extents.remove(pos);
        } else {
            self.extents[pos] = ChunkExtent {
                zone: extent.zone,
                start: extent.start + nchunks,
                len: extent.len - nchunks,
            };
        }
        self.rebuild();
        Some(taken)
    }

    /// Best-fit: the largest free extent in a given zone, used to carve
    /// a new run's chunk span.
    pub fn take_largest_in_zone(&mut self, zone: u32, nchunks: u32) -> Option<ChunkExtent> {
        let mut scratch: Vec<HeapExtent> = Vec::new();
        let mut found = None;
        while let Some(top) = self.heap.pop() {
            if top.0.zone == zone && top.0.len >= nchunks {
                found = Some(top.0);
                break;
            }
            scratch.push(top);
        }
        for item in scratch {
            self.heap.push(item);
        }
        let extent = found?;
        // Apply the same split as take_first_fit via the sorted list.
        let pos = self
            .extents
            .iter()
            .position(|e| e.zone == extent.zone && e.start == extent.start)?;
        let taken = ChunkExtent {
            zone: extent.zone,
            start: extent.start,
            len: nchunks,
        };
        if extent.len == nchunks {
            self.extents.remove(pos);
        } else {
            self.extents[pos] = ChunkExtent {
                zone: extent.zone,
                start: extent.start + nchunks,
                len: extent.len - nchunks,
            };
        }
        self.rebuild();
        Some(taken)
    }

    /// Returns chunks to the free cache, coalescing with adjacent
    /// extents.
    pub fn free(&mut self, extent: ChunkExtent) {
        self.extents.push(extent);
        self.rebuild();
    }

    fn rebuild(&mut self) {
        self.extents.sort_by(|a, b| a.zone.cmp(&b.zone).then(a.start.cmp(&b.start)));
        let mut merged: Vec<ChunkExtent> = Vec::with_capacity(self.extents.len());
        for extent in self.extents.drain(..) {
            if let Some(last) = merged.last_mut() {
                if last.coalesce_with(&extent) {
                    continue;
                }
            }
            merged.push(extent);
        }
        self.heap = BinaryHeap::from(merged.iter().copied().map(HeapExtent).collect::<Vec<_>>());
        self.extents = merged;
    }
}

/// Validates a requested chunk span fits a single zone's chunk table.
pub fn validate_size_idx(size_idx: u32) -> Result<()> {
    if size_idx == 0 || size_idx > MAX_CHUNKS_PER_ZONE {
        return Err(VosError::InvalidArgument(format!(
            "size_idx {size_idx} outside valid zone chunk range"
        )));
    }
    Ok(())
}

/// A run's free-unit bitmap. A set bit means allocated (§3 invariant 2).
pub struct RunBitmap {
    bits: Vec<u64>,
    nunits: u32,
}

impl RunBitmap {
    pub fn new_all_free(nunits: u32) -> Self {
        let words = (nunits as usize + 63) / 64;
        Self {
            bits: vec![0u64; words],
            nunits,
        }
    }

    /// Reconstructs a bitmap from raw words, forcing unused trailing bits
    /// to one per the spec's "unused trailing bits are set to one" rule.
    pub fn from_words(mut bits: Vec<u64>, nunits: u32) -> Self {
        let used_bits = nunits as usize % 64;
        if used_bits != 0 {
            if let Some(last) = bits.last_mut() {
                let mask = !0u64 << used_bits;
                *last |= mask;
            }
        }
        Self { bits, nunits }
    }

    pub fn words(&self) -> &[u64] {
        &self.bits
    }

    pub fn is_allocated(&self, unit: u32) -> bool {
        let word = self.bits[(unit / 64) as usize];
        (word >> (unit % 64)) & 1 != 0
    }

    pub fn set_allocated(&mut self, unit: u32) {
        self.bits[(unit / 64) as usize] |= 1u64 << (unit % 64);
    }

    pub fn set_free(&mut self, unit: u32) {
        self.bits[(unit / 64) as usize] &= !(1u64 << (unit % 64));
    }

    /// First free unit, scanning low-to-high.
    pub fn first_free(&self) -> Option<u32> {
        (0..self.nunits).find(|&u| !self.is_allocated(u))
    }

    pub fn all_free(&self) -> bool {
        (0..self.nunits).all(|u| !self.is_allocated(u))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_splits_larger_extent() {
        let mut cache = FreeChunkCache::from_extents(vec![ChunkExtent {
            zone: 0,
            start: 0,
            len: 10,
        }]);
        let taken = cache.take_first_fit(4).unwrap();
        assert_eq!(taken, ChunkExtent { zone: 0, start: 0, len: 4 });
        assert_eq!(cache.extents(), &[ChunkExtent { zone: 0, start: 4, len: 6 }]);
    }

    #[test]
    fn free_coalesces_adjacent_extents() {
        let mut cache = FreeChunkCache::from_extents(vec![
            ChunkExtent { zone: 0, start: 0, len: 4 },
            ChunkExtent { zone: 0, start: 8, len: 4 },
        ]);
        cache.free(ChunkExtent { zone: 0, start: 4, len: 4 });
        assert_eq!(cache.extents(), &[ChunkExtent { zone: 0, start: 0, len: 12 }]);
    }

    #[test]
    fn take_largest_in_zone_picks_biggest() {
        let mut cache = FreeChunkCache::from_extents(vec![
            ChunkExtent { zone: 0, start: 0, len: 2 },
            ChunkExtent { zone: 0, start: 10, len: 20 },
        ]);
        let taken = cache.take_largest_in_zone(0, 5).unwrap();
        assert_eq!(taken.start, 10);
    }

    #[test]
    fn run_bitmap_tracks_allocation() {
        let mut bm = RunBitmap::new_all_free(10);
        assert_eq!(bm.first_free(), Some(0));
        bm.set_allocated(0);
        bm.set_allocated(1);
        assert_eq!(bm.first_free(), Some(2));
        bm.set_free(0);
        assert!(!bm.is_allocated(0));
        assert!(bm.is_allocated(1));
    }

    #[test]
    fn bitmap_trailing_bits_forced_allocated() {
        let bm = RunBitmap::from_words(vec![0u64], 3);
        // Bits 3..64 of the single word must read allocated.
        assert!(bm.is_allocated(3));
        assert!(!bm.is_allocated(0));
    }

    #[test]
    fn rejects_out_of_range_size_idx() {
        assert!(validate_size_idx(0).is_err());
        assert!(validate_size_idx(MAX_CHUNKS_PER_ZONE + 1).is_err());
        assert!(validate_size_idx(1).is_ok());
    }
}
