//! Fixed-capacity handle-based LRU array (§4.C).
//!
//! Unlike the teacher's `lru::LruCache<K, V>` (a hash-indexed cache used
//! directly by the pager's page cache), the spec's LRU array is addressed
//! by a dense 32-bit index split across lazily-allocated sub-arrays, and
//! must detect *silent* eviction of a slot a caller still believes is
//! live. That shape has no equivalent in the teacher, so it is built from
//! first principles here, in the teacher's register: plain structs over
//! `Vec`, intrusive doubly-linked rings via index fields (no `Box`/`Rc`
//! graph), explicit `evict`/`aggregate` entry points instead of hidden
//! destructors.

use crate::error::{Result, VosError};

const NIL: u32 = u32::MAX;

/// Behavior flags for [`LruArray::alloc`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LruFlags {
    /// Reuse a unique freed slot before allocating a new one (no
    /// observable effect on a single sub-array but kept for API parity
    /// with the spec).
    pub reuse_unique: bool,
    /// Force manual eviction. Implied when `sub_count > 1`.
    pub evict_manual: bool,
}

struct Entry<T> {
    key: u64,
    payload: Option<T>,
    prev: u32,
    next: u32,
    in_lru: bool,
}

/// One sub-array: a dense slice of entries plus two intrusive rings
/// (free list, LRU list) threaded through `prev`/`next` indices local to
/// the sub-array.
struct SubArray<T> {
    entries: Vec<Entry<T>>,
    free_head: u32,
    free_count: u32,
    lru_head: u32, // most-recently-used
    lru_tail: u32, // least-recently-used (eviction candidate)
    allocated: bool,
}

impl<T> SubArray<T> {
    fn new_unallocated() -> Self {
        Self {
            entries: Vec::new(),
            free_head: NIL,
            free_count: 0,
            lru_head: NIL,
            lru_tail: NIL,
            allocated: false,
        }
    }

    fn allocate(&mut self, per_sub: u32) {
        self.entries = (0..per_sub)
            .map(|i| Entry {
                key: 0,
                payload: None,
                prev: if i == 0 { NIL } else { i - 1 },
                next: if i + 1 == per_sub { NIL } else { i + 1 },
                in_lru: false,
            })
            .collect();
        self.free_head = 0;
        self.free_count = per_sub;
        self.lru_head = NIL;
        self.lru_tail = NIL;
        self.allocated = true;
    }

    fn pop_free(&mut self) -> Option<u32> {
        if self.free_head == NIL {
            return None;
        }
        let idx = self.free_head;
        self.free_head = self.entries[idx as usize].next;
        if self.free_head != NIL {
            self.entries[self.free_head as usize].prev = NIL;
        }
        self.free_count -= 1;
        Some(idx)
    }

    fn push_free(&mut self, idx: u32) {
        self.entries[idx as usize].prev = NIL;
        self.entries[idx as usize].next = self.free_head;
        if self.free_head != NIL {
            self.entries[self.free_head as usize].prev = idx;
        }
        self.free_head = idx;
        self.free_count += 1;
    }

    fn lru_unlink(&mut self, idx: u32) {
        let (prev, next) = (self.entries[idx as usize].prev, self.entries[idx as usize].next);
        if prev != NIL {
            self.entries[prev as usize].next = next;
        } else {
            self.lru_head = next;
        }
        if next != NIL {
            self.entries[next as usize].prev = prev;
        } else {
            self.lru_tail = prev;
        }
        self.entries[idx as usize].in_lru = false;
    }

    fn lru_push_front(&mut self, idx: u32) {
        self.entries[idx as usize].prev = NIL;
        self.entries[idx as usize].next = self.lru_head;
        if self.lru_head != NIL {
            self.entries[self.lru_head as usize].prev = idx;
        }
        self.lru_head = idx;
        if self.lru_tail == NIL {
            self.lru_tail = idx;
        }
        self.entries[idx as usize].in_lru = true;
    }

    fn lru_promote(&mut self, idx: u32) {
        if self.lru_head == idx {
            return;
        }
        self.lru_unlink(idx);
        self.lru_push_front(idx);
    }

    fn is_empty(&self) -> bool {
        self.allocated && self.free_count as usize == self.entries.len()
    }
}

/// A 32-bit slot index, decomposed as `(sub_array_index << shift) |
/// ent_index`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct LruIndex(pub u32);

/// Handle-based fixed-capacity cache (§4.C).
pub struct LruArray<T> {
    subs: Vec<SubArray<T>>,
    shift: u32,
    ent_mask: u32,
    per_sub: u32,
    flags: LruFlags,
    free_subs: Vec<u32>,
    unused_subs: Vec<u32>,
}

impl<T> LruArray<T> {
    /// Allocates an LRU array with `capacity` entries split across
    /// `sub_count` sub-arrays. Both must be powers of two; `sub_count >
    /// 1` forces manual eviction regardless of `flags.evict_manual`.
    pub fn alloc(capacity: u32, sub_count: u32, mut flags: LruFlags) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(VosError::InvalidArgument(
                "LRU array capacity must be a nonzero power of two".into(),
            ));
        }
        if sub_count == 0 || !sub_count.is_power_of_two() {
            return Err(VosError::InvalidArgument(
                "LRU array sub_count must be a nonzero power of two".into(),
            ));
        }
        if sub_count > capacity {
            return Err(VosError::InvalidArgument(
                "sub_count cannot exceed capacity".into(),
            ));
        }
        if sub_count > 1 {
            flags.evict_manual = true;
        }
        let per_sub = capacity / sub_count;
        let shift = per_sub.trailing_zeros();
        let ent_mask = per_sub - 1;

        let mut subs: Vec<SubArray<T>> = (0..sub_count).map(|_| SubArray::new_unallocated()).collect();
        // The first sub-array is allocated eagerly so single-sub-array
        // mode (the common case) needs no lazy-allocation path at all.
        subs[0].allocate(per_sub);
        let free_subs = vec![0u32];
        let unused_subs: Vec<u32> = (1..sub_count).collect();

        Ok(Self {
            subs,
            shift,
            ent_mask,
            per_sub,
            flags,
            free_subs,
            unused_subs,
        })
    }

    fn decompose(&self, index: LruIndex) -> (usize, u32) {
        let sub = (index.0 >> self.shift) as usize;
        let ent = index.0 & self.ent_mask;
        (sub, ent)
    }

    fn compose(&self, sub: usize, ent: u32) -> LruIndex {
        LruIndex(((sub as u32) << self.shift) | ent)
    }

    /// Finds a free slot, stamping `key` on it. Under auto-eviction
    /// (single sub-array, manual eviction not forced) this may silently
    /// evict the coldest entry to make room.
    pub fn find_free(&mut self, key: u64) -> Result<(LruIndex, &mut Option<T>)> {
        let auto_evict = !self.flags.evict_manual;

        // Try sub-arrays already known to have free entries.
        while let Some(&sub_idx) = self.free_subs.last() {
            let sub = &mut self.subs[sub_idx as usize];
            if sub.free_count > 0 {
                let ent = sub.pop_free().unwrap();
                if sub.free_count == 0 {
                    self.free_subs.pop();
                }
                sub.entries[ent as usize].key = key;
                sub.entries[ent as usize].payload = None;
                if auto_evict {
                    sub.lru_push_front(ent);
                }
                return Ok((self.compose(sub_idx as usize, ent), &mut sub.entries[ent as usize].payload));
            }
            self.free_subs.pop();
        }

        // Lazily allocate an unused sub-array if one exists.
        if let Some(sub_idx) = self.unused_subs.pop() {
            self.subs[sub_idx as usize].allocate(self.per_sub);
            let sub = &mut self.subs[sub_idx as usize];
            let ent = sub.pop_free().unwrap();
            if sub.free_count > 0 {
                self.free_subs.push(sub_idx);
            }
            sub.entries[ent as usize].key = key;
            sub.entries[ent as usize].payload = None;
            if auto_evict {
                sub.lru_push_front(ent);
            }
            return Ok((self.compose(sub_idx as usize, ent), &mut sub.entries[ent as usize].payload));
        }

        if auto_evict {
            // Single sub-array, auto-eviction: reclaim the coldest entry.
            let sub = &mut self.subs[0];
            if let Some(victim) = sub.lru_tail_if_any() {
                sub.lru_unlink(victim);
                sub.entries[victim as usize].key = key;
                sub.entries[victim as usize].payload = None;
                sub.lru_push_front(victim);
                return Ok((self.compose(0, victim), &mut sub.entries[victim as usize].payload));
            }
        }

        Err(VosError::Busy("LRU array exhausted".into()))
    }

    /// Returns the slot at `index` iff its stamped key still matches,
    /// promoting it to most-recently-used under auto-eviction mode.
    pub fn lookup(&mut self, index: LruIndex, key: u64) -> Option<&mut T> {
        let (sub_idx, ent) = self.decompose(index);
        let sub = self.subs.get_mut(sub_idx)?;
        if !sub.allocated || ent as usize >= sub.entries.len() {
            return None;
        }
        if sub.entries[ent as usize].key != key || sub.entries[ent as usize].payload.is_none() {
            return None;
        }
        if !self.flags.evict_manual {
            if sub.entries[ent as usize].in_lru {
                sub.lru_promote(ent);
            } else {
                sub.lru_push_front(ent);
            }
        }
        sub.entries[ent as usize].payload.as_mut()
    }

    /// As [`lookup`](Self::lookup) but never promotes.
    pub fn peek(&self, index: LruIndex, key: u64) -> Option<&T> {
        let (sub_idx, ent) = self.decompose(index);
        let sub = self.subs.get(sub_idx)?;
        if !sub.allocated || ent as usize >= sub.entries.len() {
            return None;
        }
        let entry = &sub.entries[ent as usize];
        if entry.key != key {
            return None;
        }
        entry.payload.as_ref()
    }

    /// Removes the slot at `index` iff its key still matches; no-op
    /// otherwise.
    pub fn evict(&mut self, index: LruIndex, key: u64) {
        let (sub_idx, ent) = self.decompose(index);
        let Some(sub) = self.subs.get_mut(sub_idx) else { return };
        if !sub.allocated || ent as usize >= sub.entries.len() {
            return;
        }
        if sub.entries[ent as usize].key != key {
            return;
        }
        if sub.entries[ent as usize].in_lru {
            sub.lru_unlink(ent);
        }
        sub.entries[ent as usize].payload = None;
        let was_full = sub.free_count == 0;
        sub.push_free(ent);
        if was_full {
            self.free_subs.push(sub_idx as u32);
        }
    }

    /// In manual-eviction mode, frees any fully-empty sub-array past the
    /// first (the first is kept allocated so single-sub-array callers
    /// never see a reallocation).
    pub fn aggregate(&mut self) {
        if !self.flags.evict_manual {
            return;
        }
        for idx in 1..self.subs.len() {
            if self.subs[idx].is_empty() {
                self.subs[idx] = SubArray::new_unallocated();
                self.free_subs.retain(|&s| s as usize != idx);
                if !self.unused_subs.contains(&(idx as u32)) {
                    self.unused_subs.push(idx as u32);
                }
            }
        }
    }

    /// Number of sub-arrays currently backing live entries.
    pub fn allocated_sub_count(&self) -> usize {
        self.subs.iter().filter(|s| s.allocated).count()
    }
}

impl<T> SubArray<T> {
    fn lru_tail_if_any(&self) -> Option<u32> {
        if self.lru_tail == NIL {
            None
        } else {
            Some(self.lru_tail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_sub_array_auto_evicts_coldest() {
        let mut lru: LruArray<u64> = LruArray::alloc(4, 1, LruFlags::default()).unwrap();
        let mut idx0 = LruIndex(0);
        for i in 0..4 {
            let (idx, slot) = lru.find_free(i as u64).unwrap();
            *slot = Some(i as u64);
            if i == 0 {
                idx0 = idx;
            }
        }
        // Touch entry 0 so it is not the coldest.
        lru.lookup(idx0, 0).unwrap();
        // Allocating a 5th entry must evict something other than key 0.
        let (idx4, slot) = lru.find_free(4).unwrap();
        *slot = Some(4);
        assert!(lru.lookup(idx0, 0).is_some());
        assert!(lru.peek(idx4, 4).is_some());
    }

    #[test]
    fn manual_eviction_capacity4_sub2_busy_on_exhaustion() {
        let mut lru: LruArray<u64> =
            LruArray::alloc(4, 2, LruFlags::default()).unwrap();
        let mut indices = Vec::new();
        for i in 0..4 {
            let (idx, slot) = lru.find_free(i as u64).unwrap();
            *slot = Some(i as u64);
            indices.push(idx);
        }
        assert!(matches!(lru.find_free(99), Err(VosError::Busy(_))));
        // Evicting one frees a slot for reuse.
        lru.evict(indices[0], 0);
        let (_idx, slot) = lru.find_free(100).unwrap();
        *slot = Some(100);
    }

    #[test]
    fn silent_eviction_detected_by_key_mismatch() {
        let mut lru: LruArray<u64> = LruArray::alloc(2, 1, LruFlags::default()).unwrap();
        let (idx_a, slot) = lru.find_free(1).unwrap();
        *slot = Some(1);
        let (_idx_b, slot) = lru.find_free(2).unwrap();
        *slot = Some(2);
        // Filling a 3rd slot in a capacity-2 single sub-array auto-evicts
        // idx_a's entry (it is coldest, never looked up).
        let (idx_c, slot) = lru.find_free(3).unwrap();
        *slot = Some(3);
        assert_eq!(idx_c, idx_a, "reused slot must be the evicted one");
        assert!(lru.lookup(idx_a, 1).is_none(), "stale key must not resolve");
        assert!(lru.lookup(idx_c, 3).is_some());
    }

    #[test]
    fn aggregate_frees_empty_sub_arrays_past_first() {
        let mut lru: LruArray<u64> = LruArray::alloc(4, 2, LruFlags::default()).unwrap();
        let (idx_a, slot) = lru.find_free(1).unwrap();
        *slot = Some(1);
        let (idx_b, slot) = lru.find_free(2).unwrap();
        *slot = Some(2);
        lru.evict(idx_a, 1);
        lru.evict(idx_b, 2);
        lru.aggregate();
        assert!(lru.allocated_sub_count() >= 1);
    }
}
