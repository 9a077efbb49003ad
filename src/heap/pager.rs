//! Mmap-backed pool file and the heap's transactional allocation surface
//! (§4.D): `reserve`, `publish`, `cancel`, `defer_free`, `set_value`.
//!
//! Grounded on the teacher's pager for the open/replay lifecycle (scan
//! the WAL on open, apply committed groups, then `reset` the log) and on
//! `crates/sombra-pager`'s `Meta`-driven layout for keeping a small typed
//! header alongside an mmap. Reservation staging (an `ActionToken` batch
//! applied atomically under one WAL transaction) is new: the spec's
//! "deferred-commit intent recorded in the operation context, applied in
//! one `publish`" has no equivalent in the teacher's single-page WAL, so
//! it is modeled here as a list of pending writes collected by `reserve`/
//! `set_value` and flushed by `publish`.
//!
//! This implementation supports a single zone per pool; multi-zone
//! growth (§3 `Zone₀ | Zone₁ | …`) would add a zone directory but is not
//! needed to exercise the allocator's transactional semantics.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{Result, VosError};
use crate::heap::alloc::{ChunkExtent, FreeChunkCache};
use crate::heap::layout::{
    ChunkHeader, ChunkKind, HeapHeader, PoolHeader, ZoneHeader, CHUNK_HEADER_SIZE, CHUNK_SIZE,
    HEAP_HEADER_SIZE, MAX_CHUNKS_PER_ZONE, POOL_HEADER_SIZE, ZONE_HEADER_SIZE,
};
use crate::heap::wal::{HeapWal, WalEntryKind};

/// Opaque handle to a reservation staged but not yet published.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ActionToken(pub u64);

#[derive(Clone, Debug)]
enum StagedWrite {
    Set { off: u64, bytes: Vec<u8> },
    DeferFree { extent: ChunkExtent },
}

/// Allocation class descriptor (§4.D "classes and runs").
#[derive(Clone, Copy, Debug)]
pub struct AllocClass {
    pub unit_size: u32,
    pub nallocs_per_run: u32,
    pub alignment: u32,
}

/// Memory-mapped pool file plus the free-chunk cache and redo log backing
/// its transactional allocator.
pub struct Heap {
    path: PathBuf,
    mmap: MmapMut,
    wal: HeapWal,
    free: FreeChunkCache,
    /// Chunk slots present in zone 0 (single-zone pools only).
    nchunks: u32,
    next_token: u64,
    pending: Vec<(ActionToken, Vec<StagedWrite>)>,
    /// Chunk extent taken out of `free` by `reserve` for each still-open
    /// token, so `cancel` can hand it back.
    reserved: Vec<(ActionToken, ChunkExtent)>,
    in_tx: bool,
}

impl Heap {
    /// Creates a new pool file of `total_size` bytes with a single zone
    /// sized to fit, and opens it.
    pub fn create(path: &Path, total_size: u64) -> Result<Self> {
        let min_size = (POOL_HEADER_SIZE + HEAP_HEADER_SIZE + ZONE_HEADER_SIZE) as u64
            + CHUNK_HEADER_SIZE as u64
            + CHUNK_SIZE;
        if total_size < min_size {
            return Err(VosError::InvalidArgument("pool too small for header".into()));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(total_size)?;

        let heap_bytes = total_size - POOL_HEADER_SIZE as u64;
        let zone_bytes = heap_bytes - HEAP_HEADER_SIZE as u64;
        let nchunks = ((zone_bytes - ZONE_HEADER_SIZE as u64)
            / (CHUNK_SIZE + CHUNK_HEADER_SIZE as u64))
            .min(MAX_CHUNKS_PER_ZONE as u64) as u32;

        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let pool_header = PoolHeader {
            version: 1,
            size: total_size,
            root_off: 0,
            stats_off: 0,
        };
        mmap[0..POOL_HEADER_SIZE].copy_from_slice(&pool_header.encode());

        let heap_header = HeapHeader {
            size: heap_bytes,
            nzones: 1,
            zone_layout: zone_bytes,
        };
        mmap[POOL_HEADER_SIZE..POOL_HEADER_SIZE + HEAP_HEADER_SIZE]
            .copy_from_slice(&heap_header.encode());

        let zone_off = POOL_HEADER_SIZE + HEAP_HEADER_SIZE;
        let zone_header = ZoneHeader {
            size_idx: nchunks,
            flags: 0,
        };
        mmap[zone_off..zone_off + ZONE_HEADER_SIZE].copy_from_slice(&zone_header.encode());

        let chunk_table_off = zone_off + ZONE_HEADER_SIZE;
        for i in 0..nchunks as usize {
            let off = chunk_table_off + i * CHUNK_HEADER_SIZE;
            let header = if i == 0 {
                ChunkHeader { kind: ChunkKind::Free, flags: 0, size_idx: nchunks }
            } else {
                ChunkHeader { kind: ChunkKind::Free, flags: 0, size_idx: 0 }
            };
            mmap[off..off + CHUNK_HEADER_SIZE].copy_from_slice(&header.encode());
        }
        mmap.flush()?;

        let wal = HeapWal::open(path, true)?;
        let free = FreeChunkCache::from_extents(vec![ChunkExtent {
            zone: 0,
            start: 0,
            len: nchunks,
        }]);

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            wal,
            free,
            nchunks,
            next_token: 1,
            pending: Vec::new(),
            reserved: Vec::new(),
            in_tx: false,
        })
    }

    /// Opens an existing pool file, replaying the WAL before the caller
    /// can observe any state.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };

        let pool_header = PoolHeader::decode(&mmap[0..POOL_HEADER_SIZE])?;
        let _heap_header = HeapHeader::decode(
            &mmap[POOL_HEADER_SIZE..POOL_HEADER_SIZE + HEAP_HEADER_SIZE],
        )?;

        let mut wal = HeapWal::open(path, true)?;
        let applied = wal.replay(|entry| {
            let off = entry.target_off as usize;
            match entry.kind {
                WalEntryKind::Set => {
                    mmap[off..off + entry.payload.len()].copy_from_slice(&entry.payload);
                }
                WalEntryKind::SetBits | WalEntryKind::ClrBits => {
                    apply_bit_op(&mut mmap, off, &entry.payload, entry.kind == WalEntryKind::SetBits);
                }
                WalEntryKind::Persist => {}
                WalEntryKind::Commit => unreachable!("commit entries are consumed by replay"),
            }
            Ok(())
        })?;
        if applied > 0 {
            mmap.flush()?;
        }
        wal.reset()?;

        let zone_off = POOL_HEADER_SIZE + HEAP_HEADER_SIZE;
        let zone_header = ZoneHeader::decode(&mmap[zone_off..zone_off + ZONE_HEADER_SIZE])?;
        let nchunks = zone_header.size_idx;
        let free = rescan_free_chunks(&mmap, zone_off, nchunks)?;

        tracing::info!(
            pool_size = pool_header.size,
            nchunks,
            replayed = applied,
            "heap opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            wal,
            free,
            nchunks,
            next_token: 1,
            pending: Vec::new(),
            reserved: Vec::new(),
            in_tx: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn chunk_table_off(&self) -> usize {
        POOL_HEADER_SIZE + HEAP_HEADER_SIZE + ZONE_HEADER_SIZE
    }

    fn chunk_body_off(&self, chunk_idx: u32) -> usize {
        self.chunk_table_off() + self.nchunks as usize * CHUNK_HEADER_SIZE
            + chunk_idx as usize * CHUNK_SIZE as usize
    }

    /// Reserves `size` bytes via first-fit chunk allocation, staging a
    /// `ChunkHeader` write. Nothing is durable until [`Heap::publish`].
    /// Returns the token plus the byte offset of the reserved body, so
    /// the caller can follow with [`Heap::set_value`].
    pub fn reserve(&mut self, size: u64, class: Option<AllocClass>) -> Result<(ActionToken, u64)> {
        let _ = class; // run-class carving uses heap::alloc::RunBitmap directly; huge-path only here
        let nchunks = ((size + CHUNK_SIZE - 1) / CHUNK_SIZE).max(1) as u32;
        let extent = self
            .free
            .take_first_fit(nchunks)
            .ok_or_else(|| VosError::NoSpace("no free chunk extent large enough".into()))?;

        let header_off =
            self.chunk_table_off() as u64 + extent.start as u64 * CHUNK_HEADER_SIZE as u64;
        let header = ChunkHeader {
            kind: ChunkKind::Used,
            flags: 0,
            size_idx: nchunks,
        };
        let body_off = self.chunk_body_off(extent.start) as u64;

        let token = ActionToken(self.next_token);
        self.next_token += 1;
        self.pending.push((
            token,
            vec![StagedWrite::Set {
                off: header_off,
                bytes: header.encode().to_vec(),
            }],
        ));
        self.reserved.push((token, extent));
        tracing::debug!(?token, nchunks, body_off, "reserved chunk extent");
        Ok((token, body_off))
    }

    /// Stages a value write into a previously reserved extent.
    pub fn set_value(&mut self, off: u64, value: &[u8], token: ActionToken) -> Result<()> {
        let entry = self
            .pending
            .iter_mut()
            .find(|(t, _)| *t == token)
            .ok_or_else(|| VosError::NoHandle("unknown action token".into()))?;
        entry.1.push(StagedWrite::Set {
            off,
            bytes: value.to_vec(),
        });
        Ok(())
    }

    /// Stages freeing a chunk extent, to take effect only on publish of
    /// this token (the extent stays "used" until the publishing commit
    /// actually lands).
    pub fn defer_free(&mut self, extent: ChunkExtent, token: ActionToken) -> Result<()> {
        let entry = self
            .pending
            .iter_mut()
            .find(|(t, _)| *t == token)
            .ok_or_else(|| VosError::NoHandle("unknown action token".into()))?;
        entry.1.push(StagedWrite::DeferFree { extent });
        Ok(())
    }

    /// Atomically applies the given tokens' staged writes under a single
    /// WAL transaction, then clears them from the pending set.
    pub fn publish(&mut self, tokens: &[ActionToken]) -> Result<()> {
        if self.in_tx {
            return Err(VosError::InProgress("heap transaction already open".into()));
        }
        self.in_tx = true;
        let result = self.publish_inner(tokens);
        self.in_tx = false;
        if result.is_err() {
            // tx_end(err): discard the log, heap observably unchanged.
            self.wal.reset().map_err(|e| {
                tracing::error!(error = %e, "failed to reset heap WAL after aborted publish");
                e
            })?;
        }
        result
    }

    fn publish_inner(&mut self, tokens: &[ActionToken]) -> Result<()> {
        let mut freed = Vec::new();
        for token in tokens {
            let Some(pos) = self.pending.iter().position(|(t, _)| t == token) else {
                return Err(VosError::NoHandle("unknown action token in publish".into()));
            };
            let (_, writes) = self.pending.remove(pos);
            // The reservation is now durable; drop its bookkeeping entry
            // without returning the extent to the free cache.
            self.reserved.retain(|(t, _)| t != token);
            for write in writes {
                match write {
                    StagedWrite::Set { off, bytes } => {
                        self.wal.append(WalEntryKind::Set, off, &bytes)?;
                        let off = off as usize;
                        self.mmap[off..off + bytes.len()].copy_from_slice(&bytes);
                    }
                    StagedWrite::DeferFree { extent } => freed.push(extent),
                }
            }
        }
        self.wal.commit()?;
        self.mmap.flush()?;
        self.wal.reset()?;
        for extent in freed {
            self.free.free(extent);
        }
        Ok(())
    }

    /// Discards staged writes for the given tokens without persisting
    /// them; the reserved chunks return to the free cache.
    pub fn cancel(&mut self, tokens: &[ActionToken]) {
        self.pending.retain(|(t, _)| !tokens.contains(t));
        let mut i = 0;
        while i < self.reserved.len() {
            if tokens.contains(&self.reserved[i].0) {
                let (_, extent) = self.reserved.remove(i);
                self.free.free(extent);
            } else {
                i += 1;
            }
        }
    }

    pub fn free_extents(&self) -> &[ChunkExtent] {
        self.free.extents()
    }

    /// Decodes the pool's 4 KiB header fresh from the mapped bytes, for
    /// callers (e.g. `vos-inspect`) that want the on-disk values rather
    /// than duplicated in-memory bookkeeping.
    pub fn pool_header(&self) -> Result<PoolHeader> {
        PoolHeader::decode(&self.mmap[0..POOL_HEADER_SIZE])
    }

    /// Decodes the 1 KiB heap header fresh from the mapped bytes.
    pub fn heap_header(&self) -> Result<HeapHeader> {
        HeapHeader::decode(&self.mmap[POOL_HEADER_SIZE..POOL_HEADER_SIZE + HEAP_HEADER_SIZE])
    }

    /// Decodes zone 0's header fresh from the mapped bytes.
    pub fn zone_header(&self) -> Result<ZoneHeader> {
        let zone_off = POOL_HEADER_SIZE + HEAP_HEADER_SIZE;
        ZoneHeader::decode(&self.mmap[zone_off..zone_off + ZONE_HEADER_SIZE])
    }

    /// Counts chunk table slots by `ChunkKind`, for `vos-inspect stats`.
    pub fn chunk_kind_counts(&self) -> [u32; 5] {
        let mut counts = [0u32; 5];
        let table_off = self.chunk_table_off();
        for i in 0..self.nchunks as usize {
            let off = table_off + i * CHUNK_HEADER_SIZE;
            if let Ok(header) = ChunkHeader::decode(&self.mmap[off..off + CHUNK_HEADER_SIZE]) {
                counts[header.kind as usize] += 1;
            }
        }
        counts
    }

    /// Number of chunk slots in zone 0 (single-zone pools only, see the
    /// module note above).
    pub fn nchunks(&self) -> u32 {
        self.nchunks
    }

    /// Free chunk slots remaining across all tracked extents.
    pub fn free_chunk_count(&self) -> u32 {
        self.free.extents().iter().map(|e| e.len).sum()
    }

    /// Path of the write-ahead log backing this heap, for `wal-info`.
    pub fn wal_path(&self) -> PathBuf {
        let mut os_string = self.path.as_os_str().to_owned();
        os_string.push(".wal");
        PathBuf::from(os_string)
    }
}

fn apply_bit_op(mmap: &mut MmapMut, off: usize, payload: &[u8], set: bool) {
    // payload: start_bit(u32 LE) | run_len(u32 LE), operating on the
    // 8-byte word at `off`.
    if payload.len() < 8 {
        return;
    }
    let start_bit = u32::from_le_bytes(payload[0..4].try_into().unwrap());
    let run_len = u32::from_le_bytes(payload[4..8].try_into().unwrap());
    let mut word = u64::from_le_bytes(mmap[off..off + 8].try_into().unwrap());
    for bit in start_bit..start_bit + run_len {
        if set {
            word |= 1u64 << bit;
        } else {
            word &= !(1u64 << bit);
        }
    }
    mmap[off..off + 8].copy_from_slice(&word.to_le_bytes());
}

/// Rebuilds the free-chunk cache for zone 0 by scanning its chunk header
/// table, per §4.D "footers are rebuilt at heap boot from headers".
fn rescan_free_chunks(mmap: &MmapMut, zone_off: usize, nchunks: u32) -> Result<FreeChunkCache> {
    let mut extents = Vec::new();
    let table_off = zone_off + ZONE_HEADER_SIZE;
    let mut idx = 0u32;
    while idx < nchunks {
        let off = table_off + idx as usize * CHUNK_HEADER_SIZE;
        let header = ChunkHeader::decode(&mmap[off..off + CHUNK_HEADER_SIZE])?;
        match header.kind {
            ChunkKind::Free => {
                extents.push(ChunkExtent {
                    zone: 0,
                    start: idx,
                    len: 1,
                });
                idx += 1;
            }
            ChunkKind::Used | ChunkKind::Run => {
                idx += header.size_idx.max(1);
            }
            ChunkKind::RunData | ChunkKind::Footer => {
                idx += 1;
            }
        }
    }
    Ok(FreeChunkCache::from_extents(extents))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_pool(dir: &Path) -> Heap {
        let nchunks = 8u64;
        let size = (POOL_HEADER_SIZE + HEAP_HEADER_SIZE + ZONE_HEADER_SIZE) as u64
            + nchunks * (CHUNK_HEADER_SIZE as u64 + CHUNK_SIZE);
        Heap::create(&dir.join("pool.vos"), size).unwrap()
    }

    #[test]
    fn create_then_reopen_preserves_header() {
        let dir = tempdir().unwrap();
        {
            let heap = small_pool(dir.path());
            assert!(!heap.free_extents().is_empty());
        }
        let heap = Heap::open(&dir.path().join("pool.vos")).unwrap();
        assert!(!heap.free_extents().is_empty());
    }

    #[test]
    fn reserve_publish_persists_value_across_reopen() {
        let dir = tempdir().unwrap();
        let pool_path = dir.path().join("pool.vos");
        {
            let mut heap = small_pool(dir.path());
            let (token, body_off) = heap.reserve(1024, None).unwrap();
            heap.set_value(body_off, b"persisted", token).unwrap();
            heap.publish(&[token]).unwrap();
        }
        let heap = Heap::open(&pool_path).unwrap();
        let body_off = heap.chunk_body_off(0);
        assert_eq!(&heap.mmap[body_off..body_off + 9], b"persisted");
    }

    #[test]
    fn cancel_drops_staged_writes() {
        let dir = tempdir().unwrap();
        let mut heap = small_pool(dir.path());
        let (token, _) = heap.reserve(1024, None).unwrap();
        heap.cancel(&[token]);
        assert!(heap.publish(&[token]).is_err());
    }

    #[test]
    fn cancel_returns_reserved_chunk_to_free_cache() {
        let dir = tempdir().unwrap();
        let mut heap = small_pool(dir.path());
        let before = heap.free_chunk_count();
        let (token, _) = heap.reserve(1024, None).unwrap();
        assert!(heap.free_chunk_count() < before);
        heap.cancel(&[token]);
        assert_eq!(heap.free_chunk_count(), before);
    }

    #[test]
    fn reserve_beyond_capacity_fails_with_no_space() {
        let dir = tempdir().unwrap();
        let mut heap = small_pool(dir.path());
        let huge = CHUNK_SIZE * 100;
        assert!(matches!(heap.reserve(huge, None), Err(VosError::NoSpace(_))));
    }
}
