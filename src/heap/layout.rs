//! Byte-exact on-disk layout (§6): pool header, heap header, zones, chunk
//! headers, run headers.
//!
//! Field widths and magic placement follow spec.md §6 literally; encode/
//! decode pairs are grounded on the teacher's `pager/wal.rs` header
//! pattern (fixed-size arrays, explicit `to_le_bytes`/`from_le_bytes`, a
//! magic check before trusting anything else in the buffer).

use crate::error::{Result, VosError};

pub const POOL_HEADER_SIZE: usize = 4096;
pub const HEAP_HEADER_SIZE: usize = 1024;
pub const ZONE_HEADER_SIZE: usize = 64;
pub const CHUNK_HEADER_SIZE: usize = 8;
pub const CHUNK_SIZE: u64 = 256 * 1024;
pub const MAX_CHUNKS_PER_ZONE: u32 = 65_528;
pub const MAX_ZONE_SIZE: u64 = 16 * 1024 * 1024 * 1024;

const POOL_MAGIC: u64 = 0x564f_5350_4f4f_4c31; // "VSPOOL1" packed
const HEAP_MAGIC: u64 = 0x564f_5348_4541_5031; // "VSHEAP1" packed
const ZONE_MAGIC: u32 = 0x564f_5a31; // "VOZ1"

/// 4 KiB pool file header.
#[derive(Clone, Copy, Debug)]
pub struct PoolHeader {
    pub version: u32,
    pub size: u64,
    pub root_off: u64,
    pub stats_off: u64,
}

impl PoolHeader {
    pub fn encode(&self) -> [u8; POOL_HEADER_SIZE] {
        let mut buf = [0u8; POOL_HEADER_SIZE];
        buf[0..8].copy_from_slice(&POOL_MAGIC.to_le_bytes());
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..20].copy_from_slice(&self.size.to_le_bytes());
        buf[20..28].copy_from_slice(&self.root_off.to_le_bytes());
        buf[28..36].copy_from_slice(&self.stats_off.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < POOL_HEADER_SIZE {
            return Err(VosError::Truncated("pool header buffer too short".into()));
        }
        let magic = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        if magic != POOL_MAGIC {
            return Err(VosError::Corruption("bad pool header magic".into()));
        }
        Ok(Self {
            version: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            size: u64::from_le_bytes(buf[12..20].try_into().unwrap()),
            root_off: u64::from_le_bytes(buf[20..28].try_into().unwrap()),
            stats_off: u64::from_le_bytes(buf[28..36].try_into().unwrap()),
        })
    }
}

/// 1 KiB heap header.
#[derive(Clone, Copy, Debug)]
pub struct HeapHeader {
    pub size: u64,
    pub nzones: u32,
    pub zone_layout: u64, // bytes per zone slot, including its header/chunk arrays
}

impl HeapHeader {
    pub fn encode(&self) -> [u8; HEAP_HEADER_SIZE] {
        let mut buf = [0u8; HEAP_HEADER_SIZE];
        buf[0..8].copy_from_slice(&HEAP_MAGIC.to_le_bytes());
        buf[8..16].copy_from_slice(&self.size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.nzones.to_le_bytes());
        buf[20..28].copy_from_slice(&self.zone_layout.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEAP_HEADER_SIZE {
            return Err(VosError::Truncated("heap header buffer too short".into()));
        }
        let magic = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        if magic != HEAP_MAGIC {
            return Err(VosError::Corruption("bad heap header magic".into()));
        }
        Ok(Self {
            size: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            nzones: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            zone_layout: u64::from_le_bytes(buf[20..28].try_into().unwrap()),
        })
    }
}

/// 64-byte zone header. Flags share the `CHUNK_FLAG_*` constants' bit
/// positions are not reused here; zone-level flags are presently just a
/// reserved word for forward compatibility (the spec names no zone-level
/// flag bits beyond the header `{magic, size_idx, flags}` triple).
#[derive(Clone, Copy, Debug)]
pub struct ZoneHeader {
    pub size_idx: u32,
    pub flags: u32,
}

impl ZoneHeader {
    pub fn encode(&self) -> [u8; ZONE_HEADER_SIZE] {
        let mut buf = [0u8; ZONE_HEADER_SIZE];
        buf[0..4].copy_from_slice(&ZONE_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.size_idx.to_le_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < ZONE_HEADER_SIZE {
            return Err(VosError::Truncated("zone header buffer too short".into()));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != ZONE_MAGIC {
            return Err(VosError::Corruption("bad zone header magic".into()));
        }
        Ok(Self {
            size_idx: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            flags: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        })
    }
}

/// Chunk header types (§6 `ChunkHeader` bit layout: `type(8) | flags(16) |
/// size_idx(32) | reserved(8)`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ChunkKind {
    Free = 0,
    Used = 1,
    Run = 2,
    RunData = 3,
    Footer = 4,
}

impl ChunkKind {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(ChunkKind::Free),
            1 => Ok(ChunkKind::Used),
            2 => Ok(ChunkKind::Run),
            3 => Ok(ChunkKind::RunData),
            4 => Ok(ChunkKind::Footer),
            other => Err(VosError::Corruption(format!("unknown chunk kind {other}"))),
        }
    }
}

/// Per-allocation header shape, orthogonal to `ChunkKind`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeaderType {
    /// 64-byte: size + type + flags + 48-byte red zone.
    Legacy,
    /// 16-byte: packed size|flags + extra.
    Compact,
    /// No per-allocation header at all.
    None,
}

pub const CHUNK_FLAG_COMPACT_HEADER: u16 = 1 << 0;
pub const CHUNK_FLAG_HEADER_NONE: u16 = 1 << 1;
pub const CHUNK_FLAG_ALIGNED: u16 = 1 << 2;
pub const CHUNK_FLAG_FLEX_BITMAP: u16 = 1 << 3;

/// A single 8-byte chunk header slot.
#[derive(Clone, Copy, Debug)]
pub struct ChunkHeader {
    pub kind: ChunkKind,
    pub flags: u16,
    pub size_idx: u32,
}

impl ChunkHeader {
    pub fn header_type(&self) -> HeaderType {
        if self.flags & CHUNK_FLAG_HEADER_NONE != 0 {
            HeaderType::None
        } else if self.flags & CHUNK_FLAG_COMPACT_HEADER != 0 {
            HeaderType::Compact
        } else {
            HeaderType::Legacy
        }
    }

    pub fn encode(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut buf = [0u8; CHUNK_HEADER_SIZE];
        buf[0] = self.kind as u8;
        buf[1..3].copy_from_slice(&self.flags.to_le_bytes());
        buf[3..7].copy_from_slice(&self.size_idx.to_le_bytes());
        // buf[7] is reserved, left zero.
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < CHUNK_HEADER_SIZE {
            return Err(VosError::Truncated("chunk header buffer too short".into()));
        }
        let kind = ChunkKind::from_u8(buf[0])?;
        let flags = u16::from_le_bytes(buf[1..3].try_into().unwrap());
        let size_idx = u32::from_le_bytes(buf[3..7].try_into().unwrap());
        Ok(Self {
            kind,
            flags,
            size_idx,
        })
    }
}

/// Header preceding a run's bitmap and unit array.
#[derive(Clone, Copy, Debug)]
pub struct RunHeader {
    pub unit_size: u32,
    pub alignment: u32,
    pub nunits: u32,
}

pub const RUN_HEADER_SIZE: usize = 12;

impl RunHeader {
    pub fn encode(&self) -> [u8; RUN_HEADER_SIZE] {
        let mut buf = [0u8; RUN_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.unit_size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.alignment.to_le_bytes());
        buf[8..12].copy_from_slice(&self.nunits.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RUN_HEADER_SIZE {
            return Err(VosError::Truncated("run header buffer too short".into()));
        }
        Ok(Self {
            unit_size: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            alignment: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            nunits: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        })
    }

    /// Bitmap size in bytes for `nunits` units, rounded so usable data
    /// starts cacheline-aligned after a whole number of bitmap words
    /// (the "flex bitmap" rule; default bitmaps use a fixed 64-bit word
    /// count instead).
    pub fn flex_bitmap_bytes(nunits: u32) -> usize {
        let words = (nunits as usize + 63) / 64;
        let bytes = words * 8;
        // Round up to the next 64-byte cacheline.
        (bytes + 63) / 64 * 64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_header_round_trips() {
        let hdr = PoolHeader {
            version: 1,
            size: 1 << 30,
            root_off: 4096,
            stats_off: 8192,
        };
        let buf = hdr.encode();
        let back = PoolHeader::decode(&buf).unwrap();
        assert_eq!(back.version, 1);
        assert_eq!(back.size, 1 << 30);
        assert_eq!(back.root_off, 4096);
    }

    #[test]
    fn heap_header_rejects_bad_magic() {
        let buf = [0u8; HEAP_HEADER_SIZE];
        assert!(matches!(HeapHeader::decode(&buf), Err(VosError::Corruption(_))));
    }

    #[test]
    fn chunk_header_round_trips_all_kinds() {
        for (kind, flags) in [
            (ChunkKind::Free, 0u16),
            (ChunkKind::Used, CHUNK_FLAG_COMPACT_HEADER),
            (ChunkKind::Run, CHUNK_FLAG_FLEX_BITMAP),
            (ChunkKind::RunData, 0),
            (ChunkKind::Footer, CHUNK_FLAG_HEADER_NONE),
        ] {
            let hdr = ChunkHeader {
                kind,
                flags,
                size_idx: 7,
            };
            let buf = hdr.encode();
            let back = ChunkHeader::decode(&buf).unwrap();
            assert_eq!(back.kind, kind);
            assert_eq!(back.size_idx, 7);
        }
    }

    #[test]
    fn header_type_resolves_from_flags() {
        let legacy = ChunkHeader {
            kind: ChunkKind::Used,
            flags: 0,
            size_idx: 1,
        };
        assert_eq!(legacy.header_type(), HeaderType::Legacy);
        let compact = ChunkHeader {
            kind: ChunkKind::Used,
            flags: CHUNK_FLAG_COMPACT_HEADER,
            size_idx: 1,
        };
        assert_eq!(compact.header_type(), HeaderType::Compact);
        let none = ChunkHeader {
            kind: ChunkKind::Used,
            flags: CHUNK_FLAG_HEADER_NONE,
            size_idx: 1,
        };
        assert_eq!(none.header_type(), HeaderType::None);
    }

    #[test]
    fn flex_bitmap_bytes_cacheline_aligned() {
        assert_eq!(RunHeader::flex_bitmap_bytes(1), 64);
        assert_eq!(RunHeader::flex_bitmap_bytes(512), 64);
        assert_eq!(RunHeader::flex_bitmap_bytes(4096), 512);
    }
}
