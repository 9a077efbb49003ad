//! Persistent heap (§3, §4.D): mmap-backed pool file, zone/chunk/run
//! layout, write-ahead log, and the transactional allocation surface
//! that every higher layer (B+tree, extent tree, incarnation log, DTX,
//! GC) allocates through.

pub mod alloc;
pub mod layout;
pub mod pager;
pub mod wal;

pub use alloc::{ChunkExtent, FreeChunkCache, RunBitmap};
pub use pager::{ActionToken, AllocClass, Heap};
