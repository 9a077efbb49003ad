//! # vos - single-target persistent storage engine
//!
//! A versioning object store over a single mmap-backed heap: a
//! persistent allocator, a family of class-registered B+trees, a
//! versioned extent index for byte ranges, a per-key incarnation log,
//! and the pool/container/object/dkey/akey hierarchy that ties them
//! together, plus the distributed-transaction cache and tiered garbage
//! collector that keep it consistent under concurrent access.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::path::Path;
//! use vos::heap::Heap;
//!
//! let heap = Heap::create(Path::new("/tmp/example.pool"), 64 * 1024 * 1024)?;
//! # Ok::<(), vos::error::VosError>(())
//! ```
//!
//! ## Architecture
//!
//! - [`hlc`] — hybrid logical clock for epoch ordering.
//! - [`sort`] — combsort/binary-search primitives shared by the index layer.
//! - [`lru`] — fixed-capacity handle-based LRU array, the substrate shared
//!   by the object cache ([`vos_tree::ObjectCache`]) and the DTX cache
//!   ([`dtx::DtxCache`]).
//! - [`heap`] — the persistent allocator: pool/heap/zone/chunk layout, the
//!   write-ahead log, and the transactional pager.
//! - [`btree`] — the class-registered B+tree family.
//! - [`extent`] — the versioned byte-range index.
//! - [`ilog`] — the per-key incarnation log.
//! - [`vos_tree`] — the object/key layer: pool → container → object →
//!   dkey → akey, punch propagation, and the volatile object cache.
//! - [`dtx`] — the distributed-transaction cache and its state machine.
//! - [`gc`] — the four-tier garbage collector.
//! - [`config`] — engine configuration, loadable from TOML with env overrides.
//! - [`logging`] — `tracing` subscriber bootstrap.

pub mod btree;
pub mod config;
pub mod dtx;
pub mod error;
pub mod extent;
pub mod gc;
pub mod heap;
pub mod hlc;
pub mod ilog;
pub mod logging;
pub mod lru;
pub mod sort;
pub mod vos_tree;

pub use config::{EngineConfig, SyncMode};
pub use error::{Result, VosError};
pub use heap::Heap;
pub use hlc::{Hlc, HlcTimestamp};
