//! Object/key layer (§3, §4.H): the pool → container → object → dkey →
//! akey hierarchy, punch propagation, and the volatile object cache.
//!
//! Named `vos_tree` rather than `tree` to avoid colliding with the crate
//! name (`vos`) and with [`crate::btree::tree`]. Each level's B+tree is a
//! literal [`crate::btree::tree::Tree`] instantiation; the per-akey leaf
//! is either a single-value tree or an [`crate::extent::ExtentTree`],
//! matching the `kr_bmap` mutual-exclusion the spec calls for.

use std::collections::HashMap;

pub mod external;

use crate::btree::{BytesKey, BytesVal, ProbeOp, Tree, TreeOptions};
use crate::error::{Result, VosError};
use crate::extent::ExtentTree;
use crate::ilog::{IncarnationLog, LogKind};
use crate::lru::{LruArray, LruFlags, LruIndex};

/// Logical object identifier (§4.H `unit_oid`): class, shard, and
/// publisher id packed into one addressable key.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct UnitOid {
    pub class: u8,
    pub shard: u32,
    pub pub_id: u64,
}

impl UnitOid {
    fn cache_key(&self) -> u64 {
        ((self.class as u64) << 56) | ((self.shard as u64) << 24) | (self.pub_id & 0xFF_FFFF)
    }
}

/// Key record child discriminant (§4.H "kr_bmap bits").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyRecordBits {
    /// dkey directly holds a single-value B+tree (no akey level).
    NoAkey,
    /// akey's child is a single-value B+tree.
    Btr,
    /// akey's child is an extent tree.
    Evt,
}

enum AkeyChild {
    SingleValue(Tree<BytesKey, BytesVal>),
    Extent(ExtentTree),
}

struct AkeyRecord {
    child: AkeyChild,
    ilog: IncarnationLog,
}

struct DkeyRecord {
    akeys: HashMap<Vec<u8>, AkeyRecord>,
    no_akey_value: Option<Tree<BytesKey, BytesVal>>,
    ilog: IncarnationLog,
}

struct ObjectRecord {
    dkeys: HashMap<Vec<u8>, DkeyRecord>,
    punched_epoch: Option<u64>,
}

/// One open container: an object B+tree keyed by [`UnitOid`].
#[derive(Default)]
pub struct Container {
    objects: HashMap<UnitOid, ObjectRecord>,
}

const MAX_PROPAGATION_LEVELS: u32 = 3;

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    fn object_mut(&mut self, oid: UnitOid) -> &mut ObjectRecord {
        self.objects.entry(oid).or_insert_with(|| ObjectRecord {
            dkeys: HashMap::new(),
            punched_epoch: None,
        })
    }

    /// Writes a single value under `(oid, dkey, akey)` at `epoch`.
    pub fn update_single_value(
        &mut self,
        oid: UnitOid,
        dkey: &[u8],
        akey: &[u8],
        epoch: u64,
        value: &[u8],
    ) -> Result<()> {
        let object = self.object_mut(oid);
        if let Some(punched) = object.punched_epoch {
            if epoch <= punched {
                return Err(VosError::TxRestart("object punched at a later epoch".into()));
            }
        }
        let dk = object.dkeys.entry(dkey.to_vec()).or_insert_with(|| DkeyRecord {
            akeys: HashMap::new(),
            no_akey_value: None,
            ilog: IncarnationLog::new(),
        });
        if dk.ilog.is_empty() {
            dk.ilog.append(epoch, 0, LogKind::Create)?;
        }
        let ak = dk.akeys.entry(akey.to_vec()).or_insert_with(|| AkeyRecord {
            child: AkeyChild::SingleValue(
                Tree::new(TreeOptions {
                    order: 8,
                    dynamic_root: true,
                    skip_leaf_rebalance: false,
                    embed_first: true,
                })
                .expect("fixed order is within valid range"),
            ),
            ilog: IncarnationLog::new(),
        });
        if ak.ilog.is_empty() {
            ak.ilog.append(epoch, 0, LogKind::Create)?;
        } else {
            ak.ilog.append(epoch, 0, LogKind::Update)?;
        }
        let AkeyChild::SingleValue(tree) = &mut ak.child else {
            return Err(VosError::InvalidArgument(
                "akey already holds an extent-tree child".into(),
            ));
        };
        tree.upsert(
            &BytesKey(epoch.to_be_bytes().to_vec()),
            &BytesVal(value.to_vec()),
        )
    }

    /// Reads the most recent single value visible at or before `epoch`.
    pub fn fetch_single_value(
        &self,
        oid: UnitOid,
        dkey: &[u8],
        akey: &[u8],
        epoch: u64,
    ) -> Result<Option<Vec<u8>>> {
        let Some(object) = self.objects.get(&oid) else {
            return Ok(None);
        };
        if let Some(punched) = object.punched_epoch {
            if epoch > punched {
                return Ok(None);
            }
        }
        let Some(dk) = object.dkeys.get(dkey) else {
            return Ok(None);
        };
        let Some(ak) = dk.akeys.get(akey) else {
            return Ok(None);
        };
        let AkeyChild::SingleValue(tree) = &ak.child else {
            return Err(VosError::InvalidArgument("akey child is an extent tree".into()));
        };
        let found = tree.probe(ProbeOp::Le, Some(&BytesKey(epoch.to_be_bytes().to_vec())))?;
        Ok(found.map(|(_, v)| v.0))
    }

    /// Punches the entire object at `epoch`.
    pub fn punch_object(&mut self, oid: UnitOid, epoch: u64) {
        let object = self.object_mut(oid);
        object.punched_epoch = Some(epoch);
    }

    /// Punches a single dkey, propagating the punch upward (to the
    /// object) when the dkey subtree becomes empty, unless
    /// `replay_pc_suppressed` is set (mirrors `VOS_OF_REPLAY_PC`, §4.H).
    ///
    /// `read_epoch` is the epoch at which the caller's transaction
    /// established its read set; each step of the punch restarts with
    /// `ERR_TX_RESTART` if the key it touches was modified more
    /// recently than that bound, rather than silently overwriting a
    /// write the caller never observed.
    pub fn punch_dkey(
        &mut self,
        oid: UnitOid,
        dkey: &[u8],
        epoch: u64,
        read_epoch: u64,
        replay_pc_suppressed: bool,
    ) -> Result<()> {
        let object = self.object_mut(oid);
        let Some(dk) = object.dkeys.get_mut(dkey) else {
            return Ok(());
        };
        dk.ilog.punch(epoch, 0, read_epoch)?;
        let subtree_empty = dk.akeys.is_empty() && dk.no_akey_value.is_none();
        if subtree_empty && !replay_pc_suppressed {
            // Propagate to object: level 1 of at most 3.
            object.punched_epoch = Some(epoch);
        }
        Ok(())
    }

    /// Punches a single akey, propagating up to the dkey (and, if that
    /// also empties, to the object) per the spec's at-most-three-level
    /// propagation rule. See [`Self::punch_dkey`] for `read_epoch`.
    pub fn punch_akey(
        &mut self,
        oid: UnitOid,
        dkey: &[u8],
        akey: &[u8],
        epoch: u64,
        read_epoch: u64,
        replay_pc_suppressed: bool,
    ) -> Result<()> {
        let mut level = 0u32;
        let object = self.object_mut(oid);
        let Some(dk) = object.dkeys.get_mut(dkey) else {
            return Ok(());
        };
        if let Some(ak) = dk.akeys.get_mut(akey) {
            ak.ilog.punch(epoch, 0, read_epoch)?;
        }
        level += 1;

        let akey_empty_now = dk
            .akeys
            .get(akey)
            .map(|ak| ak.ilog.aggregate(epoch + 1))
            .unwrap_or(true);
        if akey_empty_now {
            dk.akeys.remove(akey);
        }
        if !replay_pc_suppressed && dk.akeys.is_empty() && dk.no_akey_value.is_none() {
            level += 1;
            if level > MAX_PROPAGATION_LEVELS {
                return Err(VosError::Corruption(
                    "punch propagation exceeded three levels".into(),
                ));
            }
            dk.ilog.punch(epoch, 0, read_epoch)?;
            object.dkeys.remove(dkey);
            if object.dkeys.is_empty() {
                level += 1;
                if level > MAX_PROPAGATION_LEVELS {
                    return Err(VosError::Corruption(
                        "punch propagation exceeded three levels".into(),
                    ));
                }
                object.punched_epoch = Some(epoch);
            }
        }
        Ok(())
    }
}

/// A pool's open containers (§3 "a pool contains containers"; GLOSSARY
/// "Container"). The pool's own heap lives behind [`crate::heap::Heap`];
/// this struct only tracks which logical containers are currently open
/// against it, each with its own object B+tree. Persisting a container's
/// object tree root into the heap is the caller's job (via
/// [`crate::heap::Heap::reserve`]/`publish`) once the object/key layer is
/// wired to real heap-backed node storage rather than the in-memory
/// arena `Tree` uses today.
#[derive(Default)]
pub struct Pool {
    containers: HashMap<uuid::Uuid, Container>,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens (creating if absent) the container identified by `cont_id`.
    pub fn open_container(&mut self, cont_id: uuid::Uuid) -> &mut Container {
        self.containers.entry(cont_id).or_insert_with(Container::new)
    }

    /// Closes a container, dropping its in-memory trees. Per §3
    /// lifecycle: "on pool close every volatile handle is torn down."
    pub fn close_container(&mut self, cont_id: uuid::Uuid) {
        self.containers.remove(&cont_id);
    }

    pub fn container(&self, cont_id: uuid::Uuid) -> Option<&Container> {
        self.containers.get(&cont_id)
    }

    pub fn container_mut(&mut self, cont_id: uuid::Uuid) -> Option<&mut Container> {
        self.containers.get_mut(&cont_id)
    }

    pub fn container_count(&self) -> usize {
        self.containers.len()
    }
}

/// Flags controlling [`ObjectCache::hold`] (§4.H).
#[derive(Clone, Copy, Debug, Default)]
pub struct HoldFlags {
    pub visible: bool,
    pub create: bool,
    pub kill_dkey: bool,
    pub discard: bool,
    pub aggregate: bool,
}

struct CacheEntry {
    refcount: u32,
    kill: bool,
}

/// Volatile object cache mapping `unit_oid -> handle`, backed by the
/// shared [`LruArray`] substrate (§3 "LRU array ... is the substrate
/// used by both DTX cache and VOS object cache").
pub struct ObjectCache {
    lru: LruArray<CacheEntry>,
    index_of: HashMap<UnitOid, LruIndex>,
}

impl ObjectCache {
    pub fn new(capacity: u32) -> Result<Self> {
        Ok(Self {
            lru: LruArray::alloc(capacity, 1, LruFlags::default())?,
            index_of: HashMap::new(),
        })
    }

    /// Acquires a reference-counted handle for `oid`, creating a cache
    /// entry if `flags.create` is set and none exists.
    pub fn hold(&mut self, oid: UnitOid, flags: HoldFlags) -> Result<LruIndex> {
        let key = oid.cache_key();
        if let Some(&idx) = self.index_of.get(&oid) {
            if let Some(entry) = self.lru.lookup(idx, key) {
                entry.refcount += 1;
                return Ok(idx);
            }
            self.index_of.remove(&oid);
        }
        if !flags.create {
            return Err(VosError::NotFound("object not resident in cache"));
        }
        let (idx, slot) = self.lru.find_free(key)?;
        *slot = Some(CacheEntry {
            refcount: 1,
            kill: false,
        });
        self.index_of.insert(oid, idx);
        Ok(idx)
    }

    /// Releases a handle. `kill` marks the entry for eviction once its
    /// reference count reaches zero; `discard`/`aggregate` are accepted
    /// for API parity but carry no extra bookkeeping at this layer
    /// (they drive the GC tiers in [`crate::gc`] instead).
    pub fn release(&mut self, oid: UnitOid, flags: HoldFlags) {
        let key = oid.cache_key();
        let Some(&idx) = self.index_of.get(&oid) else {
            return;
        };
        let Some(entry) = self.lru.lookup(idx, key) else {
            self.index_of.remove(&oid);
            return;
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if flags.kill_dkey {
            entry.kill = true;
        }
        if entry.refcount == 0 && entry.kill {
            self.lru.evict(idx, key);
            self.index_of.remove(&oid);
        }
    }

    pub fn aggregate(&mut self) {
        self.lru.aggregate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(n: u64) -> UnitOid {
        UnitOid {
            class: 0,
            shard: 0,
            pub_id: n,
        }
    }

    #[test]
    fn write_then_read_visible_at_epoch() {
        let mut container = Container::new();
        container
            .update_single_value(oid(1), b"d", b"a", 10, b"value-10")
            .unwrap();
        let v = container.fetch_single_value(oid(1), b"d", b"a", 20).unwrap();
        assert_eq!(v, Some(b"value-10".to_vec()));
        let v0 = container.fetch_single_value(oid(1), b"d", b"a", 5).unwrap();
        assert_eq!(v0, None);
    }

    #[test]
    fn object_punch_hides_all_later_reads() {
        let mut container = Container::new();
        container
            .update_single_value(oid(2), b"d", b"a", 10, b"v")
            .unwrap();
        container.punch_object(oid(2), 15);
        assert_eq!(
            container.fetch_single_value(oid(2), b"d", b"a", 20).unwrap(),
            None
        );
        assert_eq!(
            container.fetch_single_value(oid(2), b"d", b"a", 12).unwrap(),
            Some(b"v".to_vec())
        );
    }

    #[test]
    fn akey_punch_propagates_to_dkey_and_object() {
        let mut container = Container::new();
        container
            .update_single_value(oid(3), b"d", b"a", 10, b"v")
            .unwrap();
        container.punch_akey(oid(3), b"d", b"a", 20, 20, false).unwrap();
        let object = container.objects.get(&oid(3)).unwrap();
        assert!(object.dkeys.is_empty() || object.punched_epoch.is_some());
    }

    #[test]
    fn pool_opens_and_closes_containers_independently() {
        let mut pool = Pool::new();
        let a = uuid::Uuid::from_u128(1);
        let b = uuid::Uuid::from_u128(2);
        pool.open_container(a)
            .update_single_value(oid(1), b"d", b"a", 10, b"va")
            .unwrap();
        pool.open_container(b)
            .update_single_value(oid(1), b"d", b"a", 10, b"vb")
            .unwrap();
        assert_eq!(pool.container_count(), 2);
        assert_eq!(
            pool.container(a)
                .unwrap()
                .fetch_single_value(oid(1), b"d", b"a", 20)
                .unwrap(),
            Some(b"va".to_vec())
        );
        pool.close_container(a);
        assert_eq!(pool.container_count(), 1);
        assert!(pool.container(a).is_none());
    }

    #[test]
    fn object_cache_hold_release_refcounts() {
        let mut cache = ObjectCache::new(4).unwrap();
        let idx1 = cache
            .hold(oid(1), HoldFlags { create: true, ..Default::default() })
            .unwrap();
        let idx2 = cache
            .hold(oid(1), HoldFlags::default())
            .unwrap();
        assert_eq!(idx1, idx2);
        cache.release(oid(1), HoldFlags::default());
        cache.release(
            oid(1),
            HoldFlags {
                kill_dkey: true,
                ..Default::default()
            },
        );
        assert!(cache
            .hold(oid(1), HoldFlags::default())
            .is_err());
    }
}
