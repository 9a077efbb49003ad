//! Core B+tree logic (§4.E): creation, probing, upsert, split/merge,
//! iteration and anchors.
//!
//! The descend-then-fix-up-on-the-way-back shape (collect a path of
//! `(NodeId, child_index)` on the way down, split/merge on the way back
//! up) follows the teacher's `storage::btree::tree::definition::api`
//! insert/delete routines, adapted from page-slot bookkeeping to the
//! arena-of-`Node` representation in `btree::node`.

use std::cmp::Ordering;
use std::marker::PhantomData;

use crate::btree::class::{KeyCodec, ValCodec};
use crate::btree::node::{Node, NodeBody, NodeId, Record, Root, Separator};
use crate::error::{Result, VosError};

/// Probe operation codes (§4.E).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProbeOp {
    First,
    Last,
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
    /// Trust a previously computed path without re-descending. Misuse
    /// (passing a stale path after concurrent mutation) can corrupt the
    /// tree; the caller assumes that risk.
    Bypass,
}

/// Tree-creation feature bits plus the fixed `order`.
#[derive(Clone, Copy, Debug)]
pub struct TreeOptions {
    pub order: usize,
    pub dynamic_root: bool,
    pub skip_leaf_rebalance: bool,
    pub embed_first: bool,
}

impl TreeOptions {
    pub fn validate(&self) -> Result<()> {
        if !(3..=63).contains(&self.order) {
            return Err(VosError::InvalidArgument(format!(
                "tree order {} outside valid range [3, 63]",
                self.order
            )));
        }
        Ok(())
    }
}

/// A serializable cursor position, round-tripping the last fetched key
/// so iteration can resume across process restarts (§4.E).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Anchor {
    pub key: Vec<u8>,
    pub forward: bool,
}

struct PathEntry {
    node: NodeId,
    child_index: usize,
}

/// An ordered index over `(K, V)` pairs, rooted in a volatile arena.
pub struct Tree<K: KeyCodec, V: ValCodec> {
    arena: Vec<Option<Node>>,
    free: Vec<NodeId>,
    root: Root,
    opts: TreeOptions,
    len: usize,
    _marker: PhantomData<(K, V)>,
}

impl<K: KeyCodec, V: ValCodec> Tree<K, V> {
    pub fn new(opts: TreeOptions) -> Result<Self> {
        opts.validate()?;
        Ok(Self {
            arena: Vec::new(),
            free: Vec::new(),
            root: Root::Empty,
            opts,
            len: 0,
            _marker: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn alloc_node(&mut self, node: Node) -> NodeId {
        if let Some(id) = self.free.pop() {
            self.arena[id.0 as usize] = Some(node);
            id
        } else {
            let id = NodeId(self.arena.len() as u32);
            self.arena.push(Some(node));
            id
        }
    }

    fn free_node(&mut self, id: NodeId) {
        self.arena[id.0 as usize] = None;
        self.free.push(id);
    }

    fn node(&self, id: NodeId) -> &Node {
        self.arena[id.0 as usize].as_ref().expect("dangling node id")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.arena[id.0 as usize].as_mut().expect("dangling node id")
    }

    fn encode(key: &K) -> Vec<u8> {
        let mut buf = Vec::new();
        K::encode_key(key, &mut buf);
        buf
    }

    /// Inserts or, if the key already exists, updates its value.
    pub fn upsert(&mut self, key: &K, val: &V) -> Result<()> {
        let ekey = Self::encode(key);
        let mut eval = Vec::new();
        V::encode_val(val, &mut eval);

        match std::mem::replace(&mut self.root, Root::Empty) {
            Root::Empty => {
                if self.opts.embed_first {
                    self.root = Root::Embedded(Record { key: ekey, val: eval });
                } else {
                    let leaf = self.alloc_node(Node::new_leaf());
                    if let NodeBody::Leaf { records, .. } = &mut self.node_mut(leaf).body {
                        records.push(Record { key: ekey, val: eval });
                    }
                    self.root = Root::Node { id: leaf, depth: 0 };
                }
                self.len += 1;
                Ok(())
            }
            Root::Embedded(existing) => {
                if K::compare_encoded(&existing.key, &ekey) == Ordering::Equal {
                    self.root = Root::Embedded(Record { key: ekey, val: eval });
                    Ok(())
                } else {
                    // Promote to a real node: the embedded bit clears on
                    // the second insert (§4.E).
                    let leaf = self.alloc_node(Node::new_leaf());
                    {
                        let NodeBody::Leaf { records, .. } = &mut self.node_mut(leaf).body else {
                            unreachable!()
                        };
                        records.push(existing);
                        records.push(Record { key: ekey, val: eval });
                        records.sort_by(|a, b| K::compare_encoded(&a.key, &b.key));
                    }
                    self.root = Root::Node { id: leaf, depth: 0 };
                    self.len += 1;
                    Ok(())
                }
            }
            Root::Node { id, depth } => {
                self.root = Root::Node { id, depth };
                self.insert_into_tree(&ekey, &eval)
            }
        }
    }

    fn insert_into_tree(&mut self, ekey: &[u8], eval: &[u8]) -> Result<()> {
        let Root::Node { id: root_id, depth } = self.root else {
            unreachable!()
        };
        let mut path = Vec::new();
        let leaf = self.descend_to_leaf(root_id, ekey, &mut path);

        let inserted_new = {
            let NodeBody::Leaf { records, .. } = &mut self.node_mut(leaf).body else {
                unreachable!()
            };
            match records.binary_search_by(|r| K::compare_encoded(&r.key, ekey)) {
                Ok(pos) => {
                    records[pos].val = eval.to_vec();
                    false
                }
                Err(pos) => {
                    records.insert(
                        pos,
                        Record {
                            key: ekey.to_vec(),
                            val: eval.to_vec(),
                        },
                    );
                    true
                }
            }
        };
        if inserted_new {
            self.len += 1;
        }

        if self.node(leaf).len() > self.opts.order {
            self.split_up(leaf, path, depth);
        }
        Ok(())
    }

    fn descend_to_leaf(&self, root_id: NodeId, ekey: &[u8], path: &mut Vec<PathEntry>) -> NodeId {
        let mut current = root_id;
        loop {
            let node = self.node(current);
            match &node.body {
                NodeBody::Leaf { .. } => return current,
                NodeBody::Internal {
                    first_child,
                    separators,
                } => {
                    let mut child_index = 0usize;
                    let mut next = *first_child;
                    for (i, sep) in separators.iter().enumerate() {
                        if K::compare_encoded(ekey, &sep.key) != Ordering::Less {
                            next = sep.child;
                            child_index = i + 1;
                        } else {
                            break;
                        }
                    }
                    path.push(PathEntry {
                        node: current,
                        child_index,
                    });
                    current = next;
                }
            }
        }
    }

    /// Splits `node_id` (a leaf that just overflowed `order`), then walks
    /// `path` back to the root, splitting ancestors as needed.
    fn split_up(&mut self, node_id: NodeId, mut path: Vec<PathEntry>, depth: u32) {
        let order = self.opts.order;
        let (sep_key, new_node_id) = {
            let NodeBody::Leaf { records, next, .. } = &mut self.node_mut(node_id).body else {
                unreachable!()
            };
            let mid = (records.len() + 1) / 2; // ceil((order+1)/2)
            let right_records: Vec<Record> = records.split_off(mid);
            let sep_key = right_records[0].key.clone();
            let old_next = *next;

            let new_node = Node {
                body: NodeBody::Leaf {
                    records: right_records,
                    next: old_next,
                    prev: Some(node_id),
                },
            };
            let new_id = self.alloc_node(new_node);
            if let NodeBody::Leaf { next, .. } = &mut self.node_mut(node_id).body {
                *next = Some(new_id);
            }
            if let Some(n) = old_next {
                if let NodeBody::Leaf { prev, .. } = &mut self.node_mut(n).body {
                    *prev = Some(new_id);
                }
            }
            (sep_key, new_id)
        };

        let mut promote = Some((sep_key, new_node_id));
        while let Some(entry) = path.pop() {
            let Some((key, child)) = promote.take() else {
                break;
            };
            let NodeBody::Internal { separators, .. } = &mut self.node_mut(entry.node).body else {
                unreachable!()
            };
            separators.insert(
                entry.child_index,
                Separator { key, child },
            );
            if separators.len() + 1 > order {
                let mid = separators.len() / 2;
                let NodeBody::Internal { separators, .. } = &mut self.node_mut(entry.node).body
                else {
                    unreachable!()
                };
                let mut right_seps = separators.split_off(mid);
                // The separator at the split point is promoted up; its
                // child becomes the right node's first_child (every
                // separator routes to the child holding keys >= it).
                let promoted = right_seps.remove(0);
                let new_internal = Node {
                    body: NodeBody::Internal {
                        first_child: promoted.child,
                        separators: right_seps,
                    },
                };
                let new_id = self.alloc_node(new_internal);
                promote = Some((promoted.key, new_id));
            } else {
                promote = None;
            }
        }

        if let Some((key, child)) = promote {
            // Root split: allocate a new root of depth+1.
            let Root::Node { id: old_root, .. } = self.root else {
                unreachable!()
            };
            let new_root = Node {
                body: NodeBody::Internal {
                    first_child: old_root,
                    separators: vec![Separator { key, child }],
                },
            };
            let new_root_id = self.alloc_node(new_root);
            self.root = Root::Node {
                id: new_root_id,
                depth: depth + 1,
            };
        }
    }

    /// Looks up `key`, returning its value if present.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let ekey = Self::encode(key);
        match &self.root {
            Root::Empty => Ok(None),
            Root::Embedded(rec) => {
                if K::compare_encoded(&rec.key, &ekey) == Ordering::Equal {
                    Ok(Some(V::decode_val(&rec.val)?))
                } else {
                    Ok(None)
                }
            }
            Root::Node { id, .. } => {
                let mut path = Vec::new();
                let leaf = self.descend_to_leaf(*id, &ekey, &mut path);
                let NodeBody::Leaf { records, .. } = &self.node(leaf).body else {
                    unreachable!()
                };
                match records.binary_search_by(|r| K::compare_encoded(&r.key, &ekey)) {
                    Ok(pos) => Ok(Some(V::decode_val(&records[pos].val)?)),
                    Err(_) => Ok(None),
                }
            }
        }
    }

    /// Probes for the first record matching `op` relative to `key` (or
    /// the tree's overall first/last when `op` is [`ProbeOp::First`]/
    /// [`ProbeOp::Last`] and `key` is ignored).
    pub fn probe(&self, op: ProbeOp, key: Option<&K>) -> Result<Option<(K, V)>> {
        match op {
            ProbeOp::First => self.first_leaf_entry(true),
            ProbeOp::Last => self.first_leaf_entry(false),
            ProbeOp::Eq | ProbeOp::Gt | ProbeOp::Ge | ProbeOp::Lt | ProbeOp::Le => {
                let key = key.ok_or_else(|| {
                    VosError::InvalidArgument("probe op requires a key".into())
                })?;
                self.probe_relative(op, key)
            }
            ProbeOp::Bypass => Err(VosError::InvalidArgument(
                "bypass probing requires a cached path, use Cursor::bypass".into(),
            )),
        }
    }

    fn first_leaf_entry(&self, forward: bool) -> Result<Option<(K, V)>> {
        match &self.root {
            Root::Empty => Ok(None),
            Root::Embedded(rec) => Ok(Some((K::decode_key(&rec.key)?, V::decode_val(&rec.val)?))),
            Root::Node { id, .. } => {
                let mut current = *id;
                loop {
                    match &self.node(current).body {
                        NodeBody::Leaf { records, .. } => {
                            let rec = if forward {
                                records.first()
                            } else {
                                records.last()
                            };
                            return match rec {
                                Some(r) => Ok(Some((K::decode_key(&r.key)?, V::decode_val(&r.val)?))),
                                None => Ok(None),
                            };
                        }
                        NodeBody::Internal {
                            first_child,
                            separators,
                        } => {
                            current = if forward {
                                *first_child
                            } else {
                                separators.last().map(|s| s.child).unwrap_or(*first_child)
                            };
                        }
                    }
                }
            }
        }
    }

    fn probe_relative(&self, op: ProbeOp, key: &K) -> Result<Option<(K, V)>> {
        let ekey = Self::encode(key);
        let Root::Node { id, .. } = &self.root else {
            return match &self.root {
                Root::Embedded(rec) => {
                    let cmp = K::compare_encoded(&rec.key, &ekey);
                    let matches = match op {
                        ProbeOp::Eq => cmp == Ordering::Equal,
                        ProbeOp::Ge => cmp != Ordering::Less,
                        ProbeOp::Gt => cmp == Ordering::Greater,
                        ProbeOp::Le => cmp != Ordering::Greater,
                        ProbeOp::Lt => cmp == Ordering::Less,
                        _ => unreachable!(),
                    };
                    if matches {
                        Ok(Some((K::decode_key(&rec.key)?, V::decode_val(&rec.val)?)))
                    } else {
                        Ok(None)
                    }
                }
                Root::Empty => Ok(None),
                Root::Node { .. } => unreachable!(),
            };
        };
        let mut path = Vec::new();
        let leaf = self.descend_to_leaf(*id, &ekey, &mut path);
        let NodeBody::Leaf { records, .. } = &self.node(leaf).body else {
            unreachable!()
        };
        let pos = records.partition_point(|r| K::compare_encoded(&r.key, &ekey) == Ordering::Less);
        let idx = match op {
            ProbeOp::Eq => {
                if pos < records.len() && K::compare_encoded(&records[pos].key, &ekey) == Ordering::Equal {
                    Some(pos)
                } else {
                    None
                }
            }
            ProbeOp::Ge => if pos < records.len() { Some(pos) } else { None },
            ProbeOp::Gt => {
                let mut p = pos;
                if p < records.len() && K::compare_encoded(&records[p].key, &ekey) == Ordering::Equal {
                    p += 1;
                }
                if p < records.len() { Some(p) } else { None }
            }
            ProbeOp::Le => {
                if pos < records.len() && K::compare_encoded(&records[pos].key, &ekey) == Ordering::Equal {
                    Some(pos)
                } else if pos > 0 {
                    Some(pos - 1)
                } else {
                    None
                }
            }
            ProbeOp::Lt => if pos > 0 { Some(pos - 1) } else { None },
            _ => unreachable!(),
        };
        match idx {
            Some(i) => Ok(Some((
                K::decode_key(&records[i].key)?,
                V::decode_val(&records[i].val)?,
            ))),
            None => Ok(None),
        }
    }

    /// Deletes `key` if present. Falls back to a leaf-only removal when
    /// `skip_leaf_rebalance` is set; otherwise borrows from or merges
    /// with a sibling when the leaf underflows below `ceil(order/2)`,
    /// propagating the same rebalance up through ancestors and
    /// collapsing the root when it is left with a single child.
    pub fn delete(&mut self, key: &K) -> Result<bool> {
        let ekey = Self::encode(key);
        match std::mem::replace(&mut self.root, Root::Empty) {
            Root::Empty => {
                self.root = Root::Empty;
                Ok(false)
            }
            Root::Embedded(rec) => {
                if K::compare_encoded(&rec.key, &ekey) == Ordering::Equal {
                    self.root = Root::Empty;
                    self.len -= 1;
                    Ok(true)
                } else {
                    self.root = Root::Embedded(rec);
                    Ok(false)
                }
            }
            Root::Node { id, depth } => {
                self.root = Root::Node { id, depth };
                let mut path = Vec::new();
                let leaf = self.descend_to_leaf(id, &ekey, &mut path);
                let removed = {
                    let NodeBody::Leaf { records, .. } = &mut self.node_mut(leaf).body else {
                        unreachable!()
                    };
                    match records.binary_search_by(|r| K::compare_encoded(&r.key, &ekey)) {
                        Ok(pos) => {
                            records.remove(pos);
                            true
                        }
                        Err(_) => false,
                    }
                };
                if removed {
                    self.len -= 1;
                    if !self.opts.skip_leaf_rebalance {
                        self.rebalance_leaf_after_delete(leaf, path);
                    }
                }
                Ok(removed)
            }
        }
    }

    fn min_fill(&self) -> usize {
        (self.opts.order + 1) / 2
    }

    /// Returns the `pos`-th child of an internal node.
    fn child_at(&self, node_id: NodeId, pos: usize) -> NodeId {
        let NodeBody::Internal { first_child, separators } = &self.node(node_id).body else {
            unreachable!()
        };
        if pos == 0 {
            *first_child
        } else {
            separators[pos - 1].child
        }
    }

    /// Fixes up a leaf that just underflowed below [`Self::min_fill`],
    /// borrowing from a sibling when one has spare records, else merging
    /// with a sibling and propagating the separator removal up through
    /// `path`. A leaf at or above the minimum, or the sole leaf at the
    /// root, is left alone.
    fn rebalance_leaf_after_delete(&mut self, leaf: NodeId, mut path: Vec<PathEntry>) {
        if path.is_empty() {
            // Leaf is the root. Drop it to `Root::Empty` once drained;
            // underfill is otherwise tolerated at the root.
            let NodeBody::Leaf { records, .. } = &self.node(leaf).body else {
                unreachable!()
            };
            if records.is_empty() {
                self.free_node(leaf);
                self.root = Root::Empty;
            }
            return;
        }

        let NodeBody::Leaf { records, .. } = &self.node(leaf).body else {
            unreachable!()
        };
        if records.len() >= self.min_fill() {
            return;
        }

        let entry = path.pop().expect("checked non-empty above");
        let parent = entry.node;
        let child_index = entry.child_index;
        let nchildren = self.node(parent).len();
        let has_left = child_index > 0;
        let has_right = child_index + 1 < nchildren;

        if has_left {
            let left_id = self.child_at(parent, child_index - 1);
            let left_len = self.node(left_id).len();
            if left_len > self.min_fill() {
                self.borrow_from_left_leaf(parent, child_index, left_id, leaf);
                return;
            }
        }
        if has_right {
            let right_id = self.child_at(parent, child_index + 1);
            let right_len = self.node(right_id).len();
            if right_len > self.min_fill() {
                self.borrow_from_right_leaf(parent, child_index, right_id, leaf);
                return;
            }
        }

        if has_left {
            let left_id = self.child_at(parent, child_index - 1);
            self.merge_leaf_into_left(parent, child_index, left_id, leaf);
        } else if has_right {
            let right_id = self.child_at(parent, child_index + 1);
            self.merge_right_into_leaf(parent, child_index, right_id, leaf);
        } else {
            // Only child of its parent; nothing to borrow from or merge
            // with. Can only happen transiently while the parent itself
            // is mid-rebalance higher up the tree.
            return;
        }

        self.rebalance_internal_after_delete(parent, path);
    }

    fn borrow_from_left_leaf(&mut self, parent: NodeId, child_index: usize, left_id: NodeId, leaf: NodeId) {
        let borrowed = {
            let NodeBody::Leaf { records, .. } = &mut self.node_mut(left_id).body else {
                unreachable!()
            };
            records.pop().expect("left sibling is above min_fill")
        };
        let new_first_key = borrowed.key.clone();
        {
            let NodeBody::Leaf { records, .. } = &mut self.node_mut(leaf).body else {
                unreachable!()
            };
            records.insert(0, borrowed);
        }
        let NodeBody::Internal { separators, .. } = &mut self.node_mut(parent).body else {
            unreachable!()
        };
        separators[child_index - 1].key = new_first_key;
    }

    fn borrow_from_right_leaf(&mut self, parent: NodeId, child_index: usize, right_id: NodeId, leaf: NodeId) {
        let borrowed = {
            let NodeBody::Leaf { records, .. } = &mut self.node_mut(right_id).body else {
                unreachable!()
            };
            records.remove(0)
        };
        {
            let NodeBody::Leaf { records, .. } = &mut self.node_mut(leaf).body else {
                unreachable!()
            };
            records.push(borrowed);
        }
        let new_right_first_key = {
            let NodeBody::Leaf { records, .. } = &self.node(right_id).body else {
                unreachable!()
            };
            records
                .first()
                .expect("right sibling is above min_fill, still non-empty after lending one")
                .key
                .clone()
        };
        let NodeBody::Internal { separators, .. } = &mut self.node_mut(parent).body else {
            unreachable!()
        };
        separators[child_index].key = new_right_first_key;
    }

    fn merge_leaf_into_left(&mut self, parent: NodeId, child_index: usize, left_id: NodeId, leaf: NodeId) {
        let (mut records, leaf_next) = {
            let NodeBody::Leaf { records, next, .. } = &mut self.node_mut(leaf).body else {
                unreachable!()
            };
            (std::mem::take(records), *next)
        };
        {
            let NodeBody::Leaf { records: left_records, next, .. } = &mut self.node_mut(left_id).body
            else {
                unreachable!()
            };
            left_records.append(&mut records);
            *next = leaf_next;
        }
        if let Some(n) = leaf_next {
            let NodeBody::Leaf { prev, .. } = &mut self.node_mut(n).body else {
                unreachable!()
            };
            *prev = Some(left_id);
        }
        self.free_node(leaf);
        let NodeBody::Internal { separators, .. } = &mut self.node_mut(parent).body else {
            unreachable!()
        };
        separators.remove(child_index - 1);
    }

    fn merge_right_into_leaf(&mut self, parent: NodeId, child_index: usize, right_id: NodeId, leaf: NodeId) {
        let (mut records, right_next) = {
            let NodeBody::Leaf { records, next, .. } = &mut self.node_mut(right_id).body else {
                unreachable!()
            };
            (std::mem::take(records), *next)
        };
        {
            let NodeBody::Leaf { records: leaf_records, next, .. } = &mut self.node_mut(leaf).body
            else {
                unreachable!()
            };
            leaf_records.append(&mut records);
            *next = right_next;
        }
        if let Some(n) = right_next {
            let NodeBody::Leaf { prev, .. } = &mut self.node_mut(n).body else {
                unreachable!()
            };
            *prev = Some(leaf);
        }
        self.free_node(right_id);
        let NodeBody::Internal { separators, .. } = &mut self.node_mut(parent).body else {
            unreachable!()
        };
        separators.remove(child_index);
    }

    /// Mirrors [`Self::rebalance_leaf_after_delete`] one level up: fixes
    /// up an internal node that lost a child to a merge, borrowing a
    /// separator from a sibling or merging with one, up to the root.
    fn rebalance_internal_after_delete(&mut self, node_id: NodeId, mut path: Vec<PathEntry>) {
        if path.is_empty() {
            let Root::Node { depth, .. } = self.root else {
                unreachable!()
            };
            if self.node(node_id).len() == 1 {
                let NodeBody::Internal { first_child, .. } = &self.node(node_id).body else {
                    unreachable!()
                };
                let only_child = *first_child;
                self.free_node(node_id);
                self.root = Root::Node {
                    id: only_child,
                    depth: depth - 1,
                };
            }
            return;
        }

        if self.node(node_id).len() >= self.min_fill() {
            return;
        }

        let entry = path.pop().expect("checked non-empty above");
        let parent = entry.node;
        let child_index = entry.child_index;
        let nchildren = self.node(parent).len();
        let has_left = child_index > 0;
        let has_right = child_index + 1 < nchildren;

        if has_left {
            let left_id = self.child_at(parent, child_index - 1);
            if self.node(left_id).len() > self.min_fill() {
                self.borrow_from_left_internal(parent, child_index, left_id, node_id);
                return;
            }
        }
        if has_right {
            let right_id = self.child_at(parent, child_index + 1);
            if self.node(right_id).len() > self.min_fill() {
                self.borrow_from_right_internal(parent, child_index, right_id, node_id);
                return;
            }
        }

        if has_left {
            let left_id = self.child_at(parent, child_index - 1);
            self.merge_internal_into_left(parent, child_index, left_id, node_id);
        } else if has_right {
            let right_id = self.child_at(parent, child_index + 1);
            self.merge_right_into_internal(parent, child_index, right_id, node_id);
        } else {
            return;
        }

        self.rebalance_internal_after_delete(parent, path);
    }

    fn borrow_from_left_internal(
        &mut self,
        parent: NodeId,
        child_index: usize,
        left_id: NodeId,
        node_id: NodeId,
    ) {
        let borrowed = {
            let NodeBody::Internal { separators, .. } = &mut self.node_mut(left_id).body else {
                unreachable!()
            };
            separators.pop().expect("left sibling is above min_fill")
        };
        let sep_key = {
            let NodeBody::Internal { separators, .. } = &self.node(parent).body else {
                unreachable!()
            };
            separators[child_index - 1].key.clone()
        };
        {
            let NodeBody::Internal { first_child, separators } = &mut self.node_mut(node_id).body
            else {
                unreachable!()
            };
            let old_first = *first_child;
            *first_child = borrowed.child;
            separators.insert(0, Separator { key: sep_key, child: old_first });
        }
        let NodeBody::Internal { separators, .. } = &mut self.node_mut(parent).body else {
            unreachable!()
        };
        separators[child_index - 1].key = borrowed.key;
    }

    fn borrow_from_right_internal(
        &mut self,
        parent: NodeId,
        child_index: usize,
        right_id: NodeId,
        node_id: NodeId,
    ) {
        let old_right_first_child = {
            let NodeBody::Internal { first_child, .. } = &self.node(right_id).body else {
                unreachable!()
            };
            *first_child
        };
        let sep_key_into_node = {
            let NodeBody::Internal { separators, .. } = &self.node(parent).body else {
                unreachable!()
            };
            separators[child_index].key.clone()
        };
        {
            let NodeBody::Internal { separators, .. } = &mut self.node_mut(node_id).body else {
                unreachable!()
            };
            separators.push(Separator {
                key: sep_key_into_node,
                child: old_right_first_child,
            });
        }
        let new_right_sep_key = {
            let NodeBody::Internal { first_child, separators } = &mut self.node_mut(right_id).body
            else {
                unreachable!()
            };
            let promoted = separators.remove(0);
            *first_child = promoted.child;
            promoted.key
        };
        let NodeBody::Internal { separators, .. } = &mut self.node_mut(parent).body else {
            unreachable!()
        };
        separators[child_index].key = new_right_sep_key;
    }

    fn merge_internal_into_left(
        &mut self,
        parent: NodeId,
        child_index: usize,
        left_id: NodeId,
        node_id: NodeId,
    ) {
        let sep_key = {
            let NodeBody::Internal { separators, .. } = &self.node(parent).body else {
                unreachable!()
            };
            separators[child_index - 1].key.clone()
        };
        let (node_first_child, mut node_separators) = {
            let NodeBody::Internal { first_child, separators } = &mut self.node_mut(node_id).body
            else {
                unreachable!()
            };
            (*first_child, std::mem::take(separators))
        };
        {
            let NodeBody::Internal { separators: left_seps, .. } = &mut self.node_mut(left_id).body
            else {
                unreachable!()
            };
            left_seps.push(Separator { key: sep_key, child: node_first_child });
            left_seps.append(&mut node_separators);
        }
        self.free_node(node_id);
        let NodeBody::Internal { separators, .. } = &mut self.node_mut(parent).body else {
            unreachable!()
        };
        separators.remove(child_index - 1);
    }

    fn merge_right_into_internal(
        &mut self,
        parent: NodeId,
        child_index: usize,
        right_id: NodeId,
        node_id: NodeId,
    ) {
        let sep_key = {
            let NodeBody::Internal { separators, .. } = &self.node(parent).body else {
                unreachable!()
            };
            separators[child_index].key.clone()
        };
        let (right_first_child, mut right_separators) = {
            let NodeBody::Internal { first_child, separators } = &mut self.node_mut(right_id).body
            else {
                unreachable!()
            };
            (*first_child, std::mem::take(separators))
        };
        {
            let NodeBody::Internal { separators: node_seps, .. } = &mut self.node_mut(node_id).body
            else {
                unreachable!()
            };
            node_seps.push(Separator { key: sep_key, child: right_first_child });
            node_seps.append(&mut right_separators);
        }
        self.free_node(right_id);
        let NodeBody::Internal { separators, .. } = &mut self.node_mut(parent).body else {
            unreachable!()
        };
        separators.remove(child_index);
    }
}

/// Where an open [`Cursor`] currently sits (§4.E "Iteration").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CursorPos {
    /// Not yet positioned by a `probe`.
    Unset,
    /// Sitting on the tree's sole embedded-root record.
    Embedded,
    /// Sitting on `records[index]` of the given leaf.
    Leaf(NodeId, usize),
    /// Walked off either end.
    End,
}

/// A resumable iteration cursor (§4.E `iter_prepare`/`probe`/`next`/
/// `prev`/`fetch`/`delete`/`finish`). Cursor state is a plain value (leaf
/// id + in-leaf index) rather than a borrow, so it can be serialized into
/// an [`Anchor`] and handed back across a process restart.
#[derive(Clone, Debug)]
pub struct Cursor {
    pos: CursorPos,
    forward: bool,
}

impl<K: KeyCodec, V: ValCodec> Tree<K, V> {
    /// Opens a cursor with no position yet; the first `probe` call seats
    /// it. `forward` controls which direction `next`/`prev` advance by
    /// default and is carried into any [`Anchor`] taken from this cursor.
    pub fn iter_prepare(&self, forward: bool) -> Cursor {
        Cursor {
            pos: CursorPos::Unset,
            forward,
        }
    }

    /// Positions `cursor` at the first record matching `op` (as
    /// [`Tree::probe`]) and returns it.
    pub fn cursor_probe(
        &self,
        cursor: &mut Cursor,
        op: ProbeOp,
        key: Option<&K>,
    ) -> Result<Option<(K, V)>> {
        let ekey = key.map(Self::encode);
        self.cursor_seek(cursor, op, ekey.as_deref())
    }

    /// Reopens a cursor at a previously serialized [`Anchor`], seeking to
    /// the first record `>=` (forward) or `<=` (reverse) the anchored
    /// key. Per §4.E / §8, fetching right after this call yields an entry
    /// whose key equals the anchored key, provided it still exists.
    pub fn cursor_from_anchor(&self, anchor: &Anchor) -> Result<Cursor> {
        let mut cursor = Cursor {
            pos: CursorPos::Unset,
            forward: anchor.forward,
        };
        let op = if anchor.forward { ProbeOp::Ge } else { ProbeOp::Le };
        self.cursor_seek(&mut cursor, op, Some(&anchor.key))?;
        Ok(cursor)
    }

    /// Serializes `cursor`'s current position as an [`Anchor`] keyed on
    /// the record it currently sits on, or `None` if unpositioned/at end.
    pub fn anchor(&self, cursor: &Cursor) -> Result<Option<Anchor>> {
        if self.cursor_fetch(cursor)?.is_none() {
            return Ok(None);
        }
        Ok(self.cursor_current_ekey(cursor).map(|key| Anchor {
            key,
            forward: cursor.forward,
        }))
    }

    fn cursor_current_ekey(&self, cursor: &Cursor) -> Option<Vec<u8>> {
        match cursor.pos {
            CursorPos::Embedded => match &self.root {
                Root::Embedded(rec) => Some(rec.key.clone()),
                _ => None,
            },
            CursorPos::Leaf(id, idx) => match &self.node(id).body {
                NodeBody::Leaf { records, .. } => records.get(idx).map(|r| r.key.clone()),
                _ => None,
            },
            CursorPos::Unset | CursorPos::End => None,
        }
    }

    /// Returns the entry `cursor` currently sits on without moving it.
    pub fn cursor_fetch(&self, cursor: &Cursor) -> Result<Option<(K, V)>> {
        match cursor.pos {
            CursorPos::Unset | CursorPos::End => Ok(None),
            CursorPos::Embedded => match &self.root {
                Root::Embedded(rec) => {
                    Ok(Some((K::decode_key(&rec.key)?, V::decode_val(&rec.val)?)))
                }
                _ => Ok(None),
            },
            CursorPos::Leaf(id, idx) => match &self.node(id).body {
                NodeBody::Leaf { records, .. } => match records.get(idx) {
                    Some(rec) => Ok(Some((K::decode_key(&rec.key)?, V::decode_val(&rec.val)?))),
                    None => Ok(None),
                },
                _ => Ok(None),
            },
        }
    }

    /// Advances `cursor` one record forward, crossing leaf boundaries via
    /// the leaf linked list, and returns the new current entry.
    pub fn next(&self, cursor: &mut Cursor) -> Result<Option<(K, V)>> {
        match cursor.pos {
            CursorPos::Unset | CursorPos::End => Ok(None),
            CursorPos::Embedded => {
                cursor.pos = CursorPos::End;
                Ok(None)
            }
            CursorPos::Leaf(id, idx) => {
                let NodeBody::Leaf { records, next, .. } = &self.node(id).body else {
                    unreachable!()
                };
                if idx + 1 < records.len() {
                    cursor.pos = CursorPos::Leaf(id, idx + 1);
                } else if let Some(n) = next {
                    cursor.pos = CursorPos::Leaf(*n, 0);
                } else {
                    cursor.pos = CursorPos::End;
                }
                self.cursor_fetch(cursor)
            }
        }
    }

    /// Moves `cursor` one record backward, crossing leaf boundaries via
    /// the leaf linked list, and returns the new current entry.
    pub fn prev(&self, cursor: &mut Cursor) -> Result<Option<(K, V)>> {
        match cursor.pos {
            CursorPos::Unset | CursorPos::End => Ok(None),
            CursorPos::Embedded => {
                cursor.pos = CursorPos::End;
                Ok(None)
            }
            CursorPos::Leaf(id, idx) => {
                if idx > 0 {
                    cursor.pos = CursorPos::Leaf(id, idx - 1);
                } else {
                    let NodeBody::Leaf { prev, .. } = &self.node(id).body else {
                        unreachable!()
                    };
                    match prev {
                        Some(p) => {
                            let NodeBody::Leaf { records, .. } = &self.node(*p).body else {
                                unreachable!()
                            };
                            cursor.pos = CursorPos::Leaf(*p, records.len().saturating_sub(1));
                        }
                        None => cursor.pos = CursorPos::End,
                    }
                }
                self.cursor_fetch(cursor)
            }
        }
    }

    /// Deletes the record `cursor` currently sits on, advancing it to the
    /// next record (matching the teacher's "delete-then-reposition"
    /// cursor contract rather than leaving a dangling position).
    pub fn cursor_delete(&mut self, cursor: &mut Cursor) -> Result<bool> {
        let Some((key, _)) = self.cursor_fetch(cursor)? else {
            return Ok(false);
        };
        // Re-seek after delete: node ids / indices may shift once
        // rebalancing lands, so position by key rather than trusting the
        // cursor's old coordinates.
        let removed = self.delete(&key)?;
        if removed {
            let ekey = Self::encode(&key);
            self.cursor_seek(cursor, ProbeOp::Gt, Some(&ekey))?;
        }
        Ok(removed)
    }

    /// Closes the cursor. No persistent state is associated with an
    /// in-memory cursor, so this only documents the API contract's
    /// lifecycle (§4.E `finish`).
    pub fn finish(&self, _cursor: Cursor) {}

    fn cursor_seek(
        &self,
        cursor: &mut Cursor,
        op: ProbeOp,
        ekey: Option<&[u8]>,
    ) -> Result<Option<(K, V)>> {
        match &self.root {
            Root::Empty => {
                cursor.pos = CursorPos::End;
                Ok(None)
            }
            Root::Embedded(rec) => {
                let matches = match (op, ekey) {
                    (ProbeOp::First, _) | (ProbeOp::Last, _) => true,
                    (_, Some(ekey)) => {
                        let cmp = K::compare_encoded(&rec.key, ekey);
                        match op {
                            ProbeOp::Eq => cmp == Ordering::Equal,
                            ProbeOp::Ge => cmp != Ordering::Less,
                            ProbeOp::Gt => cmp == Ordering::Greater,
                            ProbeOp::Le => cmp != Ordering::Greater,
                            ProbeOp::Lt => cmp == Ordering::Less,
                            ProbeOp::Bypass | ProbeOp::First | ProbeOp::Last => false,
                        }
                    }
                    (_, None) => false,
                };
                cursor.pos = if matches { CursorPos::Embedded } else { CursorPos::End };
                self.cursor_fetch(cursor)
            }
            Root::Node { id, .. } => {
                match op {
                    ProbeOp::First | ProbeOp::Last => {
                        let forward = matches!(op, ProbeOp::First);
                        let mut current = *id;
                        loop {
                            match &self.node(current).body {
                                NodeBody::Leaf { records, .. } => {
                                    cursor.pos = if records.is_empty() {
                                        CursorPos::End
                                    } else if forward {
                                        CursorPos::Leaf(current, 0)
                                    } else {
                                        CursorPos::Leaf(current, records.len() - 1)
                                    };
                                    break;
                                }
                                NodeBody::Internal { first_child, separators } => {
                                    current = if forward {
                                        *first_child
                                    } else {
                                        separators.last().map(|s| s.child).unwrap_or(*first_child)
                                    };
                                }
                            }
                        }
                    }
                    ProbeOp::Bypass => {
                        return Err(VosError::InvalidArgument(
                            "bypass seeking requires the caller to set cursor position directly"
                                .into(),
                        ));
                    }
                    ProbeOp::Eq | ProbeOp::Gt | ProbeOp::Ge | ProbeOp::Lt | ProbeOp::Le => {
                        let ekey = ekey.ok_or_else(|| {
                            VosError::InvalidArgument("probe op requires a key".into())
                        })?;
                        let mut path = Vec::new();
                        let leaf = self.descend_to_leaf(*id, ekey, &mut path);
                        let NodeBody::Leaf { records, .. } = &self.node(leaf).body else {
                            unreachable!()
                        };
                        let pos = records
                            .partition_point(|r| K::compare_encoded(&r.key, ekey) == Ordering::Less);
                        let idx = match op {
                            ProbeOp::Eq => {
                                if pos < records.len()
                                    && K::compare_encoded(&records[pos].key, ekey) == Ordering::Equal
                                {
                                    Some(pos)
                                } else {
                                    None
                                }
                            }
                            ProbeOp::Ge => if pos < records.len() { Some(pos) } else { None },
                            ProbeOp::Gt => {
                                let mut p = pos;
                                if p < records.len()
                                    && K::compare_encoded(&records[p].key, ekey) == Ordering::Equal
                                {
                                    p += 1;
                                }
                                if p < records.len() { Some(p) } else { None }
                            }
                            ProbeOp::Le => {
                                if pos < records.len()
                                    && K::compare_encoded(&records[pos].key, ekey) == Ordering::Equal
                                {
                                    Some(pos)
                                } else if pos > 0 {
                                    Some(pos - 1)
                                } else {
                                    None
                                }
                            }
                            ProbeOp::Lt => if pos > 0 { Some(pos - 1) } else { None },
                            _ => unreachable!(),
                        };
                        cursor.pos = match idx {
                            Some(i) => CursorPos::Leaf(leaf, i),
                            None => CursorPos::End,
                        };
                    }
                }
                self.cursor_fetch(cursor)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::class::{BytesKey, BytesVal};

    fn opts(order: usize) -> TreeOptions {
        TreeOptions {
            order,
            dynamic_root: false,
            skip_leaf_rebalance: false,
            embed_first: true,
        }
    }

    #[test]
    fn embedded_root_promotes_on_second_insert() {
        let mut tree: Tree<BytesKey, BytesVal> = Tree::new(opts(4)).unwrap();
        tree.upsert(&BytesKey(b"a".to_vec()), &BytesVal(b"1".to_vec())).unwrap();
        assert!(matches!(tree.root, Root::Embedded(_)));
        tree.upsert(&BytesKey(b"b".to_vec()), &BytesVal(b"2".to_vec())).unwrap();
        assert!(matches!(tree.root, Root::Node { .. }));
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn minimum_order_three_splits_correctly() {
        let mut tree: Tree<BytesKey, BytesVal> = Tree::new(opts(3)).unwrap();
        for i in 0..30u32 {
            tree.upsert(&BytesKey(i.to_be_bytes().to_vec()), &BytesVal(i.to_be_bytes().to_vec()))
                .unwrap();
        }
        assert_eq!(tree.len(), 30);
        for i in 0..30u32 {
            let v = tree.get(&BytesKey(i.to_be_bytes().to_vec())).unwrap();
            assert_eq!(v, Some(BytesVal(i.to_be_bytes().to_vec())));
        }
    }

    #[test]
    fn upsert_replaces_existing_key_value() {
        let mut tree: Tree<BytesKey, BytesVal> = Tree::new(opts(4)).unwrap();
        tree.upsert(&BytesKey(b"k".to_vec()), &BytesVal(b"v1".to_vec())).unwrap();
        tree.upsert(&BytesKey(b"k".to_vec()), &BytesVal(b"v2".to_vec())).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.get(&BytesKey(b"k".to_vec())).unwrap(), Some(BytesVal(b"v2".to_vec())));
    }

    #[test]
    fn probe_modes_against_sorted_keys() {
        let mut tree: Tree<BytesKey, BytesVal> = Tree::new(opts(4)).unwrap();
        for k in [10u32, 20, 30, 40] {
            tree.upsert(&BytesKey(k.to_be_bytes().to_vec()), &BytesVal(k.to_be_bytes().to_vec()))
                .unwrap();
        }
        let ge = tree.probe(ProbeOp::Ge, Some(&BytesKey(25u32.to_be_bytes().to_vec()))).unwrap();
        assert_eq!(ge.unwrap().0, BytesKey(30u32.to_be_bytes().to_vec()));
        let le = tree.probe(ProbeOp::Le, Some(&BytesKey(25u32.to_be_bytes().to_vec()))).unwrap();
        assert_eq!(le.unwrap().0, BytesKey(20u32.to_be_bytes().to_vec()));
        let first = tree.probe(ProbeOp::First, None).unwrap();
        assert_eq!(first.unwrap().0, BytesKey(10u32.to_be_bytes().to_vec()));
        let last = tree.probe(ProbeOp::Last, None).unwrap();
        assert_eq!(last.unwrap().0, BytesKey(40u32.to_be_bytes().to_vec()));
    }

    #[test]
    fn delete_shrinks_tree_back_to_empty() {
        let mut tree: Tree<BytesKey, BytesVal> = Tree::new(opts(3)).unwrap();
        tree.upsert(&BytesKey(b"only".to_vec()), &BytesVal(b"v".to_vec())).unwrap();
        assert!(tree.delete(&BytesKey(b"only".to_vec())).unwrap());
        assert!(tree.is_empty());
        assert!(matches!(tree.root, Root::Empty));
    }

    #[test]
    fn delete_all_keys_merges_down_to_an_empty_root() {
        let mut tree: Tree<BytesKey, BytesVal> = Tree::new(opts(3)).unwrap();
        for i in 0..30u32 {
            tree.upsert(&BytesKey(i.to_be_bytes().to_vec()), &BytesVal(i.to_be_bytes().to_vec()))
                .unwrap();
        }
        for i in 0..30u32 {
            assert!(tree.delete(&BytesKey(i.to_be_bytes().to_vec())).unwrap());
        }
        assert!(tree.is_empty());
        assert!(matches!(tree.root, Root::Empty));
    }

    #[test]
    fn delete_every_other_key_keeps_forward_iteration_intact() {
        let mut tree: Tree<BytesKey, BytesVal> = Tree::new(opts(4)).unwrap();
        for i in 0..60u32 {
            tree.upsert(&BytesKey(i.to_be_bytes().to_vec()), &BytesVal(i.to_be_bytes().to_vec()))
                .unwrap();
        }
        for i in (0..60u32).step_by(2) {
            assert!(tree.delete(&BytesKey(i.to_be_bytes().to_vec())).unwrap());
        }
        assert_eq!(tree.len(), 30);

        let mut cursor = tree.iter_prepare(true);
        let mut seen = Vec::new();
        if let Some((k, _)) = tree.cursor_probe(&mut cursor, ProbeOp::First, None).unwrap() {
            seen.push(u32::from_be_bytes(k.0.try_into().unwrap()));
        }
        while let Some((k, _)) = tree.next(&mut cursor).unwrap() {
            seen.push(u32::from_be_bytes(k.0.try_into().unwrap()));
        }
        let expected: Vec<u32> = (0..60u32).filter(|i| i % 2 == 1).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn rejects_order_outside_valid_range() {
        assert!(Tree::<BytesKey, BytesVal>::new(opts(2)).is_err());
        assert!(Tree::<BytesKey, BytesVal>::new(opts(64)).is_err());
        assert!(Tree::<BytesKey, BytesVal>::new(opts(3)).is_ok());
    }

    #[test]
    fn cursor_walks_all_records_forward_and_back() {
        let mut tree: Tree<BytesKey, BytesVal> = Tree::new(opts(4)).unwrap();
        for i in 0..50u32 {
            tree.upsert(&BytesKey(i.to_be_bytes().to_vec()), &BytesVal(i.to_be_bytes().to_vec()))
                .unwrap();
        }
        let mut cursor = tree.iter_prepare(true);
        let first = tree.cursor_probe(&mut cursor, ProbeOp::First, None).unwrap();
        assert_eq!(first.unwrap().0, BytesKey(0u32.to_be_bytes().to_vec()));
        let mut count = 1;
        while tree.next(&mut cursor).unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 50);

        let mut back = tree.iter_prepare(false);
        tree.cursor_probe(&mut back, ProbeOp::Last, None).unwrap();
        let mut count = 1;
        while tree.prev(&mut back).unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 50);
    }

    #[test]
    fn anchor_round_trips_across_a_fresh_cursor() {
        let mut tree: Tree<BytesKey, BytesVal> = Tree::new(opts(4)).unwrap();
        for i in 0..1000u32 {
            tree.upsert(&BytesKey(i.to_be_bytes().to_vec()), &BytesVal(i.to_be_bytes().to_vec()))
                .unwrap();
        }
        let mut cursor = tree.iter_prepare(true);
        tree.cursor_probe(&mut cursor, ProbeOp::First, None).unwrap();
        for _ in 0..500 {
            tree.next(&mut cursor).unwrap();
        }
        let anchor = tree.anchor(&cursor).unwrap().expect("positioned cursor has an anchor");
        tree.finish(cursor);

        let mut resumed = tree.cursor_from_anchor(&anchor).unwrap();
        let (key, _) = tree.cursor_fetch(&resumed).unwrap().expect("anchor resolves to an entry");
        assert_eq!(key, BytesKey(500u32.to_be_bytes().to_vec()));
        let (next_key, _) = tree.next(&mut resumed).unwrap().expect("one more entry follows");
        assert_eq!(next_key, BytesKey(501u32.to_be_bytes().to_vec()));
    }

    #[test]
    fn cursor_delete_advances_to_next_record() {
        let mut tree: Tree<BytesKey, BytesVal> = Tree::new(opts(4)).unwrap();
        for i in 0..10u32 {
            tree.upsert(&BytesKey(i.to_be_bytes().to_vec()), &BytesVal(i.to_be_bytes().to_vec()))
                .unwrap();
        }
        let mut cursor = tree.iter_prepare(true);
        tree.cursor_probe(&mut cursor, ProbeOp::Eq, Some(&BytesKey(3u32.to_be_bytes().to_vec())))
            .unwrap();
        assert!(tree.cursor_delete(&mut cursor).unwrap());
        assert_eq!(tree.len(), 9);
        let (key, _) = tree.cursor_fetch(&cursor).unwrap().expect("next record after delete");
        assert_eq!(key, BytesKey(4u32.to_be_bytes().to_vec()));
    }
}
