//! B+tree family (§3, §4.E): class-registered key/value codecs over an
//! ordered index with split/merge, probing, and anchor-resumable
//! iteration.

pub mod class;
pub mod node;
pub mod tree;

pub use class::{BytesKey, BytesVal, KeyCodec, KeyKind, TreeFeatures, UintKey, ValCodec};
pub use node::{Node, NodeId, Record, Root};
pub use tree::{Anchor, Cursor, ProbeOp, Tree, TreeOptions};
