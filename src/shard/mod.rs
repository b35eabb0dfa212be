//! The sharded (tree-organised) broadcast variant.
//!
//! Bounds per-process fan-out by arranging the broadcast view into a
//! balanced k-ary tree; each process only ever talks to its parent, its
//! siblings and its children.

pub(crate) mod data;
pub(crate) mod process;
pub(crate) mod tree;

pub use process::{ShardedDbrbHandle, ShardedDbrbProcess};
pub use tree::{create_shard, create_tree_view, DoubleShard, TreeError};
