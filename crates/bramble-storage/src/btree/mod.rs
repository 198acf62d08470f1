//! Clustered B+ tree index built on the buffer pool.
//!
//! Nodes are fixed-fanout pages reached only through buffer-pool pins.
//! [`tree::BPlusTree`] drives search, insertion (with recursive splits),
//! deletion (with redistribution and coalescing), and forward iteration;
//! [`node`] holds the page layout and typed views.

mod iter;
mod node;
mod tree;

pub use iter::TreeIter;
pub use node::{page_type, Internal, InternalMut, Leaf, LeafMut, NODE_CAPACITY};
pub use tree::BPlusTree;
