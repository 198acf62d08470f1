//! Storage layer for BrambleDB.
//!
//! This crate provides:
//! - A disk manager for page-level file I/O (the buffer pool's
//!   [`bramble_buffer::PageStore`] collaborator)
//! - The reserved header page mapping index names to root page ids
//! - A clustered B+ tree index built on the buffer pool

pub mod btree;
pub mod disk;
pub mod header;

pub use btree::{BPlusTree, TreeIter};
pub use disk::{DiskManager, DiskManagerConfig};
pub use header::{Header, HeaderMut};
