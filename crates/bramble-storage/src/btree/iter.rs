//! Forward iteration over the leaf chain.

use crate::btree::node::Leaf;
use bramble_buffer::BufferPoolManager;
use bramble_common::page::PageId;
use bramble_common::types::{IndexKey, RecordId};
use bramble_common::Result;
use std::sync::Arc;

/// Forward cursor over a B+ tree's entries in key order.
///
/// The cursor pins exactly the leaf it currently points at; advancing past
/// a leaf's last slot follows the sibling pointer, unpinning the old leaf
/// and pinning the next. The iterator is exhausted once the chain ends at
/// `PageId::INVALID`. Items are `Result`-wrapped because advancing may
/// fault pages in through the buffer pool.
pub struct TreeIter {
    bpm: Arc<BufferPoolManager>,
    /// Current leaf, held pinned while valid.
    leaf: PageId,
    /// Next slot to yield within the current leaf.
    slot: usize,
}

impl TreeIter {
    /// Builds a cursor over a leaf the caller has already pinned once;
    /// that pin is transferred to the iterator.
    pub(crate) fn new(bpm: Arc<BufferPoolManager>, leaf: PageId, slot: usize) -> Self {
        Self { bpm, leaf, slot }
    }

    /// Builds an already-exhausted cursor.
    pub(crate) fn exhausted(bpm: Arc<BufferPoolManager>) -> Self {
        Self {
            bpm,
            leaf: PageId::INVALID,
            slot: 0,
        }
    }

    fn release(&mut self) {
        if self.leaf.is_valid() {
            self.bpm.unpin_page(self.leaf, false);
            self.leaf = PageId::INVALID;
        }
    }
}

impl Iterator for TreeIter {
    type Item = Result<(IndexKey, RecordId)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if !self.leaf.is_valid() {
                return None;
            }

            // The current leaf is resident (this iterator pins it); take a
            // second short-lived pin to read it.
            let frame = match self.bpm.fetch_page(self.leaf) {
                Ok(frame) => frame,
                Err(e) => {
                    self.release();
                    return Some(Err(e));
                }
            };
            let (entry, next_leaf) = {
                let data = frame.read_data();
                let leaf = Leaf::new(&data[..]);
                let entry = (self.slot < leaf.size())
                    .then(|| (leaf.key_at(self.slot), leaf.record_at(self.slot)));
                (entry, leaf.next_leaf())
            };
            self.bpm.unpin_page(self.leaf, false);

            match entry {
                Some(entry) => {
                    self.slot += 1;
                    return Some(Ok(entry));
                }
                None => {
                    // Past the last slot: hand the pin over to the forward
                    // sibling.
                    self.bpm.unpin_page(self.leaf, false);
                    self.leaf = next_leaf;
                    self.slot = 0;
                    if self.leaf.is_valid() {
                        if let Err(e) = self.bpm.fetch_page(self.leaf) {
                            self.leaf = PageId::INVALID;
                            return Some(Err(e));
                        }
                    }
                }
            }
        }
    }
}

impl Drop for TreeIter {
    fn drop(&mut self) {
        self.release();
    }
}
