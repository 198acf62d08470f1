//! Clustered B+ tree index on the buffer pool.
//!
//! All node access goes through the buffer pool: every operation pins the
//! pages it touches and unpins them (with a dirty flag when mutated)
//! before returning. Structural changes keep the search-tree, sibling-
//! chain, and parent-link invariants at operation boundaries; nodes may
//! exceed their fanout only transiently inside a mutation.
//!
//! The tree is coarsely thread-safe: one tree-wide mutex (which also
//! holds the cached root id) serializes operations. Iterators run outside
//! that latch and rely on buffer-pool pins only.
//!
//! Splits and underflow repairs pin up to four pages at once, so the
//! backing pool needs a handful of frames beyond any live iterators.

use crate::btree::iter::TreeIter;
use crate::btree::node::{self, Internal, InternalMut, Leaf, LeafMut, NODE_CAPACITY};
use crate::header::{Header, HeaderMut};
use bramble_buffer::{BufferFrame, BufferPoolManager};
use bramble_common::page::PageId;
use bramble_common::types::{IndexKey, KeyComparator, RecordId};
use bramble_common::{BrambleError, Result};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

/// Clustered B+ tree with unique keys.
pub struct BPlusTree<C: KeyComparator> {
    name: String,
    bpm: Arc<BufferPoolManager>,
    comparator: C,
    leaf_max_size: u16,
    internal_max_size: u16,
    /// Cached root page id; doubles as the tree-wide latch.
    root: Mutex<PageId>,
}

impl<C: KeyComparator> BPlusTree<C> {
    /// Opens (or registers) the index named `name`.
    ///
    /// The root page id is looked up on the header page, so a tree that
    /// was populated in an earlier session resumes where it left off.
    pub fn new(
        name: impl Into<String>,
        bpm: Arc<BufferPoolManager>,
        comparator: C,
        leaf_max_size: u16,
        internal_max_size: u16,
    ) -> Result<Self> {
        assert!(leaf_max_size >= 2, "leaf_max_size must be at least 2");
        assert!(internal_max_size >= 3, "internal_max_size must be at least 3");
        assert!(
            (leaf_max_size as usize) < NODE_CAPACITY
                && (internal_max_size as usize) < NODE_CAPACITY,
            "fanout exceeds page capacity"
        );

        let name = name.into();
        let frame = bpm.fetch_page(PageId::HEADER)?;
        let root = {
            let data = frame.read_data();
            Header::new(&data[..])
                .get_root(&name)
                .unwrap_or(PageId::INVALID)
        };
        bpm.unpin_page(PageId::HEADER, false);

        Ok(Self {
            name,
            bpm,
            comparator,
            leaf_max_size,
            internal_max_size,
            root: Mutex::new(root),
        })
    }

    /// Returns the index name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if the tree holds no keys.
    pub fn is_empty(&self) -> bool {
        !self.root.lock().is_valid()
    }

    /// Returns the current root page id (`PageId::INVALID` when empty).
    pub fn root_page_id(&self) -> PageId {
        *self.root.lock()
    }

    // =========================================================================
    // Search
    // =========================================================================

    /// Point lookup. Returns the record stored under `key`, if any.
    pub fn get(&self, key: &IndexKey) -> Result<Option<RecordId>> {
        let root = self.root.lock();
        if !root.is_valid() {
            return Ok(None);
        }

        let (leaf_pid, frame) = self.find_leaf(*root, key)?;
        let result = {
            let data = frame.read_data();
            let leaf = Leaf::new(&data[..]);
            let (slot, exact) = self.leaf_lower_bound(&leaf, key);
            if exact {
                Some(leaf.record_at(slot))
            } else {
                None
            }
        };
        self.bpm.unpin_page(leaf_pid, false);
        Ok(result)
    }

    /// Descends from `root` to the leaf covering `key`.
    ///
    /// Internal pages are unpinned as the descent moves past them; the
    /// returned leaf is still pinned and the caller must unpin it.
    fn find_leaf(&self, root: PageId, key: &IndexKey) -> Result<(PageId, &BufferFrame)> {
        let mut pid = root;
        let mut frame = self.bpm.fetch_page(pid)?;
        loop {
            let child = {
                let data = frame.read_data();
                if node::is_leaf(&data[..]) {
                    None
                } else {
                    let internal = Internal::new(&data[..]);
                    Some(internal.child_at(self.child_index(&internal, key)))
                }
            };
            match child {
                None => return Ok((pid, frame)),
                Some(child) => {
                    self.bpm.unpin_page(pid, false);
                    pid = child;
                    frame = self.bpm.fetch_page(pid)?;
                }
            }
        }
    }

    /// Descends from `root` along slot-0 children to the leftmost leaf,
    /// which is returned pinned.
    fn find_leftmost(&self, root: PageId) -> Result<(PageId, &BufferFrame)> {
        let mut pid = root;
        let mut frame = self.bpm.fetch_page(pid)?;
        loop {
            let child = {
                let data = frame.read_data();
                if node::is_leaf(&data[..]) {
                    None
                } else {
                    Some(Internal::new(&data[..]).child_at(0))
                }
            };
            match child {
                None => return Ok((pid, frame)),
                Some(child) => {
                    self.bpm.unpin_page(pid, false);
                    pid = child;
                    frame = self.bpm.fetch_page(pid)?;
                }
            }
        }
    }

    /// Child slot covering `key`: the last slot whose key compares
    /// less-or-equal (slot 0's key is the sentinel, so slot 0 covers
    /// everything below the first separator).
    fn child_index(&self, internal: &Internal<'_>, key: &IndexKey) -> usize {
        let mut lo = 1;
        let mut hi = internal.size();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.comparator.compare(&internal.key_at(mid), key) {
                Ordering::Greater => hi = mid,
                _ => lo = mid + 1,
            }
        }
        lo - 1
    }

    /// Slot where a separator key belongs among an internal node's
    /// meaningful keys.
    fn separator_slot(&self, internal: &Internal<'_>, key: &IndexKey) -> usize {
        let mut lo = 1;
        let mut hi = internal.size();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.comparator.compare(&internal.key_at(mid), key) {
                Ordering::Greater => hi = mid,
                _ => lo = mid + 1,
            }
        }
        lo
    }

    /// First leaf slot whose key is not less than `key`, plus whether it
    /// is an exact match.
    fn leaf_lower_bound(&self, leaf: &Leaf<'_>, key: &IndexKey) -> (usize, bool) {
        let mut lo = 0;
        let mut hi = leaf.size();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.comparator.compare(&leaf.key_at(mid), key) {
                Ordering::Less => lo = mid + 1,
                _ => hi = mid,
            }
        }
        let exact =
            lo < leaf.size() && self.comparator.compare(&leaf.key_at(lo), key) == Ordering::Equal;
        (lo, exact)
    }

    // =========================================================================
    // Insertion
    // =========================================================================

    /// Inserts a key-value pair.
    ///
    /// Keys are unique; inserting an existing key overwrites its record in
    /// place (upsert). An empty tree bootstraps a leaf root and records it
    /// on the header page. A leaf that grows past its fanout is split and
    /// the separator propagates upward, splitting internal nodes (and
    /// ultimately growing a new root) as needed.
    pub fn insert(&self, key: IndexKey, record: RecordId) -> Result<()> {
        let mut root = self.root.lock();

        if !root.is_valid() {
            let (pid, frame) = self.bpm.new_page()?;
            {
                let mut data = frame.write_data();
                let mut leaf = LeafMut::init(&mut data[..], self.leaf_max_size, PageId::INVALID);
                leaf.insert_at(0, key, record);
            }
            self.bpm.unpin_page(pid, true);
            *root = pid;
            self.put_root(pid)?;
            debug!(index = %self.name, root = %pid, "started new tree");
            return Ok(());
        }

        let (leaf_pid, frame) = self.find_leaf(*root, &key)?;
        let overflow = {
            let mut data = frame.write_data();
            let (slot, exact) = {
                let leaf = Leaf::new(&data[..]);
                self.leaf_lower_bound(&leaf, &key)
            };
            let mut leaf = LeafMut::new(&mut data[..]);
            if exact {
                leaf.set_record_at(slot, record);
                false
            } else {
                leaf.insert_at(slot, key, record);
                leaf.size() > leaf.max_size()
            }
        };
        if !overflow {
            self.bpm.unpin_page(leaf_pid, true);
            return Ok(());
        }

        let mut pid = self.split_leaf(&mut root, leaf_pid, frame)?;
        while pid.is_valid() {
            let frame = self.bpm.fetch_page(pid)?;
            let overflow = {
                let data = frame.read_data();
                !node::is_leaf(&data[..]) && {
                    let internal = Internal::new(&data[..]);
                    internal.size() > internal.max_size()
                }
            };
            self.bpm.unpin_page(pid, false);
            if !overflow {
                break;
            }
            pid = self.split_internal(&mut root, pid)?;
        }
        Ok(())
    }

    /// Splits an overflowing leaf, consuming the caller's pin on it.
    ///
    /// The upper half `[n/2, n)` moves to a fresh sibling, which is
    /// spliced into the leaf chain; the sibling's first key becomes the
    /// separator inserted into the parent (a new root if the leaf was the
    /// root). Returns the parent's page id for the caller's overflow walk.
    fn split_leaf(
        &self,
        root: &mut PageId,
        leaf_pid: PageId,
        leaf_frame: &BufferFrame,
    ) -> Result<PageId> {
        let (sibling_pid, sibling_frame) = match self.bpm.new_page() {
            Ok(v) => v,
            Err(e) => {
                self.bpm.unpin_page(leaf_pid, true);
                return Err(e);
            }
        };

        let (separator, old_parent) = {
            let mut ldata = leaf_frame.write_data();
            let mut sdata = sibling_frame.write_data();
            let mut leaf = LeafMut::new(&mut ldata[..]);
            let parent = leaf.parent();
            let mut sibling = LeafMut::init(&mut sdata[..], self.leaf_max_size, parent);

            let n = leaf.size();
            let split = n / 2;
            for i in split..n {
                sibling.set_entry(i - split, leaf.key_at(i), leaf.record_at(i));
            }
            sibling.set_size(n - split);
            leaf.set_size(split);

            sibling.set_next_leaf(leaf.next_leaf());
            leaf.set_next_leaf(sibling_pid);

            (sibling.key_at(0), parent)
        };

        let parent_pid = if leaf_pid == *root {
            let new_root_pid =
                self.grow_root(root, leaf_pid, separator, sibling_pid, &[leaf_frame, sibling_frame])?;
            debug!(index = %self.name, root = %new_root_pid, "leaf root split");
            new_root_pid
        } else {
            let parent_frame =
                self.fetch_or_unpin(old_parent, &[(leaf_pid, true), (sibling_pid, true)])?;
            {
                let mut pdata = parent_frame.write_data();
                let slot = {
                    let parent = Internal::new(&pdata[..]);
                    self.separator_slot(&parent, &separator)
                };
                let mut parent = InternalMut::new(&mut pdata[..]);
                parent.insert_at(slot, separator, sibling_pid);
            }
            self.bpm.unpin_page(old_parent, true);
            old_parent
        };

        self.bpm.unpin_page(sibling_pid, true);
        self.bpm.unpin_page(leaf_pid, true);
        Ok(parent_pid)
    }

    /// Splits an overflowing internal node.
    ///
    /// The upper half `[n/2, n)` moves to a fresh sibling; the first moved
    /// key is promoted as the separator and the sibling's slot-0 key is
    /// zeroed to take over the sentinel role. Children that moved are
    /// reparented. Returns the parent's page id.
    fn split_internal(&self, root: &mut PageId, pid: PageId) -> Result<PageId> {
        let frame = self.bpm.fetch_page(pid)?;
        let (sibling_pid, sibling_frame) = match self.bpm.new_page() {
            Ok(v) => v,
            Err(e) => {
                self.bpm.unpin_page(pid, false);
                return Err(e);
            }
        };

        let (promoted, old_parent, moved_children) = {
            let mut ndata = frame.write_data();
            let mut sdata = sibling_frame.write_data();
            let mut internal = InternalMut::new(&mut ndata[..]);
            let parent = internal.parent();
            let mut sibling = InternalMut::init(&mut sdata[..], self.internal_max_size, parent);

            let n = internal.size();
            let split = n / 2;
            let promoted = internal.key_at(split);
            for i in split..n {
                sibling.set_entry(i - split, internal.key_at(i), internal.child_at(i));
            }
            sibling.set_size(n - split);
            internal.set_size(split);
            sibling.set_key_at(0, IndexKey::default());

            let moved: Vec<PageId> = (0..sibling.size()).map(|i| sibling.child_at(i)).collect();
            (promoted, parent, moved)
        };

        if let Err(e) = self.reparent(&moved_children, sibling_pid) {
            self.bpm.unpin_page(sibling_pid, true);
            self.bpm.unpin_page(pid, true);
            return Err(e);
        }

        let parent_pid = if pid == *root {
            let new_root_pid =
                self.grow_root(root, pid, promoted, sibling_pid, &[frame, sibling_frame])?;
            debug!(index = %self.name, root = %new_root_pid, "internal root split");
            new_root_pid
        } else {
            let parent_frame =
                self.fetch_or_unpin(old_parent, &[(pid, true), (sibling_pid, true)])?;
            {
                let mut pdata = parent_frame.write_data();
                let slot = {
                    let parent = Internal::new(&pdata[..]);
                    self.separator_slot(&parent, &promoted)
                };
                let mut parent = InternalMut::new(&mut pdata[..]);
                parent.insert_at(slot, promoted, sibling_pid);
            }
            self.bpm.unpin_page(old_parent, true);
            old_parent
        };

        self.bpm.unpin_page(sibling_pid, true);
        self.bpm.unpin_page(pid, true);
        Ok(parent_pid)
    }

    /// Allocates a fresh internal root over a split pair and persists the
    /// root change. Both halves (still pinned by the caller) get their
    /// parent pointers updated.
    fn grow_root(
        &self,
        root: &mut PageId,
        left_pid: PageId,
        separator: IndexKey,
        right_pid: PageId,
        halves: &[&BufferFrame; 2],
    ) -> Result<PageId> {
        let (new_root_pid, root_frame) = match self.bpm.new_page() {
            Ok(v) => v,
            Err(e) => {
                self.bpm.unpin_page(right_pid, true);
                self.bpm.unpin_page(left_pid, true);
                return Err(e);
            }
        };
        {
            let mut rdata = root_frame.write_data();
            let mut new_root =
                InternalMut::init(&mut rdata[..], self.internal_max_size, PageId::INVALID);
            new_root.insert_at(0, IndexKey::default(), left_pid);
            new_root.insert_at(1, separator, right_pid);
        }
        self.bpm.unpin_page(new_root_pid, true);

        for frame in halves {
            let mut data = frame.write_data();
            if node::is_leaf(&data[..]) {
                LeafMut::new(&mut data[..]).set_parent(new_root_pid);
            } else {
                InternalMut::new(&mut data[..]).set_parent(new_root_pid);
            }
        }

        *root = new_root_pid;
        if let Err(e) = self.put_root(new_root_pid) {
            self.bpm.unpin_page(right_pid, true);
            self.bpm.unpin_page(left_pid, true);
            return Err(e);
        }
        Ok(new_root_pid)
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    /// Removes a key. Absent keys and an empty tree are silent no-ops.
    ///
    /// A root leaf that empties is deleted and the tree becomes empty.
    /// Any other leaf falling below its occupancy floor is repaired by
    /// redistribution or coalescing, walking up while ancestors underflow
    /// in turn; a root left with a single child is collapsed.
    pub fn remove(&self, key: &IndexKey) -> Result<()> {
        let mut root = self.root.lock();
        if !root.is_valid() {
            return Ok(());
        }

        let (leaf_pid, frame) = self.find_leaf(*root, key)?;
        let new_size = {
            let mut data = frame.write_data();
            let (slot, exact) = {
                let leaf = Leaf::new(&data[..]);
                self.leaf_lower_bound(&leaf, key)
            };
            if exact {
                let mut leaf = LeafMut::new(&mut data[..]);
                leaf.remove_at(slot);
                Some(leaf.size())
            } else {
                None
            }
        };
        let Some(new_size) = new_size else {
            self.bpm.unpin_page(leaf_pid, false);
            return Ok(());
        };

        if leaf_pid == *root {
            self.bpm.unpin_page(leaf_pid, true);
            if new_size == 0 {
                self.bpm.delete_page(leaf_pid);
                *root = PageId::INVALID;
                self.put_root(PageId::INVALID)?;
                debug!(index = %self.name, "tree emptied");
            }
            return Ok(());
        }

        self.bpm.unpin_page(leaf_pid, true);
        if new_size >= (self.leaf_max_size as usize).div_ceil(2) {
            return Ok(());
        }

        let mut pid = leaf_pid;
        loop {
            let Some(parent_pid) = self.fix_underflow(&mut root, pid)? else {
                break;
            };
            if parent_pid == *root {
                break;
            }
            let parent_frame = self.bpm.fetch_page(parent_pid)?;
            let underflows = {
                let data = parent_frame.read_data();
                let internal = Internal::new(&data[..]);
                internal.size() < internal.min_size()
            };
            self.bpm.unpin_page(parent_pid, false);
            if !underflows {
                break;
            }
            pid = parent_pid;
        }
        Ok(())
    }

    /// Repairs one underflowing non-root node.
    ///
    /// Redistribution is tried against any feasible sibling (left first,
    /// then right); otherwise the node coalesces with a neighbor (into the
    /// left one when it exists, else absorbing the right one) and the
    /// parent loses the separator. A root internal reduced to a single
    /// child is deleted and the child promoted.
    ///
    /// Returns the parent's page id when the parent lost an entry, or
    /// `None` when no further repair can be needed above.
    fn fix_underflow(&self, root: &mut PageId, pid: PageId) -> Result<Option<PageId>> {
        let frame = self.bpm.fetch_page(pid)?;
        let parent_pid = {
            let data = frame.read_data();
            if node::is_leaf(&data[..]) {
                Leaf::new(&data[..]).parent()
            } else {
                Internal::new(&data[..]).parent()
            }
        };
        let parent_frame = self.fetch_or_unpin(parent_pid, &[(pid, false)])?;

        let located = {
            let pdata = parent_frame.read_data();
            let parent = Internal::new(&pdata[..]);
            parent.index_of_child(pid).map(|idx| {
                let left = (idx > 0).then(|| parent.child_at(idx - 1));
                let right = (idx + 1 < parent.size()).then(|| parent.child_at(idx + 1));
                (idx, left, right)
            })
        };
        let Some((idx, left_pid, right_pid)) = located else {
            self.bpm.unpin_page(parent_pid, false);
            self.bpm.unpin_page(pid, false);
            return Err(BrambleError::TreeCorrupted(format!(
                "{pid} is not a child of its parent {parent_pid}"
            )));
        };

        // Redistribute from the left sibling if it can donate.
        if let Some(left_pid) = left_pid {
            let left_frame =
                self.fetch_or_unpin(left_pid, &[(parent_pid, false), (pid, false)])?;
            let can_donate = {
                let ldata = left_frame.read_data();
                if node::is_leaf(&ldata[..]) {
                    let left = Leaf::new(&ldata[..]);
                    left.size() > left.min_size()
                } else {
                    let left = Internal::new(&ldata[..]);
                    left.size() > left.min_size()
                }
            };
            if can_donate {
                let moved = self.borrow_from_left(frame, parent_frame, left_frame, idx);
                self.bpm.unpin_page(left_pid, true);
                self.bpm.unpin_page(parent_pid, true);
                self.bpm.unpin_page(pid, true);
                if let Some(child) = moved {
                    self.reparent(&[child], pid)?;
                }
                return Ok(None);
            }
            self.bpm.unpin_page(left_pid, false);
        }

        // Then the right sibling.
        if let Some(right_pid) = right_pid {
            let right_frame =
                self.fetch_or_unpin(right_pid, &[(parent_pid, false), (pid, false)])?;
            let can_donate = {
                let rdata = right_frame.read_data();
                if node::is_leaf(&rdata[..]) {
                    let right = Leaf::new(&rdata[..]);
                    right.size() > right.min_size()
                } else {
                    let right = Internal::new(&rdata[..]);
                    right.size() > right.min_size()
                }
            };
            if can_donate {
                let moved = self.borrow_from_right(frame, parent_frame, right_frame, idx + 1);
                self.bpm.unpin_page(right_pid, true);
                self.bpm.unpin_page(parent_pid, true);
                self.bpm.unpin_page(pid, true);
                if let Some(child) = moved {
                    self.reparent(&[child], pid)?;
                }
                return Ok(None);
            }
            self.bpm.unpin_page(right_pid, false);
        }

        // No donor: coalesce. The merged-away page is deleted and the
        // parent loses the separator between the pair.
        if let Some(left_pid) = left_pid {
            let left_frame =
                self.fetch_or_unpin(left_pid, &[(parent_pid, false), (pid, false)])?;
            let absorbed = self.merge_nodes(left_frame, frame, parent_frame, idx);
            self.bpm.unpin_page(left_pid, true);
            self.bpm.unpin_page(pid, false);
            self.bpm.delete_page(pid);
            if let Err(e) = self.reparent(&absorbed, left_pid) {
                self.bpm.unpin_page(parent_pid, true);
                return Err(e);
            }
        } else {
            let right_pid = right_pid.expect("non-root node has a sibling");
            let right_frame =
                self.fetch_or_unpin(right_pid, &[(parent_pid, false), (pid, false)])?;
            let absorbed = self.merge_nodes(frame, right_frame, parent_frame, idx + 1);
            self.bpm.unpin_page(pid, true);
            self.bpm.unpin_page(right_pid, false);
            self.bpm.delete_page(right_pid);
            if let Err(e) = self.reparent(&absorbed, pid) {
                self.bpm.unpin_page(parent_pid, true);
                return Err(e);
            }
        }

        // The parent may now be a root with a single child: collapse it.
        let shrink_to = {
            let pdata = parent_frame.read_data();
            let parent = Internal::new(&pdata[..]);
            (parent_pid == *root && parent.size() == 1).then(|| parent.child_at(0))
        };
        if let Some(child) = shrink_to {
            self.bpm.unpin_page(parent_pid, false);
            self.bpm.delete_page(parent_pid);

            let child_frame = self.bpm.fetch_page(child)?;
            {
                let mut cdata = child_frame.write_data();
                if node::is_leaf(&cdata[..]) {
                    LeafMut::new(&mut cdata[..]).set_parent(PageId::INVALID);
                } else {
                    InternalMut::new(&mut cdata[..]).set_parent(PageId::INVALID);
                }
            }
            self.bpm.unpin_page(child, true);

            *root = child;
            self.put_root(child)?;
            debug!(index = %self.name, root = %child, "root collapsed");
            return Ok(None);
        }

        self.bpm.unpin_page(parent_pid, true);
        Ok(Some(parent_pid))
    }

    /// Moves the left sibling's last entry into the underflowing node.
    ///
    /// Leaves update the separator at `sep_idx` to the receiver's new
    /// first key; internals rotate through it (separator down, donor edge
    /// key up). Returns a child page that changed parents, if any.
    fn borrow_from_left(
        &self,
        node_frame: &BufferFrame,
        parent_frame: &BufferFrame,
        left_frame: &BufferFrame,
        sep_idx: usize,
    ) -> Option<PageId> {
        let mut ndata = node_frame.write_data();
        let mut pdata = parent_frame.write_data();
        let mut ldata = left_frame.write_data();
        let mut parent = InternalMut::new(&mut pdata[..]);

        if node::is_leaf(&ndata[..]) {
            let mut node = LeafMut::new(&mut ndata[..]);
            let mut left = LeafMut::new(&mut ldata[..]);
            let last = left.size() - 1;
            let (key, record) = (left.key_at(last), left.record_at(last));
            left.remove_at(last);
            node.insert_at(0, key, record);
            parent.set_key_at(sep_idx, key);
            None
        } else {
            let mut node = InternalMut::new(&mut ndata[..]);
            let mut left = InternalMut::new(&mut ldata[..]);
            let last = left.size() - 1;
            let (key, child) = (left.key_at(last), left.child_at(last));
            left.remove_at(last);

            // Rotate: the parent separator comes down as the old slot-0
            // child's key, the donor's edge key goes up.
            let separator = parent.key_at(sep_idx);
            node.insert_at(0, IndexKey::default(), child);
            node.set_key_at(1, separator);
            parent.set_key_at(sep_idx, key);
            Some(child)
        }
    }

    /// Moves the right sibling's first entry into the underflowing node.
    fn borrow_from_right(
        &self,
        node_frame: &BufferFrame,
        parent_frame: &BufferFrame,
        right_frame: &BufferFrame,
        sep_idx: usize,
    ) -> Option<PageId> {
        let mut ndata = node_frame.write_data();
        let mut pdata = parent_frame.write_data();
        let mut rdata = right_frame.write_data();
        let mut parent = InternalMut::new(&mut pdata[..]);

        if node::is_leaf(&ndata[..]) {
            let mut node = LeafMut::new(&mut ndata[..]);
            let mut right = LeafMut::new(&mut rdata[..]);
            let (key, record) = (right.key_at(0), right.record_at(0));
            right.remove_at(0);
            let size = node.size();
            node.insert_at(size, key, record);
            parent.set_key_at(sep_idx, right.key_at(0));
            None
        } else {
            let mut node = InternalMut::new(&mut ndata[..]);
            let mut right = InternalMut::new(&mut rdata[..]);
            let child = right.child_at(0);
            let up_key = right.key_at(1);

            let separator = parent.key_at(sep_idx);
            let size = node.size();
            node.insert_at(size, separator, child);
            right.remove_at(0);
            right.set_key_at(0, IndexKey::default());
            parent.set_key_at(sep_idx, up_key);
            Some(child)
        }
    }

    /// Merges the right node of a sibling pair into the left one and
    /// removes the separator at `sep_idx` from the parent.
    ///
    /// Leaves splice the chain past the absorbed node; internals pull the
    /// separator down as the key over the absorbed node's slot-0 child.
    /// Returns the children the caller must reparent onto the left node.
    fn merge_nodes(
        &self,
        left_frame: &BufferFrame,
        right_frame: &BufferFrame,
        parent_frame: &BufferFrame,
        sep_idx: usize,
    ) -> Vec<PageId> {
        let mut ldata = left_frame.write_data();
        let rdata = right_frame.read_data();
        let mut pdata = parent_frame.write_data();
        let mut parent = InternalMut::new(&mut pdata[..]);

        let absorbed = if node::is_leaf(&ldata[..]) {
            let mut left = LeafMut::new(&mut ldata[..]);
            let right = Leaf::new(&rdata[..]);
            let base = left.size();
            for i in 0..right.size() {
                left.set_entry(base + i, right.key_at(i), right.record_at(i));
            }
            left.set_size(base + right.size());
            left.set_next_leaf(right.next_leaf());
            Vec::new()
        } else {
            let mut left = InternalMut::new(&mut ldata[..]);
            let right = Internal::new(&rdata[..]);
            let base = left.size();
            // The separator comes down as the key over the absorbed
            // node's left-of-everything child.
            left.set_entry(base, parent.key_at(sep_idx), right.child_at(0));
            for i in 1..right.size() {
                left.set_entry(base + i, right.key_at(i), right.child_at(i));
            }
            left.set_size(base + right.size());
            (0..right.size()).map(|i| right.child_at(i)).collect()
        };

        parent.remove_at(sep_idx);
        absorbed
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Forward cursor over the whole tree in key order.
    pub fn iter(&self) -> Result<TreeIter> {
        let root = self.root.lock();
        if !root.is_valid() {
            return Ok(TreeIter::exhausted(self.bpm.clone()));
        }
        let (pid, _frame) = self.find_leftmost(*root)?;
        Ok(TreeIter::new(self.bpm.clone(), pid, 0))
    }

    /// Forward cursor positioned at `key`, or at the insertion point if
    /// the key is absent.
    pub fn iter_from(&self, key: &IndexKey) -> Result<TreeIter> {
        let root = self.root.lock();
        if !root.is_valid() {
            return Ok(TreeIter::exhausted(self.bpm.clone()));
        }
        let (pid, frame) = self.find_leaf(*root, key)?;
        let slot = {
            let data = frame.read_data();
            self.leaf_lower_bound(&Leaf::new(&data[..]), key).0
        };
        Ok(TreeIter::new(self.bpm.clone(), pid, slot))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Records the root page id on the header page.
    fn put_root(&self, root: PageId) -> Result<()> {
        let frame = self.bpm.fetch_page(PageId::HEADER)?;
        let result = {
            let mut data = frame.write_data();
            HeaderMut::new(&mut data[..]).put_root(&self.name, root)
        };
        self.bpm.unpin_page(PageId::HEADER, true);
        result
    }

    /// Rewrites the parent pointer of each listed child.
    fn reparent(&self, children: &[PageId], new_parent: PageId) -> Result<()> {
        for &child in children {
            let frame = self.bpm.fetch_page(child)?;
            {
                let mut data = frame.write_data();
                if node::is_leaf(&data[..]) {
                    LeafMut::new(&mut data[..]).set_parent(new_parent);
                } else {
                    InternalMut::new(&mut data[..]).set_parent(new_parent);
                }
            }
            self.bpm.unpin_page(child, true);
        }
        Ok(())
    }

    /// Fetches a page, releasing the listed held pins on failure.
    fn fetch_or_unpin(
        &self,
        pid: PageId,
        held: &[(PageId, bool)],
    ) -> Result<&BufferFrame> {
        match self.bpm.fetch_page(pid) {
            Ok(frame) => Ok(frame),
            Err(e) => {
                for &(held_pid, dirty) in held {
                    self.bpm.unpin_page(held_pid, dirty);
                }
                Err(e)
            }
        }
    }
}
