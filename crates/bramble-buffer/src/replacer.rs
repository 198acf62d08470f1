//! Page replacement policies for the buffer pool.

use crate::frame::FrameId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Trait for page replacement algorithms.
pub trait Replacer: Send + Sync {
    /// Records that the given frame was accessed.
    fn record_access(&self, frame_id: FrameId);

    /// Toggles whether a frame is a candidate for eviction.
    fn set_evictable(&self, frame_id: FrameId, evictable: bool);

    /// Selects a victim frame for eviction.
    ///
    /// Returns None if no frames are evictable.
    fn evict(&self) -> Option<FrameId>;

    /// Removes an evictable frame from the replacer, along with its access
    /// history, regardless of its backward k-distance.
    fn remove(&self, frame_id: FrameId);

    /// Returns the number of evictable frames.
    fn size(&self) -> usize;
}

/// Per-frame bookkeeping.
struct FrameEntry {
    access_count: usize,
    evictable: bool,
}

/// State behind the replacer latch.
///
/// Evictable frames live in one of two pools ordered most-recent at the
/// front: `history` for frames with fewer than k recorded accesses
/// (backward k-distance +inf) and `buffer` for frames with at least k.
struct LruKInner {
    history: VecDeque<FrameId>,
    buffer: VecDeque<FrameId>,
    entries: HashMap<FrameId, FrameEntry>,
}

impl LruKInner {
    fn unlink(&mut self, frame_id: FrameId, access_count: usize, k: usize) {
        let pool = if access_count >= k {
            &mut self.buffer
        } else {
            &mut self.history
        };
        pool.retain(|&f| f != frame_id);
    }

    fn evict(&mut self) -> Option<FrameId> {
        if self.history.is_empty() && self.buffer.is_empty() {
            return None;
        }
        // History frames have +inf backward k-distance; the tail is the
        // one that became evictable earliest.
        let victim = if let Some(f) = self.history.pop_back() {
            f
        } else {
            self.buffer.pop_back()?
        };
        self.entries.remove(&victim);
        Some(victim)
    }
}

/// LRU-K replacement policy.
///
/// Evicts the frame whose backward k-distance (time between now and its
/// k-th most recent access) is maximum; frames with fewer than k accesses
/// have infinite k-distance and among those the earliest is chosen. All
/// public operations hold a single mutex.
pub struct LruKReplacer {
    num_frames: usize,
    k: usize,
    inner: Mutex<LruKInner>,
}

impl LruKReplacer {
    /// Creates a replacer for `num_frames` frames with parameter `k`.
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k > 0, "k must be > 0");
        Self {
            num_frames,
            k,
            inner: Mutex::new(LruKInner {
                history: VecDeque::new(),
                buffer: VecDeque::new(),
                entries: HashMap::new(),
            }),
        }
    }

    /// Returns the replacer capacity.
    pub fn capacity(&self) -> usize {
        self.num_frames
    }

    fn check_frame(&self, frame_id: FrameId) {
        assert!(
            (frame_id.0 as usize) < self.num_frames,
            "frame id {} out of range (capacity {})",
            frame_id,
            self.num_frames
        );
    }
}

impl Replacer for LruKReplacer {
    fn record_access(&self, frame_id: FrameId) {
        self.check_frame(frame_id);
        let mut inner = self.inner.lock();

        let entry = inner.entries.entry(frame_id).or_insert(FrameEntry {
            access_count: 0,
            evictable: false,
        });
        entry.access_count += 1;
        let count = entry.access_count;
        let evictable = entry.evictable;

        // Crossing k promotes an evictable frame from the history pool;
        // later accesses refresh its position in the buffer pool.
        if evictable && count >= self.k {
            if count == self.k {
                inner.history.retain(|&f| f != frame_id);
            } else {
                inner.buffer.retain(|&f| f != frame_id);
            }
            inner.buffer.push_front(frame_id);
        }
    }

    fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        self.check_frame(frame_id);
        let mut inner = self.inner.lock();

        let Some(entry) = inner.entries.get_mut(&frame_id) else {
            return;
        };
        if entry.evictable == evictable {
            return;
        }

        if evictable {
            // Make room before admitting another evictable frame.
            while inner.history.len() + inner.buffer.len() >= self.num_frames {
                if inner.evict().is_none() {
                    break;
                }
            }
            let entry = inner
                .entries
                .entry(frame_id)
                .or_insert(FrameEntry {
                    access_count: 0,
                    evictable: false,
                });
            entry.evictable = true;
            let count = entry.access_count;
            if count >= self.k {
                inner.buffer.push_front(frame_id);
            } else {
                inner.history.push_front(frame_id);
            }
        } else {
            entry.evictable = false;
            let count = entry.access_count;
            inner.unlink(frame_id, count, self.k);
        }
    }

    fn evict(&self) -> Option<FrameId> {
        self.inner.lock().evict()
    }

    fn remove(&self, frame_id: FrameId) {
        self.check_frame(frame_id);
        let mut inner = self.inner.lock();

        let Some(entry) = inner.entries.get(&frame_id) else {
            return;
        };
        assert!(
            entry.evictable,
            "cannot remove non-evictable frame {}",
            frame_id
        );
        let count = entry.access_count;
        inner.unlink(frame_id, count, self.k);
        inner.entries.remove(&frame_id);
    }

    fn size(&self) -> usize {
        let inner = self.inner.lock();
        inner.history.len() + inner.buffer.len()
    }
}
