//! Extendible hash table used as the buffer pool's page table.

use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// A bucket of the extendible hash directory.
///
/// Holds up to `bucket_size` entries and its own local depth, which never
/// exceeds the directory's global depth.
#[derive(Debug)]
struct Bucket<K, V> {
    items: Vec<(K, V)>,
    local_depth: u32,
}

impl<K, V> Bucket<K, V> {
    fn new(local_depth: u32) -> Self {
        Self {
            items: Vec::new(),
            local_depth,
        }
    }
}

/// Mutable state behind the table latch.
///
/// Buckets live in an arena; the directory holds arena indices, so the
/// aliasing of directory slots onto shared buckets is plain index
/// duplication. `dir.len()` is always `2^global_depth`.
#[derive(Debug)]
struct Directory<K, V> {
    global_depth: u32,
    buckets: Vec<Bucket<K, V>>,
    dir: Vec<usize>,
}

/// Concurrent mapping with value semantics, backed by an extendible hash
/// directory with bucket splitting and directory doubling.
///
/// All public operations acquire a single coarse latch.
pub struct ExtendibleHashTable<K, V> {
    bucket_size: usize,
    inner: Mutex<Directory<K, V>>,
}

impl<K, V> ExtendibleHashTable<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Creates a table whose buckets hold up to `bucket_size` entries.
    pub fn new(bucket_size: usize) -> Self {
        assert!(bucket_size > 0, "bucket_size must be > 0");
        Self {
            bucket_size,
            inner: Mutex::new(Directory {
                global_depth: 0,
                buckets: vec![Bucket::new(0)],
                dir: vec![0],
            }),
        }
    }

    fn hash(key: &K) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// Directory slot for a key at the given global depth.
    fn dir_index(hash: u64, global_depth: u32) -> usize {
        (hash & ((1u64 << global_depth) - 1)) as usize
    }

    /// Looks up the value for a key.
    pub fn get(&self, key: &K) -> Option<V> {
        let inner = self.inner.lock();
        let idx = Self::dir_index(Self::hash(key), inner.global_depth);
        let bucket = &inner.buckets[inner.dir[idx]];
        bucket
            .items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Returns true if the key is present.
    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Inserts a key-value pair, overwriting the value on a duplicate key.
    ///
    /// A full bucket is split: when its local depth equals the global
    /// depth the directory doubles first, then one sibling bucket is
    /// allocated at the incremented depth, directory slots are re-pointed
    /// by the new high bit, and the old bucket's entries are rehashed into
    /// the pair. The insert is then retried and may split again.
    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock();
        let hash = Self::hash(&key);

        loop {
            let idx = Self::dir_index(hash, inner.global_depth);
            let bucket_idx = inner.dir[idx];

            let bucket = &mut inner.buckets[bucket_idx];
            if let Some(slot) = bucket.items.iter_mut().find(|(k, _)| *k == key) {
                slot.1 = value;
                return;
            }
            if bucket.items.len() < self.bucket_size {
                bucket.items.push((key, value));
                return;
            }

            // Bucket full: split it, then retry.
            if inner.buckets[bucket_idx].local_depth == inner.global_depth {
                // Double the directory: new dir[i] = dir[i mod old_size].
                let old_size = inner.dir.len();
                for i in 0..old_size {
                    let target = inner.dir[i];
                    inner.dir.push(target);
                }
                inner.global_depth += 1;
            }

            inner.buckets[bucket_idx].local_depth += 1;
            let new_depth = inner.buckets[bucket_idx].local_depth;
            let sibling_idx = inner.buckets.len();
            inner.buckets.push(Bucket::new(new_depth));

            // Slots referencing the old bucket whose new high bit is set
            // move to the sibling.
            for i in 0..inner.dir.len() {
                if inner.dir[i] == bucket_idx && (i >> (new_depth - 1)) & 1 == 1 {
                    inner.dir[i] = sibling_idx;
                }
            }

            // Rehash the old bucket's entries into the pair.
            let items = std::mem::take(&mut inner.buckets[bucket_idx].items);
            for (k, v) in items {
                let slot = Self::dir_index(Self::hash(&k), inner.global_depth);
                let target = inner.dir[slot];
                inner.buckets[target].items.push((k, v));
            }
        }
    }

    /// Removes a key. Returns true if it was present.
    pub fn remove(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        let idx = Self::dir_index(Self::hash(key), inner.global_depth);
        let bucket_idx = inner.dir[idx];
        let bucket = &mut inner.buckets[bucket_idx];
        if let Some(pos) = bucket.items.iter().position(|(k, _)| k == key) {
            bucket.items.swap_remove(pos);
            true
        } else {
            false
        }
    }

    /// Returns the directory's global depth.
    pub fn global_depth(&self) -> u32 {
        self.inner.lock().global_depth
    }

    /// Returns the local depth of the bucket behind a directory slot.
    pub fn local_depth(&self, dir_index: usize) -> u32 {
        let inner = self.inner.lock();
        inner.buckets[inner.dir[dir_index]].local_depth
    }

    /// Returns the number of distinct buckets.
    pub fn num_buckets(&self) -> usize {
        self.inner.lock().buckets.len()
    }

    /// Returns the total number of entries.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.buckets.iter().map(|b| b.items.len()).sum()
    }

    /// Returns true if the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over all entries, calling the provided function for each.
    /// Returns early if the function returns false.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let inner = self.inner.lock();
        for bucket in &inner.buckets {
            for (k, v) in &bucket.items {
                if !f(k, v) {
                    return;
                }
            }
        }
    }
}
