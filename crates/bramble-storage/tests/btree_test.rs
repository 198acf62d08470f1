//! End-to-end B+ tree tests driving the full stack: disk manager, buffer
//! pool, header page, and tree operations.
//!
//! `check_integrity` walks the tree after mutations and asserts the
//! structural invariants: balanced leaf depth, sorted unique keys, sound
//! occupancy, parent links, and a coherent leaf chain. Every scenario also
//! asserts pin balance (no frame stays pinned once an operation returns).

use bramble_buffer::{BufferPoolConfig, BufferPoolManager};
use bramble_common::page::PageId;
use bramble_common::types::{IndexKey, IntegerComparator, RecordId};
use bramble_storage::btree::{Internal, Leaf};
use bramble_storage::{BPlusTree, DiskManager, DiskManagerConfig};
use rand::seq::SliceRandom;
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

fn key(n: i64) -> IndexKey {
    IndexKey::from_integer(n)
}

fn rid(n: i64) -> RecordId {
    RecordId::new(PageId(n as u32), n as u16)
}

fn create_bpm(dir: &TempDir, pool_size: usize) -> Arc<BufferPoolManager> {
    let dm = DiskManager::new(DiskManagerConfig {
        data_path: dir.path().join("bramble.db"),
        fsync_enabled: false,
    })
    .unwrap();
    Arc::new(BufferPoolManager::new(
        BufferPoolConfig {
            pool_size,
            replacer_k: 2,
            bucket_size: 4,
        },
        Arc::new(dm),
    ))
}

fn create_tree(
    bpm: &Arc<BufferPoolManager>,
    leaf_max: u16,
    internal_max: u16,
) -> BPlusTree<IntegerComparator> {
    BPlusTree::new("btree_test", bpm.clone(), IntegerComparator, leaf_max, internal_max).unwrap()
}

/// Collected shape of one subtree walk.
struct Walk {
    keys: Vec<i64>,
    leaf_pids: Vec<PageId>,
    leaf_depths: Vec<usize>,
}

fn walk_subtree(bpm: &BufferPoolManager, pid: PageId, expected_parent: PageId, depth: usize, out: &mut Walk) {
    let is_root = !expected_parent.is_valid();
    let frame = bpm.fetch_page(pid).unwrap();
    let data = frame.read_data();

    if bramble_storage::btree::page_type(&data[..]) == Some(bramble_common::page::PageType::Leaf) {
        let leaf = Leaf::new(&data[..]);
        assert_eq!(leaf.parent(), expected_parent, "bad parent link on {pid}");
        if !is_root {
            assert!(
                leaf.size() >= leaf.min_size() && leaf.size() <= leaf.max_size(),
                "leaf {pid} occupancy {} outside [{}, {}]",
                leaf.size(),
                leaf.min_size(),
                leaf.max_size()
            );
        }
        for i in 0..leaf.size() {
            out.keys.push(leaf.key_at(i).to_integer());
        }
        out.leaf_pids.push(pid);
        out.leaf_depths.push(depth);
        drop(data);
        bpm.unpin_page(pid, false);
    } else {
        let internal = Internal::new(&data[..]);
        assert_eq!(internal.parent(), expected_parent, "bad parent link on {pid}");
        if is_root {
            assert!(internal.size() >= 2, "root internal {pid} has a single child");
        } else {
            assert!(
                internal.size() >= internal.min_size() && internal.size() <= internal.max_size(),
                "internal {pid} occupancy {} outside [{}, {}]",
                internal.size(),
                internal.min_size(),
                internal.max_size()
            );
        }
        // Separator keys (slot 0 is the sentinel) must be strictly sorted.
        for i in 2..internal.size() {
            assert!(
                internal.key_at(i - 1).to_integer() < internal.key_at(i).to_integer(),
                "separators out of order in {pid}"
            );
        }
        let children: Vec<PageId> = (0..internal.size()).map(|i| internal.child_at(i)).collect();
        drop(data);
        bpm.unpin_page(pid, false);

        for child in children {
            walk_subtree(bpm, child, pid, depth + 1, out);
        }
    }
}

/// Asserts every structural invariant of the tree, returning its keys in
/// order.
fn check_integrity(bpm: &BufferPoolManager, tree: &BPlusTree<IntegerComparator>) -> Vec<i64> {
    let root = tree.root_page_id();
    if !root.is_valid() {
        assert!(tree.is_empty());
        assert_eq!(bpm.stats().pinned_frames, 0, "pins leaked");
        return Vec::new();
    }

    let mut walk = Walk {
        keys: Vec::new(),
        leaf_pids: Vec::new(),
        leaf_depths: Vec::new(),
    };
    walk_subtree(bpm, root, PageId::INVALID, 0, &mut walk);

    // Balanced height: every leaf at the same depth.
    let first_depth = walk.leaf_depths[0];
    assert!(
        walk.leaf_depths.iter().all(|&d| d == first_depth),
        "leaves at unequal depths: {:?}",
        walk.leaf_depths
    );

    // Strictly ascending unique keys in-order.
    for pair in walk.keys.windows(2) {
        assert!(pair[0] < pair[1], "keys out of order: {} then {}", pair[0], pair[1]);
    }

    // Leaf chain coherence: following next pointers from the leftmost
    // leaf visits exactly the in-order leaves and ends the chain.
    let mut chain = Vec::new();
    let mut pid = walk.leaf_pids[0];
    while pid.is_valid() {
        chain.push(pid);
        let frame = bpm.fetch_page(pid).unwrap();
        let next = {
            let data = frame.read_data();
            Leaf::new(&data[..]).next_leaf()
        };
        bpm.unpin_page(pid, false);
        pid = next;
    }
    assert_eq!(chain, walk.leaf_pids, "leaf chain disagrees with tree order");

    assert_eq!(bpm.stats().pinned_frames, 0, "pins leaked");
    walk.keys
}

fn collect(tree: &BPlusTree<IntegerComparator>) -> Vec<i64> {
    tree.iter()
        .unwrap()
        .map(|entry| entry.unwrap().0.to_integer())
        .collect()
}

// ============================================================================
// Point operations and first split
// ============================================================================

#[test]
fn test_point_ops_and_first_split() {
    let dir = tempdir().unwrap();
    let bpm = create_bpm(&dir, 16);
    let tree = create_tree(&bpm, 4, 4);

    for i in 1..=5 {
        tree.insert(key(i), rid(i)).unwrap();
        for j in 1..=i {
            assert_eq!(tree.get(&key(j)).unwrap(), Some(rid(j)), "lost key {j} after inserting {i}");
        }
        check_integrity(&bpm, &tree);
    }

    // The fifth insert split the root leaf: depth grew to 2.
    let root = tree.root_page_id();
    let frame = bpm.fetch_page(root).unwrap();
    let (left_pid, right_pid) = {
        let data = frame.read_data();
        let internal = Internal::new(&data[..]);
        assert_eq!(internal.size(), 2);
        (internal.child_at(0), internal.child_at(1))
    };
    bpm.unpin_page(root, false);

    let frame = bpm.fetch_page(left_pid).unwrap();
    let (left_keys, left_next) = {
        let data = frame.read_data();
        let leaf = Leaf::new(&data[..]);
        let keys: Vec<i64> = (0..leaf.size()).map(|i| leaf.key_at(i).to_integer()).collect();
        (keys, leaf.next_leaf())
    };
    bpm.unpin_page(left_pid, false);

    assert_eq!(left_keys, vec![1, 2]);
    assert_eq!(left_next, right_pid);

    let frame = bpm.fetch_page(right_pid).unwrap();
    {
        let data = frame.read_data();
        let leaf = Leaf::new(&data[..]);
        let keys: Vec<i64> = (0..leaf.size()).map(|i| leaf.key_at(i).to_integer()).collect();
        assert_eq!(keys, vec![3, 4, 5]);
        assert_eq!(leaf.next_leaf(), PageId::INVALID);
    }
    bpm.unpin_page(right_pid, false);
    assert_eq!(bpm.stats().pinned_frames, 0);
}

// ============================================================================
// Split cascade
// ============================================================================

#[test]
fn test_split_cascade_sequential_inserts() {
    let dir = tempdir().unwrap();
    let bpm = create_bpm(&dir, 16);
    let tree = create_tree(&bpm, 3, 3);

    let mut roots = vec![tree.root_page_id()];
    for i in 1..=10 {
        tree.insert(key(i), rid(i)).unwrap();
        let root = tree.root_page_id();
        if roots.last() != Some(&root) {
            roots.push(root);
        }
        check_integrity(&bpm, &tree);
    }

    // The root changed at least twice beyond its creation: once when the
    // root leaf split and once when the internal root split.
    assert!(roots.len() >= 4, "expected two root splits, saw roots {roots:?}");

    assert_eq!(collect(&tree), (1..=10).collect::<Vec<i64>>());
    assert_eq!(check_integrity(&bpm, &tree), (1..=10).collect::<Vec<i64>>());
}

// ============================================================================
// Underflow repair
// ============================================================================

#[test]
fn test_remove_repairs_underflow() {
    let dir = tempdir().unwrap();
    let bpm = create_bpm(&dir, 16);
    let tree = create_tree(&bpm, 3, 3);

    for i in 1..=10 {
        tree.insert(key(i), rid(i)).unwrap();
    }

    // Removing the smallest key underflows the leftmost leaf; the repair
    // (merge plus parent redistribution) keeps every invariant.
    tree.remove(&key(1)).unwrap();
    assert_eq!(check_integrity(&bpm, &tree), (2..=10).collect::<Vec<i64>>());
    assert_eq!(tree.get(&key(1)).unwrap(), None);
    assert_eq!(tree.get(&key(2)).unwrap(), Some(rid(2)));
}

#[test]
fn test_coalesce_cascade_and_root_shrink() {
    let dir = tempdir().unwrap();
    let bpm = create_bpm(&dir, 16);
    let tree = create_tree(&bpm, 3, 3);

    for i in 1..=10 {
        tree.insert(key(i), rid(i)).unwrap();
    }
    let tall_root = tree.root_page_id();

    for i in 1..=4 {
        tree.remove(&key(i)).unwrap();
        check_integrity(&bpm, &tree);
    }

    // Coalescing propagated far enough to collapse the old root.
    assert_ne!(tree.root_page_id(), tall_root);
    assert_eq!(check_integrity(&bpm, &tree), (5..=10).collect::<Vec<i64>>());

    // Drain the tree completely.
    for i in 5..=10 {
        tree.remove(&key(i)).unwrap();
        check_integrity(&bpm, &tree);
    }
    assert!(tree.is_empty());
    assert_eq!(tree.root_page_id(), PageId::INVALID);

    // An emptied tree accepts inserts again.
    tree.insert(key(42), rid(42)).unwrap();
    assert_eq!(collect(&tree), vec![42]);
}

// ============================================================================
// Round trips
// ============================================================================

#[test]
fn test_round_trip_random_permutations() {
    let dir = tempdir().unwrap();
    let bpm = create_bpm(&dir, 32);
    let tree = create_tree(&bpm, 4, 4);
    let mut rng = rand::thread_rng();

    let mut keys: Vec<i64> = (0..200).collect();
    keys.shuffle(&mut rng);
    for (n, &i) in keys.iter().enumerate() {
        tree.insert(key(i), rid(i)).unwrap();
        if n % 25 == 0 {
            check_integrity(&bpm, &tree);
        }
    }
    assert_eq!(check_integrity(&bpm, &tree), (0..200).collect::<Vec<i64>>());

    // Remove a random half and compare against set difference.
    let mut removed: Vec<i64> = keys.iter().copied().take(100).collect();
    removed.shuffle(&mut rng);
    let removed_set: BTreeSet<i64> = removed.iter().copied().collect();
    for (n, &i) in removed.iter().enumerate() {
        tree.remove(&key(i)).unwrap();
        if n % 25 == 0 {
            check_integrity(&bpm, &tree);
        }
    }

    let expected: Vec<i64> = (0..200).filter(|k| !removed_set.contains(k)).collect();
    assert_eq!(check_integrity(&bpm, &tree), expected);
    for k in &expected {
        assert_eq!(tree.get(&key(*k)).unwrap(), Some(rid(*k)));
    }
    for k in &removed {
        assert_eq!(tree.get(&key(*k)).unwrap(), None);
    }
}

#[test]
fn test_descending_inserts() {
    let dir = tempdir().unwrap();
    let bpm = create_bpm(&dir, 16);
    let tree = create_tree(&bpm, 3, 3);

    for i in (1..=50).rev() {
        tree.insert(key(i), rid(i)).unwrap();
    }
    assert_eq!(check_integrity(&bpm, &tree), (1..=50).collect::<Vec<i64>>());
}

// ============================================================================
// Iterators
// ============================================================================

#[test]
fn test_iter_from_positions_at_key_or_insertion_point() {
    let dir = tempdir().unwrap();
    let bpm = create_bpm(&dir, 16);
    let tree = create_tree(&bpm, 3, 3);

    for i in (2..=20).step_by(2) {
        tree.insert(key(i), rid(i)).unwrap();
    }

    // Present key: iteration starts exactly there.
    let rest: Vec<i64> = tree
        .iter_from(&key(10))
        .unwrap()
        .map(|e| e.unwrap().0.to_integer())
        .collect();
    assert_eq!(rest, vec![10, 12, 14, 16, 18, 20]);

    // Absent key: iteration starts at the insertion point.
    let rest: Vec<i64> = tree
        .iter_from(&key(11))
        .unwrap()
        .map(|e| e.unwrap().0.to_integer())
        .collect();
    assert_eq!(rest, vec![12, 14, 16, 18, 20]);

    // Past the largest key: immediately exhausted.
    assert_eq!(tree.iter_from(&key(99)).unwrap().count(), 0);
    assert_eq!(bpm.stats().pinned_frames, 0);
}

#[test]
fn test_iterator_pins_one_leaf_at_a_time() {
    let dir = tempdir().unwrap();
    let bpm = create_bpm(&dir, 16);
    let tree = create_tree(&bpm, 3, 3);

    for i in 1..=30 {
        tree.insert(key(i), rid(i)).unwrap();
    }

    let mut iter = tree.iter().unwrap();
    assert!(iter.next().is_some());
    assert_eq!(bpm.stats().pinned_frames, 1);

    // Dropping a half-consumed iterator releases its pin.
    drop(iter);
    assert_eq!(bpm.stats().pinned_frames, 0);

    assert_eq!(collect(&tree), (1..=30).collect::<Vec<i64>>());
    assert_eq!(bpm.stats().pinned_frames, 0);
}

// ============================================================================
// Buffer pool churn and persistence
// ============================================================================

#[test]
fn test_working_set_larger_than_pool() {
    let dir = tempdir().unwrap();
    // A pool this small forces steady eviction through the disk manager.
    let bpm = create_bpm(&dir, 8);
    let tree = create_tree(&bpm, 4, 4);
    let mut rng = rand::thread_rng();

    let mut keys: Vec<i64> = (0..500).collect();
    keys.shuffle(&mut rng);
    for &i in &keys {
        tree.insert(key(i), rid(i)).unwrap();
    }

    for i in 0..500 {
        assert_eq!(tree.get(&key(i)).unwrap(), Some(rid(i)), "lost key {i} under churn");
    }
    assert_eq!(check_integrity(&bpm, &tree), (0..500).collect::<Vec<i64>>());
}

#[test]
fn test_contents_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bramble.db");

    {
        let dm = DiskManager::new(DiskManagerConfig {
            data_path: path.clone(),
            fsync_enabled: false,
        })
        .unwrap();
        let bpm = Arc::new(BufferPoolManager::new(
            BufferPoolConfig {
                pool_size: 8,
                replacer_k: 2,
                bucket_size: 4,
            },
            Arc::new(dm),
        ));
        let tree = create_tree(&bpm, 4, 4);
        for i in 0..100 {
            tree.insert(key(i), rid(i)).unwrap();
        }
        bpm.flush_all().unwrap();
    }

    // A fresh pool over the same file finds the root through the header
    // page and serves every key.
    let dm = DiskManager::new(DiskManagerConfig {
        data_path: path,
        fsync_enabled: false,
    })
    .unwrap();
    let bpm = Arc::new(BufferPoolManager::new(
        BufferPoolConfig {
            pool_size: 8,
            replacer_k: 2,
            bucket_size: 4,
        },
        Arc::new(dm),
    ));
    let tree = create_tree(&bpm, 4, 4);

    assert!(!tree.is_empty());
    for i in 0..100 {
        assert_eq!(tree.get(&key(i)).unwrap(), Some(rid(i)));
    }
    assert_eq!(check_integrity(&bpm, &tree), (0..100).collect::<Vec<i64>>());
}
