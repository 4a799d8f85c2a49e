#![forbid(unsafe_code)]
//! End-to-end tree operation tests over synthetic in-memory images.

use sfs_block::image::ImageBuilder;
use sfs_block::FsInfo;
use sfs_ondisk::{check_leaf, check_node};
use sfs_tree::{BumpAllocator, LeafIter, Path, TreeRoot, TreeTxn};
use sfs_types::{Key, FS_TREE_OBJECTID};

const IMAGE_BYTES: u64 = 64 * 1024 * 1024;
const NODESIZE: u32 = 4096;
const GENERATION: u64 = 4;

struct Fixture {
    fs: FsInfo,
    root: TreeRoot,
    alloc_start: u64,
}

fn fixture() -> Fixture {
    let mut builder = ImageBuilder::new(IMAGE_BYTES, NODESIZE).generation(GENERATION);
    let chunk_leaf = builder
        .write_empty_leaf(sfs_types::CHUNK_TREE_OBJECTID)
        .expect("chunk leaf");
    let fs_leaf = builder
        .write_empty_leaf(FS_TREE_OBJECTID)
        .expect("fs leaf");
    let root_leaf = builder
        .write_empty_leaf(sfs_types::ROOT_TREE_OBJECTID)
        .expect("root leaf");
    let alloc_start = builder.alloc_cursor();
    let sb = builder.superblock(root_leaf, 0, chunk_leaf);
    let fs = builder.finish(&sb).expect("open image");
    Fixture {
        fs,
        root: TreeRoot::new(FS_TREE_OBJECTID, fs_leaf, 0, GENERATION),
        alloc_start,
    }
}

fn txn(fx: &Fixture) -> TreeTxn<'_> {
    TreeTxn::start(
        &fx.fs,
        GENERATION + 1,
        Box::new(BumpAllocator::new(fx.alloc_start, IMAGE_BYTES)),
    )
}

/// Collect every (key, payload) pair by leaf iteration.
fn collect_all(txn: &mut TreeTxn<'_>, root: TreeRoot) -> Vec<(Key, Vec<u8>)> {
    let mut iter = LeafIter::forward(txn, root, &Key::MIN).expect("iter");
    let mut out = Vec::new();
    while let Some(entry) = iter.next_entry(txn).expect("next") {
        out.push(entry);
    }
    out
}

/// Walk the whole tree verifying leaf and node structure.
fn assert_tree_valid(txn: &mut TreeTxn<'_>, root: &TreeRoot) {
    let mut pending = vec![(root.bytenr, None::<Key>)];
    while let Some((bytenr, parent_key)) = pending.pop() {
        let block = txn.block(bytenr).expect("block").clone();
        if block.is_leaf() {
            check_leaf(&block, parent_key.as_ref()).expect("leaf invariants");
        } else {
            check_node(&block, parent_key.as_ref()).expect("node invariants");
            for slot in 0..block.nritems() {
                pending.push((block.node_blockptr(slot), Some(block.node_key(slot))));
            }
        }
    }
}

#[test]
fn insert_and_search_single_leaf() {
    let fx = fixture();
    let mut root = fx.root;
    let mut txn = txn(&fx);

    for objectid in [5_u64, 1, 9, 3, 7] {
        let key = Key::new(objectid, 0, 0);
        let payload = vec![objectid as u8; 16];
        txn.insert_item(&mut root, &key, &payload).expect("insert");
    }

    let mut path = Path::new();
    let found = txn
        .search_slot(&mut root, &Key::new(7, 0, 0), &mut path, 0, false)
        .expect("search");
    assert!(found);
    let (key, data) = txn.current_item(&path).expect("item").expect("present");
    assert_eq!(key, Key::new(7, 0, 0));
    assert_eq!(data, vec![7_u8; 16]);

    let all = collect_all(&mut txn, root);
    let keys: Vec<u64> = all.iter().map(|(k, _)| k.objectid).collect();
    assert_eq!(keys, vec![1, 3, 5, 7, 9]);
    assert_tree_valid(&mut txn, &root);
}

#[test]
fn duplicate_insert_rejected() {
    let fx = fixture();
    let mut root = fx.root;
    let mut txn = txn(&fx);

    let key = Key::new(42, 0, 0);
    txn.insert_item(&mut root, &key, b"first").expect("insert");
    assert!(txn.insert_item(&mut root, &key, b"second").is_err());
}

// Scenario: search on a multi-level tree returns the first key strictly
// greater than the probe when there is no exact match.
#[test]
fn search_slot_on_synthetic_multilevel_tree() {
    let fx = fixture();
    let mut root = fx.root;
    let mut txn = txn(&fx);

    // Enough 100-byte items to force several leaf splits and at least one
    // level of interior nodes.
    let count = 400_u64;
    for objectid in 1..=count {
        let key = Key::new(objectid, 0, 0);
        txn.insert_item(&mut root, &key, &[0xAB; 100]).expect("insert");
    }
    assert!(root.level >= 1, "tree should have grown interior levels");
    assert_tree_valid(&mut txn, &root);

    // Probe between two existing keys: objectid M, type 1 sorts after
    // (M, 0, 0) and before (M + 1, 0, 0).
    let probe_m = 123_u64;
    let mut path = Path::new();
    let found = txn
        .search_slot(&mut root, &Key::new(probe_m, 1, 0), &mut path, 0, false)
        .expect("search");
    assert!(!found);
    let (key, _) = txn.current_item(&path).expect("item").expect("in range");
    assert_eq!(key, Key::new(probe_m + 1, 0, 0));

    let all = collect_all(&mut txn, root);
    assert_eq!(all.len(), count as usize);
    let mut last = Key::MIN;
    for (key, _) in &all {
        assert!(*key > last, "iteration must be strictly increasing");
        last = *key;
    }
}

// Scenario: a split of a nearly full leaf keeps both halves well-formed and
// leaves the path pointing at the new item's slot.
#[test]
fn split_preserves_order_and_path() {
    let fx = fixture();
    let mut root = fx.root;
    let mut txn = txn(&fx);

    // Fill one leaf with 50-byte items keyed from 100 up, until there is no
    // longer room for a 100-byte insert.
    let mut fill = 0_usize;
    loop {
        let free = txn.block(root.bytenr).expect("leaf").leaf_free_space();
        if free < 100 + sfs_ondisk::ITEM_SIZE {
            break;
        }
        let key = Key::new(100 + fill as u64, 0, 0);
        txn.insert_item(&mut root, &key, &[fill as u8; 50]).expect("fill");
        fill += 1;
    }
    assert_eq!(root.level, 0, "fixture fill must stay in one leaf");

    // Now insert a 100-byte item that sorts before everything: slot 0.
    let new_key = Key::new(1, 0, 0);
    txn.insert_item(&mut root, &new_key, &[0xEE; 100]).expect("insert at slot 0");
    assert_eq!(root.level, 1, "split must grow the tree");

    let mut path = Path::new();
    let found = txn
        .search_slot(&mut root, &new_key, &mut path, 0, false)
        .expect("search");
    assert!(found);
    assert_eq!(path.slots[0], 0, "new item sits at slot 0 of its leaf");

    // Both halves satisfy the leaf invariant and the parent's second
    // pointer names the right half by its first key.
    let root_block = txn.block(root.bytenr).expect("root node").clone();
    check_node(&root_block, None).expect("parent node valid");
    assert!(root_block.nritems() >= 2);
    let right_bytenr = root_block.node_blockptr(1);
    let right = txn.block(right_bytenr).expect("right leaf").clone();
    check_leaf(&right, Some(&root_block.node_key(1))).expect("right leaf valid");
    let left = txn.block(root_block.node_blockptr(0)).expect("left").clone();
    check_leaf(&left, Some(&root_block.node_key(0))).expect("left leaf valid");

    let all = collect_all(&mut txn, root);
    assert_eq!(all.len(), fill + 1);
    assert_eq!(all[0].0, new_key);
}

// Round-trip law: insert then delete returns the tree to the same item set.
#[test]
fn insert_then_delete_restores_item_set() {
    let fx = fixture();
    let mut root = fx.root;
    let mut txn = txn(&fx);

    for objectid in 1..=50_u64 {
        txn.insert_item(&mut root, &Key::new(objectid, 0, 0), &[1_u8; 40])
            .expect("insert");
    }
    let before = collect_all(&mut txn, root);

    let extra = Key::new(25, 7, 0);
    txn.insert_item(&mut root, &extra, b"transient").expect("insert extra");

    let mut path = Path::new();
    let found = txn
        .search_slot(&mut root, &extra, &mut path, -1, true)
        .expect("search for delete");
    assert!(found);
    txn.del_item(&mut root, &mut path).expect("delete");

    let after = collect_all(&mut txn, root);
    assert_eq!(before, after);
    assert_tree_valid(&mut txn, &root);
}

// Boundary: deleting the last item of a single-leaf root leaves a valid
// empty level-0 root.
#[test]
fn delete_last_item_leaves_empty_root() {
    let fx = fixture();
    let mut root = fx.root;
    let mut txn = txn(&fx);

    let key = Key::new(77, 0, 0);
    txn.insert_item(&mut root, &key, b"only").expect("insert");

    let mut path = Path::new();
    assert!(txn
        .search_slot(&mut root, &key, &mut path, -1, true)
        .expect("search"));
    txn.del_item(&mut root, &mut path).expect("delete");

    assert_eq!(root.level, 0);
    let block = txn.block(root.bytenr).expect("root").clone();
    assert_eq!(block.nritems(), 0);
    assert!(check_leaf(&block, None).is_ok());
}

// Boundary: mass deletion collapses interior levels back toward the root.
#[test]
fn mass_delete_collapses_levels() {
    let fx = fixture();
    let mut root = fx.root;
    let mut txn = txn(&fx);

    let count = 500_u64;
    for objectid in 1..=count {
        txn.insert_item(&mut root, &Key::new(objectid, 0, 0), &[2_u8; 80])
            .expect("insert");
    }
    let grown_level = root.level;
    assert!(grown_level >= 1);

    for objectid in 1..count {
        let key = Key::new(objectid, 0, 0);
        let mut path = Path::new();
        let found = txn
            .search_slot(&mut root, &key, &mut path, -1, true)
            .expect("search");
        assert!(found, "key {objectid} must exist");
        txn.del_item(&mut root, &mut path).expect("delete");
    }

    let remaining = collect_all(&mut txn, root);
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].0, Key::new(count, 0, 0));
    assert!(root.level < grown_level, "tree must shrink after mass delete");
    assert_tree_valid(&mut txn, &root);
}

// COW must replace every block on a mutating descent: mutation under a new
// transid never overwrites blocks from the committed generation.
#[test]
fn cow_preserves_committed_blocks() {
    let fx = fixture();
    let mut root = fx.root;

    let original_root_bytenr = root.bytenr;
    let mut txn = txn(&fx);
    txn.insert_item(&mut root, &Key::new(1, 0, 0), b"cowed")
        .expect("insert");

    assert_ne!(root.bytenr, original_root_bytenr, "root must be COW-ed");
    assert_eq!(root.generation, GENERATION + 1);

    // The committed copy is untouched on the device.
    let old = fx.fs.read_tree_block(original_root_bytenr, GENERATION).expect("old root");
    assert_eq!(old.nritems(), 0);

    // Events account for the allocation of the new block and the free of
    // the old one.
    let events = txn.take_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, sfs_tree::RefEvent::Alloc { bytenr, .. } if *bytenr == root.bytenr)));
    assert!(events.iter().any(
        |e| matches!(e, sfs_tree::RefEvent::Free(f) if f.bytenr == original_root_bytenr)
    ));
}

#[test]
fn commit_persists_through_reopen() {
    let fx = fixture();
    let mut root = fx.root;
    let mut txn = txn(&fx);

    for objectid in [3_u64, 1, 2] {
        txn.insert_item(&mut root, &Key::new(objectid, 0, 0), &[9_u8; 10])
            .expect("insert");
    }
    txn.commit().expect("commit");

    // A fresh transaction reads the committed blocks back from the device.
    let mut reread = TreeTxn::read_only(&fx.fs);
    let all = collect_all(&mut reread, root);
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].0, Key::new(1, 0, 0));
}

#[test]
fn backward_iteration_yields_descending_keys() {
    let fx = fixture();
    let mut root = fx.root;
    let mut txn = txn(&fx);

    for objectid in 1..=40_u64 {
        txn.insert_item(&mut root, &Key::new(objectid, 0, 0), &[3_u8; 60])
            .expect("insert");
    }

    let mut iter = LeafIter::backward(&mut txn, root, &Key::new(20, 0, 0)).expect("iter");
    let mut seen = Vec::new();
    while let Some((key, _)) = iter.next_entry(&mut txn).expect("next") {
        seen.push(key.objectid);
    }
    assert_eq!(seen, (1..=20).rev().collect::<Vec<u64>>());
}

#[test]
fn prev_and_next_leaf_roundtrip() {
    let fx = fixture();
    let mut root = fx.root;
    let mut txn = txn(&fx);

    for objectid in 1..=300_u64 {
        txn.insert_item(&mut root, &Key::new(objectid, 0, 0), &[4_u8; 90])
            .expect("insert");
    }
    assert!(root.level >= 1);

    let mut path = Path::new();
    txn.search_slot(&mut root, &Key::MIN, &mut path, 0, false)
        .expect("search first");
    let first_leaf = path.nodes[0];

    assert!(txn.next_leaf(&root, &mut path).expect("next"));
    assert_ne!(path.nodes[0], first_leaf);
    assert_eq!(path.slots[0], 0);

    assert!(txn.prev_leaf(&root, &mut path).expect("prev"));
    assert_eq!(path.nodes[0], first_leaf);
    let leaf = txn.block(path.nodes[0]).expect("leaf").clone();
    assert_eq!(path.slots[0], leaf.nritems() - 1);
}
