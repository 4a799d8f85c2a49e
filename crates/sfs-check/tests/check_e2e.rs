#![forbid(unsafe_code)]
//! End-to-end check/repair tests over hand-built images.

use sfs_block::image::ImageBuilder;
use sfs_block::{ByteDevice, FsInfo};
use sfs_check::{run_check, CheckOptions};
use sfs_ondisk::{
    encode_extent_item, encode_inode_item, encode_inode_ref, encode_root_item, ExtentItem,
    InlineRef, InodeItem, InodeRef, RootItem, Superblock, TreeBlock,
};
use sfs_tree::{TreeRoot, TreeTxn};
use sfs_types::{
    Key, BLOCK_GROUP_DATA, BLOCK_GROUP_METADATA, CHUNK_TREE_OBJECTID, EXTENT_FLAG_TREE_BLOCK,
    EXTENT_TREE_OBJECTID, BLOCK_FLAG_FULL_BACKREF, FREE_SPACE_TREE_OBJECTID, FS_TREE_OBJECTID,
    HEADER_FLAG_WRITTEN, ITEM_BLOCK_GROUP_ITEM, ITEM_EXTENT_ITEM, ITEM_FREE_SPACE_EXTENT,
    ITEM_INODE_ITEM, ITEM_INODE_REF, ITEM_ROOT_ITEM, ITEM_SHARED_BLOCK_REF,
    ITEM_TREE_BLOCK_REF, MIXED_BACKREF_REV, ROOT_TREE_OBJECTID, SUPER_INFO_OFFSET, S_IFDIR,
};

const IMAGE_BYTES: u64 = 64 * 1024 * 1024;
const NODESIZE: u32 = 4096;
const GEN: u64 = 7;

/// Pack sorted (key, payload) items into a leaf, payloads from the tail.
fn fill_leaf(block: &mut TreeBlock, items: &[(Key, Vec<u8>)]) {
    let mut data_end = block.nodesize();
    for (slot, (key, data)) in items.iter().enumerate() {
        data_end -= data.len();
        block.set_nritems(slot + 1);
        block.set_item_key(slot, key);
        block.set_item_offset(slot, data_end);
        block.set_item_size(slot, data.len());
        block.write_bytes(data_end, data);
    }
}

fn leaf(builder: &ImageBuilder, bytenr: u64, owner: u64) -> TreeBlock {
    let _ = builder;
    let mut block = TreeBlock::new_empty(NODESIZE as usize, bytenr, owner, GEN, 0);
    block.set_fsid([0x5A; 16]);
    block.set_flags(sfs_types::with_backref_rev(
        HEADER_FLAG_WRITTEN,
        MIXED_BACKREF_REV,
    ));
    block
}

fn node(bytenr: u64, owner: u64, level: u8) -> TreeBlock {
    let mut block = TreeBlock::new_empty(NODESIZE as usize, bytenr, owner, GEN, level);
    block.set_fsid([0x5A; 16]);
    block.set_flags(sfs_types::with_backref_rev(
        HEADER_FLAG_WRITTEN,
        MIXED_BACKREF_REV,
    ));
    block
}

fn metadata_extent_item(owner_root: u64, first_key: Key, level: u8, full_backref: bool) -> Vec<u8> {
    let mut flags = EXTENT_FLAG_TREE_BLOCK;
    if full_backref {
        flags |= BLOCK_FLAG_FULL_BACKREF;
    }
    encode_extent_item(&ExtentItem {
        refs: 1,
        generation: GEN,
        flags,
        tree_block_info: Some((first_key, level)),
        inline_refs: vec![InlineRef::TreeBlock { root: owner_root }],
    })
}

fn root_item_payload(bytenr: u64, level: u8) -> Vec<u8> {
    encode_root_item(&RootItem {
        inode: InodeItem {
            nlink: 1,
            mode: S_IFDIR | 0o755,
            ..InodeItem::default()
        },
        generation: GEN,
        root_dirid: 256,
        bytenr,
        byte_limit: 0,
        bytes_used: u64::from(NODESIZE),
        last_snapshot: 0,
        flags: 0,
        refs: 1,
        drop_progress: Key::MIN,
        drop_level: 0,
        level,
    })
}

fn root_dir_items() -> Vec<(Key, Vec<u8>)> {
    vec![
        (
            Key::new(256, ITEM_INODE_ITEM, 0),
            encode_inode_item(&InodeItem {
                nlink: 1,
                mode: S_IFDIR | 0o755,
                ..InodeItem::default()
            }),
        ),
        (
            Key::new(256, ITEM_INODE_REF, 256),
            encode_inode_ref(&InodeRef {
                index: 0,
                name: b"..".to_vec(),
            }),
        ),
    ]
}

struct CleanImage {
    fs: FsInfo,
    fs_leaf: u64,
    fs_mid: u64,
}

/// Build an image whose fs tree is P2 → P1 → L (three levels). When
/// `break_leaf_ref` is set, the leaf's declared backref stays a
/// TREE_BLOCK_REF while the walker will observe a shared (parent) ref —
/// the mismatch the repairer must fix into a SHARED_BLOCK_REF.
fn build_image(break_leaf_ref: bool, with_space_cache_bug: bool) -> CleanImage {
    let mut builder = ImageBuilder::new(IMAGE_BYTES, NODESIZE).generation(GEN);
    let chunk_leaf = builder
        .write_empty_leaf(CHUNK_TREE_OBJECTID)
        .expect("chunk leaf");

    let fs_leaf_nr = builder.reserve_block();
    let fs_mid_nr = builder.reserve_block();
    let fs_top_nr = builder.reserve_block();
    let extent_leaf_nr = builder.reserve_block();
    let tree_leaf_nr = builder.reserve_block();
    let free_space_leaf_nr = if with_space_cache_bug {
        builder.reserve_block()
    } else {
        0
    };

    // fs tree: leaf with the root directory inode.
    let mut fs_leaf = leaf(&builder, fs_leaf_nr, FS_TREE_OBJECTID);
    fill_leaf(&mut fs_leaf, &root_dir_items());
    let first_key = fs_leaf.item_key(0);
    builder.write_block(&mut fs_leaf).expect("fs leaf");

    let mut fs_mid = node(fs_mid_nr, FS_TREE_OBJECTID, 1);
    fs_mid.set_nritems(1);
    fs_mid.set_node_key(0, &first_key);
    fs_mid.set_node_blockptr(0, fs_leaf_nr);
    fs_mid.set_node_ptr_generation(0, GEN);
    builder.write_block(&mut fs_mid).expect("fs mid");

    let mut fs_top = node(fs_top_nr, FS_TREE_OBJECTID, 2);
    fs_top.set_nritems(1);
    fs_top.set_node_key(0, &first_key);
    fs_top.set_node_blockptr(0, fs_mid_nr);
    fs_top.set_node_ptr_generation(0, GEN);
    builder.write_block(&mut fs_top).expect("fs top");

    // Extent tree: one block group + one metadata extent per tree block.
    let nodesz = u64::from(NODESIZE);
    let mut extent_items: Vec<(Key, Vec<u8>)> = vec![(
        Key::new(0, ITEM_BLOCK_GROUP_ITEM, IMAGE_BYTES),
        sfs_ondisk::encode_block_group_item(&sfs_ondisk::BlockGroupItem {
            used: 6 * nodesz,
            chunk_objectid: 256,
            flags: BLOCK_GROUP_METADATA | BLOCK_GROUP_DATA,
        }),
    )];
    let mut blocks: Vec<(u64, u64, Key, u8, bool)> = vec![
        (chunk_leaf, CHUNK_TREE_OBJECTID, Key::MIN, 0, false),
        (fs_leaf_nr, FS_TREE_OBJECTID, first_key, 0, false),
        // The mid node advertises full backrefs so its children are walked
        // as shared (parent) references.
        (fs_mid_nr, FS_TREE_OBJECTID, first_key, 1, true),
        (fs_top_nr, FS_TREE_OBJECTID, first_key, 2, false),
        (extent_leaf_nr, EXTENT_TREE_OBJECTID, Key::MIN, 0, false),
        (tree_leaf_nr, ROOT_TREE_OBJECTID, Key::MIN, 0, false),
    ];
    if with_space_cache_bug {
        blocks.push((free_space_leaf_nr, FREE_SPACE_TREE_OBJECTID, Key::MIN, 0, false));
    }
    blocks.sort_by_key(|&(bytenr, ..)| bytenr);
    for &(bytenr, owner, info_key, level, full) in &blocks {
        let payload = if bytenr == fs_leaf_nr {
            if break_leaf_ref {
                // Declared as root-referenced although the walker will find
                // only the shared parent pointer.
                metadata_extent_item(FS_TREE_OBJECTID, info_key, level, false)
            } else {
                encode_extent_item(&ExtentItem {
                    refs: 1,
                    generation: GEN,
                    flags: EXTENT_FLAG_TREE_BLOCK,
                    tree_block_info: Some((info_key, level)),
                    inline_refs: vec![InlineRef::SharedBlock { parent: fs_mid_nr }],
                })
            }
        } else {
            metadata_extent_item(owner, info_key, level, full)
        };
        extent_items.push((Key::new(bytenr, ITEM_EXTENT_ITEM, nodesz), payload));
    }

    let mut extent_leaf = leaf(&builder, extent_leaf_nr, EXTENT_TREE_OBJECTID);
    fill_leaf(&mut extent_leaf, &extent_items);
    builder.write_block(&mut extent_leaf).expect("extent leaf");

    // Free-space tree with a cache that ignores the allocated metadata
    // blocks entirely (claims everything above the superblock is free).
    if with_space_cache_bug {
        let mut fs_space_leaf = leaf(&builder, free_space_leaf_nr, FREE_SPACE_TREE_OBJECTID);
        let cache_start = SUPER_INFO_OFFSET + 65536;
        fill_leaf(
            &mut fs_space_leaf,
            &[(
                Key::new(cache_start, ITEM_FREE_SPACE_EXTENT, IMAGE_BYTES - cache_start),
                Vec::new(),
            )],
        );
        builder.write_block(&mut fs_space_leaf).expect("free space leaf");
    }

    // Root tree.
    let mut root_items = vec![
        (
            Key::new(EXTENT_TREE_OBJECTID, ITEM_ROOT_ITEM, 0),
            root_item_payload(extent_leaf_nr, 0),
        ),
        (
            Key::new(FS_TREE_OBJECTID, ITEM_ROOT_ITEM, 0),
            root_item_payload(fs_top_nr, 2),
        ),
    ];
    if with_space_cache_bug {
        root_items.push((
            Key::new(FREE_SPACE_TREE_OBJECTID, ITEM_ROOT_ITEM, 0),
            root_item_payload(free_space_leaf_nr, 0),
        ));
    }
    root_items.sort_by(|a, b| a.0.cmp(&b.0));
    let mut tree_leaf = leaf(&builder, tree_leaf_nr, ROOT_TREE_OBJECTID);
    fill_leaf(&mut tree_leaf, &root_items);
    builder.write_block(&mut tree_leaf).expect("tree leaf");

    let sb = builder.superblock(tree_leaf_nr, 0, chunk_leaf);
    let fs = builder.finish(&sb).expect("open image");
    CleanImage {
        fs,
        fs_leaf: fs_leaf_nr,
        fs_mid: fs_mid_nr,
    }
}

#[test]
fn healthy_image_checks_clean() {
    let image = build_image(false, false);
    let report = run_check(&image.fs, &CheckOptions::default()).expect("check");
    assert_eq!(report.extent_mismatches, 0, "report: {report:?}");
    assert!(report.inode_problems.is_empty(), "report: {report:?}");
    assert!(report.root_problems.is_empty());
    assert_eq!(report.csum_errors, 0);
    assert!(report.space_cache_errors.is_empty());
    assert!(!report.has_errors());
    assert!(report.stats.total_btree_bytes > 0);
}

#[test]
fn mismatched_backref_detected_without_repair() {
    let image = build_image(true, false);
    let report = run_check(&image.fs, &CheckOptions::default()).expect("check");
    assert!(report.extent_mismatches > 0);
    assert!(report.has_errors());
    assert!(!report.repaired);
}

// Scenario: the leaf's only walked reference is a shared (parent) pointer
// while the extent tree declares a root reference. Repair must leave
// exactly one SHARED_BLOCK_REF naming the parent and no TREE_BLOCK_REF.
#[test]
fn repair_rewrites_shared_backref() {
    let image = build_image(true, false);
    let opts = CheckOptions {
        repair: true,
        ..CheckOptions::default()
    };
    let report = run_check(&image.fs, &opts).expect("check --repair");
    assert!(report.repaired);
    assert!(report.extent_repaired > 0);

    // Read the committed superblock back and follow it to the repaired
    // extent tree.
    let mut region = vec![0_u8; sfs_types::SUPER_INFO_SIZE];
    image
        .fs
        .device()
        .read_at(SUPER_INFO_OFFSET, &mut region)
        .expect("superblock");
    let sb = Superblock::parse_region(&region).expect("parse superblock");
    assert_eq!(sb.generation, GEN + 1);

    let mut txn = TreeTxn::read_only(&image.fs);
    let tree_root = TreeRoot::new(ROOT_TREE_OBJECTID, sb.root, sb.root_level, sb.generation);
    let mut iter = sfs_tree::LeafIter::forward(&mut txn, tree_root, &Key::MIN).expect("iter");
    let mut extent_root = None;
    while let Some((key, data)) = iter.next_entry(&mut txn).expect("entry") {
        if key.objectid == EXTENT_TREE_OBJECTID && key.item_type == ITEM_ROOT_ITEM {
            let item = sfs_ondisk::parse_root_item(&data).expect("root item");
            extent_root = Some(TreeRoot::from_root_item(EXTENT_TREE_OBJECTID, &item));
        }
    }
    let extent_root = extent_root.expect("extent root after repair");

    let mut shared_refs = 0;
    let mut tree_refs = 0;
    let mut extent_items = 0;
    let probe = Key::new(image.fs_leaf, 0, 0);
    let mut iter = sfs_tree::LeafIter::forward(&mut txn, extent_root, &probe).expect("iter");
    while let Some((key, _)) = iter.next_entry(&mut txn).expect("entry") {
        if key.objectid != image.fs_leaf {
            break;
        }
        match key.item_type {
            ITEM_SHARED_BLOCK_REF => {
                assert_eq!(key.offset, image.fs_mid, "shared ref names the parent");
                shared_refs += 1;
            }
            ITEM_TREE_BLOCK_REF => tree_refs += 1,
            ITEM_EXTENT_ITEM => extent_items += 1,
            _ => {}
        }
    }
    assert_eq!(extent_items, 1);
    assert_eq!(shared_refs, 1);
    assert_eq!(tree_refs, 0, "stale root ref must not survive repair");

    // A second check over the repaired image balances.
    let second = run_check(&image.fs, &CheckOptions::default());
    let second = second.expect("recheck");
    assert_eq!(second.extent_mismatches, 0, "report: {second:?}");
}

// Scenario: a block group whose persisted free-space map does not carve out
// an allocated extent fails verification; repair regenerates the cache.
#[test]
fn space_cache_mismatch_detected_and_rebuilt() {
    let image = build_image(false, true);
    let report = run_check(&image.fs, &CheckOptions::default()).expect("check");
    assert_eq!(report.space_cache_errors, vec![0], "report: {report:?}");

    let image = build_image(false, true);
    let opts = CheckOptions {
        repair: true,
        ..CheckOptions::default()
    };
    let report = run_check(&image.fs, &opts).expect("repair");
    assert_eq!(report.space_cache_rebuilt, vec![0]);

    let second = run_check(&image.fs, &CheckOptions::default()).expect("recheck");
    assert!(
        second.space_cache_errors.is_empty(),
        "rebuilt cache must verify: {second:?}"
    );
}
