#![forbid(unsafe_code)]
//! End-to-end restore tests over hand-built images.

use flate2::write::ZlibEncoder;
use flate2::Compression;
use sfs_block::image::ImageBuilder;
use sfs_block::{ByteDevice, FsInfo};
use sfs_ondisk::{
    encode_dir_item, encode_file_extent, encode_inode_item, encode_inode_ref, encode_root_item,
    DirItem, FileExtent, InodeItem, InodeRef, RootItem, TreeBlock,
};
use sfs_restore::{abort_on_loop, RestoreOptions, Restorer};
use sfs_types::{
    Key, CHUNK_TREE_OBJECTID, COMPRESS_NONE, COMPRESS_ZLIB, FILE_EXTENT_REG, FS_TREE_OBJECTID,
    FT_DIR, FT_REG_FILE, HEADER_FLAG_WRITTEN, ITEM_DIR_INDEX, ITEM_EXTENT_DATA, ITEM_INODE_ITEM,
    ITEM_INODE_REF, ITEM_ROOT_ITEM, MIXED_BACKREF_REV, ROOT_TREE_OBJECTID, S_IFDIR, S_IFREG,
};
use std::io::Write;

const IMAGE_BYTES: u64 = 64 * 1024 * 1024;
const NODESIZE: u32 = 4096;
const GEN: u64 = 9;

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

fn leaf(bytenr: u64, owner: u64) -> TreeBlock {
    let mut block = TreeBlock::new_empty(NODESIZE as usize, bytenr, owner, GEN, 0);
    block.set_fsid([0x5A; 16]);
    block.set_flags(sfs_types::with_backref_rev(
        HEADER_FLAG_WRITTEN,
        MIXED_BACKREF_REV,
    ));
    block
}

fn inode(mode: u32, nlink: u32, size: u64) -> Vec<u8> {
    encode_inode_item(&InodeItem {
        nlink,
        mode,
        size,
        nbytes: size,
        ..InodeItem::default()
    })
}

fn dir_index(child: u64, child_type: u8, child_key_offset: u64, file_type: u8, name: &[u8]) -> Vec<u8> {
    encode_dir_item(&DirItem {
        location: Key::new(child, child_type, child_key_offset),
        transid: GEN,
        file_type,
        name: name.to_vec(),
        data_len: 0,
    })
}

struct RestoreImage {
    fs: FsInfo,
    inline_payload: Vec<u8>,
    data_payload: Vec<u8>,
}

/// Image with one subvolume:
/// ```text
/// /hello.txt   5000 bytes, zlib-compressed inline extent
/// /sub/data.bin 4096 bytes, regular extent
/// /snap        snapshot reference (skipped by default)
/// ```
fn build_image() -> RestoreImage {
    let mut builder = ImageBuilder::new(IMAGE_BYTES, NODESIZE).generation(GEN);
    let chunk_leaf = builder
        .write_empty_leaf(CHUNK_TREE_OBJECTID)
        .expect("chunk leaf");
    let fs_leaf_nr = builder.reserve_block();
    let tree_leaf_nr = builder.reserve_block();
    let data_bytenr = builder.reserve_block();

    // Scenario S5: 5000 logical bytes compressed into a short inline blob.
    let inline_payload: Vec<u8> = (0..5000_u32).map(|i| (i % 191) as u8).collect();
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&inline_payload).expect("compress");
    let compressed = encoder.finish().expect("finish");
    assert!(compressed.len() < inline_payload.len());

    let data_payload = vec![0xC7_u8; 4096];

    let fs_items: Vec<(Key, Vec<u8>)> = vec![
        (Key::new(256, ITEM_INODE_ITEM, 0), inode(S_IFDIR | 0o755, 1, 0)),
        (
            Key::new(256, ITEM_INODE_REF, 256),
            encode_inode_ref(&InodeRef {
                index: 0,
                name: b"..".to_vec(),
            }),
        ),
        (
            Key::new(256, ITEM_DIR_INDEX, 2),
            dir_index(257, ITEM_INODE_ITEM, 0, FT_REG_FILE, b"hello.txt"),
        ),
        (
            Key::new(256, ITEM_DIR_INDEX, 3),
            dir_index(258, ITEM_INODE_ITEM, 0, FT_DIR, b"sub"),
        ),
        (
            Key::new(256, ITEM_DIR_INDEX, 4),
            // Snapshot: a ROOT_ITEM location with a non-zero offset.
            dir_index(300, ITEM_ROOT_ITEM, 5, FT_DIR, b"snap"),
        ),
        (
            Key::new(257, ITEM_INODE_ITEM, 0),
            inode(S_IFREG | 0o644, 1, 5000),
        ),
        (
            Key::new(257, ITEM_EXTENT_DATA, 0),
            encode_file_extent(&FileExtent::Inline {
                generation: GEN,
                ram_bytes: 5000,
                compression: COMPRESS_ZLIB,
                encryption: 0,
                other_encoding: 0,
                data: compressed,
            }),
        ),
        (Key::new(258, ITEM_INODE_ITEM, 0), inode(S_IFDIR | 0o755, 1, 0)),
        (
            Key::new(258, ITEM_DIR_INDEX, 2),
            dir_index(259, ITEM_INODE_ITEM, 0, FT_REG_FILE, b"data.bin"),
        ),
        (
            Key::new(259, ITEM_INODE_ITEM, 0),
            inode(S_IFREG | 0o644, 1, 4096),
        ),
        (
            Key::new(259, ITEM_EXTENT_DATA, 0),
            encode_file_extent(&FileExtent::Regular {
                generation: GEN,
                ram_bytes: 4096,
                compression: COMPRESS_NONE,
                encryption: 0,
                other_encoding: 0,
                extent_type: FILE_EXTENT_REG,
                disk_bytenr: data_bytenr,
                disk_num_bytes: 4096,
                offset: 0,
                num_bytes: 4096,
            }),
        ),
    ];
    let mut fs_leaf = leaf(fs_leaf_nr, FS_TREE_OBJECTID);
    fill_leaf(&mut fs_leaf, &fs_items);
    builder.write_block(&mut fs_leaf).expect("fs leaf");

    let root_items = vec![(
        Key::new(FS_TREE_OBJECTID, ITEM_ROOT_ITEM, 0),
        encode_root_item(&RootItem {
            inode: InodeItem {
                nlink: 1,
                mode: S_IFDIR | 0o755,
                ..InodeItem::default()
            },
            generation: GEN,
            root_dirid: 256,
            bytenr: fs_leaf_nr,
            byte_limit: 0,
            bytes_used: u64::from(NODESIZE),
            last_snapshot: 0,
            flags: 0,
            refs: 1,
            drop_progress: Key::MIN,
            drop_level: 0,
            level: 0,
        }),
    )];
    let mut tree_leaf = leaf(tree_leaf_nr, ROOT_TREE_OBJECTID);
    fill_leaf(&mut tree_leaf, &root_items);
    builder.write_block(&mut tree_leaf).expect("tree leaf");

    let sb = builder.superblock(tree_leaf_nr, 0, chunk_leaf);
    let fs = builder.finish(&sb).expect("open");
    fs.device()
        .write_at(data_bytenr, &data_payload)
        .expect("data payload");

    RestoreImage {
        fs,
        inline_payload,
        data_payload,
    }
}

#[test]
fn restore_recreates_tree_and_contents() {
    let image = build_image();
    let target = tempfile::tempdir().expect("tempdir");

    let opts = RestoreOptions::default();
    let mut restorer = Restorer::new(&image.fs, opts, abort_on_loop()).expect("restorer");
    let summary = restorer.run(target.path()).expect("restore");

    assert_eq!(summary.files_restored, 2);
    assert_eq!(summary.dirs_created, 1);
    assert_eq!(summary.snapshots_skipped, 1);
    assert_eq!(summary.errors_ignored, 0);

    // S5: the compressed inline file comes back at its full logical size.
    let hello = std::fs::read(target.path().join("hello.txt")).expect("hello.txt");
    assert_eq!(hello.len(), 5000, "ftruncate to isize is the final step");
    assert_eq!(hello, image.inline_payload);

    let data = std::fs::read(target.path().join("sub/data.bin")).expect("data.bin");
    assert_eq!(data, image.data_payload);
}

#[test]
fn restore_skips_existing_without_overwrite() {
    let image = build_image();
    let target = tempfile::tempdir().expect("tempdir");
    std::fs::write(target.path().join("hello.txt"), b"keep me").expect("pre-existing");

    let opts = RestoreOptions::default();
    let mut restorer = Restorer::new(&image.fs, opts, abort_on_loop()).expect("restorer");
    let summary = restorer.run(target.path()).expect("restore");
    assert_eq!(summary.files_skipped, 1);
    let kept = std::fs::read(target.path().join("hello.txt")).expect("read");
    assert_eq!(kept, b"keep me");

    // With overwrite the file is replaced.
    let opts = RestoreOptions {
        overwrite: true,
        ..RestoreOptions::default()
    };
    let mut restorer = Restorer::new(&image.fs, opts, abort_on_loop()).expect("restorer");
    let summary = restorer.run(target.path()).expect("restore");
    assert_eq!(summary.files_skipped, 0);
    let replaced = std::fs::read(target.path().join("hello.txt")).expect("read");
    assert_eq!(replaced, image.inline_payload);
}

#[test]
fn list_roots_reports_fs_tree() {
    let image = build_image();
    let mut restorer = Restorer::new(
        &image.fs,
        RestoreOptions::default(),
        abort_on_loop(),
    )
    .expect("restorer");
    let roots = restorer.list_roots().expect("list roots");
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].objectid, FS_TREE_OBJECTID);
    assert_eq!(roots[0].level, 0);
}

#[test]
fn find_first_dir_locates_root_directory() {
    let image = build_image();
    let mut restorer = Restorer::new(
        &image.fs,
        RestoreOptions {
            find_dir: true,
            ..RestoreOptions::default()
        },
        abort_on_loop(),
    )
    .expect("restorer");
    assert_eq!(restorer.find_first_dir().expect("find"), 256);
}

#[test]
fn snapshots_descend_with_flag() {
    let image = build_image();
    let target = tempfile::tempdir().expect("tempdir");
    let opts = RestoreOptions {
        get_snapshots: true,
        ignore_errors: true,
        ..RestoreOptions::default()
    };
    let mut restorer = Restorer::new(&image.fs, opts, abort_on_loop()).expect("restorer");
    // The snapshot's root item does not exist in this image; with -i the
    // unreadable subvolume is skipped rather than fatal.
    let summary = restorer.run(target.path()).expect("restore");
    assert_eq!(summary.snapshots_skipped, 0);
    assert_eq!(summary.errors_ignored, 1);
}
