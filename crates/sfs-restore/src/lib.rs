#![forbid(unsafe_code)]
//! Offline file recovery.
//!
//! Reads an unmounted (possibly damaged) volume and reconstructs the
//! directory tree and regular-file contents into a target directory,
//! falling back across superblock and data mirrors and transparently
//! decompressing inline and regular extents. Strictly read-only on the
//! source device.

pub mod compress;

use serde::Serialize;
use sfs_block::{ByteDevice, FsInfo};
use sfs_error::{Result, SfsError};
use sfs_ondisk::{parse_dir_items, parse_file_extent, parse_inode_item, parse_root_item, FileExtent};
use sfs_tree::{LeafIter, Path, TreeRoot, TreeTxn};
use sfs_types::{
    Key, COMPRESS_LAST, COMPRESS_NONE, FILE_EXTENT_PREALLOC, FIRST_FREE_OBJECTID, FT_DIR,
    FT_REG_FILE, ITEM_DIR_INDEX, ITEM_EXTENT_DATA, ITEM_INODE_ITEM, ITEM_ROOT_ITEM,
    FS_TREE_OBJECTID, ROOT_TREE_OBJECTID,
};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path as FsPath, PathBuf};
use tracing::{debug, info, warn};

/// Iterations without visible progress before the loop guard fires.
const LOOP_LIMIT: u32 = 1024;

// ── Options, summary, listings ──────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Descend into snapshots as well as subvolumes.
    pub get_snapshots: bool,
    /// Keep going past per-file errors.
    pub ignore_errors: bool,
    /// Overwrite files that already exist in the target.
    pub overwrite: bool,
    /// Scan for the first directory objectid instead of assuming the
    /// subvolume root.
    pub find_dir: bool,
    /// Superblock mirror to start from.
    pub super_mirror: usize,
    /// Byte offset of the tree root if the superblock's is unreadable.
    pub tree_location: u64,
    /// Byte offset of the fs root if the default is unreadable.
    pub fs_location: u64,
    /// Explicit subvolume objectid to restore from.
    pub root_objectid: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreSummary {
    pub files_restored: u64,
    pub dirs_created: u64,
    pub files_skipped: u64,
    pub snapshots_skipped: u64,
    pub errors_ignored: u64,
}

/// One root-tree entry from `list_roots`.
#[derive(Debug, Clone, Serialize)]
pub struct RootListing {
    pub objectid: u64,
    pub offset: u64,
    pub bytenr: u64,
    pub level: u8,
}

// ── Engine ──────────────────────────────────────────────────────────────────

/// The restore engine: an opened filesystem plus walk state. `decider` is
/// consulted when a directory or file loops suspiciously long (cyclic
/// corruption); returning false abandons the current file/directory.
pub struct Restorer<'a> {
    fs: &'a FsInfo,
    txn: TreeTxn<'a>,
    tree_root: TreeRoot,
    opts: RestoreOptions,
    decider: Box<dyn FnMut(&str) -> bool + 'a>,
    pub summary: RestoreSummary,
}

/// Open the device for restore, trying superblock mirrors from
/// `opts.super_mirror` and honouring the tree-root override.
pub fn open_fs(dev: Box<dyn ByteDevice>, opts: &RestoreOptions) -> Result<FsInfo> {
    FsInfo::open(dev, opts.super_mirror)
}

impl<'a> Restorer<'a> {
    /// Build a restorer over an opened filesystem. The tree root comes from
    /// the superblock unless overridden; its level is read from the block.
    pub fn new(
        fs: &'a FsInfo,
        opts: RestoreOptions,
        decider: Box<dyn FnMut(&str) -> bool + 'a>,
    ) -> Result<Self> {
        let bytenr = if opts.tree_location != 0 {
            opts.tree_location
        } else {
            fs.sb.root
        };
        let block = fs.read_tree_block(bytenr, 0)?;
        let tree_root = TreeRoot::new(
            ROOT_TREE_OBJECTID,
            bytenr,
            block.level(),
            block.generation(),
        );
        Ok(Self {
            fs,
            txn: TreeTxn::read_only(fs),
            tree_root,
            opts,
            decider,
            summary: RestoreSummary::default(),
        })
    }

    /// Every ROOT_ITEM in the root tree.
    pub fn list_roots(&mut self) -> Result<Vec<RootListing>> {
        let mut out = Vec::new();
        let mut iter = LeafIter::forward(&mut self.txn, self.tree_root, &Key::MIN)?;
        while let Some((key, data)) = iter.next_entry(&mut self.txn)? {
            if key.item_type != ITEM_ROOT_ITEM {
                continue;
            }
            match parse_root_item(&data) {
                Ok(item) => out.push(RootListing {
                    objectid: key.objectid,
                    offset: key.offset,
                    bytenr: item.bytenr,
                    level: item.level,
                }),
                Err(err) => warn!(objectid = key.objectid, %err, "unreadable root item"),
            }
        }
        Ok(out)
    }

    /// Resolve the fs root to restore from, honouring `-r` and `-f`.
    fn resolve_fs_root(&mut self) -> Result<TreeRoot> {
        let objectid = if self.opts.root_objectid != 0 {
            self.opts.root_objectid
        } else {
            FS_TREE_OBJECTID
        };

        if self.opts.fs_location != 0 {
            let block = self.fs.read_tree_block(self.opts.fs_location, 0)?;
            return Ok(TreeRoot::new(
                objectid,
                self.opts.fs_location,
                block.level(),
                block.generation(),
            ));
        }

        self.read_fs_root(objectid)
    }

    /// Highest ROOT_ITEM for `objectid`.
    fn read_fs_root(&mut self, objectid: u64) -> Result<TreeRoot> {
        let probe = Key::new(objectid, ITEM_ROOT_ITEM, u64::MAX);
        let mut iter = LeafIter::backward(&mut self.txn, self.tree_root, &probe)?;
        let Some((key, data)) = iter.next_entry(&mut self.txn)? else {
            return Err(SfsError::NotFound(format!("root item for tree {objectid}")));
        };
        if key.objectid != objectid || key.item_type != ITEM_ROOT_ITEM {
            return Err(SfsError::NotFound(format!("root item for tree {objectid}")));
        }
        let item = parse_root_item(&data)?;
        Ok(TreeRoot::from_root_item(objectid, &item))
    }

    /// Scan for the lowest objectid that has DIR_INDEX entries. Fallback
    /// for images whose subvolume root inode is gone.
    pub fn find_first_dir(&mut self) -> Result<u64> {
        let fs_root = self.resolve_fs_root()?;
        let mut iter = LeafIter::forward(&mut self.txn, fs_root, &Key::MIN)?;
        while let Some((key, _)) = iter.next_entry(&mut self.txn)? {
            if key.item_type == ITEM_DIR_INDEX {
                info!(objectid = key.objectid, "using first directory objectid");
                return Ok(key.objectid);
            }
        }
        Err(SfsError::NotFound("no directory index items".into()))
    }

    /// Restore everything under the selected root into `output_dir`.
    pub fn run(&mut self, output_dir: &FsPath) -> Result<RestoreSummary> {
        let fs_root = self.resolve_fs_root()?;
        let first_dir = if self.opts.find_dir {
            self.find_first_dir()?
        } else {
            FIRST_FREE_OBJECTID
        };
        std::fs::create_dir_all(output_dir)?;
        self.search_dir(fs_root, first_dir, output_dir, "")?;
        Ok(self.summary.clone())
    }

    /// Walk one directory's DIR_INDEX items (stable ordering) and restore
    /// every entry.
    fn search_dir(
        &mut self,
        root: TreeRoot,
        dir_objectid: u64,
        output_root: &FsPath,
        rel: &str,
    ) -> Result<()> {
        let start = Key::new(dir_objectid, ITEM_DIR_INDEX, 0);
        let mut iter = LeafIter::forward(&mut self.txn, root, &start)?;
        let mut loops = 0_u32;

        while let Some((key, data)) = iter.next_entry(&mut self.txn)? {
            if key.objectid != dir_objectid || key.item_type != ITEM_DIR_INDEX {
                break;
            }
            loops += 1;
            if loops >= LOOP_LIMIT {
                if !(self.decider)(rel) {
                    warn!(rel, "looping too long, abandoning directory");
                    break;
                }
                loops = 0;
            }

            let entries = parse_dir_items(&data)?;
            for entry in entries {
                let name = String::from_utf8_lossy(&entry.name).into_owned();
                let fs_name = if rel.is_empty() {
                    name.clone()
                } else {
                    format!("{rel}/{name}")
                };
                let path_name: PathBuf = output_root.join(&fs_name);

                match entry.file_type {
                    FT_REG_FILE => {
                        if !self.opts.overwrite && path_name.exists() {
                            info!(path = %path_name.display(), "skipping existing file");
                            self.summary.files_skipped += 1;
                            continue;
                        }
                        debug!(path = %path_name.display(), "restoring file");
                        let result = self.restore_file(
                            root,
                            entry.location.objectid,
                            &path_name,
                            &fs_name,
                        );
                        match result {
                            Ok(()) => {
                                self.summary.files_restored += 1;
                                loops = 0;
                            }
                            Err(err) if self.opts.ignore_errors => {
                                warn!(path = %path_name.display(), %err, "ignoring file error");
                                self.summary.errors_ignored += 1;
                            }
                            Err(err) => return Err(err),
                        }
                    }
                    FT_DIR => {
                        let mut search_root = root;
                        let mut child_dir = entry.location.objectid;
                        if entry.location.item_type == ITEM_ROOT_ITEM {
                            // A subvolume or snapshot. The index entry back
                            // to ourselves is skipped outright.
                            if entry.location.objectid == root.objectid {
                                continue;
                            }
                            // Snapshots carry a non-zero transid in the
                            // root item key offset.
                            if entry.location.offset != 0 && !self.opts.get_snapshots {
                                info!(name = %name, "skipping snapshot");
                                self.summary.snapshots_skipped += 1;
                                continue;
                            }
                            match self.read_fs_root(entry.location.objectid) {
                                Ok(subvol_root) => search_root = subvol_root,
                                Err(err) if self.opts.ignore_errors => {
                                    warn!(name = %name, %err, "ignoring unreadable subvolume");
                                    self.summary.errors_ignored += 1;
                                    continue;
                                }
                                Err(err) => return Err(err),
                            }
                            child_dir = FIRST_FREE_OBJECTID;
                        }

                        debug!(path = %path_name.display(), "restoring directory");
                        match std::fs::create_dir(&path_name) {
                            Ok(()) => self.summary.dirs_created += 1,
                            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                            Err(err) if self.opts.ignore_errors => {
                                warn!(path = %path_name.display(), %err, "ignoring mkdir error");
                                self.summary.errors_ignored += 1;
                                continue;
                            }
                            Err(err) => return Err(err.into()),
                        }
                        loops = 0;
                        let result =
                            self.search_dir(search_root, child_dir, output_root, &fs_name);
                        match result {
                            Ok(()) => {}
                            Err(err) if self.opts.ignore_errors => {
                                warn!(path = %path_name.display(), %err, "ignoring directory error");
                                self.summary.errors_ignored += 1;
                            }
                            Err(err) => return Err(err),
                        }
                    }
                    // Symlinks, devices, fifos and sockets are not restored.
                    _ => {}
                }
            }
        }
        debug!(rel, "directory done");
        Ok(())
    }

    /// Restore one regular file's contents, truncating to the declared
    /// inode size at the end.
    fn restore_file(
        &mut self,
        root: TreeRoot,
        ino: u64,
        path_name: &FsPath,
        fs_name: &str,
    ) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path_name)?;

        // The declared size bounds the final truncate.
        let mut found_size = 0_u64;
        {
            let mut search_root = root;
            let mut path = Path::new();
            let key = Key::new(ino, ITEM_INODE_ITEM, 0);
            if self
                .txn
                .search_slot(&mut search_root, &key, &mut path, 0, false)?
            {
                if let Some((_, data)) = self.txn.current_item(&path)? {
                    found_size = parse_inode_item(&data)?.size;
                }
            }
        }

        let start = Key::new(ino, ITEM_EXTENT_DATA, 0);
        let mut iter = LeafIter::forward(&mut self.txn, root, &start)?;
        let mut loops = 0_u32;
        while let Some((key, data)) = iter.next_entry(&mut self.txn)? {
            if key.objectid != ino || key.item_type != ITEM_EXTENT_DATA {
                break;
            }
            loops += 1;
            if loops >= LOOP_LIMIT {
                if !(self.decider)(fs_name) {
                    warn!(fs_name, "looping too long, abandoning file");
                    break;
                }
                loops = 0;
            }

            let extent = parse_file_extent(&data)?;
            if extent.compression() >= COMPRESS_LAST {
                return Err(SfsError::Unsupported(format!(
                    "compression type {} not supported",
                    extent.compression()
                )));
            }
            match extent {
                FileExtent::Inline {
                    ram_bytes,
                    compression,
                    data: inline,
                    ..
                } => {
                    self.copy_one_inline(&mut file, compression, &inline, ram_bytes, key.offset)?;
                }
                FileExtent::Regular {
                    extent_type,
                    compression,
                    disk_bytenr,
                    disk_num_bytes,
                    ram_bytes,
                    ..
                } => {
                    if extent_type == FILE_EXTENT_PREALLOC {
                        continue;
                    }
                    self.copy_one_extent(
                        &mut file,
                        compression,
                        disk_bytenr,
                        disk_num_bytes,
                        ram_bytes,
                        key.offset,
                    )?;
                }
            }
        }

        if found_size > 0 {
            file.set_len(found_size)?;
        }
        file.flush()?;
        Ok(())
    }

    /// Inline extents live in the leaf payload; decompress if needed and
    /// write at the file offset.
    fn copy_one_inline(
        &mut self,
        file: &mut File,
        compression: u8,
        inline: &[u8],
        ram_bytes: u64,
        pos: u64,
    ) -> Result<()> {
        let bytes = if compression == COMPRESS_NONE {
            inline.to_vec()
        } else {
            compress::decompress(compression, inline, ram_bytes as usize)?
        };
        write_at(file, pos, &bytes)
    }

    /// Regular extents are read from disk with whole-extent retry across
    /// mirrors on short reads or decompression failure.
    fn copy_one_extent(
        &mut self,
        file: &mut File,
        compression: u8,
        disk_bytenr: u64,
        disk_num_bytes: u64,
        ram_bytes: u64,
        pos: u64,
    ) -> Result<()> {
        // A hole.
        if disk_bytenr == 0 || disk_num_bytes == 0 {
            return Ok(());
        }

        let copies = self.fs.chunks.num_copies(disk_bytenr).max(1);
        let mut last_err: Option<SfsError> = None;
        for mirror in 0..copies {
            let raw = match self
                .fs
                .read_data(disk_bytenr, disk_num_bytes as usize, mirror)
            {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(disk_bytenr, mirror, "extent read failed, trying another mirror");
                    last_err = Some(err);
                    continue;
                }
            };
            let bytes = if compression == COMPRESS_NONE {
                raw
            } else {
                match compress::decompress(compression, &raw, ram_bytes as usize) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(disk_bytenr, mirror, "decompression failed, trying another mirror");
                        last_err = Some(err);
                        continue;
                    }
                }
            };
            return write_at(file, pos, &bytes);
        }
        Err(last_err.unwrap_or(SfsError::MirrorsExhausted {
            bytenr: disk_bytenr,
            mirrors: copies,
        }))
    }
}

fn write_at(file: &mut File, pos: u64, bytes: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(pos))?;
    file.write_all(bytes)?;
    Ok(())
}

/// Non-interactive loop decision: always abandon (used by tests and
/// non-tty runs).
#[must_use]
pub fn abort_on_loop<'a>() -> Box<dyn FnMut(&str) -> bool + 'a> {
    Box::new(|_| false)
}
