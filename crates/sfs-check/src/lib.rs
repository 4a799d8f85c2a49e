#![forbid(unsafe_code)]
//! Offline consistency checker.
//!
//! `run_check` walks every B+-tree reachable from the superblock, verifies
//! that extent-allocation records, back-references, inode/directory
//! metadata, checksums, and the free-space cache are mutually consistent,
//! and optionally repairs extent-tree mismatches by rewriting the tree from
//! the reconciled backrefs.

pub mod csum;
pub mod extents;
pub mod fsroot;
pub mod ino;
pub mod repair;
pub mod roots;
pub mod scan;
pub mod shared;
pub mod space;

use serde::Serialize;
use sfs_block::FsInfo;
use sfs_error::{Result, SfsError};
use sfs_ondisk::{encode_superblock, parse_root_item, RootItem};
use sfs_tree::{BumpAllocator, LeafIter, Path, TreeRoot, TreeTxn};
use sfs_types::{
    sb_offset, Key, CSUM_TREE_OBJECTID, EXTENT_CSUM_OBJECTID, EXTENT_TREE_OBJECTID,
    FREE_SPACE_TREE_OBJECTID, ITEM_EXTENT_CSUM, ITEM_ORPHAN_ITEM, ITEM_ROOT_BACKREF,
    ITEM_ROOT_ITEM, ITEM_ROOT_REF, ORPHAN_OBJECTID, ROOT_TREE_OBJECTID, SUPER_INFO_SIZE,
    SUPER_MIRROR_MAX,
};
use tracing::{debug, info, warn};

// ── Run statistics ──────────────────────────────────────────────────────────

/// Counters accumulated over one check invocation, printed once at the end.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RunStats {
    pub bytes_used: u64,
    pub total_csum_bytes: u64,
    pub total_btree_bytes: u64,
    pub total_fs_tree_bytes: u64,
    pub total_extent_tree_bytes: u64,
    pub btree_space_waste: u64,
    pub data_bytes_allocated: u64,
    pub data_bytes_referenced: u64,
    /// The short-lived mixed-backref transition format was found; the
    /// filesystem cannot be supported read-write.
    pub found_old_backref: bool,
}

// ── Check context ───────────────────────────────────────────────────────────

/// Everything one check phase needs: the transaction, the well-known roots,
/// and the geometry of the filesystem.
pub struct CheckCtx<'a> {
    pub txn: TreeTxn<'a>,
    pub tree_root: TreeRoot,
    pub extent_root: Option<TreeRoot>,
    pub csum_root: Option<TreeRoot>,
    pub free_space_root: Option<TreeRoot>,
    pub chunk_root_bytenr: u64,
    pub sectorsize: u64,
    pub nodesize: u64,
    pub csum_size: usize,
    pub sb_generation: u64,
    pub sb_cache_generation: u64,
    /// Alloc/free events carried between repair steps until the extent tree
    /// items for them are materialised (see `repair::settle_allocations`).
    pub carry_events: Vec<sfs_tree::RefEvent>,
    fs: &'a FsInfo,
}

impl<'a> CheckCtx<'a> {
    /// Build a context over `txn`, resolving the well-known roots from the
    /// root tree. The tree, chunk, and extent roots must be readable.
    pub fn new(fs: &'a FsInfo, txn: TreeTxn<'a>, tree_root: TreeRoot) -> Result<Self> {
        let mut ctx = Self {
            txn,
            tree_root,
            extent_root: None,
            csum_root: None,
            free_space_root: None,
            chunk_root_bytenr: fs.sb.chunk_root,
            sectorsize: u64::from(fs.sectorsize()),
            nodesize: u64::from(fs.nodesize()),
            csum_size: fs.csum_size(),
            sb_generation: fs.sb.generation,
            sb_cache_generation: fs.sb.cache_generation,
            carry_events: Vec::new(),
            fs,
        };

        // Critical roots: refuse to check a filesystem whose spine is gone.
        ctx.txn.read_block(ctx.tree_root.bytenr, 0)?;
        if ctx.chunk_root_bytenr != 0 {
            ctx.txn.read_block(ctx.chunk_root_bytenr, 0)?;
        }

        ctx.extent_root = ctx.read_tree_root(EXTENT_TREE_OBJECTID)?;
        if let Some(extent_root) = ctx.extent_root {
            ctx.txn.read_block(extent_root.bytenr, 0)?;
            ctx.txn.set_extent_root(extent_root);
        } else {
            return Err(SfsError::Format(
                "extent tree root missing; critical roots corrupted".into(),
            ));
        }
        ctx.csum_root = ctx.read_tree_root(CSUM_TREE_OBJECTID)?;
        if ctx.csum_root.is_none() {
            warn!("checksum tree root missing");
        }
        ctx.free_space_root = ctx.read_tree_root(FREE_SPACE_TREE_OBJECTID)?;
        Ok(ctx)
    }

    /// Highest-offset ROOT_ITEM for `objectid` in the root tree.
    pub fn read_root_item(&mut self, objectid: u64) -> Result<Option<RootItem>> {
        let probe = Key::new(objectid, ITEM_ROOT_ITEM, u64::MAX);
        let mut iter = LeafIter::backward(&mut self.txn, self.tree_root, &probe)?;
        let Some((key, data)) = iter.next_entry(&mut self.txn)? else {
            return Ok(None);
        };
        if key.objectid != objectid || key.item_type != ITEM_ROOT_ITEM {
            return Ok(None);
        }
        Ok(Some(parse_root_item(&data)?))
    }

    fn read_tree_root(&mut self, objectid: u64) -> Result<Option<TreeRoot>> {
        Ok(self
            .read_root_item(objectid)?
            .map(|item| TreeRoot::from_root_item(objectid, &item)))
    }

    /// Walked refcount of a tree block, from the extent tree. Unknown
    /// blocks answer 1 (never shared).
    pub fn block_refs(&mut self, bytenr: u64, level: u8) -> Result<u64> {
        Ok(self
            .txn
            .lookup_extent_info(bytenr, level)?
            .map_or(1, |(refs, _)| refs))
    }

    /// Does `root` carry an orphan item for `objectid`?
    pub fn has_orphan_item(&mut self, root: &TreeRoot, objectid: u64) -> Result<bool> {
        let key = Key::new(ORPHAN_OBJECTID, ITEM_ORPHAN_ITEM, objectid);
        let mut search_root = *root;
        let mut path = Path::new();
        self.txn.search_slot(&mut search_root, &key, &mut path, 0, false)
    }

    /// Does the root tree confirm `child` hangs under `parent`? Forward
    /// refs answer directly; otherwise the child's backrefs decide. A child
    /// with no recorded parent at all is treated as belonging to the caller
    /// so its missing refs get reported.
    pub fn is_child_root(&mut self, parent: u64, child: u64) -> Result<bool> {
        let mut tree_root = self.tree_root;
        let mut path = Path::new();
        let key = Key::new(parent, ITEM_ROOT_REF, child);
        if self.txn.search_slot(&mut tree_root, &key, &mut path, 0, false)? {
            return Ok(true);
        }
        path.release();

        let probe = Key::new(child, ITEM_ROOT_BACKREF, 0);
        let mut has_parent = false;
        let mut iter = LeafIter::forward(&mut self.txn, tree_root, &probe)?;
        while let Some((key, _)) = iter.next_entry(&mut self.txn)? {
            if key.objectid != child || key.item_type != ITEM_ROOT_BACKREF {
                break;
            }
            has_parent = true;
            if key.offset == parent {
                return Ok(true);
            }
        }
        Ok(!has_parent)
    }

    /// Checksummed bytes found within `[start, start + len)`.
    pub fn count_csum_range(&mut self, mut start: u64, mut len: u64) -> Result<u64> {
        let Some(csum_root) = self.csum_root else {
            return Ok(0);
        };
        let csum_size = self.csum_size as u64;
        let sectorsize = self.sectorsize;
        let mut found = 0_u64;

        let probe = Key::new(EXTENT_CSUM_OBJECTID, ITEM_EXTENT_CSUM, start);
        let mut path = Path::new();
        let mut root = csum_root;
        let exact = self.txn.search_slot(&mut root, &probe, &mut path, 0, false)?;
        if !exact && path.slots[0] > 0 {
            // The covering csum item may begin before `start`.
            let prev = {
                let leaf = self.txn.block(path.nodes[0])?;
                leaf.item_key(path.slots[0] - 1)
            };
            if prev.objectid == EXTENT_CSUM_OBJECTID && prev.item_type == ITEM_EXTENT_CSUM {
                path.slots[0] -= 1;
            }
        }

        while len > 0 {
            let nritems = self.txn.block(path.nodes[0])?.nritems();
            if path.slots[0] >= nritems {
                if !self.txn.next_leaf(&root, &mut path)? {
                    break;
                }
                continue;
            }
            let (key, size) = {
                let leaf = self.txn.block(path.nodes[0])?;
                (
                    leaf.item_key(path.slots[0]),
                    leaf.item_size(path.slots[0]) as u64,
                )
            };
            if key.objectid != EXTENT_CSUM_OBJECTID || key.item_type != ITEM_EXTENT_CSUM {
                break;
            }
            if key.offset >= start + len {
                break;
            }
            if key.offset > start {
                start = key.offset;
            }
            let csum_end = key.offset + (size / csum_size) * sectorsize;
            if csum_end > start {
                let covered = (csum_end - start).min(len);
                len -= covered;
                start += covered;
                found += covered;
            }
            path.slots[0] += 1;
        }
        Ok(found)
    }

    /// Superblock copies overlapping `[start, start + len)` in logical
    /// space, for the free-space sweep.
    #[must_use]
    pub fn sb_ranges_within(&self, start: u64, len: u64) -> Vec<(u64, u64)> {
        self.fs.chunks.sb_ranges_within(start, len)
    }

    /// Rewrite the ROOT_ITEM for `objectid` after its tree moved.
    pub fn update_root_item(&mut self, objectid: u64, handle: &TreeRoot) -> Result<()> {
        let probe = Key::new(objectid, ITEM_ROOT_ITEM, u64::MAX);
        let found_key = {
            let mut iter = LeafIter::backward(&mut self.txn, self.tree_root, &probe)?;
            match iter.next_entry(&mut self.txn)? {
                Some((key, _)) if key.objectid == objectid && key.item_type == ITEM_ROOT_ITEM => {
                    key
                }
                _ => return Err(SfsError::NotFound(format!("root item for {objectid}"))),
            }
        };

        let mut tree_root = self.tree_root;
        let mut path = Path::new();
        let found = self
            .txn
            .search_slot(&mut tree_root, &found_key, &mut path, 0, true)?;
        if !found {
            return Err(SfsError::NotFound(format!("root item for {objectid}")));
        }
        let slot = path.slots[0];
        let transid = self.txn.transid;
        let leaf = self.txn.block_mut(path.nodes[0])?;
        let mut item = parse_root_item(leaf.item_data(slot))?;
        item.bytenr = handle.bytenr;
        item.level = handle.level;
        item.generation = transid;
        leaf.item_data_mut(slot)
            .copy_from_slice(&sfs_ondisk::encode_root_item(&item));
        self.tree_root = tree_root;
        Ok(())
    }
}

// ── Options & report ────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct CheckOptions {
    /// Rewrite broken extent records (opens the device read-write).
    pub repair: bool,
    /// Reset the checksum tree to empty and stop.
    pub init_csum_tree: bool,
    /// Accepted and reserved; the extent tree reinit path is intentionally
    /// not wired up.
    pub init_extent_tree: bool,
}

/// Outcome of a full check run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CheckReport {
    pub extent_mismatches: usize,
    pub extent_repaired: usize,
    pub space_cache_errors: Vec<u64>,
    pub space_cache_rebuilt: Vec<u64>,
    pub inode_problems: Vec<ino::InodeProblem>,
    pub csum_errors: usize,
    pub root_problems: Vec<roots::RootProblem>,
    pub found_old_backref: bool,
    pub repaired: bool,
    pub stats: RunStats,
}

impl CheckReport {
    /// True when any inconsistency (repaired or not) was found.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.extent_mismatches > 0
            || !self.space_cache_errors.is_empty()
            || !self.inode_problems.is_empty()
            || self.csum_errors > 0
            || !self.root_problems.is_empty()
            || self.found_old_backref
    }
}

// ── Driver ──────────────────────────────────────────────────────────────────

/// Read the committed superblock back off the device; a repair in this
/// process may have advanced it past the copy parsed at open time.
fn current_superblock(fs: &FsInfo) -> sfs_ondisk::Superblock {
    let mut region = vec![0_u8; SUPER_INFO_SIZE];
    if fs.device().read_at(sb_offset(0), &mut region).is_ok()
        && sfs_ondisk::Superblock::verify_csum(&region).is_ok()
    {
        if let Ok(sb) = sfs_ondisk::Superblock::parse_region(&region) {
            return sb;
        }
    }
    fs.sb.clone()
}

fn write_superblock(fs: &FsInfo, ctx: &CheckCtx<'_>, bytes_used: u64) -> Result<()> {
    let mut sb = current_superblock(fs);
    sb.root = ctx.tree_root.bytenr;
    sb.root_level = ctx.tree_root.level;
    sb.generation = ctx.txn.transid;
    sb.cache_generation = ctx.txn.transid;
    if bytes_used > 0 {
        sb.bytes_used = bytes_used;
    }
    let region = encode_superblock(&sb);
    for mirror in 0..SUPER_MIRROR_MAX {
        let offset = sb_offset(mirror);
        if offset + SUPER_INFO_SIZE as u64 <= sb.total_bytes {
            fs.device().write_at(offset, &region)?;
        }
    }
    info!(generation = sb.generation, root = sb.root, "superblock committed");
    Ok(())
}

/// Run the whole `check` pipeline over an opened filesystem.
pub fn run_check(fs: &FsInfo, opts: &CheckOptions) -> Result<CheckReport> {
    let mut report = CheckReport::default();
    let sb = current_superblock(fs);
    let tree_root = TreeRoot::new(ROOT_TREE_OBJECTID, sb.root, sb.root_level, sb.generation);

    if opts.init_extent_tree {
        warn!("--init-extent-tree is accepted but currently reserved");
    }

    // Reinitialising the csum tree replaces the whole run.
    if opts.init_csum_tree {
        let alloc = BumpAllocator::new(
            sfs_types::align_up(sb.total_bytes / 2, u64::from(fs.nodesize()))
                .unwrap_or(sb.total_bytes),
            sb.total_bytes,
        );
        let txn = TreeTxn::start(fs, sb.generation + 1, Box::new(alloc));
        let mut ctx = CheckCtx::new(fs, txn, tree_root)?;
        repair::reinit_csum_tree(&mut ctx)?;

        let mut cache = extents::ExtentCache::new();
        let mut bgs = scan::BlockGroups::new();
        let transid = ctx.txn.transid;
        for _ in 0..8 {
            repair::settle_allocations(&mut ctx, &mut cache, &mut bgs)?;
            let extent_before = ctx.extent_root;
            if let Some(csum_root) = ctx.csum_root.filter(|r| r.generation == transid) {
                ctx.update_root_item(CSUM_TREE_OBJECTID, &csum_root)?;
            }
            if let Some(extent_root) = ctx.extent_root.filter(|r| r.generation == transid) {
                ctx.update_root_item(EXTENT_TREE_OBJECTID, &extent_root)?;
            }
            repair::settle_allocations(&mut ctx, &mut cache, &mut bgs)?;
            if ctx.extent_root == extent_before {
                break;
            }
        }
        ctx.txn.commit()?;
        write_superblock(fs, &ctx, 0)?;
        report.repaired = true;
        return Ok(report);
    }

    // Phase 1: scan every tree, reconciling extents and backrefs.
    info!("checking extents");
    let ro_txn = TreeTxn::read_only(fs);
    let mut ctx = CheckCtx::new(fs, ro_txn, tree_root)?;
    ctx.sb_generation = sb.generation;
    ctx.sb_cache_generation = sb.cache_generation;
    let mut state = scan::scan_extents(&mut ctx)?;
    report.found_old_backref = state.stats.found_old_backref;

    if opts.repair {
        // Reopen as a write transaction whose allocator cannot touch any
        // byte range the scan reasoned about.
        let mut alloc_start = 0_u64;
        for (&bytenr, &size) in &state.seen {
            alloc_start = alloc_start.max(bytenr + size);
        }
        for (start, len) in state.extent_cache.starts() {
            alloc_start = alloc_start.max(start + len.max(1));
        }
        let alloc_start = sfs_types::align_up(alloc_start, u64::from(fs.nodesize()))
            .unwrap_or(sb.total_bytes);
        let mut alloc = BumpAllocator::new(alloc_start, sb.total_bytes);
        for (start, len) in state.extent_cache.starts() {
            alloc.pin_range(start, len);
        }
        for corrupt in state.corrupt_blocks.values() {
            alloc.pin_range(corrupt.bytenr, corrupt.size);
        }

        let txn = TreeTxn::start(fs, sb.generation + 1, Box::new(alloc));
        let mut wctx = CheckCtx::new(fs, txn, tree_root)?;
        wctx.sb_generation = sb.generation;
        wctx.sb_cache_generation = sb.cache_generation;

        let outcome = repair::check_extent_refs(
            &mut wctx,
            &mut state.extent_cache,
            &state.corrupt_blocks,
            &mut state.block_groups,
            true,
        )?;
        report.extent_mismatches = outcome.mismatched;
        report.extent_repaired = outcome.repaired;
        repair::settle_allocations(&mut wctx, &mut state.extent_cache, &mut state.block_groups)?;

        // Space cache verification against the repaired extent tree.
        info!("checking free space cache");
        let broken = space::check_space_cache(&mut wctx, &state.block_groups)?;
        report.space_cache_errors = broken.clone();

        // Commit: rebuild the broken caches and the block accounting, point
        // the root items at the moved roots, and settle until the forest
        // stops moving. Every step can itself allocate or free blocks, so
        // the whole sequence iterates to a fixed point.
        let mut bytes_used = 0_u64;
        let mut converged = false;
        for _ in 0..12 {
            let mut moved = false;
            for &bg_start in &broken {
                let bg = state.block_groups[&bg_start];
                space::rebuild_space_cache(&mut wctx, bg.start, bg.length)?;
            }
            moved |= repair::settle_allocations(
                &mut wctx,
                &mut state.extent_cache,
                &mut state.block_groups,
            )?;
            bytes_used = repair::rebuild_block_accounting(&mut wctx, &state.block_groups)?;
            moved |= repair::settle_allocations(
                &mut wctx,
                &mut state.extent_cache,
                &mut state.block_groups,
            )?;

            let extent_before = wctx.extent_root;
            let free_space_before = wctx.free_space_root;
            let transid = wctx.txn.transid;
            // Only roots COW-ed in this transaction moved.
            if let Some(extent_root) = wctx.extent_root.filter(|r| r.generation == transid) {
                wctx.update_root_item(EXTENT_TREE_OBJECTID, &extent_root)?;
            }
            if let Some(free_space_root) =
                wctx.free_space_root.filter(|r| r.generation == transid)
            {
                wctx.update_root_item(FREE_SPACE_TREE_OBJECTID, &free_space_root)?;
            }
            if let Some(csum_root) = wctx.csum_root.filter(|r| r.generation == transid) {
                wctx.update_root_item(CSUM_TREE_OBJECTID, &csum_root)?;
            }
            moved |= repair::settle_allocations(
                &mut wctx,
                &mut state.extent_cache,
                &mut state.block_groups,
            )?;
            if !moved
                && wctx.extent_root == extent_before
                && wctx.free_space_root == free_space_before
            {
                converged = true;
                break;
            }
        }
        if !converged {
            return Err(SfsError::RepairFailed(
                "repair bookkeeping did not converge during commit".into(),
            ));
        }
        report.space_cache_rebuilt = broken;
        wctx.txn.commit()?;
        write_superblock(fs, &wctx, bytes_used)?;
        report.repaired = true;

        // Later phases read the repaired trees.
        let txn = TreeTxn::read_only(fs);
        ctx = CheckCtx::new(fs, txn, wctx.tree_root)?;
        ctx.sb_generation = wctx.txn.transid;
        ctx.sb_cache_generation = wctx.txn.transid;
    } else {
        let outcome = repair::check_extent_refs(
            &mut ctx,
            &mut state.extent_cache,
            &state.corrupt_blocks,
            &mut state.block_groups,
            false,
        )?;
        report.extent_mismatches = outcome.mismatched;

        info!("checking free space cache");
        report.space_cache_errors = space::check_space_cache(&mut ctx, &state.block_groups)?;
    }

    info!("checking fs roots");
    let mut root_cache = roots::RootCache::new();
    report.inode_problems = fsroot::check_fs_roots(&mut ctx, &mut root_cache)?;

    info!("checking csums");
    report.csum_errors = csum::check_csums(&mut ctx)?;

    info!("checking root refs");
    let tree_root_handle = ctx.tree_root;
    report.root_problems = roots::check_root_refs(&mut root_cache, |objectid| {
        let key = Key::new(ORPHAN_OBJECTID, ITEM_ORPHAN_ITEM, objectid);
        let mut root = tree_root_handle;
        let mut path = Path::new();
        ctx.txn.search_slot(&mut root, &key, &mut path, 0, false)
    })?;

    report.stats = state.stats;
    debug!(errors = report.has_errors(), "check complete");
    Ok(report)
}
