//! Whole-forest block scan populating the extent reconciler.
//!
//! Every tree reachable from the superblock is visited block by block,
//! breadth-ordered with a locality-aware pending queue. Each block's
//! structure is validated, its items feed the declared/walked backref
//! populations, and interior pointers enqueue children.

use crate::extents::{
    add_extent_rec, add_tree_backref, is_extent_tree_record, maybe_free_extent_rec,
    process_extent_item, process_file_extent_ref, process_standalone_ref, Backref, BackrefLink,
    ExtentCache,
};
use crate::{CheckCtx, RunStats};
use sfs_error::Result;
use sfs_ondisk::{check_leaf, check_node, parse_block_group_item, parse_root_item, BlockGroupItem};
use sfs_types::{
    header_backref_rev, is_fs_tree_objectid, Key, BLOCK_FLAG_FULL_BACKREF, EXTENT_TREE_OBJECTID,
    HEADER_FLAG_RELOC, ITEM_BLOCK_GROUP_ITEM, ITEM_EXTENT_CSUM, ITEM_EXTENT_DATA,
    ITEM_EXTENT_ITEM, ITEM_METADATA_ITEM, ITEM_ROOT_ITEM, MIXED_BACKREF_REV,
    TREE_RELOC_OBJECTID,
};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// A block that failed structural validation, kept for pruning under repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorruptBlock {
    pub bytenr: u64,
    pub size: u64,
    pub level: u8,
    /// Parent key recorded for the block, used to find the pointer to prune.
    pub key: Key,
}

pub type CorruptBlocks = BTreeMap<u64, CorruptBlock>;

/// One block group item found during the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGroup {
    pub start: u64,
    pub length: u64,
    pub item: BlockGroupItem,
}

pub type BlockGroups = BTreeMap<u64, BlockGroup>;

/// Everything the extent scan accumulates.
#[derive(Debug, Default)]
pub struct ScanState {
    pub extent_cache: ExtentCache,
    pub corrupt_blocks: CorruptBlocks,
    pub block_groups: BlockGroups,
    pub stats: RunStats,
    pub seen: BTreeMap<u64, u64>,
    pending: BTreeMap<u64, u64>,
    reada: BTreeMap<u64, u64>,
    nodes: BTreeMap<u64, u64>,
    last: u64,
}

const SCAN_BATCH: usize = 64;
const LOCALITY_WINDOW: u64 = 32 * 1024;

impl ScanState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn add_pending(&mut self, interior: bool, bytenr: u64, size: u64) {
        if self.seen.insert(bytenr, size).is_some() {
            return;
        }
        if interior {
            self.nodes.insert(bytenr, size);
        } else {
            self.pending.insert(bytenr, size);
        }
    }

    /// Pick the next batch of blocks, preferring previously read-ahead
    /// blocks, then interior nodes near the last position, then leaves.
    fn pick_next_pending(&mut self) -> Vec<(u64, u64)> {
        if let Some((&start, &size)) = self.reada.iter().next() {
            return vec![(start, size)];
        }

        let node_start = self.last.saturating_sub(LOCALITY_WINDOW);
        let mut batch: Vec<(u64, u64)> = self
            .nodes
            .range(node_start..)
            .take(SCAN_BATCH)
            .map(|(&s, &z)| (s, z))
            .collect();
        if batch.is_empty() {
            batch = self
                .nodes
                .iter()
                .take(SCAN_BATCH)
                .map(|(&s, &z)| (s, z))
                .collect();
        }
        if batch.is_empty() {
            batch = self
                .pending
                .iter()
                .take(SCAN_BATCH)
                .map(|(&s, &z)| (s, z))
                .collect();
            return batch;
        }

        // Extend with pending leaves adjacent to the batch head.
        if batch.len() < SCAN_BATCH {
            let mut lookup = batch[0].0 + batch[0].1;
            let extra: Vec<(u64, u64)> = self
                .pending
                .range(lookup..)
                .take(SCAN_BATCH - batch.len())
                .map(|(&s, &z)| (s, z))
                .collect();
            for (start, size) in extra {
                if start.saturating_sub(lookup) > LOCALITY_WINDOW {
                    break;
                }
                batch.push((start, size));
                lookup = start + size;
            }
        }
        batch
    }

    fn remove_everywhere(&mut self, bytenr: u64) {
        self.pending.remove(&bytenr);
        self.reada.remove(&bytenr);
        self.nodes.remove(&bytenr);
    }
}

/// Seed the scan with one tree root block.
pub fn add_root_to_pending(
    ctx: &mut CheckCtx<'_>,
    state: &mut ScanState,
    bytenr: u64,
    root_objectid: u64,
) -> Result<()> {
    let nodesize = ctx.nodesize;
    let block = ctx.txn.block(bytenr)?;
    let level = block.level();
    let backref_rev = header_backref_rev(block.flags());
    state.add_pending(level > 0, bytenr, nodesize);
    add_extent_rec(
        &mut state.extent_cache,
        None,
        bytenr,
        nodesize,
        0,
        true,
        true,
        false,
        true,
        false,
        nodesize,
        &mut state.stats,
    );

    if root_objectid == TREE_RELOC_OBJECTID || backref_rev < MIXED_BACKREF_REV {
        add_tree_backref(
            &mut state.extent_cache,
            bytenr,
            bytenr,
            0,
            true,
            &mut state.stats,
        );
    } else {
        add_tree_backref(
            &mut state.extent_cache,
            bytenr,
            0,
            root_objectid,
            true,
            &mut state.stats,
        );
    }
    Ok(())
}

/// Check that a tree block's declared owner still references it: either a
/// walked non-full tree backref names the owner, or the owner tree can be
/// descended to this very block.
fn check_owner_ref(ctx: &mut CheckCtx<'_>, state: &mut ScanState, bytenr: u64) -> Result<bool> {
    let (owner, level, first_key) = {
        let Some(rec) = state.extent_cache.find(bytenr) else {
            return Ok(true);
        };
        if rec.is_root {
            return Ok(true);
        }
        let mut owner_named = false;
        for backref in &rec.backrefs {
            if let Backref::Tree(t) = backref {
                if !t.found_ref {
                    continue;
                }
                if let BackrefLink::Root(root) = t.link {
                    let block = ctx.txn.block(bytenr)?;
                    if block.owner() == root {
                        owner_named = true;
                        break;
                    }
                }
            }
        }
        if owner_named {
            return Ok(true);
        }
        let block = ctx.txn.block(bytenr)?;
        (block.owner(), block.level(), block.first_key())
    };

    // Fall back to descending the owner tree to this block.
    let Some(item) = ctx.read_root_item(owner)? else {
        return Ok(false);
    };
    let Some(key) = first_key else {
        return Ok(false);
    };
    let mut owner_root = sfs_tree::TreeRoot::from_root_item(owner, &item);
    let mut path = sfs_tree::Path::new();
    path.lowest_level = level as usize + 1;
    if (owner_root.level as usize) < path.lowest_level {
        return Ok(false);
    }
    ctx.txn.search_slot(&mut owner_root, &key, &mut path, 0, false)?;
    let parent_bytenr = path.nodes[level as usize + 1];
    if parent_bytenr == 0 {
        return Ok(false);
    }
    let parent = ctx.txn.block(parent_bytenr)?;
    let slot = path.slots[level as usize + 1];
    Ok(slot < parent.nritems() && parent.node_blockptr(slot) == bytenr)
}

/// Validate one block and update its extent record; returns false when the
/// block is corrupt (recorded for pruning).
fn check_block(
    ctx: &mut CheckCtx<'_>,
    state: &mut ScanState,
    bytenr: u64,
    size: u64,
    flags: u64,
) -> Result<bool> {
    let block = ctx.txn.block(bytenr)?.clone();
    let parent_key = {
        let Some(rec) = state.extent_cache.find(bytenr) else {
            return Ok(true);
        };
        rec.generation = block.generation();
        if block.nritems() > 0 {
            rec.info_objectid = block
                .first_key()
                .map_or(0, |key| key.objectid);
        }
        rec.info_level = block.level();
        rec.parent_key
    };

    let structure = if block.is_leaf() {
        check_leaf(&block, parent_key.as_ref())
    } else {
        check_node(&block, parent_key.as_ref())
    };
    if let Err(err) = structure {
        warn!(bytenr, %err, "bad block");
        let is_extent_rec = state
            .extent_cache
            .find(bytenr)
            .is_some_and(|rec| is_extent_tree_record(rec));
        state.corrupt_blocks.insert(
            bytenr,
            CorruptBlock {
                bytenr,
                size,
                level: block.level(),
                key: parent_key.unwrap_or(Key::MIN),
            },
        );
        let _ = is_extent_rec;
        return Ok(false);
    }

    {
        let rec = state.extent_cache.find(bytenr).expect("checked above");
        rec.content_checked = true;
    }
    if flags & BLOCK_FLAG_FULL_BACKREF != 0 {
        let rec = state.extent_cache.find(bytenr).expect("checked above");
        rec.owner_ref_checked = true;
    } else if check_owner_ref(ctx, state, bytenr)? {
        let rec = state.extent_cache.find(bytenr).expect("checked above");
        rec.owner_ref_checked = true;
    }
    maybe_free_extent_rec(&mut state.extent_cache, bytenr);
    Ok(true)
}

/// Process the next pending block. Returns false when the queue is empty.
pub fn run_next_block(ctx: &mut CheckCtx<'_>, state: &mut ScanState) -> Result<bool> {
    let batch = state.pick_next_pending();
    let Some(&(bytenr, size)) = batch.first() else {
        return Ok(false);
    };
    if state.reada.remove(&bytenr).is_none() {
        // Issue readahead for the rest of the batch.
        for &(start, len) in batch.iter().skip(1) {
            state.reada.insert(start, len);
            ctx.txn.readahead(start);
        }
    }
    state.last = bytenr;
    state.remove_everywhere(bytenr);

    let block = match ctx.txn.block(bytenr) {
        Ok(block) => block.clone(),
        Err(err) => {
            warn!(bytenr, %err, "unreadable tree block");
            let parent_key = state
                .extent_cache
                .find(bytenr)
                .filter(|rec| is_extent_tree_record(rec))
                .and_then(|rec| rec.parent_key);
            if let Some(key) = parent_key {
                state.corrupt_blocks.insert(
                    bytenr,
                    CorruptBlock {
                        bytenr,
                        size,
                        level: 0,
                        key,
                    },
                );
            }
            return Ok(true);
        }
    };

    let flags = match ctx.txn.lookup_extent_info(bytenr, block.level())? {
        Some((_, flags)) => flags,
        None => BLOCK_FLAG_FULL_BACKREF,
    };
    let (parent, owner) = if flags & BLOCK_FLAG_FULL_BACKREF != 0 {
        (bytenr, 0)
    } else {
        (0, block.owner())
    };

    if !check_block(ctx, state, bytenr, size, flags)? {
        return Ok(true);
    }

    if block.is_leaf() {
        state.stats.btree_space_waste += block.leaf_free_space() as u64;
        for slot in 0..block.nritems() {
            let key = block.item_key(slot);
            match key.item_type {
                ITEM_EXTENT_ITEM | ITEM_METADATA_ITEM => {
                    process_extent_item(
                        &mut state.extent_cache,
                        &block,
                        slot,
                        ctx.nodesize,
                        &mut state.stats,
                    )?;
                }
                ITEM_EXTENT_CSUM => {
                    state.stats.total_csum_bytes += block.item_size(slot) as u64;
                }
                ITEM_BLOCK_GROUP_ITEM => {
                    let item = parse_block_group_item(block.item_data(slot))?;
                    state.block_groups.insert(
                        key.objectid,
                        BlockGroup {
                            start: key.objectid,
                            length: key.offset,
                            item,
                        },
                    );
                }
                ITEM_EXTENT_DATA => {
                    process_file_extent_ref(
                        &mut state.extent_cache,
                        &block,
                        slot,
                        parent,
                        owner,
                        &mut state.stats,
                    )?;
                }
                _ => {
                    process_standalone_ref(
                        &mut state.extent_cache,
                        &block,
                        slot,
                        ctx.sectorsize,
                        &mut state.stats,
                    )?;
                }
            }
        }
    } else {
        let level = block.level();
        for slot in 0..block.nritems() {
            let ptr = block.node_blockptr(slot);
            let ptr_key = block.node_key(slot);
            add_extent_rec(
                &mut state.extent_cache,
                Some(&ptr_key),
                ptr,
                ctx.nodesize,
                0,
                false,
                true,
                false,
                true,
                false,
                ctx.nodesize,
                &mut state.stats,
            );
            add_tree_backref(
                &mut state.extent_cache,
                ptr,
                parent,
                owner,
                true,
                &mut state.stats,
            );
            state.add_pending(level > 1, ptr, ctx.nodesize);
        }
        let waste_slots = block.max_ptrs() - block.nritems();
        state.stats.btree_space_waste +=
            (waste_slots * sfs_ondisk::KEY_PTR_SIZE) as u64;
    }

    state.stats.total_btree_bytes += size;
    if is_fs_tree_objectid(block.owner()) {
        state.stats.total_fs_tree_bytes += size;
    }
    if block.owner() == EXTENT_TREE_OBJECTID {
        state.stats.total_extent_tree_bytes += size;
    }
    // A reloc-owned block stamped with the current revision but missing the
    // RELOC flag is the short-lived transition format, which is fatal.
    if !state.stats.found_old_backref
        && block.owner() == TREE_RELOC_OBJECTID
        && header_backref_rev(block.flags()) == MIXED_BACKREF_REV
        && block.flags() & HEADER_FLAG_RELOC == 0
    {
        state.stats.found_old_backref = true;
    }
    Ok(true)
}

/// Scan every tree reachable from the superblock, populating the extent
/// reconciler.
pub fn scan_extents(ctx: &mut CheckCtx<'_>) -> Result<ScanState> {
    let mut state = ScanState::new();

    let tree_root = ctx.tree_root;
    ctx.txn.read_block(tree_root.bytenr, 0)?;
    add_root_to_pending(ctx, &mut state, tree_root.bytenr, tree_root.objectid)?;
    if ctx.chunk_root_bytenr != 0 {
        ctx.txn.read_block(ctx.chunk_root_bytenr, 0)?;
        add_root_to_pending(
            ctx,
            &mut state,
            ctx.chunk_root_bytenr,
            sfs_types::CHUNK_TREE_OBJECTID,
        )?;
    }

    // Every root item in the root tree seeds another tree.
    let mut iter = sfs_tree::LeafIter::forward(&mut ctx.txn, tree_root, &Key::MIN)?;
    let mut roots = Vec::new();
    while let Some((key, data)) = iter.next_entry(&mut ctx.txn)? {
        if key.item_type != ITEM_ROOT_ITEM {
            continue;
        }
        match parse_root_item(&data) {
            Ok(item) => roots.push((key.objectid, item.bytenr)),
            Err(err) => warn!(objectid = key.objectid, %err, "skipping unreadable root item"),
        }
    }
    for (objectid, bytenr) in roots {
        if let Err(err) = ctx.txn.read_block(bytenr, 0) {
            warn!(objectid, bytenr, %err, "unreadable tree root block");
            continue;
        }
        add_root_to_pending(ctx, &mut state, bytenr, objectid)?;
    }

    while run_next_block(ctx, &mut state)? {}
    debug!(
        records = state.extent_cache.len(),
        corrupt = state.corrupt_blocks.len(),
        block_groups = state.block_groups.len(),
        "extent scan complete"
    );
    Ok(state)
}
