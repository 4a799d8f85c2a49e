//! Extent-tree repair: prune corrupt blocks, delete every record for a
//! broken extent's byte range, and re-create a canonical item set from the
//! reconciled backrefs.
//!
//! Repair runs inside one write transaction. Any failed step aborts the
//! whole run without committing; a half-rewritten extent tree is worse
//! than the original damage.

use crate::extents::{
    apply_ref_event, backpointer_problems, Backref, BackrefLink, ExtentCache, ExtentRecord,
};
use crate::scan::{BlockGroups, CorruptBlocks};
use crate::CheckCtx;
use sfs_error::{Result, SfsError};
use sfs_ondisk::{
    encode_extent_data_ref, encode_shared_data_ref, is_extent_ref_type, parse_extent_data_ref,
    parse_extent_item, parse_shared_data_ref, ExtentDataRef, ExtentItem,
};
use sfs_tree::Path;
use sfs_types::{
    Key, BLOCK_FLAG_FULL_BACKREF, EXTENT_FLAG_DATA, EXTENT_FLAG_TREE_BLOCK,
    FIRST_FREE_OBJECTID, ITEM_BLOCK_GROUP_ITEM, ITEM_EXTENT_DATA_REF, ITEM_EXTENT_ITEM,
    ITEM_METADATA_ITEM, ITEM_SHARED_BLOCK_REF, ITEM_SHARED_DATA_REF, ITEM_TREE_BLOCK_REF,
};
use tracing::{info, warn};

/// Key offset for an EXTENT_DATA_REF item: a stable hash of the referencing
/// (root, objectid, offset) triple.
#[must_use]
pub fn hash_extent_data_ref(root: u64, objectid: u64, offset: u64) -> u64 {
    let mut buf = [0_u8; 24];
    buf[0..8].copy_from_slice(&root.to_le_bytes());
    buf[8..16].copy_from_slice(&objectid.to_le_bytes());
    buf[16..24].copy_from_slice(&offset.to_le_bytes());
    u64::from(crc32c::crc32c(&buf))
}

/// Delete the parent pointer of one corrupt block from the extent tree.
fn prune_one_block(ctx: &mut CheckCtx<'_>, corrupt: &crate::scan::CorruptBlock) -> Result<()> {
    let Some(mut extent_root) = ctx.extent_root else {
        return Ok(());
    };
    let mut level = corrupt.level as usize + 1;

    loop {
        if level >= extent_root.level as usize + 1 {
            return Err(SfsError::RepairFailed(format!(
                "could not find a pointer to corrupt block {}",
                corrupt.bytenr
            )));
        }
        let mut path = Path::new();
        path.lowest_level = level;
        ctx.txn
            .search_slot(&mut extent_root, &corrupt.key, &mut path, 0, true)?;

        let node_bytenr = path.nodes[level];
        if node_bytenr == 0 {
            level += 1;
            continue;
        }
        let node = ctx.txn.block(node_bytenr)?.clone();
        let mut slot = path.slots[level];
        if slot < node.nritems() && node.node_blockptr(slot) == corrupt.bytenr {
            // Found via the recorded key.
        } else {
            // The key was unreliable; scan the node.
            match (0..node.nritems()).find(|&i| node.node_blockptr(i) == corrupt.bytenr) {
                Some(found) => slot = found,
                None => {
                    level += 1;
                    continue;
                }
            }
        }

        info!(bytenr = corrupt.bytenr, "deleting pointer to corrupt block");
        path.slots[level] = slot;
        ctx.txn.del_ptr(&mut extent_root, &mut path, level, slot)?;
        ctx.extent_root = Some(extent_root);
        return Ok(());
    }
}

/// Prune every recorded corrupt block. Blocks whose pointer cannot be found
/// are reported but do not abort the repair preamble.
pub fn prune_corrupt_blocks(ctx: &mut CheckCtx<'_>, corrupt_blocks: &CorruptBlocks) -> Result<()> {
    for corrupt in corrupt_blocks.values() {
        if let Err(err) = prune_one_block(ctx, corrupt) {
            warn!(bytenr = corrupt.bytenr, %err, "could not prune corrupt block");
        }
    }
    Ok(())
}

/// Remove every extent-tree item keyed at `bytenr` in the extent-ref
/// family, adjusting block-group accounting for removed extent items.
pub fn delete_extent_records(
    ctx: &mut CheckCtx<'_>,
    block_groups: &mut BlockGroups,
    bytenr: u64,
) -> Result<()> {
    let Some(mut extent_root) = ctx.extent_root else {
        return Ok(());
    };

    loop {
        let mut path = Path::new();
        let key = Key::new(bytenr, u8::MAX, u64::MAX);
        ctx.txn
            .search_slot(&mut extent_root, &key, &mut path, 0, true)?;
        // The probe key never exists; step back to the candidate item.
        if path.slots[0] == 0 {
            if !ctx.txn.prev_leaf(&extent_root, &mut path)? {
                break;
            }
        } else {
            path.slots[0] -= 1;
        }

        let Some((found_key, _)) = ctx.txn.current_item(&path)? else {
            break;
        };
        if found_key.objectid != bytenr {
            break;
        }
        if !is_extent_ref_type(found_key.item_type) {
            break;
        }

        info!(
            objectid = found_key.objectid,
            item_type = found_key.item_type,
            offset = found_key.offset,
            "repair deleting extent record"
        );
        // Re-search with the delete intent so balancing happens on the way
        // down.
        let mut del_path = Path::new();
        let found = ctx
            .txn
            .search_slot(&mut extent_root, &found_key, &mut del_path, -1, true)?;
        if !found {
            break;
        }
        ctx.txn.del_item(&mut extent_root, &mut del_path)?;

        if found_key.item_type == ITEM_EXTENT_ITEM || found_key.item_type == ITEM_METADATA_ITEM {
            let bytes = if found_key.item_type == ITEM_EXTENT_ITEM {
                found_key.offset
            } else {
                ctx.nodesize
            };
            if let Some(bg) = block_groups
                .range_mut(..=bytenr)
                .next_back()
                .map(|(_, bg)| bg)
            {
                if bg.start <= bytenr && bytenr < bg.start + bg.length {
                    bg.item.used = bg.item.used.saturating_sub(bytes);
                }
            }
        }
    }
    ctx.extent_root = Some(extent_root);
    Ok(())
}

/// Bump the refcount of the extent item at `bytenr` and add one backref
/// item for the given referrer.
#[allow(clippy::too_many_arguments)]
fn inc_extent_ref(
    ctx: &mut CheckCtx<'_>,
    bytenr: u64,
    num_bytes: u64,
    parent: u64,
    root: u64,
    owner: u64,
    offset: u64,
) -> Result<()> {
    let Some(mut extent_root) = ctx.extent_root else {
        return Ok(());
    };
    let is_data = owner >= FIRST_FREE_OBJECTID;

    // Refcount on the extent item itself.
    {
        let mut path = Path::new();
        let item_key = Key::new(bytenr, ITEM_EXTENT_ITEM, num_bytes);
        let found = ctx
            .txn
            .search_slot(&mut extent_root, &item_key, &mut path, 0, true)?;
        if !found {
            return Err(SfsError::RepairFailed(format!(
                "extent item for {bytenr} missing while adding refs"
            )));
        }
        let slot = path.slots[0];
        let leaf = ctx.txn.block_mut(path.nodes[0])?;
        let data = leaf.item_data(slot).to_vec();
        let mut item = parse_extent_item(&data, false)?;
        item.refs += 1;
        let encoded = sfs_ondisk::encode_extent_item(&item);
        debug_assert_eq!(encoded.len(), data.len());
        leaf.item_data_mut(slot).copy_from_slice(&encoded);
    }

    // The stand-alone ref item.
    let ref_key = if is_data {
        if parent > 0 {
            Key::new(bytenr, ITEM_SHARED_DATA_REF, parent)
        } else {
            Key::new(
                bytenr,
                ITEM_EXTENT_DATA_REF,
                hash_extent_data_ref(root, owner, offset),
            )
        }
    } else if parent > 0 {
        Key::new(bytenr, ITEM_SHARED_BLOCK_REF, parent)
    } else {
        Key::new(bytenr, ITEM_TREE_BLOCK_REF, root)
    };

    let mut path = Path::new();
    let exists = ctx
        .txn
        .search_slot(&mut extent_root, &ref_key, &mut path, 0, true)?;
    if exists {
        if is_data {
            let slot = path.slots[0];
            let leaf = ctx.txn.block_mut(path.nodes[0])?;
            if parent > 0 {
                let count = parse_shared_data_ref(leaf.item_data(slot))?;
                leaf.item_data_mut(slot)
                    .copy_from_slice(&encode_shared_data_ref(count + 1));
            } else {
                let mut dref = parse_extent_data_ref(leaf.item_data(slot))?;
                dref.count += 1;
                leaf.item_data_mut(slot)
                    .copy_from_slice(&encode_extent_data_ref(&dref));
            }
        }
        // Tree refs are pure key items; existing means already referenced.
    } else {
        let payload = if is_data {
            if parent > 0 {
                encode_shared_data_ref(1)
            } else {
                encode_extent_data_ref(&ExtentDataRef {
                    root,
                    objectid: owner,
                    offset,
                    count: 1,
                })
            }
        } else {
            Vec::new()
        };
        ctx.txn.insert_item(&mut extent_root, &ref_key, &payload)?;
    }
    ctx.extent_root = Some(extent_root);
    Ok(())
}

/// Re-create the extent item for `rec` (once) and emit one ref per verified
/// backref.
fn record_extent(
    ctx: &mut CheckCtx<'_>,
    block_groups: &mut BlockGroups,
    rec: &mut ExtentRecord,
    backref: &Backref,
    allocated: bool,
    flags: u64,
) -> Result<()> {
    let Some(mut extent_root) = ctx.extent_root else {
        return Ok(());
    };
    let is_data = matches!(backref, Backref::Data(_));
    if !is_data {
        rec.max_size = rec.max_size.max(ctx.nodesize);
    }

    if !allocated {
        let item = ExtentItem {
            refs: 0,
            generation: rec.generation,
            flags: if is_data {
                EXTENT_FLAG_DATA
            } else {
                EXTENT_FLAG_TREE_BLOCK | flags
            },
            tree_block_info: (!is_data).then(|| {
                (
                    Key::new(rec.info_objectid, 0, 0),
                    rec.info_level,
                )
            }),
            inline_refs: Vec::new(),
        };
        let ins_key = Key::new(rec.start, ITEM_EXTENT_ITEM, rec.max_size);
        ctx.txn.insert_item(
            &mut extent_root,
            &ins_key,
            &sfs_ondisk::encode_extent_item(&item),
        )?;
        ctx.extent_root = Some(extent_root);

        if let Some(bg) = block_groups
            .range_mut(..=rec.start)
            .next_back()
            .map(|(_, bg)| bg)
        {
            if bg.start <= rec.start && rec.start < bg.start + bg.length {
                bg.item.used = bg.item.used.saturating_add(rec.max_size);
            }
        }
    } else {
        ctx.extent_root = Some(extent_root);
    }

    match backref {
        Backref::Data(dback) => {
            let parent = match dback.link {
                BackrefLink::Parent(parent) => parent,
                BackrefLink::Root(_) => 0,
            };
            let root = match dback.link {
                BackrefLink::Root(root) => root,
                BackrefLink::Parent(_) => 0,
            };
            for _ in 0..dback.found_ref {
                // A full backref names the parent; the owner degenerates to
                // the first free objectid so the ref encodes as data.
                let owner = if parent > 0 {
                    FIRST_FREE_OBJECTID
                } else {
                    dback.owner
                };
                inc_extent_ref(ctx, rec.start, rec.max_size, parent, root, owner, dback.offset)?;
            }
            info!(
                start = rec.start,
                owner = dback.owner,
                offset = dback.offset,
                found = dback.found_ref,
                "added data backref"
            );
        }
        Backref::Tree(tback) => {
            let (parent, root) = match tback.link {
                BackrefLink::Parent(parent) => (parent, 0),
                BackrefLink::Root(root) => (0, root),
            };
            inc_extent_ref(ctx, rec.start, rec.max_size, parent, root, 0, 0)?;
            info!(start = rec.start, parent, root, "added tree backref");
        }
    }
    Ok(())
}

/// Delete every record for a broken extent and reinsert the canonical set
/// derived from its walked backrefs.
pub fn fixup_extent_refs(
    ctx: &mut CheckCtx<'_>,
    cache: &mut ExtentCache,
    corrupt_blocks: &CorruptBlocks,
    block_groups: &mut BlockGroups,
    rec: &mut ExtentRecord,
) -> Result<()> {
    // Remember the flags so the re-created item matches the old sharing
    // mode.
    let flags = match ctx.txn.lookup_extent_info(rec.start, rec.info_level)? {
        Some((_, flags)) => flags,
        None => BLOCK_FLAG_FULL_BACKREF,
    };

    delete_extent_records(ctx, block_groups, rec.start)?;
    drain_events(ctx, cache);

    // Never re-add references to a block known to be corrupt.
    if corrupt_blocks.contains_key(&rec.start) {
        return Ok(());
    }

    let backrefs = rec.backrefs.clone();
    let mut allocated = false;
    for backref in &backrefs {
        if !backref.found_ref() {
            continue;
        }
        record_extent(ctx, block_groups, rec, backref, allocated, flags)?;
        allocated = true;
    }
    drain_events(ctx, cache);
    Ok(())
}

/// Apply queued tree-layer ref events to the reconciler (the free-extent
/// hook of the repair path). Alloc and tree-block free events are carried
/// forward so `settle_allocations` can materialise their extent items.
pub fn drain_events(ctx: &mut CheckCtx<'_>, cache: &mut ExtentCache) {
    for event in ctx.txn.take_events() {
        apply_ref_event(cache, &event);
        match event {
            sfs_tree::RefEvent::Alloc { .. } => ctx.carry_events.push(event),
            sfs_tree::RefEvent::Free(freed) if freed.owner < FIRST_FREE_OBJECTID => {
                ctx.carry_events.push(event);
            }
            _ => {}
        }
    }
}

/// Materialise the extent-tree bookkeeping for blocks this transaction
/// allocated or freed: every new tree block gets an EXTENT_ITEM plus a
/// TREE_BLOCK_REF, every freed one loses its records. Mutating the extent
/// tree can itself allocate and free blocks, so this iterates to a fixed
/// point.
pub fn settle_allocations(
    ctx: &mut CheckCtx<'_>,
    cache: &mut ExtentCache,
    block_groups: &mut BlockGroups,
) -> Result<bool> {
    let mut did_work = false;
    for _round in 0..64 {
        drain_events(ctx, cache);
        let events = std::mem::take(&mut ctx.carry_events);
        if events.is_empty() {
            return Ok(did_work);
        }
        did_work = true;
        for event in events {
            match event {
                sfs_tree::RefEvent::Free(freed) => {
                    delete_extent_records(ctx, block_groups, freed.bytenr)?;
                }
                sfs_tree::RefEvent::Alloc {
                    bytenr,
                    num_bytes,
                    root_objectid,
                    level,
                } => {
                    materialise_alloc(ctx, block_groups, bytenr, num_bytes, root_objectid, level)?;
                }
                _ => {}
            }
        }
    }
    Err(SfsError::RepairFailed(
        "allocation bookkeeping did not settle".into(),
    ))
}

fn materialise_alloc(
    ctx: &mut CheckCtx<'_>,
    block_groups: &mut BlockGroups,
    bytenr: u64,
    num_bytes: u64,
    root_objectid: u64,
    level: u8,
) -> Result<()> {
    let Some(mut extent_root) = ctx.extent_root else {
        return Ok(());
    };
    // The block may already have been freed again within this transaction.
    let first_key = match ctx.txn.block(bytenr) {
        Ok(block) => block.first_key().unwrap_or(Key::MIN),
        Err(_) => return Ok(()),
    };

    let item = ExtentItem {
        refs: 1,
        generation: ctx.txn.transid,
        flags: EXTENT_FLAG_TREE_BLOCK,
        tree_block_info: Some((first_key, level)),
        inline_refs: Vec::new(),
    };
    let ins_key = Key::new(bytenr, ITEM_EXTENT_ITEM, num_bytes);
    match ctx.txn.insert_item(
        &mut extent_root,
        &ins_key,
        &sfs_ondisk::encode_extent_item(&item),
    ) {
        Ok(()) => {}
        Err(SfsError::AlreadyExists(_)) => {
            ctx.extent_root = Some(extent_root);
            return Ok(());
        }
        Err(err) => return Err(err),
    }
    let ref_key = Key::new(bytenr, ITEM_TREE_BLOCK_REF, root_objectid);
    match ctx.txn.insert_item(&mut extent_root, &ref_key, &[]) {
        Ok(()) | Err(SfsError::AlreadyExists(_)) => {}
        Err(err) => {
            return Err(err);
        }
    }
    ctx.extent_root = Some(extent_root);

    if let Some(bg) = block_groups
        .range_mut(..=bytenr)
        .next_back()
        .map(|(_, bg)| bg)
    {
        if bg.start <= bytenr && bytenr < bg.start + bg.length {
            bg.item.used = bg.item.used.saturating_add(num_bytes);
        }
    }
    Ok(())
}

/// Outcome of the extent-reference verification pass.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct ExtentCheckOutcome {
    pub mismatched: usize,
    pub repaired: usize,
}

/// Verify every reconciled extent record, repairing the broken ones when
/// `repair` is set: prune corrupt blocks first, then delete and rewrite
/// the records of every unbalanced extent.
pub fn check_extent_refs(
    ctx: &mut CheckCtx<'_>,
    cache: &mut ExtentCache,
    corrupt_blocks: &CorruptBlocks,
    block_groups: &mut BlockGroups,
    repair: bool,
) -> Result<ExtentCheckOutcome> {
    let mut outcome = ExtentCheckOutcome::default();

    if repair {
        prune_corrupt_blocks(ctx, corrupt_blocks)?;
        drain_events(ctx, cache);
    }

    while let Some(mut rec) = cache.pop_first() {
        let mut broken = false;
        if rec.refs != rec.extent_item_refs {
            warn!(
                start = rec.start,
                nr = rec.nr,
                declared = rec.extent_item_refs,
                walked = rec.refs,
                "extent ref mismatch"
            );
            broken = true;
        }
        let problems = backpointer_problems(&rec);
        if !problems.is_empty() {
            for problem in &problems {
                warn!(start = rec.start, %problem, "backpointer mismatch");
            }
            broken = true;
        }
        if !rec.owner_ref_checked {
            warn!(start = rec.start, nr = rec.nr, "owner ref check failed");
            broken = true;
        }

        if broken {
            outcome.mismatched += 1;
            if repair {
                fixup_extent_refs(ctx, cache, corrupt_blocks, block_groups, &mut rec)
                    .map_err(|err| {
                        SfsError::RepairFailed(format!(
                            "extent {} reconstruction failed: {err}",
                            rec.start
                        ))
                    })?;
                outcome.repaired += 1;
            }
        }
    }
    Ok(outcome)
}

/// Rewrite block-group items and superblock accounting from the repaired
/// extent tree.
pub fn rebuild_block_accounting(
    ctx: &mut CheckCtx<'_>,
    block_groups: &BlockGroups,
) -> Result<u64> {
    let Some(mut extent_root) = ctx.extent_root else {
        return Ok(0);
    };

    // Recompute used bytes per group from the extent tree.
    let mut used: std::collections::BTreeMap<u64, u64> =
        block_groups.keys().map(|&start| (start, 0)).collect();
    let mut total_used = 0_u64;
    {
        let mut iter =
            sfs_tree::LeafIter::forward(&mut ctx.txn, extent_root, &Key::MIN)?;
        while let Some((key, _)) = iter.next_entry(&mut ctx.txn)? {
            let bytes = match key.item_type {
                ITEM_EXTENT_ITEM => key.offset,
                ITEM_METADATA_ITEM => ctx.nodesize,
                _ => continue,
            };
            total_used += bytes;
            if let Some((&bg_start, _)) = used.range(..=key.objectid).next_back() {
                if let Some(bg) = block_groups.get(&bg_start) {
                    if key.objectid < bg.start + bg.length {
                        *used.get_mut(&bg_start).expect("key present") += bytes;
                    }
                }
            }
        }
    }

    for (start, bg) in block_groups {
        let new_used = used.get(start).copied().unwrap_or(0);
        let bg_key = Key::new(bg.start, ITEM_BLOCK_GROUP_ITEM, bg.length);
        let mut path = Path::new();
        let found = ctx
            .txn
            .search_slot(&mut extent_root, &bg_key, &mut path, 0, true)?;
        if !found {
            warn!(start = bg.start, "block group item missing while rebuilding accounting");
            continue;
        }
        let slot = path.slots[0];
        let leaf = ctx.txn.block_mut(path.nodes[0])?;
        let mut item = bg.item;
        item.used = new_used;
        leaf.item_data_mut(slot)
            .copy_from_slice(&sfs_ondisk::encode_block_group_item(&item));
    }

    ctx.extent_root = Some(extent_root);
    info!(total_used, "block accounting rebuilt");
    Ok(total_used)
}

/// Reset the checksum tree to a single empty leaf.
pub fn reinit_csum_tree(ctx: &mut CheckCtx<'_>) -> Result<()> {
    let Some(csum_root) = ctx.csum_root else {
        return Err(SfsError::NotFound("checksum tree root".into()));
    };
    let mut root = csum_root;
    // Drain the tree item by item; deletes collapse it back to one leaf.
    loop {
        let mut path = Path::new();
        ctx.txn.search_slot(&mut root, &Key::MIN, &mut path, 0, false)?;
        let Some((key, _)) = ctx.txn.current_item(&path)? else {
            break;
        };
        let mut del_path = Path::new();
        if !ctx.txn.search_slot(&mut root, &key, &mut del_path, -1, true)? {
            break;
        }
        ctx.txn.del_item(&mut root, &mut del_path)?;
    }
    ctx.csum_root = Some(root);
    info!("checksum tree reinitialised");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_ref_hash_is_stable() {
        let a = hash_extent_data_ref(5, 257, 0);
        let b = hash_extent_data_ref(5, 257, 0);
        assert_eq!(a, b);
        assert_ne!(a, hash_extent_data_ref(5, 257, 4096));
        assert_ne!(a, hash_extent_data_ref(5, 258, 0));
    }
}
