//! Filesystem-tree walking: depth-first traversal of every fs root with
//! shared-subtree detection, dispatching leaf items into the inode and
//! root accumulators.

use crate::ino::{
    check_inode_recs, get_inode_rec, maybe_free_inode_rec, InodeProblem, I_ERR_BAD_FILE_EXTENT,
    I_ERR_DUP_DIR_INDEX, I_ERR_DUP_INODE_ITEM, I_ERR_FILE_EXTENT_OVERLAP, I_ERR_NO_ORPHAN_ITEM,
    REF_ERR_NAME_TOO_LONG,
};
use crate::roots::{merge_root_recs, process_root_ref, RootCache};
use crate::shared::{enter_shared_node, leave_shared_node, SharedNode, WalkControl};
use crate::CheckCtx;
use sfs_error::Result;
use sfs_ondisk::{
    parse_dir_items, parse_file_extent, parse_inode_extrefs, parse_inode_item, parse_inode_refs,
    parse_root_item, parse_root_ref as parse_root_ref_item, FileExtent, TreeBlock,
};
use sfs_tree::{Path, TreeRoot};
use sfs_types::{
    is_fs_tree_objectid, Key, COMPRESS_NONE, FILE_EXTENT_PREALLOC, FILE_EXTENT_REG,
    FREE_SPACE_OBJECTID, INODE_NODATASUM, ITEM_DIR_INDEX, ITEM_DIR_ITEM, ITEM_EXTENT_DATA,
    ITEM_INODE_EXTREF, ITEM_INODE_ITEM, ITEM_INODE_REF, ITEM_ROOT_BACKREF, ITEM_ROOT_ITEM,
    ITEM_ROOT_REF, MAX_LEVEL, MAX_NAME_LEN, TREE_RELOC_OBJECTID,
};
use tracing::{debug, warn};

fn truncate_name(name: &[u8]) -> (&[u8], u32) {
    if name.len() <= MAX_NAME_LEN {
        (name, 0)
    } else {
        (&name[..MAX_NAME_LEN], REF_ERR_NAME_TOO_LONG)
    }
}

fn process_inode_item_entry(
    active: &mut SharedNode,
    leaf: &TreeBlock,
    slot: usize,
    key: &Key,
) -> Result<()> {
    let ino = active.current.expect("current is established per item");
    debug_assert_eq!(ino, key.objectid);
    let item = parse_inode_item(leaf.item_data(slot))?;
    let rec = active
        .inode_cache
        .get_mut(&ino)
        .expect("current record exists");
    if rec.found_inode_item {
        rec.errors |= I_ERR_DUP_INODE_ITEM;
        return Ok(());
    }
    rec.nlink = item.nlink;
    rec.isize = item.size;
    rec.nbytes = item.nbytes;
    rec.imode = item.mode;
    if item.flags & INODE_NODATASUM != 0 {
        rec.nodatasum = true;
    }
    rec.found_inode_item = true;
    if rec.nlink == 0 {
        rec.errors |= I_ERR_NO_ORPHAN_ITEM;
    }
    maybe_free_inode_rec(&mut active.inode_cache, ino);
    Ok(())
}

fn process_dir_item_entry(
    active: &mut SharedNode,
    leaf: &TreeBlock,
    slot: usize,
    key: &Key,
) -> Result<()> {
    let cur = active.current.expect("current is established per item");
    active
        .inode_cache
        .get_mut(&cur)
        .expect("current record exists")
        .found_dir_item = true;

    let entries = parse_dir_items(leaf.item_data(slot))?;
    for entry in &entries {
        {
            let rec = active
                .inode_cache
                .get_mut(&cur)
                .expect("current record exists");
            rec.found_size += entry.name.len() as u64;
        }
        let (name, errors) = truncate_name(&entry.name);
        match entry.location.item_type {
            ITEM_INODE_ITEM => crate::ino::add_inode_backref(
                &mut active.inode_cache,
                entry.location.objectid,
                key.objectid,
                key.offset,
                name,
                entry.file_type,
                key.item_type,
                errors,
            ),
            ITEM_ROOT_ITEM => crate::ino::add_inode_backref(
                &mut active.root_cache,
                entry.location.objectid,
                key.objectid,
                key.offset,
                name,
                entry.file_type,
                key.item_type,
                errors,
            ),
            other => warn!(location_type = other, "dir entry with odd location type"),
        }
    }
    if key.item_type == ITEM_DIR_INDEX && entries.len() > 1 {
        active
            .inode_cache
            .get_mut(&cur)
            .expect("current record exists")
            .errors |= I_ERR_DUP_DIR_INDEX;
    }
    Ok(())
}

fn process_inode_ref_entry(
    active: &mut SharedNode,
    leaf: &TreeBlock,
    slot: usize,
    key: &Key,
) -> Result<()> {
    for entry in parse_inode_refs(leaf.item_data(slot))? {
        let (name, errors) = truncate_name(&entry.name);
        crate::ino::add_inode_backref(
            &mut active.inode_cache,
            key.objectid,
            key.offset,
            entry.index,
            name,
            0,
            ITEM_INODE_REF,
            errors,
        );
    }
    Ok(())
}

fn process_inode_extref_entry(
    active: &mut SharedNode,
    leaf: &TreeBlock,
    slot: usize,
    key: &Key,
) -> Result<()> {
    for entry in parse_inode_extrefs(leaf.item_data(slot))? {
        let (name, errors) = truncate_name(&entry.name);
        crate::ino::add_inode_backref(
            &mut active.inode_cache,
            key.objectid,
            entry.parent,
            entry.index,
            name,
            0,
            ITEM_INODE_EXTREF,
            errors,
        );
    }
    Ok(())
}

fn process_file_extent_entry(
    ctx: &mut CheckCtx<'_>,
    active: &mut SharedNode,
    leaf: &TreeBlock,
    slot: usize,
    key: &Key,
) -> Result<()> {
    let ino = active.current.expect("current is established per item");
    debug_assert_eq!(ino, key.objectid);
    let mask = ctx.sectorsize - 1;

    {
        let rec = active
            .inode_cache
            .get_mut(&ino)
            .expect("current record exists");
        rec.found_file_extent = true;
        if rec.extent_start == u64::MAX {
            rec.extent_start = key.offset;
            rec.extent_end = key.offset;
        }
        if rec.extent_end > key.offset {
            rec.errors |= I_ERR_FILE_EXTENT_OVERLAP;
        } else if rec.extent_end < key.offset && rec.extent_end < rec.first_extent_gap {
            rec.first_extent_gap = rec.extent_end;
        }
    }

    let extent = parse_file_extent(leaf.item_data(slot))?;
    let mut num_bytes;
    let mut disk_bytenr = 0_u64;
    let mut extent_offset = 0_u64;
    let mut csum_bytes = 0_u64;
    let mut extent_type = FILE_EXTENT_REG;
    let mut bad = 0_u32;

    match &extent {
        FileExtent::Inline { ram_bytes, .. } => {
            num_bytes = *ram_bytes;
            if num_bytes == 0 {
                bad |= I_ERR_BAD_FILE_EXTENT;
            }
            let rec = active
                .inode_cache
                .get_mut(&ino)
                .expect("current record exists");
            rec.found_size += num_bytes;
            num_bytes = (num_bytes + mask) & !mask;
        }
        FileExtent::Regular {
            ram_bytes,
            compression,
            encryption,
            other_encoding,
            extent_type: et,
            disk_bytenr: dbytenr,
            disk_num_bytes,
            offset,
            num_bytes: nbytes,
            ..
        } => {
            extent_type = *et;
            num_bytes = *nbytes;
            disk_bytenr = *dbytenr;
            extent_offset = *offset;
            if num_bytes == 0 || num_bytes & mask != 0 {
                bad |= I_ERR_BAD_FILE_EXTENT;
            }
            if num_bytes + extent_offset > *ram_bytes {
                bad |= I_ERR_BAD_FILE_EXTENT;
            }
            if *et == FILE_EXTENT_PREALLOC
                && (*compression != COMPRESS_NONE || *encryption != 0 || *other_encoding != 0)
            {
                bad |= I_ERR_BAD_FILE_EXTENT;
            }
            if disk_bytenr > 0 {
                let rec = active
                    .inode_cache
                    .get_mut(&ino)
                    .expect("current record exists");
                rec.found_size += num_bytes;
            }
            // Checksums cover the compressed bytes on disk.
            csum_bytes = if *compression != COMPRESS_NONE {
                *disk_num_bytes
            } else {
                num_bytes
            };
        }
    }

    {
        let rec = active
            .inode_cache
            .get_mut(&ino)
            .expect("current record exists");
        rec.errors |= bad;
        rec.extent_end = key.offset + num_bytes;
    }

    if disk_bytenr > 0 {
        let csum_start = if extent.compression() != COMPRESS_NONE {
            disk_bytenr
        } else {
            disk_bytenr + extent_offset
        };
        let found = ctx.count_csum_range(csum_start, csum_bytes)?;
        let rec = active
            .inode_cache
            .get_mut(&ino)
            .expect("current record exists");
        if extent_type == FILE_EXTENT_REG {
            if found > 0 {
                rec.found_csum_item = true;
            }
            if found < csum_bytes {
                rec.some_csum_missing = true;
            }
        } else if extent_type == FILE_EXTENT_PREALLOC && found > 0 {
            rec.errors |= crate::ino::I_ERR_ODD_CSUM_ITEM;
        }
    }
    Ok(())
}

/// Dispatch every item of one leaf into the active accumulator.
fn process_one_leaf(
    ctx: &mut CheckCtx<'_>,
    wc: &mut WalkControl,
    local: &mut SharedNode,
    root_refs: u32,
    leaf: &TreeBlock,
) -> Result<()> {
    if wc.root_level == wc.active_node && root_refs == 0 {
        return Ok(());
    }

    for slot in 0..leaf.nritems() {
        let key = leaf.item_key(slot);
        if key.objectid == FREE_SPACE_OBJECTID {
            continue;
        }

        {
            let active = wc.active(local);
            if active.current.map_or(true, |ino| ino < key.objectid) {
                if let Some(cur) = active.current {
                    if let Some(rec) = active.inode_cache.get_mut(&cur) {
                        rec.checked = true;
                    }
                    maybe_free_inode_rec(&mut active.inode_cache, cur);
                }
                get_inode_rec(&mut active.inode_cache, key.objectid);
                active.current = Some(key.objectid);
            }
        }

        match key.item_type {
            ITEM_DIR_ITEM | ITEM_DIR_INDEX => {
                let active = wc.active(local);
                process_dir_item_entry(active, leaf, slot, &key)?;
            }
            ITEM_INODE_REF => {
                let active = wc.active(local);
                process_inode_ref_entry(active, leaf, slot, &key)?;
            }
            ITEM_INODE_EXTREF => {
                let active = wc.active(local);
                process_inode_extref_entry(active, leaf, slot, &key)?;
            }
            ITEM_INODE_ITEM => {
                let active = wc.active(local);
                process_inode_item_entry(active, leaf, slot, &key)?;
            }
            ITEM_EXTENT_DATA => {
                // The active accumulator and the csum lookup need disjoint
                // borrows; resolve the active node inside.
                let mut scratch = std::mem::take(wc.active(local));
                let result = process_file_extent_entry(ctx, &mut scratch, leaf, slot, &key);
                *wc.active(local) = scratch;
                result?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Descend as deep as possible from the current path position, entering
/// shared nodes along the way.
fn walk_down_tree(
    ctx: &mut CheckCtx<'_>,
    root: &TreeRoot,
    path: &mut Path,
    wc: &mut WalkControl,
    local: &mut SharedNode,
    level: &mut usize,
) -> Result<()> {
    let top = path.nodes[*level];
    let refs = ctx.block_refs(top, *level as u8)?;
    if refs > 1
        && enter_shared_node(wc, local, root.root_refs, top, refs as u32, *level)
    {
        let nritems = ctx.txn.block(top)?.nritems();
        path.slots[*level] = nritems;
        return Ok(());
    }

    loop {
        let cur_bytenr = path.nodes[*level];
        let cur = ctx.txn.block(cur_bytenr)?.clone();
        if cur.level() as usize != *level {
            warn!(bytenr = cur_bytenr, "block level does not match walk level");
        }
        if path.slots[*level] >= cur.nritems() {
            break;
        }
        if *level == 0 {
            process_one_leaf(ctx, wc, local, root.root_refs, &cur)?;
            break;
        }

        let slot = path.slots[*level];
        let child_bytenr = cur.node_blockptr(slot);
        let ptr_gen = cur.node_ptr_generation(slot);
        let child_refs = ctx.block_refs(child_bytenr, (*level - 1) as u8)?;
        if child_refs > 1
            && enter_shared_node(
                wc,
                local,
                root.root_refs,
                child_bytenr,
                child_refs as u32,
                *level - 1,
            )
        {
            path.slots[*level] += 1;
            continue;
        }

        if *level == 1 && path.reada {
            for i in slot..cur.nritems() {
                ctx.txn.readahead(cur.node_blockptr(i));
            }
        }

        ctx.txn.read_block(child_bytenr, ptr_gen)?;
        *level -= 1;
        path.nodes[*level] = child_bytenr;
        path.slots[*level] = 0;
    }

    let nritems = ctx.txn.block(path.nodes[*level])?.nritems();
    path.slots[*level] = nritems;
    Ok(())
}

/// Ascend until a sibling slot exists. Returns true when the walk is done.
fn walk_up_tree(
    ctx: &mut CheckCtx<'_>,
    root: &TreeRoot,
    path: &mut Path,
    wc: &mut WalkControl,
    local: &mut SharedNode,
    level: &mut usize,
) -> Result<bool> {
    let mut i = *level;
    while i < MAX_LEVEL - 1 && path.nodes[i] != 0 {
        let nritems = ctx.txn.block(path.nodes[i])?.nritems();
        if path.slots[i] + 1 < nritems {
            path.slots[i] += 1;
            *level = i;
            return Ok(false);
        }
        path.nodes[*level] = 0;
        debug_assert!(*level <= wc.active_node);
        if *level == wc.active_node {
            leave_shared_node(wc, local, root.root_refs, *level);
        }
        *level = i + 1;
        i += 1;
    }
    Ok(true)
}

/// Walk one fs root end to end, returning the per-inode problems found.
pub fn check_fs_root(
    ctx: &mut CheckCtx<'_>,
    root_cache: &mut RootCache,
    wc: &mut WalkControl,
    objectid: u64,
    item: &sfs_ondisk::RootItem,
) -> Result<Vec<InodeProblem>> {
    let mut root = TreeRoot::from_root_item(objectid, item);
    debug!(objectid, bytenr = root.bytenr, level = root.level, "checking fs root");

    if objectid != TREE_RELOC_OBJECTID {
        let rec = crate::roots::get_root_rec(root_cache, objectid);
        if root.root_refs > 0 {
            rec.found_root_item = true;
        }
    }

    let mut local = SharedNode::default();
    let mut path = Path::new();
    path.reada = true;
    let mut level = root.level as usize;
    wc.begin_root(level);

    if root.root_refs > 0 || item.drop_progress == Key::MIN {
        path.nodes[level] = root.bytenr;
        path.slots[level] = 0;
        ctx.txn.read_block(root.bytenr, 0)?;
    } else {
        // Resume a partially dropped snapshot at its recorded progress.
        level = item.drop_level as usize;
        path.lowest_level = level;
        ctx.txn
            .search_slot(&mut root, &item.drop_progress, &mut path, 0, false)?;
    }

    loop {
        walk_down_tree(ctx, &root, &mut path, wc, &mut local, &mut level)?;
        if walk_up_tree(ctx, &root, &mut path, wc, &mut local, &mut level)? {
            break;
        }
    }
    path.release();

    merge_root_recs(objectid, &mut local.root_cache, root_cache, |parent, child| {
        ctx.is_child_root(parent, child)
    })?;

    if let Some(cur) = local.current.take() {
        if let Some(rec) = local.inode_cache.get_mut(&cur) {
            rec.checked = true;
        }
        maybe_free_inode_rec(&mut local.inode_cache, cur);
    }

    let root_dirid = item.root_dirid;
    let root_refs = root.root_refs;
    let check_root = root;
    let problems = check_inode_recs(
        objectid,
        root_dirid,
        root_refs,
        &mut local.inode_cache,
        |ino| ctx.has_orphan_item(&check_root, ino).unwrap_or(false),
    );
    Ok(problems)
}

/// Scan the root tree and check every fs tree it names; ROOT_REF /
/// ROOT_BACKREF items feed the cross-tree graph.
pub fn check_fs_roots(
    ctx: &mut CheckCtx<'_>,
    root_cache: &mut RootCache,
) -> Result<Vec<InodeProblem>> {
    let mut wc = WalkControl::new();
    let mut problems = Vec::new();

    let mut iter = sfs_tree::LeafIter::forward(&mut ctx.txn, ctx.tree_root, &Key::MIN)?;
    let mut pending_roots = Vec::new();
    while let Some((key, data)) = iter.next_entry(&mut ctx.txn)? {
        match key.item_type {
            ITEM_ROOT_ITEM if is_fs_tree_objectid(key.objectid) => {
                match parse_root_item(&data) {
                    Ok(item) => pending_roots.push((key.objectid, item)),
                    Err(err) => {
                        warn!(objectid = key.objectid, %err, "unreadable root item");
                        problems.push(InodeProblem {
                            root: key.objectid,
                            ino: 0,
                            errors: 0,
                            unresolved_refs: 0,
                        });
                    }
                }
            }
            ITEM_ROOT_REF | ITEM_ROOT_BACKREF => {
                let entry = parse_root_ref_item(&data)?;
                process_root_ref(&key, &entry, root_cache);
            }
            _ => {}
        }
    }

    for (objectid, item) in pending_roots {
        match check_fs_root(ctx, root_cache, &mut wc, objectid, &item) {
            Ok(mut found) => problems.append(&mut found),
            Err(err) => {
                warn!(objectid, %err, "fs root walk failed");
                problems.push(InodeProblem {
                    root: objectid,
                    ino: 0,
                    errors: 0,
                    unresolved_refs: 0,
                });
            }
        }
    }
    if !wc.shared.is_empty() {
        warn!(
            remaining = wc.shared.len(),
            "shared nodes left after walking every root"
        );
    }
    Ok(problems)
}
