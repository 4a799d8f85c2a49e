//! Free-space cache verification.
//!
//! The persisted free-space map is stored as FREE_SPACE_EXTENT and
//! FREE_SPACE_BITMAP items keyed by offset in the free-space tree, valid
//! only when the superblock's cache generation matches its generation.
//! Verification carves every allocated extent (and the superblock ranges)
//! out of the loaded map; anything left over is an inconsistency.

use crate::scan::BlockGroups;
use crate::CheckCtx;
use sfs_error::Result;
use sfs_tree::LeafIter;
use sfs_types::{
    Key, ITEM_EXTENT_ITEM, ITEM_FREE_SPACE_BITMAP, ITEM_FREE_SPACE_EXTENT, ITEM_METADATA_ITEM,
    SUPER_INFO_OFFSET,
};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Free-space entries of one block group, keyed by offset.
pub type FreeSpaceMap = BTreeMap<u64, u64>;

/// Load the persisted free-space entries covering `[start, start+length)`,
/// merging adjacent runs the way the in-kernel cache does.
pub fn load_free_space(
    ctx: &mut CheckCtx<'_>,
    start: u64,
    length: u64,
) -> Result<FreeSpaceMap> {
    let mut map = FreeSpaceMap::new();
    let Some(root) = ctx.free_space_root else {
        return Ok(map);
    };

    let sectorsize = ctx.sectorsize;
    let mut iter = LeafIter::forward(&mut ctx.txn, root, &Key::new(start, 0, 0))?;
    while let Some((key, data)) = iter.next_entry(&mut ctx.txn)? {
        if key.objectid >= start + length {
            break;
        }
        match key.item_type {
            ITEM_FREE_SPACE_EXTENT => {
                insert_merged(&mut map, key.objectid, key.offset);
            }
            ITEM_FREE_SPACE_BITMAP => {
                // One bit per sector across [objectid, objectid + offset).
                for (byte_idx, byte) in data.iter().enumerate() {
                    for bit in 0..8 {
                        if byte & (1 << bit) == 0 {
                            continue;
                        }
                        let sector = (byte_idx * 8 + bit) as u64;
                        let offset = key.objectid + sector * sectorsize;
                        if offset >= key.objectid + key.offset {
                            break;
                        }
                        insert_merged(&mut map, offset, sectorsize);
                    }
                }
            }
            _ => {}
        }
    }
    Ok(map)
}

fn insert_merged(map: &mut FreeSpaceMap, offset: u64, bytes: u64) {
    // Merge with the run ending exactly at `offset`.
    if let Some((&prev_off, &prev_len)) = map.range(..offset).next_back() {
        if prev_off + prev_len == offset {
            map.insert(prev_off, prev_len + bytes);
            merge_forward(map, prev_off);
            return;
        }
    }
    map.insert(offset, bytes);
    merge_forward(map, offset);
}

fn merge_forward(map: &mut FreeSpaceMap, offset: u64) {
    let len = map[&offset];
    if let Some((&next_off, &next_len)) = map.range(offset + 1..).next() {
        if offset + len == next_off {
            map.remove(&next_off);
            map.insert(offset, len + next_len);
        }
    }
}

/// Check that `[offset, offset + bytes)` is covered by the free-space map,
/// excluding superblock ranges, and remove it from the map.
fn check_cache_range(
    ctx: &CheckCtx<'_>,
    map: &mut FreeSpaceMap,
    mut offset: u64,
    mut bytes: u64,
) -> bool {
    // Superblock copies are never free but never tracked as extents either.
    let sb_ranges = ctx.sb_ranges_within(offset, bytes);
    for (sb_start, sb_len) in sb_ranges {
        if sb_start + sb_len <= offset || offset + bytes <= sb_start {
            continue;
        }
        if sb_start == offset {
            if sb_len >= bytes {
                return true;
            }
            bytes -= sb_len;
            offset += sb_len;
        } else if sb_start < offset {
            if sb_start + sb_len >= offset + bytes {
                return true;
            }
            bytes = (offset + bytes) - (sb_start + sb_len);
            offset = sb_start + sb_len;
        } else {
            // The superblock lands in the middle; check the left side, keep
            // going with the right.
            if sb_start + sb_len >= offset + bytes {
                bytes = sb_start - offset;
                continue;
            }
            if !check_cache_range(ctx, map, offset, sb_start - offset) {
                return false;
            }
            bytes = (offset + bytes) - (sb_start + sb_len);
            offset = sb_start + sb_len;
        }
    }

    let Some((&entry_off, &entry_len)) = map.range(..=offset).next_back() else {
        warn!(offset, bytes, "no free space entry covers the hole");
        return false;
    };
    if entry_off != offset {
        warn!(wanted = offset, found = entry_off, "free space entry offset mismatch");
        return false;
    }
    if entry_len != bytes {
        warn!(
            offset,
            wanted = bytes,
            found = entry_len,
            "free space entry length mismatch"
        );
        return false;
    }
    map.remove(&entry_off);
    true
}

/// Verify one block group's persisted free-space map against the extent
/// tree. Returns true when consistent.
pub fn verify_space_cache(
    ctx: &mut CheckCtx<'_>,
    bg_start: u64,
    bg_length: u64,
) -> Result<bool> {
    let Some(extent_root) = ctx.extent_root else {
        return Ok(true);
    };
    let mut map = load_free_space(ctx, bg_start, bg_length)?;
    if map.is_empty() {
        // No persisted cache for this group; nothing to cross-check.
        return Ok(true);
    }

    let mut last = bg_start.max(SUPER_INFO_OFFSET);
    let mut ok = true;
    let start_key = Key::new(last, ITEM_EXTENT_ITEM, 0);
    let mut iter = LeafIter::forward(&mut ctx.txn, extent_root, &start_key)?;
    while let Some((key, _)) = iter.next_entry(&mut ctx.txn)? {
        if key.objectid >= bg_start + bg_length {
            break;
        }
        if key.item_type != ITEM_EXTENT_ITEM && key.item_type != ITEM_METADATA_ITEM {
            continue;
        }
        if key.objectid == last {
            last = if key.item_type == ITEM_EXTENT_ITEM {
                key.objectid + key.offset
            } else {
                key.objectid + ctx.nodesize
            };
            continue;
        }
        if !check_cache_range(ctx, &mut map, last, key.objectid - last) {
            ok = false;
            break;
        }
        last = if key.item_type == ITEM_EXTENT_ITEM {
            key.objectid + key.offset
        } else {
            key.objectid + ctx.nodesize
        };
    }

    if ok && last < bg_start + bg_length {
        ok = check_cache_range(ctx, &mut map, last, bg_start + bg_length - last);
    }

    if ok && !map.is_empty() {
        warn!(
            bg_start,
            entries = map.len(),
            "entries left in the free space cache after the sweep"
        );
        ok = false;
    }
    Ok(ok)
}

/// Cross-check every block group's free-space cache. Returns the starts of
/// the inconsistent groups.
pub fn check_space_cache(
    ctx: &mut CheckCtx<'_>,
    block_groups: &BlockGroups,
) -> Result<Vec<u64>> {
    if ctx.sb_generation != ctx.sb_cache_generation {
        info!("cache and super generation differ, space cache will be invalidated");
        return Ok(Vec::new());
    }

    let mut broken = Vec::new();
    for bg in block_groups.values() {
        if !verify_space_cache(ctx, bg.start, bg.length)? {
            warn!(start = bg.start, "free space cache appears valid but is not");
            broken.push(bg.start);
        }
    }
    debug!(groups = block_groups.len(), broken = broken.len(), "space cache checked");
    Ok(broken)
}

/// Regenerate the free-space items of the given block groups from the
/// extent tree (the repair path for cache mismatches).
pub fn rebuild_space_cache(ctx: &mut CheckCtx<'_>, bg_start: u64, bg_length: u64) -> Result<()> {
    let Some(mut free_space_root) = ctx.free_space_root else {
        return Ok(());
    };
    let Some(extent_root) = ctx.extent_root else {
        return Ok(());
    };

    // Drop every stale entry covering the group.
    loop {
        let start_key = Key::new(bg_start, 0, 0);
        let mut path = sfs_tree::Path::new();
        ctx.txn
            .search_slot(&mut free_space_root, &start_key, &mut path, 0, false)?;
        let Some((key, _)) = ctx.txn.current_item(&path)? else {
            break;
        };
        if key.objectid >= bg_start + bg_length
            || (key.item_type != ITEM_FREE_SPACE_EXTENT
                && key.item_type != ITEM_FREE_SPACE_BITMAP)
        {
            break;
        }
        let mut del_path = sfs_tree::Path::new();
        ctx.txn
            .search_slot(&mut free_space_root, &key, &mut del_path, -1, true)?;
        ctx.txn.del_item(&mut free_space_root, &mut del_path)?;
    }

    // Recompute the holes between allocated extents.
    let mut holes: Vec<(u64, u64)> = Vec::new();
    let mut last = bg_start.max(SUPER_INFO_OFFSET);
    let start_key = Key::new(last, ITEM_EXTENT_ITEM, 0);
    let mut iter = LeafIter::forward(&mut ctx.txn, extent_root, &start_key)?;
    while let Some((key, _)) = iter.next_entry(&mut ctx.txn)? {
        if key.objectid >= bg_start + bg_length {
            break;
        }
        if key.item_type != ITEM_EXTENT_ITEM && key.item_type != ITEM_METADATA_ITEM {
            continue;
        }
        if key.objectid > last {
            holes.push((last, key.objectid - last));
        }
        let len = if key.item_type == ITEM_EXTENT_ITEM {
            key.offset
        } else {
            ctx.nodesize
        };
        last = last.max(key.objectid + len);
    }
    if last < bg_start + bg_length {
        holes.push((last, bg_start + bg_length - last));
    }

    // Superblock ranges are never tracked as free (the verifier carves
    // them out of its sweep the same way).
    let mut carved: Vec<(u64, u64)> = Vec::new();
    for (offset, len) in holes {
        let mut cursor = offset;
        let end = offset + len;
        let mut sb_ranges = ctx.sb_ranges_within(offset, len);
        sb_ranges.retain(|&(s, l)| s < end && s + l > offset);
        for (sb_start, sb_len) in sb_ranges {
            if sb_start > cursor {
                carved.push((cursor, sb_start - cursor));
            }
            cursor = cursor.max(sb_start + sb_len);
        }
        if cursor < end {
            carved.push((cursor, end - cursor));
        }
    }

    for (offset, len) in carved {
        let key = Key::new(offset, ITEM_FREE_SPACE_EXTENT, len);
        ctx.txn.insert_item(&mut free_space_root, &key, &[])?;
    }
    ctx.free_space_root = Some(free_space_root);
    info!(bg_start, "free space cache regenerated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_adjacent_runs() {
        let mut map = FreeSpaceMap::new();
        insert_merged(&mut map, 0x1000, 0x1000);
        insert_merged(&mut map, 0x3000, 0x1000);
        assert_eq!(map.len(), 2);
        insert_merged(&mut map, 0x2000, 0x1000);
        assert_eq!(map.len(), 1);
        assert_eq!(map[&0x1000], 0x3000);
    }
}
