//! Checksum-tree verification: every checksummed byte range must be covered
//! by an allocated extent.

use crate::CheckCtx;
use sfs_error::Result;
use sfs_tree::{LeafIter, Path};
use sfs_types::{
    Key, EXTENT_CSUM_OBJECTID, ITEM_BLOCK_GROUP_ITEM, ITEM_EXTENT_CSUM, ITEM_EXTENT_ITEM,
};
use tracing::warn;

/// Verify an extent (or several) covers `[bytenr, bytenr + num_bytes)`.
pub fn check_extent_exists(
    ctx: &mut CheckCtx<'_>,
    mut bytenr: u64,
    mut num_bytes: u64,
) -> Result<bool> {
    let Some(mut extent_root) = ctx.extent_root else {
        return Ok(false);
    };

    let mut path = Path::new();
    let key = Key::new(bytenr, ITEM_EXTENT_ITEM, 0);
    let found = ctx
        .txn
        .search_slot(&mut extent_root, &key, &mut path, 0, false)?;
    if !found {
        // Step back to the extent that may begin before `bytenr`.
        if path.slots[0] > 0 {
            path.slots[0] -= 1;
        } else if !ctx.txn.prev_leaf(&extent_root, &mut path)? {
            path.slots[0] = 0;
        }
    }
    // Block group items share the bytenr keyspace and sort below extent
    // items; walk one more step back if we landed on one.
    if let Some((key, _)) = ctx.txn.current_item(&path)? {
        if key.item_type == ITEM_BLOCK_GROUP_ITEM {
            if path.slots[0] > 0 {
                path.slots[0] -= 1;
            } else {
                let _ = ctx.txn.prev_leaf(&extent_root, &mut path)?;
            }
        }
    }

    while num_bytes > 0 {
        let leaf_nritems = ctx.txn.block(path.nodes[0])?.nritems();
        if path.slots[0] >= leaf_nritems {
            if !ctx.txn.next_leaf(&extent_root, &mut path)? {
                break;
            }
            continue;
        }
        let leaf = ctx.txn.block(path.nodes[0])?;
        let key = leaf.item_key(path.slots[0]);
        if key.item_type != ITEM_EXTENT_ITEM {
            path.slots[0] += 1;
            continue;
        }
        if key.objectid + key.offset < bytenr {
            path.slots[0] += 1;
            continue;
        }
        if key.objectid > bytenr + num_bytes {
            break;
        }

        if key.objectid == bytenr {
            if key.offset >= num_bytes {
                num_bytes = 0;
                break;
            }
            num_bytes -= key.offset;
            bytenr += key.offset;
        } else if key.objectid < bytenr {
            if key.objectid + key.offset >= bytenr + num_bytes {
                num_bytes = 0;
                break;
            }
            num_bytes = (bytenr + num_bytes) - (key.objectid + key.offset);
            bytenr = key.objectid + key.offset;
        } else {
            if key.objectid + key.offset < bytenr + num_bytes {
                // The extent sits in the middle of the range; verify the
                // right side separately and keep going with the left.
                let right_start = key.objectid + key.offset;
                let right_len = bytenr + num_bytes - right_start;
                if !check_extent_exists(ctx, right_start, right_len)? {
                    warn!(right_start, "right section of csum range has no extent");
                    return Ok(false);
                }
                num_bytes = key.objectid - bytenr;
                return check_extent_exists(ctx, bytenr, num_bytes);
            }
            num_bytes = key.objectid - bytenr;
        }
        path.slots[0] += 1;
    }

    if num_bytes > 0 {
        warn!(bytenr, num_bytes, "no extents for csum range");
        return Ok(false);
    }
    Ok(true)
}

/// Scan the checksum tree; adjacent csum items coalesce, and each maximal
/// contiguous range must be covered by extents. Returns the number of
/// uncovered ranges.
pub fn check_csums(ctx: &mut CheckCtx<'_>) -> Result<usize> {
    let Some(csum_root) = ctx.csum_root else {
        return Ok(0);
    };
    let sectorsize = ctx.sectorsize;
    let csum_size = ctx.csum_size as u64;

    let mut errors = 0_usize;
    let mut offset = 0_u64;
    let mut num_bytes = 0_u64;

    let start = Key::new(EXTENT_CSUM_OBJECTID, ITEM_EXTENT_CSUM, 0);
    let mut entries = Vec::new();
    {
        let mut iter = LeafIter::forward(&mut ctx.txn, csum_root, &start)?;
        while let Some((key, data)) = iter.next_entry(&mut ctx.txn)? {
            if key.item_type != ITEM_EXTENT_CSUM {
                continue;
            }
            entries.push((key.offset, data.len() as u64));
        }
    }

    for (item_offset, item_len) in entries {
        if num_bytes != 0 && item_offset != offset + num_bytes {
            if !check_extent_exists(ctx, offset, num_bytes)? {
                warn!(offset, num_bytes, "csum exists but no extent record covers it");
                errors += 1;
            }
            offset = item_offset;
            num_bytes = 0;
        } else if num_bytes == 0 {
            offset = item_offset;
        }
        num_bytes += (item_len / csum_size) * sectorsize;
    }

    if num_bytes != 0 && !check_extent_exists(ctx, offset, num_bytes)? {
        warn!(offset, num_bytes, "csum exists but no extent record covers it");
        errors += 1;
    }
    Ok(errors)
}
