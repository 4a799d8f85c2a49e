//! Per-inode accumulation and cross-checking.
//!
//! Every fs-tree walk builds `InodeRecord`s lazily as items mention an
//! inode; links, sizes, and extent spans are accumulated and verified once
//! the record is complete. Records from shared subtrees merge commutatively.

use sfs_types::{imode_to_type, is_dir, is_reg, is_symlink, FREE_INO_OBJECTID, ITEM_DIR_INDEX, ITEM_DIR_ITEM, ITEM_INODE_EXTREF, ITEM_INODE_REF};
use std::collections::BTreeMap;

// Inode-level inconsistency flags.
pub const I_ERR_NO_INODE_ITEM: u32 = 1 << 0;
pub const I_ERR_NO_ORPHAN_ITEM: u32 = 1 << 1;
pub const I_ERR_DUP_INODE_ITEM: u32 = 1 << 2;
pub const I_ERR_DUP_DIR_INDEX: u32 = 1 << 3;
pub const I_ERR_ODD_DIR_ITEM: u32 = 1 << 4;
pub const I_ERR_ODD_FILE_EXTENT: u32 = 1 << 5;
pub const I_ERR_BAD_FILE_EXTENT: u32 = 1 << 6;
pub const I_ERR_FILE_EXTENT_OVERLAP: u32 = 1 << 7;
pub const I_ERR_FILE_EXTENT_DISCOUNT: u32 = 1 << 8;
pub const I_ERR_DIR_ISIZE_WRONG: u32 = 1 << 9;
pub const I_ERR_FILE_NBYTES_WRONG: u32 = 1 << 10;
pub const I_ERR_ODD_CSUM_ITEM: u32 = 1 << 11;
pub const I_ERR_SOME_CSUM_MISSING: u32 = 1 << 12;
pub const I_ERR_LINK_COUNT_WRONG: u32 = 1 << 13;

// Per-link (dir entry / inode ref) inconsistency flags.
pub const REF_ERR_NO_DIR_ITEM: u32 = 1 << 0;
pub const REF_ERR_NO_DIR_INDEX: u32 = 1 << 1;
pub const REF_ERR_NO_INODE_REF: u32 = 1 << 2;
pub const REF_ERR_DUP_DIR_ITEM: u32 = 1 << 3;
pub const REF_ERR_DUP_DIR_INDEX: u32 = 1 << 4;
pub const REF_ERR_DUP_INODE_REF: u32 = 1 << 5;
pub const REF_ERR_INDEX_UNMATCH: u32 = 1 << 6;
pub const REF_ERR_FILETYPE_UNMATCH: u32 = 1 << 7;
pub const REF_ERR_NAME_TOO_LONG: u32 = 1 << 8;
pub const REF_ERR_NO_ROOT_REF: u32 = 1 << 9;
pub const REF_ERR_NO_ROOT_BACKREF: u32 = 1 << 10;
pub const REF_ERR_DUP_ROOT_REF: u32 = 1 << 11;
pub const REF_ERR_DUP_ROOT_BACKREF: u32 = 1 << 12;

/// One (directory, name) link to an inode, merged across the item kinds
/// that describe it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeBackref {
    pub dir: u64,
    pub index: u64,
    pub name: Vec<u8>,
    pub filetype: u8,
    pub ref_type: u8,
    pub errors: u32,
    pub found_dir_item: bool,
    pub found_dir_index: bool,
    pub found_inode_ref: bool,
}

/// Everything observed about one inode during a tree walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeRecord {
    pub ino: u64,
    pub nlink: u32,
    pub imode: u32,
    pub isize: u64,
    pub nbytes: u64,
    pub found_link: u32,
    pub found_size: u64,
    /// Low/high water of observed EXTENT_DATA keys; `u64::MAX` start means
    /// no extent seen yet.
    pub extent_start: u64,
    pub extent_end: u64,
    /// Lowest hole below the observed extents; `u64::MAX` means none.
    pub first_extent_gap: u64,
    pub errors: u32,
    pub checked: bool,
    pub merging: bool,
    pub found_inode_item: bool,
    pub found_dir_item: bool,
    pub found_file_extent: bool,
    pub found_csum_item: bool,
    pub some_csum_missing: bool,
    pub nodatasum: bool,
    pub backrefs: Vec<InodeBackref>,
}

impl InodeRecord {
    #[must_use]
    pub fn new(ino: u64) -> Self {
        Self {
            ino,
            nlink: 0,
            imode: 0,
            isize: 0,
            nbytes: 0,
            found_link: if ino == FREE_INO_OBJECTID { 1 } else { 0 },
            found_size: 0,
            extent_start: u64::MAX,
            extent_end: 0,
            first_extent_gap: u64::MAX,
            errors: 0,
            checked: false,
            merging: false,
            found_inode_item: false,
            found_dir_item: false,
            found_file_extent: false,
            found_csum_item: false,
            some_csum_missing: false,
            nodatasum: false,
            backrefs: Vec::new(),
        }
    }
}

/// Inode records keyed by objectid.
pub type InodeCache = BTreeMap<u64, InodeRecord>;

/// Fetch or create the record for `ino`.
pub fn get_inode_rec(cache: &mut InodeCache, ino: u64) -> &mut InodeRecord {
    cache.entry(ino).or_insert_with(|| InodeRecord::new(ino))
}

fn get_backref<'a>(rec: &'a mut InodeRecord, name: &[u8], dir: u64) -> &'a mut InodeBackref {
    let pos = rec
        .backrefs
        .iter()
        .position(|backref| backref.dir == dir && backref.name == name);
    match pos {
        Some(idx) => &mut rec.backrefs[idx],
        None => {
            rec.backrefs.push(InodeBackref {
                dir,
                index: 0,
                name: name.to_vec(),
                filetype: 0,
                ref_type: 0,
                errors: 0,
                found_dir_item: false,
                found_dir_index: false,
                found_inode_ref: false,
            });
            rec.backrefs.last_mut().expect("just pushed")
        }
    }
}

/// Record one link observation directly on a record. `item_type` selects
/// which facet (dir item, dir index, inode ref/extref) was seen.
pub fn add_backref_to_rec(
    rec: &mut InodeRecord,
    dir: u64,
    index: u64,
    name: &[u8],
    filetype: u8,
    item_type: u8,
    errors: u32,
) {
    let backref = get_backref(rec, name, dir);
    backref.errors |= errors;
    match item_type {
        ITEM_DIR_INDEX => {
            if backref.found_dir_index {
                backref.errors |= REF_ERR_DUP_DIR_INDEX;
            }
            if backref.found_inode_ref && backref.index != index {
                backref.errors |= REF_ERR_INDEX_UNMATCH;
            }
            if backref.found_dir_item && backref.filetype != filetype {
                backref.errors |= REF_ERR_FILETYPE_UNMATCH;
            }
            backref.index = index;
            backref.filetype = filetype;
            backref.found_dir_index = true;
        }
        ITEM_DIR_ITEM => {
            if backref.found_dir_item {
                backref.errors |= REF_ERR_DUP_DIR_ITEM;
            }
            if backref.found_dir_index && backref.filetype != filetype {
                backref.errors |= REF_ERR_FILETYPE_UNMATCH;
            }
            backref.filetype = filetype;
            backref.found_dir_item = true;
            rec.found_link += 1;
        }
        ITEM_INODE_REF | ITEM_INODE_EXTREF => {
            if backref.found_inode_ref {
                backref.errors |= REF_ERR_DUP_INODE_REF;
            }
            if backref.found_dir_index && backref.index != index {
                backref.errors |= REF_ERR_INDEX_UNMATCH;
            }
            backref.ref_type = item_type;
            backref.index = index;
            backref.found_inode_ref = true;
        }
        _ => unreachable!("caller dispatches only link item types"),
    }
}

/// Record one link observation against the cache, creating the inode record
/// on first mention.
pub fn add_inode_backref(
    cache: &mut InodeCache,
    ino: u64,
    dir: u64,
    index: u64,
    name: &[u8],
    filetype: u8,
    item_type: u8,
    errors: u32,
) {
    let rec = get_inode_rec(cache, ino);
    add_backref_to_rec(rec, dir, index, name, filetype, item_type, errors);
    maybe_free_inode_rec(cache, ino);
}

/// A record can be dropped once it is fully verified and clean.
#[must_use]
pub fn can_free_inode_rec(rec: &InodeRecord) -> bool {
    rec.errors == 0
        && rec.checked
        && rec.found_inode_item
        && rec.nlink == rec.found_link
        && rec.backrefs.is_empty()
}

/// Finalize what can be finalized on `ino`: resolve satisfied backrefs,
/// derive size/extent errors once checked, and drop the record when clean.
pub fn maybe_free_inode_rec(cache: &mut InodeCache, ino: u64) {
    let Some(rec) = cache.get_mut(&ino) else {
        return;
    };
    if !rec.found_inode_item {
        return;
    }

    let filetype = imode_to_type(rec.imode);
    rec.backrefs.retain_mut(|backref| {
        if backref.found_dir_item && backref.found_dir_index {
            if backref.filetype != filetype {
                backref.errors |= REF_ERR_FILETYPE_UNMATCH;
            }
            if backref.errors == 0 && backref.found_inode_ref {
                return false;
            }
        }
        true
    });

    if !rec.checked || rec.merging {
        return;
    }

    if is_dir(rec.imode) {
        if rec.found_size != rec.isize {
            rec.errors |= I_ERR_DIR_ISIZE_WRONG;
        }
        if rec.found_file_extent {
            rec.errors |= I_ERR_ODD_FILE_EXTENT;
        }
    } else if is_reg(rec.imode) || is_symlink(rec.imode) {
        if rec.found_dir_item {
            rec.errors |= I_ERR_ODD_DIR_ITEM;
        }
        if rec.found_size != rec.nbytes {
            rec.errors |= I_ERR_FILE_NBYTES_WRONG;
        }
        if rec.extent_start == u64::MAX || rec.extent_start > 0 {
            rec.first_extent_gap = 0;
        }
        if rec.nlink > 0
            && (rec.extent_end < rec.isize || rec.first_extent_gap < rec.isize)
        {
            rec.errors |= I_ERR_FILE_EXTENT_DISCOUNT;
        }
    }

    if is_reg(rec.imode) || is_symlink(rec.imode) {
        if rec.found_csum_item && rec.nodatasum {
            rec.errors |= I_ERR_ODD_CSUM_ITEM;
        }
        if rec.some_csum_missing && !rec.nodatasum {
            rec.errors |= I_ERR_SOME_CSUM_MISSING;
        }
    }

    if can_free_inode_rec(rec) {
        cache.remove(&ino);
    }
}

/// Fold `src` into the record for the same inode in `dst_cache`. Used when
/// two walkers met the same inode under a shared subtree. Field-wise the
/// merge is commutative; error flags accumulate.
pub fn merge_inode_recs(src: &InodeRecord, dst_cache: &mut InodeCache) {
    let mut dir_count = 0_u32;
    {
        let dst = get_inode_rec(dst_cache, src.ino);
        dst.merging = true;
    }
    for backref in &src.backrefs {
        if backref.found_dir_index {
            let dst = get_inode_rec(dst_cache, src.ino);
            add_backref_to_rec(
                dst,
                backref.dir,
                backref.index,
                &backref.name,
                backref.filetype,
                ITEM_DIR_INDEX,
                backref.errors,
            );
        }
        if backref.found_dir_item {
            dir_count += 1;
            let dst = get_inode_rec(dst_cache, src.ino);
            add_backref_to_rec(
                dst,
                backref.dir,
                0,
                &backref.name,
                backref.filetype,
                ITEM_DIR_ITEM,
                backref.errors,
            );
        }
        if backref.found_inode_ref {
            let dst = get_inode_rec(dst_cache, src.ino);
            add_backref_to_rec(
                dst,
                backref.dir,
                backref.index,
                &backref.name,
                0,
                backref.ref_type.max(ITEM_INODE_REF),
                backref.errors,
            );
        }
    }

    let dst = get_inode_rec(dst_cache, src.ino);
    if src.found_dir_item {
        dst.found_dir_item = true;
    }
    if src.found_file_extent {
        dst.found_file_extent = true;
    }
    if src.found_csum_item {
        dst.found_csum_item = true;
    }
    if src.some_csum_missing {
        dst.some_csum_missing = true;
    }
    if dst.first_extent_gap > src.first_extent_gap {
        dst.first_extent_gap = src.first_extent_gap;
    }

    debug_assert!(src.found_link >= dir_count);
    dst.found_link += src.found_link - dir_count;
    dst.found_size += src.found_size;

    if src.extent_start != u64::MAX {
        if dst.extent_start == u64::MAX {
            dst.extent_start = src.extent_start;
            dst.extent_end = src.extent_end;
        } else {
            if dst.extent_end > src.extent_start {
                dst.errors |= I_ERR_FILE_EXTENT_OVERLAP;
            } else if dst.extent_end < src.extent_start
                && dst.extent_end < dst.first_extent_gap
            {
                dst.first_extent_gap = dst.extent_end;
            }
            if dst.extent_end < src.extent_end {
                dst.extent_end = src.extent_end;
            }
        }
    }

    dst.errors |= src.errors;
    if src.found_inode_item {
        if dst.found_inode_item {
            dst.errors |= I_ERR_DUP_INODE_ITEM;
        } else {
            dst.nlink = src.nlink;
            dst.isize = src.isize;
            dst.nbytes = src.nbytes;
            dst.imode = src.imode;
            dst.nodatasum = src.nodatasum;
            dst.found_inode_item = true;
        }
    }
    dst.merging = false;
}

/// The root directory of a subvolume must look exactly one way: a single
/// inode-ref named ".." at index 0, no dir entries pointing at it.
#[must_use]
pub fn check_root_dir(rec: &InodeRecord) -> bool {
    if !rec.found_inode_item || rec.errors != 0 {
        return false;
    }
    if rec.nlink != 1 || rec.found_link != 0 {
        return false;
    }
    if rec.backrefs.len() != 1 {
        return false;
    }
    let backref = &rec.backrefs[0];
    backref.found_inode_ref
        && backref.index == 0
        && backref.name == b".."
        && !backref.found_dir_index
        && !backref.found_dir_item
}

/// One reported inconsistency from the per-root final pass.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct InodeProblem {
    pub root: u64,
    pub ino: u64,
    pub errors: u32,
    pub unresolved_refs: usize,
}

/// Final pass over a fully-walked root: flag missing inode items, wrong
/// link counts, and unresolved links; absolve nlink-0 inodes that have an
/// orphan item.
pub fn check_inode_recs(
    root_objectid: u64,
    root_dirid: u64,
    root_refs: u32,
    cache: &mut InodeCache,
    mut has_orphan_item: impl FnMut(u64) -> bool,
) -> Vec<InodeProblem> {
    let mut problems = Vec::new();

    if root_refs == 0 {
        // A dropping root carries no authoritative inode state.
        cache.clear();
        return problems;
    }

    match cache.get(&root_dirid) {
        Some(rec) => {
            if !check_root_dir(rec) {
                problems.push(InodeProblem {
                    root: root_objectid,
                    ino: root_dirid,
                    errors: rec.errors,
                    unresolved_refs: rec.backrefs.len(),
                });
            }
        }
        None => {
            problems.push(InodeProblem {
                root: root_objectid,
                ino: root_dirid,
                errors: I_ERR_NO_INODE_ITEM,
                unresolved_refs: 0,
            });
        }
    }

    let inos: Vec<u64> = cache.keys().copied().collect();
    for ino in inos {
        let Some(mut rec) = cache.remove(&ino) else {
            continue;
        };
        if rec.ino == root_dirid || rec.ino == sfs_types::ORPHAN_OBJECTID {
            continue;
        }

        if rec.errors & I_ERR_NO_ORPHAN_ITEM != 0 && has_orphan_item(rec.ino) {
            rec.errors &= !I_ERR_NO_ORPHAN_ITEM;
            if can_free_inode_rec(&rec) {
                continue;
            }
        }

        if !rec.found_inode_item {
            rec.errors |= I_ERR_NO_INODE_ITEM;
        }
        if rec.found_link != rec.nlink {
            rec.errors |= I_ERR_LINK_COUNT_WRONG;
        }
        for backref in &mut rec.backrefs {
            if !backref.found_dir_item {
                backref.errors |= REF_ERR_NO_DIR_ITEM;
            }
            if !backref.found_dir_index {
                backref.errors |= REF_ERR_NO_DIR_INDEX;
            }
            if !backref.found_inode_ref {
                backref.errors |= REF_ERR_NO_INODE_REF;
            }
        }
        problems.push(InodeProblem {
            root: root_objectid,
            ino: rec.ino,
            errors: rec.errors,
            unresolved_refs: rec.backrefs.len(),
        });
    }
    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_types::{S_IFDIR, S_IFREG};

    fn complete_reg(cache: &mut InodeCache, ino: u64, nlink: u32, size: u64) {
        let rec = get_inode_rec(cache, ino);
        rec.nlink = nlink;
        rec.imode = S_IFREG | 0o644;
        rec.isize = size;
        rec.nbytes = size;
        rec.found_size = size;
        rec.extent_start = 0;
        rec.extent_end = size;
        rec.found_inode_item = true;
        rec.nodatasum = true;
    }

    #[test]
    fn clean_inode_record_is_freed() {
        let mut cache = InodeCache::new();
        complete_reg(&mut cache, 257, 1, 4096);
        add_inode_backref(&mut cache, 257, 256, 2, b"file", sfs_types::FT_REG_FILE, ITEM_DIR_ITEM, 0);
        add_inode_backref(&mut cache, 257, 256, 2, b"file", sfs_types::FT_REG_FILE, ITEM_DIR_INDEX, 0);
        add_inode_backref(&mut cache, 257, 256, 2, b"file", 0, ITEM_INODE_REF, 0);

        cache.get_mut(&257).expect("present").checked = true;
        maybe_free_inode_rec(&mut cache, 257);
        assert!(!cache.contains_key(&257), "clean record must be released");
    }

    #[test]
    fn index_mismatch_flagged() {
        let mut cache = InodeCache::new();
        add_inode_backref(&mut cache, 257, 256, 2, b"f", sfs_types::FT_REG_FILE, ITEM_DIR_INDEX, 0);
        add_inode_backref(&mut cache, 257, 256, 9, b"f", 0, ITEM_INODE_REF, 0);
        let backref = &cache[&257].backrefs[0];
        assert!(backref.errors & REF_ERR_INDEX_UNMATCH != 0);
    }

    #[test]
    fn duplicate_dir_item_flagged() {
        let mut cache = InodeCache::new();
        add_inode_backref(&mut cache, 257, 256, 0, b"f", sfs_types::FT_REG_FILE, ITEM_DIR_ITEM, 0);
        add_inode_backref(&mut cache, 257, 256, 0, b"f", sfs_types::FT_REG_FILE, ITEM_DIR_ITEM, 0);
        let rec = &cache[&257];
        assert_eq!(rec.found_link, 2);
        assert!(rec.backrefs[0].errors & REF_ERR_DUP_DIR_ITEM != 0);
    }

    #[test]
    fn dir_size_mismatch_flagged() {
        let mut cache = InodeCache::new();
        let rec = get_inode_rec(&mut cache, 256);
        rec.imode = S_IFDIR | 0o755;
        rec.isize = 10;
        rec.found_size = 4;
        rec.nlink = 1;
        rec.found_inode_item = true;
        rec.checked = true;
        maybe_free_inode_rec(&mut cache, 256);
        assert!(cache[&256].errors & I_ERR_DIR_ISIZE_WRONG != 0);
    }

    // Merging is commutative: building from two halves in either order
    // produces the same record.
    #[test]
    fn merge_is_commutative() {
        let mut a = InodeRecord::new(42);
        a.found_size = 100;
        a.extent_start = 0;
        a.extent_end = 4096;
        add_backref_to_rec(&mut a, 256, 3, b"name", sfs_types::FT_REG_FILE, ITEM_DIR_ITEM, 0);
        add_backref_to_rec(&mut a, 256, 3, b"name", sfs_types::FT_REG_FILE, ITEM_DIR_INDEX, 0);

        let mut b = InodeRecord::new(42);
        b.nlink = 1;
        b.imode = S_IFREG | 0o600;
        b.nbytes = 4196;
        b.isize = 4196;
        b.found_size = 96;
        b.found_inode_item = true;
        b.extent_start = 4096;
        b.extent_end = 8192;
        add_backref_to_rec(&mut b, 256, 3, b"name", 0, ITEM_INODE_REF, 0);

        let mut ab = InodeCache::new();
        merge_inode_recs(&a, &mut ab);
        merge_inode_recs(&b, &mut ab);

        let mut ba = InodeCache::new();
        merge_inode_recs(&b, &mut ba);
        merge_inode_recs(&a, &mut ba);

        assert_eq!(ab.get(&42), ba.get(&42));
        let merged = &ab[&42];
        assert_eq!(merged.found_link, 1);
        assert_eq!(merged.found_size, 196);
        assert_eq!(merged.extent_start, 0);
        assert_eq!(merged.extent_end, 8192);
        let backref = &merged.backrefs[0];
        assert!(backref.found_dir_item && backref.found_dir_index && backref.found_inode_ref);
        assert_eq!(backref.errors, 0);
    }

    #[test]
    fn overlapping_extent_spans_flag_on_merge() {
        let mut a = InodeRecord::new(7);
        a.extent_start = 0;
        a.extent_end = 8192;
        let mut b = InodeRecord::new(7);
        b.extent_start = 4096;
        b.extent_end = 12288;

        let mut cache = InodeCache::new();
        merge_inode_recs(&a, &mut cache);
        merge_inode_recs(&b, &mut cache);
        assert!(cache[&7].errors & I_ERR_FILE_EXTENT_OVERLAP != 0);
    }

    #[test]
    fn root_dir_shape() {
        let mut rec = InodeRecord::new(256);
        rec.nlink = 1;
        rec.imode = S_IFDIR | 0o755;
        rec.found_inode_item = true;
        add_backref_to_rec(&mut rec, 256, 0, b"..", 0, ITEM_INODE_REF, 0);
        assert!(check_root_dir(&rec));

        add_backref_to_rec(&mut rec, 255, 1, b"entry", sfs_types::FT_DIR, ITEM_DIR_ITEM, 0);
        assert!(!check_root_dir(&rec));
    }

    #[test]
    fn orphan_item_absolves_zero_nlink() {
        let mut cache = InodeCache::new();
        complete_reg(&mut cache, 300, 0, 0);
        {
            let rec = cache.get_mut(&300).expect("rec");
            rec.errors |= I_ERR_NO_ORPHAN_ITEM;
            rec.checked = true;
            rec.found_link = 0;
        }
        let problems = check_inode_recs(5, 256, 1, &mut cache, |ino| ino == 300);
        // Only the missing root-dir record is reported.
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].ino, 256);
    }
}
