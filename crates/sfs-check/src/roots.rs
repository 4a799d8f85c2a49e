//! Cross-tree (subvolume/snapshot) reference checking.
//!
//! Builds a directed reference graph over fs trees from ROOT_REF /
//! ROOT_BACKREF items plus the directory entries pointing at subvolumes,
//! then iteratively revokes reachability from trees whose referrers are
//! themselves unreachable.

use crate::ino::{
    InodeCache, REF_ERR_DUP_ROOT_BACKREF, REF_ERR_DUP_ROOT_REF, REF_ERR_INDEX_UNMATCH,
    REF_ERR_NO_DIR_INDEX, REF_ERR_NO_DIR_ITEM, REF_ERR_NO_ROOT_BACKREF, REF_ERR_NO_ROOT_REF,
};
use sfs_error::Result;
use sfs_types::{
    Key, FIRST_FREE_OBJECTID, FS_TREE_OBJECTID, ITEM_DIR_INDEX, ITEM_DIR_ITEM, ITEM_ROOT_BACKREF,
    ITEM_ROOT_REF, LAST_FREE_OBJECTID, TREE_RELOC_OBJECTID,
};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootBackref {
    pub ref_root: u64,
    pub dir: u64,
    pub index: u64,
    pub name: Vec<u8>,
    pub errors: u32,
    pub found_dir_item: bool,
    pub found_dir_index: bool,
    pub found_back_ref: bool,
    pub found_forward_ref: bool,
    pub reachable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootRecord {
    pub objectid: u64,
    pub found_root_item: bool,
    pub found_ref: u32,
    pub backrefs: Vec<RootBackref>,
}

pub type RootCache = BTreeMap<u64, RootRecord>;

pub fn get_root_rec(cache: &mut RootCache, objectid: u64) -> &mut RootRecord {
    cache.entry(objectid).or_insert_with(|| RootRecord {
        objectid,
        ..RootRecord::default()
    })
}

fn get_root_backref<'a>(
    rec: &'a mut RootRecord,
    ref_root: u64,
    dir: u64,
    index: u64,
    name: &[u8],
) -> &'a mut RootBackref {
    let pos = rec.backrefs.iter().position(|backref| {
        backref.ref_root == ref_root && backref.dir == dir && backref.name == name
    });
    match pos {
        Some(idx) => &mut rec.backrefs[idx],
        None => {
            rec.backrefs.push(RootBackref {
                ref_root,
                dir,
                index,
                name: name.to_vec(),
                errors: 0,
                found_dir_item: false,
                found_dir_index: false,
                found_back_ref: false,
                found_forward_ref: false,
                reachable: false,
            });
            rec.backrefs.last_mut().expect("just pushed")
        }
    }
}

/// Record one cross-tree reference observation.
#[allow(clippy::too_many_arguments)]
pub fn add_root_backref(
    cache: &mut RootCache,
    root_id: u64,
    ref_root: u64,
    dir: u64,
    index: u64,
    name: &[u8],
    item_type: u8,
    errors: u32,
) {
    let rec = get_root_rec(cache, root_id);
    let mut bump_found_ref = false;
    {
        let backref = get_root_backref(rec, ref_root, dir, index, name);
        backref.errors |= errors;

        if item_type != ITEM_DIR_ITEM {
            if backref.found_dir_index || backref.found_back_ref || backref.found_forward_ref {
                if backref.index != index {
                    backref.errors |= REF_ERR_INDEX_UNMATCH;
                }
            } else {
                backref.index = index;
            }
        }

        match item_type {
            ITEM_DIR_ITEM => {
                backref.found_dir_item = true;
                backref.reachable = true;
                bump_found_ref = true;
            }
            ITEM_DIR_INDEX => backref.found_dir_index = true,
            ITEM_ROOT_REF => {
                if backref.found_forward_ref {
                    backref.errors |= REF_ERR_DUP_ROOT_REF;
                }
                backref.found_forward_ref = true;
            }
            ITEM_ROOT_BACKREF => {
                if backref.found_back_ref {
                    backref.errors |= REF_ERR_DUP_ROOT_BACKREF;
                }
                backref.found_back_ref = true;
            }
            _ => unreachable!("caller dispatches only root ref item types"),
        }
    }
    if bump_found_ref {
        rec.found_ref += 1;
    }
}

/// Consume one ROOT_REF / ROOT_BACKREF item from the root tree.
pub fn process_root_ref(key: &Key, entry: &sfs_ondisk::RootRef, cache: &mut RootCache) {
    let max = sfs_types::MAX_NAME_LEN;
    let (name, errors) = if entry.name.len() <= max {
        (entry.name.as_slice(), 0)
    } else {
        (&entry.name[..max], crate::ino::REF_ERR_NAME_TOO_LONG)
    };
    if key.item_type == ITEM_ROOT_REF {
        add_root_backref(
            cache,
            key.offset,
            key.objectid,
            entry.dirid,
            entry.sequence,
            name,
            ITEM_ROOT_REF,
            errors,
        );
    } else {
        add_root_backref(
            cache,
            key.objectid,
            key.offset,
            entry.dirid,
            entry.sequence,
            name,
            ITEM_ROOT_BACKREF,
            errors,
        );
    }
}

/// Fold the subvolume references a tree walk accumulated (as pseudo inode
/// records keyed by child root id) into the global root cache.
///
/// `is_child_root(parent, child)` resolves whether the root tree confirms
/// the parent/child relationship.
pub fn merge_root_recs(
    root_objectid: u64,
    src: &mut InodeCache,
    dst: &mut RootCache,
    mut is_child_root: impl FnMut(u64, u64) -> Result<bool>,
) -> Result<()> {
    if root_objectid == TREE_RELOC_OBJECTID {
        src.clear();
        return Ok(());
    }

    while let Some((child_id, rec)) = src.pop_first() {
        if !is_child_root(root_objectid, child_id)? {
            continue;
        }
        for backref in &rec.backrefs {
            debug_assert!(!backref.found_inode_ref);
            if backref.found_dir_item {
                add_root_backref(
                    dst,
                    child_id,
                    root_objectid,
                    backref.dir,
                    backref.index,
                    &backref.name,
                    ITEM_DIR_ITEM,
                    backref.errors,
                );
            }
            if backref.found_dir_index {
                add_root_backref(
                    dst,
                    child_id,
                    root_objectid,
                    backref.dir,
                    backref.index,
                    &backref.name,
                    ITEM_DIR_INDEX,
                    backref.errors,
                );
            }
        }
    }
    Ok(())
}

/// One reported problem from the root-ref pass.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RootProblem {
    pub objectid: u64,
    pub found_ref: u32,
    pub found_root_item: bool,
    pub unreachable: bool,
}

/// Verify the reference graph: every fs tree must be reachable from the
/// default tree (or absolved by an orphan item), and every reachable
/// backref must be fully described.
pub fn check_root_refs(
    cache: &mut RootCache,
    mut has_orphan_item: impl FnMut(u64) -> Result<bool>,
) -> Result<Vec<RootProblem>> {
    get_root_rec(cache, FS_TREE_OBJECTID).found_ref = 1;

    // Iteratively revoke reachability contributed by unreferenced trees.
    // Circular reference groups keep each other alive and are not detected.
    let mut changed = true;
    while changed {
        changed = false;
        let ids: Vec<u64> = cache.keys().copied().collect();
        for id in ids {
            let rec = cache.get(&id).expect("present");
            if rec.found_ref == 0 {
                continue;
            }
            let referrers: Vec<(usize, u64)> = rec
                .backrefs
                .iter()
                .enumerate()
                .filter(|(_, b)| b.reachable)
                .map(|(i, b)| (i, b.ref_root))
                .collect();
            for (idx, ref_root) in referrers {
                let referrer_live = get_root_rec(cache, ref_root).found_ref > 0;
                if referrer_live {
                    continue;
                }
                let rec = cache.get_mut(&id).expect("present");
                if !rec.backrefs[idx].reachable {
                    continue;
                }
                rec.backrefs[idx].reachable = false;
                rec.found_ref -= 1;
                if rec.found_ref == 0 {
                    changed = true;
                }
            }
        }
    }

    let mut problems = Vec::new();
    let ids: Vec<u64> = cache.keys().copied().collect();
    for id in ids {
        let rec = cache.get_mut(&id).expect("present");
        if rec.found_ref == 0
            && (FIRST_FREE_OBJECTID..=LAST_FREE_OBJECTID).contains(&rec.objectid)
        {
            if has_orphan_item(rec.objectid)? {
                continue;
            }
            problems.push(RootProblem {
                objectid: rec.objectid,
                found_ref: 0,
                found_root_item: rec.found_root_item,
                unreachable: true,
            });
            continue;
        }

        let mut error = rec.found_ref > 0 && !rec.found_root_item;
        for backref in &mut rec.backrefs {
            if !backref.found_dir_item {
                backref.errors |= REF_ERR_NO_DIR_ITEM;
            }
            if !backref.found_dir_index {
                backref.errors |= REF_ERR_NO_DIR_INDEX;
            }
            if !backref.found_back_ref {
                backref.errors |= REF_ERR_NO_ROOT_BACKREF;
            }
            if !backref.found_forward_ref {
                backref.errors |= REF_ERR_NO_ROOT_REF;
            }
            if backref.reachable && backref.errors != 0 {
                error = true;
            }
        }
        if error {
            problems.push(RootProblem {
                objectid: rec.objectid,
                found_ref: rec.found_ref,
                found_root_item: rec.found_root_item,
                unreachable: false,
            });
        }
    }
    Ok(problems)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_link(cache: &mut RootCache, child: u64, parent: u64, name: &[u8]) {
        add_root_backref(cache, child, parent, 256, 2, name, ITEM_DIR_ITEM, 0);
        add_root_backref(cache, child, parent, 256, 2, name, ITEM_DIR_INDEX, 0);
        add_root_backref(cache, child, parent, 256, 2, name, ITEM_ROOT_REF, 0);
        add_root_backref(cache, child, parent, 256, 2, name, ITEM_ROOT_BACKREF, 0);
    }

    #[test]
    fn fully_linked_subvolume_is_clean() {
        let mut cache = RootCache::new();
        get_root_rec(&mut cache, 256).found_root_item = true;
        full_link(&mut cache, 256, FS_TREE_OBJECTID, b"subvol");
        get_root_rec(&mut cache, FS_TREE_OBJECTID).found_root_item = true;

        let problems = check_root_refs(&mut cache, |_| Ok(false)).expect("check");
        assert!(problems.is_empty(), "unexpected problems: {problems:?}");
    }

    #[test]
    fn unreachable_tree_reported() {
        let mut cache = RootCache::new();
        get_root_rec(&mut cache, 257).found_root_item = true;

        let problems = check_root_refs(&mut cache, |_| Ok(false)).expect("check");
        assert_eq!(problems.len(), 1);
        assert!(problems[0].unreachable);
        assert_eq!(problems[0].objectid, 257);
    }

    #[test]
    fn orphan_item_absolves_unreachable_tree() {
        let mut cache = RootCache::new();
        get_root_rec(&mut cache, 257).found_root_item = true;

        let problems = check_root_refs(&mut cache, |id| Ok(id == 257)).expect("check");
        assert!(problems.is_empty());
    }

    #[test]
    fn reachability_revocation_cascades() {
        let mut cache = RootCache::new();
        // 258 is referenced only by 257, which nothing references.
        get_root_rec(&mut cache, 257).found_root_item = true;
        get_root_rec(&mut cache, 258).found_root_item = true;
        full_link(&mut cache, 258, 257, b"nested");

        let problems = check_root_refs(&mut cache, |_| Ok(false)).expect("check");
        let unreachable: Vec<u64> = problems
            .iter()
            .filter(|p| p.unreachable)
            .map(|p| p.objectid)
            .collect();
        assert_eq!(unreachable, vec![257, 258]);
    }

    #[test]
    fn missing_root_backref_flagged() {
        let mut cache = RootCache::new();
        get_root_rec(&mut cache, 256).found_root_item = true;
        add_root_backref(&mut cache, 256, FS_TREE_OBJECTID, 256, 2, b"v", ITEM_DIR_ITEM, 0);
        add_root_backref(&mut cache, 256, FS_TREE_OBJECTID, 256, 2, b"v", ITEM_DIR_INDEX, 0);

        let problems = check_root_refs(&mut cache, |_| Ok(false)).expect("check");
        assert_eq!(problems.len(), 1);
        assert!(!problems[0].unreachable);
        let backref = &cache[&256].backrefs[0];
        assert!(backref.errors & REF_ERR_NO_ROOT_BACKREF != 0);
        assert!(backref.errors & REF_ERR_NO_ROOT_REF != 0);
    }
}
