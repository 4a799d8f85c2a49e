//! Extent/backref reconciliation.
//!
//! Two independent populations are accumulated per extent: references
//! declared by the extent tree (`found_extent_tree` / `num_refs`) and
//! references discovered by walking the trees (`found_ref`). A healthy
//! filesystem balances them exactly; the repairer rebuilds the extent tree
//! from the walked side when they disagree.

use crate::RunStats;
use sfs_ondisk::{
    parse_extent_data_ref, parse_extent_item, parse_extent_ref_v0, parse_file_extent,
    parse_shared_data_ref, FileExtent, InlineRef, TreeBlock,
};
use sfs_tree::{FreedRef, RefEvent};
use sfs_types::{Key, EXTENT_TREE_OBJECTID, FIRST_FREE_OBJECTID};
use std::collections::BTreeMap;
use tracing::warn;

/// Who points at an extent: either its owning root or (full backref) the
/// parent tree block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackrefLink {
    Root(u64),
    Parent(u64),
}

impl BackrefLink {
    #[must_use]
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Parent(_))
    }
}

/// A tree-block reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeBackref {
    pub link: BackrefLink,
    pub found_ref: bool,
    pub found_extent_tree: bool,
}

/// A data-extent reference; carries the (owner inode, file offset) identity
/// and both reference counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBackref {
    pub link: BackrefLink,
    pub owner: u64,
    pub offset: u64,
    pub bytes: u64,
    pub num_refs: u32,
    pub found_ref: u32,
    pub found_ref_flag: bool,
    pub found_extent_tree: bool,
}

/// Sum type replacing the C-style tagged base struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backref {
    Tree(TreeBackref),
    Data(DataBackref),
}

impl Backref {
    #[must_use]
    pub fn found_extent_tree(&self) -> bool {
        match self {
            Self::Tree(t) => t.found_extent_tree,
            Self::Data(d) => d.found_extent_tree,
        }
    }

    #[must_use]
    pub fn found_ref(&self) -> bool {
        match self {
            Self::Tree(t) => t.found_ref,
            Self::Data(d) => d.found_ref_flag,
        }
    }
}

/// Accumulated state of one extent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentRecord {
    pub start: u64,
    pub nr: u64,
    pub max_size: u64,
    /// References found by walking trees.
    pub refs: u64,
    /// References declared by the extent tree.
    pub extent_item_refs: u64,
    pub generation: u64,
    pub parent_key: Option<Key>,
    pub info_objectid: u64,
    pub info_level: u8,
    pub content_checked: bool,
    pub owner_ref_checked: bool,
    pub is_root: bool,
    pub metadata: bool,
    pub backrefs: Vec<Backref>,
}

impl ExtentRecord {
    fn new(start: u64, nr: u64, max_size: u64) -> Self {
        Self {
            start,
            nr,
            max_size,
            refs: 0,
            extent_item_refs: 0,
            generation: 0,
            parent_key: None,
            info_objectid: 0,
            info_level: 0,
            content_checked: false,
            owner_ref_checked: false,
            is_root: false,
            metadata: false,
            backrefs: Vec::new(),
        }
    }
}

/// Extent records keyed by start bytenr.
#[derive(Debug, Default)]
pub struct ExtentCache {
    map: BTreeMap<u64, ExtentRecord>,
}

impl ExtentCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Record containing `bytenr`, if any.
    pub fn find(&mut self, bytenr: u64) -> Option<&mut ExtentRecord> {
        let (&start, rec) = self.map.range_mut(..=bytenr).next_back()?;
        (start == bytenr || start + rec.nr.max(1) > bytenr).then_some(rec)
    }

    #[must_use]
    pub fn get(&self, start: u64) -> Option<&ExtentRecord> {
        self.map.get(&start)
    }

    pub fn remove(&mut self, start: u64) -> Option<ExtentRecord> {
        self.map.remove(&start)
    }

    pub fn pop_first(&mut self) -> Option<ExtentRecord> {
        self.map.pop_first().map(|(_, rec)| rec)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExtentRecord> {
        self.map.values()
    }

    pub fn starts(&self) -> Vec<(u64, u64)> {
        self.map.values().map(|r| (r.start, r.max_size.max(r.nr))).collect()
    }
}

/// Add or update the extent record for `[start, start + nr)`.
///
/// `extent_rec` marks information sourced from an extent-tree item (which
/// is authoritative for `nr`); `inc_ref` counts one walked reference;
/// `set_checked` marks pseudo-records that need no content verification.
#[allow(clippy::too_many_arguments)]
pub fn add_extent_rec(
    cache: &mut ExtentCache,
    parent_key: Option<&Key>,
    start: u64,
    nr: u64,
    extent_item_refs: u64,
    is_root: bool,
    inc_ref: bool,
    set_checked: bool,
    metadata: bool,
    extent_rec: bool,
    max_size: u64,
    stats: &mut RunStats,
) -> bool {
    let mut mismatch = false;
    if let Some(rec) = cache.find(start) {
        if inc_ref {
            rec.refs += 1;
        }
        if rec.nr == 1 {
            rec.nr = nr.max(max_size);
        }
        // Reset nr to the extent tree's declared size so backref byte
        // counts can be compared against it.
        if extent_rec {
            rec.nr = nr;
        }
        if start != rec.start {
            warn!(rec_start = rec.start, start, "extent record start mismatch");
            mismatch = true;
        }
        if extent_item_refs != 0 {
            if rec.extent_item_refs != 0 {
                warn!(
                    start,
                    existing = rec.extent_item_refs,
                    passed = extent_item_refs,
                    "duplicate extent item refs"
                );
            }
            rec.extent_item_refs = extent_item_refs;
        }
        if is_root {
            rec.is_root = true;
        }
        if set_checked {
            rec.content_checked = true;
            rec.owner_ref_checked = true;
        }
        if let Some(key) = parent_key {
            rec.parent_key = Some(*key);
        }
        if rec.max_size < max_size {
            rec.max_size = max_size;
        }
        maybe_free_extent_rec(cache, start);
        return mismatch;
    }

    let mut rec = ExtentRecord::new(start, nr.max(max_size), max_size);
    if extent_rec {
        rec.nr = nr;
    }
    rec.is_root = is_root;
    rec.metadata = metadata;
    if inc_ref {
        rec.refs = 1;
    }
    rec.extent_item_refs = extent_item_refs;
    rec.parent_key = parent_key.copied();
    if set_checked {
        rec.content_checked = true;
        rec.owner_ref_checked = true;
    }
    stats.bytes_used += rec.nr;
    cache.map.insert(start, rec);
    mismatch
}

fn find_tree_backref_idx(rec: &ExtentRecord, parent: u64, root: u64) -> Option<usize> {
    rec.backrefs.iter().position(|backref| match backref {
        Backref::Tree(t) => {
            if parent > 0 {
                t.link == BackrefLink::Parent(parent)
            } else {
                t.link == BackrefLink::Root(root)
            }
        }
        Backref::Data(_) => false,
    })
}

fn find_data_backref_idx(
    rec: &ExtentRecord,
    parent: u64,
    root: u64,
    owner: u64,
    offset: u64,
    found_ref: bool,
    bytes: u64,
) -> Option<usize> {
    rec.backrefs.iter().position(|backref| match backref {
        Backref::Data(d) => {
            if parent > 0 {
                d.link == BackrefLink::Parent(parent)
            } else if d.link == BackrefLink::Root(root) && d.owner == owner && d.offset == offset
            {
                // A walked ref carries the real byte count and must match an
                // already-walked entry exactly.
                !(found_ref && d.found_ref_flag && d.bytes != bytes)
            } else {
                false
            }
        }
        Backref::Tree(_) => false,
    })
}

/// Record one tree-block reference. `found_ref` selects the walked side,
/// otherwise the extent-tree side.
pub fn add_tree_backref(
    cache: &mut ExtentCache,
    bytenr: u64,
    parent: u64,
    root: u64,
    found_ref: bool,
    stats: &mut RunStats,
) {
    if cache.find(bytenr).is_none() {
        add_extent_rec(
            cache, None, bytenr, 1, 0, false, false, false, true, false, 0, stats,
        );
    }
    let rec = cache.find(bytenr).expect("record just ensured");

    let idx = match find_tree_backref_idx(rec, parent, root) {
        Some(idx) => idx,
        None => {
            let link = if parent > 0 {
                BackrefLink::Parent(parent)
            } else {
                BackrefLink::Root(root)
            };
            rec.backrefs.push(Backref::Tree(TreeBackref {
                link,
                found_ref: false,
                found_extent_tree: false,
            }));
            rec.backrefs.len() - 1
        }
    };
    let Backref::Tree(backref) = &mut rec.backrefs[idx] else {
        unreachable!("index points at a tree backref");
    };
    if found_ref {
        if backref.found_ref {
            warn!(bytenr, parent, root, "duplicate walked tree backref");
        }
        backref.found_ref = true;
    } else {
        if backref.found_extent_tree {
            warn!(bytenr, parent, root, "duplicate declared tree backref");
        }
        backref.found_extent_tree = true;
    }
}

/// Record one data reference.
#[allow(clippy::too_many_arguments)]
pub fn add_data_backref(
    cache: &mut ExtentCache,
    bytenr: u64,
    parent: u64,
    root: u64,
    owner: u64,
    offset: u64,
    num_refs: u32,
    found_ref: bool,
    max_size: u64,
    stats: &mut RunStats,
) {
    if cache.find(bytenr).is_none() {
        add_extent_rec(
            cache, None, bytenr, 1, 0, false, false, false, false, false, max_size, stats,
        );
    }
    let rec = cache.find(bytenr).expect("record just ensured");
    if rec.max_size < max_size {
        rec.max_size = max_size;
    }

    let idx = match find_data_backref_idx(rec, parent, root, owner, offset, found_ref, max_size)
    {
        Some(idx) => idx,
        None => {
            let link = if parent > 0 {
                BackrefLink::Parent(parent)
            } else {
                BackrefLink::Root(root)
            };
            rec.backrefs.push(Backref::Data(DataBackref {
                link,
                owner: if parent > 0 { 0 } else { owner },
                offset: if parent > 0 { 0 } else { offset },
                bytes: max_size,
                num_refs: 0,
                found_ref: 0,
                found_ref_flag: false,
                found_extent_tree: false,
            }));
            rec.backrefs.len() - 1
        }
    };
    let Backref::Data(backref) = &mut rec.backrefs[idx] else {
        unreachable!("index points at a data backref");
    };
    if found_ref {
        debug_assert_eq!(num_refs, 1);
        backref.found_ref_flag = true;
        backref.found_ref += 1;
        backref.bytes = max_size;
    } else {
        if backref.found_extent_tree {
            warn!(bytenr, parent, root, owner, offset, "duplicate declared data backref");
        }
        backref.num_refs = num_refs;
        backref.found_extent_tree = true;
    }
}

/// Verify every backref of `rec` balances. Returns the list of problems
/// (empty means consistent).
#[must_use]
pub fn backpointer_problems(rec: &ExtentRecord) -> Vec<String> {
    let mut problems = Vec::new();
    let mut found = 0_u64;
    for backref in &rec.backrefs {
        if !backref.found_extent_tree() {
            problems.push(format!(
                "backref of {} not found in extent tree",
                rec.start
            ));
        }
        match backref {
            Backref::Tree(t) => {
                if !t.found_ref {
                    problems.push(format!(
                        "declared tree backref of {} never walked ({:?})",
                        rec.start, t.link
                    ));
                }
                found += 1;
            }
            Backref::Data(d) => {
                if d.found_ref != d.num_refs {
                    problems.push(format!(
                        "data backref count on {} owner {} offset {}: found {} wanted {}",
                        rec.start, d.owner, d.offset, d.found_ref, d.num_refs
                    ));
                }
                if d.bytes != rec.nr {
                    problems.push(format!(
                        "data backref bytes on {}: backref {} extent {}",
                        rec.start, d.bytes, rec.nr
                    ));
                }
                found += u64::from(d.found_ref);
            }
        }
    }
    if found != rec.refs {
        problems.push(format!(
            "global ref count on {}: found {} wanted {}",
            rec.start, found, rec.refs
        ));
    }
    problems
}

#[must_use]
pub fn all_backpointers_checked(rec: &ExtentRecord) -> bool {
    backpointer_problems(rec).is_empty()
}

/// Drop the record once everything about it has balanced.
pub fn maybe_free_extent_rec(cache: &mut ExtentCache, start: u64) {
    let Some(rec) = cache.find(start) else {
        return;
    };
    if rec.content_checked
        && rec.owner_ref_checked
        && rec.refs == rec.extent_item_refs
        && rec.refs > 0
        && all_backpointers_checked(rec)
    {
        let start = rec.start;
        cache.remove(start);
    }
}

/// A record whose only walked references come from the extent tree itself
/// (pruning such a block must go through the extent tree).
#[must_use]
pub fn is_extent_tree_record(rec: &ExtentRecord) -> bool {
    let mut is_extent = false;
    for backref in &rec.backrefs {
        match backref {
            Backref::Data(_) => return false,
            Backref::Tree(t) => match t.link {
                BackrefLink::Parent(_) => return false,
                BackrefLink::Root(root) => {
                    if root == EXTENT_TREE_OBJECTID {
                        is_extent = true;
                    }
                }
            },
        }
    }
    is_extent
}

/// Consume an EXTENT_ITEM / METADATA_ITEM leaf entry: record the declared
/// refcount and every inline reference.
pub fn process_extent_item(
    cache: &mut ExtentCache,
    leaf: &TreeBlock,
    slot: usize,
    nodesize: u64,
    stats: &mut RunStats,
) -> Result<(), sfs_types::ParseError> {
    let key = leaf.item_key(slot);
    let is_metadata_key = key.item_type == sfs_types::ITEM_METADATA_ITEM;
    let num_bytes = if is_metadata_key { nodesize } else { key.offset };

    let item = parse_extent_item(leaf.item_data(slot), is_metadata_key)?;
    add_extent_rec(
        cache,
        None,
        key.objectid,
        num_bytes,
        item.refs,
        false,
        false,
        false,
        is_metadata_key || item.flags & sfs_types::EXTENT_FLAG_TREE_BLOCK != 0,
        true,
        num_bytes,
        stats,
    );

    for inline in &item.inline_refs {
        match *inline {
            InlineRef::TreeBlock { root } => {
                add_tree_backref(cache, key.objectid, 0, root, false, stats);
            }
            InlineRef::SharedBlock { parent } => {
                add_tree_backref(cache, key.objectid, parent, 0, false, stats);
            }
            InlineRef::Data {
                root,
                objectid,
                offset,
                count,
            } => {
                add_data_backref(
                    cache, key.objectid, 0, root, objectid, offset, count, false, num_bytes,
                    stats,
                );
            }
            InlineRef::SharedData { parent, count } => {
                add_data_backref(
                    cache, key.objectid, parent, 0, 0, 0, count, false, num_bytes, stats,
                );
            }
        }
    }
    Ok(())
}

/// Consume a legacy EXTENT_REF_V0 item (pre-mixed-backref format).
pub fn process_extent_ref_v0(
    cache: &mut ExtentCache,
    leaf: &TreeBlock,
    slot: usize,
    stats: &mut RunStats,
) -> Result<(), sfs_types::ParseError> {
    let key = leaf.item_key(slot);
    let ref0 = parse_extent_ref_v0(leaf.item_data(slot))?;
    if ref0.objectid < FIRST_FREE_OBJECTID {
        add_tree_backref(cache, key.objectid, key.offset, 0, false, stats);
    } else {
        add_data_backref(
            cache, key.objectid, key.offset, 0, 0, 0, ref0.count, false, 0, stats,
        );
    }
    Ok(())
}

/// Consume the stand-alone extent-ref items that follow an extent item in
/// the extent tree. Returns true when the key type was handled here.
pub fn process_standalone_ref(
    cache: &mut ExtentCache,
    leaf: &TreeBlock,
    slot: usize,
    sectorsize: u64,
    stats: &mut RunStats,
) -> Result<bool, sfs_types::ParseError> {
    let key = leaf.item_key(slot);
    match key.item_type {
        sfs_types::ITEM_TREE_BLOCK_REF => {
            add_tree_backref(cache, key.objectid, 0, key.offset, false, stats);
        }
        sfs_types::ITEM_SHARED_BLOCK_REF => {
            add_tree_backref(cache, key.objectid, key.offset, 0, false, stats);
        }
        sfs_types::ITEM_EXTENT_DATA_REF => {
            let dref = parse_extent_data_ref(leaf.item_data(slot))?;
            add_data_backref(
                cache,
                key.objectid,
                0,
                dref.root,
                dref.objectid,
                dref.offset,
                dref.count,
                false,
                sectorsize,
                stats,
            );
        }
        sfs_types::ITEM_SHARED_DATA_REF => {
            let count = parse_shared_data_ref(leaf.item_data(slot))?;
            add_data_backref(
                cache, key.objectid, key.offset, 0, 0, 0, count, false, sectorsize, stats,
            );
        }
        sfs_types::ITEM_EXTENT_REF_V0 => {
            process_extent_ref_v0(cache, leaf, slot, stats)?;
        }
        _ => return Ok(false),
    }
    Ok(true)
}

/// Record the data extent referenced by one EXTENT_DATA leaf entry during
/// the extent scan (walked side).
pub fn process_file_extent_ref(
    cache: &mut ExtentCache,
    leaf: &TreeBlock,
    slot: usize,
    parent: u64,
    owner: u64,
    stats: &mut RunStats,
) -> Result<(), sfs_types::ParseError> {
    let key = leaf.item_key(slot);
    let extent = parse_file_extent(leaf.item_data(slot))?;
    let FileExtent::Regular {
        disk_bytenr,
        disk_num_bytes,
        offset,
        num_bytes,
        ..
    } = extent
    else {
        // Inline extents carry no separate allocation.
        return Ok(());
    };
    if disk_bytenr == 0 {
        return Ok(());
    }

    stats.data_bytes_allocated += disk_num_bytes;
    stats.data_bytes_referenced += num_bytes;
    add_extent_rec(
        cache,
        None,
        disk_bytenr,
        disk_num_bytes,
        0,
        false,
        true,
        true,
        false,
        false,
        disk_num_bytes,
        stats,
    );
    add_data_backref(
        cache,
        disk_bytenr,
        parent,
        owner,
        key.objectid,
        key.offset.wrapping_sub(offset),
        1,
        true,
        disk_num_bytes,
        stats,
    );
    Ok(())
}

/// Apply one ref-change event from the tree layer (the free-extent hook
/// and the COW ref bookkeeping).
pub fn apply_ref_event(cache: &mut ExtentCache, event: &RefEvent) {
    match *event {
        RefEvent::Free(freed) => apply_free(cache, &freed),
        RefEvent::IncRef { bytenr, .. } => {
            if let Some(rec) = cache.find(bytenr) {
                rec.refs += 1;
            }
        }
        RefEvent::DecRef { bytenr, .. } => {
            if let Some(rec) = cache.find(bytenr) {
                rec.refs = rec.refs.saturating_sub(1);
            }
        }
        RefEvent::SetFullBackref { bytenr } => {
            if let Some(rec) = cache.find(bytenr) {
                for backref in &mut rec.backrefs {
                    if let Backref::Tree(t) = backref {
                        if let BackrefLink::Root(_) = t.link {
                            t.link = BackrefLink::Parent(rec.start);
                        }
                    }
                }
            }
        }
        RefEvent::Alloc { .. } => {
            // New blocks of this transaction are accounted by the repairer
            // when it rebuilds block-group counters.
        }
    }
}

/// The free-extent hook: as repair deletes or frees blocks it is tracking,
/// drop the matching backref so bookkeeping stays balanced.
fn apply_free(cache: &mut ExtentCache, freed: &FreedRef) {
    let is_data = freed.owner >= FIRST_FREE_OBJECTID;
    let Some(rec) = cache.find(freed.bytenr) else {
        return;
    };

    if is_data {
        let Some(idx) = find_data_backref_idx(
            rec,
            freed.parent,
            freed.root_objectid,
            freed.owner,
            freed.offset,
            true,
            freed.num_bytes,
        ) else {
            return;
        };
        let remove = {
            let Backref::Data(backref) = &mut rec.backrefs[idx] else {
                unreachable!();
            };
            if backref.found_ref_flag {
                backref.found_ref = backref.found_ref.saturating_sub(freed.refs_to_drop);
                rec.refs = rec.refs.saturating_sub(u64::from(freed.refs_to_drop));
            }
            if backref.found_extent_tree {
                backref.num_refs = backref.num_refs.saturating_sub(freed.refs_to_drop);
                rec.extent_item_refs = rec
                    .extent_item_refs
                    .saturating_sub(u64::from(freed.refs_to_drop));
            }
            if backref.found_ref == 0 {
                backref.found_ref_flag = false;
            }
            if backref.num_refs == 0 {
                backref.found_extent_tree = false;
            }
            !backref.found_extent_tree && !backref.found_ref_flag
        };
        if remove {
            rec.backrefs.remove(idx);
        }
    } else {
        let Some(idx) = find_tree_backref_idx(rec, freed.parent, freed.root_objectid) else {
            return;
        };
        let remove = {
            let Backref::Tree(backref) = &mut rec.backrefs[idx] else {
                unreachable!();
            };
            if backref.found_ref {
                rec.refs = rec.refs.saturating_sub(1);
                backref.found_ref = false;
            }
            if backref.found_extent_tree {
                rec.extent_item_refs = rec.extent_item_refs.saturating_sub(1);
                backref.found_extent_tree = false;
            }
            !backref.found_extent_tree && !backref.found_ref
        };
        if remove {
            rec.backrefs.remove(idx);
        }
    }
    let start = freed.bytenr;
    maybe_free_extent_rec(cache, start);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> RunStats {
        RunStats::default()
    }

    #[test]
    fn balanced_tree_extent_is_released() {
        let mut cache = ExtentCache::new();
        let mut st = stats();

        // Walked side: one pointer from root 5.
        add_extent_rec(
            &mut cache, None, 0x4000, 4096, 0, false, true, false, true, false, 4096, &mut st,
        );
        add_tree_backref(&mut cache, 0x4000, 0, 5, true, &mut st);
        // Declared side: extent item with one TREE_BLOCK_REF.
        add_extent_rec(
            &mut cache, None, 0x4000, 4096, 1, false, false, false, true, true, 4096, &mut st,
        );
        add_tree_backref(&mut cache, 0x4000, 0, 5, false, &mut st);

        let rec = cache.find(0x4000).expect("record");
        assert!(all_backpointers_checked(rec));
        rec.content_checked = true;
        rec.owner_ref_checked = true;
        maybe_free_extent_rec(&mut cache, 0x4000);
        assert!(cache.is_empty(), "balanced record must be released");
    }

    #[test]
    fn missing_declared_ref_is_detected() {
        let mut cache = ExtentCache::new();
        let mut st = stats();
        add_extent_rec(
            &mut cache, None, 0x8000, 4096, 0, false, true, false, true, false, 4096, &mut st,
        );
        add_tree_backref(&mut cache, 0x8000, 0, 5, true, &mut st);

        let rec = cache.find(0x8000).expect("record");
        let problems = backpointer_problems(rec);
        assert!(!problems.is_empty());
        assert_ne!(rec.refs, rec.extent_item_refs);
    }

    #[test]
    fn data_backref_count_mismatch_detected() {
        let mut cache = ExtentCache::new();
        let mut st = stats();
        // Declared: 2 refs; walked: only 1.
        add_extent_rec(
            &mut cache, None, 0x10000, 8192, 2, false, false, false, false, true, 8192, &mut st,
        );
        add_data_backref(&mut cache, 0x10000, 0, 5, 257, 0, 2, false, 8192, &mut st);
        add_extent_rec(
            &mut cache, None, 0x10000, 8192, 0, false, true, true, false, false, 8192, &mut st,
        );
        add_data_backref(&mut cache, 0x10000, 0, 5, 257, 0, 1, true, 8192, &mut st);

        let rec = cache.find(0x10000).expect("record");
        assert!(!all_backpointers_checked(rec));
    }

    #[test]
    fn tie_break_full_vs_root() {
        let mut cache = ExtentCache::new();
        let mut st = stats();
        add_tree_backref(&mut cache, 0x4000, 0x9000, 0, true, &mut st);
        add_tree_backref(&mut cache, 0x4000, 0, 7, true, &mut st);

        let rec = cache.find(0x4000).expect("record");
        assert_eq!(rec.backrefs.len(), 2, "parent and root refs stay distinct");
        assert!(find_tree_backref_idx(rec, 0x9000, 0).is_some());
        assert!(find_tree_backref_idx(rec, 0, 7).is_some());
        assert!(find_tree_backref_idx(rec, 0, 9).is_none());
    }

    #[test]
    fn free_event_drops_backref() {
        let mut cache = ExtentCache::new();
        let mut st = stats();
        add_extent_rec(
            &mut cache, None, 0x4000, 4096, 1, false, true, false, true, true, 4096, &mut st,
        );
        add_tree_backref(&mut cache, 0x4000, 0, 5, true, &mut st);
        add_tree_backref(&mut cache, 0x4000, 0, 5, false, &mut st);

        apply_ref_event(
            &mut cache,
            &RefEvent::Free(FreedRef {
                bytenr: 0x4000,
                num_bytes: 4096,
                parent: 0,
                root_objectid: 5,
                owner: 0,
                offset: 0,
                refs_to_drop: 1,
            }),
        );
        // The record balanced down to zero refs on both sides and the
        // backref vanished, but refs == 0 keeps it cached until the
        // content/owner checks run.
        if let Some(rec) = cache.find(0x4000) {
            assert!(rec.backrefs.is_empty());
            assert_eq!(rec.refs, 0);
            assert_eq!(rec.extent_item_refs, 0);
        }
    }
}
