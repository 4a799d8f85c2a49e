#![forbid(unsafe_code)]
//! B+-tree layer: search, COW, split, merge, balance, and leaf iteration
//! over the tree-block buffers of an opened filesystem.
//!
//! All operations run inside a [`TreeTxn`]: a single-threaded working set of
//! blocks plus a dirty set and a queue of reference-change events. Read-only
//! users never allocate; writers supply a [`BlockAllocator`] and call
//! [`TreeTxn::commit`] once at the end. Ref-count side effects of COW and
//! block frees are not applied in place; they are appended to
//! [`TreeTxn::events`] for the caller to drain (the checker feeds them into
//! its extent reconciliation, which is the only consumer that knows the
//! record state).

mod ops;

pub use ops::LeafIter;

use sfs_block::FsInfo;
use sfs_error::{Result, SfsError};
use sfs_ondisk::{RootItem, TreeBlock};
use sfs_types::{MAX_LEVEL, TREE_RELOC_OBJECTID};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::trace;

// ── Roots ───────────────────────────────────────────────────────────────────

/// Lightweight handle to one tree root. Mutations move `bytenr`/`level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeRoot {
    pub objectid: u64,
    pub bytenr: u64,
    pub level: u8,
    pub generation: u64,
    pub last_snapshot: u64,
    /// Forward references from the root tree; 0 means a drop is in progress.
    pub root_refs: u32,
    /// Snapshot-capable tree (fs trees); gates shared-block COW bookkeeping.
    pub ref_cows: bool,
}

impl TreeRoot {
    #[must_use]
    pub fn new(objectid: u64, bytenr: u64, level: u8, generation: u64) -> Self {
        Self {
            objectid,
            bytenr,
            level,
            generation,
            last_snapshot: 0,
            root_refs: 1,
            ref_cows: sfs_types::is_fs_tree_objectid(objectid),
        }
    }

    #[must_use]
    pub fn from_root_item(objectid: u64, item: &RootItem) -> Self {
        Self {
            objectid,
            bytenr: item.bytenr,
            level: item.level,
            generation: item.generation,
            last_snapshot: item.last_snapshot,
            root_refs: item.refs,
            ref_cows: sfs_types::is_fs_tree_objectid(objectid),
        }
    }

    #[must_use]
    pub fn is_reloc(&self) -> bool {
        self.objectid == TREE_RELOC_OBJECTID
    }
}

// ── Paths ───────────────────────────────────────────────────────────────────

/// A descent path: one bytenr and slot per level. `nodes[level] == 0` means
/// the level is not held.
#[derive(Debug, Clone, Default)]
pub struct Path {
    pub nodes: [u64; MAX_LEVEL],
    pub slots: [usize; MAX_LEVEL],
    /// Stop the descent at this level (used when resuming snapshot drops).
    pub lowest_level: usize,
    /// Enable sibling readahead while descending at level 1.
    pub reada: bool,
}

impl Path {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every held level. Safe to call on an already-released path.
    pub fn release(&mut self) {
        self.nodes = [0; MAX_LEVEL];
        self.slots = [0; MAX_LEVEL];
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.nodes.iter().all(|&bytenr| bytenr == 0)
    }
}

// ── Allocation ──────────────────────────────────────────────────────────────

/// Block lifecycle interface for tree mutations. The tree layer asks for new
/// bytenrs and reports blocks that became unreachable; accounting beyond
/// that is the caller's concern.
pub trait BlockAllocator: std::fmt::Debug {
    fn alloc_block(&mut self, nodesize: u32, hint: u64) -> Result<u64>;
    fn free_block(&mut self, bytenr: u64, num_bytes: u64);
}

/// Allocator for read-only transactions; any allocation is a bug.
#[derive(Debug, Default)]
pub struct NullAllocator;

impl BlockAllocator for NullAllocator {
    fn alloc_block(&mut self, _nodesize: u32, _hint: u64) -> Result<u64> {
        Err(SfsError::Format(
            "block allocation attempted in a read-only transaction".into(),
        ))
    }

    fn free_block(&mut self, _bytenr: u64, _num_bytes: u64) {}
}

/// Sequential allocator over a byte range with pinned-range avoidance.
/// Repair pins every known extent before mutating so reconstruction can
/// never reuse a byte range it is reasoning about.
#[derive(Debug)]
pub struct BumpAllocator {
    next: u64,
    limit: u64,
    pinned: BTreeMap<u64, u64>,
    freed: Vec<(u64, u64)>,
}

impl BumpAllocator {
    #[must_use]
    pub fn new(start: u64, limit: u64) -> Self {
        Self {
            next: start,
            limit,
            pinned: BTreeMap::new(),
            freed: Vec::new(),
        }
    }

    pub fn pin_range(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let entry = self.pinned.entry(start).or_insert(0);
        *entry = (*entry).max(len);
    }

    fn overlaps_pinned(&self, start: u64, len: u64) -> bool {
        let end = start.saturating_add(len);
        self.pinned
            .range(..end)
            .any(|(&pin_start, &pin_len)| pin_start.saturating_add(pin_len) > start)
    }

    #[must_use]
    pub fn freed_ranges(&self) -> &[(u64, u64)] {
        &self.freed
    }
}

impl BlockAllocator for BumpAllocator {
    fn alloc_block(&mut self, nodesize: u32, hint: u64) -> Result<u64> {
        let size = u64::from(nodesize);
        let mut candidate = sfs_types::align_up(self.next.max(hint & !(size - 1)), size)
            .ok_or(SfsError::NoSpace)?;
        // `hint` only seeds locality; never allocate below the cursor.
        candidate = candidate.max(self.next);
        while self.overlaps_pinned(candidate, size) {
            candidate = candidate.checked_add(size).ok_or(SfsError::NoSpace)?;
        }
        if candidate + size > self.limit {
            return Err(SfsError::NoSpace);
        }
        self.next = candidate + size;
        Ok(candidate)
    }

    fn free_block(&mut self, bytenr: u64, num_bytes: u64) {
        self.freed.push((bytenr, num_bytes));
    }
}

// ── Reference-change events ─────────────────────────────────────────────────

/// One dropped reference, in the shape the extent reconciler consumes:
/// `owner >= FIRST_FREE_OBJECTID` means a data ref, otherwise `owner` is the
/// tree level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreedRef {
    pub bytenr: u64,
    pub num_bytes: u64,
    pub parent: u64,
    pub root_objectid: u64,
    pub owner: u64,
    pub offset: u64,
    pub refs_to_drop: u32,
}

/// Ref-count side effects of tree mutations, drained by the caller after
/// each mutation batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefEvent {
    Free(FreedRef),
    IncRef { bytenr: u64, full_backref: bool },
    DecRef { bytenr: u64, full_backref: bool },
    SetFullBackref { bytenr: u64 },
    Alloc {
        bytenr: u64,
        num_bytes: u64,
        root_objectid: u64,
        level: u8,
    },
}

// ── Transactions ────────────────────────────────────────────────────────────

/// Single-threaded working set of tree blocks for one check/repair/restore
/// pass. Blocks are loaded through the filesystem's mirror-aware reader and
/// kept here; mutations stay in memory until [`TreeTxn::commit`].
pub struct TreeTxn<'a> {
    pub fs: &'a FsInfo,
    pub transid: u64,
    writable: bool,
    alloc: Box<dyn BlockAllocator>,
    blocks: HashMap<u64, TreeBlock>,
    dirty: BTreeSet<u64>,
    pub events: Vec<RefEvent>,
    /// Extent root used to look up refcounts when COW meets a potentially
    /// shared block. Absent in read-only flows that never COW.
    extent_root: Option<TreeRoot>,
}

impl std::fmt::Debug for TreeTxn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeTxn")
            .field("transid", &self.transid)
            .field("writable", &self.writable)
            .field("loaded", &self.blocks.len())
            .field("dirty", &self.dirty.len())
            .finish()
    }
}

impl<'a> TreeTxn<'a> {
    /// Read-only transaction at the superblock's generation.
    #[must_use]
    pub fn read_only(fs: &'a FsInfo) -> Self {
        Self {
            fs,
            transid: fs.sb.generation,
            writable: false,
            alloc: Box::new(NullAllocator),
            blocks: HashMap::new(),
            dirty: BTreeSet::new(),
            events: Vec::new(),
            extent_root: None,
        }
    }

    /// Write transaction at `transid` (one past the superblock generation
    /// for repair) with the given allocator.
    #[must_use]
    pub fn start(fs: &'a FsInfo, transid: u64, alloc: Box<dyn BlockAllocator>) -> Self {
        Self {
            fs,
            transid,
            writable: true,
            alloc,
            blocks: HashMap::new(),
            dirty: BTreeSet::new(),
            events: Vec::new(),
            extent_root: None,
        }
    }

    /// Register the extent root for shared-block refcount lookups during COW.
    pub fn set_extent_root(&mut self, root: TreeRoot) {
        self.extent_root = Some(root);
    }

    #[must_use]
    pub fn extent_root(&self) -> Option<TreeRoot> {
        self.extent_root
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    #[must_use]
    pub fn nodesize(&self) -> usize {
        self.fs.nodesize() as usize
    }

    /// Drain the accumulated reference-change events.
    pub fn take_events(&mut self) -> Vec<RefEvent> {
        std::mem::take(&mut self.events)
    }

    // ── Block working set ───────────────────────────────────────────────

    /// Ensure `bytenr` is loaded; returns a shared view.
    pub fn block(&mut self, bytenr: u64) -> Result<&TreeBlock> {
        self.load(bytenr, 0)?;
        Ok(&self.blocks[&bytenr])
    }

    /// Ensure `bytenr` is loaded and mark it dirty.
    pub fn block_mut(&mut self, bytenr: u64) -> Result<&mut TreeBlock> {
        self.load(bytenr, 0)?;
        self.dirty.insert(bytenr);
        Ok(self.blocks.get_mut(&bytenr).expect("just loaded"))
    }

    fn load(&mut self, bytenr: u64, expected_generation: u64) -> Result<()> {
        if self.blocks.contains_key(&bytenr) {
            return Ok(());
        }
        let block = self.fs.read_tree_block(bytenr, expected_generation)?;
        self.blocks.insert(bytenr, block);
        Ok(())
    }

    /// Read with an expected generation (stale reads rejected per mirror).
    pub fn read_block(&mut self, bytenr: u64, expected_generation: u64) -> Result<&TreeBlock> {
        self.load(bytenr, expected_generation)?;
        Ok(&self.blocks[&bytenr])
    }

    /// Shared view of an already-loaded block.
    pub(crate) fn block_ref(&self, bytenr: u64) -> &TreeBlock {
        &self.blocks[&bytenr]
    }

    /// Allocate a bare bytenr (for COW clones that never start zeroed).
    pub(crate) fn alloc_raw(&mut self, hint: u64) -> Result<u64> {
        self.alloc.alloc_block(self.fs.nodesize(), hint)
    }

    /// Remove a block from the working set for a disjoint-borrow edit; pair
    /// with [`TreeTxn::put_block`].
    pub(crate) fn take_block(&mut self, bytenr: u64) -> Result<TreeBlock> {
        self.load(bytenr, 0)?;
        Ok(self.blocks.remove(&bytenr).expect("just loaded"))
    }

    pub(crate) fn put_block(&mut self, block: TreeBlock) {
        let bytenr = block.bytenr();
        if block.is_dirty() {
            self.dirty.insert(bytenr);
        }
        self.blocks.insert(bytenr, block);
    }

    pub fn mark_dirty(&mut self, bytenr: u64) {
        self.dirty.insert(bytenr);
    }

    /// Prefetch a block into the shared cache, ignoring failures. Readahead
    /// is advisory; real reads re-validate.
    pub fn readahead(&self, bytenr: u64) {
        let _ = self.fs.read_tree_block(bytenr, 0);
    }

    /// Allocate and register a fresh zeroed block. Identity fields (fsid,
    /// chunk-tree uuid) are copied from `template`.
    pub(crate) fn alloc_tree_block(
        &mut self,
        owner: u64,
        level: u8,
        hint: u64,
        template: &TreeBlock,
    ) -> Result<u64> {
        let bytenr = self
            .alloc
            .alloc_block(self.fs.nodesize(), hint)?;
        let mut block =
            TreeBlock::new_empty(self.nodesize(), bytenr, owner, self.transid, level);
        block.set_fsid(template.fsid());
        block.set_chunk_tree_uuid(template.chunk_tree_uuid());
        block.set_flags(sfs_types::with_backref_rev(0, sfs_types::MIXED_BACKREF_REV));
        trace!(bytenr, owner, level, "tree block allocated");
        self.events.push(RefEvent::Alloc {
            bytenr,
            num_bytes: self.nodesize() as u64,
            root_objectid: owner,
            level,
        });
        self.dirty.insert(bytenr);
        self.blocks.insert(bytenr, block);
        Ok(bytenr)
    }

    /// Release a tree block: report it to the allocator and queue the
    /// reference drop for the caller.
    pub(crate) fn free_tree_block(&mut self, root: &TreeRoot, bytenr: u64, level: u8) {
        let num_bytes = self.nodesize() as u64;
        self.alloc.free_block(bytenr, num_bytes);
        self.events.push(RefEvent::Free(FreedRef {
            bytenr,
            num_bytes,
            parent: 0,
            root_objectid: root.objectid,
            owner: u64::from(level),
            offset: 0,
            refs_to_drop: 1,
        }));
        self.dirty.remove(&bytenr);
        self.blocks.remove(&bytenr);
        trace!(bytenr, level, "tree block freed");
    }

    /// Flush every dirty block to the device (all mirror copies).
    pub fn commit(&mut self) -> Result<()> {
        if !self.writable {
            return Err(SfsError::Format(
                "commit on a read-only transaction".into(),
            ));
        }
        let dirty: Vec<u64> = self.dirty.iter().copied().collect();
        for bytenr in dirty {
            let mut block = self
                .blocks
                .get(&bytenr)
                .cloned()
                .ok_or_else(|| SfsError::corrupt(bytenr, "dirty block missing from working set"))?;
            self.fs.write_tree_block(&mut block)?;
            self.blocks.insert(bytenr, block);
        }
        self.dirty.clear();
        Ok(())
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocator_skips_pinned_and_respects_limit() {
        let mut alloc = BumpAllocator::new(0x1000, 0x10_0000);
        alloc.pin_range(0x2000, 0x2000);

        let a = alloc.alloc_block(4096, 0).expect("first");
        assert_eq!(a, 0x1000);
        // Next candidate 0x2000 is pinned through 0x3FFF.
        let b = alloc.alloc_block(4096, 0).expect("second");
        assert_eq!(b, 0x4000);

        let mut tight = BumpAllocator::new(0x0, 0x2000);
        tight.alloc_block(4096, 0).expect("fits");
        assert!(matches!(
            tight.alloc_block(4096, 0),
            Err(SfsError::NoSpace)
        ));
    }

    #[test]
    fn bump_allocator_hint_is_locality_only() {
        let mut alloc = BumpAllocator::new(0x10_000, 0x100_000);
        // A hint below the cursor must not rewind allocation.
        let got = alloc.alloc_block(4096, 0x1000).expect("alloc");
        assert_eq!(got, 0x10_000);
        let ahead = alloc.alloc_block(4096, 0x50_000).expect("alloc ahead");
        assert_eq!(ahead, 0x50_000);
    }

    #[test]
    fn null_allocator_rejects_alloc() {
        let mut alloc = NullAllocator;
        assert!(alloc.alloc_block(4096, 0).is_err());
    }

    #[test]
    fn path_release() {
        let mut path = Path::new();
        path.nodes[0] = 0x4000;
        path.slots[0] = 3;
        assert!(!path.is_released());
        path.release();
        assert!(path.is_released());
    }

    #[test]
    fn tree_root_flavors() {
        let fs = TreeRoot::new(5, 0x4000, 0, 1);
        assert!(fs.ref_cows);
        assert!(!fs.is_reloc());
        let extent = TreeRoot::new(2, 0x8000, 0, 1);
        assert!(!extent.ref_cows);
        let reloc = TreeRoot::new(sfs_types::TREE_RELOC_OBJECTID, 0xC000, 0, 1);
        assert!(reloc.is_reloc());
        assert!(reloc.ref_cows);
    }
}
