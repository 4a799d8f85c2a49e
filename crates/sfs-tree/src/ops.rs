//! Tree operations: search, COW, node/leaf split, push, balance, insert,
//! delete, and leaf-to-leaf iteration.
//!
//! The shapes here follow the classic COW B+-tree discipline: every block on
//! a mutating descent is COW-ed before its child is examined, interior nodes
//! are split pre-emptively on the way down, and deletes rebalance on the way
//! down so that no node is ever left with a single pointer mid-delete.

use crate::{Path, RefEvent, TreeRoot, TreeTxn};
use sfs_error::{Result, SfsError};
use sfs_ondisk::{TreeBlock, ITEM_SIZE, KEY_PTR_SIZE};
use sfs_types::{
    header_backref_rev, with_backref_rev, Key, BLOCK_FLAG_FULL_BACKREF, HEADER_FLAG_RELOC,
    HEADER_FLAG_WRITTEN, ITEM_DIR_ITEM, ITEM_EXTENT_ITEM, ITEM_METADATA_ITEM, MAX_LEVEL,
    MIXED_BACKREF_REV,
};
use tracing::{debug, trace};

/// Binary search over the sorted keys of a block. Returns `(exact, slot)`
/// where `slot` is the position of the first key `>= target`.
fn bin_search(block: &TreeBlock, target: &Key) -> (bool, usize) {
    let nritems = block.nritems();
    let key_at = |slot: usize| {
        if block.is_leaf() {
            block.item_key(slot)
        } else {
            block.node_key(slot)
        }
    };
    let mut low = 0_usize;
    let mut high = nritems;
    while low < high {
        let mid = (low + high) / 2;
        match key_at(mid).cmp(target) {
            std::cmp::Ordering::Less => low = mid + 1,
            std::cmp::Ordering::Greater => high = mid,
            std::cmp::Ordering::Equal => return (true, mid),
        }
    }
    (false, low)
}

impl TreeTxn<'_> {
    // ── Search ──────────────────────────────────────────────────────────

    /// Descend from `root` looking for `key`, filling `path` with the
    /// traversed nodes and chosen slots.
    ///
    /// - `cow` COWs every block on the way down (required for mutation).
    /// - `ins_len > 0` splits full nodes/leaves pre-emptively so the caller
    ///   can insert `ins_len` bytes (item structs included) at the slot.
    /// - `ins_len < 0` rebalances underfull nodes on the way down; if that
    ///   collapses the root, the descent restarts from the new root.
    ///
    /// Returns `true` on an exact match; otherwise `path.slots[0]` is the
    /// insertion point.
    pub fn search_slot(
        &mut self,
        root: &mut TreeRoot,
        key: &Key,
        path: &mut Path,
        ins_len: i32,
        cow: bool,
    ) -> Result<bool> {
        debug_assert!(!(ins_len != 0 && !cow), "mutation requires cow");
        debug_assert!(!(path.lowest_level > 0 && ins_len > 0));

        'again: loop {
            path.release();
            let mut bytenr = root.bytenr;
            let mut level = root.level as usize;
            let mut expected_gen = root.generation;

            loop {
                if cow {
                    let parent = (level + 1 < MAX_LEVEL && path.nodes[level + 1] != 0)
                        .then(|| (path.nodes[level + 1], path.slots[level + 1]));
                    bytenr = self.cow_block(root, bytenr, parent)?;
                }
                let block = self.read_block(bytenr, expected_gen)?;
                if block.level() as usize != level {
                    return Err(SfsError::corrupt(bytenr, "level does not match descent"));
                }
                path.nodes[level] = bytenr;

                if level == 0 {
                    let block = self.block(bytenr)?;
                    let (exact, slot) = bin_search(block, key);
                    path.slots[0] = slot;
                    let free = self.block(bytenr)?.leaf_free_space();
                    if ins_len > 0 && free < ins_len as usize {
                        self.split_leaf(root, key, path, ins_len as usize, exact)?;
                    }
                    return Ok(exact);
                }

                let block = self.block(bytenr)?;
                let (_, mut slot) = {
                    let (exact, slot) = bin_search(block, key);
                    if !exact && slot > 0 {
                        (exact, slot - 1)
                    } else {
                        (exact, slot)
                    }
                };
                path.slots[level] = slot;

                let block = self.block(bytenr)?;
                if ins_len > 0 && block.nritems() >= block.max_ptrs() - 3 {
                    self.split_node(root, path, level)?;
                    bytenr = path.nodes[level];
                    slot = path.slots[level];
                } else if ins_len < 0 {
                    self.balance_level(root, path, level)?;
                    if path.nodes[level] == 0 {
                        continue 'again;
                    }
                    bytenr = path.nodes[level];
                    slot = path.slots[level];
                }

                if level == path.lowest_level {
                    return Ok(false);
                }

                if path.reada && level == 1 {
                    self.reada_for_search(bytenr, slot, key.objectid);
                }

                let block = self.block(bytenr)?;
                expected_gen = block.node_ptr_generation(slot);
                bytenr = block.node_blockptr(slot);
                level -= 1;
            }
        }
    }

    /// Prefetch the remaining children of a level-1 node whose keys share
    /// `objectid` with the search target.
    fn reada_for_search(&mut self, bytenr: u64, slot: usize, objectid: u64) {
        let Ok(block) = self.block(bytenr) else {
            return;
        };
        let nritems = block.nritems();
        let targets: Vec<u64> = (slot..nritems)
            .take_while(|&i| block.node_key(i).objectid == objectid)
            .map(|i| block.node_blockptr(i))
            .collect();
        for child in targets {
            self.readahead(child);
        }
    }

    // ── COW ─────────────────────────────────────────────────────────────

    fn should_cow(transid: u64, block: &TreeBlock, root: &TreeRoot) -> bool {
        !(block.generation() == transid
            && block.flags() & HEADER_FLAG_WRITTEN == 0
            && !(!root.is_reloc() && block.flags() & HEADER_FLAG_RELOC != 0))
    }

    fn block_can_be_shared(root: &TreeRoot, block: &TreeBlock) -> bool {
        root.ref_cows
            && block.bytenr() != root.bytenr
            && (block.generation() <= root.last_snapshot
                || block.flags() & HEADER_FLAG_RELOC != 0
                || header_backref_rev(block.flags()) < MIXED_BACKREF_REV)
    }

    /// COW `bytenr` under `root` if the COW rules require it, updating the
    /// parent pointer (or the root handle) to the new copy. Returns the
    /// bytenr holding the live block afterwards.
    pub fn cow_block(
        &mut self,
        root: &mut TreeRoot,
        bytenr: u64,
        parent: Option<(u64, usize)>,
    ) -> Result<u64> {
        self.block(bytenr)?;
        if !Self::should_cow(self.transid, self.block_ref(bytenr), root) {
            return Ok(bytenr);
        }
        if !self.is_writable() {
            return Err(SfsError::Format(
                "COW required inside a read-only transaction".into(),
            ));
        }

        let old = self.take_block(bytenr)?;
        let level = old.level();
        let old_flags = old.flags();

        let new_bytenr = match self.alloc_raw(bytenr) {
            Ok(n) => n,
            Err(err) => {
                self.put_block(old);
                return Err(err);
            }
        };

        let mut cow = old.clone();
        cow.set_bytenr(new_bytenr);
        cow.set_generation(self.transid);
        let mut flags = old_flags & !(HEADER_FLAG_WRITTEN | HEADER_FLAG_RELOC);
        flags = with_backref_rev(flags, MIXED_BACKREF_REV);
        if root.is_reloc() {
            flags |= HEADER_FLAG_RELOC;
        } else {
            cow.set_owner(root.objectid);
        }
        cow.set_flags(flags);
        cow.mark_dirty();

        self.update_ref_for_cow(root, &old, new_bytenr)?;

        self.events.push(RefEvent::Alloc {
            bytenr: new_bytenr,
            num_bytes: self.nodesize() as u64,
            root_objectid: root.objectid,
            level,
        });

        self.put_block(old);
        self.put_block(cow);
        self.mark_dirty(new_bytenr);

        if bytenr == root.bytenr {
            root.bytenr = new_bytenr;
            root.generation = self.transid;
            self.free_tree_block_at(root, bytenr, level);
        } else if let Some((parent_bytenr, parent_slot)) = parent {
            let transid = self.transid;
            let parent_block = self.block_mut(parent_bytenr)?;
            parent_block.set_node_blockptr(parent_slot, new_bytenr);
            parent_block.set_node_ptr_generation(parent_slot, transid);
            self.free_tree_block_at(root, bytenr, level);
        } else {
            return Err(SfsError::corrupt(
                bytenr,
                "COW of a non-root block without a parent pointer",
            ));
        }

        trace!(old = bytenr, new = new_bytenr, level, "cow block");
        Ok(new_bytenr)
    }

    /// Ref-count bookkeeping for one COW, queued as events (the reconciler
    /// applies them to its extent records).
    fn update_ref_for_cow(
        &mut self,
        root: &TreeRoot,
        old: &TreeBlock,
        new_bytenr: u64,
    ) -> Result<()> {
        let bytenr = old.bytenr();
        let (refs, flags) = if Self::block_can_be_shared(root, old) {
            match self.lookup_extent_info(bytenr, old.level())? {
                Some(found) => found,
                None => (1, 0),
            }
        } else {
            let flags = if root.is_reloc() || header_backref_rev(old.flags()) < MIXED_BACKREF_REV
            {
                BLOCK_FLAG_FULL_BACKREF
            } else {
                0
            };
            (1, flags)
        };

        let owner = old.owner();
        if refs > 1 {
            if (owner == root.objectid || root.is_reloc())
                && flags & BLOCK_FLAG_FULL_BACKREF == 0
            {
                // The old block stays shared under its other owners; convert
                // its child pointers to full backrefs.
                self.events.push(RefEvent::IncRef {
                    bytenr,
                    full_backref: true,
                });
                if root.is_reloc() {
                    self.events.push(RefEvent::DecRef {
                        bytenr,
                        full_backref: false,
                    });
                    self.events.push(RefEvent::IncRef {
                        bytenr: new_bytenr,
                        full_backref: true,
                    });
                }
                self.events.push(RefEvent::SetFullBackref { bytenr });
            } else {
                self.events.push(RefEvent::IncRef {
                    bytenr: new_bytenr,
                    full_backref: root.is_reloc(),
                });
            }
        } else if flags & BLOCK_FLAG_FULL_BACKREF != 0 {
            self.events.push(RefEvent::IncRef {
                bytenr: new_bytenr,
                full_backref: root.is_reloc(),
            });
            self.events.push(RefEvent::DecRef {
                bytenr,
                full_backref: true,
            });
        }
        Ok(())
    }

    /// Read `(refs, flags)` for a tree block out of the extent tree, if an
    /// extent root was registered.
    pub fn lookup_extent_info(&mut self, bytenr: u64, level: u8) -> Result<Option<(u64, u64)>> {
        let Some(mut extent_root) = self.extent_root() else {
            return Ok(None);
        };
        let mut path = Path::new();
        let key = Key::new(bytenr, ITEM_EXTENT_ITEM, 0);
        self.search_slot(&mut extent_root, &key, &mut path, 0, false)?;
        loop {
            let leaf = self.block(path.nodes[0])?;
            if path.slots[0] >= leaf.nritems() {
                if !self.next_leaf(&extent_root, &mut path)? {
                    return Ok(None);
                }
                continue;
            }
            let leaf = self.block(path.nodes[0])?;
            let found = leaf.item_key(path.slots[0]);
            if found.objectid != bytenr {
                return Ok(None);
            }
            if found.item_type == ITEM_EXTENT_ITEM || found.item_type == ITEM_METADATA_ITEM {
                let is_metadata = found.item_type == ITEM_METADATA_ITEM;
                debug_assert!(!is_metadata || found.offset == u64::from(level));
                let item =
                    sfs_ondisk::parse_extent_item(leaf.item_data(path.slots[0]), is_metadata)?;
                return Ok(Some((item.refs, item.flags)));
            }
            path.slots[0] += 1;
        }
    }

    // ── Node split & push ───────────────────────────────────────────────

    /// Insert a new root one level up, pointing at the current root block.
    fn insert_new_root(&mut self, root: &mut TreeRoot, path: &mut Path, level: usize) -> Result<()> {
        debug_assert_eq!(path.nodes[level], 0);
        debug_assert_eq!(path.nodes[level - 1], root.bytenr);

        let lower = self.block(root.bytenr)?;
        let lower_key = lower
            .first_key()
            .ok_or_else(|| SfsError::corrupt(root.bytenr, "empty block cannot grow a root"))?;
        let lower_bytenr = lower.bytenr();
        let lower_gen = lower.generation();
        let template = lower.clone();

        let new_root =
            self.alloc_tree_block(root.objectid, level as u8, root.bytenr, &template)?;
        {
            let block = self.block_mut(new_root)?;
            block.set_nritems(1);
            block.set_node_key(0, &lower_key);
            block.set_node_blockptr(0, lower_bytenr);
            block.set_node_ptr_generation(0, lower_gen);
        }
        root.bytenr = new_root;
        root.level = level as u8;
        path.nodes[level] = new_root;
        path.slots[level] = 0;
        debug!(new_root, level, "tree grew a level");
        Ok(())
    }

    /// Insert a key pointer into `path.nodes[level]` at `slot`.
    fn insert_ptr(
        &mut self,
        path: &Path,
        key: &Key,
        bytenr: u64,
        slot: usize,
        level: usize,
    ) -> Result<()> {
        let transid = self.transid;
        let lower = self.block_mut(path.nodes[level])?;
        let nritems = lower.nritems();
        debug_assert!(slot <= nritems);
        if slot != nritems {
            let base = sfs_ondisk::HEADER_SIZE;
            lower.memmove_within(
                base + (slot + 1) * KEY_PTR_SIZE,
                base + slot * KEY_PTR_SIZE,
                (nritems - slot) * KEY_PTR_SIZE,
            );
        }
        lower.set_nritems(nritems + 1);
        lower.set_node_key(slot, key);
        lower.set_node_blockptr(slot, bytenr);
        lower.set_node_ptr_generation(slot, transid);
        Ok(())
    }

    /// Split the interior node at `level`, first trying to push into the
    /// siblings. The path is corrected to keep pointing at the original slot.
    fn split_node(&mut self, root: &mut TreeRoot, path: &mut Path, level: usize) -> Result<()> {
        if path.nodes[level] == root.bytenr {
            self.insert_new_root(root, path, level + 1)?;
        } else {
            let pushed = self.push_nodes_for_insert(root, path, level)?;
            let nritems = self.block(path.nodes[level])?.nritems();
            let max_ptrs = self.block(path.nodes[level])?.max_ptrs();
            if pushed && nritems < max_ptrs - 3 {
                return Ok(());
            }
        }

        let c_bytenr = path.nodes[level];
        let c = self.block(c_bytenr)?;
        let c_nritems = c.nritems();
        let mid = (c_nritems + 1) / 2;
        let split_key = c.node_key(mid);
        let template = c.clone();

        let split_bytenr =
            self.alloc_tree_block(root.objectid, level as u8, c_bytenr, &template)?;
        {
            let mut c = self.take_block(c_bytenr)?;
            let split = self.block_mut(split_bytenr)?;
            split.copy_from_block(
                sfs_ondisk::HEADER_SIZE,
                &c,
                sfs_ondisk::HEADER_SIZE + mid * KEY_PTR_SIZE,
                (c_nritems - mid) * KEY_PTR_SIZE,
            );
            split.set_nritems(c_nritems - mid);
            c.set_nritems(mid);
            c.mark_dirty();
            self.put_block(c);
        }

        self.insert_ptr(path, &split_key, split_bytenr, path.slots[level + 1] + 1, level + 1)?;
        debug!(from = c_bytenr, to = split_bytenr, level, mid, "node split");

        if path.slots[level] >= mid {
            path.slots[level] -= mid;
            path.nodes[level] = split_bytenr;
            path.slots[level + 1] += 1;
        }
        Ok(())
    }

    /// Push pointers into the left then right sibling to make room at
    /// `level`. Returns true when some pointers moved.
    fn push_nodes_for_insert(
        &mut self,
        root: &mut TreeRoot,
        path: &mut Path,
        level: usize,
    ) -> Result<bool> {
        let parent_bytenr = path.nodes[level + 1];
        if parent_bytenr == 0 {
            return Ok(false);
        }
        let pslot = path.slots[level + 1];
        let mid_bytenr = path.nodes[level];
        let orig_slot = path.slots[level];
        let max_ptrs = self.block(mid_bytenr)?.max_ptrs();

        // Left sibling first.
        if pslot > 0 {
            let left_bytenr = {
                let parent = self.block(parent_bytenr)?;
                parent.node_blockptr(pslot - 1)
            };
            let left_nr = self.block(left_bytenr)?.nritems();
            if left_nr < max_ptrs - 1 {
                let left_bytenr =
                    self.cow_block(root, left_bytenr, Some((parent_bytenr, pslot - 1)))?;
                if self.push_node_left(left_bytenr, mid_bytenr, false)? {
                    let mid_key = self.block(mid_bytenr)?.node_key(0);
                    self.block_mut(parent_bytenr)?.set_node_key(pslot, &mid_key);
                    let new_left_nr = self.block(left_bytenr)?.nritems();
                    let slot = orig_slot + left_nr;
                    if new_left_nr > slot {
                        path.nodes[level] = left_bytenr;
                        path.slots[level + 1] = pslot - 1;
                        path.slots[level] = slot;
                    } else {
                        path.slots[level] = slot - new_left_nr;
                    }
                    return Ok(true);
                }
            }
        }

        // Then the right sibling.
        let parent_nritems = self.block(parent_bytenr)?.nritems();
        if pslot + 1 < parent_nritems {
            let right_bytenr = {
                let parent = self.block(parent_bytenr)?;
                parent.node_blockptr(pslot + 1)
            };
            let right_nr = self.block(right_bytenr)?.nritems();
            if right_nr < max_ptrs - 1 {
                let right_bytenr =
                    self.cow_block(root, right_bytenr, Some((parent_bytenr, pslot + 1)))?;
                if self.balance_node_right(right_bytenr, mid_bytenr)? {
                    let right_key = self.block(right_bytenr)?.node_key(0);
                    self.block_mut(parent_bytenr)?
                        .set_node_key(pslot + 1, &right_key);
                    let mid_nr = self.block(mid_bytenr)?.nritems();
                    if mid_nr <= orig_slot {
                        path.nodes[level] = right_bytenr;
                        path.slots[level + 1] = pslot + 1;
                        path.slots[level] = orig_slot - mid_nr;
                    }
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Move pointers from the front of `src` into the tail of `dst` (its
    /// left sibling). With `empty` unset, never drains `src` below 8
    /// pointers. Returns true when pointers moved.
    fn push_node_left(&mut self, dst_bytenr: u64, src_bytenr: u64, empty: bool) -> Result<bool> {
        let mut src = self.take_block(src_bytenr)?;
        let mut dst = self.take_block(dst_bytenr)?;
        let result = Self::push_node_left_inner(&mut dst, &mut src, empty);
        self.put_block(src);
        self.put_block(dst);
        Ok(result)
    }

    fn push_node_left_inner(dst: &mut TreeBlock, src: &mut TreeBlock, empty: bool) -> bool {
        let src_nritems = src.nritems();
        let dst_nritems = dst.nritems();
        let max_ptrs = dst.max_ptrs();
        let mut push_items = max_ptrs.saturating_sub(dst_nritems);

        if !empty && src_nritems <= 8 {
            return false;
        }
        if push_items == 0 {
            return false;
        }

        if empty {
            push_items = push_items.min(src_nritems);
            if push_items < src_nritems && src_nritems - push_items < 8 {
                // Leave at least 8 pointers unless the node empties fully.
                if push_items <= 8 {
                    return false;
                }
                push_items -= 8;
            }
        } else {
            push_items = push_items.min(src_nritems - 8);
        }
        if push_items == 0 {
            return false;
        }

        let base = sfs_ondisk::HEADER_SIZE;
        dst.copy_from_block(
            base + dst_nritems * KEY_PTR_SIZE,
            src,
            base,
            push_items * KEY_PTR_SIZE,
        );
        if push_items < src_nritems {
            src.memmove_within(
                base,
                base + push_items * KEY_PTR_SIZE,
                (src_nritems - push_items) * KEY_PTR_SIZE,
            );
        }
        src.set_nritems(src_nritems - push_items);
        dst.set_nritems(dst_nritems + push_items);
        true
    }

    /// Move up to half of `src`'s tail pointers into the front of `dst`
    /// (its right sibling). Never empties `src`.
    fn balance_node_right(&mut self, dst_bytenr: u64, src_bytenr: u64) -> Result<bool> {
        let mut src = self.take_block(src_bytenr)?;
        let mut dst = self.take_block(dst_bytenr)?;

        let src_nritems = src.nritems();
        let dst_nritems = dst.nritems();
        let max_ptrs = dst.max_ptrs();
        let mut push_items = max_ptrs.saturating_sub(dst_nritems);
        let mut pushed = false;

        if push_items > 0 && src_nritems >= 4 {
            let max_push = src_nritems / 2 + 1;
            if max_push < src_nritems {
                push_items = push_items.min(max_push);
                let base = sfs_ondisk::HEADER_SIZE;
                dst.memmove_within(
                    base + push_items * KEY_PTR_SIZE,
                    base,
                    dst_nritems * KEY_PTR_SIZE,
                );
                dst.copy_from_block(
                    base,
                    &src,
                    base + (src_nritems - push_items) * KEY_PTR_SIZE,
                    push_items * KEY_PTR_SIZE,
                );
                src.set_nritems(src_nritems - push_items);
                dst.set_nritems(dst_nritems + push_items);
                pushed = true;
            }
        }

        self.put_block(src);
        self.put_block(dst);
        Ok(pushed)
    }

    // ── Balance on delete ───────────────────────────────────────────────

    /// Rebalance the node at `level` after key removals below it. Sets
    /// `path.nodes[level]` to 0 when the root collapsed and the caller must
    /// restart its descent.
    fn balance_level(&mut self, root: &mut TreeRoot, path: &mut Path, level: usize) -> Result<()> {
        if level == 0 {
            return Ok(());
        }
        let mid_bytenr = path.nodes[level];
        let parent_bytenr = if level + 1 < MAX_LEVEL {
            path.nodes[level + 1]
        } else {
            0
        };

        if parent_bytenr == 0 {
            // Root level: promote a lone child.
            if self.block(mid_bytenr)?.nritems() != 1 {
                return Ok(());
            }
            let child = self.block(mid_bytenr)?.node_blockptr(0);
            let child = self.cow_block(root, child, Some((mid_bytenr, 0)))?;
            let child_level = self.block(child)?.level();
            root.bytenr = child;
            root.level = child_level;
            path.nodes[level] = 0;
            self.free_tree_block_at(root, mid_bytenr, level as u8);
            debug!(promoted = child, "root collapsed a level");
            return Ok(());
        }

        let max_ptrs = self.block(mid_bytenr)?.max_ptrs();
        if self.block(mid_bytenr)?.nritems() > max_ptrs / 4 {
            return Ok(());
        }

        let pslot = path.slots[level + 1];
        let mut orig_slot = path.slots[level];

        let mut left_bytenr = 0_u64;
        if pslot > 0 {
            let left = self.block(parent_bytenr)?.node_blockptr(pslot - 1);
            left_bytenr = self.cow_block(root, left, Some((parent_bytenr, pslot - 1)))?;
        }
        let parent_nritems = self.block(parent_bytenr)?.nritems();
        let mut right_bytenr = 0_u64;
        if pslot + 1 < parent_nritems {
            let right = self.block(parent_bytenr)?.node_blockptr(pslot + 1);
            right_bytenr = self.cow_block(root, right, Some((parent_bytenr, pslot + 1)))?;
        }

        // Make room in mid by pushing into the left sibling.
        if left_bytenr != 0 {
            orig_slot += self.block(left_bytenr)?.nritems();
            self.push_node_left(left_bytenr, mid_bytenr, true)?;
        }

        // Then drain the right sibling into mid.
        if right_bytenr != 0 {
            self.push_node_left(mid_bytenr, right_bytenr, true)?;
            if self.block(right_bytenr)?.nritems() == 0 {
                self.free_tree_block_at(root, right_bytenr, level as u8);
                self.del_ptr(root, path, level + 1, pslot + 1)?;
                right_bytenr = 0;
            } else {
                let right_key = self.block(right_bytenr)?.node_key(0);
                self.block_mut(parent_bytenr)?
                    .set_node_key(pslot + 1, &right_key);
            }
        }
        let _ = right_bytenr;

        if self.block(mid_bytenr)?.nritems() == 1 {
            // A singleton mid could lose its only pointer to a delete below;
            // pull from the left (the right was already drained).
            debug_assert!(left_bytenr != 0);
            if !self.balance_node_right(mid_bytenr, left_bytenr)? {
                self.push_node_left(left_bytenr, mid_bytenr, true)?;
            }
        }

        if self.block(mid_bytenr)?.nritems() == 0 {
            self.free_tree_block_at(root, mid_bytenr, level as u8);
            self.del_ptr(root, path, level + 1, pslot)?;
            path.nodes[level] = 0;
        } else {
            let mid_key = self.block(mid_bytenr)?.node_key(0);
            self.block_mut(parent_bytenr)?.set_node_key(pslot, &mid_key);
        }

        // Point the path at whichever block now holds the original slot.
        if left_bytenr != 0 {
            let left_nritems = self.block(left_bytenr)?.nritems();
            if left_nritems > orig_slot {
                path.nodes[level] = left_bytenr;
                path.slots[level + 1] = pslot - 1;
                path.slots[level] = orig_slot;
            } else if path.nodes[level] != 0 {
                path.slots[level] = orig_slot - left_nritems;
            }
        }
        Ok(())
    }

    fn free_tree_block_at(&mut self, root: &TreeRoot, bytenr: u64, level: u8) {
        self.free_tree_block(root, bytenr, level);
    }

    /// Delete the pointer at `(level, slot)`. An emptied root is converted
    /// into a level-0 leaf.
    pub fn del_ptr(
        &mut self,
        root: &mut TreeRoot,
        path: &mut Path,
        level: usize,
        slot: usize,
    ) -> Result<()> {
        let parent_bytenr = path.nodes[level];
        let nritems = {
            let parent = self.block_mut(parent_bytenr)?;
            let nritems = parent.nritems();
            if slot != nritems - 1 {
                let base = sfs_ondisk::HEADER_SIZE;
                parent.memmove_within(
                    base + slot * KEY_PTR_SIZE,
                    base + (slot + 1) * KEY_PTR_SIZE,
                    (nritems - slot - 1) * KEY_PTR_SIZE,
                );
            }
            parent.set_nritems(nritems - 1);
            nritems - 1
        };
        if nritems == 0 && parent_bytenr == root.bytenr {
            let parent = self.block_mut(parent_bytenr)?;
            debug_assert_eq!(parent.level(), 1);
            parent.set_level(0);
            root.level = 0;
        } else if slot == 0 {
            let first = self.block(parent_bytenr)?.node_key(0);
            self.fixup_low_keys(path, &first, level + 1);
        }
        Ok(())
    }

    /// Propagate a changed slot-0 key to the ancestors that reference it.
    fn fixup_low_keys(&mut self, path: &Path, key: &Key, level: usize) {
        for i in level..MAX_LEVEL {
            if path.nodes[i] == 0 {
                break;
            }
            let slot = path.slots[i];
            if let Ok(block) = self.block_mut(path.nodes[i]) {
                block.set_node_key(slot, key);
            }
            if slot != 0 {
                break;
            }
        }
    }

    // ── Leaf push & split ───────────────────────────────────────────────

    /// Push items from the tail of the path leaf into its right sibling,
    /// trying to free `data_size` bytes. `empty` pushes everything it can.
    fn push_leaf_right(
        &mut self,
        root: &mut TreeRoot,
        path: &mut Path,
        data_size: usize,
        empty: bool,
    ) -> Result<bool> {
        let upper_bytenr = path.nodes[1];
        if upper_bytenr == 0 {
            return Ok(false);
        }
        let pslot = path.slots[1];
        let upper_nritems = self.block(upper_bytenr)?.nritems();
        if pslot >= upper_nritems - 1 {
            return Ok(false);
        }

        let right = self.block(upper_bytenr)?.node_blockptr(pslot + 1);
        if self.block(right)?.leaf_free_space() < data_size {
            return Ok(false);
        }
        let right_bytenr = self.cow_block(root, right, Some((upper_bytenr, pslot + 1)))?;
        if self.block(right_bytenr)?.leaf_free_space() < data_size {
            return Ok(false);
        }

        let left_bytenr = path.nodes[0];
        let mut left = self.take_block(left_bytenr)?;
        let mut right = self.take_block(right_bytenr)?;

        let left_nritems = left.nritems();
        if left_nritems == 0 {
            self.put_block(left);
            self.put_block(right);
            return Ok(false);
        }
        let free_space = right.leaf_free_space();
        let reserve_floor = if empty { 0 } else { 1 };

        // Walk the tail deciding how many items fit. If the insertion point
        // is among the pushed items, the incoming item's space rides along.
        let mut push_items = 0_usize;
        let mut push_space = 0_usize;
        let mut i = left_nritems;
        while i > reserve_floor {
            i -= 1;
            if path.slots[0] == i {
                push_space += data_size + ITEM_SIZE;
            }
            let this_item = left.item_size(i);
            if this_item + ITEM_SIZE + push_space > free_space {
                break;
            }
            push_items += 1;
            push_space += this_item + ITEM_SIZE;
        }
        if push_items == 0 {
            self.put_block(left);
            self.put_block(right);
            return Ok(false);
        }

        let nodesize = left.nodesize();
        let first_pushed = left_nritems - push_items;
        let moved_data =
            left.item_offset(first_pushed) + left.item_size(first_pushed) - left.leaf_data_end();
        let right_nritems = right.nritems();
        let right_data_end = right.leaf_data_end();

        // Existing right payloads shift down; pushed payloads land on top.
        right.memmove_within(
            right_data_end - moved_data,
            right_data_end,
            nodesize - right_data_end,
        );
        right.copy_from_block(nodesize - moved_data, &left, left.leaf_data_end(), moved_data);

        let base = sfs_ondisk::HEADER_SIZE;
        right.memmove_within(
            base + push_items * ITEM_SIZE,
            base,
            right_nritems * ITEM_SIZE,
        );
        right.copy_from_block(
            base,
            &left,
            base + first_pushed * ITEM_SIZE,
            push_items * ITEM_SIZE,
        );

        let new_right_nritems = right_nritems + push_items;
        right.set_nritems(new_right_nritems);
        let mut running = nodesize;
        for slot in 0..new_right_nritems {
            running -= right.item_size(slot);
            right.set_item_offset(slot, running);
        }
        left.set_nritems(first_pushed);
        left.mark_dirty();

        let right_first = right.item_key(0);
        self.put_block(left);
        self.put_block(right);
        self.block_mut(upper_bytenr)?.set_node_key(pslot + 1, &right_first);

        if path.slots[0] >= first_pushed {
            path.slots[0] -= first_pushed;
            path.nodes[0] = right_bytenr;
            path.slots[1] += 1;
        }
        trace!(push_items, "leaf pushed right");
        Ok(true)
    }

    /// Push items from the front of the path leaf into its left sibling.
    fn push_leaf_left(
        &mut self,
        root: &mut TreeRoot,
        path: &mut Path,
        data_size: usize,
        empty: bool,
    ) -> Result<bool> {
        let upper_bytenr = path.nodes[1];
        let pslot = path.slots[1];
        if upper_bytenr == 0 || pslot == 0 {
            return Ok(false);
        }
        let right_bytenr = path.nodes[0];
        let right_nritems = self.block(right_bytenr)?.nritems();
        if right_nritems == 0 {
            return Ok(false);
        }

        let left = self.block(upper_bytenr)?.node_blockptr(pslot - 1);
        if self.block(left)?.leaf_free_space() < data_size {
            return Ok(false);
        }
        let left_bytenr = self.cow_block(root, left, Some((upper_bytenr, pslot - 1)))?;
        if self.block(left_bytenr)?.leaf_free_space() < data_size {
            return Ok(false);
        }

        let mut right = self.take_block(right_bytenr)?;
        let mut left = self.take_block(left_bytenr)?;

        let free_space = left.leaf_free_space();
        let scan = if empty {
            right_nritems
        } else {
            right_nritems - 1
        };
        let mut push_items = 0_usize;
        let mut push_space = 0_usize;
        for i in 0..scan {
            if path.slots[0] == i {
                push_space += data_size + ITEM_SIZE;
            }
            let this_item = right.item_size(i);
            if this_item + ITEM_SIZE + push_space > free_space {
                break;
            }
            push_items += 1;
            push_space += this_item + ITEM_SIZE;
        }
        if push_items == 0 {
            self.put_block(right);
            self.put_block(left);
            return Ok(false);
        }

        let nodesize = left.nodesize();
        let base = sfs_ondisk::HEADER_SIZE;
        let old_left_nritems = left.nritems();
        let old_left_data_end = left.leaf_data_end();

        // Descriptor table: append right's first push_items to left.
        left.copy_from_block(
            base + old_left_nritems * ITEM_SIZE,
            &right,
            base,
            push_items * ITEM_SIZE,
        );

        // Payload: right's pushed region sits at the top of its block.
        let pushed_start = right.item_offset(push_items - 1);
        let pushed_len = nodesize - pushed_start;
        left.copy_from_block(
            old_left_data_end - pushed_len,
            &right,
            pushed_start,
            pushed_len,
        );
        let shift = nodesize - old_left_data_end;
        let new_left_nritems = old_left_nritems + push_items;
        for slot in old_left_nritems..new_left_nritems {
            let ioff = left.item_offset(slot);
            left.set_item_offset(slot, ioff - shift);
        }
        left.set_nritems(new_left_nritems);

        // Compact the remainder of right.
        if push_items < right_nritems {
            let remaining_len = pushed_start - right.leaf_data_end();
            right.memmove_within(
                nodesize - remaining_len,
                right.leaf_data_end(),
                remaining_len,
            );
            right.memmove_within(
                base,
                base + push_items * ITEM_SIZE,
                (right_nritems - push_items) * ITEM_SIZE,
            );
        }
        let new_right_nritems = right_nritems - push_items;
        right.set_nritems(new_right_nritems);
        let mut running = nodesize;
        for slot in 0..new_right_nritems {
            running -= right.item_size(slot);
            right.set_item_offset(slot, running);
        }
        right.mark_dirty();

        let right_first = if new_right_nritems > 0 {
            Some(right.item_key(0))
        } else {
            None
        };
        self.put_block(right);
        self.put_block(left);

        if let Some(first) = right_first {
            self.fixup_low_keys(path, &first, 1);
        }

        if path.slots[0] < push_items {
            path.slots[0] += old_left_nritems;
            path.nodes[0] = left_bytenr;
            path.slots[1] -= 1;
        } else {
            path.slots[0] -= push_items;
        }
        trace!(push_items, "leaf pushed left");
        Ok(true)
    }

    /// Split the path's leaf so at least `data_size` bytes are available at
    /// the insertion point. `extend` marks an in-place item extension, which
    /// must keep the target item on the path.
    fn split_leaf(
        &mut self,
        root: &mut TreeRoot,
        ins_key: &Key,
        path: &mut Path,
        data_size: usize,
        extend: bool,
    ) -> Result<()> {
        // Hash-ordered directory items scatter; pushing for them just churns.
        if data_size > 0 && ins_key.item_type != ITEM_DIR_ITEM {
            if !self.push_leaf_right(root, path, data_size, false)? {
                self.push_leaf_left(root, path, data_size, false)?;
            }
            if self.block(path.nodes[0])?.leaf_free_space() >= data_size {
                return Ok(());
            }
        }

        if path.nodes[1] == 0 {
            self.insert_new_root(root, path, 1)?;
        }

        let mut num_doubles = 0_u32;
        loop {
            let l_bytenr = path.nodes[0];
            let slot = path.slots[0];
            let (nritems, mut mid) = {
                let l = self.block(l_bytenr)?;
                (l.nritems(), (l.nritems() + 1) / 2)
            };
            let leaf_capacity = self.nodesize() - sfs_ondisk::HEADER_SIZE;
            let space_used = |txn: &mut Self, from: usize, nr: usize| -> Result<usize> {
                let l = txn.block(l_bytenr)?;
                Ok(l.leaf_space_used(from, nr) + nr * ITEM_SIZE)
            };

            let mut split = 1_u8;
            if mid <= slot {
                if nritems == 1
                    || space_used(self, mid, nritems - mid)? + data_size
                        > leaf_capacity
                {
                    if slot >= nritems {
                        split = 0;
                    } else {
                        mid = slot;
                        if mid != nritems
                            && space_used(self, mid, nritems - mid)? + data_size
                                > leaf_capacity
                        {
                            split = 2;
                        }
                    }
                }
            } else if space_used(self, 0, mid)? + data_size > leaf_capacity {
                if !extend && data_size > 0 && slot == 0 {
                    split = 0;
                } else if (extend || data_size == 0) && slot == 0 {
                    mid = 1;
                } else {
                    mid = slot;
                    if mid != nritems
                        && space_used(self, mid, nritems - mid)? + data_size
                            > leaf_capacity
                    {
                        split = 2;
                    }
                }
            }

            let split_key = if split == 0 {
                *ins_key
            } else {
                self.block(l_bytenr)?.item_key(mid)
            };
            let template = self.block(l_bytenr)?.clone();
            let right_bytenr = self.alloc_tree_block(root.objectid, 0, l_bytenr, &template)?;

            if split == 0 {
                // Empty-right variant: redirect the path to a fresh leaf.
                if mid <= slot {
                    self.insert_ptr(path, &split_key, right_bytenr, path.slots[1] + 1, 1)?;
                    path.nodes[0] = right_bytenr;
                    path.slots[0] = 0;
                    path.slots[1] += 1;
                } else {
                    self.insert_ptr(path, &split_key, right_bytenr, path.slots[1], 1)?;
                    path.nodes[0] = right_bytenr;
                    path.slots[0] = 0;
                    if path.slots[1] == 0 {
                        self.fixup_low_keys(path, &split_key, 1);
                    }
                }
                debug!(right = right_bytenr, "leaf split produced empty right leaf");
                return Ok(());
            }

            self.copy_for_split(path, l_bytenr, right_bytenr, slot, mid, nritems)?;

            if split == 2 {
                debug_assert_eq!(num_doubles, 0);
                num_doubles += 1;
                continue;
            }
            return Ok(());
        }
    }

    /// Move items `mid..nritems` of `l` into the fresh leaf `right` and link
    /// it into the parent.
    fn copy_for_split(
        &mut self,
        path: &mut Path,
        l_bytenr: u64,
        right_bytenr: u64,
        slot: usize,
        mid: usize,
        nritems: usize,
    ) -> Result<()> {
        let moved = nritems - mid;
        {
            let mut l = self.take_block(l_bytenr)?;
            let right = self.block_mut(right_bytenr)?;
            let nodesize = l.nodesize();
            let base = sfs_ondisk::HEADER_SIZE;

            let data_copy_size = l.item_offset(mid) + l.item_size(mid) - l.leaf_data_end();
            right.copy_from_block(base, &l, base + mid * ITEM_SIZE, moved * ITEM_SIZE);
            right.copy_from_block(
                nodesize - data_copy_size,
                &l,
                l.leaf_data_end(),
                data_copy_size,
            );
            let rt_shift = nodesize - (l.item_offset(mid) + l.item_size(mid));
            right.set_nritems(moved);
            for i in 0..moved {
                let ioff = right.item_offset(i);
                right.set_item_offset(i, ioff + rt_shift);
            }
            l.set_nritems(mid);
            l.mark_dirty();
            self.put_block(l);
        }

        let right_first = self.block(right_bytenr)?.item_key(0);
        self.insert_ptr(path, &right_first, right_bytenr, path.slots[1] + 1, 1)?;
        debug!(left = l_bytenr, right = right_bytenr, mid, "leaf split");

        debug_assert_eq!(path.slots[0], slot);
        if mid <= slot {
            path.nodes[0] = right_bytenr;
            path.slots[0] = slot - mid;
            path.slots[1] += 1;
        }
        Ok(())
    }

    // ── Insert & delete ─────────────────────────────────────────────────

    /// Make room for `keys` (with payload sizes `sizes`) at their sorted
    /// position, leaving the path at the first new slot.
    pub fn insert_empty_items(
        &mut self,
        root: &mut TreeRoot,
        path: &mut Path,
        keys: &[Key],
        sizes: &[usize],
    ) -> Result<()> {
        debug_assert_eq!(keys.len(), sizes.len());
        debug_assert!(!keys.is_empty());
        let total_data: usize = sizes.iter().sum();
        let total_size = total_data + keys.len() * ITEM_SIZE;

        let found = self.search_slot(root, &keys[0], path, total_size as i32, true)?;
        if found {
            return Err(SfsError::AlreadyExists(format!("key {}", keys[0])));
        }

        let slot = path.slots[0];
        let leaf = self.block_mut(path.nodes[0])?;
        let nritems = leaf.nritems();
        let mut data_end = leaf.leaf_data_end();
        if leaf.leaf_free_space() < total_size {
            return Err(SfsError::NoSpace);
        }

        if slot != nritems {
            // Shift descriptors right and later payloads down; the new
            // items' payload region ends where item[slot]'s used to end.
            let old_data = leaf.item_offset(slot) + leaf.item_size(slot);
            for i in slot..nritems {
                let ioff = leaf.item_offset(i);
                leaf.set_item_offset(i, ioff - total_data);
            }
            let base = sfs_ondisk::HEADER_SIZE;
            leaf.memmove_within(
                base + (slot + keys.len()) * ITEM_SIZE,
                base + slot * ITEM_SIZE,
                (nritems - slot) * ITEM_SIZE,
            );
            leaf.memmove_within(data_end - total_data, data_end, old_data - data_end);
            data_end = old_data;
        }

        for (i, (key, size)) in keys.iter().zip(sizes.iter()).enumerate() {
            leaf.set_item_key(slot + i, key);
            data_end -= size;
            leaf.set_item_offset(slot + i, data_end);
            leaf.set_item_size(slot + i, *size);
        }
        leaf.set_nritems(nritems + keys.len());

        if slot == 0 {
            let key = keys[0];
            self.fixup_low_keys(path, &key, 1);
        }
        Ok(())
    }

    /// Insert one item with payload.
    pub fn insert_item(&mut self, root: &mut TreeRoot, key: &Key, data: &[u8]) -> Result<()> {
        let mut path = Path::new();
        self.insert_empty_items(root, &mut path, &[*key], &[data.len()])?;
        let slot = path.slots[0];
        let leaf = self.block_mut(path.nodes[0])?;
        leaf.item_data_mut(slot).copy_from_slice(data);
        Ok(())
    }

    /// Delete `nr` items starting at `slot` in the path's leaf, merging or
    /// freeing the leaf when it runs dry.
    pub fn del_items(
        &mut self,
        root: &mut TreeRoot,
        path: &mut Path,
        slot: usize,
        nr: usize,
    ) -> Result<()> {
        let leaf_bytenr = path.nodes[0];
        let (mut nritems, dsize) = {
            let leaf = self.block(leaf_bytenr)?;
            (leaf.nritems(), leaf.leaf_space_used(slot, nr))
        };

        {
            let leaf = self.block_mut(leaf_bytenr)?;
            if slot + nr != nritems {
                let data_end = leaf.leaf_data_end();
                let last_off = leaf.item_offset(slot + nr - 1);
                leaf.memmove_within(data_end + dsize, data_end, last_off - data_end);
                for i in slot + nr..nritems {
                    let ioff = leaf.item_offset(i);
                    leaf.set_item_offset(i, ioff + dsize);
                }
                let base = sfs_ondisk::HEADER_SIZE;
                leaf.memmove_within(
                    base + slot * ITEM_SIZE,
                    base + (slot + nr) * ITEM_SIZE,
                    (nritems - slot - nr) * ITEM_SIZE,
                );
            }
            leaf.set_nritems(nritems - nr);
            nritems -= nr;
        }

        if nritems == 0 {
            if leaf_bytenr == root.bytenr {
                // An empty root leaf is a valid (empty) tree.
            } else {
                self.del_ptr(root, path, 1, path.slots[1])?;
                self.free_tree_block_at(root, leaf_bytenr, 0);
            }
            return Ok(());
        }

        if slot == 0 {
            let first = self.block(leaf_bytenr)?.item_key(0);
            self.fixup_low_keys(path, &first, 1);
        }

        // Merge a mostly-empty leaf into its neighbours.
        let leaf_capacity = self.nodesize() - sfs_ondisk::HEADER_SIZE;
        let used =
            self.block(leaf_bytenr)?.leaf_space_used(0, nritems) + nritems * ITEM_SIZE;
        if used < leaf_capacity / 4 && path.nodes[1] != 0 {
            let pslot = path.slots[1];
            self.push_leaf_left(root, path, 1, true)?;
            if path.nodes[0] == leaf_bytenr && self.block(leaf_bytenr)?.nritems() > 0 {
                self.push_leaf_right(root, path, 1, true)?;
            }
            if self.block(leaf_bytenr)?.nritems() == 0 {
                path.slots[1] = pslot;
                self.del_ptr(root, path, 1, pslot)?;
                self.free_tree_block_at(root, leaf_bytenr, 0);
                if path.nodes[0] == leaf_bytenr {
                    path.nodes[0] = 0;
                }
            }
        }
        Ok(())
    }

    /// Delete the single item the path points at.
    pub fn del_item(&mut self, root: &mut TreeRoot, path: &mut Path) -> Result<()> {
        let slot = path.slots[0];
        self.del_items(root, path, slot, 1)
    }

    // ── Leaf iteration ──────────────────────────────────────────────────

    /// Move the path to the next leaf to the right. Returns false when the
    /// tree is exhausted. Requires the path to hold a leaf at level 0.
    pub fn next_leaf(&mut self, root: &TreeRoot, path: &mut Path) -> Result<bool> {
        let _ = root;
        let mut level = 1_usize;
        let mut slot;
        let mut next;
        loop {
            if level >= MAX_LEVEL || path.nodes[level] == 0 {
                return Ok(false);
            }
            slot = path.slots[level] + 1;
            let block = self.block(path.nodes[level])?;
            if slot >= block.nritems() {
                level += 1;
                continue;
            }
            if path.reada {
                let targets: Vec<u64> = {
                    let block = self.block(path.nodes[level])?;
                    (slot..block.nritems()).map(|i| block.node_blockptr(i)).collect()
                };
                for target in targets {
                    self.readahead(target);
                }
            }
            next = self.block(path.nodes[level])?.node_blockptr(slot);
            break;
        }
        path.slots[level] = slot;
        loop {
            level -= 1;
            self.block(next)?;
            path.nodes[level] = next;
            path.slots[level] = 0;
            if level == 0 {
                break;
            }
            next = self.block(next)?.node_blockptr(0);
        }
        Ok(true)
    }

    /// Move the path to the previous leaf. Returns false at the beginning.
    pub fn prev_leaf(&mut self, root: &TreeRoot, path: &mut Path) -> Result<bool> {
        let _ = root;
        let mut level = 1_usize;
        let mut slot;
        let mut next;
        loop {
            if level >= MAX_LEVEL || path.nodes[level] == 0 {
                return Ok(false);
            }
            slot = path.slots[level];
            if slot == 0 {
                level += 1;
                continue;
            }
            slot -= 1;
            next = self.block(path.nodes[level])?.node_blockptr(slot);
            break;
        }
        path.slots[level] = slot;
        loop {
            level -= 1;
            let nritems = self.block(next)?.nritems();
            path.nodes[level] = next;
            path.slots[level] = nritems.saturating_sub(1);
            if level == 0 {
                break;
            }
            next = self.block(next)?.node_blockptr(path.slots[level]);
        }
        Ok(true)
    }

    /// Step the path forward one item, crossing leaves as needed. Returns
    /// false when the tree is exhausted.
    pub fn step_forward(&mut self, root: &TreeRoot, path: &mut Path) -> Result<bool> {
        if path.nodes[0] == 0 {
            return Ok(false);
        }
        let nritems = self.block(path.nodes[0])?.nritems();
        if path.slots[0] + 1 < nritems {
            path.slots[0] += 1;
            return Ok(true);
        }
        self.next_leaf(root, path)
    }

    /// Key and payload at the current path position, if in range.
    pub fn current_item(&mut self, path: &Path) -> Result<Option<(Key, Vec<u8>)>> {
        if path.nodes[0] == 0 {
            return Ok(None);
        }
        let leaf = self.block(path.nodes[0])?;
        if path.slots[0] >= leaf.nritems() {
            return Ok(None);
        }
        Ok(Some((
            leaf.item_key(path.slots[0]),
            leaf.item_data(path.slots[0]).to_vec(),
        )))
    }
}

/// Restartable forward/backward iteration over leaf items, keeping the path
/// state implicit. Consumers may stop at any slot.
pub struct LeafIter {
    root: TreeRoot,
    path: Path,
    forward: bool,
    primed: bool,
}

impl LeafIter {
    /// Iterate forward from the first key `>= start` in `root`.
    pub fn forward(txn: &mut TreeTxn<'_>, mut root: TreeRoot, start: &Key) -> Result<Self> {
        let mut path = Path::new();
        txn.search_slot(&mut root, start, &mut path, 0, false)?;
        Ok(Self {
            root,
            path,
            forward: true,
            primed: true,
        })
    }

    /// Iterate backward from the last key `<= start`.
    pub fn backward(txn: &mut TreeTxn<'_>, mut root: TreeRoot, start: &Key) -> Result<Self> {
        let mut path = Path::new();
        let found = txn.search_slot(&mut root, start, &mut path, 0, false)?;
        if !found {
            // The search left us at the insertion point; step back once.
            if path.slots[0] == 0 {
                let moved = txn.prev_leaf(&root, &mut path)?;
                if !moved {
                    path.nodes[0] = 0;
                }
            } else {
                path.slots[0] -= 1;
            }
        }
        Ok(Self {
            root,
            path,
            forward: false,
            primed: true,
        })
    }

    /// The path currently held by the iterator.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Yield the next `(key, payload)` pair, or `None` when exhausted.
    pub fn next_entry(&mut self, txn: &mut TreeTxn<'_>) -> Result<Option<(Key, Vec<u8>)>> {
        if self.path.nodes[0] == 0 {
            return Ok(None);
        }
        loop {
            if self.primed {
                self.primed = false;
            } else if self.forward {
                if !txn.step_forward(&self.root, &mut self.path)? {
                    return Ok(None);
                }
            } else if self.path.slots[0] == 0 {
                if !txn.prev_leaf(&self.root, &mut self.path)? {
                    return Ok(None);
                }
            } else {
                self.path.slots[0] -= 1;
            }

            let leaf = txn.block(self.path.nodes[0])?;
            if self.path.slots[0] >= leaf.nritems() {
                if self.forward {
                    if !txn.next_leaf(&self.root, &mut self.path)? {
                        return Ok(None);
                    }
                    self.primed = true;
                    continue;
                }
                // Backward from an empty leaf.
                if !txn.prev_leaf(&self.root, &mut self.path)? {
                    return Ok(None);
                }
                self.primed = true;
                continue;
            }
            let leaf = txn.block(self.path.nodes[0])?;
            return Ok(Some((
                leaf.item_key(self.path.slots[0]),
                leaf.item_data(self.path.slots[0]).to_vec(),
            )));
        }
    }
}
