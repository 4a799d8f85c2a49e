//! Shared-subtree bookkeeping for the multi-tree walker.
//!
//! Snapshots make fs trees share interior nodes. The first walker through a
//! shared block accumulates inode/root state under a `SharedNode`; walkers
//! from other trees splice that accumulated state into their own
//! accumulator and skip the subtree.

use crate::ino::{get_inode_rec, maybe_free_inode_rec, merge_inode_recs, InodeCache};
use sfs_types::MAX_LEVEL;
use std::collections::BTreeMap;
use tracing::trace;

/// Accumulator for one shared tree block (or for the root of a walk).
#[derive(Debug, Default)]
pub struct SharedNode {
    pub bytenr: u64,
    /// Subvolume references found under this node, keyed by child root id.
    pub root_cache: InodeCache,
    /// Inode records accumulated under this node.
    pub inode_cache: InodeCache,
    /// Objectid of the inode currently being filled.
    pub current: Option<u64>,
    /// Owning trees still expected to walk through this block.
    pub refs: u32,
}

impl SharedNode {
    #[must_use]
    pub fn new(bytenr: u64, refs: u32) -> Self {
        Self {
            bytenr,
            refs,
            ..Self::default()
        }
    }
}

/// Which accumulator a walker level points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeSlot {
    #[default]
    Empty,
    /// The per-root local accumulator owned by the caller.
    Local,
    /// A shared node registered in the walk control, keyed by bytenr.
    Shared(u64),
}

/// Walker state shared across every tree of one check invocation.
#[derive(Debug, Default)]
pub struct WalkControl {
    pub shared: BTreeMap<u64, SharedNode>,
    pub nodes: [NodeSlot; MAX_LEVEL],
    pub active_node: usize,
    pub root_level: usize,
}

impl WalkControl {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset per-root state before walking a tree whose root sits at
    /// `root_level`. The shared-node registry persists across roots.
    pub fn begin_root(&mut self, root_level: usize) {
        self.nodes = [NodeSlot::Empty; MAX_LEVEL];
        self.nodes[root_level] = NodeSlot::Local;
        self.active_node = root_level;
        self.root_level = root_level;
    }

    /// The accumulator the current level writes into.
    pub fn active<'a>(&'a mut self, local: &'a mut SharedNode) -> &'a mut SharedNode {
        match self.nodes[self.active_node] {
            NodeSlot::Local => local,
            NodeSlot::Shared(bytenr) => self
                .shared
                .get_mut(&bytenr)
                .expect("active shared node is registered"),
            NodeSlot::Empty => unreachable!("active slot is never empty"),
        }
    }
}

/// Splice `src`'s accumulated state into `dst`. When `src` still has
/// owners, records are cloned; the last owner moves them.
fn splice_shared_node(src: &mut SharedNode, dst: &mut SharedNode) {
    src.refs -= 1;
    let take = src.refs == 0;
    let current_ino = src.current;

    for (cache_sel, dst_is_root) in [(0_u8, true), (1, false)] {
        let src_cache = if cache_sel == 0 {
            &mut src.root_cache
        } else {
            &mut src.inode_cache
        };
        let dst_cache = if dst_is_root {
            &mut dst.root_cache
        } else {
            &mut dst.inode_cache
        };

        let inos: Vec<u64> = src_cache.keys().copied().collect();
        for ino in inos {
            let rec = if take {
                src_cache.remove(&ino).expect("key listed")
            } else {
                src_cache.get(&ino).expect("key listed").clone()
            };
            if dst_cache.contains_key(&ino) {
                let src_checked = rec.checked;
                merge_inode_recs(&rec, dst_cache);
                if src_checked {
                    if let Some(conflict) = dst_cache.get_mut(&ino) {
                        conflict.checked = true;
                    }
                    if dst.current == Some(ino) {
                        dst.current = None;
                    }
                }
                maybe_free_inode_rec(dst_cache, ino);
            } else {
                dst_cache.insert(ino, rec);
            }
        }
    }

    if let Some(ino) = current_ino {
        if dst.current.map_or(true, |cur| ino > cur) {
            if let Some(cur) = dst.current {
                if let Some(rec) = dst.inode_cache.get_mut(&cur) {
                    rec.checked = true;
                }
                maybe_free_inode_rec(&mut dst.inode_cache, cur);
            }
            get_inode_rec(&mut dst.inode_cache, ino);
            dst.current = Some(ino);
        }
    }
}

/// First contact with a block whose refcount exceeds one.
///
/// Returns true when the caller must skip the subtree (another tree already
/// accumulated it, and its state was spliced into the active node).
pub fn enter_shared_node(
    wc: &mut WalkControl,
    local: &mut SharedNode,
    root_refs: u32,
    bytenr: u64,
    refs: u32,
    level: usize,
) -> bool {
    if level == wc.active_node {
        return false;
    }
    debug_assert!(wc.active_node > level);

    if !wc.shared.contains_key(&bytenr) {
        wc.shared.insert(bytenr, SharedNode::new(bytenr, refs));
        wc.nodes[level] = NodeSlot::Shared(bytenr);
        wc.active_node = level;
        trace!(bytenr, refs, level, "entered new shared node");
        return false;
    }

    if wc.root_level == wc.active_node && root_refs == 0 {
        // A dropping root never owns shared state; it only consumes one
        // reference.
        let node = wc.shared.get_mut(&bytenr).expect("checked above");
        node.refs -= 1;
        if node.refs == 0 {
            wc.shared.remove(&bytenr);
        }
        trace!(bytenr, level, "dropping root skipped shared node");
        return true;
    }

    let mut node = wc.shared.remove(&bytenr).expect("checked above");
    match wc.nodes[wc.active_node] {
        NodeSlot::Local => splice_shared_node(&mut node, local),
        NodeSlot::Shared(dst_bytenr) => {
            let mut dst = wc
                .shared
                .remove(&dst_bytenr)
                .expect("active shared node is registered");
            splice_shared_node(&mut node, &mut dst);
            wc.shared.insert(dst_bytenr, dst);
        }
        NodeSlot::Empty => unreachable!("active slot is never empty"),
    }
    if node.refs > 0 {
        wc.shared.insert(bytenr, node);
    }
    trace!(bytenr, level, "spliced shared node and skipped subtree");
    true
}

/// Ascend past the active shared node, splicing its accumulated state into
/// the next accumulator up (unless this root is being dropped at top level).
pub fn leave_shared_node(
    wc: &mut WalkControl,
    local: &mut SharedNode,
    root_refs: u32,
    level: usize,
) {
    if level == wc.root_level {
        return;
    }

    let mut up = level + 1;
    while up < MAX_LEVEL && wc.nodes[up] == NodeSlot::Empty {
        up += 1;
    }
    debug_assert!(up < MAX_LEVEL, "an ancestor accumulator always exists");

    let NodeSlot::Shared(bytenr) = wc.nodes[wc.active_node] else {
        unreachable!("leave is only called for shared active nodes");
    };
    wc.nodes[wc.active_node] = NodeSlot::Empty;
    wc.active_node = up;

    let mut node = wc.shared.remove(&bytenr).expect("active node registered");
    if wc.active_node < wc.root_level || root_refs > 0 {
        debug_assert!(node.refs > 1);
        match wc.nodes[wc.active_node] {
            NodeSlot::Local => splice_shared_node(&mut node, local),
            NodeSlot::Shared(dst_bytenr) => {
                let mut dst = wc
                    .shared
                    .remove(&dst_bytenr)
                    .expect("destination shared node is registered");
                splice_shared_node(&mut node, &mut dst);
                wc.shared.insert(dst_bytenr, dst);
            }
            NodeSlot::Empty => unreachable!(),
        }
    } else {
        debug_assert!(node.refs >= 2);
        node.refs -= 1;
    }
    if node.refs > 0 {
        wc.shared.insert(bytenr, node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ino::add_backref_to_rec;
    use sfs_types::{ITEM_DIR_ITEM, ITEM_INODE_REF};

    #[test]
    fn first_entry_owns_accumulation() {
        let mut wc = WalkControl::new();
        let mut local = SharedNode::new(0, 1);
        wc.begin_root(2);

        let skip = enter_shared_node(&mut wc, &mut local, 1, 0x8000, 2, 1);
        assert!(!skip, "first walker keeps walking");
        assert_eq!(wc.active_node, 1);
        assert!(matches!(wc.nodes[1], NodeSlot::Shared(0x8000)));
    }

    // Scenario: two roots share an interior node holding inode 42; one walk
    // found the dir items, the other the inode ref. After both walks the
    // merged record carries all link facets with no errors.
    #[test]
    fn shared_node_merge_combines_link_facets() {
        let mut wc = WalkControl::new();

        // Walk under R1: enters the shared node and accumulates dir items.
        let mut local_r1 = SharedNode::new(0, 1);
        wc.begin_root(2);
        assert!(!enter_shared_node(&mut wc, &mut local_r1, 1, 0x8000, 2, 1));
        {
            let active = wc.active(&mut local_r1);
            let rec = get_inode_rec(&mut active.inode_cache, 42);
            add_backref_to_rec(rec, 256, 3, b"shared", sfs_types::FT_REG_FILE, ITEM_DIR_ITEM, 0);
        }
        // R1 finishes its walk and ascends past the shared node.
        leave_shared_node(&mut wc, &mut local_r1, 1, 1);
        assert_eq!(wc.active_node, 2);

        // Walk under R2: accumulates the inode ref at its root level, then
        // meets the shared node, which splices R1's findings in.
        let mut local_r2 = SharedNode::new(0, 1);
        wc.begin_root(2);
        {
            let active = wc.active(&mut local_r2);
            let rec = get_inode_rec(&mut active.inode_cache, 42);
            add_backref_to_rec(rec, 256, 3, b"shared", 0, ITEM_INODE_REF, 0);
        }
        let skip = enter_shared_node(&mut wc, &mut local_r2, 1, 0x8000, 2, 1);
        assert!(skip, "second walker skips the shared subtree");

        let rec = &local_r2.inode_cache[&42];
        let backref = &rec.backrefs[0];
        assert!(backref.found_dir_item);
        assert!(backref.found_inode_ref);
        assert_eq!(backref.errors, 0);
        assert!(wc.shared.is_empty(), "both owners consumed the shared node");
    }

    #[test]
    fn dropping_root_consumes_without_splicing() {
        let mut wc = WalkControl::new();
        let mut local_r1 = SharedNode::new(0, 1);
        wc.begin_root(1);
        assert!(!enter_shared_node(&mut wc, &mut local_r1, 1, 0x9000, 2, 0));
        {
            let active = wc.active(&mut local_r1);
            get_inode_rec(&mut active.inode_cache, 7);
        }
        leave_shared_node(&mut wc, &mut local_r1, 1, 0);

        // A root with root_refs == 0 (drop in progress) merely decrements.
        let mut local_drop = SharedNode::new(0, 1);
        wc.begin_root(1);
        let skip = enter_shared_node(&mut wc, &mut local_drop, 0, 0x9000, 2, 0);
        assert!(skip);
        assert!(local_drop.inode_cache.is_empty(), "no splice into dropping root");
        assert!(wc.shared.is_empty());
    }
}
