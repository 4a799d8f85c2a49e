//! Tree-block buffer: typed accessors and mutators over one node's bytes.
//!
//! Layout (all offsets from the start of the block):
//! - fixed 101-byte header: csum 0x00, fsid 0x20, bytenr 0x30, flags 0x38,
//!   chunk-tree uuid 0x40, generation 0x50, owner 0x58, nritems 0x60,
//!   level 0x64.
//! - leaf (level 0): a table of 25-byte item descriptors grows from the end
//!   of the header; item payloads grow from the end of the block toward the
//!   table. Item `offset` fields are absolute within the block.
//! - internal node (level > 0): a table of 33-byte key pointers.

use sfs_types::{
    read_fixed, read_le_u32, read_le_u64, write_le_u32, write_le_u64, Key, ParseError,
    CSUM_TYPE_CRC32C, MAX_LEVEL,
};

/// Size of the fixed tree-block header.
pub const HEADER_SIZE: usize = 101;
/// Size of one leaf item descriptor: disk key (17) + offset (4) + size (4).
pub const ITEM_SIZE: usize = 25;
/// Size of one internal key pointer: disk key (17) + bytenr (8) + generation (8).
pub const KEY_PTR_SIZE: usize = 33;
/// Size of a disk key: objectid (8) + type (1) + offset (8).
pub const DISK_KEY_SIZE: usize = 17;

const OFF_CSUM: usize = 0x00;
const OFF_FSID: usize = 0x20;
const OFF_BYTENR: usize = 0x30;
const OFF_FLAGS: usize = 0x38;
const OFF_CHUNK_TREE_UUID: usize = 0x40;
const OFF_GENERATION: usize = 0x50;
const OFF_OWNER: usize = 0x58;
const OFF_NRITEMS: usize = 0x60;
const OFF_LEVEL: usize = 0x64;

fn read_key_at(data: &[u8], off: usize) -> Key {
    Key {
        objectid: u64::from_le_bytes(data[off..off + 8].try_into().expect("key objectid")),
        item_type: data[off + 8],
        offset: u64::from_le_bytes(data[off + 9..off + 17].try_into().expect("key offset")),
    }
}

fn write_key_at(data: &mut [u8], off: usize, key: &Key) {
    write_le_u64(data, off, key.objectid);
    data[off + 8] = key.item_type;
    write_le_u64(data, off + 9, key.offset);
}

/// One tree block, owned. Mutators mark the buffer dirty; the holder decides
/// when to checksum and write it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeBlock {
    buf: Vec<u8>,
    dirty: bool,
}

impl TreeBlock {
    /// Wrap an existing block buffer. The buffer must be at least one header
    /// long; `nodesize` is implied by the buffer length.
    pub fn from_bytes(buf: Vec<u8>) -> Result<Self, ParseError> {
        if buf.len() < HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: HEADER_SIZE,
                offset: 0,
                actual: buf.len(),
            });
        }
        Ok(Self { buf, dirty: false })
    }

    /// Allocate a zeroed block and stamp the identifying header fields.
    #[must_use]
    pub fn new_empty(nodesize: usize, bytenr: u64, owner: u64, generation: u64, level: u8) -> Self {
        let mut block = Self {
            buf: vec![0_u8; nodesize],
            dirty: true,
        };
        block.set_bytenr(bytenr);
        block.set_owner(owner);
        block.set_generation(generation);
        block.set_level(level);
        block.set_nritems(0);
        block
    }

    #[must_use]
    pub fn nodesize(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    // ── Header accessors ────────────────────────────────────────────────

    #[must_use]
    pub fn csum(&self) -> [u8; 32] {
        read_fixed::<32>(&self.buf, OFF_CSUM).expect("header csum")
    }

    #[must_use]
    pub fn fsid(&self) -> [u8; 16] {
        read_fixed::<16>(&self.buf, OFF_FSID).expect("header fsid")
    }

    pub fn set_fsid(&mut self, fsid: [u8; 16]) {
        self.buf[OFF_FSID..OFF_FSID + 16].copy_from_slice(&fsid);
        self.dirty = true;
    }

    #[must_use]
    pub fn bytenr(&self) -> u64 {
        read_le_u64(&self.buf, OFF_BYTENR).expect("header bytenr")
    }

    pub fn set_bytenr(&mut self, bytenr: u64) {
        write_le_u64(&mut self.buf, OFF_BYTENR, bytenr);
        self.dirty = true;
    }

    #[must_use]
    pub fn flags(&self) -> u64 {
        read_le_u64(&self.buf, OFF_FLAGS).expect("header flags")
    }

    pub fn set_flags(&mut self, flags: u64) {
        write_le_u64(&mut self.buf, OFF_FLAGS, flags);
        self.dirty = true;
    }

    #[must_use]
    pub fn chunk_tree_uuid(&self) -> [u8; 16] {
        read_fixed::<16>(&self.buf, OFF_CHUNK_TREE_UUID).expect("chunk tree uuid")
    }

    pub fn set_chunk_tree_uuid(&mut self, uuid: [u8; 16]) {
        self.buf[OFF_CHUNK_TREE_UUID..OFF_CHUNK_TREE_UUID + 16].copy_from_slice(&uuid);
        self.dirty = true;
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        read_le_u64(&self.buf, OFF_GENERATION).expect("header generation")
    }

    pub fn set_generation(&mut self, generation: u64) {
        write_le_u64(&mut self.buf, OFF_GENERATION, generation);
        self.dirty = true;
    }

    #[must_use]
    pub fn owner(&self) -> u64 {
        read_le_u64(&self.buf, OFF_OWNER).expect("header owner")
    }

    pub fn set_owner(&mut self, owner: u64) {
        write_le_u64(&mut self.buf, OFF_OWNER, owner);
        self.dirty = true;
    }

    #[must_use]
    pub fn nritems(&self) -> usize {
        read_le_u32(&self.buf, OFF_NRITEMS).expect("header nritems") as usize
    }

    pub fn set_nritems(&mut self, nritems: usize) {
        write_le_u32(
            &mut self.buf,
            OFF_NRITEMS,
            u32::try_from(nritems).expect("nritems fits u32"),
        );
        self.dirty = true;
    }

    #[must_use]
    pub fn level(&self) -> u8 {
        self.buf[OFF_LEVEL]
    }

    pub fn set_level(&mut self, level: u8) {
        self.buf[OFF_LEVEL] = level;
        self.dirty = true;
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.level() == 0
    }

    // ── Leaf item table ─────────────────────────────────────────────────

    fn item_base(slot: usize) -> usize {
        HEADER_SIZE + slot * ITEM_SIZE
    }

    /// Key of leaf item `slot`. Caller must keep `slot < nritems`.
    #[must_use]
    pub fn item_key(&self, slot: usize) -> Key {
        read_key_at(&self.buf, Self::item_base(slot))
    }

    pub fn set_item_key(&mut self, slot: usize, key: &Key) {
        write_key_at(&mut self.buf, Self::item_base(slot), key);
        self.dirty = true;
    }

    /// Absolute offset of item `slot`'s payload within the block.
    #[must_use]
    pub fn item_offset(&self, slot: usize) -> usize {
        read_le_u32(&self.buf, Self::item_base(slot) + DISK_KEY_SIZE).expect("item offset") as usize
    }

    pub fn set_item_offset(&mut self, slot: usize, offset: usize) {
        write_le_u32(
            &mut self.buf,
            Self::item_base(slot) + DISK_KEY_SIZE,
            u32::try_from(offset).expect("item offset fits u32"),
        );
        self.dirty = true;
    }

    #[must_use]
    pub fn item_size(&self, slot: usize) -> usize {
        read_le_u32(&self.buf, Self::item_base(slot) + DISK_KEY_SIZE + 4).expect("item size")
            as usize
    }

    pub fn set_item_size(&mut self, slot: usize, size: usize) {
        write_le_u32(
            &mut self.buf,
            Self::item_base(slot) + DISK_KEY_SIZE + 4,
            u32::try_from(size).expect("item size fits u32"),
        );
        self.dirty = true;
    }

    /// Payload bytes of leaf item `slot`.
    #[must_use]
    pub fn item_data(&self, slot: usize) -> &[u8] {
        let off = self.item_offset(slot);
        &self.buf[off..off + self.item_size(slot)]
    }

    pub fn item_data_mut(&mut self, slot: usize) -> &mut [u8] {
        let off = self.item_offset(slot);
        let size = self.item_size(slot);
        self.dirty = true;
        &mut self.buf[off..off + size]
    }

    /// Lowest payload byte offset in this leaf; `nodesize` when empty.
    #[must_use]
    pub fn leaf_data_end(&self) -> usize {
        let nritems = self.nritems();
        if nritems == 0 {
            self.nodesize()
        } else {
            self.item_offset(nritems - 1)
        }
    }

    /// Free bytes between the item table and the payload area.
    #[must_use]
    pub fn leaf_free_space(&self) -> usize {
        let table_end = HEADER_SIZE + self.nritems() * ITEM_SIZE;
        self.leaf_data_end().saturating_sub(table_end)
    }

    /// Payload bytes used by items `slot .. slot + nr`.
    #[must_use]
    pub fn leaf_space_used(&self, slot: usize, nr: usize) -> usize {
        (slot..slot + nr).map(|i| self.item_size(i)).sum()
    }

    // ── Internal node key pointers ──────────────────────────────────────

    fn ptr_base(slot: usize) -> usize {
        HEADER_SIZE + slot * KEY_PTR_SIZE
    }

    #[must_use]
    pub fn node_key(&self, slot: usize) -> Key {
        read_key_at(&self.buf, Self::ptr_base(slot))
    }

    pub fn set_node_key(&mut self, slot: usize, key: &Key) {
        write_key_at(&mut self.buf, Self::ptr_base(slot), key);
        self.dirty = true;
    }

    #[must_use]
    pub fn node_blockptr(&self, slot: usize) -> u64 {
        read_le_u64(&self.buf, Self::ptr_base(slot) + DISK_KEY_SIZE).expect("node blockptr")
    }

    pub fn set_node_blockptr(&mut self, slot: usize, bytenr: u64) {
        write_le_u64(&mut self.buf, Self::ptr_base(slot) + DISK_KEY_SIZE, bytenr);
        self.dirty = true;
    }

    #[must_use]
    pub fn node_ptr_generation(&self, slot: usize) -> u64 {
        read_le_u64(&self.buf, Self::ptr_base(slot) + DISK_KEY_SIZE + 8).expect("node ptr gen")
    }

    pub fn set_node_ptr_generation(&mut self, slot: usize, generation: u64) {
        write_le_u64(
            &mut self.buf,
            Self::ptr_base(slot) + DISK_KEY_SIZE + 8,
            generation,
        );
        self.dirty = true;
    }

    /// Maximum key pointers an internal node of this nodesize can hold.
    #[must_use]
    pub fn max_ptrs(&self) -> usize {
        (self.nodesize() - HEADER_SIZE) / KEY_PTR_SIZE
    }

    /// First key of the block regardless of level.
    #[must_use]
    pub fn first_key(&self) -> Option<Key> {
        if self.nritems() == 0 {
            return None;
        }
        Some(if self.is_leaf() {
            self.item_key(0)
        } else {
            self.node_key(0)
        })
    }

    // ── Raw range helpers for the tree layer ────────────────────────────

    /// Copy `len` bytes from `src` to `dst` within this block.
    pub fn memmove_within(&mut self, dst: usize, src: usize, len: usize) {
        self.buf.copy_within(src..src + len, dst);
        self.dirty = true;
    }

    /// Copy `len` bytes at `src` in `other` into `dst` in this block.
    pub fn copy_from_block(&mut self, dst: usize, other: &TreeBlock, src: usize, len: usize) {
        self.buf[dst..dst + len].copy_from_slice(&other.buf[src..src + len]);
        self.dirty = true;
    }

    /// Overwrite a byte range (used by item payload writers).
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.buf[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.dirty = true;
    }

    // ── Checksums ───────────────────────────────────────────────────────

    /// Compute the CRC32C over the checksummed region (everything after the
    /// 32-byte csum field).
    #[must_use]
    pub fn compute_csum(&self) -> u32 {
        crc32c::crc32c(&self.buf[0x20..])
    }

    /// Stamp the checksum into the header.
    pub fn stamp_csum(&mut self) {
        let sum = self.compute_csum();
        write_le_u32(&mut self.buf, 0, sum);
    }

    /// Verify the stored checksum. Only CRC32C is supported.
    pub fn verify_csum(&self, csum_type: u16) -> Result<(), ParseError> {
        if csum_type != CSUM_TYPE_CRC32C {
            return Err(ParseError::InvalidField {
                field: "csum_type",
                reason: "only CRC32C (type 0) is supported",
            });
        }
        let stored = read_le_u32(&self.buf, 0)?;
        if stored != self.compute_csum() {
            return Err(ParseError::InvalidField {
                field: "tree_block_csum",
                reason: "CRC32C checksum mismatch",
            });
        }
        Ok(())
    }
}

// ── Structural validation ───────────────────────────────────────────────────

/// Validate leaf structure: item count within capacity, keys strictly
/// increasing, payloads non-overlapping and exactly filling the block from
/// `leaf_data_end` to the end, and the first key matching `parent_key` when
/// the caller knows it.
pub fn check_leaf(block: &TreeBlock, parent_key: Option<&Key>) -> Result<(), ParseError> {
    if block.level() != 0 {
        return Err(ParseError::InvalidField {
            field: "level",
            reason: "expected leaf level 0",
        });
    }
    let nritems = block.nritems();
    let max_items = (block.nodesize() - HEADER_SIZE) / ITEM_SIZE;
    if nritems > max_items {
        return Err(ParseError::InvalidField {
            field: "nritems",
            reason: "item count exceeds block capacity",
        });
    }
    if nritems == 0 {
        return Ok(());
    }

    if let Some(parent) = parent_key {
        if *parent != block.item_key(0) {
            return Err(ParseError::InvalidField {
                field: "parent_key",
                reason: "first leaf key does not match parent pointer",
            });
        }
    }

    let mut expected_end = block.nodesize();
    for slot in 0..nritems {
        let off = block.item_offset(slot);
        let size = block.item_size(slot);
        let Some(end) = off.checked_add(size) else {
            return Err(ParseError::InvalidField {
                field: "item_offset",
                reason: "overflow",
            });
        };
        if end != expected_end {
            return Err(ParseError::InvalidField {
                field: "item_offset",
                reason: "payloads are not contiguous from the block end",
            });
        }
        if off < HEADER_SIZE + nritems * ITEM_SIZE {
            return Err(ParseError::InvalidField {
                field: "item_offset",
                reason: "payload overlaps the item table",
            });
        }
        expected_end = off;

        if slot + 1 < nritems && block.item_key(slot) >= block.item_key(slot + 1) {
            return Err(ParseError::InvalidField {
                field: "item_key",
                reason: "leaf keys not strictly increasing",
            });
        }
    }
    Ok(())
}

/// Validate internal-node structure: pointer count within bounds, keys
/// strictly increasing, non-zero child pointers, level within limits.
pub fn check_node(block: &TreeBlock, parent_key: Option<&Key>) -> Result<(), ParseError> {
    let level = block.level() as usize;
    if level == 0 || level >= MAX_LEVEL {
        return Err(ParseError::InvalidField {
            field: "level",
            reason: "expected internal node level 1..=7",
        });
    }
    let nritems = block.nritems();
    if nritems == 0 || nritems > block.max_ptrs() {
        return Err(ParseError::InvalidField {
            field: "nritems",
            reason: "pointer count out of bounds",
        });
    }

    if let Some(parent) = parent_key {
        if *parent != block.node_key(0) {
            return Err(ParseError::InvalidField {
                field: "parent_key",
                reason: "first node key does not match parent pointer",
            });
        }
    }

    for slot in 0..nritems {
        if block.node_blockptr(slot) == 0 {
            return Err(ParseError::InvalidField {
                field: "blockptr",
                reason: "child block pointer is zero",
            });
        }
        if slot + 1 < nritems && block.node_key(slot) >= block.node_key(slot + 1) {
            return Err(ParseError::InvalidField {
                field: "node_key",
                reason: "node keys not strictly increasing",
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODESIZE: usize = 4096;

    fn leaf_with_items(items: &[(Key, &[u8])]) -> TreeBlock {
        let mut block = TreeBlock::new_empty(NODESIZE, 0x4000, 5, 1, 0);
        let mut data_end = NODESIZE;
        for (slot, (key, data)) in items.iter().enumerate() {
            data_end -= data.len();
            block.set_nritems(slot + 1);
            block.set_item_key(slot, key);
            block.set_item_offset(slot, data_end);
            block.set_item_size(slot, data.len());
            block.write_bytes(data_end, data);
        }
        block
    }

    #[test]
    fn header_roundtrip() {
        let mut block = TreeBlock::new_empty(NODESIZE, 0x1_0000, 2, 7, 1);
        assert_eq!(block.bytenr(), 0x1_0000);
        assert_eq!(block.owner(), 2);
        assert_eq!(block.generation(), 7);
        assert_eq!(block.level(), 1);
        assert!(!block.is_leaf());

        block.set_flags(0x3);
        assert_eq!(block.flags(), 0x3);
        block.set_generation(8);
        assert_eq!(block.generation(), 8);
        assert!(block.is_dirty());
    }

    #[test]
    fn leaf_item_roundtrip_is_identity() {
        let payload = b"hello world payload";
        let key = Key::new(256, 1, 0);
        let block = leaf_with_items(&[(key, payload)]);

        assert_eq!(block.nritems(), 1);
        assert_eq!(block.item_key(0), key);
        assert_eq!(block.item_data(0), payload);
        assert_eq!(block.leaf_data_end(), NODESIZE - payload.len());
        assert_eq!(
            block.leaf_free_space(),
            NODESIZE - payload.len() - HEADER_SIZE - ITEM_SIZE
        );
    }

    #[test]
    fn node_ptr_roundtrip() {
        let mut block = TreeBlock::new_empty(NODESIZE, 0x2_0000, 1, 3, 1);
        block.set_nritems(2);
        block.set_node_key(0, &Key::new(1, 0, 0));
        block.set_node_blockptr(0, 0x4000);
        block.set_node_ptr_generation(0, 3);
        block.set_node_key(1, &Key::new(9, 0, 0));
        block.set_node_blockptr(1, 0x8000);
        block.set_node_ptr_generation(1, 3);

        assert_eq!(block.node_key(1), Key::new(9, 0, 0));
        assert_eq!(block.node_blockptr(0), 0x4000);
        assert_eq!(block.node_ptr_generation(1), 3);
        assert!(check_node(&block, Some(&Key::new(1, 0, 0))).is_ok());
    }

    #[test]
    fn checksum_stamp_and_verify() {
        let mut block = TreeBlock::new_empty(NODESIZE, 0x4000, 5, 1, 0);
        block.stamp_csum();
        assert!(block.verify_csum(CSUM_TYPE_CRC32C).is_ok());

        block.set_generation(99);
        assert!(block.verify_csum(CSUM_TYPE_CRC32C).is_err());
        block.stamp_csum();
        assert!(block.verify_csum(CSUM_TYPE_CRC32C).is_ok());
        assert!(block.verify_csum(CSUM_TYPE_SHA256_FAKE).is_err());
    }

    const CSUM_TYPE_SHA256_FAKE: u16 = 2;

    #[test]
    fn check_leaf_accepts_well_formed() {
        let block = leaf_with_items(&[
            (Key::new(1, 1, 0), b"aaaa".as_slice()),
            (Key::new(2, 1, 0), b"bb".as_slice()),
            (Key::new(2, 84, 7), b"cccccc".as_slice()),
        ]);
        assert!(check_leaf(&block, None).is_ok());
        assert!(check_leaf(&block, Some(&Key::new(1, 1, 0))).is_ok());
        assert!(check_leaf(&block, Some(&Key::new(1, 1, 1))).is_err());
    }

    #[test]
    fn check_leaf_rejects_unsorted_keys() {
        let block = leaf_with_items(&[
            (Key::new(5, 1, 0), b"aaaa".as_slice()),
            (Key::new(2, 1, 0), b"bb".as_slice()),
        ]);
        assert!(check_leaf(&block, None).is_err());
    }

    #[test]
    fn check_leaf_rejects_payload_gap() {
        let mut block = leaf_with_items(&[
            (Key::new(1, 1, 0), b"aaaa".as_slice()),
            (Key::new(2, 1, 0), b"bb".as_slice()),
        ]);
        // Introduce a one-byte gap between the two payloads.
        block.set_item_offset(1, block.item_offset(1) - 1);
        assert!(check_leaf(&block, None).is_err());
    }

    #[test]
    fn check_node_rejects_zero_ptr() {
        let mut block = TreeBlock::new_empty(NODESIZE, 0x2_0000, 1, 3, 1);
        block.set_nritems(1);
        block.set_node_key(0, &Key::new(1, 0, 0));
        block.set_node_blockptr(0, 0);
        assert!(check_node(&block, None).is_err());
    }

    #[test]
    fn empty_leaf_has_full_free_space() {
        let block = TreeBlock::new_empty(NODESIZE, 0x4000, 5, 1, 0);
        assert_eq!(block.leaf_data_end(), NODESIZE);
        assert_eq!(block.leaf_free_space(), NODESIZE - HEADER_SIZE);
        assert!(check_leaf(&block, None).is_ok());
    }
}
