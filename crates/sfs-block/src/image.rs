//! Synthetic single-device image construction.
//!
//! Builds a minimal valid filesystem image in memory: superblock (all
//! mirrors that fit), an identity-mapped metadata/data chunk, and empty
//! tree-root leaves. Used by integration tests across the workspace and by
//! the repair path's superblock rewrite.

use crate::{ByteDevice, ChunkMap, FsInfo, MemoryByteDevice};
use sfs_error::Result;
use sfs_ondisk::{encode_chunk_item, encode_superblock, ChunkEntry, Stripe, Superblock, TreeBlock};
use sfs_types::{
    sb_offset, Key, CSUM_TYPE_CRC32C, FIRST_CHUNK_TREE_OBJECTID, ITEM_CHUNK_ITEM, ROOT_TREE_DIR_OBJECTID,
    SUPER_INFO_OFFSET, SUPER_MIRROR_MAX, SUPER_MAGIC,
};

/// Builder for an in-memory filesystem image with identity chunk mapping
/// (logical == physical).
pub struct ImageBuilder {
    dev: MemoryByteDevice,
    nodesize: u32,
    sectorsize: u32,
    total_bytes: u64,
    generation: u64,
    chunks: Vec<ChunkEntry>,
    next_block: u64,
    fsid: [u8; 16],
}

impl ImageBuilder {
    #[must_use]
    pub fn new(total_bytes: u64, nodesize: u32) -> Self {
        let chunk = ChunkEntry {
            logical: 0,
            length: total_bytes,
            type_flags: sfs_types::BLOCK_GROUP_METADATA | sfs_types::BLOCK_GROUP_DATA,
            stripe_len: 65536,
            num_stripes: 1,
            stripes: vec![Stripe { devid: 1, offset: 0 }],
        };
        Self {
            dev: MemoryByteDevice::zeroed(total_bytes as usize),
            nodesize,
            sectorsize: 4096,
            total_bytes,
            generation: 1,
            chunks: vec![chunk],
            // Leave room below for the primary superblock region.
            next_block: SUPER_INFO_OFFSET + u64::from(nodesize).max(65536),
            fsid: [0x5A; 16],
        }
    }

    #[must_use]
    pub fn generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// Reserve the next aligned bytenr for a tree block.
    pub fn reserve_block(&mut self) -> u64 {
        let bytenr = self.next_block;
        self.next_block += u64::from(self.nodesize);
        bytenr
    }

    /// Bytenr where post-build allocation may continue.
    #[must_use]
    pub fn alloc_cursor(&self) -> u64 {
        self.next_block
    }

    /// Write an empty leaf owned by `owner` and return its bytenr.
    pub fn write_empty_leaf(&mut self, owner: u64) -> Result<u64> {
        let bytenr = self.reserve_block();
        let mut block = TreeBlock::new_empty(
            self.nodesize as usize,
            bytenr,
            owner,
            self.generation,
            0,
        );
        block.set_fsid(self.fsid);
        block.set_flags(sfs_types::with_backref_rev(
            sfs_types::HEADER_FLAG_WRITTEN,
            sfs_types::MIXED_BACKREF_REV,
        ));
        self.write_block(&mut block)?;
        Ok(bytenr)
    }

    /// Write (or rewrite) a fully prepared block at its own bytenr.
    pub fn write_block(&mut self, block: &mut TreeBlock) -> Result<()> {
        block.stamp_csum();
        self.dev.write_at(block.bytenr(), block.as_bytes())?;
        Ok(())
    }

    fn sys_chunk_array(&self) -> Vec<u8> {
        let mut array = Vec::new();
        for chunk in &self.chunks {
            let key = Key::new(FIRST_CHUNK_TREE_OBJECTID, ITEM_CHUNK_ITEM, chunk.logical);
            array.extend_from_slice(&key.objectid.to_le_bytes());
            array.push(key.item_type);
            array.extend_from_slice(&key.offset.to_le_bytes());
            array.extend_from_slice(&encode_chunk_item(chunk));
        }
        array
    }

    /// Superblock skeleton for this image; callers adjust roots and commit
    /// via [`ImageBuilder::finish`].
    #[must_use]
    pub fn superblock(&self, root: u64, root_level: u8, chunk_root: u64) -> Superblock {
        Superblock {
            csum: [0; 32],
            fsid: self.fsid,
            bytenr: SUPER_INFO_OFFSET,
            flags: 0,
            magic: SUPER_MAGIC,
            generation: self.generation,
            root,
            chunk_root,
            log_root: 0,
            total_bytes: self.total_bytes,
            bytes_used: 0,
            root_dir_objectid: ROOT_TREE_DIR_OBJECTID,
            num_devices: 1,
            sectorsize: self.sectorsize,
            nodesize: self.nodesize,
            stripesize: self.sectorsize,
            compat_flags: 0,
            compat_ro_flags: 0,
            incompat_flags: 0,
            csum_type: CSUM_TYPE_CRC32C,
            root_level,
            chunk_root_level: 0,
            cache_generation: self.generation,
            label: String::new(),
            sys_chunk_array: self.sys_chunk_array(),
        }
    }

    /// Write the superblock to every mirror that fits and open the image.
    pub fn finish(self, sb: &Superblock) -> Result<FsInfo> {
        let region = encode_superblock(sb);
        for mirror in 0..SUPER_MIRROR_MAX {
            let offset = sb_offset(mirror);
            if offset + region.len() as u64 <= self.total_bytes {
                self.dev.write_at(offset, &region)?;
            }
        }
        FsInfo::open(Box::new(self.dev), 0)
    }

    /// The chunk map as built so far (identity mapping).
    #[must_use]
    pub fn chunk_map(&self) -> ChunkMap {
        ChunkMap::new(self.chunks.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_openable_image() {
        let mut builder = ImageBuilder::new(16 * 1024 * 1024, 4096).generation(3);
        let chunk_leaf = builder.write_empty_leaf(sfs_types::CHUNK_TREE_OBJECTID).expect("chunk leaf");
        let root_leaf = builder.write_empty_leaf(sfs_types::ROOT_TREE_OBJECTID).expect("root leaf");
        let sb = builder.superblock(root_leaf, 0, chunk_leaf);
        let fs = builder.finish(&sb).expect("open");

        assert_eq!(fs.sb.generation, 3);
        let block = fs.read_tree_block(root_leaf, 3).expect("read root leaf");
        assert_eq!(block.owner(), sfs_types::ROOT_TREE_OBJECTID);
        assert_eq!(block.nritems(), 0);
    }
}
