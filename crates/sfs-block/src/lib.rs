#![forbid(unsafe_code)]
//! Device layer: byte devices, superblock discovery, chunk mapping, and
//! mirror-aware tree-block I/O.
//!
//! Everything above this crate works in the logical address space; this
//! crate owns the translation to physical device offsets and the retry
//! policy across mirror copies.

pub mod image;

use parking_lot::Mutex;
use sfs_error::{Result, SfsError};
use sfs_ondisk::{parse_chunk_item, parse_sys_chunk_array, ChunkEntry, Superblock, TreeBlock};
use sfs_types::{
    sb_offset, u64_to_usize, ParseError, CHUNK_TREE_OBJECTID, ITEM_CHUNK_ITEM, SUPER_INFO_SIZE,
    SUPER_MIRROR_MAX,
};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace, warn};

// ── Byte devices ────────────────────────────────────────────────────────────

/// Positional byte access to one backing store (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;
    fn len(&self) -> Result<u64>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// File-backed device.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(Self {
            file: Arc::new(file),
            writable: false,
        })
    }

    pub fn open_rw(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        Ok(Self {
            file: Arc::new(file),
            writable: true,
        })
    }

    #[must_use]
    pub fn writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(SfsError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "device opened read-only",
            )));
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

/// Memory-backed device for tests and synthetic images.
#[derive(Debug, Default)]
pub struct MemoryByteDevice {
    bytes: Mutex<Vec<u8>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
        }
    }

    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0_u8; len])
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemoryByteDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        let off = u64_to_usize(offset, "offset")?;
        let end = off
            .checked_add(buf.len())
            .ok_or(ParseError::InvalidField {
                field: "offset",
                reason: "overflow",
            })?;
        if end > bytes.len() {
            return Err(SfsError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of memory device",
            )));
        }
        buf.copy_from_slice(&bytes[off..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        let off = u64_to_usize(offset, "offset")?;
        let end = off.checked_add(buf.len()).ok_or(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        })?;
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[off..end].copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.bytes.lock().len() as u64)
    }
}

// ── Chunk mapping ───────────────────────────────────────────────────────────

/// One physical placement of a logical range: a stripe of the covering chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub devid: u64,
    pub physical: u64,
}

/// Logical→physical translation table built from the system chunk array and
/// the chunk tree.
#[derive(Debug, Clone, Default)]
pub struct ChunkMap {
    chunks: Vec<ChunkEntry>,
}

impl ChunkMap {
    #[must_use]
    pub fn new(mut chunks: Vec<ChunkEntry>) -> Self {
        chunks.sort_by_key(|c| c.logical);
        chunks.dedup_by_key(|c| c.logical);
        Self { chunks }
    }

    pub fn from_sys_array(sb: &Superblock) -> Result<Self> {
        Ok(Self::new(parse_sys_chunk_array(&sb.sys_chunk_array)?))
    }

    pub fn insert(&mut self, chunk: ChunkEntry) {
        if let Err(pos) = self.chunks.binary_search_by_key(&chunk.logical, |c| c.logical) {
            self.chunks.insert(pos, chunk);
        }
    }

    #[must_use]
    pub fn chunk_for(&self, logical: u64) -> Option<&ChunkEntry> {
        let idx = match self.chunks.binary_search_by_key(&logical, |c| c.logical) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let chunk = &self.chunks[idx];
        chunk.contains(logical).then_some(chunk)
    }

    /// Map `(logical, len)` to one `Mapping` per mirror copy. The range must
    /// not cross a chunk boundary.
    pub fn map_block(&self, logical: u64, len: u64) -> Result<Vec<Mapping>> {
        let chunk = self.chunk_for(logical).ok_or_else(|| {
            SfsError::corrupt(logical, "logical address not covered by any chunk")
        })?;
        if logical + len > chunk.logical + chunk.length {
            return Err(SfsError::corrupt(
                logical,
                "range crosses a chunk boundary",
            ));
        }
        let delta = logical - chunk.logical;
        Ok(chunk
            .stripes
            .iter()
            .map(|stripe| Mapping {
                devid: stripe.devid,
                physical: stripe.offset + delta,
            })
            .collect())
    }

    /// Number of redundant copies of the given logical range.
    #[must_use]
    pub fn num_copies(&self, logical: u64) -> usize {
        self.chunk_for(logical)
            .map_or(0, |chunk| chunk.stripes.len())
    }

    /// All physical placements of the superblock mirror offsets that fall
    /// inside `[start, start + len)` in logical space. Used by the free-space
    /// verifier to exclude superblock ranges.
    #[must_use]
    pub fn sb_ranges_within(&self, start: u64, len: u64) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        for mirror in 0..SUPER_MIRROR_MAX {
            let sb_start = sb_offset(mirror);
            let sb_len = SUPER_INFO_SIZE as u64;
            // Superblocks live at fixed physical offsets; a logical range
            // covers one when some stripe of its chunk overlaps it.
            if let Some(chunk) = self.chunk_for(start) {
                for stripe in &chunk.stripes {
                    let delta = start - chunk.logical;
                    let phys_start = stripe.offset + delta;
                    let phys_end = phys_start + len;
                    if sb_start < phys_end && phys_start < sb_start + sb_len {
                        let logical_sb = start + sb_start.saturating_sub(phys_start);
                        out.push((logical_sb, sb_len));
                    }
                }
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }
}

// ── Tree block I/O ──────────────────────────────────────────────────────────

/// Read one tree block at `bytenr`, trying each mirror until one yields a
/// checksum-valid block with a matching header. `expected_generation == 0`
/// skips the generation check.
pub fn read_tree_block_raw(
    dev: &dyn ByteDevice,
    chunks: &ChunkMap,
    bytenr: u64,
    nodesize: u32,
    csum_type: u16,
    expected_generation: u64,
) -> Result<TreeBlock> {
    let mappings = chunks.map_block(bytenr, u64::from(nodesize))?;
    let mut last_err: Option<SfsError> = None;

    for (mirror, mapping) in mappings.iter().enumerate() {
        let mut buf = vec![0_u8; nodesize as usize];
        if let Err(err) = dev.read_at(mapping.physical, &mut buf) {
            warn!(bytenr, mirror, "tree block read failed");
            last_err = Some(err);
            continue;
        }
        let block = match TreeBlock::from_bytes(buf) {
            Ok(block) => block,
            Err(err) => {
                last_err = Some(err.into());
                continue;
            }
        };
        if let Err(err) = block.verify_csum(csum_type) {
            warn!(bytenr, mirror, "tree block checksum mismatch");
            last_err = Some(err.into());
            continue;
        }
        if block.bytenr() != bytenr {
            last_err = Some(SfsError::corrupt(bytenr, "header bytenr mismatch"));
            continue;
        }
        if expected_generation != 0 && block.generation() != expected_generation {
            last_err = Some(SfsError::corrupt(bytenr, "stale generation"));
            continue;
        }
        trace!(bytenr, mirror, level = block.level(), "tree block read");
        return Ok(block);
    }

    Err(last_err.unwrap_or(SfsError::MirrorsExhausted {
        bytenr,
        mirrors: chunks.num_copies(bytenr),
    }))
}

/// Write one tree block to every mirror copy, stamping the checksum first.
pub fn write_tree_block(
    dev: &dyn ByteDevice,
    chunks: &ChunkMap,
    block: &mut TreeBlock,
) -> Result<()> {
    block.stamp_csum();
    let bytenr = block.bytenr();
    let mappings = chunks.map_block(bytenr, block.nodesize() as u64)?;
    for mapping in mappings {
        dev.write_at(mapping.physical, block.as_bytes())?;
    }
    block.clear_dirty();
    trace!(bytenr, "tree block written");
    Ok(())
}

// ── Filesystem handle ───────────────────────────────────────────────────────

/// An opened filesystem: superblock, chunk map, device, and a read cache.
pub struct FsInfo {
    pub sb: Superblock,
    pub chunks: ChunkMap,
    dev: Box<dyn ByteDevice>,
    cache: Mutex<HashMap<u64, TreeBlock>>,
}

impl std::fmt::Debug for FsInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsInfo")
            .field("generation", &self.sb.generation)
            .field("nodesize", &self.sb.nodesize)
            .finish_non_exhaustive()
    }
}

impl FsInfo {
    /// Open a filesystem, trying superblock mirrors starting at `mirror`.
    /// The chunk map is bootstrapped from the system chunk array and then
    /// completed from the chunk tree.
    pub fn open(dev: Box<dyn ByteDevice>, mirror: usize) -> Result<Self> {
        let mut last_err: Option<SfsError> = None;
        for i in mirror..SUPER_MIRROR_MAX {
            match Self::read_superblock_mirror(dev.as_ref(), i) {
                Ok(sb) => {
                    debug!(mirror = i, generation = sb.generation, "superblock loaded");
                    return Self::bootstrap(dev, sb);
                }
                Err(err) => {
                    warn!(mirror = i, "superblock mirror unusable, trying backup");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| SfsError::Format("no usable superblock".into())))
    }

    fn read_superblock_mirror(dev: &dyn ByteDevice, mirror: usize) -> Result<Superblock> {
        let offset = sb_offset(mirror);
        let mut region = vec![0_u8; SUPER_INFO_SIZE];
        dev.read_at(offset, &mut region)?;
        Superblock::verify_csum(&region)?;
        Ok(Superblock::parse_region(&region)?)
    }

    fn bootstrap(dev: Box<dyn ByteDevice>, sb: Superblock) -> Result<Self> {
        let mut fs = Self {
            chunks: ChunkMap::from_sys_array(&sb)?,
            sb,
            dev,
            cache: Mutex::new(HashMap::new()),
        };
        fs.load_chunk_tree()?;
        Ok(fs)
    }

    /// Walk the chunk tree and add every CHUNK_ITEM to the map. The system
    /// chunk array must already cover the chunk tree's own blocks.
    fn load_chunk_tree(&mut self) -> Result<()> {
        if self.sb.chunk_root == 0 {
            return Ok(());
        }
        let mut pending = vec![self.sb.chunk_root];
        while let Some(bytenr) = pending.pop() {
            let block = self.read_tree_block(bytenr, 0)?;
            if block.owner() != CHUNK_TREE_OBJECTID {
                return Err(SfsError::corrupt(bytenr, "chunk tree block has wrong owner"));
            }
            if block.is_leaf() {
                for slot in 0..block.nritems() {
                    let key = block.item_key(slot);
                    if key.item_type != ITEM_CHUNK_ITEM {
                        continue;
                    }
                    let chunk = parse_chunk_item(key.offset, block.item_data(slot))?;
                    self.chunks.insert(chunk);
                }
            } else {
                for slot in 0..block.nritems() {
                    pending.push(block.node_blockptr(slot));
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn nodesize(&self) -> u32 {
        self.sb.nodesize
    }

    #[must_use]
    pub fn sectorsize(&self) -> u32 {
        self.sb.sectorsize
    }

    #[must_use]
    pub fn csum_size(&self) -> usize {
        sfs_types::csum_size(self.sb.csum_type)
    }

    pub fn device(&self) -> &dyn ByteDevice {
        self.dev.as_ref()
    }

    /// Read a tree block through the cache, with mirror fallback.
    pub fn read_tree_block(&self, bytenr: u64, expected_generation: u64) -> Result<TreeBlock> {
        if let Some(block) = self.cache.lock().get(&bytenr) {
            if expected_generation == 0 || block.generation() == expected_generation {
                return Ok(block.clone());
            }
        }
        let block = read_tree_block_raw(
            self.dev.as_ref(),
            &self.chunks,
            bytenr,
            self.sb.nodesize,
            self.sb.csum_type,
            expected_generation,
        )?;
        self.cache.lock().insert(bytenr, block.clone());
        Ok(block)
    }

    /// Write a block back to every mirror and refresh the cache.
    pub fn write_tree_block(&self, block: &mut TreeBlock) -> Result<()> {
        write_tree_block(self.dev.as_ref(), &self.chunks, block)?;
        self.cache.lock().insert(block.bytenr(), block.clone());
        Ok(())
    }

    pub fn invalidate(&self, bytenr: u64) {
        self.cache.lock().remove(&bytenr);
    }

    /// Raw read of a data range in logical address space, from mirror
    /// `mirror` (0-based).
    pub fn read_data(&self, logical: u64, len: usize, mirror: usize) -> Result<Vec<u8>> {
        let mappings = self.chunks.map_block(logical, len as u64)?;
        let mapping = mappings
            .get(mirror)
            .ok_or(SfsError::MirrorsExhausted {
                bytenr: logical,
                mirrors: mappings.len(),
            })?;
        let mut buf = vec![0_u8; len];
        self.dev.read_at(mapping.physical, &mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_ondisk::{encode_superblock, Stripe};
    use sfs_types::{Key, CSUM_TYPE_CRC32C, SUPER_INFO_OFFSET};

    const NODESIZE: u32 = 4096;

    fn identity_chunk(len: u64) -> ChunkEntry {
        ChunkEntry {
            logical: 0,
            length: len,
            type_flags: sfs_types::BLOCK_GROUP_METADATA,
            stripe_len: 65536,
            num_stripes: 1,
            stripes: vec![Stripe { devid: 1, offset: 0 }],
        }
    }

    fn mirrored_chunk(logical: u64, len: u64, phys_a: u64, phys_b: u64) -> ChunkEntry {
        ChunkEntry {
            logical,
            length: len,
            type_flags: sfs_types::BLOCK_GROUP_METADATA,
            stripe_len: 65536,
            num_stripes: 2,
            stripes: vec![
                Stripe {
                    devid: 1,
                    offset: phys_a,
                },
                Stripe {
                    devid: 1,
                    offset: phys_b,
                },
            ],
        }
    }

    #[test]
    fn chunk_map_lookup() {
        let map = ChunkMap::new(vec![
            identity_chunk(0x10_0000),
            mirrored_chunk(0x10_0000, 0x10_0000, 0x20_0000, 0x30_0000),
        ]);
        assert_eq!(map.num_copies(0), 1);
        assert_eq!(map.num_copies(0x10_0000), 2);
        assert_eq!(map.num_copies(0x20_0000), 0);

        let mappings = map.map_block(0x10_1000, 4096).expect("map");
        assert_eq!(
            mappings,
            vec![
                Mapping {
                    devid: 1,
                    physical: 0x20_1000
                },
                Mapping {
                    devid: 1,
                    physical: 0x30_1000
                },
            ]
        );

        assert!(map.map_block(0x1F_F000, 8192).is_err());
        assert!(map.map_block(0x40_0000, 4096).is_err());
    }

    #[test]
    fn tree_block_mirror_fallback() {
        let dev = MemoryByteDevice::zeroed(0x40_0000);
        let chunks = ChunkMap::new(vec![mirrored_chunk(0, 0x10_0000, 0x10_0000, 0x20_0000)]);

        let mut block = TreeBlock::new_empty(NODESIZE as usize, 0x4000, 5, 3, 0);
        write_tree_block(&dev, &chunks, &mut block).expect("write both mirrors");

        // Corrupt the first mirror copy; the read must fall back to the second.
        dev.write_at(0x10_4000 + 0x60, &[0xFF; 4]).expect("corrupt");
        let read = read_tree_block_raw(&dev, &chunks, 0x4000, NODESIZE, CSUM_TYPE_CRC32C, 3)
            .expect("mirror fallback");
        assert_eq!(read.generation(), 3);

        // Corrupt both copies and the read fails.
        dev.write_at(0x20_4000 + 0x60, &[0xFF; 4]).expect("corrupt");
        assert!(
            read_tree_block_raw(&dev, &chunks, 0x4000, NODESIZE, CSUM_TYPE_CRC32C, 3).is_err()
        );
    }

    #[test]
    fn open_fs_prefers_first_good_mirror() {
        let dev = MemoryByteDevice::zeroed(0x8_00_0000);
        let chunk = identity_chunk(0x100_0000);
        let mut sys_array = Vec::new();
        {
            // (disk key, chunk item) pair for the sys chunk array.
            let key = Key::new(256, ITEM_CHUNK_ITEM, chunk.logical);
            let mut key_bytes = vec![0_u8; 17];
            key_bytes[0..8].copy_from_slice(&key.objectid.to_le_bytes());
            key_bytes[8] = key.item_type;
            key_bytes[9..17].copy_from_slice(&key.offset.to_le_bytes());
            sys_array.extend_from_slice(&key_bytes);
            sys_array.extend_from_slice(&sfs_ondisk::encode_chunk_item(&chunk));
        }

        let sb = Superblock {
            csum: [0; 32],
            fsid: [1; 16],
            bytenr: SUPER_INFO_OFFSET,
            flags: 0,
            magic: sfs_types::SUPER_MAGIC,
            generation: 7,
            root: 0,
            chunk_root: 0,
            log_root: 0,
            total_bytes: 0x100_0000,
            bytes_used: 0,
            root_dir_objectid: 6,
            num_devices: 1,
            sectorsize: 4096,
            nodesize: NODESIZE,
            stripesize: 4096,
            compat_flags: 0,
            compat_ro_flags: 0,
            incompat_flags: 0,
            csum_type: CSUM_TYPE_CRC32C,
            root_level: 0,
            chunk_root_level: 0,
            cache_generation: 7,
            label: String::new(),
            sys_chunk_array: sys_array,
        };
        let region = encode_superblock(&sb);
        dev.write_at(SUPER_INFO_OFFSET, &region).expect("primary");
        dev.write_at(sfs_types::sb_offset(1), &region).expect("mirror 1");

        // Corrupt the primary; open() must fall back to mirror 1.
        dev.write_at(SUPER_INFO_OFFSET + 0x48, &[0xAA; 8]).expect("corrupt");
        let fs = FsInfo::open(Box::new(dev), 0).expect("open via backup");
        assert_eq!(fs.sb.generation, 7);
        assert_eq!(fs.chunks.num_copies(0), 1);
    }

    #[test]
    fn file_device_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("image");
        std::fs::write(&path, vec![0_u8; 8192]).expect("create");

        let dev = FileByteDevice::open_rw(&path).expect("open");
        dev.write_at(4096, b"salvage").expect("write");
        let mut buf = [0_u8; 7];
        dev.read_at(4096, &mut buf).expect("read");
        assert_eq!(&buf, b"salvage");

        let ro = FileByteDevice::open(&path).expect("open ro");
        assert!(ro.write_at(0, b"x").is_err());
    }
}
