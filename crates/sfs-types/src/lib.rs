#![forbid(unsafe_code)]
//! Core value types and on-disk constants shared across the workspace.
//!
//! Everything here is either a plain constant from the on-disk format, a
//! small value type (`Key`), or a bounds-checked little-endian read/write
//! helper used by the codec layers.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

// ── Superblock geometry ─────────────────────────────────────────────────────

/// Byte offset of the primary superblock copy.
pub const SUPER_INFO_OFFSET: u64 = 64 * 1024;
/// Size of the superblock region.
pub const SUPER_INFO_SIZE: usize = 4096;
/// Number of superblock mirror copies.
pub const SUPER_MIRROR_MAX: usize = 3;
/// Superblock magic ("_BHRfS_M" little-endian).
pub const SUPER_MAGIC: u64 = 0x4D5F_5366_5248_425F;

/// Byte offset of superblock mirror `mirror` (0-based).
///
/// Mirror 0 is the primary copy at 64 KiB; each further mirror sits at
/// `16 KiB << (mirror * 12)`.
#[must_use]
pub fn sb_offset(mirror: usize) -> u64 {
    if mirror == 0 {
        return SUPER_INFO_OFFSET;
    }
    let start = 16_u64 * 1024;
    start << (u32::try_from(mirror).unwrap_or(u32::MAX).saturating_mul(12))
}

// ── Checksum algorithms ─────────────────────────────────────────────────────

pub const CSUM_TYPE_CRC32C: u16 = 0;
pub const CSUM_TYPE_XXHASH64: u16 = 1;
pub const CSUM_TYPE_SHA256: u16 = 2;
pub const CSUM_TYPE_BLAKE2B: u16 = 3;

/// Bytes of checksum stored per sector for the given algorithm.
#[must_use]
pub fn csum_size(csum_type: u16) -> usize {
    match csum_type {
        CSUM_TYPE_CRC32C => 4,
        CSUM_TYPE_XXHASH64 => 8,
        _ => 32,
    }
}

// ── Well-known tree objectids ───────────────────────────────────────────────

pub const ROOT_TREE_OBJECTID: u64 = 1;
pub const EXTENT_TREE_OBJECTID: u64 = 2;
pub const CHUNK_TREE_OBJECTID: u64 = 3;
pub const DEV_TREE_OBJECTID: u64 = 4;
pub const FS_TREE_OBJECTID: u64 = 5;
pub const ROOT_TREE_DIR_OBJECTID: u64 = 6;
pub const CSUM_TREE_OBJECTID: u64 = 7;
pub const FREE_SPACE_TREE_OBJECTID: u64 = 10;

pub const ORPHAN_OBJECTID: u64 = u64::MAX - 4;
pub const TREE_RELOC_OBJECTID: u64 = u64::MAX - 7;
pub const DATA_RELOC_TREE_OBJECTID: u64 = u64::MAX - 8;
pub const EXTENT_CSUM_OBJECTID: u64 = u64::MAX - 9;
pub const FREE_SPACE_OBJECTID: u64 = u64::MAX - 10;
pub const FREE_INO_OBJECTID: u64 = u64::MAX - 11;

pub const FIRST_CHUNK_TREE_OBJECTID: u64 = 256;
/// First objectid available for regular inodes / subvolume trees.
pub const FIRST_FREE_OBJECTID: u64 = 256;
/// Last objectid available for regular inodes / subvolume trees.
pub const LAST_FREE_OBJECTID: u64 = u64::MAX - 256;

/// True for objectids that name a filesystem tree (the default tree, the
/// relocation trees, or a subvolume/snapshot tree).
#[must_use]
pub fn is_fs_tree_objectid(objectid: u64) -> bool {
    objectid == FS_TREE_OBJECTID
        || objectid == TREE_RELOC_OBJECTID
        || objectid == DATA_RELOC_TREE_OBJECTID
        || (FIRST_FREE_OBJECTID..=LAST_FREE_OBJECTID).contains(&objectid)
}

// ── Item types ──────────────────────────────────────────────────────────────

pub const ITEM_INODE_ITEM: u8 = 1;
pub const ITEM_INODE_REF: u8 = 12;
pub const ITEM_INODE_EXTREF: u8 = 13;
pub const ITEM_XATTR_ITEM: u8 = 24;
pub const ITEM_ORPHAN_ITEM: u8 = 48;
pub const ITEM_DIR_ITEM: u8 = 84;
pub const ITEM_DIR_INDEX: u8 = 96;
pub const ITEM_EXTENT_DATA: u8 = 108;
pub const ITEM_EXTENT_CSUM: u8 = 128;
pub const ITEM_ROOT_ITEM: u8 = 132;
pub const ITEM_ROOT_BACKREF: u8 = 144;
pub const ITEM_ROOT_REF: u8 = 156;
pub const ITEM_EXTENT_ITEM: u8 = 168;
pub const ITEM_METADATA_ITEM: u8 = 169;
pub const ITEM_TREE_BLOCK_REF: u8 = 176;
pub const ITEM_EXTENT_DATA_REF: u8 = 178;
pub const ITEM_EXTENT_REF_V0: u8 = 180;
pub const ITEM_SHARED_BLOCK_REF: u8 = 182;
pub const ITEM_SHARED_DATA_REF: u8 = 184;
pub const ITEM_BLOCK_GROUP_ITEM: u8 = 192;
pub const ITEM_FREE_SPACE_INFO: u8 = 198;
pub const ITEM_FREE_SPACE_EXTENT: u8 = 199;
pub const ITEM_FREE_SPACE_BITMAP: u8 = 200;
pub const ITEM_DEV_EXTENT: u8 = 204;
pub const ITEM_DEV_ITEM: u8 = 216;
pub const ITEM_CHUNK_ITEM: u8 = 228;

// ── Header flags & backref revisions ────────────────────────────────────────

/// Block has been written out since it was COW-ed in this transaction.
pub const HEADER_FLAG_WRITTEN: u64 = 1 << 0;
/// Block belongs to a relocation tree.
pub const HEADER_FLAG_RELOC: u64 = 1 << 1;

pub const BACKREF_REV_SHIFT: u32 = 56;
pub const BACKREF_REV_MASK: u64 = 0xFF << BACKREF_REV_SHIFT;
/// Pre-mixed-backref disk format; extent refs use the v0 encoding.
pub const OLD_BACKREF_REV: u64 = 0;
/// Current disk format revision.
pub const MIXED_BACKREF_REV: u64 = 1;

/// Extract the backref revision from a header `flags` word.
#[must_use]
pub fn header_backref_rev(flags: u64) -> u64 {
    (flags & BACKREF_REV_MASK) >> BACKREF_REV_SHIFT
}

/// Store a backref revision into a header `flags` word.
#[must_use]
pub fn with_backref_rev(flags: u64, rev: u64) -> u64 {
    (flags & !BACKREF_REV_MASK) | (rev << BACKREF_REV_SHIFT)
}

// ── Extent item flags ───────────────────────────────────────────────────────

pub const EXTENT_FLAG_DATA: u64 = 1 << 0;
pub const EXTENT_FLAG_TREE_BLOCK: u64 = 1 << 1;
/// Tree block is referenced by parent bytenr rather than owning root.
pub const BLOCK_FLAG_FULL_BACKREF: u64 = 1 << 8;

// ── Block group flags ───────────────────────────────────────────────────────

pub const BLOCK_GROUP_DATA: u64 = 1 << 0;
pub const BLOCK_GROUP_SYSTEM: u64 = 1 << 1;
pub const BLOCK_GROUP_METADATA: u64 = 1 << 2;

// ── Inode flags ─────────────────────────────────────────────────────────────

pub const INODE_NODATASUM: u64 = 1 << 0;

// ── Compression ─────────────────────────────────────────────────────────────

pub const COMPRESS_NONE: u8 = 0;
pub const COMPRESS_ZLIB: u8 = 1;
pub const COMPRESS_LZO: u8 = 2;
pub const COMPRESS_ZSTD: u8 = 3;
pub const COMPRESS_LAST: u8 = 4;

// ── File extent types ───────────────────────────────────────────────────────

pub const FILE_EXTENT_INLINE: u8 = 0;
pub const FILE_EXTENT_REG: u8 = 1;
pub const FILE_EXTENT_PREALLOC: u8 = 2;

// ── Directory entry types ───────────────────────────────────────────────────

pub const FT_UNKNOWN: u8 = 0;
pub const FT_REG_FILE: u8 = 1;
pub const FT_DIR: u8 = 2;
pub const FT_CHRDEV: u8 = 3;
pub const FT_BLKDEV: u8 = 4;
pub const FT_FIFO: u8 = 5;
pub const FT_SOCK: u8 = 6;
pub const FT_SYMLINK: u8 = 7;

// ── POSIX mode bits ─────────────────────────────────────────────────────────

pub const S_IFMT: u32 = 0o170_000;
pub const S_IFIFO: u32 = 0o010_000;
pub const S_IFCHR: u32 = 0o020_000;
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFBLK: u32 = 0o060_000;
pub const S_IFREG: u32 = 0o100_000;
pub const S_IFLNK: u32 = 0o120_000;
pub const S_IFSOCK: u32 = 0o140_000;

#[must_use]
pub fn is_dir(imode: u32) -> bool {
    imode & S_IFMT == S_IFDIR
}

#[must_use]
pub fn is_reg(imode: u32) -> bool {
    imode & S_IFMT == S_IFREG
}

#[must_use]
pub fn is_symlink(imode: u32) -> bool {
    imode & S_IFMT == S_IFLNK
}

/// Map an inode mode word to the directory-entry filetype byte.
#[must_use]
pub fn imode_to_type(imode: u32) -> u8 {
    match imode & S_IFMT {
        S_IFREG => FT_REG_FILE,
        S_IFDIR => FT_DIR,
        S_IFCHR => FT_CHRDEV,
        S_IFBLK => FT_BLKDEV,
        S_IFIFO => FT_FIFO,
        S_IFSOCK => FT_SOCK,
        S_IFLNK => FT_SYMLINK,
        _ => FT_UNKNOWN,
    }
}

// ── Limits ──────────────────────────────────────────────────────────────────

/// Maximum tree depth (levels 0..=7).
pub const MAX_LEVEL: usize = 8;
/// Maximum directory-entry name length.
pub const MAX_NAME_LEN: usize = 255;

// ── Key ─────────────────────────────────────────────────────────────────────

/// A tree key: `(objectid, type, offset)` with lexicographic total order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
}

impl Key {
    pub const MIN: Self = Self {
        objectid: 0,
        item_type: 0,
        offset: 0,
    };
    pub const MAX: Self = Self {
        objectid: u64::MAX,
        item_type: u8::MAX,
        offset: u64::MAX,
    };

    #[must_use]
    pub fn new(objectid: u64, item_type: u8, offset: u64) -> Self {
        Self {
            objectid,
            item_type,
            offset,
        }
    }

    /// Smallest key for `objectid` of the given type.
    #[must_use]
    pub fn first_for(objectid: u64, item_type: u8) -> Self {
        Self::new(objectid, item_type, 0)
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.objectid
            .cmp(&other.objectid)
            .then_with(|| self.item_type.cmp(&other.item_type))
            .then_with(|| self.offset.cmp(&other.offset))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {} {})", self.objectid, self.item_type, self.offset)
    }
}

// ── Parse errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Bounds-checked little-endian helpers ────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

// ── Alignment / narrowing helpers ───────────────────────────────────────────

/// Round `value` down to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` otherwise.
#[must_use]
pub fn align_down(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    Some(value & !(alignment - 1))
}

/// Round `value` up to the nearest multiple of `alignment`.
///
/// Returns `None` on overflow or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Narrow a `u64` to `u32` with an explicit error path.
pub fn u64_to_u32(value: u64, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_helpers() {
        let mut bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);

        write_le_u32(&mut bytes, 0, 0xDEAD_BEEF);
        assert_eq!(read_le_u32(&bytes, 0), Ok(0xDEAD_BEEF));
        write_le_u64(&mut bytes, 0, 42);
        assert_eq!(read_le_u64(&bytes, 0), Ok(42));
    }

    #[test]
    fn test_read_out_of_bounds() {
        let bytes = [0_u8; 4];
        assert!(read_le_u64(&bytes, 0).is_err());
        assert!(read_le_u16(&bytes, 3).is_err());
        assert!(ensure_slice(&bytes, usize::MAX, 2).is_err());
    }

    #[test]
    fn test_key_ordering() {
        let a = Key::new(1, 0, 0);
        let b = Key::new(1, 0, 5);
        let c = Key::new(1, 1, 0);
        let d = Key::new(2, 0, 0);
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
        assert_eq!(a, Key::new(1, 0, 0));
        assert!(Key::MIN < a);
        assert!(d < Key::MAX);
    }

    #[test]
    fn test_sb_offsets() {
        assert_eq!(sb_offset(0), 64 * 1024);
        assert_eq!(sb_offset(1), 64 * 1024 * 1024);
        assert_eq!(sb_offset(2), 256 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_backref_rev_roundtrip() {
        let flags = HEADER_FLAG_WRITTEN;
        let stamped = with_backref_rev(flags, MIXED_BACKREF_REV);
        assert_eq!(header_backref_rev(stamped), MIXED_BACKREF_REV);
        assert_eq!(stamped & HEADER_FLAG_WRITTEN, HEADER_FLAG_WRITTEN);
        assert_eq!(header_backref_rev(flags), OLD_BACKREF_REV);
    }

    #[test]
    fn test_imode_mapping() {
        assert_eq!(imode_to_type(S_IFREG | 0o644), FT_REG_FILE);
        assert_eq!(imode_to_type(S_IFDIR | 0o755), FT_DIR);
        assert_eq!(imode_to_type(S_IFLNK | 0o777), FT_SYMLINK);
        assert_eq!(imode_to_type(0), FT_UNKNOWN);
        assert!(is_dir(S_IFDIR));
        assert!(is_reg(S_IFREG));
        assert!(is_symlink(S_IFLNK));
        assert!(!is_dir(S_IFREG));
    }

    #[test]
    fn test_fs_tree_objectids() {
        assert!(is_fs_tree_objectid(FS_TREE_OBJECTID));
        assert!(is_fs_tree_objectid(TREE_RELOC_OBJECTID));
        assert!(is_fs_tree_objectid(256));
        assert!(is_fs_tree_objectid(LAST_FREE_OBJECTID));
        assert!(!is_fs_tree_objectid(EXTENT_TREE_OBJECTID));
        assert!(!is_fs_tree_objectid(u64::MAX));
    }

    #[test]
    fn test_align_helpers() {
        assert_eq!(align_down(4097, 4096), Some(4096));
        assert_eq!(align_up(4097, 4096), Some(8192));
        assert_eq!(align_up(0, 4096), Some(0));
        assert_eq!(align_up(u64::MAX, 4096), None);
        assert_eq!(align_down(100, 3), None);
    }

    #[test]
    fn test_csum_size() {
        assert_eq!(csum_size(CSUM_TYPE_CRC32C), 4);
        assert_eq!(csum_size(CSUM_TYPE_XXHASH64), 8);
        assert_eq!(csum_size(CSUM_TYPE_SHA256), 32);
    }
}
