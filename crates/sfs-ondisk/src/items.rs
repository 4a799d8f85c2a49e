//! Item payload codecs.
//!
//! Each `parse_*` takes the raw payload bytes of one leaf item; each
//! `encode_*` produces them. Variable-length items (dir items, inode refs,
//! csums) expose chained-entry iteration the way the leaf stores them.

use serde::{Deserialize, Serialize};
use sfs_types::{
    read_le_u16, read_le_u32, read_le_u64, write_le_u16, write_le_u32, write_le_u64, Key,
    ParseError, FILE_EXTENT_INLINE, FILE_EXTENT_PREALLOC, FILE_EXTENT_REG, ITEM_EXTENT_DATA_REF,
    ITEM_EXTENT_ITEM, ITEM_SHARED_BLOCK_REF, ITEM_SHARED_DATA_REF, ITEM_TREE_BLOCK_REF,
};

use crate::block::DISK_KEY_SIZE;

fn read_key(data: &[u8], off: usize) -> Result<Key, ParseError> {
    Ok(Key {
        objectid: read_le_u64(data, off)?,
        item_type: *data.get(off + 8).ok_or(ParseError::InsufficientData {
            needed: off + 9,
            offset: off + 8,
            actual: data.len(),
        })?,
        offset: read_le_u64(data, off + 9)?,
    })
}

fn write_key(data: &mut [u8], off: usize, key: &Key) {
    write_le_u64(data, off, key.objectid);
    data[off + 8] = key.item_type;
    write_le_u64(data, off + 9, key.offset);
}

// ── Inode item ──────────────────────────────────────────────────────────────

pub const INODE_ITEM_LEN: usize = 160;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeItem {
    pub generation: u64,
    pub transid: u64,
    pub size: u64,
    pub nbytes: u64,
    pub block_group: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub rdev: u64,
    pub flags: u64,
    pub sequence: u64,
    pub atime_sec: u64,
    pub atime_nsec: u32,
    pub ctime_sec: u64,
    pub ctime_nsec: u32,
    pub mtime_sec: u64,
    pub mtime_nsec: u32,
    pub otime_sec: u64,
    pub otime_nsec: u32,
}

pub fn parse_inode_item(data: &[u8]) -> Result<InodeItem, ParseError> {
    if data.len() < INODE_ITEM_LEN {
        return Err(ParseError::InsufficientData {
            needed: INODE_ITEM_LEN,
            offset: 0,
            actual: data.len(),
        });
    }
    Ok(InodeItem {
        generation: read_le_u64(data, 0)?,
        transid: read_le_u64(data, 8)?,
        size: read_le_u64(data, 16)?,
        nbytes: read_le_u64(data, 24)?,
        block_group: read_le_u64(data, 32)?,
        nlink: read_le_u32(data, 40)?,
        uid: read_le_u32(data, 44)?,
        gid: read_le_u32(data, 48)?,
        mode: read_le_u32(data, 52)?,
        rdev: read_le_u64(data, 56)?,
        flags: read_le_u64(data, 64)?,
        sequence: read_le_u64(data, 72)?,
        atime_sec: read_le_u64(data, 112)?,
        atime_nsec: read_le_u32(data, 120)?,
        ctime_sec: read_le_u64(data, 124)?,
        ctime_nsec: read_le_u32(data, 132)?,
        mtime_sec: read_le_u64(data, 136)?,
        mtime_nsec: read_le_u32(data, 144)?,
        otime_sec: read_le_u64(data, 148)?,
        otime_nsec: read_le_u32(data, 156)?,
    })
}

#[must_use]
pub fn encode_inode_item(item: &InodeItem) -> Vec<u8> {
    let mut out = vec![0_u8; INODE_ITEM_LEN];
    write_le_u64(&mut out, 0, item.generation);
    write_le_u64(&mut out, 8, item.transid);
    write_le_u64(&mut out, 16, item.size);
    write_le_u64(&mut out, 24, item.nbytes);
    write_le_u64(&mut out, 32, item.block_group);
    write_le_u32(&mut out, 40, item.nlink);
    write_le_u32(&mut out, 44, item.uid);
    write_le_u32(&mut out, 48, item.gid);
    write_le_u32(&mut out, 52, item.mode);
    write_le_u64(&mut out, 56, item.rdev);
    write_le_u64(&mut out, 64, item.flags);
    write_le_u64(&mut out, 72, item.sequence);
    write_le_u64(&mut out, 112, item.atime_sec);
    write_le_u32(&mut out, 120, item.atime_nsec);
    write_le_u64(&mut out, 124, item.ctime_sec);
    write_le_u32(&mut out, 132, item.ctime_nsec);
    write_le_u64(&mut out, 136, item.mtime_sec);
    write_le_u32(&mut out, 144, item.mtime_nsec);
    write_le_u64(&mut out, 148, item.otime_sec);
    write_le_u32(&mut out, 156, item.otime_nsec);
    out
}

// ── Dir item / dir index ────────────────────────────────────────────────────

const DIR_ITEM_HEADER: usize = 30; // location key (17) + transid (8) + data_len (2) + name_len (2) + type (1)

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirItem {
    pub location: Key,
    pub transid: u64,
    pub file_type: u8,
    pub name: Vec<u8>,
    pub data_len: u16,
}

/// Parse one or more directory entries from a DIR_ITEM / DIR_INDEX payload.
/// Hash-collision chains store several entries in one slot.
pub fn parse_dir_items(data: &[u8]) -> Result<Vec<DirItem>, ParseError> {
    let mut out = Vec::new();
    let mut cur = 0_usize;
    while cur < data.len() {
        if cur + DIR_ITEM_HEADER > data.len() {
            return Err(ParseError::InsufficientData {
                needed: DIR_ITEM_HEADER,
                offset: cur,
                actual: data.len() - cur,
            });
        }
        let location = read_key(data, cur)?;
        let transid = read_le_u64(data, cur + DISK_KEY_SIZE)?;
        let data_len = read_le_u16(data, cur + 25)?;
        let name_len = usize::from(read_le_u16(data, cur + 27)?);
        let file_type = data[cur + 29];

        let name_start = cur + DIR_ITEM_HEADER;
        let name_end = name_start
            .checked_add(name_len)
            .ok_or(ParseError::InvalidField {
                field: "dir_item.name_len",
                reason: "overflow",
            })?;
        let entry_end = name_end
            .checked_add(usize::from(data_len))
            .ok_or(ParseError::InvalidField {
                field: "dir_item.data_len",
                reason: "overflow",
            })?;
        if entry_end > data.len() {
            return Err(ParseError::InsufficientData {
                needed: entry_end,
                offset: cur,
                actual: data.len(),
            });
        }

        out.push(DirItem {
            location,
            transid,
            file_type,
            name: data[name_start..name_end].to_vec(),
            data_len,
        });
        cur = entry_end;
    }
    Ok(out)
}

#[must_use]
pub fn encode_dir_item(item: &DirItem) -> Vec<u8> {
    let mut out = vec![0_u8; DIR_ITEM_HEADER + item.name.len() + usize::from(item.data_len)];
    write_key(&mut out, 0, &item.location);
    write_le_u64(&mut out, DISK_KEY_SIZE, item.transid);
    write_le_u16(&mut out, 25, item.data_len);
    write_le_u16(
        &mut out,
        27,
        u16::try_from(item.name.len()).expect("name fits u16"),
    );
    out[29] = item.file_type;
    out[DIR_ITEM_HEADER..DIR_ITEM_HEADER + item.name.len()].copy_from_slice(&item.name);
    out
}

// ── Inode ref / extref ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeRef {
    pub index: u64,
    pub name: Vec<u8>,
}

/// Parse the chained entries of an INODE_REF payload.
pub fn parse_inode_refs(data: &[u8]) -> Result<Vec<InodeRef>, ParseError> {
    const HEADER: usize = 10; // index (8) + name_len (2)
    let mut out = Vec::new();
    let mut cur = 0_usize;
    while cur < data.len() {
        let index = read_le_u64(data, cur)?;
        let name_len = usize::from(read_le_u16(data, cur + 8)?);
        let name_end = cur + HEADER + name_len;
        if name_end > data.len() {
            return Err(ParseError::InsufficientData {
                needed: name_end,
                offset: cur,
                actual: data.len(),
            });
        }
        out.push(InodeRef {
            index,
            name: data[cur + HEADER..name_end].to_vec(),
        });
        cur = name_end;
    }
    Ok(out)
}

#[must_use]
pub fn encode_inode_ref(entry: &InodeRef) -> Vec<u8> {
    let mut out = vec![0_u8; 10 + entry.name.len()];
    write_le_u64(&mut out, 0, entry.index);
    write_le_u16(
        &mut out,
        8,
        u16::try_from(entry.name.len()).expect("name fits u16"),
    );
    out[10..].copy_from_slice(&entry.name);
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeExtref {
    pub parent: u64,
    pub index: u64,
    pub name: Vec<u8>,
}

/// Parse the chained entries of an INODE_EXTREF payload.
pub fn parse_inode_extrefs(data: &[u8]) -> Result<Vec<InodeExtref>, ParseError> {
    const HEADER: usize = 18; // parent (8) + index (8) + name_len (2)
    let mut out = Vec::new();
    let mut cur = 0_usize;
    while cur < data.len() {
        let parent = read_le_u64(data, cur)?;
        let index = read_le_u64(data, cur + 8)?;
        let name_len = usize::from(read_le_u16(data, cur + 16)?);
        let name_end = cur + HEADER + name_len;
        if name_end > data.len() {
            return Err(ParseError::InsufficientData {
                needed: name_end,
                offset: cur,
                actual: data.len(),
            });
        }
        out.push(InodeExtref {
            parent,
            index,
            name: data[cur + HEADER..name_end].to_vec(),
        });
        cur = name_end;
    }
    Ok(out)
}

// ── File extent item ────────────────────────────────────────────────────────

const FILE_EXTENT_FIXED: usize = 21; // generation (8) + ram_bytes (8) + compression (1) + encryption (1) + other_encoding (2) + type (1)
pub const FILE_EXTENT_REG_LEN: usize = FILE_EXTENT_FIXED + 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileExtent {
    Inline {
        generation: u64,
        ram_bytes: u64,
        compression: u8,
        encryption: u8,
        other_encoding: u16,
        data: Vec<u8>,
    },
    Regular {
        generation: u64,
        ram_bytes: u64,
        compression: u8,
        encryption: u8,
        other_encoding: u16,
        extent_type: u8,
        disk_bytenr: u64,
        disk_num_bytes: u64,
        offset: u64,
        num_bytes: u64,
    },
}

impl FileExtent {
    #[must_use]
    pub fn compression(&self) -> u8 {
        match self {
            Self::Inline { compression, .. } | Self::Regular { compression, .. } => *compression,
        }
    }

    #[must_use]
    pub fn ram_bytes(&self) -> u64 {
        match self {
            Self::Inline { ram_bytes, .. } | Self::Regular { ram_bytes, .. } => *ram_bytes,
        }
    }
}

pub fn parse_file_extent(data: &[u8]) -> Result<FileExtent, ParseError> {
    if data.len() < FILE_EXTENT_FIXED {
        return Err(ParseError::InsufficientData {
            needed: FILE_EXTENT_FIXED,
            offset: 0,
            actual: data.len(),
        });
    }
    let generation = read_le_u64(data, 0)?;
    let ram_bytes = read_le_u64(data, 8)?;
    let compression = data[16];
    let encryption = data[17];
    let other_encoding = read_le_u16(data, 18)?;
    let extent_type = data[20];

    match extent_type {
        FILE_EXTENT_INLINE => Ok(FileExtent::Inline {
            generation,
            ram_bytes,
            compression,
            encryption,
            other_encoding,
            data: data[FILE_EXTENT_FIXED..].to_vec(),
        }),
        FILE_EXTENT_REG | FILE_EXTENT_PREALLOC => {
            if data.len() < FILE_EXTENT_REG_LEN {
                return Err(ParseError::InsufficientData {
                    needed: FILE_EXTENT_REG_LEN,
                    offset: 0,
                    actual: data.len(),
                });
            }
            Ok(FileExtent::Regular {
                generation,
                ram_bytes,
                compression,
                encryption,
                other_encoding,
                extent_type,
                disk_bytenr: read_le_u64(data, 21)?,
                disk_num_bytes: read_le_u64(data, 29)?,
                offset: read_le_u64(data, 37)?,
                num_bytes: read_le_u64(data, 45)?,
            })
        }
        _ => Err(ParseError::InvalidField {
            field: "file_extent.type",
            reason: "unsupported extent type",
        }),
    }
}

#[must_use]
pub fn encode_file_extent(extent: &FileExtent) -> Vec<u8> {
    match extent {
        FileExtent::Inline {
            generation,
            ram_bytes,
            compression,
            encryption,
            other_encoding,
            data,
        } => {
            let mut out = vec![0_u8; FILE_EXTENT_FIXED + data.len()];
            write_le_u64(&mut out, 0, *generation);
            write_le_u64(&mut out, 8, *ram_bytes);
            out[16] = *compression;
            out[17] = *encryption;
            write_le_u16(&mut out, 18, *other_encoding);
            out[20] = FILE_EXTENT_INLINE;
            out[FILE_EXTENT_FIXED..].copy_from_slice(data);
            out
        }
        FileExtent::Regular {
            generation,
            ram_bytes,
            compression,
            encryption,
            other_encoding,
            extent_type,
            disk_bytenr,
            disk_num_bytes,
            offset,
            num_bytes,
        } => {
            let mut out = vec![0_u8; FILE_EXTENT_REG_LEN];
            write_le_u64(&mut out, 0, *generation);
            write_le_u64(&mut out, 8, *ram_bytes);
            out[16] = *compression;
            out[17] = *encryption;
            write_le_u16(&mut out, 18, *other_encoding);
            out[20] = *extent_type;
            write_le_u64(&mut out, 21, *disk_bytenr);
            write_le_u64(&mut out, 29, *disk_num_bytes);
            write_le_u64(&mut out, 37, *offset);
            write_le_u64(&mut out, 45, *num_bytes);
            out
        }
    }
}

// ── Extent item (+ inline refs) ─────────────────────────────────────────────

pub const EXTENT_ITEM_FIXED: usize = 24; // refs (8) + generation (8) + flags (8)
const TREE_BLOCK_INFO_LEN: usize = DISK_KEY_SIZE + 1;

/// One inline reference inside an EXTENT_ITEM / METADATA_ITEM payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InlineRef {
    TreeBlock { root: u64 },
    SharedBlock { parent: u64 },
    Data { root: u64, objectid: u64, offset: u64, count: u32 },
    SharedData { parent: u64, count: u32 },
}

impl InlineRef {
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::TreeBlock { .. } | Self::SharedBlock { .. } => 9,
            Self::Data { .. } => 29,
            Self::SharedData { .. } => 13,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentItem {
    pub refs: u64,
    pub generation: u64,
    pub flags: u64,
    /// Present on EXTENT_ITEM tree blocks (not METADATA_ITEM): first key of
    /// the block plus its level.
    pub tree_block_info: Option<(Key, u8)>,
    pub inline_refs: Vec<InlineRef>,
}

/// Parse an EXTENT_ITEM / METADATA_ITEM payload.
///
/// `is_metadata_key` selects the METADATA_ITEM layout (no tree_block_info
/// even when the TREE_BLOCK flag is set).
pub fn parse_extent_item(data: &[u8], is_metadata_key: bool) -> Result<ExtentItem, ParseError> {
    if data.len() < EXTENT_ITEM_FIXED {
        return Err(ParseError::InsufficientData {
            needed: EXTENT_ITEM_FIXED,
            offset: 0,
            actual: data.len(),
        });
    }
    let refs = read_le_u64(data, 0)?;
    let generation = read_le_u64(data, 8)?;
    let flags = read_le_u64(data, 16)?;

    let mut cur = EXTENT_ITEM_FIXED;
    let mut tree_block_info = None;
    if !is_metadata_key && flags & sfs_types::EXTENT_FLAG_TREE_BLOCK != 0 {
        if data.len() < cur + TREE_BLOCK_INFO_LEN {
            return Err(ParseError::InsufficientData {
                needed: cur + TREE_BLOCK_INFO_LEN,
                offset: cur,
                actual: data.len(),
            });
        }
        tree_block_info = Some((read_key(data, cur)?, data[cur + DISK_KEY_SIZE]));
        cur += TREE_BLOCK_INFO_LEN;
    }

    let mut inline_refs = Vec::new();
    while cur < data.len() {
        let ref_type = data[cur];
        let offset = read_le_u64(data, cur + 1)?;
        let entry = match ref_type {
            ITEM_TREE_BLOCK_REF => InlineRef::TreeBlock { root: offset },
            ITEM_SHARED_BLOCK_REF => InlineRef::SharedBlock { parent: offset },
            ITEM_EXTENT_DATA_REF => InlineRef::Data {
                root: offset,
                objectid: read_le_u64(data, cur + 9)?,
                offset: read_le_u64(data, cur + 17)?,
                count: read_le_u32(data, cur + 25)?,
            },
            ITEM_SHARED_DATA_REF => InlineRef::SharedData {
                parent: offset,
                count: read_le_u32(data, cur + 9)?,
            },
            _ => {
                return Err(ParseError::InvalidField {
                    field: "extent_item.inline_ref",
                    reason: "unknown inline ref type",
                })
            }
        };
        cur += entry.encoded_len();
        inline_refs.push(entry);
    }
    if cur != data.len() {
        return Err(ParseError::InvalidField {
            field: "extent_item",
            reason: "trailing bytes after inline refs",
        });
    }

    Ok(ExtentItem {
        refs,
        generation,
        flags,
        tree_block_info,
        inline_refs,
    })
}

#[must_use]
pub fn encode_extent_item(item: &ExtentItem) -> Vec<u8> {
    let info_len = if item.tree_block_info.is_some() {
        TREE_BLOCK_INFO_LEN
    } else {
        0
    };
    let refs_len: usize = item.inline_refs.iter().map(InlineRef::encoded_len).sum();
    let mut out = vec![0_u8; EXTENT_ITEM_FIXED + info_len + refs_len];
    write_le_u64(&mut out, 0, item.refs);
    write_le_u64(&mut out, 8, item.generation);
    write_le_u64(&mut out, 16, item.flags);

    let mut cur = EXTENT_ITEM_FIXED;
    if let Some((key, level)) = &item.tree_block_info {
        write_key(&mut out, cur, key);
        out[cur + DISK_KEY_SIZE] = *level;
        cur += TREE_BLOCK_INFO_LEN;
    }
    for entry in &item.inline_refs {
        match entry {
            InlineRef::TreeBlock { root } => {
                out[cur] = ITEM_TREE_BLOCK_REF;
                write_le_u64(&mut out, cur + 1, *root);
            }
            InlineRef::SharedBlock { parent } => {
                out[cur] = ITEM_SHARED_BLOCK_REF;
                write_le_u64(&mut out, cur + 1, *parent);
            }
            InlineRef::Data {
                root,
                objectid,
                offset,
                count,
            } => {
                out[cur] = ITEM_EXTENT_DATA_REF;
                write_le_u64(&mut out, cur + 1, *root);
                write_le_u64(&mut out, cur + 9, *objectid);
                write_le_u64(&mut out, cur + 17, *offset);
                write_le_u32(&mut out, cur + 25, *count);
            }
            InlineRef::SharedData { parent, count } => {
                out[cur] = ITEM_SHARED_DATA_REF;
                write_le_u64(&mut out, cur + 1, *parent);
                write_le_u32(&mut out, cur + 9, *count);
            }
        }
        cur += entry.encoded_len();
    }
    out
}

/// True for item types that belong to the extent-ref family rooted at an
/// extent's bytenr in the extent tree.
#[must_use]
pub fn is_extent_ref_type(item_type: u8) -> bool {
    matches!(
        item_type,
        ITEM_EXTENT_ITEM
            | sfs_types::ITEM_METADATA_ITEM
            | ITEM_TREE_BLOCK_REF
            | ITEM_EXTENT_DATA_REF
            | sfs_types::ITEM_EXTENT_REF_V0
            | ITEM_SHARED_BLOCK_REF
            | ITEM_SHARED_DATA_REF
    )
}

// ── Stand-alone extent ref items ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentDataRef {
    pub root: u64,
    pub objectid: u64,
    pub offset: u64,
    pub count: u32,
}

pub fn parse_extent_data_ref(data: &[u8]) -> Result<ExtentDataRef, ParseError> {
    Ok(ExtentDataRef {
        root: read_le_u64(data, 0)?,
        objectid: read_le_u64(data, 8)?,
        offset: read_le_u64(data, 16)?,
        count: read_le_u32(data, 24)?,
    })
}

#[must_use]
pub fn encode_extent_data_ref(entry: &ExtentDataRef) -> Vec<u8> {
    let mut out = vec![0_u8; 28];
    write_le_u64(&mut out, 0, entry.root);
    write_le_u64(&mut out, 8, entry.objectid);
    write_le_u64(&mut out, 16, entry.offset);
    write_le_u32(&mut out, 24, entry.count);
    out
}

/// SHARED_DATA_REF payload is just the reference count; the parent is the
/// item key's offset.
pub fn parse_shared_data_ref(data: &[u8]) -> Result<u32, ParseError> {
    read_le_u32(data, 0)
}

#[must_use]
pub fn encode_shared_data_ref(count: u32) -> Vec<u8> {
    count.to_le_bytes().to_vec()
}

/// Legacy EXTENT_REF_V0 payload: root + generation + objectid + count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentRefV0 {
    pub root: u64,
    pub generation: u64,
    pub objectid: u64,
    pub count: u32,
}

pub fn parse_extent_ref_v0(data: &[u8]) -> Result<ExtentRefV0, ParseError> {
    Ok(ExtentRefV0 {
        root: read_le_u64(data, 0)?,
        generation: read_le_u64(data, 8)?,
        objectid: read_le_u64(data, 16)?,
        count: read_le_u32(data, 24)?,
    })
}

// ── Root item / root ref ────────────────────────────────────────────────────

pub const ROOT_ITEM_LEN: usize = INODE_ITEM_LEN + 79;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootItem {
    pub inode: InodeItem,
    pub generation: u64,
    pub root_dirid: u64,
    pub bytenr: u64,
    pub byte_limit: u64,
    pub bytes_used: u64,
    pub last_snapshot: u64,
    pub flags: u64,
    pub refs: u32,
    pub drop_progress: Key,
    pub drop_level: u8,
    pub level: u8,
}

pub fn parse_root_item(data: &[u8]) -> Result<RootItem, ParseError> {
    if data.len() < ROOT_ITEM_LEN {
        return Err(ParseError::InsufficientData {
            needed: ROOT_ITEM_LEN,
            offset: 0,
            actual: data.len(),
        });
    }
    let bytenr = read_le_u64(data, 176)?;
    if bytenr == 0 {
        return Err(ParseError::InvalidField {
            field: "root_item.bytenr",
            reason: "must be non-zero",
        });
    }
    Ok(RootItem {
        inode: parse_inode_item(data)?,
        generation: read_le_u64(data, 160)?,
        root_dirid: read_le_u64(data, 168)?,
        bytenr,
        byte_limit: read_le_u64(data, 184)?,
        bytes_used: read_le_u64(data, 192)?,
        last_snapshot: read_le_u64(data, 200)?,
        flags: read_le_u64(data, 208)?,
        refs: read_le_u32(data, 216)?,
        drop_progress: read_key(data, 220)?,
        drop_level: data[237],
        level: data[238],
    })
}

#[must_use]
pub fn encode_root_item(item: &RootItem) -> Vec<u8> {
    let mut out = vec![0_u8; ROOT_ITEM_LEN];
    out[..INODE_ITEM_LEN].copy_from_slice(&encode_inode_item(&item.inode));
    write_le_u64(&mut out, 160, item.generation);
    write_le_u64(&mut out, 168, item.root_dirid);
    write_le_u64(&mut out, 176, item.bytenr);
    write_le_u64(&mut out, 184, item.byte_limit);
    write_le_u64(&mut out, 192, item.bytes_used);
    write_le_u64(&mut out, 200, item.last_snapshot);
    write_le_u64(&mut out, 208, item.flags);
    write_le_u32(&mut out, 216, item.refs);
    write_key(&mut out, 220, &item.drop_progress);
    out[237] = item.drop_level;
    out[238] = item.level;
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootRef {
    pub dirid: u64,
    pub sequence: u64,
    pub name: Vec<u8>,
}

pub fn parse_root_ref(data: &[u8]) -> Result<RootRef, ParseError> {
    const HEADER: usize = 18; // dirid (8) + sequence (8) + name_len (2)
    let dirid = read_le_u64(data, 0)?;
    let sequence = read_le_u64(data, 8)?;
    let name_len = usize::from(read_le_u16(data, 16)?);
    if HEADER + name_len > data.len() {
        return Err(ParseError::InsufficientData {
            needed: HEADER + name_len,
            offset: HEADER,
            actual: data.len(),
        });
    }
    Ok(RootRef {
        dirid,
        sequence,
        name: data[HEADER..HEADER + name_len].to_vec(),
    })
}

#[must_use]
pub fn encode_root_ref(entry: &RootRef) -> Vec<u8> {
    let mut out = vec![0_u8; 18 + entry.name.len()];
    write_le_u64(&mut out, 0, entry.dirid);
    write_le_u64(&mut out, 8, entry.sequence);
    write_le_u16(
        &mut out,
        16,
        u16::try_from(entry.name.len()).expect("name fits u16"),
    );
    out[18..].copy_from_slice(&entry.name);
    out
}

// ── Block group item ────────────────────────────────────────────────────────

pub const BLOCK_GROUP_ITEM_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockGroupItem {
    pub used: u64,
    pub chunk_objectid: u64,
    pub flags: u64,
}

pub fn parse_block_group_item(data: &[u8]) -> Result<BlockGroupItem, ParseError> {
    Ok(BlockGroupItem {
        used: read_le_u64(data, 0)?,
        chunk_objectid: read_le_u64(data, 8)?,
        flags: read_le_u64(data, 16)?,
    })
}

#[must_use]
pub fn encode_block_group_item(item: &BlockGroupItem) -> Vec<u8> {
    let mut out = vec![0_u8; BLOCK_GROUP_ITEM_LEN];
    write_le_u64(&mut out, 0, item.used);
    write_le_u64(&mut out, 8, item.chunk_objectid);
    write_le_u64(&mut out, 16, item.flags);
    out
}

// ── Chunks ──────────────────────────────────────────────────────────────────

const CHUNK_FIXED: usize = 48;
const STRIPE_LEN: usize = 32; // devid (8) + offset (8) + dev_uuid (16)

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stripe {
    pub devid: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    /// Logical start (the chunk item key's offset).
    pub logical: u64,
    pub length: u64,
    pub type_flags: u64,
    pub stripe_len: u64,
    pub num_stripes: u16,
    pub stripes: Vec<Stripe>,
}

impl ChunkEntry {
    #[must_use]
    pub fn contains(&self, logical: u64) -> bool {
        logical >= self.logical && logical < self.logical.saturating_add(self.length)
    }
}

/// Parse one CHUNK_ITEM payload; `logical` is the item key's offset.
pub fn parse_chunk_item(logical: u64, data: &[u8]) -> Result<ChunkEntry, ParseError> {
    if data.len() < CHUNK_FIXED {
        return Err(ParseError::InsufficientData {
            needed: CHUNK_FIXED,
            offset: 0,
            actual: data.len(),
        });
    }
    let length = read_le_u64(data, 0)?;
    let stripe_len = read_le_u64(data, 16)?;
    let type_flags = read_le_u64(data, 24)?;
    let num_stripes = read_le_u16(data, 44)?;
    if num_stripes == 0 {
        return Err(ParseError::InvalidField {
            field: "chunk.num_stripes",
            reason: "must be non-zero",
        });
    }
    let needed = CHUNK_FIXED + usize::from(num_stripes) * STRIPE_LEN;
    if data.len() < needed {
        return Err(ParseError::InsufficientData {
            needed,
            offset: CHUNK_FIXED,
            actual: data.len(),
        });
    }
    let mut stripes = Vec::with_capacity(usize::from(num_stripes));
    for i in 0..usize::from(num_stripes) {
        let base = CHUNK_FIXED + i * STRIPE_LEN;
        stripes.push(Stripe {
            devid: read_le_u64(data, base)?,
            offset: read_le_u64(data, base + 8)?,
        });
    }
    Ok(ChunkEntry {
        logical,
        length,
        type_flags,
        stripe_len,
        num_stripes,
        stripes,
    })
}

#[must_use]
pub fn encode_chunk_item(chunk: &ChunkEntry) -> Vec<u8> {
    let mut out = vec![0_u8; CHUNK_FIXED + chunk.stripes.len() * STRIPE_LEN];
    write_le_u64(&mut out, 0, chunk.length);
    write_le_u64(&mut out, 8, sfs_types::EXTENT_TREE_OBJECTID);
    write_le_u64(&mut out, 16, chunk.stripe_len);
    write_le_u64(&mut out, 24, chunk.type_flags);
    write_le_u32(&mut out, 32, 4096);
    write_le_u32(&mut out, 36, 4096);
    write_le_u32(&mut out, 40, 4096);
    write_le_u16(
        &mut out,
        44,
        u16::try_from(chunk.stripes.len()).expect("stripes fit u16"),
    );
    write_le_u16(&mut out, 46, 0);
    for (i, stripe) in chunk.stripes.iter().enumerate() {
        let base = CHUNK_FIXED + i * STRIPE_LEN;
        write_le_u64(&mut out, base, stripe.devid);
        write_le_u64(&mut out, base + 8, stripe.offset);
    }
    out
}

/// Parse the superblock's system chunk array: a sequence of
/// (disk key, chunk item) pairs.
pub fn parse_sys_chunk_array(data: &[u8]) -> Result<Vec<ChunkEntry>, ParseError> {
    let mut out = Vec::new();
    let mut cur = 0_usize;
    while cur < data.len() {
        let key = read_key(data, cur)?;
        cur += DISK_KEY_SIZE;
        if key.item_type != sfs_types::ITEM_CHUNK_ITEM {
            return Err(ParseError::InvalidField {
                field: "sys_chunk_array",
                reason: "expected chunk item key",
            });
        }
        let chunk = parse_chunk_item(key.offset, &data[cur..])?;
        cur += CHUNK_FIXED + chunk.stripes.len() * STRIPE_LEN;
        out.push(chunk);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_types::{
        EXTENT_FLAG_TREE_BLOCK, FT_REG_FILE, ITEM_CHUNK_ITEM, ITEM_INODE_ITEM, S_IFREG,
    };

    #[test]
    fn inode_item_roundtrip() {
        let item = InodeItem {
            generation: 5,
            transid: 6,
            size: 1234,
            nbytes: 4096,
            nlink: 2,
            uid: 1000,
            gid: 1000,
            mode: S_IFREG | 0o644,
            flags: 0,
            mtime_sec: 1_700_000_000,
            mtime_nsec: 17,
            ..InodeItem::default()
        };
        let bytes = encode_inode_item(&item);
        assert_eq!(bytes.len(), INODE_ITEM_LEN);
        assert_eq!(parse_inode_item(&bytes).expect("parse"), item);
    }

    #[test]
    fn dir_item_roundtrip_and_chaining() {
        let a = DirItem {
            location: Key::new(257, ITEM_INODE_ITEM, 0),
            transid: 1,
            file_type: FT_REG_FILE,
            name: b"file.txt".to_vec(),
            data_len: 0,
        };
        let b = DirItem {
            location: Key::new(258, ITEM_INODE_ITEM, 0),
            transid: 1,
            file_type: FT_REG_FILE,
            name: b"other".to_vec(),
            data_len: 0,
        };
        let mut chained = encode_dir_item(&a);
        chained.extend_from_slice(&encode_dir_item(&b));

        let parsed = parse_dir_items(&chained).expect("parse");
        assert_eq!(parsed, vec![a, b]);
    }

    #[test]
    fn dir_item_truncated_fails() {
        let item = DirItem {
            location: Key::new(257, ITEM_INODE_ITEM, 0),
            transid: 1,
            file_type: FT_REG_FILE,
            name: b"file.txt".to_vec(),
            data_len: 0,
        };
        let bytes = encode_dir_item(&item);
        assert!(parse_dir_items(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn inode_ref_roundtrip() {
        let entry = InodeRef {
            index: 2,
            name: b"name".to_vec(),
        };
        let parsed = parse_inode_refs(&encode_inode_ref(&entry)).expect("parse");
        assert_eq!(parsed, vec![entry]);
    }

    #[test]
    fn file_extent_inline_roundtrip() {
        let extent = FileExtent::Inline {
            generation: 4,
            ram_bytes: 11,
            compression: 0,
            encryption: 0,
            other_encoding: 0,
            data: b"hello world".to_vec(),
        };
        let parsed = parse_file_extent(&encode_file_extent(&extent)).expect("parse");
        assert_eq!(parsed, extent);
    }

    #[test]
    fn file_extent_regular_roundtrip() {
        let extent = FileExtent::Regular {
            generation: 4,
            ram_bytes: 8192,
            compression: 0,
            encryption: 0,
            other_encoding: 0,
            extent_type: FILE_EXTENT_REG,
            disk_bytenr: 0x10_0000,
            disk_num_bytes: 8192,
            offset: 0,
            num_bytes: 8192,
        };
        let parsed = parse_file_extent(&encode_file_extent(&extent)).expect("parse");
        assert_eq!(parsed, extent);
    }

    #[test]
    fn extent_item_with_inline_refs_roundtrip() {
        let item = ExtentItem {
            refs: 2,
            generation: 9,
            flags: EXTENT_FLAG_TREE_BLOCK,
            tree_block_info: Some((Key::new(256, 1, 0), 1)),
            inline_refs: vec![
                InlineRef::TreeBlock { root: 5 },
                InlineRef::SharedBlock { parent: 0x8000 },
            ],
        };
        let bytes = encode_extent_item(&item);
        assert_eq!(parse_extent_item(&bytes, false).expect("parse"), item);
    }

    #[test]
    fn metadata_item_skips_tree_block_info() {
        let item = ExtentItem {
            refs: 1,
            generation: 9,
            flags: EXTENT_FLAG_TREE_BLOCK,
            tree_block_info: None,
            inline_refs: vec![InlineRef::TreeBlock { root: 5 }],
        };
        let bytes = encode_extent_item(&item);
        assert_eq!(parse_extent_item(&bytes, true).expect("parse"), item);
    }

    #[test]
    fn extent_item_data_refs_roundtrip() {
        let item = ExtentItem {
            refs: 3,
            generation: 2,
            flags: sfs_types::EXTENT_FLAG_DATA,
            tree_block_info: None,
            inline_refs: vec![
                InlineRef::Data {
                    root: 5,
                    objectid: 257,
                    offset: 0,
                    count: 2,
                },
                InlineRef::SharedData {
                    parent: 0x20_0000,
                    count: 1,
                },
            ],
        };
        let bytes = encode_extent_item(&item);
        assert_eq!(parse_extent_item(&bytes, false).expect("parse"), item);
    }

    #[test]
    fn root_item_roundtrip() {
        let item = RootItem {
            inode: InodeItem::default(),
            generation: 11,
            root_dirid: 256,
            bytenr: 0x8000,
            byte_limit: 0,
            bytes_used: 4096,
            last_snapshot: 3,
            flags: 0,
            refs: 1,
            drop_progress: Key::MIN,
            drop_level: 0,
            level: 1,
        };
        let parsed = parse_root_item(&encode_root_item(&item)).expect("parse");
        assert_eq!(parsed, item);
    }

    #[test]
    fn root_ref_roundtrip() {
        let entry = RootRef {
            dirid: 256,
            sequence: 4,
            name: b"snap".to_vec(),
        };
        assert_eq!(
            parse_root_ref(&encode_root_ref(&entry)).expect("parse"),
            entry
        );
    }

    #[test]
    fn chunk_roundtrip_and_sys_array() {
        let chunk = ChunkEntry {
            logical: 0x40_0000,
            length: 0x40_0000,
            type_flags: sfs_types::BLOCK_GROUP_SYSTEM,
            stripe_len: 65536,
            num_stripes: 2,
            stripes: vec![
                Stripe {
                    devid: 1,
                    offset: 0x40_0000,
                },
                Stripe {
                    devid: 1,
                    offset: 0x80_0000,
                },
            ],
        };
        let payload = encode_chunk_item(&chunk);
        let parsed = parse_chunk_item(chunk.logical, &payload).expect("parse");
        assert_eq!(parsed, chunk);

        let mut array = Vec::new();
        let key = Key::new(FIRST_CHUNK, ITEM_CHUNK_ITEM, chunk.logical);
        let mut key_bytes = vec![0_u8; DISK_KEY_SIZE];
        write_key(&mut key_bytes, 0, &key);
        array.extend_from_slice(&key_bytes);
        array.extend_from_slice(&payload);

        let chunks = parse_sys_chunk_array(&array).expect("parse array");
        assert_eq!(chunks, vec![parsed]);
    }

    const FIRST_CHUNK: u64 = 256;

    #[test]
    fn extent_ref_family() {
        assert!(is_extent_ref_type(ITEM_EXTENT_ITEM));
        assert!(is_extent_ref_type(sfs_types::ITEM_SHARED_DATA_REF));
        assert!(is_extent_ref_type(sfs_types::ITEM_EXTENT_REF_V0));
        assert!(!is_extent_ref_type(sfs_types::ITEM_BLOCK_GROUP_ITEM));
        assert!(!is_extent_ref_type(sfs_types::ITEM_EXTENT_DATA));
    }
}
