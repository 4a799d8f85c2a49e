//! Superblock codec.
//!
//! The superblock lives at fixed offsets (64 KiB plus mirrors); a region is
//! `SUPER_INFO_SIZE` bytes. The checksum covers everything after the 32-byte
//! csum field, stored little-endian in the first four bytes.

use serde::{Deserialize, Serialize};
use sfs_types::{
    read_fixed, read_le_u16, read_le_u32, read_le_u64, write_le_u16, write_le_u32, write_le_u64,
    ParseError, CSUM_TYPE_CRC32C, SUPER_INFO_SIZE, SUPER_MAGIC,
};

const OFF_MAGIC: usize = 0x40;
const OFF_GENERATION: usize = 0x48;
const OFF_ROOT: usize = 0x50;
const OFF_CHUNK_ROOT: usize = 0x58;
const OFF_LOG_ROOT: usize = 0x60;
const OFF_TOTAL_BYTES: usize = 0x70;
const OFF_BYTES_USED: usize = 0x78;
const OFF_ROOT_DIR_OBJECTID: usize = 0x80;
const OFF_NUM_DEVICES: usize = 0x88;
const OFF_SECTORSIZE: usize = 0x90;
const OFF_NODESIZE: usize = 0x94;
const OFF_STRIPESIZE: usize = 0x9C;
const OFF_SYS_CHUNK_ARRAY_SIZE: usize = 0xA0;
const OFF_COMPAT_FLAGS: usize = 0xAC;
const OFF_COMPAT_RO_FLAGS: usize = 0xB4;
const OFF_INCOMPAT_FLAGS: usize = 0xBC;
const OFF_CSUM_TYPE: usize = 0xC4;
const OFF_ROOT_LEVEL: usize = 0xC6;
const OFF_CHUNK_ROOT_LEVEL: usize = 0xC7;
const OFF_LABEL: usize = 0x12B;
const LABEL_LEN: usize = 256;
const OFF_CACHE_GENERATION: usize = 0x22B;
const OFF_SYS_CHUNK_ARRAY: usize = 0x32B;
const SYS_CHUNK_ARRAY_MAX: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub csum: [u8; 32],
    pub fsid: [u8; 16],
    pub bytenr: u64,
    pub flags: u64,
    pub magic: u64,
    pub generation: u64,
    pub root: u64,
    pub chunk_root: u64,
    pub log_root: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub root_dir_objectid: u64,
    pub num_devices: u64,
    pub sectorsize: u32,
    pub nodesize: u32,
    pub stripesize: u32,
    pub compat_flags: u64,
    pub compat_ro_flags: u64,
    pub incompat_flags: u64,
    pub csum_type: u16,
    pub root_level: u8,
    pub chunk_root_level: u8,
    pub cache_generation: u64,
    pub label: String,
    pub sys_chunk_array: Vec<u8>,
}

impl Superblock {
    /// Parse one superblock region, validating magic and geometry.
    pub fn parse_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < SUPER_INFO_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPER_INFO_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u64(region, OFF_MAGIC)?;
        if magic != SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: SUPER_MAGIC,
                actual: magic,
            });
        }

        let sectorsize = read_le_u32(region, OFF_SECTORSIZE)?;
        let nodesize = read_le_u32(region, OFF_NODESIZE)?;
        if sectorsize == 0 || !sectorsize.is_power_of_two() || sectorsize > 256 * 1024 {
            return Err(ParseError::InvalidField {
                field: "sectorsize",
                reason: "must be a power of two within 256K",
            });
        }
        if nodesize == 0 || !nodesize.is_power_of_two() || nodesize > 256 * 1024 {
            return Err(ParseError::InvalidField {
                field: "nodesize",
                reason: "must be a power of two within 256K",
            });
        }

        let sys_chunk_array_size = read_le_u32(region, OFF_SYS_CHUNK_ARRAY_SIZE)? as usize;
        if sys_chunk_array_size > SYS_CHUNK_ARRAY_MAX {
            return Err(ParseError::InvalidField {
                field: "sys_chunk_array_size",
                reason: "exceeds 2048 byte limit",
            });
        }
        let array_end = OFF_SYS_CHUNK_ARRAY + sys_chunk_array_size;
        if array_end > region.len() {
            return Err(ParseError::InsufficientData {
                needed: array_end,
                offset: OFF_SYS_CHUNK_ARRAY,
                actual: region.len(),
            });
        }

        let label_raw = &region[OFF_LABEL..OFF_LABEL + LABEL_LEN];
        let label_end = label_raw
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(LABEL_LEN);
        let label = String::from_utf8_lossy(&label_raw[..label_end]).into_owned();

        Ok(Self {
            csum: read_fixed::<32>(region, 0x00)?,
            fsid: read_fixed::<16>(region, 0x20)?,
            bytenr: read_le_u64(region, 0x30)?,
            flags: read_le_u64(region, 0x38)?,
            magic,
            generation: read_le_u64(region, OFF_GENERATION)?,
            root: read_le_u64(region, OFF_ROOT)?,
            chunk_root: read_le_u64(region, OFF_CHUNK_ROOT)?,
            log_root: read_le_u64(region, OFF_LOG_ROOT)?,
            total_bytes: read_le_u64(region, OFF_TOTAL_BYTES)?,
            bytes_used: read_le_u64(region, OFF_BYTES_USED)?,
            root_dir_objectid: read_le_u64(region, OFF_ROOT_DIR_OBJECTID)?,
            num_devices: read_le_u64(region, OFF_NUM_DEVICES)?,
            sectorsize,
            nodesize,
            stripesize: read_le_u32(region, OFF_STRIPESIZE)?,
            compat_flags: read_le_u64(region, OFF_COMPAT_FLAGS)?,
            compat_ro_flags: read_le_u64(region, OFF_COMPAT_RO_FLAGS)?,
            incompat_flags: read_le_u64(region, OFF_INCOMPAT_FLAGS)?,
            csum_type: read_le_u16(region, OFF_CSUM_TYPE)?,
            root_level: region[OFF_ROOT_LEVEL],
            chunk_root_level: region[OFF_CHUNK_ROOT_LEVEL],
            cache_generation: read_le_u64(region, OFF_CACHE_GENERATION)?,
            label,
            sys_chunk_array: region[OFF_SYS_CHUNK_ARRAY..array_end].to_vec(),
        })
    }

    /// Verify the stored CRC32C over the checksummed region.
    pub fn verify_csum(region: &[u8]) -> Result<(), ParseError> {
        if region.len() < SUPER_INFO_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPER_INFO_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }
        let csum_type = read_le_u16(region, OFF_CSUM_TYPE)?;
        if csum_type != CSUM_TYPE_CRC32C {
            return Err(ParseError::InvalidField {
                field: "csum_type",
                reason: "only CRC32C (type 0) is supported",
            });
        }
        let stored = read_le_u32(region, 0)?;
        let computed = crc32c::crc32c(&region[0x20..SUPER_INFO_SIZE]);
        if stored != computed {
            return Err(ParseError::InvalidField {
                field: "superblock_csum",
                reason: "CRC32C checksum mismatch",
            });
        }
        Ok(())
    }
}

/// Encode a superblock region (with checksum stamped). Used by repair
/// commit and test fixtures.
#[must_use]
pub fn encode_superblock(sb: &Superblock) -> Vec<u8> {
    let mut region = vec![0_u8; SUPER_INFO_SIZE];
    region[0x20..0x30].copy_from_slice(&sb.fsid);
    write_le_u64(&mut region, 0x30, sb.bytenr);
    write_le_u64(&mut region, 0x38, sb.flags);
    write_le_u64(&mut region, OFF_MAGIC, SUPER_MAGIC);
    write_le_u64(&mut region, OFF_GENERATION, sb.generation);
    write_le_u64(&mut region, OFF_ROOT, sb.root);
    write_le_u64(&mut region, OFF_CHUNK_ROOT, sb.chunk_root);
    write_le_u64(&mut region, OFF_LOG_ROOT, sb.log_root);
    write_le_u64(&mut region, OFF_TOTAL_BYTES, sb.total_bytes);
    write_le_u64(&mut region, OFF_BYTES_USED, sb.bytes_used);
    write_le_u64(&mut region, OFF_ROOT_DIR_OBJECTID, sb.root_dir_objectid);
    write_le_u64(&mut region, OFF_NUM_DEVICES, sb.num_devices);
    write_le_u32(&mut region, OFF_SECTORSIZE, sb.sectorsize);
    write_le_u32(&mut region, OFF_NODESIZE, sb.nodesize);
    write_le_u32(&mut region, OFF_STRIPESIZE, sb.stripesize);
    write_le_u32(
        &mut region,
        OFF_SYS_CHUNK_ARRAY_SIZE,
        u32::try_from(sb.sys_chunk_array.len()).expect("sys chunk array fits u32"),
    );
    write_le_u64(&mut region, OFF_COMPAT_FLAGS, sb.compat_flags);
    write_le_u64(&mut region, OFF_COMPAT_RO_FLAGS, sb.compat_ro_flags);
    write_le_u64(&mut region, OFF_INCOMPAT_FLAGS, sb.incompat_flags);
    write_le_u16(&mut region, OFF_CSUM_TYPE, sb.csum_type);
    region[OFF_ROOT_LEVEL] = sb.root_level;
    region[OFF_CHUNK_ROOT_LEVEL] = sb.chunk_root_level;
    let label_bytes = sb.label.as_bytes();
    let label_len = label_bytes.len().min(LABEL_LEN - 1);
    region[OFF_LABEL..OFF_LABEL + label_len].copy_from_slice(&label_bytes[..label_len]);
    write_le_u64(&mut region, OFF_CACHE_GENERATION, sb.cache_generation);
    region[OFF_SYS_CHUNK_ARRAY..OFF_SYS_CHUNK_ARRAY + sb.sys_chunk_array.len()]
        .copy_from_slice(&sb.sys_chunk_array);

    let sum = crc32c::crc32c(&region[0x20..SUPER_INFO_SIZE]);
    write_le_u32(&mut region, 0, sum);
    region
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Superblock {
        Superblock {
            csum: [0; 32],
            fsid: [7; 16],
            bytenr: sfs_types::SUPER_INFO_OFFSET,
            flags: 0,
            magic: SUPER_MAGIC,
            generation: 12,
            root: 0x40_0000,
            chunk_root: 0x10_0000,
            log_root: 0,
            total_bytes: 1 << 30,
            bytes_used: 1 << 20,
            root_dir_objectid: 6,
            num_devices: 1,
            sectorsize: 4096,
            nodesize: 4096,
            stripesize: 4096,
            compat_flags: 0,
            compat_ro_flags: 0,
            incompat_flags: 0,
            csum_type: CSUM_TYPE_CRC32C,
            root_level: 0,
            chunk_root_level: 0,
            cache_generation: 12,
            label: "salvage-test".to_owned(),
            sys_chunk_array: Vec::new(),
        }
    }

    #[test]
    fn encode_parse_roundtrip() {
        let sb = sample();
        let region = encode_superblock(&sb);
        Superblock::verify_csum(&region).expect("csum valid");
        let parsed = Superblock::parse_region(&region).expect("parse");
        assert_eq!(parsed.generation, 12);
        assert_eq!(parsed.root, 0x40_0000);
        assert_eq!(parsed.label, "salvage-test");
        assert_eq!(parsed.cache_generation, 12);
        assert_eq!(parsed.nodesize, 4096);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut region = encode_superblock(&sample());
        region[OFF_MAGIC] ^= 0xFF;
        assert!(matches!(
            Superblock::parse_region(&region),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn corrupt_region_fails_csum() {
        let mut region = encode_superblock(&sample());
        region[0x90] ^= 0x01;
        assert!(Superblock::verify_csum(&region).is_err());
    }

    #[test]
    fn oversized_sys_chunk_array_rejected() {
        let mut region = encode_superblock(&sample());
        write_le_u32(&mut region, OFF_SYS_CHUNK_ARRAY_SIZE, 4096);
        assert!(Superblock::parse_region(&region).is_err());
    }
}
