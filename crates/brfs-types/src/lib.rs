#![forbid(unsafe_code)]
//! Shared btrfs on-disk constants, primitive little-endian decoders, and the
//! directory name hash.
//!
//! Everything here is format-level: no I/O, no allocation beyond returned
//! values. The higher crates (`brfs-ondisk`, `brfs-chunk`, `brfs-fs`) build
//! their structured parsers on these helpers.

use thiserror::Error;

/// Byte offset of the primary superblock mirror (64 KiB).
pub const SUPER_INFO_OFFSET: u64 = 0x1_0000;
/// Size of the on-disk superblock record.
pub const SUPER_INFO_SIZE: usize = 4096;
/// Superblock mirror offsets, primary first: 64 KiB, 64 MiB, 256 GiB.
pub const SUPER_MIRROR_OFFSETS: [u64; 3] = [0x1_0000, 0x400_0000, 0x40_0000_0000];
/// `"_BHRfS_M"` as a little-endian u64.
pub const BTRFS_MAGIC: u64 = 0x4D5F_5366_5248_425F;

/// Checksum algorithm ids stored in the superblock `csum_type` field.
pub const CSUM_TYPE_CRC32C: u16 = 0;
pub const CSUM_TYPE_XXHASH64: u16 = 1;
pub const CSUM_TYPE_SHA256: u16 = 2;
pub const CSUM_TYPE_BLAKE2B: u16 = 3;

/// Item type bytes (the `type` component of a tree key).
pub const ITEM_INODE_ITEM: u8 = 1;
pub const ITEM_DIR_ITEM: u8 = 84;
pub const ITEM_DIR_INDEX: u8 = 96;
pub const ITEM_EXTENT_DATA: u8 = 108;
pub const ITEM_ROOT_ITEM: u8 = 132;
pub const ITEM_CHUNK_ITEM: u8 = 228;

/// Well-known tree objectids.
pub const ROOT_TREE_OBJECTID: u64 = 1;
pub const EXTENT_TREE_OBJECTID: u64 = 2;
pub const CHUNK_TREE_OBJECTID: u64 = 3;
pub const DEV_TREE_OBJECTID: u64 = 4;
pub const FS_TREE_OBJECTID: u64 = 5;
/// Objectid carried by every CHUNK_ITEM key in the chunk tree.
pub const FIRST_CHUNK_TREE_OBJECTID: u64 = 256;
/// First objectid available to user inodes; also the root directory inode.
pub const FIRST_FREE_OBJECTID: u64 = 256;

/// Directory entry type values stored in dir items.
pub const FT_UNKNOWN: u8 = 0;
pub const FT_REG_FILE: u8 = 1;
pub const FT_DIR: u8 = 2;
pub const FT_CHRDEV: u8 = 3;
pub const FT_BLKDEV: u8 = 4;
pub const FT_FIFO: u8 = 5;
pub const FT_SOCK: u8 = 6;
pub const FT_SYMLINK: u8 = 7;

/// File extent type values in EXTENT_DATA payloads.
pub const FILE_EXTENT_INLINE: u8 = 0;
pub const FILE_EXTENT_REG: u8 = 1;
pub const FILE_EXTENT_PREALLOC: u8 = 2;

/// Extent compression algorithm ids.
pub const COMPRESS_NONE: u8 = 0;
pub const COMPRESS_ZLIB: u8 = 1;
pub const COMPRESS_LZO: u8 = 2;
pub const COMPRESS_ZSTD: u8 = 3;

/// Block group / chunk type flags.
pub const BLOCK_GROUP_DATA: u64 = 1 << 0;
pub const BLOCK_GROUP_SYSTEM: u64 = 1 << 1;
pub const BLOCK_GROUP_METADATA: u64 = 1 << 2;
pub const BLOCK_GROUP_RAID0: u64 = 1 << 3;
pub const BLOCK_GROUP_RAID1: u64 = 1 << 4;
pub const BLOCK_GROUP_DUP: u64 = 1 << 5;
pub const BLOCK_GROUP_RAID10: u64 = 1 << 6;
pub const BLOCK_GROUP_RAID5: u64 = 1 << 7;
pub const BLOCK_GROUP_RAID6: u64 = 1 << 8;
/// Mask selecting the RAID profile bits (3..=8) of a chunk type.
pub const BLOCK_GROUP_PROFILE_MASK: u64 = 0x1F8;

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

/// Decode a NUL-padded byte array (e.g. the volume label) into a string,
/// stopping at the first NUL.
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

// ── Directory name hash ─────────────────────────────────────────────────────

/// Seed of the btrfs directory name hash: `!1` fed straight into the CRC32C
/// table recurrence, with no final inversion.
pub const NAME_HASH_SEED: u32 = !1_u32;

/// Advance the raw (uninverted) CRC32C state over `data`.
///
/// `crc32c_append` maintains the *inverted* CRC state, so the raw table
/// recurrence stored on disk is recovered by inverting at both boundaries.
#[must_use]
pub fn name_hash_update(state: u32, data: &[u8]) -> u32 {
    !crc32c::crc32c_append(!state, data)
}

/// Hash a directory entry name the way btrfs keys DIR_ITEMs.
///
/// The u64 widening matches the key `offset` field the hash is stored in.
#[must_use]
pub fn name_hash(name: &[u8]) -> u64 {
    u64::from(name_hash_update(NAME_HASH_SEED, name))
}
