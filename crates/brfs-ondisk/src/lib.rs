#![forbid(unsafe_code)]
//! Pure decoders for the btrfs on-disk format.
//!
//! Every function here is bytes in, structured value out: no I/O, no
//! address translation. Offsets are little-endian and fixed by the format;
//! short input yields [`ParseError::InsufficientData`] rather than a panic.

mod node;
mod payload;
mod superblock;

pub use node::{
    HEADER_SIZE, ItemHeader, KEY_PTR_SIZE, KeyPtr, LEAF_ITEM_SIZE, MAX_LEVEL, NodeHeader,
    parse_internal_items, parse_leaf_items,
};
pub use payload::{
    CHUNK_ITEM_FIXED_SIZE, ChunkItem, DirItem, ExtentData, InodeItem, RootItem, STRIPE_SIZE,
    Stripe, parse_dir_items,
};
pub use superblock::{DevItem, SYS_CHUNK_ARRAY_MAX, SYS_CHUNK_ARRAY_OFFSET, Superblock};

use brfs_types::{ParseError, read_le_u64};
use serde::{Deserialize, Serialize};

/// Size of a btrfs disk key: objectid u64 + type u8 + offset u64.
pub const DISK_KEY_SIZE: usize = 17;

/// A tree key.
///
/// Ordering is lexicographic over `(objectid, item_type, offset)`, which the
/// derive provides from the field declaration order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Key {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
}

impl Key {
    #[must_use]
    pub fn new(objectid: u64, item_type: u8, offset: u64) -> Self {
        Self {
            objectid,
            item_type,
            offset,
        }
    }

    /// Decode a 17-byte disk key starting at `offset`.
    pub fn parse_at(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        let end = offset
            .checked_add(DISK_KEY_SIZE)
            .ok_or(ParseError::InvalidField {
                field: "disk_key",
                reason: "offset overflow",
            })?;
        if end > data.len() {
            return Err(ParseError::InsufficientData {
                needed: DISK_KEY_SIZE,
                offset,
                actual: data.len().saturating_sub(offset),
            });
        }
        Ok(Self {
            objectid: read_le_u64(data, offset)?,
            item_type: data[offset + 8],
            offset: read_le_u64(data, offset + 9)?,
        })
    }
}
