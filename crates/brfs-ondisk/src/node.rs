//! Tree node header and item table decoding.
//!
//! A node is a fixed-size block: a 101-byte header followed by either leaf
//! item headers (level 0) or key/child-pointer pairs (level > 0). Leaf item
//! payloads live at `HEADER_SIZE + data_offset` within the same block.

use crate::Key;
use brfs_types::{ParseError, read_fixed, read_le_u32, read_le_u64, u64_to_usize};
use serde::{Deserialize, Serialize};

/// Size of the node header.
pub const HEADER_SIZE: usize = 101;
/// Size of one leaf item header: key(17) + data_offset(4) + data_size(4).
pub const LEAF_ITEM_SIZE: usize = 25;
/// Size of one internal entry: key(17) + blockptr(8) + generation(8).
pub const KEY_PTR_SIZE: usize = 33;
/// Maximum tree level (the kernel enforces 8 levels, 0-7).
pub const MAX_LEVEL: u8 = 7;

/// Decoded node header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHeader {
    pub csum: [u8; 32],
    pub fsid: [u8; 16],
    /// Logical address of this node; checked against the address it was
    /// fetched from.
    pub bytenr: u64,
    pub flags: u64,
    pub chunk_tree_uuid: [u8; 16],
    pub generation: u64,
    /// Objectid of the tree this node belongs to.
    pub owner: u64,
    pub nritems: u32,
    pub level: u8,
}

impl NodeHeader {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: HEADER_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }

        Ok(Self {
            csum: read_fixed::<32>(block, 0x00)?,
            fsid: read_fixed::<16>(block, 0x20)?,
            bytenr: read_le_u64(block, 0x30)?,
            flags: read_le_u64(block, 0x38)?,
            chunk_tree_uuid: read_fixed::<16>(block, 0x40)?,
            generation: read_le_u64(block, 0x50)?,
            owner: read_le_u64(block, 0x58)?,
            nritems: read_le_u32(block, 0x60)?,
            level: block[0x64],
        })
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    /// Validate the header against the block it was parsed from:
    /// `bytenr` matches the fetch address (when given), `level` stays within
    /// the format maximum, and `nritems` fits the block's item capacity.
    pub fn validate(&self, block_size: usize, expected_bytenr: Option<u64>) -> Result<(), ParseError> {
        if let Some(expected) = expected_bytenr
            && self.bytenr != expected
        {
            return Err(ParseError::InvalidField {
                field: "bytenr",
                reason: "header bytenr does not match fetch address",
            });
        }

        if self.level > MAX_LEVEL {
            return Err(ParseError::InvalidField {
                field: "level",
                reason: "exceeds maximum tree depth",
            });
        }

        let entry_size = if self.is_leaf() {
            LEAF_ITEM_SIZE
        } else {
            KEY_PTR_SIZE
        };
        let max_items = block_size.saturating_sub(HEADER_SIZE) / entry_size;
        let nritems = u64_to_usize(u64::from(self.nritems), "nritems")?;
        if nritems > max_items {
            return Err(ParseError::InvalidField {
                field: "nritems",
                reason: "item count exceeds block capacity",
            });
        }

        Ok(())
    }
}

/// One leaf item header. `data_offset` is relative to the end of the node
/// header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemHeader {
    pub key: Key,
    pub data_offset: u32,
    pub data_size: u32,
}

impl ItemHeader {
    /// Byte range of this item's payload within its block.
    pub fn payload_range(&self, block_len: usize) -> Result<std::ops::Range<usize>, ParseError> {
        let off = u64_to_usize(u64::from(self.data_offset), "data_offset")?;
        let size = u64_to_usize(u64::from(self.data_size), "data_size")?;
        let start = HEADER_SIZE
            .checked_add(off)
            .ok_or(ParseError::InvalidField {
                field: "data_offset",
                reason: "overflow",
            })?;
        let end = start.checked_add(size).ok_or(ParseError::InvalidField {
            field: "data_size",
            reason: "overflow",
        })?;
        if end > block_len {
            return Err(ParseError::InvalidField {
                field: "data_offset",
                reason: "item payload extends past block",
            });
        }
        Ok(start..end)
    }
}

/// An internal entry: a key paired with a child block pointer.
///
/// `generation` is decoded for completeness but nothing in the read path
/// consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPtr {
    pub key: Key,
    pub blockptr: u64,
    pub generation: u64,
}

/// Parse a leaf node's item table, bounds-checking each payload range.
pub fn parse_leaf_items(block: &[u8]) -> Result<(NodeHeader, Vec<ItemHeader>), ParseError> {
    let header = NodeHeader::parse(block)?;
    if !header.is_leaf() {
        return Err(ParseError::InvalidField {
            field: "level",
            reason: "expected leaf level 0",
        });
    }
    header.validate(block.len(), None)?;

    let nritems = u64_to_usize(u64::from(header.nritems), "nritems")?;
    let mut items = Vec::with_capacity(nritems);
    for idx in 0..nritems {
        let base = HEADER_SIZE + idx * LEAF_ITEM_SIZE;
        let item = ItemHeader {
            key: Key::parse_at(block, base)?,
            data_offset: read_le_u32(block, base + 17)?,
            data_size: read_le_u32(block, base + 21)?,
        };
        item.payload_range(block.len())?;
        items.push(item);
    }

    Ok((header, items))
}

/// Parse an internal node's key/pointer table.
pub fn parse_internal_items(block: &[u8]) -> Result<(NodeHeader, Vec<KeyPtr>), ParseError> {
    let header = NodeHeader::parse(block)?;
    if header.is_leaf() {
        return Err(ParseError::InvalidField {
            field: "level",
            reason: "expected internal node (level > 0)",
        });
    }
    header.validate(block.len(), None)?;

    let nritems = u64_to_usize(u64::from(header.nritems), "nritems")?;
    let mut ptrs = Vec::with_capacity(nritems);
    for idx in 0..nritems {
        let base = HEADER_SIZE + idx * KEY_PTR_SIZE;
        let key = Key::parse_at(block, base)?;
        let blockptr = read_le_u64(block, base + 17)?;
        let generation = read_le_u64(block, base + 25)?;

        if blockptr == 0 {
            return Err(ParseError::InvalidField {
                field: "blockptr",
                reason: "child block pointer is zero",
            });
        }

        ptrs.push(KeyPtr {
            key,
            blockptr,
            generation,
        });
    }

    Ok((header, ptrs))
}
