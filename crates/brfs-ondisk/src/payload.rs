//! Typed leaf payload decoding: chunk, root, inode, dir, and extent items.
//!
//! The schema a payload follows is selected by the `item_type` byte of the
//! item's key; these functions assume the caller already dispatched on it.

use crate::{DISK_KEY_SIZE, Key};
use brfs_types::{
    FILE_EXTENT_INLINE, FILE_EXTENT_PREALLOC, FILE_EXTENT_REG, ParseError, read_fixed,
    read_le_u16, read_le_u32, read_le_u64,
};
use serde::{Deserialize, Serialize};

/// Fixed chunk item prefix before the stripe array.
pub const CHUNK_ITEM_FIXED_SIZE: usize = 48;
/// Size of one on-disk stripe: devid(8) + offset(8) + dev_uuid(16).
pub const STRIPE_SIZE: usize = 32;

/// A single stripe within a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stripe {
    pub devid: u64,
    pub offset: u64,
    pub dev_uuid: [u8; 16],
}

/// Decoded CHUNK_ITEM payload. The logical start of the mapped range lives
/// in the item key's `offset`, not in the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkItem {
    pub length: u64,
    pub owner: u64,
    pub stripe_len: u64,
    pub chunk_type: u64,
    pub io_align: u32,
    pub io_width: u32,
    pub sector_size: u32,
    pub num_stripes: u16,
    pub sub_stripes: u16,
    pub stripes: Vec<Stripe>,
}

impl ChunkItem {
    /// Decode a chunk item (fixed header plus `num_stripes` stripes) from
    /// the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < CHUNK_ITEM_FIXED_SIZE {
            return Err(ParseError::InsufficientData {
                needed: CHUNK_ITEM_FIXED_SIZE,
                offset: 0,
                actual: data.len(),
            });
        }

        let num_stripes = read_le_u16(data, 44)?;
        if num_stripes == 0 {
            return Err(ParseError::InvalidField {
                field: "num_stripes",
                reason: "chunk must have at least one stripe",
            });
        }

        let stripes_count = usize::from(num_stripes);
        let mut stripes = Vec::with_capacity(stripes_count);
        let mut cur = CHUNK_ITEM_FIXED_SIZE;
        for _ in 0..stripes_count {
            if cur + STRIPE_SIZE > data.len() {
                return Err(ParseError::InsufficientData {
                    needed: STRIPE_SIZE,
                    offset: cur,
                    actual: data.len() - cur,
                });
            }
            stripes.push(Stripe {
                devid: read_le_u64(data, cur)?,
                offset: read_le_u64(data, cur + 8)?,
                dev_uuid: read_fixed::<16>(data, cur + 16)?,
            });
            cur += STRIPE_SIZE;
        }

        Ok(Self {
            length: read_le_u64(data, 0)?,
            owner: read_le_u64(data, 8)?,
            stripe_len: read_le_u64(data, 16)?,
            chunk_type: read_le_u64(data, 24)?,
            io_align: read_le_u32(data, 32)?,
            io_width: read_le_u32(data, 36)?,
            sector_size: read_le_u32(data, 40)?,
            num_stripes,
            sub_stripes: read_le_u16(data, 46)?,
            stripes,
        })
    }

    /// Bytes this item occupies on disk.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        CHUNK_ITEM_FIXED_SIZE + usize::from(self.num_stripes) * STRIPE_SIZE
    }
}

/// Parsed subset of a ROOT_ITEM payload: enough to reach the tree it
/// describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootItem {
    /// Logical address of the tree root block.
    pub bytenr: u64,
    /// Level of the root block (`0` for leaf roots).
    pub level: u8,
}

impl RootItem {
    /// `bytenr` lives at offset 176; `level` is the final byte of the item.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < 184 {
            return Err(ParseError::InsufficientData {
                needed: 184,
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
        let level = *data.last().ok_or(ParseError::InsufficientData {
            needed: 1,
            offset: 0,
            actual: data.len(),
        })?;

        Ok(Self { bytenr, level })
    }
}

/// Parsed subset of an INODE_ITEM payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeItem {
    pub size: u64,
    pub mode: u32,
}

impl InodeItem {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < 160 {
            return Err(ParseError::InsufficientData {
                needed: 160,
                offset: 0,
                actual: data.len(),
            });
        }

        Ok(Self {
            size: read_le_u64(data, 16)?,
            mode: read_le_u32(data, 52)?,
        })
    }
}

/// One decoded directory entry from a DIR_ITEM or DIR_INDEX payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirItem {
    /// Key of the entry target; `location.objectid` is the target inode.
    pub location: Key,
    pub transid: u64,
    pub file_type: u8,
    pub name: Vec<u8>,
}

/// Parse the entries packed into a DIR_ITEM or DIR_INDEX payload.
///
/// DIR_INDEX payloads hold exactly one entry; DIR_ITEM payloads may pack
/// several when names collide on the hash.
pub fn parse_dir_items(data: &[u8]) -> Result<Vec<DirItem>, ParseError> {
    // location key(17) + transid(8) + data_len(2) + name_len(2) + type(1)
    const ENTRY_HEADER: usize = 30;

    let mut out = Vec::new();
    let mut cur = 0_usize;
    while cur < data.len() {
        if cur + ENTRY_HEADER > data.len() {
            return Err(ParseError::InsufficientData {
                needed: ENTRY_HEADER,
                offset: cur,
                actual: data.len() - cur,
            });
        }

        let location = Key::parse_at(data, cur)?;
        let transid = read_le_u64(data, cur + DISK_KEY_SIZE)?;
        let data_len = usize::from(read_le_u16(data, cur + 25)?);
        let name_len = usize::from(read_le_u16(data, cur + 27)?);
        let file_type = data[cur + 29];

        let name_start = cur + ENTRY_HEADER;
        let name_end = name_start
            .checked_add(name_len)
            .ok_or(ParseError::InvalidField {
                field: "dir_item.name_len",
                reason: "overflow",
            })?;
        let entry_end = name_end
            .checked_add(data_len)
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
        });

        cur = entry_end;
    }

    Ok(out)
}

/// Decoded EXTENT_DATA payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtentData {
    /// File contents stored inline after the 21-byte prelude.
    Inline { compression: u8, data: Vec<u8> },
    /// Regular or preallocated extent referencing on-disk bytes.
    ///
    /// `disk_bytenr` is a logical address; zero marks a hole.
    Regular {
        extent_type: u8,
        compression: u8,
        disk_bytenr: u64,
        disk_num_bytes: u64,
        extent_offset: u64,
        num_bytes: u64,
    },
}

impl ExtentData {
    /// Fixed prelude: generation(8) + ram_bytes(8) + compression(1) +
    /// encryption(1) + other_encoding(2) + type(1).
    pub const FIXED_SIZE: usize = 21;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < Self::FIXED_SIZE {
            return Err(ParseError::InsufficientData {
                needed: Self::FIXED_SIZE,
                offset: 0,
                actual: data.len(),
            });
        }

        let compression = data[16];
        let extent_type = data[20];
        match extent_type {
            FILE_EXTENT_INLINE => Ok(Self::Inline {
                compression,
                data: data[Self::FIXED_SIZE..].to_vec(),
            }),
            FILE_EXTENT_REG | FILE_EXTENT_PREALLOC => {
                if data.len() < Self::FIXED_SIZE + 32 {
                    return Err(ParseError::InsufficientData {
                        needed: Self::FIXED_SIZE + 32,
                        offset: 0,
                        actual: data.len(),
                    });
                }
                Ok(Self::Regular {
                    extent_type,
                    compression,
                    disk_bytenr: read_le_u64(data, 21)?,
                    disk_num_bytes: read_le_u64(data, 29)?,
                    extent_offset: read_le_u64(data, 37)?,
                    num_bytes: read_le_u64(data, 45)?,
                })
            }
            _ => Err(ParseError::InvalidField {
                field: "extent_data.type",
                reason: "unsupported extent type",
            }),
        }
    }
}
