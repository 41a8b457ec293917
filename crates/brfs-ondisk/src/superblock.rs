//! Superblock decoding.
//!
//! The superblock is a fixed 4 KiB record. The primary copy lives at byte
//! 0x10000; mirror selection across the three fixed offsets is the concern
//! of `brfs-fs`, this module only decodes one region.

use brfs_types::{
    BTRFS_MAGIC, ParseError, SUPER_INFO_SIZE, read_fixed, read_le_u16, read_le_u32, read_le_u64,
    trim_nul_padded, u64_to_usize,
};
use serde::{Deserialize, Serialize};

const SUPER_LABEL_OFFSET: usize = 0x12B;
const SUPER_LABEL_LEN: usize = 256;
const DEV_ITEM_OFFSET: usize = 0xC9;
const METADATA_UUID_OFFSET: usize = 0x23B;
/// Byte offset of the embedded system chunk array.
pub const SYS_CHUNK_ARRAY_OFFSET: usize = 0x32B;
/// On-disk capacity of the system chunk array.
pub const SYS_CHUNK_ARRAY_MAX: usize = 2048;

/// The device descriptor embedded in the superblock (`btrfs_dev_item`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevItem {
    pub devid: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub io_align: u32,
    pub io_width: u32,
    pub sector_size: u32,
    pub dev_type: u64,
    pub generation: u64,
    pub start_offset: u64,
    pub dev_group: u32,
    pub seek_speed: u8,
    pub bandwidth: u8,
    pub uuid: [u8; 16],
    pub fsid: [u8; 16],
}

impl DevItem {
    /// Decode a 98-byte `btrfs_dev_item` starting at `offset`.
    fn parse_at(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            devid: read_le_u64(data, offset)?,
            total_bytes: read_le_u64(data, offset + 8)?,
            bytes_used: read_le_u64(data, offset + 16)?,
            io_align: read_le_u32(data, offset + 24)?,
            io_width: read_le_u32(data, offset + 28)?,
            sector_size: read_le_u32(data, offset + 32)?,
            dev_type: read_le_u64(data, offset + 36)?,
            generation: read_le_u64(data, offset + 44)?,
            start_offset: read_le_u64(data, offset + 52)?,
            dev_group: read_le_u32(data, offset + 60)?,
            seek_speed: data[offset + 64],
            bandwidth: data[offset + 65],
            uuid: read_fixed::<16>(data, offset + 66)?,
            fsid: read_fixed::<16>(data, offset + 82)?,
        })
    }
}

/// Decoded superblock fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub csum: [u8; 32],
    pub fsid: [u8; 16],
    /// Physical address this copy was written at.
    pub bytenr: u64,
    pub flags: u64,
    pub magic: u64,
    pub generation: u64,
    /// Logical address of the root-of-root-trees.
    pub root: u64,
    /// Logical address of the chunk tree root.
    pub chunk_root: u64,
    pub log_root: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub root_dir_objectid: u64,
    pub num_devices: u64,
    pub sectorsize: u32,
    pub nodesize: u32,
    /// Retired field, equal to `nodesize` on current filesystems.
    pub leafsize: u32,
    pub stripesize: u32,
    pub sys_chunk_array_size: u32,
    pub chunk_root_generation: u64,
    pub compat_flags: u64,
    pub compat_ro_flags: u64,
    pub incompat_flags: u64,
    pub csum_type: u16,
    pub root_level: u8,
    pub chunk_root_level: u8,
    pub log_root_level: u8,
    pub dev_item: DevItem,
    pub label: String,
    pub metadata_uuid: [u8; 16],
    pub sys_chunk_array: Vec<u8>,
}

impl Superblock {
    /// Decode a 4 KiB superblock region.
    ///
    /// Validates the magic, that sectorsize and nodesize are non-zero powers
    /// of two within sane bounds, and that the declared system chunk array
    /// fits its on-disk slot.
    pub fn parse_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < SUPER_INFO_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPER_INFO_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u64(region, 0x40)?;
        if magic != BTRFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: BTRFS_MAGIC,
                actual: magic,
            });
        }

        let sectorsize = read_le_u32(region, 0x90)?;
        let nodesize = read_le_u32(region, 0x94)?;
        let leafsize = read_le_u32(region, 0x98)?;
        let stripesize = read_le_u32(region, 0x9C)?;

        if sectorsize == 0 || !sectorsize.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "sectorsize",
                reason: "must be non-zero power of two",
            });
        }
        if nodesize == 0 || !nodesize.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "nodesize",
                reason: "must be non-zero power of two",
            });
        }
        if stripesize != 0 && !stripesize.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "stripesize",
                reason: "must be zero or power of two",
            });
        }
        if sectorsize > 256 * 1024 {
            return Err(ParseError::InvalidField {
                field: "sectorsize",
                reason: "exceeds 256K upper bound",
            });
        }
        if nodesize > 256 * 1024 {
            return Err(ParseError::InvalidField {
                field: "nodesize",
                reason: "exceeds 256K upper bound",
            });
        }

        let sys_chunk_array_size = read_le_u32(region, 0xA0)?;
        let sys_array_len = u64_to_usize(u64::from(sys_chunk_array_size), "sys_chunk_array_size")?;
        if sys_array_len > SYS_CHUNK_ARRAY_MAX {
            return Err(ParseError::InvalidField {
                field: "sys_chunk_array_size",
                reason: "exceeds 2048 byte limit",
            });
        }
        let array_end = SYS_CHUNK_ARRAY_OFFSET + sys_array_len;
        if array_end > region.len() {
            return Err(ParseError::InsufficientData {
                needed: array_end,
                offset: SYS_CHUNK_ARRAY_OFFSET,
                actual: region.len(),
            });
        }

        Ok(Self {
            csum: read_fixed::<32>(region, 0x00)?,
            fsid: read_fixed::<16>(region, 0x20)?,
            bytenr: read_le_u64(region, 0x30)?,
            flags: read_le_u64(region, 0x38)?,
            magic,
            generation: read_le_u64(region, 0x48)?,
            root: read_le_u64(region, 0x50)?,
            chunk_root: read_le_u64(region, 0x58)?,
            log_root: read_le_u64(region, 0x60)?,
            total_bytes: read_le_u64(region, 0x70)?,
            bytes_used: read_le_u64(region, 0x78)?,
            root_dir_objectid: read_le_u64(region, 0x80)?,
            num_devices: read_le_u64(region, 0x88)?,
            sectorsize,
            nodesize,
            leafsize,
            stripesize,
            sys_chunk_array_size,
            chunk_root_generation: read_le_u64(region, 0xA4)?,
            compat_flags: read_le_u64(region, 0xAC)?,
            compat_ro_flags: read_le_u64(region, 0xB4)?,
            incompat_flags: read_le_u64(region, 0xBC)?,
            csum_type: read_le_u16(region, 0xC4)?,
            root_level: region[0xC6],
            chunk_root_level: region[0xC7],
            log_root_level: region[0xC8],
            dev_item: DevItem::parse_at(region, DEV_ITEM_OFFSET)?,
            label: trim_nul_padded(&read_fixed::<SUPER_LABEL_LEN>(
                region,
                SUPER_LABEL_OFFSET,
            )?),
            metadata_uuid: read_fixed::<16>(region, METADATA_UUID_OFFSET)?,
            sys_chunk_array: region[SYS_CHUNK_ARRAY_OFFSET..array_end].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn make_superblock_region() -> Vec<u8> {
        let mut sb = vec![0_u8; SUPER_INFO_SIZE];
        sb[0x40..0x48].copy_from_slice(&BTRFS_MAGIC.to_le_bytes());
        sb[0x30..0x38].copy_from_slice(&0x1_0000_u64.to_le_bytes());
        sb[0x48..0x50].copy_from_slice(&9_u64.to_le_bytes()); // generation
        sb[0x50..0x58].copy_from_slice(&0x40_0000_u64.to_le_bytes()); // root
        sb[0x58..0x60].copy_from_slice(&0x41_0000_u64.to_le_bytes()); // chunk_root
        sb[0x70..0x78].copy_from_slice(&(128_u64 << 20).to_le_bytes()); // total_bytes
        sb[0x78..0x80].copy_from_slice(&123_456_u64.to_le_bytes());
        sb[0x80..0x88].copy_from_slice(&6_u64.to_le_bytes());
        sb[0x88..0x90].copy_from_slice(&1_u64.to_le_bytes());
        sb[0x90..0x94].copy_from_slice(&4096_u32.to_le_bytes());
        sb[0x94..0x98].copy_from_slice(&16384_u32.to_le_bytes());
        sb[0x98..0x9C].copy_from_slice(&16384_u32.to_le_bytes());
        sb[0x9C..0xA0].copy_from_slice(&65536_u32.to_le_bytes());
        sb[0xA4..0xAC].copy_from_slice(&9_u64.to_le_bytes());
        sb[0xC9..0xD1].copy_from_slice(&1_u64.to_le_bytes()); // dev_item.devid
        sb[SUPER_LABEL_OFFSET..SUPER_LABEL_OFFSET + 9].copy_from_slice(b"TestBtrfs");
        sb
    }

    #[test]
    fn parse_smoke() {
        let parsed = Superblock::parse_region(&make_superblock_region()).expect("parse");
        assert_eq!(parsed.magic, BTRFS_MAGIC);
        assert_eq!(parsed.generation, 9);
        assert_eq!(parsed.root, 0x40_0000);
        assert_eq!(parsed.chunk_root, 0x41_0000);
        assert_eq!(parsed.sectorsize, 4096);
        assert_eq!(parsed.nodesize, 16384);
        assert_eq!(parsed.label, "TestBtrfs");
        assert_eq!(parsed.dev_item.devid, 1);
    }

    #[test]
    fn magic_must_match_exactly() {
        let good = make_superblock_region();
        assert!(Superblock::parse_region(&good).is_ok());

        // Any single-byte perturbation of the magic fails.
        for i in 0x40..0x48 {
            let mut bad = good.clone();
            bad[i] ^= 0x01;
            assert!(
                matches!(
                    Superblock::parse_region(&bad),
                    Err(ParseError::InvalidMagic { .. })
                ),
                "perturbed magic byte {i:#x} should fail"
            );
        }
    }

    #[test]
    fn rejects_non_power_of_two_sizes() {
        let mut sb = make_superblock_region();
        sb[0x90..0x94].copy_from_slice(&3000_u32.to_le_bytes());
        assert!(matches!(
            Superblock::parse_region(&sb),
            Err(ParseError::InvalidField {
                field: "sectorsize",
                ..
            })
        ));

        let mut sb = make_superblock_region();
        sb[0x94..0x98].copy_from_slice(&5000_u32.to_le_bytes());
        assert!(matches!(
            Superblock::parse_region(&sb),
            Err(ParseError::InvalidField {
                field: "nodesize",
                ..
            })
        ));
    }

    #[test]
    fn rejects_oversized_sys_chunk_array() {
        let mut sb = make_superblock_region();
        sb[0xA0..0xA4].copy_from_slice(&4096_u32.to_le_bytes());
        assert!(matches!(
            Superblock::parse_region(&sb),
            Err(ParseError::InvalidField {
                field: "sys_chunk_array_size",
                ..
            })
        ));
    }

    #[test]
    fn sys_chunk_array_bytes_are_extracted() {
        let mut sb = make_superblock_region();
        sb[0xA0..0xA4].copy_from_slice(&97_u32.to_le_bytes());
        sb[SYS_CHUNK_ARRAY_OFFSET..SYS_CHUNK_ARRAY_OFFSET + 97].fill(0x5A);
        let parsed = Superblock::parse_region(&sb).expect("parse");
        assert_eq!(parsed.sys_chunk_array.len(), 97);
        assert!(parsed.sys_chunk_array.iter().all(|b| *b == 0x5A));
    }

    #[test]
    fn label_stops_at_first_nul() {
        let mut sb = make_superblock_region();
        let base = SUPER_LABEL_OFFSET;
        sb[base..base + 256].fill(0);
        sb[base..base + 4].copy_from_slice(b"data");
        sb[base + 5] = b'x'; // past the NUL, must not appear
        let parsed = Superblock::parse_region(&sb).expect("parse");
        assert_eq!(parsed.label, "data");
    }

    #[test]
    fn truncated_region_is_rejected() {
        let sb = make_superblock_region();
        assert!(matches!(
            Superblock::parse_region(&sb[..1024]),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn parse_region_never_panics(
            region in proptest::collection::vec(any::<u8>(), 0..=SUPER_INFO_SIZE * 2),
        ) {
            let _ = Superblock::parse_region(&region);
        }
    }
}
