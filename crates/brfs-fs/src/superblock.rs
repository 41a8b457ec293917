//! Superblock mirror selection.
//!
//! Btrfs keeps up to three superblock copies at fixed offsets; an image
//! smaller than a mirror offset simply lacks that copy. The newest valid
//! copy (highest generation) wins. Checksum verification is a future
//! capability; selection trusts the magic and basic field sanity.

use brfs_block::ByteDevice;
use brfs_error::{BrfsError, Result};
use brfs_ondisk::Superblock;
use brfs_types::{SUPER_INFO_SIZE, SUPER_MIRROR_OFFSETS};
use tracing::debug;

/// Read the newest valid superblock from the three mirror offsets.
pub fn read_latest(device: &dyn ByteDevice) -> Result<Superblock> {
    let mut latest: Option<Superblock> = None;

    for offset in SUPER_MIRROR_OFFSETS {
        if offset >= device.len_bytes() {
            continue;
        }

        let mut region = vec![0_u8; SUPER_INFO_SIZE];
        if let Err(err) = device.read_exact_at(offset, &mut region) {
            debug!(offset, error = %err, "superblock mirror unreadable");
            continue;
        }

        let candidate = match Superblock::parse_region(&region) {
            Ok(sb) => sb,
            Err(err) => {
                debug!(offset, error = %err, "superblock mirror rejected");
                continue;
            }
        };
        if candidate.total_bytes == 0 {
            debug!(offset, "superblock mirror has zero total_bytes");
            continue;
        }

        if latest
            .as_ref()
            .is_none_or(|best| candidate.generation > best.generation)
        {
            latest = Some(candidate);
        }
    }

    latest.ok_or(BrfsError::NoValidSuperblock)
}
