#![forbid(unsafe_code)]
//! Logical-to-physical address translation.
//!
//! Btrfs metadata and data live in a virtualized logical byte space; chunks
//! map logical ranges onto (device, physical offset). The table is filled in
//! two phases at open time — the superblock's embedded system chunk array
//! first, then a walk of the chunk tree it makes reachable — and is
//! read-only afterwards.
//!
//! Only the single and DUP chunk profiles are mapped (first stripe wins);
//! striped and parity profiles are skipped without error.

use brfs_btree::{NodeEntries, NodeReader};
use brfs_error::{BrfsError, Result};
use brfs_ondisk::{ChunkItem, DISK_KEY_SIZE, Key};
use brfs_types::{
    BLOCK_GROUP_DUP, BLOCK_GROUP_PROFILE_MASK, FIRST_CHUNK_TREE_OBJECTID, ITEM_CHUNK_ITEM,
};
use parking_lot::RwLock;
use std::collections::HashSet;
use tracing::{debug, trace, warn};

/// Smallest system-chunk-array entry worth parsing: key(17) + chunk header
/// + one stripe. The array may be zero-padded past its last entry.
const MIN_SYS_CHUNK_ENTRY: usize = 99;

/// One logical range mapped to a single physical location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMapping {
    pub logical_start: u64,
    pub logical_length: u64,
    pub physical_start: u64,
    pub device_id: u64,
}

impl ChunkMapping {
    #[must_use]
    pub fn contains(&self, logical: u64) -> bool {
        logical >= self.logical_start
            && logical - self.logical_start < self.logical_length
    }

    #[must_use]
    fn map(&self, logical: u64) -> Option<PhysicalAddr> {
        if !self.contains(logical) {
            return None;
        }
        Some(PhysicalAddr {
            device_id: self.device_id,
            offset: self.physical_start + (logical - self.logical_start),
        })
    }
}

/// Result of a translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalAddr {
    pub device_id: u64,
    pub offset: u64,
}

/// Sorted chunk mapping table.
///
/// Writers only exist during open; afterwards every access is a read.
/// Overlapping ranges are the caller's responsibility to avoid.
#[derive(Debug, Default)]
pub struct ChunkTable {
    mappings: RwLock<Vec<ChunkMapping>>,
}

impl ChunkTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a mapping, keeping the table sorted by `logical_start`.
    pub fn add(&self, mapping: ChunkMapping) {
        let mut mappings = self.mappings.write();
        let pos = mappings.partition_point(|m| m.logical_start < mapping.logical_start);
        mappings.insert(pos, mapping);
        trace!(
            logical_start = mapping.logical_start,
            length = mapping.logical_length,
            physical_start = mapping.physical_start,
            device = mapping.device_id,
            "chunk_mapping_added"
        );
    }

    /// Translate a logical address to its physical location.
    pub fn translate(&self, logical: u64) -> Result<PhysicalAddr> {
        let mappings = self.mappings.read();
        // Greatest entry with logical_start <= logical, then containment.
        let idx = mappings.partition_point(|m| m.logical_start <= logical);
        idx.checked_sub(1)
            .and_then(|i| mappings[i].map(logical))
            .ok_or(BrfsError::ChunkNotFound { logical })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mappings.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.read().is_empty()
    }
}

fn profile_is_supported(chunk_type: u64) -> bool {
    let profile = chunk_type & BLOCK_GROUP_PROFILE_MASK;
    profile == 0 || profile == BLOCK_GROUP_DUP
}

fn mapping_from_chunk(logical_start: u64, chunk: &ChunkItem) -> Result<ChunkMapping> {
    let stripe = chunk
        .stripes
        .first()
        .ok_or(BrfsError::InvalidChunkMapping("chunk has no stripes"))?;
    Ok(ChunkMapping {
        logical_start,
        logical_length: chunk.length,
        physical_start: stripe.offset,
        device_id: stripe.devid,
    })
}

/// Parse the superblock's embedded system chunk array into `table`.
///
/// The declared array size is authoritative: `data` must already be sliced
/// to it. Parsing stops cleanly once the remaining bytes cannot hold a
/// minimum-sized entry. Returns the number of mappings recorded.
pub fn load_sys_chunk_array(table: &ChunkTable, data: &[u8]) -> Result<usize> {
    if data.is_empty() {
        warn!("system chunk array is empty");
        return Ok(0);
    }

    let mut recorded = 0_usize;
    let mut offset = 0_usize;
    while offset + MIN_SYS_CHUNK_ENTRY <= data.len() {
        let key = Key::parse_at(data, offset)?;
        if key.objectid != FIRST_CHUNK_TREE_OBJECTID || key.item_type != ITEM_CHUNK_ITEM {
            return Err(BrfsError::InvalidChunkMapping(
                "system chunk array entry has unexpected key",
            ));
        }
        offset += DISK_KEY_SIZE;

        // Bounds failures here mean the stripe table overruns the declared
        // array size, which is fatal for the bootstrap.
        let chunk = ChunkItem::parse(&data[offset..])?;
        if profile_is_supported(chunk.chunk_type) {
            table.add(mapping_from_chunk(key.offset, &chunk)?);
            recorded += 1;
        } else {
            debug!(
                logical_start = key.offset,
                chunk_type = chunk.chunk_type,
                "skipping unsupported RAID profile in system chunk array"
            );
        }
        offset += chunk.byte_len();
    }

    Ok(recorded)
}

/// Walks the chunk tree and registers every supported chunk item.
pub struct ChunkTreeLoader<'a> {
    table: &'a ChunkTable,
    reader: &'a dyn NodeReader,
    node_size: u32,
}

impl<'a> ChunkTreeLoader<'a> {
    #[must_use]
    pub fn new(table: &'a ChunkTable, reader: &'a dyn NodeReader, node_size: u32) -> Self {
        Self {
            table,
            reader,
            node_size,
        }
    }

    /// Load all chunks reachable from `chunk_root`.
    ///
    /// Node read failures propagate; a single chunk item that fails to
    /// parse is logged and skipped so unsupported RAID shapes don't abort
    /// the open.
    pub fn load(&self, chunk_root: u64) -> Result<()> {
        let mut stack = vec![chunk_root];
        let mut visited = HashSet::new();

        while let Some(addr) = stack.pop() {
            if !visited.insert(addr) {
                return Err(BrfsError::InvalidChunkMapping(
                    "cycle in chunk tree pointers",
                ));
            }

            let node = self.reader.read_node(addr, self.node_size)?;
            match &node.entries {
                NodeEntries::Leaf(items) => {
                    for item in items {
                        if item.key.objectid != FIRST_CHUNK_TREE_OBJECTID
                            || item.key.item_type != ITEM_CHUNK_ITEM
                        {
                            continue;
                        }
                        match self.register(item.key.offset, &item.data) {
                            Ok(()) => {}
                            Err(err) => {
                                warn!(
                                    logical_start = item.key.offset,
                                    error = %err,
                                    "failed to parse chunk item, skipping"
                                );
                            }
                        }
                    }
                }
                NodeEntries::Internal(ptrs) => {
                    stack.extend(ptrs.iter().map(|ptr| ptr.blockptr));
                }
            }
        }

        Ok(())
    }

    fn register(&self, logical_start: u64, data: &[u8]) -> Result<()> {
        let chunk = ChunkItem::parse(data)?;
        if !profile_is_supported(chunk.chunk_type) {
            debug!(
                logical_start,
                chunk_type = chunk.chunk_type,
                "skipping unsupported RAID profile in chunk tree"
            );
            return Ok(());
        }
        self.table.add(mapping_from_chunk(logical_start, &chunk)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brfs_btree::Node;
    use brfs_harness::{chunk_item_bytes, internal_block, leaf_block, sys_chunk_entry};
    use brfs_types::{BLOCK_GROUP_RAID1, BLOCK_GROUP_SYSTEM};
    use std::collections::HashMap;

    const NODE_SIZE: u32 = 4096;

    fn mapping(logical: u64, len: u64, physical: u64) -> ChunkMapping {
        ChunkMapping {
            logical_start: logical,
            logical_length: len,
            physical_start: physical,
            device_id: 1,
        }
    }

    #[test]
    fn translate_offsets_within_mapping() {
        let table = ChunkTable::new();
        table.add(mapping(0x100_0000, 0x80_0000, 0x20_0000));

        // Every logical inside the range shifts by the same delta.
        for delta in [0_u64, 1, 0x1000, 0x7F_FFFF] {
            let addr = table.translate(0x100_0000 + delta).expect("translate");
            assert_eq!(addr.device_id, 1);
            assert_eq!(addr.offset, 0x20_0000 + delta);
        }
    }

    #[test]
    fn translate_misses_outside_every_range() {
        let table = ChunkTable::new();
        table.add(mapping(0x100_0000, 0x80_0000, 0x20_0000));

        for logical in [0_u64, 0xFF_FFFF, 0x180_0000, u64::MAX] {
            assert!(matches!(
                table.translate(logical),
                Err(BrfsError::ChunkNotFound { .. })
            ));
        }
        assert!(matches!(
            ChunkTable::new().translate(0x1000),
            Err(BrfsError::ChunkNotFound { logical: 0x1000 })
        ));
    }

    #[test]
    fn table_stays_sorted_under_unordered_adds() {
        let table = ChunkTable::new();
        table.add(mapping(0x300_0000, 0x10_0000, 0x30_0000));
        table.add(mapping(0x100_0000, 0x10_0000, 0x10_0000));
        table.add(mapping(0x200_0000, 0x10_0000, 0x20_0000));
        assert_eq!(table.len(), 3);

        assert_eq!(
            table.translate(0x100_0000).expect("first").offset,
            0x10_0000
        );
        assert_eq!(
            table.translate(0x200_0001).expect("middle").offset,
            0x20_0001
        );
        assert_eq!(
            table.translate(0x300_FFFF).expect("last").offset,
            0x30_FFFF
        );
    }

    #[test]
    fn bootstrap_records_single_profile_chunks() {
        let table = ChunkTable::new();
        // A lone single-stripe entry is 97 bytes, two short of the
        // conservative minimum; the trailing padding keeps it parseable.
        let mut array = sys_chunk_entry(
            0x40_0000,
            &chunk_item_bytes(0x40_0000, BLOCK_GROUP_SYSTEM, &[(1, 0x1_0000)]),
        );
        array.extend_from_slice(&[0_u8; 32]);
        let recorded = load_sys_chunk_array(&table, &array).expect("bootstrap");
        assert_eq!(recorded, 1);
        assert_eq!(
            table.translate(0x40_0000).expect("translate").offset,
            0x1_0000
        );
    }

    #[test]
    fn bootstrap_skips_unsupported_raid_and_keeps_going() {
        let table = ChunkTable::new();
        let mut array = sys_chunk_entry(
            0x40_0000,
            &chunk_item_bytes(
                0x40_0000,
                BLOCK_GROUP_SYSTEM | BLOCK_GROUP_RAID1,
                &[(1, 0x1_0000), (2, 0x2_0000)],
            ),
        );
        array.extend(sys_chunk_entry(
            0x80_0000,
            &chunk_item_bytes(
                0x40_0000,
                BLOCK_GROUP_SYSTEM | BLOCK_GROUP_DUP,
                &[(1, 0x3_0000), (1, 0x5_0000)],
            ),
        ));

        let recorded = load_sys_chunk_array(&table, &array).expect("bootstrap");
        assert_eq!(recorded, 1);
        assert!(table.translate(0x40_0000).is_err());
        assert_eq!(
            table.translate(0x80_0000).expect("translate").offset,
            0x3_0000
        );
    }

    #[test]
    fn bootstrap_accepts_dup_profile() {
        let table = ChunkTable::new();
        let array = sys_chunk_entry(
            0x40_0000,
            &chunk_item_bytes(
                0x40_0000,
                BLOCK_GROUP_SYSTEM | BLOCK_GROUP_DUP,
                &[(1, 0x1_0000), (1, 0x5_0000)],
            ),
        );
        assert_eq!(load_sys_chunk_array(&table, &array).expect("bootstrap"), 1);
        // First stripe wins for DUP.
        assert_eq!(
            table.translate(0x40_0000).expect("translate").offset,
            0x1_0000
        );
    }

    #[test]
    fn bootstrap_rejects_foreign_key() {
        let table = ChunkTable::new();
        let mut array = sys_chunk_entry(
            0x40_0000,
            &chunk_item_bytes(
                0x40_0000,
                BLOCK_GROUP_SYSTEM | BLOCK_GROUP_DUP,
                &[(1, 0x1_0000), (1, 0x5_0000)],
            ),
        );
        array[8] = 1; // key type INODE_ITEM instead of CHUNK_ITEM
        assert!(matches!(
            load_sys_chunk_array(&table, &array),
            Err(BrfsError::InvalidChunkMapping(_))
        ));
    }

    #[test]
    fn bootstrap_rejects_stripe_overrun() {
        let table = ChunkTable::new();
        let mut array = sys_chunk_entry(
            0x40_0000,
            &chunk_item_bytes(
                0x40_0000,
                BLOCK_GROUP_SYSTEM | BLOCK_GROUP_DUP,
                &[(1, 0x1_0000), (1, 0x5_0000)],
            ),
        );
        // Claim five stripes but provide two.
        array[17 + 44..17 + 46].copy_from_slice(&5_u16.to_le_bytes());
        assert!(matches!(
            load_sys_chunk_array(&table, &array),
            Err(BrfsError::Parse(_))
        ));
    }

    #[test]
    fn bootstrap_stops_on_trailing_padding() {
        let table = ChunkTable::new();
        let mut array = sys_chunk_entry(
            0x40_0000,
            &chunk_item_bytes(
                0x40_0000,
                BLOCK_GROUP_SYSTEM | BLOCK_GROUP_DUP,
                &[(1, 0x1_0000), (1, 0x5_0000)],
            ),
        );
        array.extend_from_slice(&[0_u8; 98]); // below the minimum entry size
        let recorded = load_sys_chunk_array(&table, &array).expect("bootstrap");
        assert_eq!(recorded, 1);
    }

    #[test]
    fn bootstrap_empty_array_is_ok() {
        let table = ChunkTable::new();
        assert_eq!(load_sys_chunk_array(&table, &[]).expect("bootstrap"), 0);
    }

    struct MapReader {
        blocks: HashMap<u64, Vec<u8>>,
    }

    impl NodeReader for MapReader {
        fn read_node(&self, logical: u64, node_size: u32) -> Result<Node> {
            let block = self
                .blocks
                .get(&logical)
                .ok_or(BrfsError::ChunkNotFound { logical })?;
            Node::parse(block, node_size, logical)
        }
    }

    #[test]
    fn loader_walks_internal_nodes_and_skips_raid_items() {
        let chunk_owner = CHUNK_TREE_OWNER;
        let left = leaf_block(
            NODE_SIZE,
            0x2000,
            chunk_owner,
            &[
                (
                    Key::new(256, 228, 0x100_0000),
                    chunk_item_bytes(0x10_0000, 1, &[(1, 0x50_0000)]),
                ),
                // dev item row in the chunk tree: ignored by key filter
                (Key::new(500, 216, 1), vec![0_u8; 4]),
            ],
        );
        let right = leaf_block(
            NODE_SIZE,
            0x3000,
            chunk_owner,
            &[
                (
                    Key::new(256, 228, 0x200_0000),
                    chunk_item_bytes(0x10_0000, 1 | BLOCK_GROUP_RAID1, &[(1, 0), (2, 0)]),
                ),
                (
                    Key::new(256, 228, 0x300_0000),
                    chunk_item_bytes(0x10_0000, 1, &[(1, 0x70_0000)]),
                ),
            ],
        );
        let root = internal_block(
            NODE_SIZE,
            0x1000,
            chunk_owner,
            1,
            &[
                (Key::new(256, 228, 0x100_0000), 0x2000),
                (Key::new(256, 228, 0x200_0000), 0x3000),
            ],
        );
        let reader = MapReader {
            blocks: HashMap::from([(0x1000, root), (0x2000, left), (0x3000, right)]),
        };

        let table = ChunkTable::new();
        ChunkTreeLoader::new(&table, &reader, NODE_SIZE)
            .load(0x1000)
            .expect("load");

        assert_eq!(table.len(), 2);
        assert_eq!(
            table.translate(0x100_0000).expect("left chunk").offset,
            0x50_0000
        );
        assert!(table.translate(0x200_0000).is_err()); // RAID1 skipped
        assert_eq!(
            table.translate(0x300_0000).expect("right chunk").offset,
            0x70_0000
        );
    }

    #[test]
    fn loader_propagates_unreadable_nodes() {
        let root = internal_block(
            NODE_SIZE,
            0x1000,
            CHUNK_TREE_OWNER,
            1,
            &[(Key::new(256, 228, 0), 0x9000)], // child missing
        );
        let reader = MapReader {
            blocks: HashMap::from([(0x1000, root)]),
        };
        let table = ChunkTable::new();
        assert!(matches!(
            ChunkTreeLoader::new(&table, &reader, NODE_SIZE).load(0x1000),
            Err(BrfsError::ChunkNotFound { logical: 0x9000 })
        ));
    }

    #[test]
    fn loader_detects_pointer_cycles() {
        let root = internal_block(
            NODE_SIZE,
            0x1000,
            CHUNK_TREE_OWNER,
            1,
            &[(Key::new(256, 228, 0), 0x1000)], // points at itself
        );
        let reader = MapReader {
            blocks: HashMap::from([(0x1000, root)]),
        };
        let table = ChunkTable::new();
        assert!(matches!(
            ChunkTreeLoader::new(&table, &reader, NODE_SIZE).load(0x1000),
            Err(BrfsError::InvalidChunkMapping(_))
        ));
    }

    const CHUNK_TREE_OWNER: u64 = 3;
}
