#![forbid(unsafe_code)]
//! B-tree node model and key search.
//!
//! Nodes reference children by logical address only, so a search path is a
//! plain vector of owned nodes plus slot indices; nothing here holds device
//! or cache state. Node fetching goes through the [`NodeReader`] seam,
//! which the filesystem façade implements with address translation and
//! caching behind it.

use brfs_error::{BrfsError, Result};
use brfs_ondisk::{Key, NodeHeader, parse_internal_items, parse_leaf_items};
pub use brfs_ondisk::KeyPtr;
use brfs_types::ParseError;
use tracing::trace;

/// A leaf item: key plus an owned copy of its payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: Key,
    pub data: Vec<u8>,
}

/// Entries of a node, by level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEntries {
    Leaf(Vec<Item>),
    Internal(Vec<KeyPtr>),
}

/// A fully decoded tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub header: NodeHeader,
    pub entries: NodeEntries,
}

impl Node {
    /// Decode a node from a buffer of exactly `node_size` bytes fetched at
    /// logical address `bytenr`.
    pub fn parse(block: &[u8], node_size: u32, bytenr: u64) -> Result<Self> {
        let expected = usize::try_from(node_size)
            .map_err(|_| ParseError::IntegerConversion { field: "node_size" })?;
        if block.len() != expected {
            return Err(ParseError::InsufficientData {
                needed: expected,
                offset: 0,
                actual: block.len(),
            }
            .into());
        }

        let header = NodeHeader::parse(block)?;
        header.validate(block.len(), Some(bytenr))?;

        let entries = if header.is_leaf() {
            let (_, item_headers) = parse_leaf_items(block)?;
            let mut items = Vec::with_capacity(item_headers.len());
            for item in item_headers {
                let range = item.payload_range(block.len())?;
                items.push(Item {
                    key: item.key,
                    data: block[range].to_vec(),
                });
            }
            NodeEntries::Leaf(items)
        } else {
            let (_, ptrs) = parse_internal_items(block)?;
            NodeEntries::Internal(ptrs)
        };

        Ok(Self { header, entries })
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.header.is_leaf()
    }
}

/// Produces decoded nodes for logical addresses.
pub trait NodeReader {
    fn read_node(&self, logical: u64, node_size: u32) -> Result<Node>;
}

/// Smallest leaf index with `key >= target`; exact iff that index holds an
/// equal key. On an empty leaf, `(0, false)`.
#[must_use]
pub fn binary_search_leaf(items: &[Item], target: &Key) -> (usize, bool) {
    let idx = items.partition_point(|item| item.key < *target);
    let exact = items.get(idx).is_some_and(|item| item.key == *target);
    (idx, exact)
}

/// Internal-node search. Not exact: smallest index with `key > target`
/// (callers step back one slot to descend into the last child whose first
/// key is `<= target`). Exact: the index of the matching key itself.
#[must_use]
pub fn binary_search_internal(ptrs: &[KeyPtr], target: &Key) -> (usize, bool) {
    let idx = ptrs.partition_point(|ptr| ptr.key <= *target);
    if idx > 0 && ptrs[idx - 1].key == *target {
        (idx - 1, true)
    } else {
        (idx, false)
    }
}

/// A root-to-leaf descent: one `(node, slot)` pair per level.
#[derive(Debug, Clone)]
pub struct Path {
    nodes: Vec<Node>,
    slots: Vec<usize>,
}

impl Path {
    /// The item at the final leaf slot.
    pub fn item(&self) -> Result<&Item> {
        let (Some(node), Some(&slot)) = (self.nodes.last(), self.slots.last()) else {
            return Err(BrfsError::EmptyPath);
        };
        let NodeEntries::Leaf(items) = &node.entries else {
            return Err(BrfsError::NotLeaf);
        };
        items.get(slot).ok_or(BrfsError::SlotOutOfRange {
            slot,
            nritems: items.len(),
        })
    }

    /// The key at the final leaf slot — an exact match or the next key at
    /// or after the search target.
    pub fn key(&self) -> Result<Key> {
        Ok(self.item()?.key)
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn leaf_slot(&self) -> Option<usize> {
        self.slots.last().copied()
    }
}

/// Stateless descent over trees reachable through a [`NodeReader`].
pub struct Searcher<'a> {
    reader: &'a dyn NodeReader,
    node_size: u32,
}

impl<'a> Searcher<'a> {
    #[must_use]
    pub fn new(reader: &'a dyn NodeReader, node_size: u32) -> Self {
        Self { reader, node_size }
    }

    /// Descend from `root_logical` to the leaf slot for `target`.
    ///
    /// The returned path's leaf slot holds the smallest key `>= target`
    /// (possibly one past the last item); callers requiring an exact match
    /// compare the slot key themselves.
    pub fn search(&self, root_logical: u64, target: &Key) -> Result<Path> {
        let mut path = Path {
            nodes: Vec::new(),
            slots: Vec::new(),
        };

        let mut addr = root_logical;
        let mut prev_level: Option<u8> = None;
        loop {
            let node = self.reader.read_node(addr, self.node_size)?;

            // Levels decrease strictly toward the leaves; anything else is
            // a corrupt or cyclic pointer chain.
            if prev_level.is_some_and(|prev| node.header.level >= prev) {
                return Err(ParseError::InvalidField {
                    field: "level",
                    reason: "tree level does not decrease toward leaves",
                }
                .into());
            }
            prev_level = Some(node.header.level);

            match &node.entries {
                NodeEntries::Leaf(items) => {
                    let (slot, exact) = binary_search_leaf(items, target);
                    trace!(addr, slot, exact, "btree_search_leaf");
                    path.nodes.push(node);
                    path.slots.push(slot);
                    return Ok(path);
                }
                NodeEntries::Internal(ptrs) => {
                    let (mut slot, exact) = binary_search_internal(ptrs, target);
                    if !exact && slot > 0 {
                        slot -= 1;
                    }
                    let Some(ptr) = ptrs.get(slot) else {
                        return Err(BrfsError::InvalidSlot {
                            slot,
                            nritems: ptrs.len(),
                        });
                    };
                    addr = ptr.blockptr;
                    trace!(slot, exact, child = addr, "btree_search_descend");
                    path.nodes.push(node);
                    path.slots.push(slot);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brfs_ondisk::{HEADER_SIZE, KEY_PTR_SIZE, LEAF_ITEM_SIZE};
    use std::collections::HashMap;

    const NODE_SIZE: u32 = 4096;

    fn leaf_block(bytenr: u64, items: &[(Key, &[u8])]) -> Vec<u8> {
        let mut block = vec![0_u8; NODE_SIZE as usize];
        block[0x30..0x38].copy_from_slice(&bytenr.to_le_bytes());
        block[0x60..0x64].copy_from_slice(&(items.len() as u32).to_le_bytes());
        block[0x64] = 0;

        let mut data_end = block.len();
        for (idx, (key, payload)) in items.iter().enumerate() {
            data_end -= payload.len();
            block[data_end..data_end + payload.len()].copy_from_slice(payload);
            let data_offset = (data_end - HEADER_SIZE) as u32;

            let base = HEADER_SIZE + idx * LEAF_ITEM_SIZE;
            block[base..base + 8].copy_from_slice(&key.objectid.to_le_bytes());
            block[base + 8] = key.item_type;
            block[base + 9..base + 17].copy_from_slice(&key.offset.to_le_bytes());
            block[base + 17..base + 21].copy_from_slice(&data_offset.to_le_bytes());
            block[base + 21..base + 25].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        }
        block
    }

    fn internal_block(bytenr: u64, level: u8, ptrs: &[(Key, u64)]) -> Vec<u8> {
        let mut block = vec![0_u8; NODE_SIZE as usize];
        block[0x30..0x38].copy_from_slice(&bytenr.to_le_bytes());
        block[0x60..0x64].copy_from_slice(&(ptrs.len() as u32).to_le_bytes());
        block[0x64] = level;

        for (idx, (key, child)) in ptrs.iter().enumerate() {
            let base = HEADER_SIZE + idx * KEY_PTR_SIZE;
            block[base..base + 8].copy_from_slice(&key.objectid.to_le_bytes());
            block[base + 8] = key.item_type;
            block[base + 9..base + 17].copy_from_slice(&key.offset.to_le_bytes());
            block[base + 17..base + 25].copy_from_slice(&child.to_le_bytes());
            block[base + 25..base + 33].copy_from_slice(&1_u64.to_le_bytes());
        }
        block
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

    fn item(objectid: u64) -> (Key, &'static [u8]) {
        (Key::new(objectid, 1, 0), b"payload")
    }

    #[test]
    fn node_parse_requires_exact_size() {
        let block = leaf_block(0x1000, &[]);
        assert!(Node::parse(&block[..100], NODE_SIZE, 0x1000).is_err());
        let node = Node::parse(&block, NODE_SIZE, 0x1000).expect("parse");
        assert!(node.is_leaf());
        assert!(matches!(
            Node::parse(&block, NODE_SIZE, 0x2000),
            Err(BrfsError::Parse(ParseError::InvalidField {
                field: "bytenr",
                ..
            }))
        ));
    }

    #[test]
    fn binary_search_leaf_contract() {
        let items: Vec<Item> = [10_u64, 20, 30]
            .iter()
            .map(|oid| Item {
                key: Key::new(*oid, 1, 0),
                data: Vec::new(),
            })
            .collect();

        assert_eq!(binary_search_leaf(&items, &Key::new(5, 1, 0)), (0, false));
        assert_eq!(binary_search_leaf(&items, &Key::new(10, 1, 0)), (0, true));
        assert_eq!(binary_search_leaf(&items, &Key::new(15, 1, 0)), (1, false));
        assert_eq!(binary_search_leaf(&items, &Key::new(30, 1, 0)), (2, true));
        assert_eq!(binary_search_leaf(&items, &Key::new(31, 1, 0)), (3, false));
    }

    #[test]
    fn binary_search_on_empty_node_is_zero_inexact() {
        assert_eq!(binary_search_leaf(&[], &Key::new(1, 1, 0)), (0, false));
        assert_eq!(
            binary_search_internal(&[], &Key::new(1, 1, 0)),
            (0, false)
        );
    }

    #[test]
    fn binary_search_internal_contract() {
        let ptrs: Vec<KeyPtr> = [10_u64, 20, 30]
            .iter()
            .enumerate()
            .map(|(i, oid)| KeyPtr {
                key: Key::new(*oid, 1, 0),
                blockptr: 0x1000 * (i as u64 + 1),
                generation: 1,
            })
            .collect();

        // Not exact: first key > target.
        assert_eq!(binary_search_internal(&ptrs, &Key::new(5, 1, 0)), (0, false));
        assert_eq!(
            binary_search_internal(&ptrs, &Key::new(25, 1, 0)),
            (2, false)
        );
        assert_eq!(
            binary_search_internal(&ptrs, &Key::new(35, 1, 0)),
            (3, false)
        );
        // Exact: index of the matching separator.
        assert_eq!(binary_search_internal(&ptrs, &Key::new(20, 1, 0)), (1, true));
        assert_eq!(binary_search_internal(&ptrs, &Key::new(10, 1, 0)), (0, true));
    }

    #[test]
    fn search_single_leaf_exact_and_miss() {
        let reader = MapReader {
            blocks: HashMap::from([(0x1000, leaf_block(0x1000, &[item(10), item(20)]))]),
        };
        let searcher = Searcher::new(&reader, NODE_SIZE);

        let path = searcher.search(0x1000, &Key::new(20, 1, 0)).expect("search");
        assert_eq!(path.depth(), 1);
        assert_eq!(path.key().expect("key"), Key::new(20, 1, 0));
        assert_eq!(path.item().expect("item").data, b"payload");

        // Greater than everything: slot lands one past the end.
        let path = searcher.search(0x1000, &Key::new(99, 1, 0)).expect("search");
        assert_eq!(path.leaf_slot(), Some(2));
        assert!(matches!(
            path.item(),
            Err(BrfsError::SlotOutOfRange { slot: 2, nritems: 2 })
        ));
    }

    #[test]
    fn search_descends_through_internal_node() {
        let left = leaf_block(0x2000, &[item(10), item(20)]);
        let right = leaf_block(0x3000, &[item(30), item(40)]);
        let root = internal_block(
            0x1000,
            1,
            &[(Key::new(10, 1, 0), 0x2000), (Key::new(30, 1, 0), 0x3000)],
        );
        let reader = MapReader {
            blocks: HashMap::from([(0x1000, root), (0x2000, left), (0x3000, right)]),
        };
        let searcher = Searcher::new(&reader, NODE_SIZE);

        // Between separators: last child whose first key <= target.
        let path = searcher.search(0x1000, &Key::new(20, 1, 0)).expect("search");
        assert_eq!(path.depth(), 2);
        assert_eq!(path.key().expect("key"), Key::new(20, 1, 0));

        // Exactly on the second separator: descends into the right child.
        let path = searcher.search(0x1000, &Key::new(30, 1, 0)).expect("search");
        assert_eq!(path.key().expect("key"), Key::new(30, 1, 0));

        // Before the first separator: clamps to child 0.
        let path = searcher.search(0x1000, &Key::new(1, 1, 0)).expect("search");
        assert_eq!(path.key().expect("key"), Key::new(10, 1, 0));

        // Past everything: right child, slot beyond its items.
        let path = searcher.search(0x1000, &Key::new(99, 1, 0)).expect("search");
        assert!(path.item().is_err());
    }

    #[test]
    fn search_rejects_non_decreasing_levels() {
        // Root at level 1 pointing to another level-1 node.
        let inner = internal_block(0x2000, 1, &[(Key::new(10, 1, 0), 0x1000)]);
        let root = internal_block(0x1000, 1, &[(Key::new(10, 1, 0), 0x2000)]);
        let reader = MapReader {
            blocks: HashMap::from([(0x1000, root), (0x2000, inner)]),
        };
        let searcher = Searcher::new(&reader, NODE_SIZE);
        assert!(matches!(
            searcher.search(0x1000, &Key::new(10, 1, 0)),
            Err(BrfsError::Parse(ParseError::InvalidField { field: "level", .. }))
        ));
    }

    #[test]
    fn empty_path_accessors() {
        let path = Path {
            nodes: Vec::new(),
            slots: Vec::new(),
        };
        assert!(matches!(path.item(), Err(BrfsError::EmptyPath)));
        assert!(matches!(path.key(), Err(BrfsError::EmptyPath)));
        assert_eq!(path.leaf_slot(), None);
    }

    #[test]
    fn not_leaf_when_path_ends_on_internal_node() {
        let root = internal_block(0x1000, 1, &[(Key::new(10, 1, 0), 0x2000)]);
        let node = Node::parse(&root, NODE_SIZE, 0x1000).expect("parse");
        let path = Path {
            nodes: vec![node],
            slots: vec![0],
        };
        assert!(matches!(path.item(), Err(BrfsError::NotLeaf)));
    }
}
