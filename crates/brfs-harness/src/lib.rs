#![forbid(unsafe_code)]
//! Synthetic btrfs image construction.
//!
//! Encoders for the on-disk structures the reader decodes, plus a small
//! image assembler. Only tests consume this crate; it favors clarity over
//! generality and panics on impossible layouts instead of returning errors.

use brfs_ondisk::{
    CHUNK_ITEM_FIXED_SIZE, DISK_KEY_SIZE, HEADER_SIZE, Key, LEAF_ITEM_SIZE, KEY_PTR_SIZE,
    SYS_CHUNK_ARRAY_OFFSET,
};
use brfs_types::{BTRFS_MAGIC, SUPER_INFO_SIZE};

/// Encode a 17-byte disk key.
#[must_use]
pub fn encode_key(key: &Key) -> [u8; DISK_KEY_SIZE] {
    let mut out = [0_u8; DISK_KEY_SIZE];
    out[0..8].copy_from_slice(&key.objectid.to_le_bytes());
    out[8] = key.item_type;
    out[9..17].copy_from_slice(&key.offset.to_le_bytes());
    out
}

/// Encode a leaf node. Payloads are packed from the end of the block
/// downward, the way mkfs lays them out.
///
/// # Panics
/// If the items do not fit in `node_size` bytes.
#[must_use]
pub fn leaf_block(node_size: u32, bytenr: u64, owner: u64, items: &[(Key, Vec<u8>)]) -> Vec<u8> {
    let mut block = node_header(node_size, bytenr, owner, items.len() as u32, 0);

    let mut data_end = block.len();
    for (idx, (key, payload)) in items.iter().enumerate() {
        data_end = data_end
            .checked_sub(payload.len())
            .expect("leaf payloads exceed node size");
        block[data_end..data_end + payload.len()].copy_from_slice(payload);

        let base = HEADER_SIZE + idx * LEAF_ITEM_SIZE;
        assert!(base + LEAF_ITEM_SIZE <= data_end, "leaf item table overlaps payloads");
        block[base..base + DISK_KEY_SIZE].copy_from_slice(&encode_key(key));
        block[base + 17..base + 21]
            .copy_from_slice(&((data_end - HEADER_SIZE) as u32).to_le_bytes());
        block[base + 21..base + 25].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    }
    block
}

/// Encode an internal node from `(first key of child, child address)` pairs.
#[must_use]
pub fn internal_block(
    node_size: u32,
    bytenr: u64,
    owner: u64,
    level: u8,
    ptrs: &[(Key, u64)],
) -> Vec<u8> {
    assert!(level > 0, "internal nodes have level > 0");
    let mut block = node_header(node_size, bytenr, owner, ptrs.len() as u32, level);
    for (idx, (key, child)) in ptrs.iter().enumerate() {
        let base = HEADER_SIZE + idx * KEY_PTR_SIZE;
        block[base..base + DISK_KEY_SIZE].copy_from_slice(&encode_key(key));
        block[base + 17..base + 25].copy_from_slice(&child.to_le_bytes());
        block[base + 25..base + 33].copy_from_slice(&1_u64.to_le_bytes());
    }
    block
}

fn node_header(node_size: u32, bytenr: u64, owner: u64, nritems: u32, level: u8) -> Vec<u8> {
    let mut block = vec![0_u8; node_size as usize];
    block[0x30..0x38].copy_from_slice(&bytenr.to_le_bytes());
    block[0x50..0x58].copy_from_slice(&1_u64.to_le_bytes()); // generation
    block[0x58..0x60].copy_from_slice(&owner.to_le_bytes());
    block[0x60..0x64].copy_from_slice(&nritems.to_le_bytes());
    block[0x64] = level;
    block
}

/// Encode a chunk item payload from `(devid, physical offset)` stripes.
#[must_use]
pub fn chunk_item_bytes(length: u64, chunk_type: u64, stripes: &[(u64, u64)]) -> Vec<u8> {
    assert!(!stripes.is_empty(), "chunk needs at least one stripe");
    let mut out = vec![0_u8; CHUNK_ITEM_FIXED_SIZE + stripes.len() * 32];
    out[0..8].copy_from_slice(&length.to_le_bytes());
    out[8..16].copy_from_slice(&2_u64.to_le_bytes()); // owner: chunk tree
    out[16..24].copy_from_slice(&(64_u64 << 10).to_le_bytes()); // stripe_len
    out[24..32].copy_from_slice(&chunk_type.to_le_bytes());
    out[32..36].copy_from_slice(&4096_u32.to_le_bytes());
    out[36..40].copy_from_slice(&4096_u32.to_le_bytes());
    out[40..44].copy_from_slice(&4096_u32.to_le_bytes());
    out[44..46].copy_from_slice(&(stripes.len() as u16).to_le_bytes());
    for (idx, (devid, offset)) in stripes.iter().enumerate() {
        let base = CHUNK_ITEM_FIXED_SIZE + idx * 32;
        out[base..base + 8].copy_from_slice(&devid.to_le_bytes());
        out[base + 8..base + 16].copy_from_slice(&offset.to_le_bytes());
    }
    out
}

/// Encode one system-chunk-array entry: disk key + chunk item.
#[must_use]
pub fn sys_chunk_entry(logical_start: u64, chunk_item: &[u8]) -> Vec<u8> {
    let key = Key::new(256, 228, logical_start);
    let mut out = encode_key(&key).to_vec();
    out.extend_from_slice(chunk_item);
    out
}

/// Encode a ROOT_ITEM payload pointing at `bytenr` (full 439-byte item).
#[must_use]
pub fn root_item_bytes(bytenr: u64, level: u8) -> Vec<u8> {
    let mut out = vec![0_u8; 439];
    out[176..184].copy_from_slice(&bytenr.to_le_bytes());
    out[438] = level;
    out
}

/// Encode an INODE_ITEM payload (160 bytes).
#[must_use]
pub fn inode_item_bytes(size: u64, mode: u32) -> Vec<u8> {
    let mut out = vec![0_u8; 160];
    out[16..24].copy_from_slice(&size.to_le_bytes());
    out[52..56].copy_from_slice(&mode.to_le_bytes());
    out
}

/// Encode a DIR_ITEM / DIR_INDEX payload with a single entry.
#[must_use]
pub fn dir_entry_bytes(target_inode: u64, file_type: u8, name: &[u8]) -> Vec<u8> {
    let mut out = vec![0_u8; 30 + name.len()];
    out[0..DISK_KEY_SIZE].copy_from_slice(&encode_key(&Key::new(target_inode, 1, 0)));
    out[17..25].copy_from_slice(&1_u64.to_le_bytes()); // transid
    out[27..29].copy_from_slice(&(name.len() as u16).to_le_bytes());
    out[29] = file_type;
    out[30..].copy_from_slice(name);
    out
}

/// Encode an inline EXTENT_DATA payload.
#[must_use]
pub fn extent_inline_bytes(content: &[u8]) -> Vec<u8> {
    let mut out = vec![0_u8; 21];
    out[0..8].copy_from_slice(&1_u64.to_le_bytes()); // generation
    out[8..16].copy_from_slice(&(content.len() as u64).to_le_bytes()); // ram_bytes
    out[20] = 0; // inline
    out.extend_from_slice(content);
    out
}

/// Encode a regular EXTENT_DATA payload.
#[must_use]
pub fn extent_regular_bytes(
    disk_bytenr: u64,
    disk_num_bytes: u64,
    extent_offset: u64,
    num_bytes: u64,
) -> Vec<u8> {
    let mut out = vec![0_u8; 53];
    out[0..8].copy_from_slice(&1_u64.to_le_bytes());
    out[8..16].copy_from_slice(&num_bytes.to_le_bytes());
    out[20] = 1; // regular
    out[21..29].copy_from_slice(&disk_bytenr.to_le_bytes());
    out[29..37].copy_from_slice(&disk_num_bytes.to_le_bytes());
    out[37..45].copy_from_slice(&extent_offset.to_le_bytes());
    out[45..53].copy_from_slice(&num_bytes.to_le_bytes());
    out
}

/// Lay a sorted item list out as a tree: one leaf if everything fits, else
/// several leaves under a single internal root. Nodes are allocated at
/// `first_node_addr`, one `node_size` apart.
///
/// Returns `(root address, root level, placed nodes)`.
///
/// # Panics
/// If `items` are not strictly ascending by key, or the tree needs more
/// than one internal level.
#[must_use]
pub fn build_tree(
    node_size: u32,
    owner: u64,
    items: &[(Key, Vec<u8>)],
    first_node_addr: u64,
) -> (u64, u8, Vec<(u64, Vec<u8>)>) {
    for pair in items.windows(2) {
        assert!(pair[0].0 < pair[1].0, "tree items must be strictly ascending");
    }

    // Greedy split by byte capacity.
    let capacity = node_size as usize - HEADER_SIZE;
    let mut leaves: Vec<Vec<(Key, Vec<u8>)>> = vec![Vec::new()];
    let mut used = 0_usize;
    for (key, payload) in items {
        let cost = LEAF_ITEM_SIZE + payload.len();
        if used + cost > capacity && !leaves.last().expect("leaf").is_empty() {
            leaves.push(Vec::new());
            used = 0;
        }
        leaves.last_mut().expect("leaf").push((*key, payload.clone()));
        used += cost;
    }

    let mut addr = first_node_addr;
    let mut placed = Vec::new();
    let mut ptrs = Vec::new();
    for leaf in &leaves {
        let first_key = leaf.first().map_or(Key::new(0, 0, 0), |(key, _)| *key);
        placed.push((addr, leaf_block(node_size, addr, owner, leaf)));
        ptrs.push((first_key, addr));
        addr += u64::from(node_size);
    }

    if placed.len() == 1 {
        let root = placed[0].0;
        return (root, 0, placed);
    }

    let ptr_capacity = (node_size as usize - HEADER_SIZE) / KEY_PTR_SIZE;
    assert!(ptrs.len() <= ptr_capacity, "tree would need two internal levels");
    placed.push((addr, internal_block(node_size, addr, owner, 1, &ptrs)));
    (addr, 1, placed)
}

/// Superblock parameters the builder does not derive.
#[derive(Debug, Clone)]
pub struct SuperblockSpec {
    pub label: String,
    pub generation: u64,
    pub root: u64,
    pub root_level: u8,
    pub chunk_root: u64,
    pub chunk_root_level: u8,
    pub total_bytes: u64,
    pub sectorsize: u32,
    pub nodesize: u32,
    pub sys_chunk_array: Vec<u8>,
}

impl Default for SuperblockSpec {
    fn default() -> Self {
        Self {
            label: "TestBtrfs".to_owned(),
            generation: 1,
            root: 0,
            root_level: 0,
            chunk_root: 0,
            chunk_root_level: 0,
            total_bytes: 0,
            sectorsize: 4096,
            nodesize: 4096,
            sys_chunk_array: Vec::new(),
        }
    }
}

/// Encode a 4 KiB superblock region.
#[must_use]
pub fn superblock_bytes(spec: &SuperblockSpec) -> Vec<u8> {
    let mut sb = vec![0_u8; SUPER_INFO_SIZE];
    sb[0x40..0x48].copy_from_slice(&BTRFS_MAGIC.to_le_bytes());
    sb[0x48..0x50].copy_from_slice(&spec.generation.to_le_bytes());
    sb[0x50..0x58].copy_from_slice(&spec.root.to_le_bytes());
    sb[0x58..0x60].copy_from_slice(&spec.chunk_root.to_le_bytes());
    sb[0x70..0x78].copy_from_slice(&spec.total_bytes.to_le_bytes());
    sb[0x80..0x88].copy_from_slice(&256_u64.to_le_bytes()); // root_dir_objectid
    sb[0x88..0x90].copy_from_slice(&1_u64.to_le_bytes()); // num_devices
    sb[0x90..0x94].copy_from_slice(&spec.sectorsize.to_le_bytes());
    sb[0x94..0x98].copy_from_slice(&spec.nodesize.to_le_bytes());
    sb[0x98..0x9C].copy_from_slice(&spec.nodesize.to_le_bytes()); // leafsize
    sb[0x9C..0xA0].copy_from_slice(&65536_u32.to_le_bytes()); // stripesize
    sb[0xA0..0xA4].copy_from_slice(&(spec.sys_chunk_array.len() as u32).to_le_bytes());
    sb[0xA4..0xAC].copy_from_slice(&spec.generation.to_le_bytes());
    sb[0xC6] = spec.root_level;
    sb[0xC7] = spec.chunk_root_level;
    sb[0xC9..0xD1].copy_from_slice(&1_u64.to_le_bytes()); // dev_item.devid
    let label = spec.label.as_bytes();
    sb[0x12B..0x12B + label.len()].copy_from_slice(label);
    sb[SYS_CHUNK_ARRAY_OFFSET..SYS_CHUNK_ARRAY_OFFSET + spec.sys_chunk_array.len()]
        .copy_from_slice(&spec.sys_chunk_array);
    sb
}

/// Flat image assembler: a zeroed byte buffer with `place` writes.
#[derive(Debug)]
pub struct ImageBuilder {
    bytes: Vec<u8>,
}

impl ImageBuilder {
    #[must_use]
    pub fn new(total: usize) -> Self {
        Self {
            bytes: vec![0_u8; total],
        }
    }

    /// Copy `data` into the image at `offset`.
    ///
    /// # Panics
    /// If the write would run past the end of the image.
    pub fn place(&mut self, offset: u64, data: &[u8]) {
        let start = usize::try_from(offset).expect("offset fits usize");
        self.bytes[start..start + data.len()].copy_from_slice(data);
    }

    pub fn place_superblock_at(&mut self, offset: u64, spec: &SuperblockSpec) {
        let bytes = superblock_bytes(spec);
        self.place(offset, &bytes);
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}
