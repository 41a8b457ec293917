#![forbid(unsafe_code)]
//! Read-only btrfs filesystem façade.
//!
//! [`Filesystem::open`] bootstraps everything a read needs: the newest
//! superblock, the chunk translation table (embedded system array first,
//! then the chunk tree), an LRU block cache, and the FS-tree root found
//! through the root tree. After that, [`Filesystem::list_directory`] and
//! [`Filesystem::read_file`] resolve paths against the FS tree.
//!
//! The façade owns the device; dropping the filesystem releases it,
//! including on partial-open failures.

mod superblock;

pub use superblock::read_latest;

use brfs_block::{ByteDevice, DEFAULT_CACHE_CAPACITY, FileByteDevice, LruBlockCache};
use brfs_btree::{Node, NodeReader, Searcher};
use brfs_chunk::{ChunkTable, ChunkTreeLoader, load_sys_chunk_array};
use brfs_error::{BrfsError, Result, ResultExt};
use brfs_ondisk::{ExtentData, InodeItem, Key, RootItem, Superblock, parse_dir_items};
use brfs_types::{
    FILE_EXTENT_REG, FIRST_FREE_OBJECTID, FS_TREE_OBJECTID, FT_DIR, ITEM_DIR_INDEX,
    ITEM_DIR_ITEM, ITEM_EXTENT_DATA, ITEM_INODE_ITEM, ITEM_ROOT_ITEM, ParseError, name_hash,
    u64_to_usize,
};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, trace};

/// Hard cap on DIR_INDEX probes per directory listing.
const DIR_INDEX_PROBE_CAP: u64 = 10_000;

/// One directory entry as returned by [`Filesystem::list_directory`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub inode: u64,
    pub file_type: u8,
    pub is_dir: bool,
}

/// An opened btrfs image.
pub struct Filesystem {
    device: Box<dyn ByteDevice>,
    superblock: Superblock,
    chunks: ChunkTable,
    cache: LruBlockCache,
    fs_tree_root: u64,
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("superblock", &self.superblock)
            .field("chunks", &self.chunks)
            .field("fs_tree_root", &self.fs_tree_root)
            .finish_non_exhaustive()
    }
}

impl Filesystem {
    /// Open a btrfs image file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let device = FileByteDevice::open(path).op("Filesystem::open")?;
        Self::from_device(Box::new(device))
    }

    /// Open an already-constructed device.
    pub fn from_device(device: Box<dyn ByteDevice>) -> Result<Self> {
        let superblock = read_latest(device.as_ref()).op("Filesystem::open")?;
        debug!(
            generation = superblock.generation,
            nodesize = superblock.nodesize,
            label = %superblock.label,
            "superblock selected"
        );

        let chunks = ChunkTable::new();
        load_sys_chunk_array(&chunks, &superblock.sys_chunk_array)
            .op("Filesystem::open::bootstrap_chunks")?;

        let mut fs = Self {
            device,
            superblock,
            chunks,
            cache: LruBlockCache::new(DEFAULT_CACHE_CAPACITY),
            fs_tree_root: 0,
        };

        ChunkTreeLoader::new(&fs.chunks, &fs, fs.superblock.nodesize)
            .load(fs.superblock.chunk_root)
            .op("Filesystem::open::load_chunk_tree")?;

        fs.fs_tree_root = fs.find_fs_tree_root().op("Filesystem::open::find_fs_tree")?;
        debug!(fs_tree_root = fs.fs_tree_root, chunks = fs.chunks.len(), "filesystem open");
        Ok(fs)
    }

    /// The superblock this filesystem was opened from.
    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    /// Logical address of the FS tree root.
    #[must_use]
    pub fn fs_tree_root(&self) -> u64 {
        self.fs_tree_root
    }

    fn search(&self, root: u64, target: &Key) -> Result<brfs_btree::Path> {
        Searcher::new(self, self.superblock.nodesize).search(root, target)
    }

    /// Locate the FS tree through the root tree's `(5, ROOT_ITEM, 0)` row.
    fn find_fs_tree_root(&self) -> Result<u64> {
        let target = Key::new(FS_TREE_OBJECTID, ITEM_ROOT_ITEM, 0);
        let path = self.search(self.superblock.root, &target)?;
        let Ok(item) = path.item() else {
            return Err(BrfsError::FsTreeNotFound);
        };
        if item.key != target {
            return Err(BrfsError::FsTreeNotFound);
        }
        let root_item = RootItem::parse(&item.data)?;
        trace!(bytenr = root_item.bytenr, level = root_item.level, "fs tree root item");
        Ok(root_item.bytenr)
    }

    /// Resolve an absolute path to its inode number.
    ///
    /// `/` (or an empty remainder) is the root directory, inode 256. Each
    /// component is looked up by its DIR_ITEM name hash, then matched by
    /// name against the (possibly hash-colliding) packed entries.
    pub fn lookup_path(&self, path: &str) -> Result<u64> {
        let Some(rest) = path.strip_prefix('/') else {
            return Err(BrfsError::InvalidFilePath(path.to_owned()));
        };

        let mut current = FIRST_FREE_OBJECTID;
        for component in rest.split('/').filter(|part| !part.is_empty()) {
            current = match self.lookup_dir_entry(current, component) {
                Ok(inode) => inode,
                Err(BrfsError::PathNotFound(_)) => {
                    return Err(BrfsError::PathNotFound(path.to_owned()));
                }
                Err(other) => return Err(other),
            };
        }
        Ok(current)
    }

    fn lookup_dir_entry(&self, dir_inode: u64, name: &str) -> Result<u64> {
        let target = Key::new(dir_inode, ITEM_DIR_ITEM, name_hash(name.as_bytes()));
        let path = self.search(self.fs_tree_root, &target)?;
        let Ok(item) = path.item() else {
            debug!(dir_inode, name, "dir item search landed past the leaf");
            return Err(BrfsError::PathNotFound(name.to_owned()));
        };
        if item.key != target {
            debug!(dir_inode, name, "no dir item at the name hash");
            return Err(BrfsError::PathNotFound(name.to_owned()));
        }

        let entries = parse_dir_items(&item.data)?;
        entries
            .iter()
            .find(|entry| entry.name == name.as_bytes())
            .map(|entry| entry.location.objectid)
            .ok_or_else(|| BrfsError::PathNotFound(name.to_owned()))
    }

    /// List a directory by probing its DIR_INDEX rows in ascending index
    /// order.
    ///
    /// Each probe lands on the next row at or after the probe index; the
    /// probe then jumps to that row's index. A seen-set drops the duplicate
    /// a re-probe of the same neighbour would produce. Malformed single
    /// entries are skipped; iteration ends at the first foreign key, failed
    /// probe, or the hard cap.
    pub fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>> {
        let dir_inode = if path.is_empty() || path == "/" {
            FIRST_FREE_OBJECTID
        } else {
            self.lookup_path(path)?
        };

        let mut entries = Vec::new();
        let mut seen_offsets = HashSet::new();
        let mut index = 0_u64;
        while index < DIR_INDEX_PROBE_CAP {
            let target = Key::new(dir_inode, ITEM_DIR_INDEX, index);
            let Ok(found) = self.search(self.fs_tree_root, &target) else {
                break;
            };
            let Ok(item) = found.item() else {
                break;
            };
            if item.key.objectid != dir_inode || item.key.item_type != ITEM_DIR_INDEX {
                break;
            }

            if seen_offsets.insert(item.key.offset) {
                if item.key.offset > index {
                    index = item.key.offset;
                }
                match parse_dir_items(&item.data) {
                    Ok(parsed) => {
                        if let Some(entry) = parsed.first() {
                            entries.push(DirEntry {
                                name: String::from_utf8_lossy(&entry.name).into_owned(),
                                inode: entry.location.objectid,
                                file_type: entry.file_type,
                                is_dir: entry.file_type == FT_DIR,
                            });
                        }
                    }
                    Err(err) => {
                        debug!(dir_inode, index = item.key.offset, error = %err,
                            "skipping malformed dir index entry");
                    }
                }
            }
            index += 1;
        }

        Ok(entries)
    }

    /// Read a file's contents.
    ///
    /// Only the first extent is consulted; inline extents return their
    /// payload, regular extents are read through the chunk table (with
    /// `disk_bytenr == 0` denoting a hole). Compression markers are not
    /// interpreted — bytes come back raw.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let inode = self.lookup_path(path)?;
        let item = self.read_inode(inode)?;
        trace!(path, inode, size = item.size, "read_file resolved inode");
        if item.size == 0 {
            return Ok(Vec::new());
        }
        self.read_first_extent(inode)
    }

    fn read_inode(&self, inode: u64) -> Result<InodeItem> {
        let target = Key::new(inode, ITEM_INODE_ITEM, 0);
        let path = self.search(self.fs_tree_root, &target)?;
        let Ok(item) = path.item() else {
            return Err(BrfsError::InodeNotFound(inode));
        };
        if item.key != target {
            return Err(BrfsError::InodeNotFound(inode));
        }
        Ok(InodeItem::parse(&item.data)?)
    }

    fn read_first_extent(&self, inode: u64) -> Result<Vec<u8>> {
        let target = Key::new(inode, ITEM_EXTENT_DATA, 0);
        let path = self.search(self.fs_tree_root, &target)?;
        let Ok(item) = path.item() else {
            return Err(BrfsError::ExtentNotFound(inode));
        };
        if item.key.objectid != inode || item.key.item_type != ITEM_EXTENT_DATA {
            return Err(BrfsError::ExtentNotFound(inode));
        }

        let extent = match ExtentData::parse(&item.data) {
            Ok(extent) => extent,
            Err(ParseError::InvalidField {
                field: "extent_data.type",
                ..
            }) => {
                return Err(BrfsError::UnsupportedExtent {
                    extent_type: item.data[20],
                });
            }
            Err(err) => return Err(err.into()),
        };

        match extent {
            ExtentData::Inline { data, .. } => Ok(data),
            ExtentData::Regular {
                extent_type: FILE_EXTENT_REG,
                disk_bytenr: 0,
                num_bytes,
                ..
            } => {
                // Hole: no backing bytes on disk.
                Ok(vec![0_u8; u64_to_usize(num_bytes, "num_bytes")?])
            }
            ExtentData::Regular {
                extent_type: FILE_EXTENT_REG,
                disk_bytenr,
                disk_num_bytes,
                num_bytes,
                ..
            } => self.read_extent(disk_bytenr, disk_num_bytes, num_bytes),
            ExtentData::Regular { extent_type, .. } => {
                Err(BrfsError::UnsupportedExtent { extent_type })
            }
        }
    }

    /// Read `disk_num_bytes` from a logical extent address and keep the
    /// first `num_bytes`.
    fn read_extent(&self, logical: u64, disk_num_bytes: u64, num_bytes: u64) -> Result<Vec<u8>> {
        let physical = self.chunks.translate(logical).op("Filesystem::read_extent")?;
        let mut buf = vec![0_u8; u64_to_usize(disk_num_bytes, "disk_num_bytes")?];
        self.device.read_exact_at(physical.offset, &mut buf)?;
        buf.truncate(u64_to_usize(num_bytes.min(disk_num_bytes), "num_bytes")?);
        Ok(buf)
    }
}

impl NodeReader for Filesystem {
    /// Fetch and decode the node at a logical address: translate through
    /// the chunk table, consult the cache, read exactly `node_size` bytes
    /// on a miss, and cache the raw buffer.
    fn read_node(&self, logical: u64, node_size: u32) -> Result<Node> {
        let physical = self.chunks.translate(logical).op("Filesystem::read_node")?;

        if let Some(cached) = self.cache.get(logical) {
            return Node::parse(&cached, node_size, logical);
        }

        let mut buf = vec![0_u8; u64_to_usize(u64::from(node_size), "node_size")?];
        self.device
            .read_exact_at(physical.offset, &mut buf)
            .op("Filesystem::read_node")?;
        self.cache.put(logical, &buf);
        Node::parse(&buf, node_size, logical)
    }
}
