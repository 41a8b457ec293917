#![forbid(unsafe_code)]
//! Byte-addressed device access and block caching.
//!
//! [`ByteDevice`] is the only I/O seam in the workspace: the filesystem
//! façade reads superblocks, tree nodes, and extents through it. Backings
//! are a regular file ([`FileByteDevice`]) or an in-memory image
//! ([`MemByteDevice`], used by tests and fixtures).

mod cache;

pub use cache::{CacheStats, DEFAULT_CACHE_CAPACITY, LruBlockCache};

use brfs_error::{BrfsError, Result};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Random-access byte source.
///
/// Implementations must support concurrent reads; there is no seek state.
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

fn check_read_bounds(offset: u64, len: usize, size: u64) -> Result<()> {
    let len = len as u64;
    let end = offset
        .checked_add(len)
        .ok_or(BrfsError::OutOfBounds { offset, len, size })?;
    if offset >= size || end > size {
        return Err(BrfsError::OutOfBounds { offset, len, size });
    }
    Ok(())
}

/// File-backed byte device using positional (`pread`-style) I/O.
///
/// `FileExt::read_exact_at` carries no shared seek position, so clones of
/// this device may read concurrently.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    /// Open an image read-only. Empty files are rejected.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        if len == 0 {
            return Err(BrfsError::InvalidDeviceSize);
        }
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_read_bounds(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

/// Memory-backed byte device over an owned image buffer.
#[derive(Debug, Clone)]
pub struct MemByteDevice {
    bytes: Arc<Vec<u8>>,
}

impl MemByteDevice {
    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        if bytes.is_empty() {
            return Err(BrfsError::InvalidDeviceSize);
        }
        Ok(Self {
            bytes: Arc::new(bytes),
        })
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_read_bounds(offset, buf.len(), self.len_bytes())?;
        let start = usize::try_from(offset).map_err(|_| BrfsError::OutOfBounds {
            offset,
            len: buf.len() as u64,
            size: self.len_bytes(),
        })?;
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }
}
