#![forbid(unsafe_code)]
//! Error types for brfs.
//!
//! Defines `BrfsError` and a `Result<T>` alias used throughout the
//! workspace, plus `ResultExt::op` for attaching the component-qualified
//! operation name to a failure as it propagates.

use brfs_types::ParseError;
use thiserror::Error;

/// Unified error type for all brfs operations.
#[derive(Debug, Error)]
pub enum BrfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device is empty")]
    InvalidDeviceSize,

    #[error("read out of bounds: offset {offset} + len {len} exceeds device size {size}")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("no valid superblock found at any known offset")]
    NoValidSuperblock,

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("no chunk mapping covers logical address {logical:#x}")]
    ChunkNotFound { logical: u64 },

    #[error("invalid chunk mapping: {0}")]
    InvalidChunkMapping(&'static str),

    #[error("invalid slot {slot} in internal node with {nritems} key pointers")]
    InvalidSlot { slot: usize, nritems: usize },

    #[error("empty btree path")]
    EmptyPath,

    #[error("last node in btree path is not a leaf")]
    NotLeaf,

    #[error("slot {slot} out of range in leaf with {nritems} items")]
    SlotOutOfRange { slot: usize, nritems: usize },

    #[error("FS tree root item not found in root tree")]
    FsTreeNotFound,

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("inode {0} not found")]
    InodeNotFound(u64),

    #[error("invalid file path: {0}")]
    InvalidFilePath(String),

    #[error("no extent data found for inode {0}")]
    ExtentNotFound(u64),

    #[error("unsupported extent type {extent_type}")]
    UnsupportedExtent { extent_type: u8 },

    #[error("{op}: {source}")]
    Op {
        op: &'static str,
        #[source]
        source: Box<BrfsError>,
    },
}

impl BrfsError {
    /// Wrap this error with the name of the operation that produced it.
    #[must_use]
    pub fn op(self, op: &'static str) -> Self {
        Self::Op {
            op,
            source: Box::new(self),
        }
    }

    /// The innermost error, unwrapping operation labels.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::Op { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Result alias using `BrfsError`.
pub type Result<T> = std::result::Result<T, BrfsError>;

/// Attach an operation label to the error arm of a result.
pub trait ResultExt<T> {
    fn op(self, op: &'static str) -> Result<T>;
}

impl<T, E: Into<BrfsError>> ResultExt<T> for std::result::Result<T, E> {
    fn op(self, op: &'static str) -> Result<T> {
        self.map_err(|err| err.into().op(op))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_label_prefixes_message() {
        let err = BrfsError::NoValidSuperblock.op("Filesystem::open");
        assert_eq!(
            err.to_string(),
            "Filesystem::open: no valid superblock found at any known offset"
        );
    }

    #[test]
    fn root_cause_unwraps_nested_labels() {
        let err = BrfsError::InodeNotFound(256)
            .op("Filesystem::read_inode")
            .op("Filesystem::read_file");
        assert!(matches!(err.root_cause(), BrfsError::InodeNotFound(256)));
    }

    #[test]
    fn parse_errors_convert() {
        let parse = ParseError::InvalidField {
            field: "nodesize",
            reason: "must be non-zero power of two",
        };
        let err: BrfsError = parse.into();
        assert!(matches!(err, BrfsError::Parse(_)));
    }
}
