//! MerkleFS Metadata - In-memory description of a content-addressed tree.
//!
//! Provides:
//! - Slash-delimited path segmentation
//! - An append-only inode table with dense numbering
//! - Hierarchical name resolution and pre-mount directory mutation
//! - The JSON metadata document format

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod fs;
pub mod inode;
pub mod path;

pub use fs::FileSystem;
pub use inode::{Dirents, Ino, Inode, Payload, ROOT_INO};
pub use path::segments;

use thiserror::Error;

/// Errors from metadata tree mutation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetaError {
    /// No such file or directory
    #[error("no such file or directory")]
    NotFound,

    /// A non-terminal path component is not a directory
    #[error("not a directory")]
    NotDirectory,
}

impl MetaError {
    /// The POSIX errno equivalent of this error.
    pub fn errno(&self) -> i32 {
        match self {
            MetaError::NotFound => libc::ENOENT,
            MetaError::NotDirectory => libc::ENOTDIR,
        }
    }
}

/// Errors from a rejected metadata document.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// The document contains no inodes
    #[error("metadata document has no inodes")]
    Empty,

    /// The first inode is not a directory
    #[error("root inode {0} is not a directory")]
    RootNotDirectory(Ino),

    /// Inode numbers are not dense from the root upward
    #[error("inode {found} out of sequence, expected {expected}")]
    OutOfSequence {
        /// Number the dense sequence requires at this index
        expected: Ino,
        /// Number the document carries
        found: Ino,
    },

    /// A directory entry points outside the table
    #[error("entry {name:?} in directory {parent} points to unknown inode {child}")]
    DanglingEntry {
        /// Directory owning the entry
        parent: Ino,
        /// Entry name
        name: String,
        /// Missing target
        child: Ino,
    },

    /// A directory object is missing its `dirents` field
    #[error("directory inode {0} has no dirents")]
    MissingDirents(Ino),

    /// A regular or symlink object is missing its `value` field
    #[error("inode {0} has no value")]
    MissingValue(Ino),

    /// The mode word carries no supported file type
    #[error("inode {ino} has unsupported file type in mode {mode:#o}")]
    UnsupportedFileType {
        /// Offending inode number
        ino: Ino,
        /// Full mode word
        mode: u32,
    },
}
