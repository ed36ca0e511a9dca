//! MerkleFS FUSE - Kernel-protocol adapter.
//!
//! Translates low-level kernel callbacks into metadata queries and pool
//! opens:
//! - Per-open directory cursors with stable offsets
//! - Descriptor-backed read replies (no content buffering in the adapter)
//! - Negative dentries for missing names
//! - Lazy blob acquisition on first open

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod buf;
pub mod cursor;
pub mod mount;
pub mod vfs;

pub use buf::FdBuf;
pub use cursor::{DirCursor, DirEntry};
pub use mount::{mount, mount_options, MountOpts, DEFAULT_TIMEOUT};
pub use vfs::MerkleFs;
