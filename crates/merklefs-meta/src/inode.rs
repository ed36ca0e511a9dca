//! Inodes and their typed payloads.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::DocumentError;

/// Inode number. Zero means "no such entry" in lookup results.
pub type Ino = u64;

/// Root inode number (kernel convention).
pub const ROOT_INO: Ino = 1;

/// Directory entries: component name to child inode number.
pub type Dirents = HashMap<String, Ino>;

/// Inode payload, keyed by the file-type bits of the mode word.
///
/// Exactly one variant exists per inode, so type exclusivity is structural
/// rather than asserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Child entries of a directory
    Directory(Dirents),
    /// Link target of a symlink
    Symlink(String),
    /// Content hash of a regular file, naming its blob in the pool
    Regular(String),
}

/// One filesystem object: a directory, regular file, or symlink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "InodeRepr", into = "InodeRepr")]
pub struct Inode {
    ino: Ino,
    mode: u32,
    size: u64,
    payload: Payload,
}

impl Inode {
    /// Constructs an inode with the payload variant dictated by the
    /// file-type bits of `mode`.
    ///
    /// Panics when `mode` carries none of the supported type bits; callers
    /// always pass one of `S_IFREG`, `S_IFDIR`, `S_IFLNK`.
    pub(crate) fn new(ino: Ino, mode: u32) -> Self {
        let payload = match mode & libc::S_IFMT {
            libc::S_IFDIR => Payload::Directory(Dirents::new()),
            libc::S_IFLNK => Payload::Symlink(String::new()),
            libc::S_IFREG => Payload::Regular(String::new()),
            _ => panic!("unsupported file type in mode {mode:#o}"),
        };
        Self {
            ino,
            mode,
            size: 0,
            payload,
        }
    }

    /// Inode number.
    pub fn ino(&self) -> Ino {
        self.ino
    }

    /// Full POSIX mode word (type and permission bits).
    pub fn mode(&self) -> u32 {
        self.mode
    }

    /// Size reported to the kernel.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The typed payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Returns true for a regular file.
    pub fn is_reg(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }

    /// Returns true for a directory.
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    /// Returns true for a symlink.
    pub fn is_lnk(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }

    /// Child entries. Panics on a non-directory.
    pub fn dirents(&self) -> &Dirents {
        match &self.payload {
            Payload::Directory(dirents) => dirents,
            _ => panic!("inode {} is not a directory", self.ino),
        }
    }

    pub(crate) fn dirents_mut(&mut self) -> &mut Dirents {
        match &mut self.payload {
            Payload::Directory(dirents) => dirents,
            _ => panic!("inode {} is not a directory", self.ino),
        }
    }

    /// Link target. Panics on a non-symlink.
    pub fn readlink(&self) -> &str {
        match &self.payload {
            Payload::Symlink(target) => target,
            _ => panic!("inode {} is not a symlink", self.ino),
        }
    }

    /// Content hash naming this file's blob. Panics on a non-regular inode.
    pub fn blob_hash(&self) -> &str {
        match &self.payload {
            Payload::Regular(hash) => hash,
            _ => panic!("inode {} is not a regular file", self.ino),
        }
    }

    pub(crate) fn set_target(&mut self, target: &str) {
        match &mut self.payload {
            Payload::Symlink(slot) => {
                *slot = target.to_owned();
                self.size = target.len() as u64;
            }
            _ => panic!("inode {} is not a symlink", self.ino),
        }
    }

    pub(crate) fn set_content(&mut self, hash: String, size: u64) {
        match &mut self.payload {
            Payload::Regular(slot) => {
                *slot = hash;
                self.size = size;
            }
            _ => panic!("inode {} is not a regular file", self.ino),
        }
    }
}

/// Wire shape of one inode in the metadata document: `dirents` is present
/// iff the mode says directory, `value` iff regular or symlink.
#[derive(Serialize, Deserialize)]
struct InodeRepr {
    ino: Ino,
    mode: u32,
    size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dirents: Option<Dirents>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

impl From<Inode> for InodeRepr {
    fn from(inode: Inode) -> Self {
        let (dirents, value) = match inode.payload {
            Payload::Directory(dirents) => (Some(dirents), None),
            Payload::Symlink(target) => (None, Some(target)),
            Payload::Regular(hash) => (None, Some(hash)),
        };
        Self {
            ino: inode.ino,
            mode: inode.mode,
            size: inode.size,
            dirents,
            value,
        }
    }
}

impl TryFrom<InodeRepr> for Inode {
    type Error = DocumentError;

    fn try_from(repr: InodeRepr) -> Result<Self, DocumentError> {
        let payload = match repr.mode & libc::S_IFMT {
            libc::S_IFDIR => Payload::Directory(
                repr.dirents
                    .ok_or(DocumentError::MissingDirents(repr.ino))?,
            ),
            libc::S_IFLNK => {
                Payload::Symlink(repr.value.ok_or(DocumentError::MissingValue(repr.ino))?)
            }
            libc::S_IFREG => {
                Payload::Regular(repr.value.ok_or(DocumentError::MissingValue(repr.ino))?)
            }
            _ => {
                return Err(DocumentError::UnsupportedFileType {
                    ino: repr.ino,
                    mode: repr.mode,
                })
            }
        };
        Ok(Self {
            ino: repr.ino,
            mode: repr.mode,
            size: repr.size,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_exclusivity() {
        for mode in [
            libc::S_IFREG | 0o644,
            libc::S_IFDIR | 0o755,
            libc::S_IFLNK | 0o777,
        ] {
            let inode = Inode::new(7, mode);
            let kinds = [inode.is_reg(), inode.is_dir(), inode.is_lnk()];
            assert_eq!(kinds.iter().filter(|k| **k).count(), 1);
        }
    }

    #[test]
    fn test_payload_matches_mode() {
        let dir = Inode::new(1, libc::S_IFDIR | 0o755);
        assert!(dir.dirents().is_empty());

        let reg = Inode::new(2, libc::S_IFREG | 0o644);
        assert_eq!(reg.blob_hash(), "");

        let lnk = Inode::new(3, libc::S_IFLNK | 0o777);
        assert_eq!(lnk.readlink(), "");
    }

    #[test]
    #[should_panic(expected = "unsupported file type")]
    fn test_bad_mode_panics() {
        Inode::new(4, libc::S_IFSOCK | 0o644);
    }

    #[test]
    fn test_document_shape() {
        let mut dir = Inode::new(1, libc::S_IFDIR | 0o755);
        dir.dirents_mut().insert("foo".to_owned(), 2);
        let json = serde_json::to_value(&dir).unwrap();
        assert_eq!(json["dirents"]["foo"], 2);
        assert!(json.get("value").is_none());

        let mut reg = Inode::new(2, libc::S_IFREG | 0o644);
        reg.set_content("cafe".to_owned(), 4);
        let json = serde_json::to_value(&reg).unwrap();
        assert_eq!(json["value"], "cafe");
        assert_eq!(json["size"], 4);
        assert!(json.get("dirents").is_none());
    }

    #[test]
    fn test_rejects_mismatched_payload() {
        // A directory without dirents must not deserialize.
        let doc = r#"{"ino": 1, "mode": 16877, "size": 0, "value": "x"}"#;
        assert!(serde_json::from_str::<Inode>(doc).is_err());

        // A regular file without a value must not deserialize.
        let doc = r#"{"ino": 2, "mode": 33188, "size": 0}"#;
        assert!(serde_json::from_str::<Inode>(doc).is_err());
    }
}
