//! The metadata filesystem: an inode table with name resolution.

use std::ops::Index;
use std::time::SystemTime;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::inode::{Ino, Inode, ROOT_INO};
use crate::path::segments;
use crate::{DocumentError, MetaError};

/// An in-memory tree of inodes, serialisable as a JSON array.
///
/// The table is append-only and densely numbered: the inode at index `i`
/// carries number `root + i`. Mutators are meant for pre-mount population;
/// once the filesystem serves kernel requests it is treated as immutable.
#[derive(Debug, Clone)]
pub struct FileSystem {
    root_ino: Ino,
    inodes: Vec<Inode>,
    mnt_ts: SystemTime,
}

impl FileSystem {
    /// Creates a filesystem holding a single empty root directory.
    pub fn new() -> Self {
        Self::with_root(ROOT_INO)
    }

    /// Creates a filesystem whose root carries the given inode number.
    pub fn with_root(root_ino: Ino) -> Self {
        let mut fs = Self {
            root_ino,
            inodes: Vec::new(),
            mnt_ts: SystemTime::now(),
        };
        fs.mknod(libc::S_IFDIR | 0o755);
        fs
    }

    /// Rebuilds a filesystem from the inodes of a metadata document.
    ///
    /// Validates what the serving path later relies on: a non-empty table,
    /// a directory at the root, dense numbering, and directory entries that
    /// stay inside the table.
    pub fn from_inodes(inodes: Vec<Inode>) -> Result<Self, DocumentError> {
        let root_ino = inodes.first().ok_or(DocumentError::Empty)?.ino();
        for (i, inode) in inodes.iter().enumerate() {
            let expected = root_ino + i as Ino;
            if inode.ino() != expected {
                return Err(DocumentError::OutOfSequence {
                    expected,
                    found: inode.ino(),
                });
            }
        }
        if !inodes[0].is_dir() {
            return Err(DocumentError::RootNotDirectory(root_ino));
        }
        let end = root_ino + inodes.len() as Ino;
        for inode in inodes.iter().filter(|i| i.is_dir()) {
            for (name, &child) in inode.dirents() {
                if child < root_ino || child >= end {
                    return Err(DocumentError::DanglingEntry {
                        parent: inode.ino(),
                        name: name.clone(),
                        child,
                    });
                }
            }
        }
        Ok(Self {
            root_ino,
            inodes,
            mnt_ts: SystemTime::now(),
        })
    }

    /// Inode number of the root directory.
    pub fn root_ino(&self) -> Ino {
        self.root_ino
    }

    /// Number of inodes in the table.
    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    /// Returns true when the table is empty. Never true after construction.
    pub fn is_empty(&self) -> bool {
        self.inodes.is_empty()
    }

    /// Timestamp captured at construction, reported as atime/mtime/ctime
    /// for every inode.
    pub fn mnt_ts(&self) -> SystemTime {
        self.mnt_ts
    }

    /// The inode numbered `ino`, or `None` when outside the table.
    pub fn get(&self, ino: Ino) -> Option<&Inode> {
        let index = ino.checked_sub(self.root_ino)?;
        self.inodes.get(index as usize)
    }

    fn get_mut(&mut self, ino: Ino) -> &mut Inode {
        let index = (ino - self.root_ino) as usize;
        &mut self.inodes[index]
    }

    /// Number the next allocated inode will carry.
    pub fn next_ino(&self) -> Ino {
        self.root_ino + self.inodes.len() as Ino
    }

    fn mknod(&mut self, mode: u32) -> Ino {
        let ino = self.next_ino();
        self.inodes.push(Inode::new(ino, mode));
        ino
    }

    /// Resolves `path` relative to `parent`, returning 0 when any step
    /// crosses a missing entry or a non-directory.
    ///
    /// An empty path (or bare separators) returns `parent` unchanged; the
    /// final inode may be of any type.
    pub fn lookup(&self, parent: Ino, path: &str) -> Ino {
        let mut current = parent;
        for name in segments(path) {
            if current == 0 {
                return 0;
            }
            let dir = &self[current];
            if !dir.is_dir() {
                return 0;
            }
            current = dir.dirents().get(name).copied().unwrap_or(0);
        }
        current
    }

    /// Allocates a regular inode with `mode`'s permission bits and links it
    /// at `path` under the root. Returns the new inode number.
    pub fn creat(&mut self, path: &str, mode: u32) -> Result<Ino, MetaError> {
        let ino = self.mknod(libc::S_IFREG | (mode & !libc::S_IFMT));
        self.linkat(self.root_ino, path, ino)?;
        Ok(ino)
    }

    /// Allocates a directory inode and links it at `path` under the root.
    pub fn mkdir(&mut self, path: &str, mode: u32) -> Result<Ino, MetaError> {
        let ino = self.mknod(libc::S_IFDIR | (mode & !libc::S_IFMT));
        self.linkat(self.root_ino, path, ino)?;
        Ok(ino)
    }

    /// Allocates a symlink to `target` and links it at `path` under the
    /// root. The target is stored in the payload and reported as the size.
    pub fn symlink(&mut self, target: &str, path: &str) -> Result<Ino, MetaError> {
        let ino = self.mknod(libc::S_IFLNK | 0o777);
        self.get_mut(ino).set_target(target);
        self.linkat(self.root_ino, path, ino)?;
        Ok(ino)
    }

    /// Links the inode at `oldpath` under `newpath`, then unlinks
    /// `oldpath`: rename by composition, not atomic.
    pub fn link(&mut self, oldpath: &str, newpath: &str) -> Result<(), MetaError> {
        let ino = self.lookup(self.root_ino, oldpath);
        if ino == 0 {
            return Err(MetaError::NotFound);
        }
        self.linkat(self.root_ino, newpath, ino)?;
        self.unlinkat(self.root_ino, oldpath)
    }

    /// Removes the entry named by the last component of `path` from its
    /// parent directory, resolved relative to `parent`.
    pub fn unlinkat(&mut self, parent: Ino, path: &str) -> Result<(), MetaError> {
        let mut current = parent;
        let mut walk = segments(path).peekable();
        while let Some(name) = walk.next() {
            if current == 0 {
                return Err(MetaError::NotFound);
            }
            if !self[current].is_dir() {
                return Err(MetaError::NotDirectory);
            }
            if walk.peek().is_none() {
                self.get_mut(current)
                    .dirents_mut()
                    .remove(name)
                    .ok_or(MetaError::NotFound)?;
            } else {
                current = self[current].dirents().get(name).copied().unwrap_or(0);
            }
        }
        Ok(())
    }

    /// Records the content hash and size of the regular inode `ino`.
    ///
    /// Builder-side operation: metadata documents carry the hash, so the
    /// serving path never calls this.
    pub fn set_content(&mut self, ino: Ino, hash: String, size: u64) {
        self.get_mut(ino).set_content(hash, size);
    }

    /// Links `target` under the last component of `path`, descending from
    /// `parent` through the preceding components. The final component is
    /// tracked explicitly; an existing mapping is overwritten.
    fn linkat(&mut self, parent: Ino, path: &str, target: Ino) -> Result<(), MetaError> {
        let mut current = parent;
        let mut walk = segments(path).peekable();
        while let Some(name) = walk.next() {
            if current == 0 {
                return Err(MetaError::NotFound);
            }
            if !self[current].is_dir() {
                return Err(MetaError::NotDirectory);
            }
            if walk.peek().is_none() {
                self.get_mut(current)
                    .dirents_mut()
                    .insert(name.to_owned(), target);
            } else {
                current = self[current].dirents().get(name).copied().unwrap_or(0);
            }
        }
        Ok(())
    }
}

impl Default for FileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<Ino> for FileSystem {
    type Output = Inode;

    /// Bounds-checked table access. An out-of-range number is a programmer
    /// error and panics; use [`FileSystem::get`] for fallible access.
    fn index(&self, ino: Ino) -> &Inode {
        match self.get(ino) {
            Some(inode) => inode,
            None => panic!("inode {ino} outside table"),
        }
    }
}

impl Serialize for FileSystem {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.inodes.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FileSystem {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let inodes = Vec::<Inode>::deserialize(deserializer)?;
        FileSystem::from_inodes(inodes).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> FileSystem {
        let mut fs = FileSystem::new();
        assert_eq!(fs.creat("/foo", 0o644).unwrap(), 2);
        assert_eq!(fs.mkdir("/bar", 0o755).unwrap(), 3);
        assert_eq!(fs.creat("/bar/baz", 0o644).unwrap(), 4);
        fs
    }

    #[test]
    fn test_creat_mkdir_lookup() {
        let fs = populated();
        assert_eq!(fs.lookup(1, "/foo"), 2);
        assert_eq!(fs.lookup(1, "/bar"), 3);
        assert_eq!(fs.lookup(1, "/bar/baz"), 4);
        assert_eq!(fs.lookup(1, "hi"), 0);
    }

    #[test]
    fn test_lookup_empty_path_is_parent() {
        let fs = populated();
        assert_eq!(fs.lookup(1, ""), 1);
        assert_eq!(fs.lookup(1, "/"), 1);
        assert_eq!(fs.lookup(3, ""), 3);
    }

    #[test]
    fn test_lookup_through_non_directory() {
        let fs = populated();
        // foo is a regular file; descending through it fails quietly.
        assert_eq!(fs.lookup(1, "/foo/whatever"), 0);
        // ...and a missing intermediate stops at zero instead of panicking.
        assert_eq!(fs.lookup(1, "/gone/whatever"), 0);
    }

    #[test]
    fn test_lookup_composability() {
        let fs = populated();
        assert_eq!(
            fs.lookup(1, "bar/baz"),
            fs.lookup(fs.lookup(1, "bar"), "baz")
        );
    }

    #[test]
    fn test_unlink() {
        let mut fs = populated();
        fs.unlinkat(1, "/foo").unwrap();
        assert_eq!(fs.lookup(1, "/foo"), 0);
        let err = fs.unlinkat(1, "/foo").unwrap_err();
        assert_eq!(err, MetaError::NotFound);
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[test]
    fn test_unlink_through_file_is_enotdir() {
        let mut fs = populated();
        assert_eq!(
            fs.unlinkat(1, "/foo/x").unwrap_err(),
            MetaError::NotDirectory
        );
    }

    #[test]
    fn test_link_as_rename() {
        let mut fs = populated();
        fs.unlinkat(1, "/foo").unwrap();
        fs.link("/bar/baz", "/hi").unwrap();
        assert_eq!(fs.lookup(1, "/hi"), 4);
        assert_eq!(fs.lookup(1, "/bar/baz"), 0);
    }

    #[test]
    fn test_link_missing_source() {
        let mut fs = populated();
        assert_eq!(fs.link("/nope", "/hi").unwrap_err(), MetaError::NotFound);
    }

    #[test]
    fn test_overwriting_link() {
        let mut fs = populated();
        let replacement = fs.creat("/foo", 0o600).unwrap();
        assert_eq!(fs.lookup(1, "/foo"), replacement);
    }

    #[test]
    fn test_dense_numbering() {
        let fs = populated();
        let numbers: Vec<_> = (0..fs.len() as Ino).map(|i| fs[1 + i].ino()).collect();
        assert_eq!(numbers, [1, 2, 3, 4]);
        assert_eq!(fs.next_ino(), 5);
    }

    #[test]
    fn test_symlink_payload_and_size() {
        let mut fs = FileSystem::new();
        let ino = fs.symlink("/usr/bin", "/link").unwrap();
        assert_eq!(fs.lookup(1, "link"), ino);
        assert!(fs[ino].is_lnk());
        assert_eq!(fs[ino].readlink(), "/usr/bin");
        assert_eq!(fs[ino].size(), 8);
    }

    #[test]
    fn test_serialisation_round_trip() {
        let mut fs = populated();
        fs.set_content(4, "deadbeef".to_owned(), 9);
        fs.symlink("bar/baz", "/lnk").unwrap();

        let doc = serde_json::to_string(&fs).unwrap();
        let copy: FileSystem = serde_json::from_str(&doc).unwrap();

        assert_eq!(copy.root_ino(), fs.root_ino());
        assert_eq!(copy.len(), fs.len());
        for path in ["/foo", "/bar", "/bar/baz", "/lnk", "missing"] {
            assert_eq!(copy.lookup(1, path), fs.lookup(1, path));
        }
        assert_eq!(copy[4].blob_hash(), "deadbeef");
        assert_eq!(copy[4].size(), 9);
        assert_eq!(copy[5].readlink(), "bar/baz");
        assert_eq!(copy[3].dirents(), fs[3].dirents());
    }

    #[test]
    fn test_rejects_sparse_document() {
        let doc = r#"[
            {"ino": 1, "mode": 16877, "size": 0, "dirents": {}},
            {"ino": 3, "mode": 33188, "size": 0, "value": ""}
        ]"#;
        assert!(serde_json::from_str::<FileSystem>(doc).is_err());
    }

    #[test]
    fn test_rejects_dangling_entry() {
        let doc = r#"[
            {"ino": 1, "mode": 16877, "size": 0, "dirents": {"ghost": 9}}
        ]"#;
        assert!(serde_json::from_str::<FileSystem>(doc).is_err());
    }

    #[test]
    fn test_rejects_empty_document() {
        assert!(serde_json::from_str::<FileSystem>("[]").is_err());
    }
}
