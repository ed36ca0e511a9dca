//! The local pool of content-addressed blobs.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::fetcher::Fetcher;

/// A flat directory of blobs named by their content hash, backed by a
/// fetcher for blobs that are not yet local.
pub struct Pool {
    root: PathBuf,
    fetcher: Fetcher,
}

impl Pool {
    /// Creates a pool rooted at `root`, falling back to `fetcher` for
    /// missing blobs.
    pub fn new(root: impl Into<PathBuf>, fetcher: Fetcher) -> Self {
        Self {
            root: root.into(),
            fetcher,
        }
    }

    /// Path of the blob named `hash`.
    pub fn blob_path(&self, hash: &str) -> PathBuf {
        self.root.join(hash)
    }

    /// Opens the blob named `hash` with the caller's open flags.
    ///
    /// `O_NOFOLLOW` is stripped: the pool layout contains no symlinks and
    /// some underlying filesystems reject the flag. When the first open
    /// fails, the fetcher is asked to materialise the blob and the open is
    /// retried exactly once; persistent failure reports the original errno.
    pub fn open_blob(&self, hash: &str, flags: i32) -> io::Result<File> {
        let path = self.blob_path(hash);
        match open_with_flags(&path, flags) {
            Ok(file) => Ok(file),
            Err(err) => {
                debug!(hash = hash, error = %err, "blob not in pool, fetching");
                if self.fetcher.fetch(hash) {
                    open_with_flags(&path, flags)
                } else {
                    Err(err)
                }
            }
        }
    }
}

fn open_with_flags(path: &Path, flags: i32) -> io::Result<File> {
    let flags = flags & !libc::O_NOFOLLOW;
    let mut options = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => options.write(true),
        libc::O_RDWR => options.read(true).write(true),
        _ => options.read(true),
    };
    options.custom_flags(flags & !libc::O_ACCMODE);
    options.open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn dead_fetcher() -> Fetcher {
        Fetcher::new("unix:/nonexistent/fetcher.sock")
    }

    #[test]
    fn test_open_present_blob() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("cafebabe"), b"blob bytes").unwrap();

        let pool = Pool::new(dir.path(), dead_fetcher());
        let mut file = pool.open_blob("cafebabe", libc::O_RDONLY).unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "blob bytes");
    }

    #[test]
    fn test_missing_blob_reports_errno() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = Pool::new(dir.path(), dead_fetcher());
        let err = pool.open_blob("cafebabe", libc::O_RDONLY).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn test_nofollow_is_stripped() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("feed"), b"x").unwrap();

        let pool = Pool::new(dir.path(), dead_fetcher());
        pool.open_blob("feed", libc::O_RDONLY | libc::O_NOFOLLOW)
            .unwrap();
    }
}
