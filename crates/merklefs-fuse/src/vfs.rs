//! Low-level kernel callbacks over the metadata tree and the blob pool.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::File;
use std::time::UNIX_EPOCH;

use fuser::{
    consts, FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEmpty, ReplyEntry, ReplyOpen, Request,
};
use tracing::debug;

use merklefs_meta::{FileSystem, Ino, Inode, Payload};
use merklefs_pool::Pool;

use crate::buf::FdBuf;
use crate::cursor::DirCursor;
use crate::mount::MountOpts;

/// Block size reported for every inode.
const BLKSIZE: u32 = 4096;

/// The kernel-protocol adapter.
///
/// Owns the immutable metadata tree, the pool, and all per-open state:
/// directory cursors keyed by handle, and one pool descriptor per open
/// regular file. Handle numbers are private to the kernel session and
/// unrelated to inode numbers.
pub struct MerkleFs {
    meta: FileSystem,
    pool: Pool,
    opts: MountOpts,
    dirs: HashMap<u64, DirCursor>,
    files: HashMap<u64, File>,
    next_fh: u64,
}

impl MerkleFs {
    /// Creates an adapter serving `meta`, with file contents from `pool`.
    pub fn new(meta: FileSystem, pool: Pool, opts: MountOpts) -> Self {
        Self {
            meta,
            pool,
            opts,
            dirs: HashMap::new(),
            files: HashMap::new(),
            next_fh: 1,
        }
    }

    fn alloc_fh(&mut self) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        fh
    }
}

/// Stat attributes for `inode`, timestamped with the mount instant.
fn attr_for(meta: &FileSystem, opts: &MountOpts, inode: &Inode) -> FileAttr {
    let mnt_ts = meta.mnt_ts();
    FileAttr {
        ino: inode.ino(),
        size: inode.size(),
        blocks: (inode.size() + 511) / 512,
        atime: mnt_ts,
        mtime: mnt_ts,
        ctime: mnt_ts,
        crtime: mnt_ts,
        kind: file_type(inode.mode()),
        perm: (inode.mode() & 0o7777) as u16,
        nlink: 1,
        uid: opts.uid,
        gid: opts.gid,
        rdev: 0,
        blksize: BLKSIZE,
        flags: 0,
    }
}

/// Attributes of a negative dentry: a success reply whose inode field is
/// zero, cacheable by the kernel like any other entry.
fn negative_attr() -> FileAttr {
    FileAttr {
        ino: 0,
        size: 0,
        blocks: 0,
        atime: UNIX_EPOCH,
        mtime: UNIX_EPOCH,
        ctime: UNIX_EPOCH,
        crtime: UNIX_EPOCH,
        kind: FileType::RegularFile,
        perm: 0,
        nlink: 0,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 0,
        flags: 0,
    }
}

fn file_type(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        _ => FileType::RegularFile,
    }
}

/// Open flags as passed to the pool.
///
/// Under writeback caching the kernel may issue reads against handles the
/// application opened write-only, and handles `O_APPEND` itself; the tree
/// is immutable underneath, so widening the access mode is safe.
fn adjust_open_flags(mut flags: i32, cache: bool) -> i32 {
    if cache {
        if flags & libc::O_ACCMODE == libc::O_WRONLY {
            flags = (flags & !libc::O_ACCMODE) | libc::O_RDWR;
        }
        flags &= !libc::O_APPEND;
    }
    flags
}

fn errno_of(err: &std::io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}

impl Filesystem for MerkleFs {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), libc::c_int> {
        let mut caps = vec![consts::FUSE_EXPORT_SUPPORT, consts::FUSE_FLOCK_LOCKS];
        if self.opts.cache() {
            caps.push(consts::FUSE_WRITEBACK_CACHE);
        }
        if !self.opts.nosplice {
            caps.push(consts::FUSE_SPLICE_READ);
            caps.push(consts::FUSE_SPLICE_WRITE);
        }
        for cap in caps {
            if config.add_capabilities(cap).is_err() {
                debug!(cap = cap, "kernel does not offer capability");
            }
        }
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name.to_string_lossy();
        debug!(parent = parent, name = %name, "lookup");

        let ino = self.meta.lookup(parent, &name);
        if ino == 0 {
            reply.entry(&self.opts.timeout, &negative_attr(), 0);
        } else {
            let attr = attr_for(&self.meta, &self.opts, &self.meta[ino]);
            reply.entry(&self.opts.timeout, &attr, 0);
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        debug!(ino = ino, "getattr");

        if ino == 0 {
            reply.error(libc::ENOENT);
            return;
        }
        let attr = attr_for(&self.meta, &self.opts, &self.meta[ino]);
        reply.attr(&self.opts.timeout, &attr);
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        debug!(ino = ino, "readlink");

        match self.meta[ino].payload() {
            Payload::Symlink(target) => reply.data(target.as_bytes()),
            _ => reply.error(libc::EINVAL),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        debug!(ino = ino, "opendir");

        let inode = &self.meta[ino];
        if !inode.is_dir() {
            reply.error(libc::ENOTDIR);
            return;
        }
        let cursor = DirCursor::new(inode.dirents());
        let fh = self.alloc_fh();
        self.dirs.insert(fh, cursor);

        let mut flags = 0;
        if self.opts.cache() {
            flags |= consts::FOPEN_KEEP_CACHE | consts::FOPEN_CACHE_DIR;
        }
        reply.opened(fh, flags);
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, offset: i64, mut reply: ReplyDirectory) {
        debug!(ino = ino, fh = fh, offset = offset, "readdir");

        let Some(cursor) = self.dirs.get_mut(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        cursor.seek(offset);

        let mut buffered = 0;
        while let Some(entry) = cursor.peek() {
            if entry.name == "." || entry.name == ".." {
                cursor.advance();
                continue;
            }
            // A dangling entry is reportable only while the buffer is
            // still empty; afterwards the partial buffer wins.
            let Some(child) = self.meta.get(entry.ino) else {
                if buffered == 0 {
                    reply.error(libc::ENOENT);
                    return;
                }
                break;
            };
            if reply.add(
                child.ino(),
                cursor.next_offset(),
                file_type(child.mode()),
                entry.name.as_str(),
            ) {
                break;
            }
            buffered += 1;
            cursor.advance();
        }
        debug!(fh = fh, buffered = buffered, "readdir reply");
        reply.ok();
    }

    fn readdirplus(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectoryPlus,
    ) {
        debug!(ino = ino, fh = fh, offset = offset, "readdirplus");

        let Some(cursor) = self.dirs.get_mut(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        cursor.seek(offset);

        let mut buffered = 0;
        while let Some(entry) = cursor.peek() {
            if entry.name == "." || entry.name == ".." {
                cursor.advance();
                continue;
            }
            let child: Ino = self.meta.lookup(ino, &entry.name);
            if child == 0 {
                if buffered == 0 {
                    reply.error(libc::ENOENT);
                    return;
                }
                break;
            }
            let attr = attr_for(&self.meta, &self.opts, &self.meta[child]);
            if reply.add(
                child,
                cursor.next_offset(),
                entry.name.as_str(),
                &self.opts.timeout,
                &attr,
                0,
            ) {
                break;
            }
            buffered += 1;
            cursor.advance();
        }
        debug!(fh = fh, buffered = buffered, "readdirplus reply");
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        debug!(ino = ino, fh = fh, "releasedir");

        self.dirs.remove(&fh);
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!(ino = ino, flags = flags, "open");

        let inode = &self.meta[ino];
        if inode.is_dir() {
            reply.error(libc::EISDIR);
            return;
        }
        if !inode.is_reg() {
            reply.error(libc::EINVAL);
            return;
        }

        let flags = adjust_open_flags(flags, self.opts.cache());
        match self.pool.open_blob(inode.blob_hash(), flags) {
            Ok(file) => {
                let fh = self.alloc_fh();
                self.files.insert(fh, file);
                let open_flags = if self.opts.cache() {
                    consts::FOPEN_KEEP_CACHE
                } else {
                    0
                };
                reply.opened(fh, open_flags);
            }
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!(ino = ino, fh = fh, offset = offset, size = size, "read");

        match self.files.get(&fh) {
            Some(file) => FdBuf::new(file, offset.max(0) as u64, size as usize).send(reply),
            None => reply.error(libc::EBADF),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!(ino = ino, fh = fh, "release");

        self.files.remove(&fh);
        reply.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> FileSystem {
        let mut fs = FileSystem::new();
        let foo = fs.creat("/foo", 0o644).unwrap();
        fs.set_content(foo, "cafebabe".to_owned(), 1025);
        fs.symlink("foo", "/lnk").unwrap();
        fs
    }

    #[test]
    fn test_attr_fields() {
        let meta = sample_meta();
        let opts = MountOpts {
            uid: 42,
            gid: 43,
            ..MountOpts::default()
        };

        let attr = attr_for(&meta, &opts, &meta[2]);
        assert_eq!(attr.ino, 2);
        assert_eq!(attr.size, 1025);
        assert_eq!(attr.blocks, 3);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, 0o644);
        assert_eq!(attr.nlink, 1);
        assert_eq!(attr.uid, 42);
        assert_eq!(attr.gid, 43);
        assert_eq!(attr.blksize, BLKSIZE);
        assert_eq!(attr.mtime, meta.mnt_ts());
        assert_eq!(attr.atime, meta.mnt_ts());
        assert_eq!(attr.ctime, meta.mnt_ts());
    }

    #[test]
    fn test_attr_kind_per_type() {
        let meta = sample_meta();
        let opts = MountOpts::default();
        assert_eq!(attr_for(&meta, &opts, &meta[1]).kind, FileType::Directory);
        assert_eq!(attr_for(&meta, &opts, &meta[3]).kind, FileType::Symlink);
    }

    #[test]
    fn test_negative_attr_is_zeroed() {
        let attr = negative_attr();
        assert_eq!(attr.ino, 0);
        assert_eq!(attr.size, 0);
        assert_eq!(attr.nlink, 0);
    }

    #[test]
    fn test_open_flag_promotion_under_cache() {
        let flags = libc::O_WRONLY | libc::O_APPEND;
        let adjusted = adjust_open_flags(flags, true);
        assert_eq!(adjusted & libc::O_ACCMODE, libc::O_RDWR);
        assert_eq!(adjusted & libc::O_APPEND, 0);
    }

    #[test]
    fn test_open_flags_untouched_without_cache() {
        let flags = libc::O_WRONLY | libc::O_APPEND;
        assert_eq!(adjust_open_flags(flags, false), flags);
    }
}
