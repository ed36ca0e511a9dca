//! Descriptor-backed reply buffers.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use fuser::ReplyData;

/// A region of an open blob descriptor, handed to the reply layer.
///
/// The adapter never reads file content into its own buffers; it describes
/// where the bytes live and the transfer happens when the reply is posted,
/// straight from the pool descriptor.
#[derive(Debug)]
pub struct FdBuf<'a> {
    file: &'a File,
    offset: u64,
    len: usize,
}

impl<'a> FdBuf<'a> {
    /// Describes `len` bytes starting at `offset` of `file`.
    pub fn new(file: &'a File, offset: u64, len: usize) -> Self {
        Self { file, offset, len }
    }

    /// Materialises the region for a transport that needs contiguous
    /// memory, shortened at end-of-file.
    pub fn copy_to_vec(&self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; self.len];
        let filled = read_full_at(self.file, &mut buf, self.offset)?;
        buf.truncate(filled);
        Ok(buf)
    }

    /// Posts this region as the payload of `reply`.
    pub fn send(&self, reply: ReplyData) {
        match self.copy_to_vec() {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(err.raw_os_error().unwrap_or(libc::EIO)),
        }
    }
}

/// Positional read that only stops short at end-of-file.
fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
