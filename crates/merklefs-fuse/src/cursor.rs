//! Per-open directory cursors.

use merklefs_meta::{Dirents, Ino};

/// One directory entry as seen through a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Component name.
    pub name: String,
    /// Child inode number.
    pub ino: Ino,
}

/// Traversal state owned by one opendir handle.
///
/// The entry order is fixed when the cursor is created and the logical
/// offset advances once per step, so the `(offset, entry)` mapping is a
/// deterministic function of that order for the lifetime of the handle.
/// Seeking backward rewinds to the start and re-advances.
pub struct DirCursor {
    entries: Vec<DirEntry>,
    offset: usize,
}

impl DirCursor {
    /// Captures the entries of `dirents` in the order served to the kernel.
    pub fn new(dirents: &Dirents) -> Self {
        let entries = dirents
            .iter()
            .map(|(name, &ino)| DirEntry {
                name: name.clone(),
                ino,
            })
            .collect();
        Self { entries, offset: 0 }
    }

    /// Current logical offset.
    pub fn offset(&self) -> i64 {
        self.offset as i64
    }

    /// Offset of the entry after the current one: the kernel's resume
    /// point when the current entry is the last to fit in a reply.
    pub fn next_offset(&self) -> i64 {
        (self.offset + 1) as i64
    }

    /// The entry at the current offset, if any remain.
    pub fn peek(&self) -> Option<&DirEntry> {
        self.entries.get(self.offset)
    }

    /// Steps over the current entry. Returns false once exhausted.
    pub fn advance(&mut self) -> bool {
        if self.offset < self.entries.len() {
            self.offset += 1;
            true
        } else {
            false
        }
    }

    /// Positions the cursor at `offset`, rewinding first when the target
    /// lies behind the current position.
    pub fn seek(&mut self, offset: i64) {
        let target = offset.max(0) as usize;
        if target < self.offset {
            self.offset = 0;
        }
        while self.offset < target && self.advance() {}
    }
}
