//! The file interface that lazily loaded pages read their contents through.

use alloc::vec::Vec;

/// A readable file backing part of a user address space.
pub trait File: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at byte `offset`. Returns the
    /// number of bytes read, which is short only at end of file.
    fn read(&self, offset: u64, buf: &mut [u8]) -> usize;

    /// Length of the file in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A file whose contents live in kernel memory.
#[derive(Debug, Clone, Default)]
pub struct MemFile {
    data: Vec<u8>,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Self {
        MemFile { data }
    }
}

impl File for MemFile {
    fn read(&self, offset: u64, buf: &mut [u8]) -> usize {
        let Ok(start) = usize::try_from(offset) else {
            return 0;
        };
        let Some(src) = self.data.get(start..) else {
            return 0;
        };
        let n = src.len().min(buf.len());
        buf[..n].copy_from_slice(&src[..n]);
        n
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}
