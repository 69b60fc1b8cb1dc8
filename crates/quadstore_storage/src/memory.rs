//! In-memory storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;

/// An in-memory storage backend.
///
/// Used by unit tests and ephemeral datasets. Crash scenarios are
/// simulated by mutating the buffer directly through [`corrupt_byte`]
/// and [`chop`].
///
/// [`corrupt_byte`]: MemBackend::corrupt_byte
/// [`chop`]: MemBackend::chop
#[derive(Debug, Default)]
pub struct MemBackend {
    data: RwLock<Vec<u8>>,
}

impl MemBackend {
    /// Creates a new empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend seeded with `data`, for replay tests.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Returns a copy of the whole buffer.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Flips one bit of the byte at `offset`. Test hook.
    pub fn corrupt_byte(&self, offset: usize) {
        let mut data = self.data.write();
        if let Some(b) = data.get_mut(offset) {
            *b ^= 0x01;
        }
    }

    /// Drops all bytes from `offset` onward without going through
    /// `truncate`, imitating a torn write. Test hook.
    pub fn chop(&self, offset: usize) {
        self.data.write().truncate(offset);
    }
}

impl StorageBackend for MemBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let end = offset.saturating_add(len as u64);
        if end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        let start = offset as usize;
        Ok(data[start..start + len].to_vec())
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut buf = self.data.write();
        let offset = buf.len() as u64;
        buf.extend_from_slice(data);
        Ok(offset)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let mut buf = self.data.write();
        let end = offset as usize + data.len();
        if end > buf.len() {
            buf.resize(end, 0);
        }
        buf[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut buf = self.data.write();
        if new_size > buf.len() as u64 {
            return Err(StorageError::TruncateBeyondEnd {
                requested: new_size,
                size: buf.len() as u64,
            });
        }
        buf.truncate(new_size as usize);
        Ok(())
    }

    fn reopen(&mut self) -> StorageResult<()> {
        // Nothing to reopen; memory survives only within the process.
        Ok(())
    }
}
