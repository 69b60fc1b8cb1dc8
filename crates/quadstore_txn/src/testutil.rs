//! Test doubles for fault injection.

use parking_lot::Mutex;
use quadstore_storage::{MemBackend, StorageBackend, StorageResult};
use std::io;
use std::sync::Arc;

/// Shared knob arming the next failure of a [`FlakyBackend`].
#[derive(Clone, Default)]
pub(crate) struct FailureControl {
    next_sync_failure: Arc<Mutex<Option<io::ErrorKind>>>,
}

impl FailureControl {
    /// Makes the backend's next `sync` fail once with `kind`.
    pub(crate) fn fail_next_sync(&self, kind: io::ErrorKind) {
        *self.next_sync_failure.lock() = Some(kind);
    }
}

/// An in-memory backend whose `sync` can be told to fail on demand.
///
/// Used to simulate an I/O exception at the commit-marker durability
/// point: the journal only syncs when a write cycle commits, so "fail the
/// next sync" strikes exactly there.
pub(crate) struct FlakyBackend {
    inner: MemBackend,
    control: FailureControl,
}

impl FlakyBackend {
    pub(crate) fn new(control: FailureControl) -> Self {
        Self {
            inner: MemBackend::new(),
            control,
        }
    }
}

impl StorageBackend for FlakyBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        self.inner.append(data)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        self.inner.write_at(offset, data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.flush()
    }

    fn sync(&mut self) -> StorageResult<()> {
        if let Some(kind) = self.control.next_sync_failure.lock().take() {
            return Err(io::Error::new(kind, "injected sync failure").into());
        }
        self.inner.sync()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }

    fn reopen(&mut self) -> StorageResult<()> {
        self.inner.reopen()
    }
}
