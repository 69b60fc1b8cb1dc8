//! Append-only object files and their transactional wrapper.
//!
//! An object file stores variable-length records (serialized RDF terms)
//! addressed by the offset at which they were appended. Records are never
//! rewritten; a reader can only reach a record through an offset handed
//! out at append time, so trailing garbage beyond the committed length is
//! harmless and tolerated on reopen.

use crate::error::{CoreError, CoreResult};
use crate::txn::TransactionLifecycle;
use crate::txn::Transaction;
use crate::types::FileRef;
use parking_lot::Mutex;
use quadstore_storage::StorageBackend;
use std::sync::Arc;
use tracing::debug;

/// Length prefix in front of every record.
const LEN_PREFIX: usize = 4;

/// An append-only file of length-prefixed records.
pub struct ObjectFile {
    backend: Mutex<Box<dyn StorageBackend>>,
}

impl ObjectFile {
    /// Opens an object file over `backend`.
    pub fn open(backend: Box<dyn StorageBackend>) -> Self {
        Self {
            backend: Mutex::new(backend),
        }
    }

    /// Appends a record, returning the offset that addresses it.
    ///
    /// # Errors
    ///
    /// Returns an error if the record exceeds the 4-byte length prefix or
    /// on I/O failure.
    pub fn append_record(&self, bytes: &[u8]) -> CoreResult<u64> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| CoreError::invalid_operation("object record too large"))?;
        let mut backend = self.backend.lock();
        let offset = backend.append(&len.to_be_bytes())?;
        backend.append(bytes)?;
        Ok(offset)
    }

    /// Reads the record starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the offset does not address a record
    /// that fits within the file.
    pub fn read_record(&self, offset: u64) -> CoreResult<Vec<u8>> {
        let backend = self.backend.lock();
        let size = backend.size()?;
        let prefix = backend.read_at(offset, LEN_PREFIX).map_err(|_| {
            CoreError::journal_corruption(format!("no object record at offset {offset}"))
        })?;
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as u64;
        if offset + LEN_PREFIX as u64 + len > size {
            return Err(CoreError::journal_corruption(format!(
                "object record at offset {offset} overruns the file"
            )));
        }
        Ok(backend.read_at(offset + LEN_PREFIX as u64, len as usize)?)
    }

    /// Returns the current file length.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn length(&self) -> CoreResult<u64> {
        Ok(self.backend.lock().size()?)
    }

    /// Truncates the file back to `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn truncate(&self, len: u64) -> CoreResult<()> {
        self.backend.lock().truncate(len)?;
        Ok(())
    }

    /// Forces all appended records to durable media.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&self) -> CoreResult<()> {
        self.backend.lock().sync()?;
        Ok(())
    }
}

impl std::fmt::Debug for ObjectFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectFile").finish_non_exhaustive()
    }
}

/// Transactional wrapper around an [`ObjectFile`].
///
/// Appends go straight to the underlying file; the wrapper records the
/// pre-transaction length at `begin` and truncates back to it on abort.
/// `commit_prepare` syncs the file - deliberately before the journal's
/// commit marker is written, so a crash between the sync and the marker
/// leaves only unreferenced bytes at the tail, never data loss.
pub struct TransObjectFile {
    file_ref: FileRef,
    base: Arc<ObjectFile>,
    start: Mutex<Option<u64>>,
}

impl TransObjectFile {
    /// Creates a wrapper for `base` identified by `file_ref`.
    pub fn new(file_ref: FileRef, base: Arc<ObjectFile>) -> Self {
        Self {
            file_ref,
            base,
            start: Mutex::new(None),
        }
    }

    /// The journal file ref of the wrapped file.
    #[must_use]
    pub fn file_ref(&self) -> FileRef {
        self.file_ref
    }

    /// Appends a record through this transaction.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn append_record(&self, bytes: &[u8]) -> CoreResult<u64> {
        self.base.append_record(bytes)
    }

    /// Reads a record visible to this transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the offset does not address a record.
    pub fn read_record(&self, offset: u64) -> CoreResult<Vec<u8>> {
        self.base.read_record(offset)
    }
}

impl TransactionLifecycle for TransObjectFile {
    fn begin(&self, txn: &Transaction) -> CoreResult<()> {
        let len = self.base.length()?;
        debug!(txn = %txn.id(), file = %self.file_ref, start = len, "object file joins transaction");
        *self.start.lock() = Some(len);
        Ok(())
    }

    fn abort(&self, txn: &Transaction) -> CoreResult<()> {
        if let Some(start) = *self.start.lock() {
            debug!(txn = %txn.id(), file = %self.file_ref, start, "object file truncating on abort");
            self.base.truncate(start)?;
        }
        Ok(())
    }

    fn commit_prepare(&self, _txn: &Transaction) -> CoreResult<()> {
        self.base.sync()
    }

    fn committed(&self, _txn: &Transaction) -> CoreResult<()> {
        Ok(())
    }

    fn enact_committed(&self, _txn: &Transaction) -> CoreResult<()> {
        // Appends went to the shared file already; durability happened in
        // commit_prepare.
        Ok(())
    }

    fn clearup_committed(&self, _txn: &Transaction) -> CoreResult<()> {
        Ok(())
    }
}

impl std::fmt::Debug for TransObjectFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransObjectFile")
            .field("file_ref", &self.file_ref)
            .field("start", &*self.start.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quadstore_storage::MemBackend;

    #[test]
    fn append_and_read_records() {
        let file = ObjectFile::open(Box::new(MemBackend::new()));
        let a = file.append_record(b"<http://example/s>").unwrap();
        let b = file.append_record(b"literal value").unwrap();

        assert_eq!(file.read_record(a).unwrap(), b"<http://example/s>");
        assert_eq!(file.read_record(b).unwrap(), b"literal value");
    }

    #[test]
    fn read_at_bad_offset_is_an_error() {
        let file = ObjectFile::open(Box::new(MemBackend::new()));
        file.append_record(b"x").unwrap();
        assert!(file.read_record(100).is_err());
    }

    #[test]
    fn record_overrunning_file_is_corruption() {
        // A length prefix that claims more bytes than exist.
        let mut data = 100u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"short");
        let file = ObjectFile::open(Box::new(MemBackend::with_data(data)));
        assert!(matches!(
            file.read_record(0),
            Err(CoreError::JournalCorruption { .. })
        ));
    }

    #[test]
    fn truncate_discards_tail_records() {
        let file = ObjectFile::open(Box::new(MemBackend::new()));
        file.append_record(b"keep").unwrap();
        let mark = file.length().unwrap();
        let late = file.append_record(b"discard").unwrap();

        file.truncate(mark).unwrap();
        assert_eq!(file.length().unwrap(), mark);
        assert!(file.read_record(late).is_err());
    }
}
