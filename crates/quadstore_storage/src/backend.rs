//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level byte store used by the quadstore engine.
///
/// Backends are **opaque byte stores**. They provide reads at arbitrary
/// offsets, appends at the end, in-place overwrites, truncation, and
/// durability barriers. The engine owns all format interpretation -
/// backends do not understand journal frames, object records, or blocks.
///
/// # Invariants
///
/// - `append` returns the offset where the data landed
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `sync` makes all prior writes durable across process and OS crashes
/// - implementations must be `Send + Sync`
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ReadPastEnd`] if any part of the range lies
    /// beyond the current size, or an I/O error.
    ///
    /// [`StorageError::ReadPastEnd`]: crate::StorageError::ReadPastEnd
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends data at the end of the storage.
    ///
    /// Returns the offset where the data was written.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Overwrites bytes in place at `offset`, extending the storage if the
    /// range ends beyond the current size.
    ///
    /// Used for enacting block images at their fixed positions.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Flushes buffered writes towards the OS.
    ///
    /// This is a weaker barrier than [`sync`](Self::sync): data may still
    /// sit in the OS page cache afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Forces all data and metadata to durable media (fsync-equivalent).
    ///
    /// After this returns, all previously written data survives a crash.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Returns the current size of the storage in bytes.
    ///
    /// This is the offset at which the next `append` will write.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Truncates the storage to exactly `new_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::TruncateBeyondEnd`] if `new_size` exceeds
    /// the current size, or an I/O error.
    ///
    /// [`StorageError::TruncateBeyondEnd`]: crate::StorageError::TruncateBeyondEnd
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Re-establishes the underlying handle after an uncontrolled close.
    ///
    /// A file backend reopens its file by path and re-reads the size; the
    /// in-memory backend has nothing to reopen and succeeds trivially.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle cannot be re-established.
    fn reopen(&mut self) -> StorageResult<()>;
}
