//! Core identifier types for the transaction engine.

use std::fmt;

/// Unique identifier for a transaction.
///
/// Handed out by the coordinator, monotonically increasing and never
/// reused while the coordinator lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Version number of the dataset.
///
/// Bumped once per committed write transaction. A transaction reads the
/// dataset as of the version current when it began.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(pub u64);

impl Version {
    /// The version of a dataset before any write has committed.
    pub const ZERO: Version = Version(0);

    /// Creates a new version.
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    /// Returns the raw version value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next version.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Identifier of a storage component within the journal.
///
/// Every frame records which component its payload belongs to.
/// [`FileRef::JOURNAL`] is reserved for control frames (the commit
/// marker); real components are assigned ids from 1 by the dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileRef(pub u32);

impl FileRef {
    /// Reserved ref for frames that belong to the journal itself.
    pub const JOURNAL: FileRef = FileRef(0);

    /// Creates a new file ref.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ref value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file:{}", self.0)
    }
}

/// Identifier of a fixed-size block within a block store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

impl BlockId {
    /// Creates a new block ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blk:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_id_ordering() {
        assert!(TransactionId::new(1) < TransactionId::new(2));
    }

    #[test]
    fn version_next() {
        assert_eq!(Version::ZERO.next(), Version::new(1));
    }

    #[test]
    fn journal_file_ref_is_reserved_zero() {
        assert_eq!(FileRef::JOURNAL.as_u32(), 0);
    }

    #[test]
    fn block_id_display() {
        assert_eq!(format!("{}", BlockId::new(7)), "blk:7");
    }
}
