//! Error types for the transaction engine.

use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the transaction engine.
///
/// Transaction outcomes map onto three distinct variants so callers can
/// never mistake one severity for another:
///
/// - [`TransactionAborted`] - the transaction did **not** commit; on-disk
///   state is as it was before the transaction began.
/// - [`CommitDegraded`] - the durable commit marker **was** written; only
///   post-commit processing failed. Retrying or rolling back would corrupt
///   a durable commit.
/// - [`SystemUnstable`] - rollback itself failed; the journal state can no
///   longer be trusted and the process should stop using the dataset.
///
/// [`TransactionAborted`]: CoreError::TransactionAborted
/// [`CommitDegraded`]: CoreError::CommitDegraded
/// [`SystemUnstable`]: CoreError::SystemUnstable
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] quadstore_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The journal contains bytes that do not decode as a valid frame.
    #[error("journal corruption: {message}")]
    JournalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// A frame's stored checksum disagrees with the recomputed one.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Checksum stored in the frame.
        expected: u32,
        /// Checksum recomputed over header and payload.
        actual: u32,
    },

    /// The transaction did not commit; pre-transaction state is intact.
    #[error("transaction aborted: {reason}")]
    TransactionAborted {
        /// Reason for the abort.
        reason: String,
    },

    /// The transaction committed durably but post-commit processing failed.
    #[error("transaction committed, post-commit processing failed: {reason}")]
    CommitDegraded {
        /// Description of the failed post-commit step.
        reason: String,
    },

    /// Rollback failed during abandonment; on-disk state is untrustworthy.
    #[error("system unstable, rollback failed: {reason}")]
    SystemUnstable {
        /// Description of the rollback failure.
        reason: String,
    },

    /// Operation not permitted in the current state (caller misuse).
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// Another process holds the dataset directory lock.
    #[error("dataset locked: another process has exclusive access")]
    DatasetLocked,
}

impl CoreError {
    /// Creates a journal corruption error.
    pub fn journal_corruption(message: impl Into<String>) -> Self {
        Self::JournalCorruption {
            message: message.into(),
        }
    }

    /// Creates a transaction aborted error.
    pub fn transaction_aborted(reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
        }
    }

    /// Creates a committed-but-degraded error.
    pub fn commit_degraded(reason: impl Into<String>) -> Self {
        Self::CommitDegraded {
            reason: reason.into(),
        }
    }

    /// Creates a system unstable error.
    pub fn system_unstable(reason: impl Into<String>) -> Self {
        Self::SystemUnstable {
            reason: reason.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }
}
