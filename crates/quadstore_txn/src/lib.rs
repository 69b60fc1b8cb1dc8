//! # quadstore transaction engine
//!
//! The single-writer, multi-reader write-ahead-log transaction engine of
//! quadstore. It gives the storage layer crash-consistent, all-or-nothing
//! updates: a crash at any byte boundary during a commit leaves the
//! on-disk state either fully pre-commit or fully post-commit, while
//! readers concurrent with the writer keep a consistent snapshot.
//!
//! The pieces, bottom up:
//!
//! - [`Journal`] - append-only log of checksummed frames with a
//!   truncation-based undo bracket around every write cycle
//! - [`TransactionLifecycle`] - the six-operation contract storage
//!   components implement to participate in a transaction
//! - [`TransObjectFile`] / [`TransBlockStore`] - the participants backing
//!   the node file and the index blocks
//! - [`Transaction`] - the commit/abort state machine; one durable commit
//!   marker is the linearization point of every write
//! - [`TransactionCoordinator`] - version handout, single-writer
//!   admission, enactment of committed changes
//! - [`DatasetTxn`] - the transaction-scoped view the query and update
//!   layers consume
//!
//! ```no_run
//! use quadstore_txn::{Config, Dataset, TransactionCoordinator, TxnMode};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # fn main() -> quadstore_txn::CoreResult<()> {
//! let dataset = Arc::new(Dataset::open(Path::new("my_ds"), Config::default())?);
//! let coord = TransactionCoordinator::new(dataset);
//!
//! let writer = coord.begin(TxnMode::Write)?;
//! let offset = writer.insert_node(b"<http://example/s>")?;
//! writer.commit()?;
//! writer.end()?;
//!
//! let reader = coord.begin(TxnMode::Read)?;
//! assert_eq!(reader.read_node(offset)?, b"<http://example/s>");
//! reader.end()?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod block;
mod config;
mod dataset;
mod dir;
mod error;
mod journal;
mod objfile;
mod recovery;
mod txn;
mod types;

#[cfg(test)]
mod testutil;

pub use block::{BlockStore, TransBlockStore};
pub use config::Config;
pub use dataset::Dataset;
pub use dir::DatasetDir;
pub use error::{CoreError, CoreResult};
pub use journal::{Frame, FrameType, Frames, Journal, FRAME_HEADER_SIZE};
pub use objfile::{ObjectFile, TransObjectFile};
pub use recovery::{recover, RecoveryStats};
pub use txn::{
    CancelToken, CoordinatorStats, DatasetTxn, Transaction, TransactionCoordinator,
    TransactionLifecycle, TxnMode, TxnOutcome, TxnState,
};
pub use types::{BlockId, FileRef, TransactionId, Version};
