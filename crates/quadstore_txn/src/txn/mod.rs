//! Transactions: lifecycle contract, state machine, coordinator, view.
//!
//! A [`TransactionCoordinator`] admits transactions to one dataset:
//! many concurrent readers, at most one writer. Storage components join a
//! write transaction as [`TransactionLifecycle`] participants the first
//! time it touches them. On commit, the [`Transaction`] drives every
//! participant through prepare, writes one durable commit marker to the
//! journal - the single linearization point - and then the coordinator
//! enacts the changes into the base dataset. On abort, participants
//! discard pending changes and on-disk artifacts are truncated back to
//! their pre-transaction length.

mod coordinator;
mod lifecycle;
mod transaction;
mod view;

pub use coordinator::{CoordinatorStats, TransactionCoordinator};
pub use lifecycle::TransactionLifecycle;
pub use transaction::{CancelToken, Transaction, TxnMode, TxnOutcome, TxnState};
pub use view::DatasetTxn;
