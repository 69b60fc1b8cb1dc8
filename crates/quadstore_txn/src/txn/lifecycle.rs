//! The transaction lifecycle contract for storage components.

use crate::error::CoreResult;
use crate::txn::transaction::Transaction;

/// Contract every storage component must satisfy to participate in a
/// transaction.
///
/// A participant instance is owned by exactly one [`Transaction`] for its
/// lifetime. Every participant that received [`begin`] receives exactly
/// one terminal sequence before the transaction is discarded: either
/// [`abort`], or [`commit_prepare`] → [`committed`] → [`enact_committed`]
/// → [`clearup_committed`].
///
/// [`begin`]: TransactionLifecycle::begin
/// [`abort`]: TransactionLifecycle::abort
/// [`commit_prepare`]: TransactionLifecycle::commit_prepare
/// [`committed`]: TransactionLifecycle::committed
/// [`enact_committed`]: TransactionLifecycle::enact_committed
/// [`clearup_committed`]: TransactionLifecycle::clearup_committed
pub trait TransactionLifecycle: Send + Sync {
    /// Called once, lazily, the first time the participant is touched by
    /// the transaction. Records whatever "before" state is needed to undo.
    fn begin(&self, txn: &Transaction) -> CoreResult<()>;

    /// Makes all effects of this transaction on this participant
    /// unobservable. Safe to call even if no writes occurred.
    fn abort(&self, txn: &Transaction) -> CoreResult<()>;

    /// Makes pending changes crash-durable without mutating shared state.
    ///
    /// The transaction must still be abortable after this returns, right
    /// up until the commit marker is durably written.
    fn commit_prepare(&self, txn: &Transaction) -> CoreResult<()>;

    /// Acknowledgement after the commit marker is durable.
    ///
    /// Side effects here are bookkeeping only; the caller never turns a
    /// failure here into an abort, because the transaction has committed.
    fn committed(&self, txn: &Transaction) -> CoreResult<()>;

    /// Propagates the prepared changes into the base state, making them
    /// visible beyond this transaction. May run outside the transaction's
    /// critical section, batched with other transactions' enactment.
    fn enact_committed(&self, txn: &Transaction) -> CoreResult<()>;

    /// Releases transaction-local resources once enactment is final.
    fn clearup_committed(&self, txn: &Transaction) -> CoreResult<()>;
}
