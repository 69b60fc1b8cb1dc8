//! Transaction-scoped dataset view.

use crate::error::{CoreError, CoreResult};
use crate::txn::transaction::{Transaction, TxnMode, TxnState};
use crate::types::BlockId;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

/// The dataset as seen by exactly one transaction.
///
/// This is the handle the query and update layers work against. It owns
/// nothing beyond the back-reference to its transaction; its lifetime is
/// the transaction's. `commit`, `abort` and `end` delegate to the
/// transaction; `end` additionally severs the back-reference so the view
/// cannot be reused once the transaction is gone.
pub struct DatasetTxn {
    txn: Mutex<Option<Arc<Transaction>>>,
}

impl DatasetTxn {
    pub(crate) fn new(txn: Arc<Transaction>) -> Self {
        Self {
            txn: Mutex::new(Some(txn)),
        }
    }

    /// Returns the bound transaction.
    ///
    /// # Errors
    ///
    /// Returns a misuse error once `end()` has run.
    pub fn transaction(&self) -> CoreResult<Arc<Transaction>> {
        self.txn
            .lock()
            .clone()
            .ok_or_else(|| CoreError::invalid_operation("view is no longer bound to a transaction"))
    }

    /// A view represents exactly one transaction; it cannot be re-begun.
    ///
    /// # Errors
    ///
    /// Always returns a misuse error.
    pub fn begin(&self) -> CoreResult<()> {
        Err(CoreError::invalid_operation(
            "view is already bound to a transaction",
        ))
    }

    /// Returns the transaction mode.
    ///
    /// # Errors
    ///
    /// Returns a misuse error once `end()` has run.
    pub fn mode(&self) -> CoreResult<TxnMode> {
        Ok(self.transaction()?.mode())
    }

    // ---- Node (object file) access

    /// Appends a serialized node record, returning its offset.
    ///
    /// # Errors
    ///
    /// Returns a misuse error on a read transaction.
    pub fn insert_node(&self, bytes: &[u8]) -> CoreResult<u64> {
        self.transaction()?.node_file()?.append_record(bytes)
    }

    /// Reads the node record at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the offset does not address a record.
    pub fn read_node(&self, offset: u64) -> CoreResult<Vec<u8>> {
        let txn = self.transaction()?;
        match txn.mode() {
            TxnMode::Write => txn.node_file()?.read_record(offset),
            TxnMode::Read => txn.dataset().nodes().read_record(offset),
        }
    }

    // ---- Block access

    /// Allocates a fresh block id.
    ///
    /// # Errors
    ///
    /// Returns a misuse error on a read transaction.
    pub fn allocate_block(&self) -> CoreResult<BlockId> {
        Ok(self.transaction()?.block_view()?.allocate())
    }

    /// Writes `bytes` as the content of block `id` in this transaction.
    ///
    /// # Errors
    ///
    /// Returns a misuse error on a read transaction or if `bytes` exceeds
    /// the block size.
    pub fn write_block(&self, id: BlockId, bytes: &[u8]) -> CoreResult<()> {
        self.transaction()?.block_view()?.write(id, bytes)
    }

    /// Reads block `id` as visible to this transaction.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn read_block(&self, id: BlockId) -> CoreResult<Option<Vec<u8>>> {
        let txn = self.transaction()?;
        match txn.mode() {
            TxnMode::Write => txn.block_view()?.read(&txn, id),
            TxnMode::Read => txn.dataset().blocks().read_at_version(id, txn.version()),
        }
    }

    // ---- Lifecycle delegation

    /// Commits the bound transaction. See [`Transaction::commit`].
    ///
    /// # Errors
    ///
    /// Propagates the transaction's commit errors.
    pub fn commit(&self) -> CoreResult<()> {
        self.transaction()?.commit()
    }

    /// Aborts the bound transaction. See [`Transaction::abort`].
    ///
    /// # Errors
    ///
    /// Propagates the transaction's abort errors.
    pub fn abort(&self) -> CoreResult<()> {
        self.transaction()?.abort()
    }

    /// Closes the bound transaction and severs the back-reference.
    ///
    /// # Errors
    ///
    /// Propagates the transaction's close errors - in particular the
    /// misuse error for a write transaction that was never committed or
    /// aborted (the engine force-aborts it first).
    pub fn end(&self) -> CoreResult<()> {
        let txn = self.txn.lock().take().ok_or_else(|| {
            CoreError::invalid_operation("view is no longer bound to a transaction")
        })?;
        txn.close()
    }
}

impl Drop for DatasetTxn {
    fn drop(&mut self) {
        if let Some(txn) = self.txn.lock().take() {
            if txn.state() != TxnState::Closed {
                warn!(txn = %txn.id(), "dataset view dropped without end(), closing");
                if let Err(e) = txn.close() {
                    warn!(txn = %txn.id(), "close on drop: {e}");
                }
            }
        }
    }
}

impl std::fmt::Debug for DatasetTxn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetTxn")
            .field("txn", &*self.txn.lock())
            .finish()
    }
}
