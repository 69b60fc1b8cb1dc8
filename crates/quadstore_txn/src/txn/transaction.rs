//! Transaction state machine and commit protocol.

use crate::block::TransBlockStore;
use crate::dataset::Dataset;
use crate::error::{CoreError, CoreResult};
use crate::journal::{Frame, Journal};
use crate::objfile::TransObjectFile;
use crate::txn::coordinator::TransactionCoordinator;
use crate::txn::lifecycle::TransactionLifecycle;
use crate::types::{TransactionId, Version};
use parking_lot::Mutex;
use quadstore_storage::StorageError;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

/// Transaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnMode {
    /// Reads a fixed snapshot, never mutates.
    Read,
    /// May mutate; at most one is active at a time.
    Write,
}

/// Transaction state. Transitions are monotonic and one-directional:
/// `Active → Preparing → Committed | Aborted → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Initial state; operations are permitted.
    Active,
    /// A write commit is in progress.
    Preparing,
    /// The update outcome is commit.
    Committed,
    /// The update outcome is abort.
    Aborted,
    /// Final state; the transaction must not be reused.
    Closed,
}

/// Final outcome of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    /// Read transaction committed explicitly.
    ReadCommitted,
    /// Read transaction aborted (a no-op marker; reads never mutate).
    ReadAborted,
    /// Read transaction auto-committed by `close()`.
    ReadClosed,
    /// Write transaction committed durably.
    WriteCommitted,
    /// Write transaction rolled back.
    WriteAborted,
}

/// Cooperative cancellation flag.
///
/// Checked at exactly two points of a write commit: before participant
/// prepare and before the commit marker is written. There is no
/// cancellation of an in-flight disk write.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates an unset token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// One unit of work against the dataset.
///
/// Created by the coordinator, bound to a base dataset snapshot, a
/// version number and the shared journal. Storage components join as
/// lifecycle participants the first time the transaction touches them.
/// The commit/abort sequence runs under a lock scoped to this instance
/// only; journal I/O is never performed under a lock shared with other
/// transactions.
pub struct Transaction {
    id: TransactionId,
    mode: TxnMode,
    version: Version,
    dataset: Arc<Dataset>,
    journal: Arc<Journal>,
    coordinator: Weak<TransactionCoordinator>,
    cancel: CancelToken,
    /// Version assigned by the coordinator when the commit is recorded;
    /// read by participants during enactment.
    commit_version: Mutex<Option<Version>>,
    inner: Mutex<TxnInner>,
}

struct TxnInner {
    state: TxnState,
    outcome: Option<TxnOutcome>,
    object_files: Vec<Arc<TransObjectFile>>,
    block_stores: Vec<Arc<TransBlockStore>>,
    components: Vec<Arc<dyn TransactionLifecycle>>,
    iterators: Vec<u64>,
    next_iterator: u64,
}

impl Transaction {
    pub(crate) fn new(
        id: TransactionId,
        mode: TxnMode,
        version: Version,
        dataset: Arc<Dataset>,
        coordinator: Weak<TransactionCoordinator>,
    ) -> Self {
        let journal = dataset.journal().clone();
        Self {
            id,
            mode,
            version,
            dataset,
            journal,
            coordinator,
            cancel: CancelToken::new(),
            commit_version: Mutex::new(None),
            inner: Mutex::new(TxnInner {
                state: TxnState::Active,
                outcome: None,
                object_files: Vec::new(),
                block_stores: Vec::new(),
                components: Vec::new(),
                iterators: Vec::new(),
                next_iterator: 0,
            }),
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the transaction mode.
    #[must_use]
    pub fn mode(&self) -> TxnMode {
        self.mode
    }

    /// Returns the dataset version this transaction reads.
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TxnState {
        self.inner.lock().state
    }

    /// Returns the final outcome, once there is one.
    #[must_use]
    pub fn outcome(&self) -> Option<TxnOutcome> {
        self.inner.lock().outcome
    }

    /// Returns the shared journal.
    #[must_use]
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Returns the base dataset this transaction is bound to.
    #[must_use]
    pub fn dataset(&self) -> &Arc<Dataset> {
        &self.dataset
    }

    /// Returns this transaction's cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Returns the version this transaction committed at, if assigned.
    #[must_use]
    pub fn commit_version(&self) -> Option<Version> {
        *self.commit_version.lock()
    }

    pub(crate) fn set_commit_version(&self, version: Version) {
        *self.commit_version.lock() = Some(version);
    }

    // ---- Participants

    /// Returns this transaction's object-file participant, creating and
    /// registering it on first touch.
    ///
    /// # Errors
    ///
    /// Returns a misuse error on a read transaction or once the
    /// transaction is no longer active.
    pub fn node_file(&self) -> CoreResult<Arc<TransObjectFile>> {
        self.require_active_write("node_file")?;
        let mut inner = self.inner.lock();
        if let Some(f) = inner.object_files.first() {
            return Ok(f.clone());
        }
        let f = Arc::new(TransObjectFile::new(
            self.dataset.nodes_ref(),
            self.dataset.nodes().clone(),
        ));
        f.begin(self)?;
        inner.object_files.push(f.clone());
        Ok(f)
    }

    /// Returns this transaction's block-store participant, creating and
    /// registering it on first touch.
    ///
    /// # Errors
    ///
    /// Returns a misuse error on a read transaction or once the
    /// transaction is no longer active.
    pub fn block_view(&self) -> CoreResult<Arc<TransBlockStore>> {
        self.require_active_write("block_view")?;
        let mut inner = self.inner.lock();
        if let Some(b) = inner.block_stores.first() {
            return Ok(b.clone());
        }
        let b = Arc::new(TransBlockStore::new(
            self.dataset.blocks_ref(),
            self.dataset.blocks().clone(),
        ));
        b.begin(self)?;
        inner.block_stores.push(b.clone());
        Ok(b)
    }

    /// Registers an additional lifecycle participant, calling its `begin`.
    ///
    /// Components registered here run after the object files and block
    /// stores in every lifecycle sweep.
    ///
    /// # Errors
    ///
    /// Returns a misuse error on a read transaction or once the
    /// transaction is no longer active.
    pub fn register_component(&self, component: Arc<dyn TransactionLifecycle>) -> CoreResult<()> {
        self.require_active_write("register_component")?;
        component.begin(self)?;
        self.inner.lock().components.push(component);
        Ok(())
    }

    fn require_active_write(&self, op: &str) -> CoreResult<()> {
        if self.mode != TxnMode::Write {
            return Err(CoreError::invalid_operation(format!(
                "{op}: not a write transaction"
            )));
        }
        if self.inner.lock().state != TxnState::Active {
            return Err(CoreError::invalid_operation(format!(
                "{op}: transaction is not active"
            )));
        }
        Ok(())
    }

    /// All participants in lifecycle order, for the coordinator's
    /// enactment sweep.
    pub(crate) fn participants_snapshot(&self) -> Vec<Arc<dyn TransactionLifecycle>> {
        Self::participants(&self.inner.lock())
    }

    /// All participants in lifecycle order: object files, then block
    /// stores, then other components.
    fn participants(inner: &TxnInner) -> Vec<Arc<dyn TransactionLifecycle>> {
        let mut all: Vec<Arc<dyn TransactionLifecycle>> = Vec::with_capacity(
            inner.object_files.len() + inner.block_stores.len() + inner.components.len(),
        );
        all.extend(
            inner
                .object_files
                .iter()
                .map(|f| f.clone() as Arc<dyn TransactionLifecycle>),
        );
        all.extend(
            inner
                .block_stores
                .iter()
                .map(|b| b.clone() as Arc<dyn TransactionLifecycle>),
        );
        all.extend(inner.components.iter().cloned());
        all
    }

    // ---- Iterator tracking

    /// Registers a long-lived cursor opened against this transaction's
    /// snapshot, returning a handle for [`remove_iterator`].
    ///
    /// [`remove_iterator`]: Transaction::remove_iterator
    pub fn add_iterator(&self) -> u64 {
        let mut inner = self.inner.lock();
        let handle = inner.next_iterator;
        inner.next_iterator += 1;
        inner.iterators.push(handle);
        handle
    }

    /// Deregisters a cursor previously registered with
    /// [`add_iterator`](Transaction::add_iterator).
    pub fn remove_iterator(&self, handle: u64) {
        self.inner.lock().iterators.retain(|h| *h != handle);
    }

    /// Number of cursors still registered.
    #[must_use]
    pub fn open_iterators(&self) -> usize {
        self.inner.lock().iterators.len()
    }

    // ---- Commit / abort / close

    /// Commits the transaction.
    ///
    /// For a write transaction this drives every participant through
    /// prepare, writes the durable commit marker (the single atomic point
    /// of the commit), notifies participants, and hands the transaction to
    /// the coordinator for enactment.
    ///
    /// # Errors
    ///
    /// - [`CoreError::TransactionAborted`] - the commit did not happen;
    ///   on-disk state is unchanged.
    /// - [`CoreError::CommitDegraded`] - the commit **is** durable but a
    ///   post-commit step failed.
    /// - [`CoreError::SystemUnstable`] - rollback failed; the dataset
    ///   must not be trusted further.
    /// - [`CoreError::InvalidOperation`] - the transaction was not active.
    pub fn commit(&self) -> CoreResult<()> {
        match self.mode {
            TxnMode::Read => self.finish_read(TxnOutcome::ReadCommitted),
            TxnMode::Write => self.commit_write(),
        }
    }

    fn commit_write(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != TxnState::Active {
            return Err(CoreError::invalid_operation(
                "commit: transaction already committed or aborted",
            ));
        }
        inner.state = TxnState::Preparing;
        debug!(txn = %self.id, "write commit starting");

        if let Err(e) = self.journal.start_write() {
            inner.state = TxnState::Active;
            return Err(e);
        }

        if let Err(e) = self.writer_prepare_commit(&inner) {
            inner.state = TxnState::Aborted;
            inner.outcome = Some(TxnOutcome::WriteAborted);
            if let Err(end) = self.journal.end_write() {
                error!(txn = %self.id, "journal cleanup after failed prepare: {end}");
            }
            drop(inner);
            self.notify_abort();
            return Err(e);
        }

        // The marker is durable: the transaction has committed. Nothing
        // after this point may be reported as an abort.
        let mut degraded: Option<CoreError> = None;
        for p in Self::participants(&inner) {
            if let Err(e) = p.committed(self) {
                warn!(txn = %self.id, "post-commit acknowledgement failed: {e}");
                degraded.get_or_insert(CoreError::commit_degraded(format!(
                    "participant acknowledgement failed: {e}"
                )));
            }
        }
        if let Err(e) = self.journal.end_write() {
            warn!(txn = %self.id, "journal bracket cleanup failed: {e}");
            degraded.get_or_insert(CoreError::commit_degraded(format!(
                "journal cleanup failed: {e}"
            )));
        }
        inner.state = TxnState::Committed;
        inner.outcome = Some(TxnOutcome::WriteCommitted);
        debug!(txn = %self.id, "write commit durable");
        drop(inner);

        // Outside the per-transaction lock: coordinator bookkeeping and
        // enactment. Failures here are degraded, never aborts.
        if let Err(e) = self.notify_commit() {
            warn!(txn = %self.id, "coordinator commit notification failed: {e}");
            degraded.get_or_insert(CoreError::commit_degraded(format!(
                "coordinator notification failed: {e}"
            )));
        }
        match degraded {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Steps 3a-3d of the write commit: cancellation checkpoint, ordered
    /// participant prepare, second checkpoint, durable commit marker.
    fn writer_prepare_commit(&self, inner: &TxnInner) -> CoreResult<()> {
        if self.cancel.is_cancelled() {
            self.abandon(inner)?;
            return Err(CoreError::transaction_aborted(
                "cancelled before participant prepare",
            ));
        }
        for p in Self::participants(inner) {
            if let Err(e) = p.commit_prepare(self) {
                self.abandon(inner)?;
                return Err(CoreError::transaction_aborted(format!(
                    "participant prepare failed: {e}"
                )));
            }
        }
        if self.cancel.is_cancelled() {
            self.abandon(inner)?;
            return Err(CoreError::transaction_aborted(
                "cancelled before commit marker",
            ));
        }
        self.write_commit_marker(inner)
    }

    /// Writes the commit marker and forces it durable. Failure handling
    /// distinguishes an interrupted handle (reopen, truncating to the
    /// bracket start) from every other failure (truncate the bracket).
    fn write_commit_marker(&self, inner: &TxnInner) -> CoreResult<()> {
        let written = self
            .journal
            .write(&Frame::commit_marker())
            .and_then(|_| self.journal.commit_write());
        match written {
            Ok(()) => Ok(()),
            Err(e) if is_interrupted(&e) => {
                warn!(txn = %self.id, "interrupted writing commit marker, reopening journal");
                if let Err(re) = self.journal.reopen() {
                    return Err(CoreError::system_unstable(format!(
                        "journal reopen after interruption failed: {re}"
                    )));
                }
                self.rollback_participants(inner)?;
                Err(CoreError::transaction_aborted(format!(
                    "interrupted while writing commit marker: {e}"
                )))
            }
            Err(e) => {
                self.abandon(inner)?;
                Err(CoreError::transaction_aborted(format!(
                    "commit marker write failed: {e}"
                )))
            }
        }
    }

    /// Truncates the in-progress journal bracket and rolls back every
    /// participant. A failure here is the unrecoverable class.
    fn abandon(&self, inner: &TxnInner) -> CoreResult<()> {
        if let Err(e) = self.journal.abort_write() {
            error!(txn = %self.id, "journal truncation during abandonment failed: {e}");
            // Still try to roll the participants back before giving up.
            let _ = self.rollback_participants(inner);
            return Err(CoreError::system_unstable(format!(
                "journal truncation failed: {e}"
            )));
        }
        self.rollback_participants(inner)
    }

    fn rollback_participants(&self, inner: &TxnInner) -> CoreResult<()> {
        let mut failure: Option<String> = None;
        for p in Self::participants(inner) {
            if let Err(e) = p.abort(self) {
                error!(txn = %self.id, "participant rollback failed: {e}");
                failure.get_or_insert(format!("participant rollback failed: {e}"));
            }
        }
        match failure {
            Some(reason) => Err(CoreError::system_unstable(reason)),
            None => Ok(()),
        }
    }

    /// Aborts the transaction, discarding all pending changes.
    ///
    /// # Errors
    ///
    /// Returns a misuse error if the transaction is not active, or
    /// [`CoreError::SystemUnstable`] if rollback itself failed.
    pub fn abort(&self) -> CoreResult<()> {
        match self.mode {
            TxnMode::Read => self.finish_read(TxnOutcome::ReadAborted),
            TxnMode::Write => {
                let mut inner = self.inner.lock();
                if inner.state != TxnState::Active {
                    return Err(CoreError::invalid_operation(
                        "abort: transaction already committed or aborted",
                    ));
                }
                let result = self.rollback_participants(&inner);
                inner.state = TxnState::Aborted;
                inner.outcome = Some(TxnOutcome::WriteAborted);
                debug!(txn = %self.id, "write transaction aborted");
                drop(inner);
                self.notify_abort();
                result
            }
        }
    }

    fn finish_read(&self, outcome: TxnOutcome) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != TxnState::Active {
            return Err(CoreError::invalid_operation(
                "transaction already committed or aborted",
            ));
        }
        inner.state = match outcome {
            TxnOutcome::ReadAborted => TxnState::Aborted,
            _ => TxnState::Committed,
        };
        inner.outcome = Some(outcome);
        drop(inner);
        match outcome {
            TxnOutcome::ReadAborted => self.notify_abort(),
            _ => {
                if let Err(e) = self.notify_commit() {
                    warn!(txn = %self.id, "coordinator notification failed: {e}");
                }
            }
        }
        Ok(())
    }

    /// Closes the transaction. Idempotent once closed.
    ///
    /// From `Active`, a read transaction auto-commits; a write
    /// transaction is forcibly aborted and the caller receives a misuse
    /// error (on-disk state stays consistent regardless).
    ///
    /// # Errors
    ///
    /// Returns the misuse error described above, or a rollback failure.
    pub fn close(&self) -> CoreResult<()> {
        let state = self.inner.lock().state;
        let mut result = Ok(());
        match state {
            TxnState::Closed => return Ok(()),
            TxnState::Preparing => {
                return Err(CoreError::invalid_operation(
                    "close: commit is in progress",
                ))
            }
            TxnState::Active => match self.mode {
                TxnMode::Read => {
                    self.finish_read(TxnOutcome::ReadClosed)?;
                }
                TxnMode::Write => {
                    warn!(txn = %self.id, "close() without commit or abort, forcing abort");
                    result = match self.abort() {
                        // Rollback failure outranks the misuse report.
                        Err(e @ CoreError::SystemUnstable { .. }) => Err(e),
                        _ => Err(CoreError::invalid_operation(
                            "close() called on a write transaction without commit() or abort()",
                        )),
                    };
                }
            },
            TxnState::Committed | TxnState::Aborted => {}
        }

        let mut inner = self.inner.lock();
        if !inner.iterators.is_empty() {
            debug!(txn = %self.id, open = inner.iterators.len(), "clearing iterator registrations");
            inner.iterators.clear();
        }
        inner.state = TxnState::Closed;
        drop(inner);
        if let Some(c) = self.coordinator.upgrade() {
            c.notify_close(self);
        }
        result
    }

    fn notify_commit(&self) -> CoreResult<()> {
        match self.coordinator.upgrade() {
            Some(c) => c.notify_commit(self),
            None => Ok(()),
        }
    }

    fn notify_abort(&self) {
        if let Some(c) = self.coordinator.upgrade() {
            c.notify_abort(self);
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("version", &self.version)
            .field("state", &inner.state)
            .field("outcome", &inner.outcome)
            .finish_non_exhaustive()
    }
}

/// Whether an error stems from a forced interruption of the thread's I/O.
fn is_interrupted(e: &CoreError) -> bool {
    match e {
        CoreError::Io(err) => err.kind() == io::ErrorKind::Interrupted,
        CoreError::Storage(StorageError::Io(err)) => err.kind() == io::ErrorKind::Interrupted,
        _ => false,
    }
}
