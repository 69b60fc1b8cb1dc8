//! Transaction coordinator: version handout, writer admission, enactment.

use crate::dataset::Dataset;
use crate::error::CoreResult;
use crate::journal::Journal;
use crate::txn::transaction::{Transaction, TxnMode};
use crate::txn::view::DatasetTxn;
use crate::types::{TransactionId, Version};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// The registry that admits transactions to one dataset.
///
/// One coordinator owns one dataset and its journal. It hands out
/// monotonically increasing transaction ids and version numbers, admits
/// at most one write transaction at a time, and - once a writer's commit
/// marker is durable - enacts the committed changes into the base
/// dataset and resets the journal.
///
/// The coordinator is an explicit object passed by reference; there is no
/// process-wide registry.
pub struct TransactionCoordinator {
    dataset: Arc<Dataset>,
    next_txn_id: AtomicU64,
    /// Version of the newest fully-enacted commit. Published only after
    /// enactment completes, so a reader beginning mid-enactment still
    /// pins the previous version.
    version: AtomicU64,
    gate: WriterGate,
    active_readers: AtomicU64,
    active_writers: AtomicU64,
    finished_readers: AtomicU64,
    committed_writers: AtomicU64,
    aborted_writers: AtomicU64,
}

impl TransactionCoordinator {
    /// Creates a coordinator over `dataset`.
    pub fn new(dataset: Arc<Dataset>) -> Arc<Self> {
        Arc::new(Self {
            dataset,
            next_txn_id: AtomicU64::new(1),
            version: AtomicU64::new(Version::ZERO.as_u64()),
            gate: WriterGate::new(),
            active_readers: AtomicU64::new(0),
            active_writers: AtomicU64::new(0),
            finished_readers: AtomicU64::new(0),
            committed_writers: AtomicU64::new(0),
            aborted_writers: AtomicU64::new(0),
        })
    }

    /// Begins a transaction, returning its dataset view.
    ///
    /// A `Write` begin blocks until no other write transaction is active.
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible for parity with the rest of
    /// the transaction API.
    pub fn begin(self: &Arc<Self>, mode: TxnMode) -> CoreResult<DatasetTxn> {
        if mode == TxnMode::Write {
            self.gate.acquire();
            self.active_writers.fetch_add(1, Ordering::SeqCst);
        } else {
            self.active_readers.fetch_add(1, Ordering::SeqCst);
        }
        let id = TransactionId::new(self.next_txn_id.fetch_add(1, Ordering::SeqCst));
        let version = Version::new(self.version.load(Ordering::SeqCst));
        debug!(txn = %id, ?mode, %version, "transaction begins");
        let txn = Arc::new(Transaction::new(
            id,
            mode,
            version,
            self.dataset.clone(),
            Arc::downgrade(self),
        ));
        Ok(DatasetTxn::new(txn))
    }

    /// Returns the shared dataset.
    #[must_use]
    pub fn dataset(&self) -> &Arc<Dataset> {
        &self.dataset
    }

    /// Returns the shared journal.
    #[must_use]
    pub fn journal(&self) -> &Arc<Journal> {
        self.dataset.journal()
    }

    /// Version of the newest enacted commit.
    #[must_use]
    pub fn version(&self) -> Version {
        Version::new(self.version.load(Ordering::SeqCst))
    }

    /// Number of active read transactions.
    #[must_use]
    pub fn active_readers(&self) -> u64 {
        self.active_readers.load(Ordering::SeqCst)
    }

    /// Number of active write transactions (0 or 1).
    #[must_use]
    pub fn active_writers(&self) -> u64 {
        self.active_writers.load(Ordering::SeqCst)
    }

    /// Lifetime counters: finished readers, committed writers, aborted
    /// writers.
    #[must_use]
    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            finished_readers: self.finished_readers.load(Ordering::SeqCst),
            committed_writers: self.committed_writers.load(Ordering::SeqCst),
            aborted_writers: self.aborted_writers.load(Ordering::SeqCst),
        }
    }

    /// Signals that `txn`'s commit is durable (or, for a reader, that it
    /// finished). For a writer this is where enactment happens: the
    /// journal has the commit record and a sync to disk, and the changes
    /// are now played into the base dataset.
    pub(crate) fn notify_commit(&self, txn: &Transaction) -> CoreResult<()> {
        match txn.mode() {
            TxnMode::Read => {
                self.active_readers.fetch_sub(1, Ordering::SeqCst);
                self.finished_readers.fetch_add(1, Ordering::SeqCst);
                self.maybe_prune();
                Ok(())
            }
            TxnMode::Write => {
                let result = self.enact(txn);
                self.active_writers.fetch_sub(1, Ordering::SeqCst);
                self.committed_writers.fetch_add(1, Ordering::SeqCst);
                self.gate.release();
                self.maybe_prune();
                result
            }
        }
    }

    /// Signals that `txn` rolled back.
    pub(crate) fn notify_abort(&self, txn: &Transaction) {
        match txn.mode() {
            TxnMode::Read => {
                self.active_readers.fetch_sub(1, Ordering::SeqCst);
                self.finished_readers.fetch_add(1, Ordering::SeqCst);
            }
            TxnMode::Write => {
                self.active_writers.fetch_sub(1, Ordering::SeqCst);
                self.aborted_writers.fetch_add(1, Ordering::SeqCst);
                self.gate.release();
            }
        }
        self.maybe_prune();
    }

    /// Signals that `txn` reached its final closed state.
    pub(crate) fn notify_close(&self, txn: &Transaction) {
        debug!(txn = %txn.id(), "transaction closed");
        self.maybe_prune();
    }

    /// Makes the committed changes permanent in the base dataset, then
    /// resets the journal (its content is fully enacted).
    fn enact(&self, txn: &Transaction) -> CoreResult<()> {
        let next = self.version().next();
        txn.set_commit_version(next);
        for p in txn.participants_snapshot() {
            p.enact_committed(txn)?;
            p.clearup_committed(txn)?;
        }
        self.dataset.blocks().sync()?;
        self.version.store(next.as_u64(), Ordering::SeqCst);
        self.dataset.journal().truncate(0)?;
        debug!(txn = %txn.id(), version = %next, "transaction enacted");
        Ok(())
    }

    /// Superseded block images are only needed while some transaction can
    /// still read an old version.
    fn maybe_prune(&self) {
        if self.active_readers.load(Ordering::SeqCst) == 0
            && self.active_writers.load(Ordering::SeqCst) == 0
        {
            self.dataset.blocks().prune_history();
        }
    }
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("version", &self.version())
            .field("active_readers", &self.active_readers())
            .field("active_writers", &self.active_writers())
            .finish_non_exhaustive()
    }
}

/// Lifetime transaction counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Read transactions that finished.
    pub finished_readers: u64,
    /// Write transactions that committed.
    pub committed_writers: u64,
    /// Write transactions that aborted.
    pub aborted_writers: u64,
}

/// Admits one writer at a time; `acquire` blocks until the holder calls
/// `release`.
struct WriterGate {
    busy: Mutex<bool>,
    cv: Condvar,
}

impl WriterGate {
    fn new() -> Self {
        Self {
            busy: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut busy = self.busy.lock();
        while *busy {
            self.cv.wait(&mut busy);
        }
        *busy = true;
    }

    fn release(&self) {
        let mut busy = self.busy.lock();
        *busy = false;
        self.cv.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::CoreError;
    use crate::testutil::{FailureControl, FlakyBackend};
    use crate::types::BlockId;
    use std::io;

    fn coordinator() -> Arc<TransactionCoordinator> {
        let dataset = Arc::new(Dataset::in_memory(Config::default()).unwrap());
        TransactionCoordinator::new(dataset)
    }

    /// Dataset whose journal backend can be told to fail its next sync.
    fn coordinator_with_flaky_journal() -> (Arc<TransactionCoordinator>, FailureControl) {
        let control = FailureControl::default();
        let dataset = Arc::new(
            Dataset::from_parts(
                Box::new(quadstore_storage::MemBackend::new()),
                Box::new(quadstore_storage::MemBackend::new()),
                Box::new(FlakyBackend::new(control.clone())),
                Config::default(),
            )
            .unwrap(),
        );
        (TransactionCoordinator::new(dataset), control)
    }

    #[test]
    fn committed_write_is_visible_to_later_reader() {
        let coord = coordinator();

        let writer = coord.begin(TxnMode::Write).unwrap();
        let offset = writer.insert_node(b"<http://example/s>").unwrap();
        let block = writer.allocate_block().unwrap();
        writer.write_block(block, b"index entry").unwrap();
        writer.commit().unwrap();
        writer.end().unwrap();

        let reader = coord.begin(TxnMode::Read).unwrap();
        assert_eq!(reader.read_node(offset).unwrap(), b"<http://example/s>");
        let image = reader.read_block(block).unwrap().unwrap();
        assert_eq!(&image[..11], b"index entry");
        reader.end().unwrap();
    }

    #[test]
    fn reader_opened_before_commit_sees_nothing_of_it() {
        let coord = coordinator();
        let reader = coord.begin(TxnMode::Read).unwrap();

        let writer = coord.begin(TxnMode::Write).unwrap();
        let block = writer.allocate_block().unwrap();
        writer.write_block(block, b"new").unwrap();
        writer.commit().unwrap();
        writer.end().unwrap();

        // Snapshot isolation: the earlier reader must not see the block,
        // even though the writer has committed and enacted.
        assert_eq!(reader.read_block(block).unwrap(), None);
        reader.end().unwrap();

        let late = coord.begin(TxnMode::Read).unwrap();
        assert!(late.read_block(block).unwrap().is_some());
        late.end().unwrap();
    }

    #[test]
    fn reader_keeps_old_image_across_overwrite() {
        let coord = coordinator();

        let w1 = coord.begin(TxnMode::Write).unwrap();
        let block = w1.allocate_block().unwrap();
        w1.write_block(block, b"first").unwrap();
        w1.commit().unwrap();
        w1.end().unwrap();

        let reader = coord.begin(TxnMode::Read).unwrap();

        let w2 = coord.begin(TxnMode::Write).unwrap();
        w2.write_block(block, b"second").unwrap();
        w2.commit().unwrap();
        w2.end().unwrap();

        let image = reader.read_block(block).unwrap().unwrap();
        assert_eq!(&image[..5], b"first");
        reader.end().unwrap();
    }

    #[test]
    fn abort_restores_object_file_length_and_leaves_no_marker() {
        let coord = coordinator();
        let before = coord.dataset().nodes().length().unwrap();

        let writer = coord.begin(TxnMode::Write).unwrap();
        writer.insert_node(b"doomed").unwrap();
        writer.abort().unwrap();
        writer.end().unwrap();

        assert_eq!(coord.dataset().nodes().length().unwrap(), before);
        assert_eq!(coord.journal().size().unwrap(), 0);
        assert_eq!(coord.stats().aborted_writers, 1);
    }

    #[test]
    fn commit_bumps_version_abort_does_not() {
        let coord = coordinator();
        assert_eq!(coord.version(), Version::ZERO);

        let w = coord.begin(TxnMode::Write).unwrap();
        let b = w.allocate_block().unwrap();
        w.write_block(b, b"x").unwrap();
        w.commit().unwrap();
        w.end().unwrap();
        assert_eq!(coord.version(), Version::new(1));

        let w = coord.begin(TxnMode::Write).unwrap();
        w.write_block(b, b"y").unwrap();
        w.abort().unwrap();
        w.end().unwrap();
        assert_eq!(coord.version(), Version::new(1));
    }

    #[test]
    fn double_commit_is_a_misuse_error() {
        let coord = coordinator();
        let writer = coord.begin(TxnMode::Write).unwrap();
        writer.commit().unwrap();
        assert!(matches!(
            writer.commit(),
            Err(CoreError::InvalidOperation { .. })
        ));
        writer.end().unwrap();
    }

    #[test]
    fn close_without_commit_forces_abort_and_reports_misuse() {
        let coord = coordinator();
        let before = coord.dataset().nodes().length().unwrap();

        let writer = coord.begin(TxnMode::Write).unwrap();
        writer.insert_node(b"lost").unwrap();
        let result = writer.end();
        assert!(matches!(result, Err(CoreError::InvalidOperation { .. })));

        // The forced abort kept the on-disk state consistent.
        assert_eq!(coord.dataset().nodes().length().unwrap(), before);
        assert_eq!(coord.stats().aborted_writers, 1);

        // And a new writer can start: the gate was released.
        let w2 = coord.begin(TxnMode::Write).unwrap();
        w2.commit().unwrap();
        w2.end().unwrap();
    }

    #[test]
    fn close_is_idempotent() {
        let coord = coordinator();
        let reader = coord.begin(TxnMode::Read).unwrap();
        let txn = reader.transaction().unwrap();
        reader.end().unwrap();
        txn.close().unwrap();
        txn.close().unwrap();

        let writer = coord.begin(TxnMode::Write).unwrap();
        writer.commit().unwrap();
        let txn = writer.transaction().unwrap();
        writer.end().unwrap();
        txn.close().unwrap();
    }

    #[test]
    fn read_transaction_commit_and_abort_are_trivial() {
        let coord = coordinator();

        let r1 = coord.begin(TxnMode::Read).unwrap();
        r1.commit().unwrap();
        r1.end().unwrap();

        let r2 = coord.begin(TxnMode::Read).unwrap();
        r2.abort().unwrap();
        r2.end().unwrap();

        assert_eq!(coord.stats().finished_readers, 2);
        assert_eq!(coord.active_readers(), 0);
    }

    #[test]
    fn cancellation_checkpoint_aborts_before_prepare() {
        let coord = coordinator();
        let writer = coord.begin(TxnMode::Write).unwrap();
        writer.insert_node(b"never committed").unwrap();

        let txn = writer.transaction().unwrap();
        txn.cancel_token().cancel();
        let result = writer.commit();
        assert!(matches!(result, Err(CoreError::TransactionAborted { .. })));
        assert_eq!(coord.journal().size().unwrap(), 0);
        let _ = writer.end();
    }

    #[test]
    fn marker_write_failure_rolls_back_everything() {
        let (coord, control) = coordinator_with_flaky_journal();
        let nodes_before = coord.dataset().nodes().length().unwrap();
        let journal_before = coord.journal().size().unwrap();

        let writer = coord.begin(TxnMode::Write).unwrap();
        writer.insert_node(b"casualty").unwrap();
        let block = writer.allocate_block().unwrap();
        writer.write_block(block, b"casualty").unwrap();

        // The journal's next sync is the commit-marker durability point.
        control.fail_next_sync(io::ErrorKind::Other);
        let result = writer.commit();
        assert!(matches!(result, Err(CoreError::TransactionAborted { .. })));

        assert_eq!(coord.journal().size().unwrap(), journal_before);
        assert_eq!(coord.dataset().nodes().length().unwrap(), nodes_before);
        let _ = writer.end();

        let reader = coord.begin(TxnMode::Read).unwrap();
        assert_eq!(reader.read_block(block).unwrap(), None);
        reader.end().unwrap();
    }

    #[test]
    fn interrupted_marker_write_reopens_and_aborts() {
        let (coord, control) = coordinator_with_flaky_journal();

        let writer = coord.begin(TxnMode::Write).unwrap();
        let block = writer.allocate_block().unwrap();
        writer.write_block(block, b"torn").unwrap();

        control.fail_next_sync(io::ErrorKind::Interrupted);
        let result = writer.commit();
        assert!(matches!(result, Err(CoreError::TransactionAborted { .. })));
        assert_eq!(coord.journal().size().unwrap(), 0);
        let _ = writer.end();

        // The journal handle survived the reopen; a fresh write works.
        let w2 = coord.begin(TxnMode::Write).unwrap();
        w2.write_block(block, b"fine").unwrap();
        w2.commit().unwrap();
        w2.end().unwrap();
    }

    #[test]
    fn writers_are_serialized_by_the_gate() {
        let coord = coordinator();
        let w1 = coord.begin(TxnMode::Write).unwrap();

        let coord2 = coord.clone();
        let handle = std::thread::spawn(move || {
            // Blocks until w1 finishes.
            let w2 = coord2.begin(TxnMode::Write).unwrap();
            w2.commit().unwrap();
            w2.end().unwrap();
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(coord.active_writers(), 1);
        w1.commit().unwrap();
        w1.end().unwrap();
        handle.join().unwrap();
        assert_eq!(coord.stats().committed_writers, 2);
    }

    #[test]
    fn iterator_registrations_cleared_at_close() {
        let coord = coordinator();
        let reader = coord.begin(TxnMode::Read).unwrap();
        let txn = reader.transaction().unwrap();
        let h1 = txn.add_iterator();
        let _h2 = txn.add_iterator();
        txn.remove_iterator(h1);
        assert_eq!(txn.open_iterators(), 1);
        reader.end().unwrap();
        assert_eq!(txn.open_iterators(), 0);
    }

    #[test]
    fn other_components_participate_in_lifecycle_order() {
        use crate::txn::lifecycle::TransactionLifecycle;
        use parking_lot::Mutex as PMutex;

        #[derive(Default)]
        struct Probe {
            calls: PMutex<Vec<&'static str>>,
        }
        impl TransactionLifecycle for Probe {
            fn begin(&self, _: &Transaction) -> CoreResult<()> {
                self.calls.lock().push("begin");
                Ok(())
            }
            fn abort(&self, _: &Transaction) -> CoreResult<()> {
                self.calls.lock().push("abort");
                Ok(())
            }
            fn commit_prepare(&self, _: &Transaction) -> CoreResult<()> {
                self.calls.lock().push("prepare");
                Ok(())
            }
            fn committed(&self, _: &Transaction) -> CoreResult<()> {
                self.calls.lock().push("committed");
                Ok(())
            }
            fn enact_committed(&self, _: &Transaction) -> CoreResult<()> {
                self.calls.lock().push("enact");
                Ok(())
            }
            fn clearup_committed(&self, _: &Transaction) -> CoreResult<()> {
                self.calls.lock().push("clearup");
                Ok(())
            }
        }

        let coord = coordinator();
        let writer = coord.begin(TxnMode::Write).unwrap();
        let probe = Arc::new(Probe::default());
        let txn = writer.transaction().unwrap();
        txn.register_component(probe.clone()).unwrap();
        writer.commit().unwrap();
        writer.end().unwrap();

        assert_eq!(
            probe.calls.lock().as_slice(),
            ["begin", "prepare", "committed", "enact", "clearup"]
        );
    }

    #[test]
    fn aborted_component_sees_exactly_one_terminal_call() {
        use crate::txn::lifecycle::TransactionLifecycle;
        use std::sync::atomic::AtomicUsize;

        #[derive(Default)]
        struct Probe {
            aborts: AtomicUsize,
        }
        impl TransactionLifecycle for Probe {
            fn begin(&self, _: &Transaction) -> CoreResult<()> {
                Ok(())
            }
            fn abort(&self, _: &Transaction) -> CoreResult<()> {
                self.aborts.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            fn commit_prepare(&self, _: &Transaction) -> CoreResult<()> {
                Ok(())
            }
            fn committed(&self, _: &Transaction) -> CoreResult<()> {
                Ok(())
            }
            fn enact_committed(&self, _: &Transaction) -> CoreResult<()> {
                Ok(())
            }
            fn clearup_committed(&self, _: &Transaction) -> CoreResult<()> {
                Ok(())
            }
        }

        let coord = coordinator();
        let writer = coord.begin(TxnMode::Write).unwrap();
        let probe = Arc::new(Probe::default());
        writer
            .transaction()
            .unwrap()
            .register_component(probe.clone())
            .unwrap();
        writer.abort().unwrap();
        writer.end().unwrap();
        assert_eq!(probe.aborts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn block_ids_allocated_by_aborted_writer_stay_unused() {
        let coord = coordinator();

        let w1 = coord.begin(TxnMode::Write).unwrap();
        let gap = w1.allocate_block().unwrap();
        w1.write_block(gap, b"gone").unwrap();
        w1.abort().unwrap();
        w1.end().unwrap();

        let reader = coord.begin(TxnMode::Read).unwrap();
        assert_eq!(reader.read_block(gap).unwrap(), None);
        reader.end().unwrap();

        let w2 = coord.begin(TxnMode::Write).unwrap();
        let fresh = w2.allocate_block().unwrap();
        assert_ne!(fresh, gap);
        w2.commit().unwrap();
        w2.end().unwrap();
    }

    #[test]
    fn empty_write_commit_succeeds() {
        let coord = coordinator();
        let writer = coord.begin(TxnMode::Write).unwrap();
        writer.commit().unwrap();
        writer.end().unwrap();
        assert_eq!(coord.stats().committed_writers, 1);
    }

    #[test]
    fn gap_block_read_none_after_other_blocks_enacted() {
        let coord = coordinator();

        let w = coord.begin(TxnMode::Write).unwrap();
        let a = w.allocate_block().unwrap();
        let _gap = w.allocate_block().unwrap();
        let c = w.allocate_block().unwrap();
        w.write_block(a, b"a").unwrap();
        w.write_block(c, b"c").unwrap();
        w.commit().unwrap();
        w.end().unwrap();

        let reader = coord.begin(TxnMode::Read).unwrap();
        // Block c forced the file past the gap; the gap block exists on
        // disk as zeroes, which is what an unwritten block reads as.
        let gap_image = reader.read_block(BlockId::new(1)).unwrap();
        if let Some(image) = gap_image {
            assert!(image.iter().all(|b| *b == 0));
        }
        reader.end().unwrap();
    }
}
