//! Per-transaction block overlay participant.

use crate::block::store::BlockStore;
use crate::error::{CoreError, CoreResult};
use crate::journal::Frame;
use crate::txn::TransactionLifecycle;
use crate::txn::Transaction;
use crate::types::{BlockId, FileRef};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Transactional view of a [`BlockStore`].
///
/// Writes land in a private overlay; the base store is untouched until
/// enactment. At `commit_prepare` every dirty block is written into the
/// journal as a `Block` frame (inside the transaction's open write
/// cycle), which is what makes the commit crash-recoverable. At
/// `enact_committed` the images are copied into the base store at the
/// transaction's commit version.
pub struct TransBlockStore {
    file_ref: FileRef,
    base: Arc<BlockStore>,
    overlay: Mutex<Overlay>,
}

#[derive(Default)]
struct Overlay {
    blocks: HashMap<BlockId, Vec<u8>>,
    /// First-write order, for deterministic journal layout.
    order: Vec<BlockId>,
}

impl TransBlockStore {
    /// Creates a transactional view of `base` identified by `file_ref`.
    pub fn new(file_ref: FileRef, base: Arc<BlockStore>) -> Self {
        Self {
            file_ref,
            base,
            overlay: Mutex::new(Overlay::default()),
        }
    }

    /// The journal file ref of the wrapped store.
    #[must_use]
    pub fn file_ref(&self) -> FileRef {
        self.file_ref
    }

    /// Allocates a fresh block id.
    pub fn allocate(&self) -> BlockId {
        self.base.allocate()
    }

    /// Writes `bytes` as the content of `id` within this transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` exceeds the block size.
    pub fn write(&self, id: BlockId, bytes: &[u8]) -> CoreResult<()> {
        let block_size = self.base.block_size();
        if bytes.len() > block_size {
            return Err(CoreError::invalid_operation(format!(
                "block write of {} bytes exceeds block size {}",
                bytes.len(),
                block_size
            )));
        }
        let mut image = vec![0u8; block_size];
        image[..bytes.len()].copy_from_slice(bytes);

        let mut overlay = self.overlay.lock();
        if overlay.blocks.insert(id, image).is_none() {
            overlay.order.push(id);
        }
        Ok(())
    }

    /// Reads `id` as seen by `txn`: its own overlay first, then the base
    /// store at the transaction's snapshot version.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn read(&self, txn: &Transaction, id: BlockId) -> CoreResult<Option<Vec<u8>>> {
        if let Some(image) = self.overlay.lock().blocks.get(&id) {
            return Ok(Some(image.clone()));
        }
        self.base.read_at_version(id, txn.version())
    }

    /// Number of blocks dirtied by this transaction.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.overlay.lock().order.len()
    }
}

impl TransactionLifecycle for TransBlockStore {
    fn begin(&self, txn: &Transaction) -> CoreResult<()> {
        debug!(txn = %txn.id(), file = %self.file_ref, "block store joins transaction");
        Ok(())
    }

    fn abort(&self, _txn: &Transaction) -> CoreResult<()> {
        let mut overlay = self.overlay.lock();
        overlay.blocks.clear();
        overlay.order.clear();
        Ok(())
    }

    fn commit_prepare(&self, txn: &Transaction) -> CoreResult<()> {
        let overlay = self.overlay.lock();
        for id in &overlay.order {
            let image = &overlay.blocks[id];
            let frame = Frame::block(self.file_ref, *id, image, self.base.block_size())?;
            txn.journal().write(&frame)?;
        }
        debug!(txn = %txn.id(), file = %self.file_ref, blocks = overlay.order.len(),
               "block images journalled");
        Ok(())
    }

    fn committed(&self, _txn: &Transaction) -> CoreResult<()> {
        Ok(())
    }

    fn enact_committed(&self, txn: &Transaction) -> CoreResult<()> {
        let version = txn.commit_version().ok_or_else(|| {
            CoreError::invalid_operation("enactment before a commit version was assigned")
        })?;
        let overlay = self.overlay.lock();
        for id in &overlay.order {
            self.base.enact(version, *id, &overlay.blocks[id])?;
        }
        Ok(())
    }

    fn clearup_committed(&self, _txn: &Transaction) -> CoreResult<()> {
        let mut overlay = self.overlay.lock();
        overlay.blocks.clear();
        overlay.order.clear();
        Ok(())
    }
}

impl std::fmt::Debug for TransBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransBlockStore")
            .field("file_ref", &self.file_ref)
            .field("dirty", &self.dirty_count())
            .finish_non_exhaustive()
    }
}
