//! The base block store: fixed-size blocks with version history.

use crate::error::CoreResult;
use crate::types::{BlockId, Version};
use parking_lot::{Mutex, RwLock};
use quadstore_storage::StorageBackend;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// A store of fixed-size blocks over a [`StorageBackend`], with reads
/// pinned to a dataset version.
///
/// Enacting a block at version `v` keeps the image it supersedes in an
/// in-memory history, so a transaction that began before `v` still reads
/// the old image. The coordinator prunes the history whenever no
/// transactions are active.
pub struct BlockStore {
    backend: Mutex<Box<dyn StorageBackend>>,
    block_size: usize,
    next_id: AtomicU32,
    /// Per-block images keyed by the version at which they became
    /// current. `None` marks "block did not exist at this version".
    history: RwLock<HashMap<BlockId, Vec<(Version, Option<Vec<u8>>)>>>,
}

impl BlockStore {
    /// Opens a block store of `block_size`-byte blocks over `backend`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn open(backend: Box<dyn StorageBackend>, block_size: usize) -> CoreResult<Self> {
        let size = backend.size()?;
        let next_id = (size / block_size as u64) as u32;
        Ok(Self {
            backend: Mutex::new(backend),
            block_size,
            next_id: AtomicU32::new(next_id),
            history: RwLock::new(HashMap::new()),
        })
    }

    /// Returns the block size in bytes.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Allocates a fresh block id.
    ///
    /// Ids allocated by a transaction that later aborts are simply never
    /// enacted; the gap is harmless.
    pub fn allocate(&self) -> BlockId {
        BlockId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Reads the image of `id` as of dataset version `version`.
    ///
    /// Returns `None` if the block did not exist at that version.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn read_at_version(&self, id: BlockId, version: Version) -> CoreResult<Option<Vec<u8>>> {
        // The history read lock is held across the disk read so that an
        // enactment cannot slip between the history miss and the read.
        let history = self.history.read();
        if let Some(entries) = history.get(&id) {
            if let Some((_, image)) = entries.iter().rev().find(|(v, _)| *v <= version) {
                return Ok(image.clone());
            }
        }
        self.read_current(id)
    }

    /// Reads the newest enacted image of `id` straight from the backend.
    fn read_current(&self, id: BlockId) -> CoreResult<Option<Vec<u8>>> {
        let backend = self.backend.lock();
        let offset = id.as_u32() as u64 * self.block_size as u64;
        if offset + self.block_size as u64 > backend.size()? {
            return Ok(None);
        }
        Ok(Some(backend.read_at(offset, self.block_size)?))
    }

    /// Makes `image` the current content of `id` as of `version`.
    ///
    /// The superseded image is retained in history for readers pinned to
    /// older versions. `image` must already be `block_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn enact(&self, version: Version, id: BlockId, image: &[u8]) -> CoreResult<()> {
        debug_assert_eq!(image.len(), self.block_size);
        let mut history = self.history.write();
        let entries = history.entry(id).or_default();
        if entries.is_empty() {
            // First touch since the history was last pruned: preserve the
            // image every older version must keep seeing.
            let old = self.read_current(id)?;
            entries.push((Version::ZERO, old));
        }
        {
            let mut backend = self.backend.lock();
            let offset = id.as_u32() as u64 * self.block_size as u64;
            backend.write_at(offset, image)?;
        }
        entries.push((version, Some(image.to_vec())));
        Ok(())
    }

    /// Writes `image` directly, bypassing the version history.
    ///
    /// Only valid while no transactions are active (journal recovery).
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn recovery_apply(&self, id: BlockId, image: &[u8]) -> CoreResult<()> {
        let mut backend = self.backend.lock();
        let offset = id.as_u32() as u64 * self.block_size as u64;
        backend.write_at(offset, image)?;
        Ok(())
    }

    /// Forces all enacted blocks to durable media.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&self) -> CoreResult<()> {
        self.backend.lock().sync()?;
        Ok(())
    }

    /// Drops all retained history.
    ///
    /// Only valid while no transactions are active; afterwards every read
    /// falls through to the newest enacted image.
    pub fn prune_history(&self) {
        let mut history = self.history.write();
        if !history.is_empty() {
            debug!(blocks = history.len(), "pruning block version history");
            history.clear();
        }
    }
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("block_size", &self.block_size)
            .field("next_id", &self.next_id.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quadstore_storage::MemBackend;

    const BS: usize = 8;

    fn store() -> BlockStore {
        BlockStore::open(Box::new(MemBackend::new()), BS).unwrap()
    }

    fn image(fill: u8) -> Vec<u8> {
        vec![fill; BS]
    }

    #[test]
    fn allocate_hands_out_sequential_ids() {
        let store = store();
        assert_eq!(store.allocate(), BlockId::new(0));
        assert_eq!(store.allocate(), BlockId::new(1));
    }

    #[test]
    fn missing_block_reads_none() {
        let store = store();
        let id = store.allocate();
        assert_eq!(store.read_at_version(id, Version::ZERO).unwrap(), None);
    }

    #[test]
    fn enacted_block_visible_at_its_version() {
        let store = store();
        let id = store.allocate();
        store.enact(Version::new(1), id, &image(0xAA)).unwrap();

        assert_eq!(
            store.read_at_version(id, Version::new(1)).unwrap(),
            Some(image(0xAA))
        );
        assert_eq!(
            store.read_at_version(id, Version::new(5)).unwrap(),
            Some(image(0xAA))
        );
    }

    #[test]
    fn older_version_keeps_old_image() {
        let store = store();
        let id = store.allocate();
        store.enact(Version::new(1), id, &image(0x11)).unwrap();
        store.enact(Version::new(2), id, &image(0x22)).unwrap();

        assert_eq!(
            store.read_at_version(id, Version::new(1)).unwrap(),
            Some(image(0x11))
        );
        assert_eq!(
            store.read_at_version(id, Version::new(2)).unwrap(),
            Some(image(0x22))
        );
    }

    #[test]
    fn block_created_after_snapshot_is_invisible() {
        let store = store();
        let id = store.allocate();
        store.enact(Version::new(3), id, &image(0x33)).unwrap();
        assert_eq!(store.read_at_version(id, Version::new(2)).unwrap(), None);
    }

    #[test]
    fn prune_collapses_to_newest() {
        let store = store();
        let id = store.allocate();
        store.enact(Version::new(1), id, &image(0x11)).unwrap();
        store.enact(Version::new(2), id, &image(0x22)).unwrap();
        store.prune_history();

        // Every version now reads the enacted disk state.
        assert_eq!(
            store.read_at_version(id, Version::ZERO).unwrap(),
            Some(image(0x22))
        );
    }

    #[test]
    fn history_survives_interleaved_blocks() {
        let store = store();
        let a = store.allocate();
        let b = store.allocate();
        store.enact(Version::new(1), a, &image(0xA1)).unwrap();
        store.enact(Version::new(2), b, &image(0xB2)).unwrap();

        assert_eq!(
            store.read_at_version(a, Version::new(1)).unwrap(),
            Some(image(0xA1))
        );
        assert_eq!(store.read_at_version(b, Version::new(1)).unwrap(), None);
    }
}
