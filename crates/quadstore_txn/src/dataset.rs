//! The base dataset: object file, block store and journal as one unit.

use crate::block::BlockStore;
use crate::config::Config;
use crate::dir::DatasetDir;
use crate::error::CoreResult;
use crate::journal::Journal;
use crate::objfile::ObjectFile;
use crate::recovery;
use crate::types::FileRef;
use quadstore_storage::{FileBackend, MemBackend, StorageBackend};
use std::path::Path;
use std::sync::Arc;

/// The shared base state of one dataset.
///
/// Holds the append-only node file, the versioned block store and the
/// journal. Opening a dataset runs journal recovery before anything else,
/// so the state handed to the coordinator is always consistent.
pub struct Dataset {
    _dir: Option<DatasetDir>,
    nodes: Arc<ObjectFile>,
    blocks: Arc<BlockStore>,
    journal: Arc<Journal>,
}

impl Dataset {
    /// Opens a dataset directory, locking it and recovering the journal.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be opened or locked, or
    /// if recovery finds corruption.
    pub fn open(path: &Path, config: Config) -> CoreResult<Self> {
        let dir = DatasetDir::open(path, config.create_if_missing)?;
        let nodes = Box::new(FileBackend::open(&dir.nodes_path())?);
        let blocks = Box::new(FileBackend::open(&dir.blocks_path())?);
        let journal = Box::new(FileBackend::open(&dir.journal_path())?);
        let mut dataset = Self::assemble(nodes, blocks, journal, config)?;
        dataset._dir = Some(dir);
        recovery::recover(&dataset.journal, &dataset.blocks)?;
        Ok(dataset)
    }

    /// Creates an ephemeral in-memory dataset.
    ///
    /// # Errors
    ///
    /// Returns an error if a backend cannot be initialized.
    pub fn in_memory(config: Config) -> CoreResult<Self> {
        Self::assemble(
            Box::new(MemBackend::new()),
            Box::new(MemBackend::new()),
            Box::new(MemBackend::new()),
            config,
        )
    }

    /// Assembles a dataset from explicit backends, without recovery.
    pub(crate) fn from_parts(
        nodes: Box<dyn StorageBackend>,
        blocks: Box<dyn StorageBackend>,
        journal: Box<dyn StorageBackend>,
        config: Config,
    ) -> CoreResult<Self> {
        Self::assemble(nodes, blocks, journal, config)
    }

    fn assemble(
        nodes: Box<dyn StorageBackend>,
        blocks: Box<dyn StorageBackend>,
        journal: Box<dyn StorageBackend>,
        config: Config,
    ) -> CoreResult<Self> {
        Ok(Self {
            _dir: None,
            nodes: Arc::new(ObjectFile::open(nodes)),
            blocks: Arc::new(BlockStore::open(blocks, config.block_size)?),
            journal: Arc::new(Journal::open(journal)?),
        })
    }

    /// The append-only node file.
    #[must_use]
    pub fn nodes(&self) -> &Arc<ObjectFile> {
        &self.nodes
    }

    /// The versioned block store.
    #[must_use]
    pub fn blocks(&self) -> &Arc<BlockStore> {
        &self.blocks
    }

    /// The shared journal.
    #[must_use]
    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    /// Journal file ref of the node file.
    #[must_use]
    pub fn nodes_ref(&self) -> FileRef {
        FileRef::new(1)
    }

    /// Journal file ref of the block store.
    #[must_use]
    pub fn blocks_ref(&self) -> FileRef {
        FileRef::new(2)
    }
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("blocks", &self.blocks)
            .finish_non_exhaustive()
    }
}
