//! Dataset directory management.
//!
//! On-disk layout of a dataset:
//!
//! ```text
//! <path>/
//! ├─ LOCK             # advisory lock, one process at a time
//! ├─ journal.jrnl     # write-ahead log
//! ├─ nodes.dat        # append-only object file of node records
//! └─ blocks.dat       # fixed-size index blocks
//! ```

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const JOURNAL_FILE: &str = "journal.jrnl";
const NODES_FILE: &str = "nodes.dat";
const BLOCKS_FILE: &str = "blocks.dat";

/// Manages a dataset directory and its advisory lock.
///
/// The lock is held for the lifetime of this value; a second process
/// opening the same directory gets [`CoreError::DatasetLocked`].
#[derive(Debug)]
pub struct DatasetDir {
    path: PathBuf,
    _lock_file: File,
}

impl DatasetDir {
    /// Opens (or creates) a dataset directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is missing and
    /// `create_if_missing` is false, if another process holds the lock,
    /// or on I/O failure.
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if !create_if_missing {
                return Err(CoreError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("dataset directory not found: {}", path.display()),
                )));
            }
            fs::create_dir_all(path)?;
        }

        let lock_path = path.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| CoreError::DatasetLocked)?;

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the dataset directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the journal file.
    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        self.path.join(JOURNAL_FILE)
    }

    /// Path of the node object file.
    #[must_use]
    pub fn nodes_path(&self) -> PathBuf {
        self.path.join(NODES_FILE)
    }

    /// Path of the block file.
    #[must_use]
    pub fn blocks_path(&self) -> PathBuf {
        self.path.join(BLOCKS_FILE)
    }
}
