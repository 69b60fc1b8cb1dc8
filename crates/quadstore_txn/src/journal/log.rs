//! The journal: durable, checksummed, append-only frame log.

use crate::error::{CoreError, CoreResult};
use crate::journal::frame::{Frame, CHECKSUM_SIZE, FRAME_HEADER_SIZE};
use parking_lot::Mutex;
use quadstore_storage::{StorageBackend, StorageError};
use tracing::debug;

/// Append-only, randomly-readable log of checksummed frames.
///
/// A single `Journal` instance is shared between the active writer and
/// recovery code; all operations are internally thread-safe. In steady
/// state only one write-cycle bracket is open system-wide, because the
/// coordinator admits one write transaction at a time.
pub struct Journal {
    inner: Mutex<JournalInner>,
}

struct JournalInner {
    backend: Box<dyn StorageBackend>,
    /// Append cursor: the offset one past the last complete frame.
    position: u64,
    /// Offset at which the open write-cycle bracket started, if any.
    write_start: Option<u64>,
}

impl Journal {
    /// Opens a journal over `backend`, resuming at its current end.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn open(backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let position = backend.size()?;
        Ok(Self {
            inner: Mutex::new(JournalInner {
                backend,
                position,
                write_start: None,
            }),
        })
    }

    /// Appends a frame at the current position.
    ///
    /// Returns the offset at which the frame starts.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn write(&self, frame: &Frame) -> CoreResult<u64> {
        let mut inner = self.inner.lock();
        let bytes = frame.encode();
        let offset = inner.backend.append(&bytes)?;
        inner.position = offset + bytes.len() as u64;
        Ok(offset)
    }

    /// Reads and validates the frame starting at `offset`.
    ///
    /// Random reads are positionless: a concurrent sequential reader's
    /// cursor is never disturbed.
    ///
    /// # Errors
    ///
    /// A read past the logical end of the journal is a corruption error;
    /// so is an undecodable header or a checksum mismatch.
    pub fn read(&self, offset: u64) -> CoreResult<Frame> {
        let inner = self.inner.lock();
        Self::read_locked(&inner, offset)
    }

    fn read_locked(inner: &JournalInner, offset: u64) -> CoreResult<Frame> {
        let header_bytes = inner
            .backend
            .read_at(offset, FRAME_HEADER_SIZE)
            .map_err(truncated_frame(offset))?;
        let header: [u8; FRAME_HEADER_SIZE] = header_bytes
            .as_slice()
            .try_into()
            .map_err(|_| CoreError::journal_corruption("short frame header"))?;
        let capacity = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let rest = inner
            .backend
            .read_at(
                offset + FRAME_HEADER_SIZE as u64,
                capacity + CHECKSUM_SIZE,
            )
            .map_err(truncated_frame(offset))?;
        Frame::decode(&header, &rest)
    }

    /// Returns a lazy sequence of frames in file order from `from`.
    ///
    /// Each step validates one frame and advances by its recorded extent.
    /// The iterator is restartable from any offset it has yielded.
    ///
    /// # Errors
    ///
    /// Refuses to start while a write-cycle bracket is open on this
    /// journal instance.
    pub fn entries(&self, from: u64) -> CoreResult<Frames<'_>> {
        let inner = self.inner.lock();
        if inner.write_start.is_some() {
            return Err(CoreError::invalid_operation(
                "cannot iterate the journal inside an open write cycle",
            ));
        }
        let end = inner.position;
        drop(inner);
        Ok(Frames {
            journal: self,
            offset: from,
            end,
            finished: false,
        })
    }

    /// Returns the current append position.
    pub fn position(&self) -> u64 {
        self.inner.lock().position
    }

    /// Returns the journal size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.inner.lock().backend.size()?)
    }

    /// Truncates the journal back to `offset` and forces durability.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn truncate(&self, offset: u64) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        inner.backend.truncate(offset)?;
        inner.backend.sync()?;
        inner.position = offset;
        Ok(())
    }

    /// Opens a write-cycle bracket, recording the current position as the
    /// point to truncate back to if the cycle fails.
    ///
    /// # Errors
    ///
    /// Returns a misuse error if a bracket is already open.
    pub fn start_write(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.write_start.is_some() {
            return Err(CoreError::invalid_operation(
                "write cycle already in progress",
            ));
        }
        inner.write_start = Some(inner.position);
        Ok(())
    }

    /// Closes the bracket successfully: forces everything appended since
    /// `start_write` to durable media.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails; the bracket stays open so the
    /// caller can still undo with [`abort_write`](Self::abort_write).
    pub fn commit_write(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        inner.backend.sync()?;
        inner.write_start = None;
        Ok(())
    }

    /// Undoes the bracket: truncates back to the recorded start and forces
    /// durability of the truncation.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn abort_write(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        if let Some(start) = inner.write_start.take() {
            debug!(start, "journal write cycle aborted, truncating");
            inner.backend.truncate(start)?;
            inner.backend.sync()?;
            inner.position = start;
        }
        Ok(())
    }

    /// Idempotent bracket cleanup: aborts the cycle if neither
    /// [`commit_write`](Self::commit_write) nor
    /// [`abort_write`](Self::abort_write) ran.
    ///
    /// # Errors
    ///
    /// Returns an error if the implied abort fails.
    pub fn end_write(&self) -> CoreResult<()> {
        let open = self.inner.lock().write_start.is_some();
        if open {
            self.abort_write()?;
        }
        Ok(())
    }

    /// Recovery path after an uncontrolled close of the underlying handle.
    ///
    /// Reopens the backend; if a write-cycle start was recorded, truncates
    /// back to it and forces durability, otherwise resumes at end-of-file.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle cannot be re-established or the
    /// truncation fails.
    pub fn reopen(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        inner.backend.reopen()?;
        match inner.write_start.take() {
            Some(start) => {
                debug!(start, "journal reopened inside a write cycle, truncating");
                inner.backend.truncate(start)?;
                inner.backend.sync()?;
                inner.position = start;
            }
            None => {
                inner.position = inner.backend.size()?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Journal")
            .field("position", &inner.position)
            .field("write_start", &inner.write_start)
            .finish_non_exhaustive()
    }
}

/// Maps a storage read error on a frame read into the fatal corruption
/// error the journal contract requires.
fn truncated_frame(offset: u64) -> impl FnOnce(StorageError) -> CoreError {
    move |e| match e {
        StorageError::ReadPastEnd { .. } => CoreError::journal_corruption(format!(
            "truncated frame at offset {offset}"
        )),
        other => CoreError::Storage(other),
    }
}

/// Lazy sequence of `(offset, Frame)` pairs in file order.
///
/// Produced by [`Journal::entries`]; stops at the journal's logical end
/// as of when iteration began.
pub struct Frames<'a> {
    journal: &'a Journal,
    offset: u64,
    end: u64,
    finished: bool,
}

impl Iterator for Frames<'_> {
    type Item = CoreResult<(u64, Frame)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.offset >= self.end {
            return None;
        }
        match self.journal.read(self.offset) {
            Ok(frame) => {
                let at = self.offset;
                self.offset += frame.extent();
                Some(Ok((at, frame)))
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
