//! Append-only journal of checksummed frames.
//!
//! The journal is the write-ahead log of the engine. Every state change a
//! committing transaction makes is first recorded here as a frame - a
//! block image or a control marker - and a transaction is committed at
//! the instant its payload-less commit marker is durable on disk.
//!
//! ## Frame format
//!
//! ```text
//! | type (4) | payload capacity (4) | file ref (4) | block id (4) | payload (capacity) | crc32 (4) |
//! ```
//!
//! All integers are big-endian. The payload is written at its **full
//! capacity**: a block whose logical fill is shorter than its allocated
//! size is zero-padded, and the padding is included in the checksum. A
//! reader can therefore validate any frame without knowing the writer's
//! logical length.
//!
//! ## Write-cycle bracket
//!
//! All appends happen inside a `start_write` / `commit_write` |
//! `abort_write` bracket. The bracket records the journal position at
//! which it opened; aborting truncates back to it, so a failed commit
//! leaves no trace. `commit_write` forces the appended frames to durable
//! media. Outside an open bracket the on-disk journal is always a prefix
//! of validly-checksummed frames.
//!
//! ## Failure policy
//!
//! A read past the logical end of the journal and a checksum mismatch are
//! both fatal errors, never silently tolerated: the bracket discipline
//! guarantees no partial frame survives past `position`.

mod frame;
mod log;

pub use frame::{Frame, FrameType, FRAME_HEADER_SIZE};
pub use log::{Frames, Journal};
