//! # quadstore storage
//!
//! Byte-store backend trait and implementations for quadstore.
//!
//! This crate is the lowest-level seam of the engine. Backends are
//! **opaque byte stores**: they read, append, overwrite and truncate raw
//! bytes, and they make bytes durable on request. All file-format
//! interpretation (journal frames, object records, blocks) lives above
//! this crate.
//!
//! ## Available backends
//!
//! - [`FileBackend`] - persistent storage over OS file APIs
//! - [`MemBackend`] - in-memory storage for tests and ephemeral datasets
//!
//! ## Example
//!
//! ```rust
//! use quadstore_storage::{StorageBackend, MemBackend};
//!
//! let mut backend = MemBackend::new();
//! let offset = backend.append(b"frame bytes").unwrap();
//! let data = backend.read_at(offset, 11).unwrap();
//! assert_eq!(&data, b"frame bytes");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::MemBackend;
