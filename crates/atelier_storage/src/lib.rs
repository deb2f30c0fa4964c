//! # Atelier Storage
//!
//! Persistence backends for the atelier local store.
//!
//! A backend is an opaque, append-only byte log. It knows nothing about
//! entities, frames or the sync queue; `atelier_core` owns the log format and
//! only asks the backend to append, read back, make durable, cut a torn tail,
//! or atomically swap the whole content for a compacted image.
//!
//! ## Available Backends
//!
//! - [`FileBackend`] - a single file on disk, survives process restarts
//! - [`InMemoryBackend`] - ephemeral, for tests and throwaway stores
//!
//! ## Example
//!
//! ```rust
//! use atelier_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"frame").unwrap();
//! assert_eq!(backend.read_at(offset, 5).unwrap(), b"frame");
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
pub use memory::InMemoryBackend;
