//! CLI command implementations.

pub mod compact;
pub mod inspect;
pub mod queue;
pub mod verify;

use atelier_core::{Config, CoreResult, LocalStore};
use std::path::Path;

/// Opens an existing store; never creates one.
pub(crate) fn open_existing(path: &Path) -> CoreResult<LocalStore> {
    LocalStore::open_with_config(path, Config::default().create_if_missing(false))
}

pub(crate) fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} bytes")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
