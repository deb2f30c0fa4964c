//! Database configuration.

use atelier_core::Config;
use atelier_sync_engine::SyncConfig;

/// Configuration for opening a [`crate::Database`].
#[derive(Debug, Clone, Default)]
pub struct DbConfig {
    /// Local store settings.
    pub store: Config,
    /// Sync engine settings.
    pub sync: SyncConfig,
}

impl DbConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the store settings.
    #[must_use]
    pub fn with_store(mut self, store: Config) -> Self {
        self.store = store;
        self
    }

    /// Replaces the sync settings.
    #[must_use]
    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }
}
