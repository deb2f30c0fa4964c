//! Store counters.

use atelier_model::{EntityKind, SyncState};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated without taking the store locks.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    commits: AtomicU64,
    rollbacks: AtomicU64,
    bytes_written: AtomicU64,
    compactions: AtomicU64,
}

impl Counters {
    pub(crate) fn record_commit(&self, bytes: u64) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_compaction(&self) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
    }
}

/// Facts about the store recorded while opening it.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryInfo {
    /// Frames replayed from the log.
    pub frames_replayed: u64,
    /// Bytes of a torn trailing frame cut away.
    pub truncated_bytes: u64,
}

/// A point-in-time view of the store.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Entity count per kind and sync state.
    pub entities: BTreeMap<EntityKind, BTreeMap<SyncState, usize>>,
    /// Current log size in bytes.
    pub log_bytes: u64,
    /// Transactions committed since open.
    pub commits: u64,
    /// Transactions rolled back since open.
    pub rollbacks: u64,
    /// Frame bytes appended since open.
    pub bytes_written: u64,
    /// Compactions since open.
    pub compactions: u64,
    /// What happened during open.
    pub recovery: RecoveryInfo,
}

impl StoreStats {
    pub(crate) fn fill_counters(&mut self, counters: &Counters) {
        self.commits = counters.commits.load(Ordering::Relaxed);
        self.rollbacks = counters.rollbacks.load(Ordering::Relaxed);
        self.bytes_written = counters.bytes_written.load(Ordering::Relaxed);
        self.compactions = counters.compactions.load(Ordering::Relaxed);
    }

    /// Total number of stored entities.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.entities.values().flat_map(|m| m.values()).sum()
    }

    /// Number of stored entities of `kind`.
    #[must_use]
    pub fn count_of(&self, kind: EntityKind) -> usize {
        self.entities
            .get(&kind)
            .map(|m| m.values().sum())
            .unwrap_or(0)
    }
}
