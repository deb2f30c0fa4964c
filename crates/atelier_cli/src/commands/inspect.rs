//! Inspect command implementation.

use super::{format_size, open_existing};
use crate::error::CliError;
use crate::Format;
use atelier_core::LocalStore;
use atelier_model::{EntityKind, SyncState, Timestamp};
use atelier_sync_engine::queue;
use atelier_sync_engine::{DeadReason, EntryState};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Record log size in bytes.
    pub log_bytes: u64,
    /// Frames replayed on open.
    pub frames_replayed: u64,
    /// Torn tail bytes cut away on open.
    pub truncated_bytes: u64,
    /// Total number of records.
    pub entity_count: usize,
    /// Records per kind.
    pub kinds: Vec<KindCounts>,
    /// Sync queue summary.
    pub queue: QueueSummary,
    /// End of the last complete drain cycle.
    pub last_sync_at: Option<Timestamp>,
}

/// Record counts for one kind.
#[derive(Debug, Serialize)]
pub struct KindCounts {
    /// Entity kind.
    pub kind: EntityKind,
    /// Number of records.
    pub total: usize,
    /// Number of records per sync state.
    pub by_state: BTreeMap<SyncState, usize>,
}

/// Sync queue counts.
#[derive(Debug, Default, Serialize)]
pub struct QueueSummary {
    /// Entries waiting to be sent.
    pub pending: usize,
    /// Entries claimed by a cycle that never finished.
    pub in_flight: usize,
    /// Dead-lettered entries, conflicts included.
    pub dead_letters: usize,
    /// Dead letters waiting for manual conflict resolution.
    pub conflicts: usize,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: Format) -> Result<(), CliError> {
    let store = open_existing(path)?;
    let result = collect(&store, path)?;

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text_output(&result),
    }
    Ok(())
}

pub(crate) fn collect(store: &LocalStore, path: &Path) -> Result<InspectResult, CliError> {
    let stats = store.stats();
    let kinds = stats
        .entities
        .iter()
        .filter(|(_, by_state)| !by_state.is_empty())
        .map(|(&kind, by_state)| KindCounts {
            kind,
            total: by_state.values().sum(),
            by_state: by_state.clone(),
        })
        .collect();

    let mut summary = QueueSummary::default();
    for entry in queue::load_committed(store)? {
        match entry.state {
            EntryState::Pending => summary.pending += 1,
            EntryState::InFlight => summary.in_flight += 1,
            EntryState::DeadLetter => {
                summary.dead_letters += 1;
                if entry.dead_reason == Some(DeadReason::Conflict) {
                    summary.conflicts += 1;
                }
            }
        }
    }

    Ok(InspectResult {
        path: path.display().to_string(),
        log_bytes: stats.log_bytes,
        frames_replayed: stats.recovery.frames_replayed,
        truncated_bytes: stats.recovery.truncated_bytes,
        entity_count: stats.entity_count(),
        kinds,
        queue: summary,
        last_sync_at: queue::last_sync_at(store),
    })
}

fn print_text_output(result: &InspectResult) {
    println!("Atelier Store Inspection");
    println!("========================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Log:");
    println!("  Size:            {}", format_size(result.log_bytes));
    println!("  Frames replayed: {}", result.frames_replayed);
    if result.truncated_bytes > 0 {
        println!("  Torn tail cut:   {}", format_size(result.truncated_bytes));
    }
    println!();
    println!("Records: {}", result.entity_count);
    for kind in &result.kinds {
        let states: Vec<String> = kind
            .by_state
            .iter()
            .map(|(state, count)| format!("{state:?}={count}"))
            .collect();
        println!("  {:<22} {:>6}  ({})", kind.kind, kind.total, states.join(", "));
    }
    println!();
    println!("Sync queue:");
    println!("  Pending:      {}", result.queue.pending);
    if result.queue.in_flight > 0 {
        println!("  In flight:    {}", result.queue.in_flight);
    }
    println!("  Dead letters: {}", result.queue.dead_letters);
    println!("  Conflicts:    {}", result.queue.conflicts);
    match result.last_sync_at {
        Some(at) => println!("  Last sync:    {at}"),
        None => println!("  Last sync:    never"),
    }
}
