//! Compact command implementation.

use super::{format_size, open_existing};
use crate::error::CliError;
use atelier_core::LocalStore;
use std::path::Path;

/// Compaction statistics.
#[derive(Debug)]
pub struct CompactStats {
    /// Records kept (entities and queue values).
    pub records: usize,
    /// Bytes before compaction.
    pub bytes_before: u64,
    /// Bytes after compaction.
    pub bytes_after: u64,
}

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> Result<(), CliError> {
    let store = open_existing(path)?;

    println!("Compacting record log at {}", path.display());
    if dry_run {
        println!("(dry run - no changes will be made)");
        println!();
        println!("  Log size: {}", format_size(store.stats().log_bytes));
        println!("  Records:  {}", store.stats().entity_count());
        return Ok(());
    }
    println!();

    let stats = compact(&store)?;
    println!("  Size before: {}", format_size(stats.bytes_before));
    println!("  Size after:  {}", format_size(stats.bytes_after));
    println!(
        "  Space saved: {} ({:.1}%)",
        format_size(stats.bytes_before.saturating_sub(stats.bytes_after)),
        if stats.bytes_before > 0 {
            (stats.bytes_before.saturating_sub(stats.bytes_after)) as f64 / stats.bytes_before as f64
                * 100.0
        } else {
            0.0
        }
    );
    println!("✓ Compaction complete");
    Ok(())
}

pub(crate) fn compact(store: &LocalStore) -> Result<CompactStats, CliError> {
    let bytes_before = store.stats().log_bytes;
    store.compact()?;
    let after = store.stats();
    Ok(CompactStats {
        records: after.entity_count(),
        bytes_before,
        bytes_after: after.log_bytes,
    })
}
