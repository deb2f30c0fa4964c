//! Queue command implementation.

use super::open_existing;
use crate::error::CliError;
use crate::Format;
use atelier_model::{EntityId, EntityKind, Timestamp};
use atelier_sync_engine::queue;
use atelier_sync_engine::{DeadReason, EntryState, QueueEntry, QueueOp};
use serde::Serialize;
use std::path::Path;

/// One queue entry, without its payload.
#[derive(Debug, Serialize)]
pub struct EntryRow {
    /// Queue position.
    pub seq: u64,
    /// Target kind.
    pub kind: EntityKind,
    /// Target identifier.
    pub id: EntityId,
    /// Mutation.
    pub op: QueueOp,
    /// Lifecycle state.
    pub state: EntryState,
    /// Transport failures so far.
    pub attempts: u32,
    /// Earliest next attempt.
    pub next_attempt_at: Timestamp,
    /// Why the entry is dead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_reason: Option<DeadReason>,
    /// Last failure message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<QueueEntry> for EntryRow {
    fn from(entry: QueueEntry) -> Self {
        Self {
            seq: entry.seq,
            kind: entry.kind,
            id: entry.entity_id,
            op: entry.op,
            state: entry.state,
            attempts: entry.attempts,
            next_attempt_at: entry.next_attempt_at,
            dead_reason: entry.dead_reason,
            last_error: entry.last_error,
        }
    }
}

/// Runs the queue command.
pub fn run(path: &Path, dead_only: bool, format: Format) -> Result<(), CliError> {
    let store = open_existing(path)?;
    let rows = rows(queue::load_committed(&store)?, dead_only);

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        Format::Text => {
            if rows.is_empty() {
                println!("Queue is empty");
            }
            for row in &rows {
                print!(
                    "#{:<6} {:<8} {:<22} {}  {:?}, {} attempt(s)",
                    row.seq,
                    format!("{:?}", row.op),
                    row.kind,
                    row.id,
                    row.state,
                    row.attempts
                );
                if let Some(reason) = row.dead_reason {
                    print!(", {reason:?}");
                }
                if let Some(error) = &row.last_error {
                    print!(": {error}");
                }
                println!();
            }
        }
    }
    Ok(())
}

pub(crate) fn rows(entries: Vec<QueueEntry>, dead_only: bool) -> Vec<EntryRow> {
    entries
        .into_iter()
        .filter(|e| !dead_only || e.state == EntryState::DeadLetter)
        .map(EntryRow::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_core::{CoreResult, LocalStore};
    use atelier_model::{Customer, Entity, EntityBody};

    fn customer(name: &str) -> Entity {
        Entity::new_local(
            EntityBody::Customer(Customer {
                name: name.into(),
                phone: None,
                email: None,
                address: None,
                notes: None,
            }),
            Timestamp::now(),
        )
    }

    #[test]
    fn dead_filter_keeps_only_dead_letters() {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .transaction(|txn| -> CoreResult<()> {
                for name in ["a", "b"] {
                    let entity = customer(name);
                    txn.put(entity.clone())?;
                    queue::enqueue(txn, QueueOp::Create, &entity, Timestamp::now())?;
                }
                let mut first = queue::load(txn)?.remove(0);
                first.state = EntryState::DeadLetter;
                first.dead_reason = Some(DeadReason::Rejected);
                first.last_error = Some("duplicate".into());
                queue::save(txn, &first)
            })
            .unwrap();

        let entries = queue::load_committed(&store).unwrap();
        assert_eq!(rows(entries.clone(), false).len(), 2);

        let dead = rows(entries, true);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].dead_reason, Some(DeadReason::Rejected));

        let json = serde_json::to_value(&dead).unwrap();
        assert_eq!(json[0]["state"], "dead_letter");
        assert_eq!(json[0]["op"], "create");
    }
}
