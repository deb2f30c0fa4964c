//! The durable sync queue.
//!
//! Entries live in an auxiliary keyspace of the local store, keyed by a
//! monotonically assigned sequence number, so enqueuing commits in the same
//! transaction as the local write it describes.
//!
//! Coalescing only ever touches an entry the remote cannot have applied: once
//! an attempt may have reached it, later writes queue behind it and keep their
//! own idempotency keys. A write over an entry the remote rejected replaces
//! the rejected payload and re-arms the entry.

use atelier_core::{codec, CoreResult, LocalStore, Transaction};
use atelier_model::{Entity, EntityId, EntityKind, Reference, Timestamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Keyspace holding queue entries.
pub const QUEUE_NS: &str = "sync.queue";

/// Keyspace holding sync metadata.
pub const META_NS: &str = "sync.meta";

/// Key of the last completed drain cycle time in [`META_NS`].
pub const LAST_SYNC_AT: u64 = 0;

/// Mutation carried by a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOp {
    /// Create the record remotely.
    Create,
    /// Replace the record remotely.
    Update,
    /// Delete the record remotely.
    Delete,
}

/// Lifecycle state of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Waiting to be sent.
    Pending,
    /// Handed to the remote by the current drain cycle. Treated as
    /// `Pending` after a restart.
    InFlight,
    /// Will not be retried automatically.
    DeadLetter,
}

/// Why an entry was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadReason {
    /// The remote refused the write.
    Rejected,
    /// The remote refused the credentials.
    Unauthorized,
    /// Transport failures used up the retry budget.
    RetriesExhausted,
    /// A conflict needs manual resolution.
    Conflict,
}

/// One pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Position in the queue.
    pub seq: u64,
    /// Target kind.
    pub kind: EntityKind,
    /// Target identifier (rewritten when a create is reconciled).
    pub entity_id: EntityId,
    /// Mutation.
    pub op: QueueOp,
    /// Full record for creates and updates.
    pub payload: Option<Entity>,
    /// Remote version the write is based on.
    pub base_version: Option<Timestamp>,
    /// Deduplication token, stable across retries of this entry.
    pub idempotency_key: Uuid,
    /// Transport failures so far.
    pub attempts: u32,
    /// Earliest time of the next attempt.
    pub next_attempt_at: Timestamp,
    /// Lifecycle state.
    pub state: EntryState,
    /// Why the entry is dead, if it is.
    pub dead_reason: Option<DeadReason>,
    /// Last failure message.
    pub last_error: Option<String>,
    /// Remote version captured when a conflict was flagged.
    pub remote: Option<Entity>,
    /// Time of the local write this entry carries.
    pub written_at: Timestamp,
    /// Time the entry was first queued.
    pub enqueued_at: Timestamp,
    /// Times the write was rebased onto a newer remote version.
    pub rebases: u32,
    /// Set once an attempt ended without a definite answer, so the remote
    /// may already have applied it.
    pub maybe_delivered: bool,
}

impl QueueEntry {
    /// The (kind, identifier) the entry targets.
    pub fn key(&self) -> (EntityKind, EntityId) {
        (self.kind, self.entity_id)
    }

    /// True unless the entry is dead-lettered.
    pub fn is_live(&self) -> bool {
        self.state != EntryState::DeadLetter
    }

    /// True if a later write may fold into this entry: no attempt can have
    /// been applied remotely, either because none was made or because the
    /// remote refused it outright.
    pub fn can_absorb(&self) -> bool {
        if self.maybe_delivered {
            return false;
        }
        match self.state {
            EntryState::Pending => self.attempts == 0,
            EntryState::DeadLetter => self.dead_reason == Some(DeadReason::Rejected),
            EntryState::InFlight => false,
        }
    }

    /// References carried by the payload.
    pub fn references(&self) -> Vec<Reference> {
        self.payload
            .as_ref()
            .map(|p| p.body.references())
            .unwrap_or_default()
    }
}

/// What [`enqueue`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// A new entry was appended.
    Queued {
        /// Its sequence number.
        seq: u64,
    },
    /// An unsent entry for the same record absorbed the write.
    Coalesced {
        /// Sequence number of the absorbing entry.
        seq: u64,
    },
    /// An entry the remote had rejected absorbed the write and is pending
    /// again.
    Rearmed {
        /// Sequence number of the re-armed entry.
        seq: u64,
    },
    /// The write cancelled an unsent create; nothing is queued for the
    /// record any more and the caller should drop it locally.
    Cancelled,
}

fn decode_all(raw: Vec<(u64, Vec<u8>)>) -> CoreResult<Vec<QueueEntry>> {
    raw.into_iter()
        .map(|(_, bytes)| codec::decode(&bytes))
        .collect()
}

/// Loads every entry inside a transaction, in queue order.
///
/// # Errors
///
/// Fails if a stored entry cannot be decoded.
pub fn load(txn: &Transaction<'_>) -> CoreResult<Vec<QueueEntry>> {
    decode_all(txn.aux_list(QUEUE_NS))
}

/// Loads every entry from a committed store, in queue order.
///
/// # Errors
///
/// Fails if a stored entry cannot be decoded.
pub fn load_committed(store: &LocalStore) -> CoreResult<Vec<QueueEntry>> {
    decode_all(store.aux_list(QUEUE_NS))
}

/// Writes an entry back.
///
/// # Errors
///
/// Fails if the entry cannot be encoded.
pub fn save(txn: &mut Transaction<'_>, entry: &QueueEntry) -> CoreResult<()> {
    txn.put_aux(QUEUE_NS, entry.seq, codec::encode(entry)?)
}

/// Removes an entry.
///
/// # Errors
///
/// Propagates store errors.
pub fn remove(txn: &mut Transaction<'_>, seq: u64) -> CoreResult<()> {
    txn.remove_aux(QUEUE_NS, seq)
}

/// Queues the local write of `entity`, coalescing where safe.
///
/// - an update folds into an absorbing create or update of the same record
/// - a delete over an absorbing create cancels it outright
/// - a delete over an absorbing update replaces it
///
/// # Errors
///
/// Propagates store and codec errors.
pub fn enqueue(
    txn: &mut Transaction<'_>,
    op: QueueOp,
    entity: &Entity,
    now: Timestamp,
) -> CoreResult<Enqueued> {
    let key = (entity.kind(), entity.id());
    let entries = load(txn)?;

    let last_for_key = entries.iter().rev().find(|e| e.key() == key);
    if let Some(last) = last_for_key.filter(|e| e.can_absorb()) {
        let rearmed = last.state == EntryState::DeadLetter;
        let mut merged = last.clone();
        merged.state = EntryState::Pending;
        merged.dead_reason = None;
        merged.last_error = None;
        merged.next_attempt_at = now;
        let coalesced = match (last.op, op) {
            (QueueOp::Create | QueueOp::Update, QueueOp::Update) => {
                merged.payload = Some(entity.clone());
                merged.written_at = entity.last_modified();
                true
            }
            (QueueOp::Create, QueueOp::Delete) => {
                remove(txn, last.seq)?;
                tracing::debug!(kind = %entity.kind(), id = %entity.id(), "delete cancelled unsent create");
                return Ok(Enqueued::Cancelled);
            }
            (QueueOp::Update, QueueOp::Delete) => {
                merged.op = QueueOp::Delete;
                merged.payload = None;
                merged.written_at = entity.last_modified();
                true
            }
            _ => false,
        };
        if coalesced {
            save(txn, &merged)?;
            return Ok(if rearmed {
                Enqueued::Rearmed { seq: merged.seq }
            } else {
                Enqueued::Coalesced { seq: merged.seq }
            });
        }
    }

    let seq = entries.last().map_or(0, |e| e.seq + 1);
    let entry = QueueEntry {
        seq,
        kind: entity.kind(),
        entity_id: entity.id(),
        op,
        payload: (op != QueueOp::Delete).then(|| entity.clone()),
        base_version: entity.meta.base_version,
        idempotency_key: Uuid::new_v4(),
        attempts: 0,
        next_attempt_at: now,
        state: EntryState::Pending,
        dead_reason: None,
        last_error: None,
        remote: None,
        written_at: entity.last_modified(),
        enqueued_at: now,
        rebases: 0,
        maybe_delivered: false,
    };
    save(txn, &entry)?;
    Ok(Enqueued::Queued { seq })
}

/// Rewrites a reconciled identifier everywhere in the queue: entry keys,
/// payload identifiers and payload references.
///
/// # Errors
///
/// Propagates store and codec errors.
pub fn rename_everywhere(
    txn: &mut Transaction<'_>,
    kind: EntityKind,
    from: EntityId,
    to: EntityId,
) -> CoreResult<()> {
    for mut entry in load(txn)? {
        let mut changed = false;
        if entry.key() == (kind, from) {
            entry.entity_id = to;
            changed = true;
        }
        if let Some(payload) = entry.payload.as_mut() {
            if payload.kind() == kind && payload.id() == from {
                payload.meta.id = to;
                changed = true;
            }
            changed |= payload.rewrite_reference(kind, from, to);
        }
        if changed {
            save(txn, &entry)?;
        }
    }
    Ok(())
}

/// Turns entries left `InFlight` by an interrupted process back into
/// `Pending`. Returns how many were reset.
///
/// The remote effect of those calls is unknown, so they are marked as
/// possibly delivered.
///
/// # Errors
///
/// Propagates store and codec errors.
pub fn recover_in_flight(store: &LocalStore) -> CoreResult<usize> {
    store.transaction(|txn| {
        let mut reset = 0;
        for mut entry in load(txn)? {
            if entry.state == EntryState::InFlight {
                entry.state = EntryState::Pending;
                entry.maybe_delivered = true;
                save(txn, &entry)?;
                reset += 1;
            }
        }
        Ok(reset)
    })
}

/// Reads the time of the last completed drain cycle.
pub fn last_sync_at(store: &LocalStore) -> Option<Timestamp> {
    store
        .aux_get(META_NS, LAST_SYNC_AT)
        .and_then(|bytes| codec::decode(&bytes).ok())
}

/// Records the time of a completed drain cycle.
///
/// # Errors
///
/// Propagates store and codec errors.
pub fn set_last_sync_at(txn: &mut Transaction<'_>, at: Timestamp) -> CoreResult<()> {
    txn.put_aux(META_NS, LAST_SYNC_AT, codec::encode(&at)?)
}
