//! Remote client contract.

use crate::error::RemoteResult;
use atelier_model::{Entity, EntityId, EntityKind, Timestamp};
use serde::{Deserialize, Serialize};
use std::future::Future;
use uuid::Uuid;

/// Creates a record on the remote.
///
/// `idempotency_key` is generated once per queue entry and reused on every
/// retry, so a create whose response was lost is never applied twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRequest {
    /// Client-generated deduplication token.
    pub idempotency_key: Uuid,
    /// Full record, carrying the local identifier.
    pub entity: Entity,
}

/// Replaces a record on the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    /// Client-generated deduplication token.
    pub idempotency_key: Uuid,
    /// Full record.
    pub entity: Entity,
    /// Remote version the write is based on.
    pub base_version: Option<Timestamp>,
}

/// Deletes a record on the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteRequest {
    /// Client-generated deduplication token.
    pub idempotency_key: Uuid,
    /// Kind of the deleted record.
    pub kind: EntityKind,
    /// Remote identifier.
    pub id: EntityId,
    /// Remote version the delete is based on.
    pub base_version: Option<Timestamp>,
}

/// Typed transport to the hosted backend.
///
/// Requests dispatch on the entity kind carried by the payload, so one method
/// per operation covers every (kind, operation) pair. Implementations are
/// thin and stateless from the engine's point of view: no retries, no
/// queuing, no local mutation. Returned records are the remote's canonical
/// version; their `updated_at` is the remote version stamp.
///
/// Every call must be safe to repeat with the same idempotency key.
pub trait RemoteClient: Send + Sync + 'static {
    /// Creates a record; the result may carry a remote-assigned identifier.
    fn create(&self, request: CreateRequest) -> impl Future<Output = RemoteResult<Entity>> + Send;

    /// Updates a record; fails with `Conflict` when the remote version moved
    /// past `base_version`.
    fn update(&self, request: UpdateRequest) -> impl Future<Output = RemoteResult<Entity>> + Send;

    /// Deletes a record; fails with `Conflict` when the remote version moved
    /// past `base_version`.
    fn delete(&self, request: DeleteRequest) -> impl Future<Output = RemoteResult<()>> + Send;

    /// Fetches the current remote version, `None` if it does not exist.
    fn fetch(
        &self,
        kind: EntityKind,
        id: EntityId,
    ) -> impl Future<Output = RemoteResult<Option<Entity>>> + Send;
}
