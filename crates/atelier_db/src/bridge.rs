//! Message-passing boundary for a host shell.
//!
//! A host (desktop shell, IPC server, test harness) talks to the database by
//! sending [`BridgeRequest`]s through a [`BridgeClient`]. Each request is
//! forwarded to the [`Database`] and answered with one [`BridgeResponse`].
//! Both are serde types, so the host can carry them as JSON.
//!
//! The bridge only marshals calls: every rule lives in the facade.

use crate::database::Database;
use crate::error::{DbError, DbResult};
use atelier_core::ListFilter;
use atelier_model::{Entity, EntityBody, EntityId, EntityKind, SyncState, Violation};
use atelier_sync_engine::{ConflictResolution, CycleReport, QueueEntry, RemoteClient, SyncStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// A facade call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BridgeRequest {
    /// Create an entity.
    Create {
        /// Fields of the new entity.
        body: EntityBody,
    },
    /// Replace the fields of an entity.
    Update {
        /// Entity kind.
        kind: EntityKind,
        /// Entity identifier.
        id: EntityId,
        /// New fields.
        body: EntityBody,
    },
    /// Delete an entity.
    Delete {
        /// Entity kind.
        kind: EntityKind,
        /// Entity identifier.
        id: EntityId,
    },
    /// Read one entity.
    Get {
        /// Entity kind.
        kind: EntityKind,
        /// Entity identifier.
        id: EntityId,
    },
    /// List entities of a kind.
    List {
        /// Entity kind.
        kind: EntityKind,
        /// Only entities in this state.
        #[serde(default)]
        sync_state: Option<SyncState>,
        /// Hide entities pending deletion.
        #[serde(default)]
        live_only: bool,
        /// Maximum number of results.
        #[serde(default)]
        limit: Option<usize>,
    },
    /// Read the sync status.
    SyncStatus,
    /// Run a drain cycle now.
    ForceSync,
    /// Settle a flagged conflict.
    ResolveConflict {
        /// Entity kind.
        kind: EntityKind,
        /// Entity identifier.
        id: EntityId,
        /// Which side wins.
        resolution: ConflictResolution,
    },
    /// Re-queue dead letters.
    RetryFailed,
    /// List dead letters.
    DeadLetters,
}

/// The answer to one [`BridgeRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BridgeResponse {
    /// A single entity.
    Entity(Entity),
    /// A list of entities.
    Entities(Vec<Entity>),
    /// The delete was accepted.
    Deleted,
    /// The sync status.
    Status(SyncStatus),
    /// Report of the drain cycle.
    Synced(CycleReport),
    /// The conflict was settled.
    Resolved,
    /// Number of dead letters re-queued.
    Retried {
        /// Entries moved back to pending.
        count: usize,
    },
    /// Dead-lettered queue entries.
    DeadLetters(Vec<QueueEntry>),
    /// The call failed.
    Error(BridgeError),
}

/// Machine-readable failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Field or reference rule broken.
    Validation,
    /// No such entity.
    NotFound,
    /// Entity state forbids the call.
    InvalidState,
    /// Local store failure.
    Storage,
    /// Sync engine failure.
    Sync,
}

/// A failed facade call, as seen by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeError {
    /// Failure category.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Broken rules, for validation failures.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
}

impl From<&DbError> for BridgeError {
    fn from(error: &DbError) -> Self {
        let code = match error {
            DbError::Validation(_) => ErrorCode::Validation,
            DbError::NotFound { .. } => ErrorCode::NotFound,
            DbError::InvalidState { .. } => ErrorCode::InvalidState,
            DbError::Storage(_) => ErrorCode::Storage,
            DbError::Sync(_) => ErrorCode::Sync,
        };
        Self {
            code,
            message: error.to_string(),
            violations: error.violations().to_vec(),
        }
    }
}

/// Transport failures of the bridge itself.
#[derive(Error, Debug)]
pub enum BridgeFailure {
    /// The serving task is gone.
    #[error("bridge is closed")]
    Closed,

    /// A message could not be parsed or encoded.
    #[error("malformed bridge message: {0}")]
    Json(#[from] serde_json::Error),
}

struct Envelope {
    request: BridgeRequest,
    reply: oneshot::Sender<BridgeResponse>,
}

/// Sending half of the bridge. Cheap to clone.
#[derive(Clone)]
pub struct BridgeClient {
    tx: mpsc::Sender<Envelope>,
}

impl std::fmt::Debug for BridgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeClient")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl BridgeClient {
    /// Sends a request and waits for its response.
    ///
    /// # Errors
    ///
    /// [`BridgeFailure::Closed`] if the serving task has stopped.
    pub async fn call(&self, request: BridgeRequest) -> Result<BridgeResponse, BridgeFailure> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Envelope { request, reply })
            .await
            .map_err(|_| BridgeFailure::Closed)?;
        response.await.map_err(|_| BridgeFailure::Closed)
    }

    /// Like [`BridgeClient::call`], with the request and response as JSON.
    ///
    /// # Errors
    ///
    /// Fails if the request is not valid JSON for a [`BridgeRequest`] or the
    /// bridge is closed.
    pub async fn call_json(&self, request: &str) -> Result<String, BridgeFailure> {
        let request: BridgeRequest = serde_json::from_str(request)?;
        let response = self.call(request).await?;
        Ok(serde_json::to_string(&response)?)
    }
}

/// Starts serving `db` on the current tokio runtime.
///
/// Requests are handled concurrently; a slow `ForceSync` does not hold up
/// reads. The serving task ends once every [`BridgeClient`] is dropped.
pub fn spawn<R: RemoteClient>(
    db: Arc<Database<R>>,
    capacity: usize,
) -> (BridgeClient, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let task = tokio::spawn(serve(db, rx));
    (BridgeClient { tx }, task)
}

async fn serve<R: RemoteClient>(db: Arc<Database<R>>, mut rx: mpsc::Receiver<Envelope>) {
    while let Some(Envelope { request, reply }) = rx.recv().await {
        let db = Arc::clone(&db);
        tokio::spawn(async move {
            let response = handle(&db, request).await;
            // The caller may have given up waiting.
            let _ = reply.send(response);
        });
    }
    tracing::debug!("bridge closed");
}

/// Runs one request against `db`.
pub async fn handle<R: RemoteClient>(db: &Database<R>, request: BridgeRequest) -> BridgeResponse {
    match dispatch(db, request).await {
        Ok(response) => response,
        Err(error) => {
            tracing::debug!(%error, "bridge call failed");
            BridgeResponse::Error(BridgeError::from(&error))
        }
    }
}

async fn dispatch<R: RemoteClient>(
    db: &Database<R>,
    request: BridgeRequest,
) -> DbResult<BridgeResponse> {
    let response = match request {
        BridgeRequest::Create { body } => BridgeResponse::Entity(db.create(body)?),
        BridgeRequest::Update { kind, id, body } => {
            BridgeResponse::Entity(db.update(kind, id, body)?)
        }
        BridgeRequest::Delete { kind, id } => {
            db.delete(kind, id)?;
            BridgeResponse::Deleted
        }
        BridgeRequest::Get { kind, id } => {
            BridgeResponse::Entity(db.get(kind, &id).ok_or(DbError::NotFound { kind, id })?)
        }
        BridgeRequest::List {
            kind,
            sync_state,
            live_only,
            limit,
        } => {
            let mut filter = ListFilter::new();
            if let Some(state) = sync_state {
                filter = filter.sync_state(state);
            }
            if live_only {
                filter = filter.live_only();
            }
            if let Some(limit) = limit {
                filter = filter.limit(limit);
            }
            BridgeResponse::Entities(db.list(kind, &filter))
        }
        BridgeRequest::SyncStatus => BridgeResponse::Status(db.sync_status()?),
        BridgeRequest::ForceSync => BridgeResponse::Synced(db.force_sync().await?),
        BridgeRequest::ResolveConflict {
            kind,
            id,
            resolution,
        } => {
            db.resolve_conflict(kind, id, resolution).await?;
            BridgeResponse::Resolved
        }
        BridgeRequest::RetryFailed => BridgeResponse::Retried {
            count: db.retry_failed().await?,
        },
        BridgeRequest::DeadLetters => BridgeResponse::DeadLetters(db.dead_letters()?),
    };
    Ok(response)
}
