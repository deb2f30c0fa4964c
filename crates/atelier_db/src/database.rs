//! The database facade.

use crate::config::DbConfig;
use crate::error::{DbError, DbResult};
use crate::integrity::{check_references, deletion_plan};
use atelier_core::{ListFilter, LocalStore, StoreStats, Transaction};
use atelier_model::{Entity, EntityBody, EntityId, EntityKind, SyncState, Timestamp};
use atelier_sync_engine::queue::{self, Enqueued, QueueEntry, QueueOp};
use atelier_sync_engine::{
    ConflictResolution, ConnectivityMonitor, CycleReport, RemoteClient, ServiceHandle,
    SyncConfig, SyncEngine, SyncStats, SyncStatus,
};
use std::path::Path;
use std::sync::Arc;

/// The single entry point of the data layer.
///
/// Every write is validated, applied to the local store and queued for the
/// remote in one transaction, and returns the locally committed entity
/// without waiting for the network. Remote outcomes show up later in the
/// entity's sync state and in [`Database::sync_status`].
///
/// # Example
///
/// ```rust,ignore
/// let db = Database::open(path, DbConfig::default(), remote, ConnectivityMonitor::new(true))?;
/// let customer = db.create(EntityBody::Customer(customer))?;
/// assert_eq!(customer.sync_state(), SyncState::PendingCreate);
/// db.force_sync().await?;
/// ```
pub struct Database<R: RemoteClient> {
    store: Arc<LocalStore>,
    engine: SyncEngine<R>,
}

impl<R: RemoteClient> std::fmt::Debug for Database<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("store", &self.store)
            .field("engine", &self.engine)
            .finish()
    }
}

impl<R: RemoteClient> Database<R> {
    /// Opens or creates a database in the directory at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be opened (missing directory, lock held by
    /// another process, corrupt log).
    pub fn open(
        path: impl AsRef<Path>,
        config: DbConfig,
        remote: Arc<R>,
        connectivity: ConnectivityMonitor,
    ) -> DbResult<Self> {
        let store = LocalStore::open_with_config(path.as_ref(), config.store)?;
        Self::with_store(store, config.sync, remote, connectivity)
    }

    /// Opens a database that lives in memory only.
    ///
    /// # Errors
    ///
    /// Fails only if the engine cannot initialize.
    pub fn open_in_memory(
        config: SyncConfig,
        remote: Arc<R>,
        connectivity: ConnectivityMonitor,
    ) -> DbResult<Self> {
        Self::with_store(LocalStore::open_in_memory()?, config, remote, connectivity)
    }

    /// Wraps an already opened store.
    ///
    /// # Errors
    ///
    /// Fails if the sync queue in the store cannot be read.
    pub fn with_store(
        store: LocalStore,
        config: SyncConfig,
        remote: Arc<R>,
        connectivity: ConnectivityMonitor,
    ) -> DbResult<Self> {
        let store = Arc::new(store);
        let engine = SyncEngine::new(config, Arc::clone(&store), remote, connectivity)?;
        tracing::info!(path = ?store.path(), "database opened");
        Ok(Self { store, engine })
    }

    /// Creates an entity.
    ///
    /// The entity gets a local identifier and `PendingCreate`; the remote
    /// identifier replaces it once the create is confirmed.
    ///
    /// # Errors
    ///
    /// [`DbError::Validation`] if a field rule fails or a reference does not
    /// resolve. Nothing is stored or queued in that case.
    pub fn create(&self, body: EntityBody) -> DbResult<Entity> {
        reject_invalid(&body)?;
        let now = Timestamp::now();
        let entity = self.store.transaction(|txn| -> DbResult<Entity> {
            reject_dangling(txn, &body)?;
            let entity = Entity::new_local(body, now);
            txn.put(entity.clone())?;
            queue::enqueue(txn, QueueOp::Create, &entity, now)?;
            Ok(entity)
        })?;

        tracing::debug!(kind = %entity.kind(), id = %entity.id(), "entity created");
        self.engine.notify_enqueued();
        Ok(entity)
    }

    /// Replaces the fields of an entity.
    ///
    /// An unchanged body is a no-op. An entity that was never confirmed
    /// stays `PendingCreate`.
    ///
    /// # Errors
    ///
    /// - [`DbError::Validation`] for field rule or reference failures
    /// - [`DbError::NotFound`] if the entity does not exist
    /// - [`DbError::InvalidState`] while the entity is in conflict or being
    ///   deleted
    pub fn update(&self, kind: EntityKind, id: EntityId, body: EntityBody) -> DbResult<Entity> {
        if body.kind() != kind {
            return Err(DbError::violation(
                "kind",
                format!("expected {kind} fields, got {}", body.kind()),
            ));
        }
        reject_invalid(&body)?;

        let now = Timestamp::now();
        let (entity, queued) = self.store.transaction(|txn| -> DbResult<(Entity, bool)> {
            let mut entity = txn.get(kind, &id).ok_or(DbError::NotFound { kind, id })?;
            ensure_writable(&entity)?;
            if entity.body == body {
                return Ok((entity, false));
            }
            reject_dangling(txn, &body)?;

            entity.body = body;
            entity.meta.updated_at = Some(next_version(&entity, now));
            if entity.meta.sync_state != SyncState::PendingCreate {
                entity.meta.sync_state = SyncState::PendingUpdate;
            }
            if let Enqueued::Rearmed { .. } = queue::enqueue(txn, QueueOp::Update, &entity, now)? {
                entity.meta.sync_failure = None;
            }
            txn.put(entity.clone())?;
            Ok((entity, true))
        })?;

        if queued {
            tracing::debug!(%kind, %id, "entity updated");
            self.engine.notify_enqueued();
        }
        Ok(entity)
    }

    /// Applies `edit` to the current fields and stores the result.
    ///
    /// # Errors
    ///
    /// Same as [`Database::update`].
    pub fn modify<F>(&self, kind: EntityKind, id: EntityId, edit: F) -> DbResult<Entity>
    where
        F: FnOnce(&mut EntityBody),
    {
        let mut body = self
            .store
            .get(kind, &id)
            .ok_or(DbError::NotFound { kind, id })?
            .body;
        edit(&mut body);
        self.update(kind, id, body)
    }

    /// Deletes an entity and its dependents.
    ///
    /// Records the remote has never seen are removed at once; the others are
    /// marked `PendingDelete` and disappear when the remote confirms.
    /// Deleting a record already pending deletion is a no-op.
    ///
    /// # Errors
    ///
    /// - [`DbError::NotFound`] if the entity does not exist
    /// - [`DbError::Validation`] if other records still reference it
    /// - [`DbError::InvalidState`] if it or a dependent is in conflict
    pub fn delete(&self, kind: EntityKind, id: EntityId) -> DbResult<()> {
        let now = Timestamp::now();
        let deleted = self.store.transaction(|txn| -> DbResult<usize> {
            let root = txn.get(kind, &id).ok_or(DbError::NotFound { kind, id })?;
            if root.sync_state() == SyncState::PendingDelete {
                return Ok(0);
            }

            let plan = deletion_plan(txn, root)?;
            let count = plan.len();
            for mut entity in plan {
                entity.meta.updated_at = Some(next_version(&entity, now));
                entity.meta.sync_state = SyncState::PendingDelete;
                match queue::enqueue(txn, QueueOp::Delete, &entity, now)? {
                    Enqueued::Cancelled => txn.remove(entity.kind(), entity.id())?,
                    _ => txn.put(entity)?,
                }
            }
            Ok(count)
        })?;

        if deleted > 0 {
            tracing::debug!(%kind, %id, records = deleted, "entity deleted");
            self.engine.notify_enqueued();
        }
        Ok(())
    }

    /// Returns an entity.
    pub fn get(&self, kind: EntityKind, id: &EntityId) -> Option<Entity> {
        self.store.get(kind, id)
    }

    /// Lists entities of `kind`, in insertion order unless `filter` sorts.
    pub fn list(&self, kind: EntityKind, filter: &ListFilter) -> Vec<Entity> {
        self.store.list(kind, filter)
    }

    /// Returns the queue status.
    ///
    /// # Errors
    ///
    /// Fails if the queue cannot be read.
    pub fn sync_status(&self) -> DbResult<SyncStatus> {
        Ok(self.engine.status()?)
    }

    /// Runs one full drain cycle (or joins one that started after the call)
    /// and returns its report.
    ///
    /// # Errors
    ///
    /// Fails on local store errors only.
    pub async fn force_sync(&self) -> DbResult<CycleReport> {
        Ok(self.engine.force_sync().await?)
    }

    /// Starts the background sync service.
    ///
    /// # Errors
    ///
    /// Fails if the service already runs.
    pub fn start(&self) -> DbResult<ServiceHandle> {
        Ok(self.engine.start()?)
    }

    /// Settles a conflict flagged for manual review.
    ///
    /// # Errors
    ///
    /// Fails if no flagged conflict exists for the entity.
    pub async fn resolve_conflict(
        &self,
        kind: EntityKind,
        id: EntityId,
        resolution: ConflictResolution,
    ) -> DbResult<()> {
        Ok(self.engine.resolve_conflict(kind, id, resolution).await?)
    }

    /// Re-queues every non-conflict dead letter. Returns how many.
    ///
    /// # Errors
    ///
    /// Fails on local store errors.
    pub async fn retry_failed(&self) -> DbResult<usize> {
        Ok(self.engine.retry_failed().await?)
    }

    /// Returns the dead-lettered queue entries.
    ///
    /// # Errors
    ///
    /// Fails if the queue cannot be read.
    pub fn dead_letters(&self) -> DbResult<Vec<QueueEntry>> {
        Ok(self.engine.dead_letters()?)
    }

    /// Returns the sync engine.
    pub fn engine(&self) -> &SyncEngine<R> {
        &self.engine
    }

    /// Returns the connectivity monitor.
    pub fn connectivity(&self) -> &ConnectivityMonitor {
        self.engine.connectivity()
    }

    /// Returns engine statistics.
    pub fn sync_stats(&self) -> SyncStats {
        self.engine.stats()
    }

    /// Returns store statistics.
    pub fn store_stats(&self) -> StoreStats {
        self.store.stats()
    }

    /// Returns the local store.
    pub fn store(&self) -> &LocalStore {
        &self.store
    }
}

fn reject_invalid(body: &EntityBody) -> DbResult<()> {
    let violations = body.validate();
    if violations.is_empty() {
        Ok(())
    } else {
        Err(DbError::Validation(violations))
    }
}

fn reject_dangling(txn: &Transaction<'_>, body: &EntityBody) -> DbResult<()> {
    let violations = check_references(txn, body);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(DbError::Validation(violations))
    }
}

fn ensure_writable(entity: &Entity) -> DbResult<()> {
    let message = match entity.sync_state() {
        SyncState::Conflict => "resolve the sync conflict first",
        SyncState::PendingDelete => "entity is being deleted",
        _ => return Ok(()),
    };
    Err(DbError::InvalidState {
        kind: entity.kind(),
        id: entity.id(),
        state: entity.sync_state(),
        message: message.into(),
    })
}

/// Local versions strictly increase even within one millisecond.
fn next_version(entity: &Entity, now: Timestamp) -> Timestamp {
    now.max(Timestamp::from_millis(entity.last_modified().as_millis() + 1))
}
