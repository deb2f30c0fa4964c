//! In-memory reference remote.
//!
//! Behaves like a well-formed backend: it assigns its own identifiers,
//! stamps versions from a monotonic clock, deduplicates idempotency keys,
//! detects stale writes and refuses dangling references. Tests drive it by
//! toggling connectivity, injecting failures and editing records server-side.

use crate::error::{RemoteError, RemoteResult};
use crate::remote::{CreateRequest, DeleteRequest, RemoteClient, UpdateRequest};
use atelier_model::{Entity, EntityBody, EntityId, EntityKind, SyncState, Timestamp};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Operation recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    /// `create`
    Create,
    /// `update`
    Update,
    /// `delete`
    Delete,
    /// `fetch`
    Fetch,
}

/// One call received by the remote, whatever its outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    /// Operation.
    pub op: RemoteOp,
    /// Target kind.
    pub kind: EntityKind,
    /// Identifier as sent by the client.
    pub id: EntityId,
    /// Idempotency key, for writes.
    pub idempotency_key: Option<Uuid>,
}

#[derive(Debug, Clone)]
enum Injection {
    Fail(RemoteError),
    LoseResponse,
}

#[derive(Debug, Clone)]
enum Applied {
    Created(Entity),
    Updated(Entity),
    Deleted,
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<(EntityKind, EntityId), Entity>,
    applied: HashMap<Uuid, Applied>,
    injected: VecDeque<Injection>,
    calls: Vec<RemoteCall>,
    clock: Timestamp,
    latency: Duration,
}

impl Inner {
    fn stamp(&mut self) -> Timestamp {
        let next = Timestamp::now().max(Timestamp::from_millis(self.clock.as_millis() + 1));
        self.clock = next;
        next
    }

    fn check_references(&self, body: &EntityBody) -> RemoteResult<()> {
        for reference in body.references() {
            if !self.records.contains_key(&(reference.kind, reference.id)) {
                return Err(RemoteError::rejected(format!(
                    "{} references unknown {} {}",
                    reference.field, reference.kind, reference.id
                )));
            }
        }
        Ok(())
    }

    fn create(&mut self, request: CreateRequest, assign_ids: bool) -> RemoteResult<Entity> {
        if let Some(Applied::Created(entity)) = self.applied.get(&request.idempotency_key) {
            return Ok(entity.clone());
        }
        let mut entity = request.entity;
        self.check_references(&entity.body)?;

        if assign_ids {
            entity.meta.id = EntityId::new();
        }
        let key = (entity.kind(), entity.id());
        if self.records.contains_key(&key) {
            return Err(RemoteError::rejected(format!("duplicate id {}", entity.id())));
        }

        entity.meta.updated_at = Some(self.stamp());
        entity.meta.sync_state = SyncState::Synced;
        entity.meta.base_version = None;
        entity.meta.sync_failure = None;
        self.records.insert(key, entity.clone());
        self.applied
            .insert(request.idempotency_key, Applied::Created(entity.clone()));
        Ok(entity)
    }

    fn update(&mut self, request: UpdateRequest) -> RemoteResult<Entity> {
        if let Some(Applied::Updated(entity)) = self.applied.get(&request.idempotency_key) {
            return Ok(entity.clone());
        }
        let key = (request.entity.kind(), request.entity.id());
        let current = self.records.get(&key).ok_or(RemoteError::NotFound)?;
        if Some(current.last_modified()) != request.base_version {
            return Err(RemoteError::Conflict);
        }
        self.check_references(&request.entity.body)?;

        let mut updated = current.clone();
        updated.body = request.entity.body;
        updated.meta.updated_at = Some(self.stamp());
        self.records.insert(key, updated.clone());
        self.applied
            .insert(request.idempotency_key, Applied::Updated(updated.clone()));
        Ok(updated)
    }

    fn delete(&mut self, request: DeleteRequest) -> RemoteResult<()> {
        if let Some(Applied::Deleted) = self.applied.get(&request.idempotency_key) {
            return Ok(());
        }
        let key = (request.kind, request.id);
        if let Some(current) = self.records.get(&key) {
            if Some(current.last_modified()) != request.base_version {
                return Err(RemoteError::Conflict);
            }
            self.records.remove(&key);
        }
        self.applied.insert(request.idempotency_key, Applied::Deleted);
        Ok(())
    }
}

/// A remote backed by a process-local map.
#[derive(Debug)]
pub struct InMemoryRemote {
    inner: Mutex<Inner>,
    online: AtomicBool,
    assign_ids: bool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    /// Creates an online remote that assigns its own identifiers.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            online: AtomicBool::new(true),
            assign_ids: true,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Creates a remote that keeps client identifiers.
    pub fn keeping_client_ids() -> Self {
        Self {
            assign_ids: false,
            ..Self::new()
        }
    }

    /// Makes the remote reachable or not.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Returns whether the remote is reachable.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().latency = latency;
    }

    /// Makes the next call fail with `error` without touching any record.
    pub fn fail_next(&self, error: RemoteError) {
        self.inner.lock().injected.push_back(Injection::Fail(error));
    }

    /// Applies the next write but reports `NetworkUnavailable`, as if the
    /// response was lost in transit.
    pub fn lose_next_response(&self) {
        self.inner.lock().injected.push_back(Injection::LoseResponse);
    }

    /// Edits a record server-side, stamping a fresh version.
    pub fn server_edit<F>(&self, kind: EntityKind, id: EntityId, f: F) -> Option<Entity>
    where
        F: FnOnce(&mut EntityBody),
    {
        let mut inner = self.inner.lock();
        let at = inner.stamp();
        Self::edit(&mut inner, kind, id, at, f)
    }

    /// Edits a record server-side with an explicit version stamp.
    pub fn server_edit_at<F>(&self, kind: EntityKind, id: EntityId, at: Timestamp, f: F) -> Option<Entity>
    where
        F: FnOnce(&mut EntityBody),
    {
        let mut inner = self.inner.lock();
        inner.clock = inner.clock.max(at);
        Self::edit(&mut inner, kind, id, at, f)
    }

    fn edit<F>(inner: &mut Inner, kind: EntityKind, id: EntityId, at: Timestamp, f: F) -> Option<Entity>
    where
        F: FnOnce(&mut EntityBody),
    {
        let record = inner.records.get_mut(&(kind, id))?;
        f(&mut record.body);
        record.meta.updated_at = Some(at);
        Some(record.clone())
    }

    /// Deletes a record server-side.
    pub fn server_delete(&self, kind: EntityKind, id: EntityId) -> Option<Entity> {
        self.inner.lock().records.remove(&(kind, id))
    }

    /// Returns a stored record.
    pub fn get(&self, kind: EntityKind, id: EntityId) -> Option<Entity> {
        self.inner.lock().records.get(&(kind, id)).cloned()
    }

    /// Returns all records of `kind`.
    pub fn records(&self, kind: EntityKind) -> Vec<Entity> {
        self.inner
            .lock()
            .records
            .values()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }

    /// Total number of stored records.
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns every call received so far.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.inner.lock().calls.clone()
    }

    /// Counts received calls of one operation.
    pub fn call_count(&self, op: RemoteOp) -> usize {
        self.inner.lock().calls.iter().filter(|c| c.op == op).count()
    }

    /// Highest number of calls observed in progress at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, call: RemoteCall) -> RemoteResult<CallGuard<'_>> {
        let latency = {
            let mut inner = self.inner.lock();
            inner.calls.push(call);
            inner.latency
        };
        let mut guard = CallGuard::new(self);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if !self.is_online() {
            return Err(RemoteError::network("remote unreachable"));
        }
        match self.inner.lock().injected.pop_front() {
            Some(Injection::Fail(error)) => Err(error),
            Some(Injection::LoseResponse) => {
                guard.lose_response = true;
                Ok(guard)
            }
            None => Ok(guard),
        }
    }
}

struct CallGuard<'a> {
    remote: &'a InMemoryRemote,
    lose_response: bool,
}

impl<'a> CallGuard<'a> {
    fn new(remote: &'a InMemoryRemote) -> Self {
        let now = remote.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        remote.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self {
            remote,
            lose_response: false,
        }
    }

    fn finish<T>(&self, result: RemoteResult<T>) -> RemoteResult<T> {
        match result {
            Ok(_) if self.lose_response => Err(RemoteError::network("response lost")),
            other => other,
        }
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.remote.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RemoteClient for InMemoryRemote {
    async fn create(&self, request: CreateRequest) -> RemoteResult<Entity> {
        let guard = self
            .enter(RemoteCall {
                op: RemoteOp::Create,
                kind: request.entity.kind(),
                id: request.entity.id(),
                idempotency_key: Some(request.idempotency_key),
            })
            .await?;
        let result = self.inner.lock().create(request, self.assign_ids);
        guard.finish(result)
    }

    async fn update(&self, request: UpdateRequest) -> RemoteResult<Entity> {
        let guard = self
            .enter(RemoteCall {
                op: RemoteOp::Update,
                kind: request.entity.kind(),
                id: request.entity.id(),
                idempotency_key: Some(request.idempotency_key),
            })
            .await?;
        let result = self.inner.lock().update(request);
        guard.finish(result)
    }

    async fn delete(&self, request: DeleteRequest) -> RemoteResult<()> {
        let guard = self
            .enter(RemoteCall {
                op: RemoteOp::Delete,
                kind: request.kind,
                id: request.id,
                idempotency_key: Some(request.idempotency_key),
            })
            .await?;
        let result = self.inner.lock().delete(request);
        guard.finish(result)
    }

    async fn fetch(&self, kind: EntityKind, id: EntityId) -> RemoteResult<Option<Entity>> {
        let _guard = self
            .enter(RemoteCall {
                op: RemoteOp::Fetch,
                kind,
                id,
                idempotency_key: None,
            })
            .await?;
        Ok(self.get(kind, id))
    }
}
