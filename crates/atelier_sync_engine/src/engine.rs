//! The sync engine.
//!
//! A drain cycle claims waves of ready queue entries, sends each wave
//! concurrently (bounded by `concurrency`), and applies every outcome to the
//! local store in its own transaction. At most one cycle runs at a time: all
//! triggers go through the drain lock.
//!
//! An entry is ready when it is `Pending`, its retry time has come, it is the
//! oldest entry for its record, it has not been tried yet in this cycle, and
//! its payload does not reference a record whose create is still queued. A
//! delete also waits while a queued delete of a record referencing it is
//! still unconfirmed.

use crate::config::SyncConfig;
use crate::conflict::{decide, ConflictCase, ConflictResolution, Decision};
use crate::connectivity::ConnectivityMonitor;
use crate::error::{RemoteError, RemoteResult, SyncError, SyncResult};
use crate::queue::{self, DeadReason, EntryState, QueueEntry, QueueOp};
use crate::remote::{CreateRequest, DeleteRequest, RemoteClient, UpdateRequest};
use atelier_core::{CoreResult, LocalStore, Transaction};
use atelier_model::{
    validate, Entity, EntityId, EntityKind, FailureReason, SyncFailure, SyncState, Timestamp,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Interval, MissedTickBehavior};

/// Why a drain cycle stopped with work left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The remote went or looked unreachable.
    Offline,
    /// The remote refused the credentials.
    Unauthorized,
}

/// Summary of one drain cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Cycle number, counted from 1 per engine.
    pub cycle: u64,
    /// Entries confirmed by the remote.
    pub pushed: usize,
    /// Transport failures that were scheduled for retry.
    pub retries_scheduled: usize,
    /// Entries moved to the dead-letter state.
    pub dead_lettered: usize,
    /// Conflicts settled by the automatic policy.
    pub conflicts_auto_resolved: usize,
    /// Conflicts left for manual review.
    pub conflicts_flagged: usize,
    /// Creates whose remote identifier replaced the local one.
    pub ids_reconciled: usize,
    /// Set when the cycle ended before the queue was drained.
    pub ended_early: Option<StopReason>,
    /// Wall time of the cycle.
    pub duration: Duration,
}

/// Cumulative engine statistics.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Drain cycles completed.
    pub cycles_completed: u64,
    /// Entries confirmed by the remote.
    pub entries_pushed: u64,
    /// Retries scheduled after transport failures.
    pub retries_scheduled: u64,
    /// Entries dead-lettered.
    pub dead_lettered: u64,
    /// Conflicts settled automatically.
    pub conflicts_auto_resolved: u64,
    /// Conflicts flagged for manual review.
    pub conflicts_flagged: u64,
    /// Identifiers reconciled after creates.
    pub ids_reconciled: u64,
    /// Last failure message.
    pub last_error: Option<String>,
    /// Report of the last completed cycle.
    pub last_cycle: Option<CycleReport>,
}

/// Point-in-time view of the sync queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Entries still to be confirmed (dead letters excluded).
    pub pending_count: usize,
    /// Dead-lettered entries, conflicts included.
    pub dead_letter_count: usize,
    /// Dead-lettered entries waiting for manual conflict resolution.
    pub conflict_count: usize,
    /// End of the last drain cycle that emptied the ready queue.
    pub last_sync_at: Option<Timestamp>,
    /// Connectivity as currently observed.
    pub is_online: bool,
    /// Whether a drain cycle is running.
    pub draining: bool,
}

enum Attempt {
    Created(Entity),
    Updated(Entity),
    Deleted,
    Conflict(Option<Entity>),
    Failed(RemoteError),
}

enum Flow {
    Continue,
    TransportFailure,
    Stop(StopReason),
}

struct Cycle {
    attempted: HashSet<u64>,
    report: CycleReport,
}

struct Shared<R> {
    config: SyncConfig,
    store: Arc<LocalStore>,
    remote: Arc<R>,
    connectivity: ConnectivityMonitor,
    drain_lock: tokio::sync::Mutex<()>,
    cycles_started: AtomicU64,
    last_report: Mutex<Option<CycleReport>>,
    stats: RwLock<SyncStats>,
    wake: Notify,
    running: AtomicBool,
}

/// Drains the sync queue against a [`RemoteClient`].
///
/// Cheap to clone; clones share the drain lock and statistics.
pub struct SyncEngine<R: RemoteClient> {
    shared: Arc<Shared<R>>,
}

impl<R: RemoteClient> Clone for SyncEngine<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R: RemoteClient> std::fmt::Debug for SyncEngine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.shared.config)
            .field("connectivity", &self.shared.connectivity)
            .field("running", &self.shared.running.load(Ordering::SeqCst))
            .finish()
    }
}

impl<R: RemoteClient> SyncEngine<R> {
    /// Creates an engine over `store`.
    ///
    /// Entries left `InFlight` by a previous process are returned to
    /// `Pending`.
    ///
    /// # Errors
    ///
    /// Fails if the queue cannot be read or rewritten.
    pub fn new(
        config: SyncConfig,
        store: Arc<LocalStore>,
        remote: Arc<R>,
        connectivity: ConnectivityMonitor,
    ) -> SyncResult<Self> {
        let recovered = queue::recover_in_flight(&store)?;
        if recovered > 0 {
            tracing::info!(entries = recovered, "resumed entries interrupted in flight");
        }
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                store,
                remote,
                connectivity,
                drain_lock: tokio::sync::Mutex::new(()),
                cycles_started: AtomicU64::new(0),
                last_report: Mutex::new(None),
                stats: RwLock::new(SyncStats::default()),
                wake: Notify::new(),
                running: AtomicBool::new(false),
            }),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    /// Returns the store the engine drains.
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.shared.store
    }

    /// Returns the remote client.
    pub fn remote(&self) -> &Arc<R> {
        &self.shared.remote
    }

    /// Returns the connectivity monitor.
    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.shared.connectivity
    }

    /// Returns cumulative statistics.
    pub fn stats(&self) -> SyncStats {
        self.shared.stats.read().clone()
    }

    /// Returns true while a drain cycle runs.
    pub fn is_draining(&self) -> bool {
        self.shared.drain_lock.try_lock().is_err()
    }

    /// Returns true while the background service runs.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Signals the background service that new entries were queued.
    pub fn notify_enqueued(&self) {
        self.shared.wake.notify_one();
    }

    /// Returns the current queue status.
    ///
    /// # Errors
    ///
    /// Fails if a queue entry cannot be decoded.
    pub fn status(&self) -> SyncResult<SyncStatus> {
        let entries = queue::load_committed(&self.shared.store)?;
        let dead: Vec<&QueueEntry> = entries.iter().filter(|e| !e.is_live()).collect();
        Ok(SyncStatus {
            pending_count: entries.len() - dead.len(),
            dead_letter_count: dead.len(),
            conflict_count: dead
                .iter()
                .filter(|e| e.dead_reason == Some(DeadReason::Conflict))
                .count(),
            last_sync_at: queue::last_sync_at(&self.shared.store),
            is_online: self.shared.connectivity.is_online(),
            draining: self.is_draining(),
        })
    }

    /// Returns every queue entry in queue order.
    ///
    /// # Errors
    ///
    /// Fails if a queue entry cannot be decoded.
    pub fn entries(&self) -> SyncResult<Vec<QueueEntry>> {
        Ok(queue::load_committed(&self.shared.store)?)
    }

    /// Returns the dead-lettered entries.
    ///
    /// # Errors
    ///
    /// Fails if a queue entry cannot be decoded.
    pub fn dead_letters(&self) -> SyncResult<Vec<QueueEntry>> {
        Ok(self.entries()?.into_iter().filter(|e| !e.is_live()).collect())
    }

    /// Runs a drain cycle, or waits for one that started after this call.
    ///
    /// Every entry queued before the call is considered by the returned
    /// cycle.
    ///
    /// # Errors
    ///
    /// Fails on local store errors; remote failures only show up in the
    /// report and in entity state.
    pub async fn force_sync(&self) -> SyncResult<CycleReport> {
        let ticket = self.shared.cycles_started.load(Ordering::SeqCst);
        let _guard = self.shared.drain_lock.lock().await;
        if self.shared.cycles_started.load(Ordering::SeqCst) > ticket {
            let last = self.shared.last_report.lock().clone();
            if let Some(report) = last {
                tracing::debug!(cycle = report.cycle, "joined a cycle that started after the request");
                return Ok(report);
            }
        }
        self.shared.run_cycle().await
    }

    /// Settles a conflict flagged for manual review.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NoConflict`] if no flagged conflict exists for the
    /// record. Accepting a remote deletion fails with
    /// [`SyncError::StillReferenced`] while records of a blocking kind point
    /// at it; its cascade dependents are dropped with it.
    pub async fn resolve_conflict(
        &self,
        kind: EntityKind,
        id: EntityId,
        resolution: ConflictResolution,
    ) -> SyncResult<()> {
        let _guard = self.shared.drain_lock.lock().await;
        let now = Timestamp::now();
        self.shared.store.transaction(|txn| -> SyncResult<()> {
            let entries = queue::load(txn)?;
            let flagged = entries
                .iter()
                .find(|e| e.key() == (kind, id) && e.dead_reason == Some(DeadReason::Conflict))
                .cloned()
                .ok_or(SyncError::NoConflict { kind, id })?;

            match resolution {
                ConflictResolution::KeepLocal => keep_local(txn, flagged, now)?,
                ConflictResolution::AcceptRemote => match flagged.remote {
                    Some(remote) => {
                        for entry in entries.iter().filter(|e| e.key() == (kind, id)) {
                            queue::remove(txn, entry.seq)?;
                        }
                        txn.put(synced(remote))?;
                    }
                    None => {
                        drop_vanished(txn, kind, id)?;
                    }
                },
            }
            Ok(())
        })?;
        tracing::info!(%kind, %id, ?resolution, "conflict resolved manually");
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Moves every non-conflict dead letter back to `Pending` and clears the
    /// failure flag of its entity. Returns how many entries were revived.
    ///
    /// # Errors
    ///
    /// Fails on local store errors.
    pub async fn retry_failed(&self) -> SyncResult<usize> {
        let _guard = self.shared.drain_lock.lock().await;
        let now = Timestamp::now();
        let revived = self.shared.store.transaction(|txn| -> SyncResult<usize> {
            let mut revived = 0;
            for mut entry in queue::load(txn)? {
                if entry.is_live() || entry.dead_reason == Some(DeadReason::Conflict) {
                    continue;
                }
                entry.state = EntryState::Pending;
                entry.dead_reason = None;
                entry.last_error = None;
                entry.attempts = 0;
                entry.next_attempt_at = now;
                queue::save(txn, &entry)?;
                if let Some(mut local) = txn.get(entry.kind, &entry.entity_id) {
                    local.meta.sync_failure = None;
                    txn.put(local)?;
                }
                revived += 1;
            }
            Ok(revived)
        })?;
        if revived > 0 {
            tracing::info!(entries = revived, "dead letters queued for retry");
            self.shared.wake.notify_one();
        }
        Ok(revived)
    }

    /// Spawns the background service on the current tokio runtime.
    ///
    /// The service drains on start, whenever entries are queued, on every
    /// offline→online edge, on the periodic interval and when a scheduled
    /// retry comes due. Dropping the handle stops it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::AlreadyRunning`] if the service already runs.
    pub fn start(&self) -> SyncResult<ServiceHandle> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(SyncError::AlreadyRunning);
        }
        let (stop, stop_rx) = watch::channel(false);
        let engine = self.clone();
        let task = tokio::spawn(async move { engine.run(stop_rx).await });
        Ok(ServiceHandle { stop, task })
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        let shared = &self.shared;
        let mut connectivity = shared.connectivity.watch();
        let mut seen = connectivity.borrow_and_update().transitions;
        let mut interval = shared.config.sync_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        tracing::info!("sync service started");

        let mut due = true;
        loop {
            if due && shared.connectivity.is_online() {
                let _guard = shared.drain_lock.lock().await;
                if let Err(error) = shared.run_cycle().await {
                    tracing::warn!(%error, "background drain failed");
                }
            }
            due = false;

            let retry_in = shared.next_retry_in();
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                () = shared.wake.notified() => due = true,
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let status = *connectivity.borrow_and_update();
                    due = status.online && status.transitions != seen;
                    seen = status.transitions;
                }
                () = tick(interval.as_mut()) => due = true,
                () = sleep_for(retry_in) => due = true,
            }
        }

        shared.running.store(false, Ordering::SeqCst);
        tracing::info!("sync service stopped");
    }
}

/// Handle of the background sync service.
#[derive(Debug)]
pub struct ServiceHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServiceHandle {
    /// Stops the service, letting a running cycle finish first.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(error) = self.task.await {
            tracing::warn!(%error, "sync service task failed");
        }
    }

    /// Returns true once the service has stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_for(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

impl<R: RemoteClient> Shared<R> {
    /// Runs one cycle. The caller holds the drain lock.
    async fn run_cycle(&self) -> SyncResult<CycleReport> {
        let number = self.cycles_started.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Instant::now();
        let mut cycle = Cycle {
            attempted: HashSet::new(),
            report: CycleReport {
                cycle: number,
                ..CycleReport::default()
            },
        };
        tracing::debug!(cycle = number, "drain cycle started");

        if let Err(error) = self.drain(&mut cycle).await {
            tracing::warn!(cycle = number, %error, "drain cycle aborted");
            self.stats.write().last_error = Some(error.to_string());
            *self.last_report.lock() = None;
            if let Err(cleanup) = queue::recover_in_flight(&self.store) {
                tracing::error!(error = %cleanup, "could not release claimed entries");
            }
            return Err(error);
        }

        cycle.report.duration = started.elapsed();
        if cycle.report.ended_early.is_none() {
            self.store
                .transaction(|txn| queue::set_last_sync_at(txn, Timestamp::now()))?;
        }

        let report = cycle.report;
        {
            let mut stats = self.stats.write();
            stats.cycles_completed += 1;
            stats.entries_pushed += report.pushed as u64;
            stats.retries_scheduled += report.retries_scheduled as u64;
            stats.dead_lettered += report.dead_lettered as u64;
            stats.conflicts_auto_resolved += report.conflicts_auto_resolved as u64;
            stats.conflicts_flagged += report.conflicts_flagged as u64;
            stats.ids_reconciled += report.ids_reconciled as u64;
            stats.last_cycle = Some(report.clone());
        }
        *self.last_report.lock() = Some(report.clone());
        tracing::info!(
            cycle = number,
            pushed = report.pushed,
            retries = report.retries_scheduled,
            dead = report.dead_lettered,
            conflicts = report.conflicts_flagged,
            ended_early = ?report.ended_early,
            "drain cycle finished"
        );
        Ok(report)
    }

    async fn drain(&self, cycle: &mut Cycle) -> SyncResult<()> {
        loop {
            if !self.connectivity.is_online() {
                cycle.report.ended_early = Some(StopReason::Offline);
                return Ok(());
            }

            let wave = self.claim(cycle, Timestamp::now())?;
            if wave.is_empty() {
                return Ok(());
            }

            let size = wave.len();
            let mut transport_failures = 0;
            for (entry, attempt) in self.send_wave(wave).await {
                match self.apply(entry, attempt, cycle)? {
                    Flow::Continue => {}
                    Flow::TransportFailure => transport_failures += 1,
                    Flow::Stop(reason) => {
                        cycle.report.ended_early.get_or_insert(reason);
                    }
                }
            }
            if cycle.report.ended_early.is_some() {
                return Ok(());
            }
            if transport_failures == size {
                tracing::debug!(failures = size, "whole wave failed in transport, ending cycle");
                cycle.report.ended_early = Some(StopReason::Offline);
                return Ok(());
            }
        }
    }

    fn claim(&self, cycle: &mut Cycle, now: Timestamp) -> SyncResult<Vec<QueueEntry>> {
        let limit = self.config.concurrency;
        let attempted = &cycle.attempted;
        let wave = self.store.transaction(|txn| -> SyncResult<Vec<QueueEntry>> {
            let entries = queue::load(txn)?;
            let unconfirmed: HashSet<(EntityKind, EntityId)> = entries
                .iter()
                .filter(|e| e.op == QueueOp::Create)
                .map(QueueEntry::key)
                .collect();
            let referenced_by_deletes: HashSet<(EntityKind, EntityId)> = entries
                .iter()
                .filter(|e| e.op == QueueOp::Delete)
                .filter_map(|e| txn.get(e.kind, &e.entity_id))
                .flat_map(|local| local.body.references())
                .map(|r| (r.kind, r.id))
                .collect();

            let mut heads = HashSet::new();
            let mut wave = Vec::new();
            for entry in entries {
                if wave.len() >= limit {
                    break;
                }
                if !heads.insert(entry.key()) {
                    continue;
                }
                let ready = entry.state == EntryState::Pending
                    && entry.next_attempt_at <= now
                    && !attempted.contains(&entry.seq)
                    && !entry
                        .references()
                        .iter()
                        .any(|r| unconfirmed.contains(&(r.kind, r.id)))
                    && !(entry.op == QueueOp::Delete
                        && referenced_by_deletes.contains(&entry.key()));
                if ready {
                    wave.push(entry);
                }
            }

            for entry in &mut wave {
                entry.state = EntryState::InFlight;
                queue::save(txn, entry)?;
            }
            Ok(wave)
        })?;
        cycle.attempted.extend(wave.iter().map(|e| e.seq));
        Ok(wave)
    }

    async fn send_wave(&self, wave: Vec<QueueEntry>) -> Vec<(QueueEntry, Attempt)> {
        let timeout = self.config.request_timeout;
        let mut tasks = JoinSet::new();
        for entry in wave.iter().cloned() {
            let remote = Arc::clone(&self.remote);
            tasks.spawn(async move {
                let attempt = send(remote.as_ref(), &entry, timeout).await;
                (entry.seq, attempt)
            });
        }

        let mut results = HashMap::with_capacity(wave.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((seq, attempt)) => {
                    results.insert(seq, attempt);
                }
                Err(error) => tracing::warn!(%error, "remote call task failed"),
            }
        }

        wave.into_iter()
            .map(|entry| {
                let attempt = results
                    .remove(&entry.seq)
                    .unwrap_or_else(|| Attempt::Failed(RemoteError::network("remote call aborted")));
                (entry, attempt)
            })
            .collect()
    }

    fn apply(&self, entry: QueueEntry, attempt: Attempt, cycle: &mut Cycle) -> SyncResult<Flow> {
        let now = Timestamp::now();
        let returned = match &attempt {
            Attempt::Created(record) | Attempt::Updated(record) => Some(record),
            _ => None,
        };
        if let Some(message) = returned.and_then(remote_violations) {
            self.dead_letter(entry, DeadReason::Rejected, message, None, now)?;
            cycle.report.dead_lettered += 1;
            return Ok(Flow::Continue);
        }

        match attempt {
            Attempt::Created(record) => {
                let reconciled = self.store.transaction(|txn| -> SyncResult<bool> {
                    queue::remove(txn, entry.seq)?;
                    let reconciled = reconcile_id(txn, entry.kind, entry.entity_id, record.id())?;
                    settle(txn, &record)?;
                    Ok(reconciled)
                })?;
                cycle.report.pushed += 1;
                if reconciled {
                    cycle.report.ids_reconciled += 1;
                    tracing::debug!(
                        kind = %entry.kind,
                        local = %entry.entity_id,
                        remote = %record.id(),
                        "identifier reconciled"
                    );
                }
                tracing::debug!(seq = entry.seq, kind = %entry.kind, id = %record.id(), "create confirmed");
                Ok(Flow::Continue)
            }
            Attempt::Updated(record) => {
                self.store.transaction(|txn| -> SyncResult<()> {
                    queue::remove(txn, entry.seq)?;
                    settle(txn, &record)?;
                    Ok(())
                })?;
                cycle.report.pushed += 1;
                tracing::debug!(seq = entry.seq, kind = %entry.kind, id = %entry.entity_id, "update confirmed");
                Ok(Flow::Continue)
            }
            Attempt::Deleted => {
                self.store.transaction(|txn| -> SyncResult<()> {
                    queue::remove(txn, entry.seq)?;
                    if txn.get(entry.kind, &entry.entity_id).is_some() {
                        txn.remove(entry.kind, entry.entity_id)?;
                    }
                    Ok(())
                })?;
                cycle.report.pushed += 1;
                tracing::debug!(seq = entry.seq, kind = %entry.kind, id = %entry.entity_id, "delete confirmed");
                Ok(Flow::Continue)
            }
            Attempt::Failed(error) if error.is_retryable() => {
                self.schedule_retry(entry, &error, now, cycle)?;
                Ok(Flow::TransportFailure)
            }
            Attempt::Failed(error) => {
                let reason = match error {
                    RemoteError::Unauthorized(_) => DeadReason::Unauthorized,
                    _ => DeadReason::Rejected,
                };
                self.dead_letter(entry, reason, error.to_string(), None, now)?;
                cycle.report.dead_lettered += 1;
                Ok(match reason {
                    DeadReason::Unauthorized => Flow::Stop(StopReason::Unauthorized),
                    _ => Flow::Continue,
                })
            }
            Attempt::Conflict(remote) => self.settle_conflict(entry, remote, now, cycle),
        }
    }

    fn schedule_retry(
        &self,
        mut entry: QueueEntry,
        error: &RemoteError,
        now: Timestamp,
        cycle: &mut Cycle,
    ) -> SyncResult<()> {
        entry.attempts += 1;
        entry.maybe_delivered = true;
        entry.last_error = Some(error.to_string());

        if self.config.retry.is_exhausted(entry.attempts) {
            let message = format!("gave up after {} attempts: {error}", entry.attempts);
            self.dead_letter(entry, DeadReason::RetriesExhausted, message, None, now)?;
            cycle.report.dead_lettered += 1;
            return Ok(());
        }

        let delay = self.config.retry.delay_for_attempt(entry.attempts);
        entry.state = EntryState::Pending;
        entry.next_attempt_at = now.saturating_add(delay);
        self.store.transaction(|txn| queue::save(txn, &entry))?;
        cycle.report.retries_scheduled += 1;
        tracing::debug!(
            seq = entry.seq,
            attempts = entry.attempts,
            delay_ms = delay.as_millis() as u64,
            %error,
            "retry scheduled"
        );
        Ok(())
    }

    fn dead_letter(
        &self,
        mut entry: QueueEntry,
        reason: DeadReason,
        message: String,
        remote: Option<Entity>,
        now: Timestamp,
    ) -> SyncResult<()> {
        entry.state = EntryState::DeadLetter;
        entry.dead_reason = Some(reason);
        entry.last_error = Some(message.clone());
        entry.remote = remote;

        self.store.transaction(|txn| -> SyncResult<()> {
            queue::save(txn, &entry)?;
            if let Some(mut local) = txn.get(entry.kind, &entry.entity_id) {
                let failure = match reason {
                    DeadReason::Conflict => None,
                    DeadReason::Rejected => Some(FailureReason::Rejected),
                    DeadReason::Unauthorized => Some(FailureReason::Unauthorized),
                    DeadReason::RetriesExhausted => Some(FailureReason::RetriesExhausted),
                };
                match failure {
                    Some(reason) => {
                        local.meta.sync_failure = Some(SyncFailure {
                            reason,
                            message: message.clone(),
                            at: now,
                        });
                    }
                    None => local.meta.sync_state = SyncState::Conflict,
                }
                txn.put(local)?;
            }
            Ok(())
        })?;

        tracing::warn!(
            seq = entry.seq,
            kind = %entry.kind,
            id = %entry.entity_id,
            ?reason,
            %message,
            "queue entry dead-lettered"
        );
        self.stats.write().last_error = Some(message);
        Ok(())
    }

    fn settle_conflict(
        &self,
        mut entry: QueueEntry,
        remote: Option<Entity>,
        now: Timestamp,
        cycle: &mut Cycle,
    ) -> SyncResult<Flow> {
        let decision = decide(
            &ConflictCase {
                kind: entry.kind,
                base_version: entry.base_version,
                written_at: entry.written_at,
                remote: remote.as_ref(),
                rebases: entry.rebases,
            },
            &self.config,
        );
        if decision == Decision::AcceptRemote {
            if let Some(message) = remote.as_ref().and_then(remote_violations) {
                self.dead_letter(entry, DeadReason::Rejected, message, None, now)?;
                cycle.report.dead_lettered += 1;
                return Ok(Flow::Continue);
            }
        }

        match (decision, remote) {
            (Decision::AcceptRemote, Some(record)) => {
                self.store.transaction(|txn| -> SyncResult<()> {
                    queue::remove(txn, entry.seq)?;
                    settle(txn, &record)?;
                    Ok(())
                })?;
                cycle.report.conflicts_auto_resolved += 1;
                tracing::info!(kind = %entry.kind, id = %entry.entity_id, "conflict resolved: remote version kept");
            }
            (Decision::Rebase, Some(record)) => {
                let version = record.last_modified();
                entry.base_version = Some(version);
                entry.rebases += 1;
                entry.state = EntryState::Pending;
                self.store.transaction(|txn| -> SyncResult<()> {
                    queue::save(txn, &entry)?;
                    if let Some(mut local) = txn.get(entry.kind, &entry.entity_id) {
                        local.meta.base_version = Some(version);
                        txn.put(local)?;
                    }
                    Ok(())
                })?;
                cycle.attempted.remove(&entry.seq);
                cycle.report.conflicts_auto_resolved += 1;
                tracing::info!(
                    kind = %entry.kind,
                    id = %entry.entity_id,
                    rebases = entry.rebases,
                    "conflict resolved: local write rebased"
                );
            }
            (decision, remote) => {
                let message = match decision {
                    Decision::Manual(reason) => reason.to_string(),
                    _ => "remote version unavailable".to_string(),
                };
                self.dead_letter(entry, DeadReason::Conflict, message, remote, now)?;
                cycle.report.dead_lettered += 1;
                cycle.report.conflicts_flagged += 1;
            }
        }
        Ok(Flow::Continue)
    }

    fn next_retry_in(&self) -> Option<Duration> {
        if !self.connectivity.is_online() {
            return None;
        }
        let now = Timestamp::now();
        let entries = match queue::load_committed(&self.store) {
            Ok(entries) => entries,
            Err(error) => {
                tracing::warn!(%error, "could not read queue for retry scheduling");
                return None;
            }
        };
        entries
            .iter()
            .filter(|e| e.state == EntryState::Pending && e.next_attempt_at > now)
            .map(|e| e.next_attempt_at)
            .min()
            .map(|due| due.saturating_duration_since(now))
    }
}

async fn send<R: RemoteClient>(remote: &R, entry: &QueueEntry, timeout: Duration) -> Attempt {
    let result = match (entry.op, entry.payload.clone()) {
        (QueueOp::Create, Some(entity)) => within(
            timeout,
            remote.create(CreateRequest {
                idempotency_key: entry.idempotency_key,
                entity,
            }),
        )
        .await
        .map(Attempt::Created),
        (QueueOp::Update, Some(entity)) => within(
            timeout,
            remote.update(UpdateRequest {
                idempotency_key: entry.idempotency_key,
                entity,
                base_version: entry.base_version,
            }),
        )
        .await
        .map(Attempt::Updated),
        (QueueOp::Delete, _) => within(
            timeout,
            remote.delete(DeleteRequest {
                idempotency_key: entry.idempotency_key,
                kind: entry.kind,
                id: entry.entity_id,
                base_version: entry.base_version,
            }),
        )
        .await
        .map(|()| Attempt::Deleted),
        (_, None) => Err(RemoteError::rejected("queue entry carries no payload")),
    };

    match result {
        Ok(attempt) => attempt,
        Err(RemoteError::NotFound) if entry.op == QueueOp::Delete => Attempt::Deleted,
        Err(RemoteError::NotFound) => Attempt::Conflict(None),
        Err(RemoteError::Conflict) => {
            match within(timeout, remote.fetch(entry.kind, entry.entity_id)).await {
                Ok(current) => Attempt::Conflict(current),
                Err(error) => Attempt::Failed(error),
            }
        }
        Err(error) => Attempt::Failed(error),
    }
}

async fn within<T>(timeout: Duration, call: impl Future<Output = RemoteResult<T>>) -> RemoteResult<T> {
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or_else(|_| Err(RemoteError::network("request timed out")))
}

/// Describes why a record returned by the remote cannot be stored locally.
fn remote_violations(record: &Entity) -> Option<String> {
    let violations = validate(&record.body);
    if violations.is_empty() {
        return None;
    }
    let detail: Vec<String> = violations.iter().map(ToString::to_string).collect();
    Some(format!(
        "remote {} {} fails validation: {}",
        record.kind(),
        record.id(),
        detail.join("; ")
    ))
}

fn synced(mut record: Entity) -> Entity {
    record.meta.sync_state = SyncState::Synced;
    record.meta.base_version = Some(record.last_modified());
    record.meta.sync_failure = None;
    record
}

/// Moves a record from its local identifier to the remote one, rewriting
/// every reference to it. Returns false if the identifiers already agree.
fn reconcile_id(
    txn: &mut Transaction<'_>,
    kind: EntityKind,
    from: EntityId,
    to: EntityId,
) -> CoreResult<bool> {
    if from == to {
        return Ok(false);
    }
    if txn.get(kind, &from).is_some() {
        txn.rename(kind, from, to)?;
    }
    for referrer_kind in EntityKind::ALL {
        let referrers = txn.list_where(referrer_kind, |e| {
            e.body
                .references()
                .iter()
                .any(|r| r.kind == kind && r.id == from)
        });
        for mut referrer in referrers {
            referrer.rewrite_reference(kind, from, to);
            txn.put(referrer)?;
        }
    }
    queue::rename_everywhere(txn, kind, from, to)?;
    Ok(true)
}

/// Applies a confirmed remote version.
///
/// With nothing else queued for the record, the local copy becomes the
/// remote one and is `Synced`. Otherwise the queued writes are rebased on
/// the remote version and the local copy keeps its pending edits.
fn settle(txn: &mut Transaction<'_>, record: &Entity) -> CoreResult<()> {
    let key = (record.kind(), record.id());
    let version = record.last_modified();
    let later: Vec<QueueEntry> = queue::load(txn)?
        .into_iter()
        .filter(|e| e.key() == key)
        .collect();

    if later.is_empty() {
        return txn.put(synced(record.clone()));
    }

    for mut entry in later {
        entry.base_version = Some(version);
        queue::save(txn, &entry)?;
    }
    if let Some(mut local) = txn.get(key.0, &key.1) {
        local.meta.base_version = Some(version);
        if local.meta.sync_state == SyncState::PendingCreate {
            local.meta.sync_state = SyncState::PendingUpdate;
        }
        txn.put(local)?;
    }
    Ok(())
}

/// Drops a record the remote no longer holds, together with its cascade
/// dependents and every queue entry targeting them. Returns how many
/// records were dropped.
///
/// Refused while records of a blocking kind still reference it, whatever
/// their sync state.
fn drop_vanished(txn: &mut Transaction<'_>, kind: EntityKind, id: EntityId) -> SyncResult<usize> {
    let references_it =
        |e: &Entity| e.body.references().iter().any(|r| r.kind == kind && r.id == id);

    for &by in kind.delete_blockers() {
        let count = txn.list_where(by, references_it).len();
        if count > 0 {
            return Err(SyncError::StillReferenced { kind, id, by, count });
        }
    }

    let mut doomed: Vec<(EntityKind, EntityId)> = kind
        .cascade_dependents()
        .iter()
        .flat_map(|&among| txn.list_where(among, references_it))
        .map(|e| (e.kind(), e.id()))
        .collect();
    doomed.push((kind, id));

    for entry in queue::load(txn)? {
        if doomed.contains(&entry.key()) {
            queue::remove(txn, entry.seq)?;
        }
    }
    let mut dropped = 0;
    for &(doomed_kind, doomed_id) in &doomed {
        if txn.get(doomed_kind, &doomed_id).is_some() {
            txn.remove(doomed_kind, doomed_id)?;
            dropped += 1;
        }
    }
    tracing::debug!(%kind, %id, records = dropped, "dropped record missing on remote");
    Ok(dropped)
}

/// Requeues a flagged write on top of the remote version it conflicted
/// with. A write whose remote record vanished becomes a fresh create.
fn keep_local(txn: &mut Transaction<'_>, mut entry: QueueEntry, now: Timestamp) -> SyncResult<()> {
    let key = entry.key();
    if entry.remote.is_none() && entry.op == QueueOp::Delete {
        drop_vanished(txn, key.0, key.1)?;
        return Ok(());
    }

    match entry.remote.take() {
        Some(remote) => entry.base_version = Some(remote.last_modified()),
        None => {
            entry.op = QueueOp::Create;
            entry.base_version = None;
            entry.idempotency_key = uuid::Uuid::new_v4();
            entry.maybe_delivered = false;
        }
    }
    entry.state = EntryState::Pending;
    entry.dead_reason = None;
    entry.last_error = None;
    entry.attempts = 0;
    entry.rebases = 0;
    entry.next_attempt_at = now;
    entry.written_at = now;
    queue::save(txn, &entry)?;

    if let Some(mut local) = txn.get(key.0, &key.1) {
        local.meta.sync_state = match entry.op {
            QueueOp::Create => SyncState::PendingCreate,
            QueueOp::Update => SyncState::PendingUpdate,
            QueueOp::Delete => SyncState::PendingDelete,
        };
        local.meta.base_version = entry.base_version;
        local.meta.sync_failure = None;
        txn.put(local)?;
    }
    Ok(())
}
