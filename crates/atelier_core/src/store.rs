//! The local store.

use crate::config::Config;
use crate::dir::StoreDir;
use crate::error::{CoreError, CoreResult};
use crate::filter::ListFilter;
use crate::log::{FrameReader, LogWriter};
use crate::state::State;
use crate::stats::{Counters, RecoveryInfo, StoreStats};
use crate::transaction::Transaction;
use atelier_model::{Entity, EntityId, EntityKind};
use atelier_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::{Mutex, RwLock};
use std::path::Path;

/// Durable record store; the source of truth for reads.
///
/// Writes go through [`LocalStore::transaction`] (or the single-record
/// shorthands) and are appended to the record log before the call returns.
/// Reads are served from an in-memory image and never observe a partially
/// applied transaction.
///
/// # Opening a Store
///
/// ```rust,no_run
/// use atelier_core::{Config, LocalStore};
/// use std::path::Path;
///
/// let store = LocalStore::open_with_config(
///     Path::new("shop-data"),
///     Config::default().sync_on_commit(true),
/// )?;
/// # Ok::<(), atelier_core::CoreError>(())
/// ```
///
/// For tests, use [`LocalStore::open_in_memory`].
pub struct LocalStore {
    config: Config,
    /// Directory holding the lock. None for in-memory or custom backends.
    dir: Option<StoreDir>,
    state: RwLock<State>,
    /// Serializes writers; always taken before `state`.
    log: Mutex<LogWriter>,
    counters: Counters,
    recovery: RecoveryInfo,
}

impl LocalStore {
    /// Opens a store directory with default configuration.
    ///
    /// # Errors
    ///
    /// See [`LocalStore::open_with_config`].
    pub fn open(path: &Path) -> CoreResult<Self> {
        Self::open_with_config(path, Config::default())
    }

    /// Opens a store directory.
    ///
    /// Locks the directory, replays the record log and cuts away a torn
    /// trailing frame if the last run crashed mid-commit.
    ///
    /// # Errors
    ///
    /// - [`CoreError::StoreLocked`] if another handle has the directory
    /// - [`CoreError::ChecksumMismatch`] / [`CoreError::LogCorruption`] if
    ///   the log is damaged before its tail
    /// - I/O errors
    pub fn open_with_config(path: &Path, config: Config) -> CoreResult<Self> {
        let dir = StoreDir::open(path, config.create_if_missing)?;
        let backend = FileBackend::open_with_create_dirs(&dir.log_path())?;
        let mut store = Self::open_with_backend(config, Box::new(backend))?;
        tracing::info!(
            path = %dir.path().display(),
            frames = store.recovery.frames_replayed,
            "opened local store"
        );
        store.dir = Some(dir);
        Ok(store)
    }

    /// Opens a non-persistent store.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature matches the other openers.
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::open_with_backend(Config::default(), Box::new(InMemoryBackend::new()))
    }

    /// Opens a store over an arbitrary backend.
    ///
    /// # Errors
    ///
    /// Fails if the backend content cannot be replayed.
    pub fn open_with_backend(config: Config, mut backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let (state, recovery) = Self::recover(backend.as_mut())?;
        let log = LogWriter::new(backend, config.sync_on_commit)?;
        Ok(Self {
            config,
            dir: None,
            state: RwLock::new(state),
            log: Mutex::new(log),
            counters: Counters::default(),
            recovery,
        })
    }

    fn recover(backend: &mut dyn StorageBackend) -> CoreResult<(State, RecoveryInfo)> {
        let mut state = State::default();
        let mut info = RecoveryInfo::default();

        let (valid_end, size) = {
            let mut reader = FrameReader::new(&*backend)?;
            for frame in reader.by_ref() {
                let frame = frame?;
                for op in &frame.ops {
                    state
                        .apply(op)
                        .map_err(|e| CoreError::log_corruption(frame.offset, e.to_string()))?;
                }
                info.frames_replayed += 1;
            }
            (reader.valid_end(), reader.log_size())
        };

        if valid_end < size {
            info.truncated_bytes = size - valid_end;
            tracing::warn!(
                offset = valid_end,
                bytes = info.truncated_bytes,
                "discarding torn frame at end of record log"
            );
            backend.truncate(valid_end)?;
            backend.sync()?;
        }

        tracing::debug!(frames = info.frames_replayed, bytes = valid_end, "replayed record log");
        Ok((state, info))
    }

    /// Runs `f` as one atomic transaction.
    ///
    /// If `f` returns `Ok`, its operations are appended to the log as a
    /// single frame (and fsynced when `sync_on_commit` is set) before this
    /// returns. If `f` fails, or the append fails, every change is rolled
    /// back and readers never see any of it.
    ///
    /// # Errors
    ///
    /// Whatever `f` returns, or the storage failure of the commit.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, E>,
        E: From<CoreError>,
    {
        let mut log = self.log.lock();
        let mut state = self.state.write();
        let mut txn = Transaction::new(&mut state);

        let value = match f(&mut txn) {
            Ok(value) => value,
            Err(e) => {
                txn.rollback();
                self.counters.record_rollback();
                return Err(e);
            }
        };
        if txn.is_empty() {
            return Ok(value);
        }

        match log.append(txn.ops()) {
            Ok(bytes) => self.counters.record_commit(bytes),
            Err(e) => {
                tracing::error!(error = %e, "commit failed, rolling back");
                txn.rollback();
                self.counters.record_rollback();
                return Err(e.into());
            }
        }
        drop(state);

        match log.wants_compaction(self.config.compact_after_bytes) {
            Ok(true) => {
                if let Err(e) = self.compact_locked(&mut log) {
                    tracing::warn!(error = %e, "automatic compaction failed");
                }
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "could not read log size"),
        }
        Ok(value)
    }

    /// Reads one entity.
    #[must_use]
    pub fn get(&self, kind: EntityKind, id: &EntityId) -> Option<Entity> {
        self.state.read().get(kind, id).cloned()
    }

    /// Lists entities of `kind`.
    ///
    /// Without an explicit order the result follows insertion order.
    #[must_use]
    pub fn list(&self, kind: EntityKind, filter: &ListFilter) -> Vec<Entity> {
        self.state.read().list(kind, filter)
    }

    /// Lists entities of `kind` matching `pred`, in insertion order.
    pub fn list_where<P>(&self, kind: EntityKind, pred: P) -> Vec<Entity>
    where
        P: Fn(&Entity) -> bool,
    {
        self.state.read().list_where(kind, pred, &ListFilter::default())
    }

    /// Number of entities of `kind`.
    #[must_use]
    pub fn count(&self, kind: EntityKind) -> usize {
        self.state.read().table(kind).map_or(0, |t| t.len())
    }

    /// Inserts or replaces one entity durably.
    ///
    /// # Errors
    ///
    /// [`CoreError::Validation`] if the body breaks a field rule, or a
    /// storage error if the commit fails.
    pub fn put(&self, entity: Entity) -> CoreResult<()> {
        self.transaction(|txn| txn.put(entity))
    }

    /// Physically removes one entity durably.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] if it does not exist, or a storage error.
    pub fn remove(&self, kind: EntityKind, id: EntityId) -> CoreResult<()> {
        self.transaction(|txn| txn.remove(kind, id))
    }

    /// Reads an auxiliary value.
    #[must_use]
    pub fn aux_get(&self, ns: &str, key: u64) -> Option<Vec<u8>> {
        self.state.read().aux_get(ns, key).cloned()
    }

    /// Lists an auxiliary keyspace in ascending key order.
    #[must_use]
    pub fn aux_list(&self, ns: &str) -> Vec<(u64, Vec<u8>)> {
        self.state
            .read()
            .aux_iter(ns)
            .map(|(k, v)| (k, v.clone()))
            .collect()
    }

    /// Rewrites the log as a single snapshot frame.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the snapshot cannot be made durable; the
    /// old log is then left in place.
    pub fn compact(&self) -> CoreResult<()> {
        let mut log = self.log.lock();
        self.compact_locked(&mut log)
    }

    fn compact_locked(&self, log: &mut LogWriter) -> CoreResult<()> {
        let before = log.size()?;
        let ops = self.state.read().snapshot();
        let after = log.replace(&ops)?;
        self.counters.record_compaction();
        tracing::info!(before, after, records = ops.len(), "compacted record log");
        Ok(())
    }

    /// Returns a point-in-time view of counts and counters.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats::default();
        {
            let state = self.state.read();
            for kind in EntityKind::ALL {
                let Some(table) = state.table(kind) else {
                    continue;
                };
                let counts = stats.entities.entry(kind).or_default();
                for row in table.iter() {
                    *counts.entry(row.entity.sync_state()).or_default() += 1;
                }
            }
        }
        stats.log_bytes = self.log.lock().size().unwrap_or(0);
        stats.fill_counters(&self.counters);
        stats.recovery = self.recovery;
        stats
    }

    /// Returns the store directory, if file-backed.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(StoreDir::path)
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("path", &self.path())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_model::{
        Customer, EntityBody, Invoice, InvoiceItem, InvoiceStatus, SyncState, Timestamp,
    };
    use atelier_storage::StorageResult;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn customer(name: &str) -> Entity {
        Entity::new_local(
            EntityBody::Customer(Customer {
                name: name.into(),
                phone: None,
                email: None,
                address: None,
                notes: None,
            }),
            Timestamp::from_millis(10),
        )
    }

    fn item(invoice: EntityId) -> Entity {
        Entity::new_local(
            EntityBody::InvoiceItem(InvoiceItem::priced(invoice, "Alteration", 1, 2_000)),
            Timestamp::from_millis(11),
        )
    }

    #[test]
    fn put_get_remove() {
        let store = LocalStore::open_in_memory().unwrap();
        let a = customer("Ada");
        store.put(a.clone()).unwrap();

        assert_eq!(store.get(EntityKind::Customer, &a.id()), Some(a.clone()));
        store.remove(EntityKind::Customer, a.id()).unwrap();
        assert!(store.get(EntityKind::Customer, &a.id()).is_none());
        assert!(matches!(
            store.remove(EntityKind::Customer, a.id()),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn invalid_records_are_refused() {
        let store = LocalStore::open_in_memory().unwrap();
        let kept = customer("kept");
        store.put(kept.clone()).unwrap();
        let log_bytes = store.stats().log_bytes;

        let invoice = Entity::new_local(
            EntityBody::Invoice(Invoice {
                customer_id: kept.id(),
                order_id: None,
                invoice_number: String::new(),
                status: InvoiceStatus::Pending,
                total: -5,
                paid_amount: 999,
                due_date: None,
            }),
            Timestamp::from_millis(12),
        );
        let err = store.put(invoice.clone()).unwrap_err();
        let CoreError::Validation { kind, violations, .. } = err else {
            panic!("expected a validation error, got {err:?}");
        };
        assert_eq!(kind, EntityKind::Invoice);
        let fields: Vec<&str> = violations.iter().map(|v| v.field.as_str()).collect();
        assert_eq!(fields, vec!["invoice_number", "total", "paid_amount"]);

        let mut blank = kept.clone();
        if let EntityBody::Customer(c) = &mut blank.body {
            c.name = " ".into();
        }
        let result: CoreResult<()> = store.transaction(|txn| {
            txn.put_aux("queue", 1, vec![1])?;
            txn.put(blank)
        });
        assert!(matches!(result, Err(CoreError::Validation { .. })));

        assert!(store.get(EntityKind::Invoice, &invoice.id()).is_none());
        assert_eq!(store.get(EntityKind::Customer, &kept.id()), Some(kept));
        assert!(store.aux_get("queue", 1).is_none());
        assert_eq!(store.stats().log_bytes, log_bytes);
    }

    #[test]
    fn list_is_insertion_ordered_and_filterable() {
        let store = LocalStore::open_in_memory().unwrap();
        let a = customer("a");
        let mut b = customer("b");
        store.put(a.clone()).unwrap();
        store.put(b.clone()).unwrap();
        b.meta.sync_state = SyncState::Synced;
        store.put(b.clone()).unwrap();

        let all = store.list(EntityKind::Customer, &ListFilter::new());
        assert_eq!(all.iter().map(Entity::id).collect::<Vec<_>>(), vec![a.id(), b.id()]);

        let synced = store.list(
            EntityKind::Customer,
            &ListFilter::new().sync_state(SyncState::Synced),
        );
        assert_eq!(synced, vec![b]);
        assert_eq!(store.list(EntityKind::Customer, &ListFilter::new().limit(1)).len(), 1);
    }

    #[test]
    fn failed_closure_rolls_back() {
        let store = LocalStore::open_in_memory().unwrap();
        let invoice = EntityId::new();

        let result: CoreResult<()> = store.transaction(|txn| {
            txn.put(item(invoice))?;
            txn.put_aux("queue", 1, vec![1])?;
            Err(CoreError::invalid_operation("nope"))
        });

        assert!(result.is_err());
        assert_eq!(store.count(EntityKind::InvoiceItem), 0);
        assert!(store.aux_get("queue", 1).is_none());
        assert_eq!(store.stats().rollbacks, 1);
    }

    #[test]
    fn transaction_reads_its_own_writes() {
        let store = LocalStore::open_in_memory().unwrap();
        let invoice = EntityId::new();

        let seen = store
            .transaction(|txn| {
                txn.put(item(invoice))?;
                txn.put(item(invoice))?;
                Ok::<_, CoreError>(
                    txn.list(
                        EntityKind::InvoiceItem,
                        &ListFilter::new().referencing(EntityKind::Invoice, invoice),
                    )
                    .len(),
                )
            })
            .unwrap();
        assert_eq!(seen, 2);
    }

    #[test]
    fn survives_reopen() {
        let tmp = tempdir().unwrap();
        let a = customer("Ada");
        let renamed = EntityId::new();
        {
            let store = LocalStore::open(tmp.path()).unwrap();
            store.put(customer("first")).unwrap();
            store.put(a.clone()).unwrap();
            store
                .transaction(|txn| {
                    txn.rename(EntityKind::Customer, a.id(), renamed)?;
                    txn.put_aux("meta", 0, b"x".to_vec())
                })
                .unwrap();
        }

        let store = LocalStore::open(tmp.path()).unwrap();
        let list = store.list(EntityKind::Customer, &ListFilter::new());
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].id(), renamed);
        assert_eq!(store.aux_get("meta", 0), Some(b"x".to_vec()));
        assert_eq!(store.stats().recovery.frames_replayed, 3);
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let backend = InMemoryBackend::new();
        {
            let store =
                LocalStore::open_with_backend(Config::default(), Box::new(backend.clone())).unwrap();
            store.put(customer("kept")).unwrap();
        }
        let mut damaged = backend.data();
        let good_len = damaged.len();
        damaged.extend_from_slice(b"ATLG\x01\x00\xff\x00\x00\x00partial");

        let reopened = InMemoryBackend::with_data(damaged);
        let store =
            LocalStore::open_with_backend(Config::default(), Box::new(reopened.clone())).unwrap();

        assert_eq!(store.count(EntityKind::Customer), 1);
        assert_eq!(store.stats().recovery.truncated_bytes, 17);
        assert_eq!(reopened.data().len(), good_len);
    }

    #[test]
    fn corrupted_body_refuses_to_open() {
        let backend = InMemoryBackend::new();
        {
            let store =
                LocalStore::open_with_backend(Config::default(), Box::new(backend.clone())).unwrap();
            store.put(customer("a")).unwrap();
            store.put(customer("b")).unwrap();
        }
        let mut bytes = backend.data();
        bytes[14] ^= 0x01;

        let err = LocalStore::open_with_backend(
            Config::default(),
            Box::new(InMemoryBackend::with_data(bytes)),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::ChecksumMismatch { offset: 0, .. }));
    }

    #[test]
    fn compaction_keeps_content_and_order() {
        let tmp = tempdir().unwrap();
        let ids: Vec<EntityId> = {
            let store = LocalStore::open(tmp.path()).unwrap();
            let mut ids = Vec::new();
            for round in 0..5 {
                let c = customer(&format!("c{round}"));
                ids.push(c.id());
                store.put(c.clone()).unwrap();
                store.put(c).unwrap();
            }
            store.remove(EntityKind::Customer, ids.remove(0)).unwrap();

            let before = store.stats().log_bytes;
            store.compact().unwrap();
            assert!(store.stats().log_bytes < before);
            assert_eq!(store.stats().compactions, 1);
            ids
        };

        let store = LocalStore::open(tmp.path()).unwrap();
        let listed: Vec<EntityId> = store
            .list(EntityKind::Customer, &ListFilter::new())
            .iter()
            .map(Entity::id)
            .collect();
        assert_eq!(listed, ids);
        assert_eq!(store.stats().recovery.frames_replayed, 1);
    }

    #[test]
    fn automatic_compaction() {
        let store = LocalStore::open_with_backend(
            Config::default().compact_after_bytes(512),
            Box::new(InMemoryBackend::new()),
        )
        .unwrap();
        let c = customer("busy");
        for _ in 0..20 {
            store.put(c.clone()).unwrap();
        }
        assert!(store.stats().compactions > 0);
        assert_eq!(store.count(EntityKind::Customer), 1);
    }

    #[test]
    fn directory_is_exclusive() {
        let tmp = tempdir().unwrap();
        let _store = LocalStore::open(tmp.path()).unwrap();
        assert!(matches!(
            LocalStore::open(tmp.path()),
            Err(CoreError::StoreLocked)
        ));
    }

    /// Delegates to a shared in-memory buffer but can be told to fail syncs.
    struct FlakyBackend {
        inner: InMemoryBackend,
        fail_sync: Arc<AtomicBool>,
    }

    impl StorageBackend for FlakyBackend {
        fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
            self.inner.read_at(offset, len)
        }
        fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
            self.inner.append(data)
        }
        fn flush(&mut self) -> StorageResult<()> {
            self.inner.flush()
        }
        fn sync(&mut self) -> StorageResult<()> {
            if self.fail_sync.load(Ordering::SeqCst) {
                return Err(std::io::Error::other("disk gone").into());
            }
            self.inner.sync()
        }
        fn size(&self) -> StorageResult<u64> {
            self.inner.size()
        }
        fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
            self.inner.truncate(new_size)
        }
        fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
            self.inner.replace(data)
        }
    }

    #[test]
    fn failed_commit_is_invisible_and_cut_from_log() {
        let inner = InMemoryBackend::new();
        let fail_sync = Arc::new(AtomicBool::new(false));
        let store = LocalStore::open_with_backend(
            Config::default(),
            Box::new(FlakyBackend {
                inner: inner.clone(),
                fail_sync: Arc::clone(&fail_sync),
            }),
        )
        .unwrap();
        store.put(customer("ok")).unwrap();
        let size = inner.data().len();

        fail_sync.store(true, Ordering::SeqCst);
        let err = store.put(customer("lost")).unwrap_err();
        assert!(matches!(err, CoreError::Storage(_)));
        assert_eq!(store.count(EntityKind::Customer), 1);
        assert_eq!(inner.data().len(), size);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Put(usize, u8),
        Remove(usize),
        Rename(usize),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            4 => (0..6usize, any::<u8>()).prop_map(|(slot, n)| Step::Put(slot, n)),
            1 => (0..6usize).prop_map(Step::Remove),
            1 => (0..6usize).prop_map(Step::Rename),
        ]
    }

    fn reopen(backend: &InMemoryBackend) -> LocalStore {
        LocalStore::open_with_backend(
            Config::default(),
            Box::new(InMemoryBackend::with_data(backend.data())),
        )
        .unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn replay_and_compaction_preserve_the_image(steps in prop::collection::vec(step(), 0..40)) {
            let backend = InMemoryBackend::new();
            let store =
                LocalStore::open_with_backend(Config::default(), Box::new(backend.clone())).unwrap();
            let mut slots: Vec<Option<Entity>> = vec![None; 6];

            for step in steps {
                match step {
                    Step::Put(slot, n) => {
                        let mut entity = slots[slot].take().unwrap_or_else(|| customer("new"));
                        if let EntityBody::Customer(c) = &mut entity.body {
                            c.name = format!("c{n}");
                        }
                        store.put(entity.clone()).unwrap();
                        slots[slot] = Some(entity);
                    }
                    Step::Remove(slot) => {
                        if let Some(entity) = slots[slot].take() {
                            store.remove(entity.kind(), entity.id()).unwrap();
                        }
                    }
                    Step::Rename(slot) => {
                        if let Some(entity) = slots[slot].as_mut() {
                            let to = EntityId::new();
                            store
                                .transaction(|txn| txn.rename(EntityKind::Customer, entity.id(), to))
                                .unwrap();
                            entity.meta.id = to;
                        }
                    }
                }
            }

            let live = store.list(EntityKind::Customer, &ListFilter::new());
            prop_assert_eq!(live.len(), slots.iter().flatten().count());
            for entity in slots.iter().flatten() {
                let got = store.get(EntityKind::Customer, &entity.id());
                prop_assert_eq!(got.as_ref(), Some(entity));
            }
            prop_assert_eq!(&reopen(&backend).list(EntityKind::Customer, &ListFilter::new()), &live);

            store.compact().unwrap();
            let compacted = reopen(&backend);
            prop_assert_eq!(&compacted.list(EntityKind::Customer, &ListFilter::new()), &live);
            prop_assert!(compacted.stats().recovery.frames_replayed <= 1);
        }
    }
}
