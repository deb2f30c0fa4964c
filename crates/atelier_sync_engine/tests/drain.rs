//! Drain-cycle behaviour against the in-memory remote.

use atelier_core::{CoreResult, LocalStore};
use atelier_model::{Customer, Entity, EntityBody, EntityKind, SyncState, Timestamp};
use atelier_sync_engine::queue::{self, Enqueued};
use atelier_sync_engine::{
    ConnectivityMonitor, CreateRequest, InMemoryRemote, QueueOp, RemoteClient, RemoteOp,
    RetryConfig, SyncConfig, SyncEngine,
};
use std::sync::Arc;
use std::time::Duration;
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
        Timestamp::now(),
    )
}

fn config() -> SyncConfig {
    SyncConfig::default().without_sync_interval().with_retry(
        RetryConfig::new(5)
            .with_initial_delay(Duration::ZERO)
            .with_jitter(false),
    )
}

fn create_local(store: &LocalStore, entity: &Entity) -> Enqueued {
    store
        .transaction(|txn| -> CoreResult<Enqueued> {
            txn.put(entity.clone())?;
            queue::enqueue(txn, QueueOp::Create, entity, Timestamp::now())
        })
        .unwrap()
}

fn engine(
    store: &Arc<LocalStore>,
    remote: &Arc<InMemoryRemote>,
    monitor: ConnectivityMonitor,
    config: SyncConfig,
) -> SyncEngine<InMemoryRemote> {
    SyncEngine::new(config, Arc::clone(store), Arc::clone(remote), monitor).unwrap()
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn in_flight_calls_respect_the_concurrency_cap() {
    let store = Arc::new(LocalStore::open_in_memory().unwrap());
    let remote = Arc::new(InMemoryRemote::new());
    remote.set_latency(Duration::from_millis(10));
    let engine = engine(
        &store,
        &remote,
        ConnectivityMonitor::new(true),
        config().with_concurrency(3),
    );

    for i in 0..10 {
        create_local(&store, &customer(&format!("c{i}")));
    }
    let report = engine.force_sync().await.unwrap();

    assert_eq!(report.pushed, 10);
    assert!(remote.max_in_flight() <= 3);
    assert!(remote.max_in_flight() >= 2);
    assert_eq!(remote.len(), 10);
}

#[tokio::test]
async fn concurrent_force_syncs_never_send_twice() {
    let store = Arc::new(LocalStore::open_in_memory().unwrap());
    let remote = Arc::new(InMemoryRemote::new());
    remote.set_latency(Duration::from_millis(10));
    let engine = engine(&store, &remote, ConnectivityMonitor::new(true), config());

    for i in 0..5 {
        create_local(&store, &customer(&format!("c{i}")));
    }

    let (first, second) = tokio::join!(engine.force_sync(), engine.force_sync());
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(remote.call_count(RemoteOp::Create), 5);
    assert_eq!(remote.len(), 5);
    assert!(first.pushed == 5 || second.pushed == 5);
    assert_eq!(engine.status().unwrap().pending_count, 0);
}

#[tokio::test]
async fn lost_response_is_not_applied_twice() {
    let store = Arc::new(LocalStore::open_in_memory().unwrap());
    let remote = Arc::new(InMemoryRemote::new());
    let engine = engine(&store, &remote, ConnectivityMonitor::new(true), config());

    create_local(&store, &customer("once"));
    remote.lose_next_response();

    let first = engine.force_sync().await.unwrap();
    assert_eq!(first.retries_scheduled, 1);
    assert_eq!(remote.len(), 1);

    engine.force_sync().await.unwrap();
    assert_eq!(remote.call_count(RemoteOp::Create), 2);
    assert_eq!(remote.len(), 1);

    let server = remote.records(EntityKind::Customer).pop().unwrap();
    let local = store.get(EntityKind::Customer, &server.id()).unwrap();
    assert_eq!(local.sync_state(), SyncState::Synced);
}

#[tokio::test]
async fn interrupted_entries_resume_after_reopen() {
    let dir = tempdir().unwrap();
    let remote = Arc::new(InMemoryRemote::new());
    let entity = customer("survivor");

    {
        let store = LocalStore::open(dir.path()).unwrap();
        create_local(&store, &entity);
        let entry = queue::load_committed(&store).unwrap().remove(0);

        // The remote applied the create but the process died before the
        // outcome was written back.
        store
            .transaction(|txn| {
                let mut claimed = entry.clone();
                claimed.state = atelier_sync_engine::EntryState::InFlight;
                queue::save(txn, &claimed)
            })
            .unwrap();
        remote
            .create(CreateRequest {
                idempotency_key: entry.idempotency_key,
                entity: entity.clone(),
            })
            .await
            .unwrap();
    }

    let store = Arc::new(LocalStore::open(dir.path()).unwrap());
    let engine = engine(&store, &remote, ConnectivityMonitor::new(true), config());
    let entries = engine.entries().unwrap();
    assert_eq!(entries[0].state, atelier_sync_engine::EntryState::Pending);
    assert!(entries[0].maybe_delivered);

    engine.force_sync().await.unwrap();
    assert_eq!(remote.len(), 1);
    assert_eq!(engine.status().unwrap().pending_count, 0);
    let server = remote.records(EntityKind::Customer).pop().unwrap();
    assert_eq!(
        store.get(EntityKind::Customer, &server.id()).unwrap().sync_state(),
        SyncState::Synced
    );
}

#[tokio::test]
async fn background_service_drains_on_reconnect() {
    let store = Arc::new(LocalStore::open_in_memory().unwrap());
    let remote = Arc::new(InMemoryRemote::new());
    let monitor = ConnectivityMonitor::new(false);
    let engine = engine(&store, &remote, monitor.clone(), config());
    let service = engine.start().unwrap();

    create_local(&store, &customer("queued offline"));
    engine.notify_enqueued();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(remote.is_empty());

    monitor.set_online(true);
    wait_until(|| remote.len() == 1).await;
    wait_until(|| engine.status().unwrap().pending_count == 0).await;

    service.shutdown().await;
    assert!(!engine.is_running());
}

#[tokio::test]
async fn background_service_drains_new_entries_while_online() {
    let store = Arc::new(LocalStore::open_in_memory().unwrap());
    let remote = Arc::new(InMemoryRemote::new());
    let engine = engine(&store, &remote, ConnectivityMonitor::new(true), config());
    let service = engine.start().unwrap();

    for i in 0..3 {
        create_local(&store, &customer(&format!("live {i}")));
        engine.notify_enqueued();
    }
    wait_until(|| remote.len() == 3).await;
    wait_until(|| engine.status().unwrap().pending_count == 0).await;
    assert!(engine.stats().cycles_completed >= 1);

    service.shutdown().await;
}
