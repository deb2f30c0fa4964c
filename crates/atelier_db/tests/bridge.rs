//! The host bridge marshals facade calls as JSON messages.

use atelier_db::bridge::{self, BridgeFailure, BridgeRequest, BridgeResponse, ErrorCode};
use atelier_db::{ConnectivityMonitor, Database, InMemoryRemote, SyncConfig};
use atelier_model::{EntityKind, SyncState};
use serde_json::{json, Value};
use std::sync::Arc;

fn database(online: bool) -> Arc<Database<InMemoryRemote>> {
    Arc::new(
        Database::open_in_memory(
            SyncConfig::default().without_sync_interval(),
            Arc::new(InMemoryRemote::new()),
            ConnectivityMonitor::new(online),
        )
        .unwrap(),
    )
}

async fn call(client: &bridge::BridgeClient, request: Value) -> Value {
    let response = client.call_json(&request.to_string()).await.unwrap();
    serde_json::from_str(&response).unwrap()
}

#[tokio::test]
async fn json_round_trip_through_the_facade() {
    let db = database(true);
    let (client, _task) = bridge::spawn(Arc::clone(&db), 8);

    let created = call(
        &client,
        json!({
            "op": "create",
            "body": {"kind": "customer", "fields": {"name": "Ada", "email": "ada@example.com"}}
        }),
    )
    .await;
    assert_eq!(created["type"], "entity");
    assert_eq!(created["data"]["meta"]["sync_state"], "pending_create");
    assert_eq!(created["data"]["body"]["fields"]["name"], "Ada");

    let status = call(&client, json!({"op": "sync_status"})).await;
    assert_eq!(status["data"]["pending_count"], 1);

    let synced = call(&client, json!({"op": "force_sync"})).await;
    assert_eq!(synced["type"], "synced");
    assert_eq!(synced["data"]["pushed"], 1);

    let listed = call(&client, json!({"op": "list", "kind": "customer"})).await;
    let entities = listed["data"].as_array().unwrap();
    assert_eq!(entities.len(), 1);
    assert_eq!(entities[0]["meta"]["sync_state"], "synced");
    assert_eq!(db.list(EntityKind::Customer, &Default::default())[0].sync_state(), SyncState::Synced);
}

#[tokio::test]
async fn facade_errors_come_back_as_error_responses() {
    let db = database(false);
    let (client, _task) = bridge::spawn(db, 8);

    let invalid = call(
        &client,
        json!({
            "op": "create",
            "body": {
                "kind": "invoice",
                "fields": {
                    "customer_id": "00000000-0000-4000-8000-000000000000",
                    "invoice_number": "INV-1",
                    "status": "pending",
                    "total": -5,
                    "paid_amount": 0
                }
            }
        }),
    )
    .await;
    assert_eq!(invalid["type"], "error");
    assert_eq!(invalid["data"]["code"], "validation");
    assert_eq!(invalid["data"]["violations"][0]["field"], "total");

    let missing = client
        .call(BridgeRequest::Get {
            kind: EntityKind::Customer,
            id: Default::default(),
        })
        .await
        .unwrap();
    match missing {
        BridgeResponse::Error(error) => assert_eq!(error.code, ErrorCode::NotFound),
        other => panic!("unexpected response {other:?}"),
    }
}

#[tokio::test]
async fn malformed_requests_and_closed_bridges_are_reported() {
    let db = database(false);
    let (client, task) = bridge::spawn(db, 1);

    assert!(matches!(
        client.call_json(r#"{"op":"explode"}"#).await,
        Err(BridgeFailure::Json(_))
    ));

    task.abort();
    let _ = task.await;
    assert!(matches!(
        client.call(BridgeRequest::SyncStatus).await,
        Err(BridgeFailure::Closed)
    ));
}
