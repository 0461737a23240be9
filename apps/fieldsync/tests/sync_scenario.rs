//! Two devices syncing through one server

use std::time::Duration;

use serde_json::json;

use fieldsync::client::{
    open_local, open_local_in_memory, ClientConfig, InProcessTransport, SyncClient,
};
use fieldsync::config::SyncSettings;
use fieldsync::db::create_memory_pool;
use fieldsync::entities::EntityType;
use fieldsync::sync::{ConflictReason, ResolutionStrategy, SyncService};

async fn server() -> SyncService {
    let pool = create_memory_pool().await.unwrap();
    SyncService::new(pool, SyncSettings::default())
}

fn config() -> ClientConfig {
    ClientConfig {
        backoff_base: Duration::ZERO,
        backoff_max: Duration::ZERO,
        ..ClientConfig::default()
    }
}

async fn device(service: &SyncService, name: &str) -> SyncClient<InProcessTransport> {
    let pool = open_local_in_memory().await.unwrap();
    SyncClient::new(pool, InProcessTransport::new(service.clone()), name, config())
}

#[tokio::test]
async fn concurrent_updates_conflict_and_resolve_client_wins() {
    let service = server().await;
    let a = device(&service, "device-a").await;
    let b = device(&service, "device-b").await;

    // A creates and pushes; the server assigns id 1 at version 1
    a.create_with_client_id(EntityType::Supplier, "abc", json!({"name": "Acme"}))
        .await
        .unwrap();
    a.push().await.unwrap();
    let on_a = a.get(EntityType::Supplier, "abc").await.unwrap().unwrap();
    assert_eq!(on_a.server_id, Some(1));
    assert_eq!(on_a.version, 1);

    // B receives the row
    b.pull().await.unwrap();
    let on_b = b.get(EntityType::Supplier, "abc").await.unwrap().unwrap();
    assert_eq!(on_b.server_id, Some(1));
    assert_eq!(on_b.version, 1);

    // Both edit against version 1 while offline
    a.update(EntityType::Supplier, "abc", json!({"phone": "111"}))
        .await
        .unwrap();
    b.update(EntityType::Supplier, "abc", json!({"phone": "222"}))
        .await
        .unwrap();

    // A wins the race
    let pushed_a = a.push().await.unwrap();
    assert_eq!(pushed_a.applied, 1);
    let on_a = a.get(EntityType::Supplier, "abc").await.unwrap().unwrap();
    assert_eq!(on_a.version, 2);

    // B conflicts against version 2 and adopts the server state
    let pushed_b = b.push().await.unwrap();
    assert_eq!(pushed_b.conflicts, 1);
    assert_eq!(pushed_b.applied, 0);

    let conflicts = b.conflicts().await.unwrap();
    assert_eq!(conflicts.len(), 1);
    let record = &conflicts[0].record;
    assert_eq!(record.reason, ConflictReason::VersionMismatch);
    assert_eq!(record.server_version, 2);
    assert_eq!(record.client_base_version, Some(1));
    assert_eq!(record.server_payload["phone"], "111");
    assert_eq!(record.client_payload["phone"], "222");

    let on_b = b.get(EntityType::Supplier, "abc").await.unwrap().unwrap();
    assert_eq!(on_b.version, 2);
    assert_eq!(on_b.payload["phone"], "111");
    assert_eq!(b.status().await.unwrap().conflicts, 1);

    // B insists; the retry races fairly against version 2 and wins
    b.resolve_conflict(conflicts[0].id, ResolutionStrategy::RetryClientWins)
        .await
        .unwrap();
    let retried = b.push().await.unwrap();
    assert_eq!(retried.applied, 1);
    assert_eq!(b.status().await.unwrap().conflicts, 0);

    a.pull().await.unwrap();
    let on_a = a.get(EntityType::Supplier, "abc").await.unwrap().unwrap();
    assert_eq!(on_a.version, 3);
    assert_eq!(on_a.payload, json!({"name": "Acme", "phone": "222"}));
}

#[tokio::test]
async fn keep_server_dismisses_the_losing_write() {
    let service = server().await;
    let a = device(&service, "device-a").await;
    let b = device(&service, "device-b").await;

    a.create_with_client_id(EntityType::Rate, "rate-1", json!({"per_kg": 10}))
        .await
        .unwrap();
    a.sync().await.unwrap();
    b.sync().await.unwrap();

    a.update(EntityType::Rate, "rate-1", json!({"per_kg": 11}))
        .await
        .unwrap();
    b.update(EntityType::Rate, "rate-1", json!({"per_kg": 12}))
        .await
        .unwrap();
    a.sync().await.unwrap();
    let report = b.sync().await.unwrap();
    assert_eq!(report.push.conflicts, 1);

    let id = b.conflicts().await.unwrap()[0].id;
    b.resolve_conflict(id, ResolutionStrategy::KeepServer)
        .await
        .unwrap();

    let status = b.status().await.unwrap();
    assert_eq!(status.conflicts, 0);
    assert_eq!(status.pending, 0);
    let on_b = b.get(EntityType::Rate, "rate-1").await.unwrap().unwrap();
    assert_eq!(on_b.payload["per_kg"], 11);
    assert!(!on_b.dirty);
}

#[tokio::test]
async fn deletes_replicate_as_tombstones_and_are_terminal() {
    let service = server().await;
    let a = device(&service, "device-a").await;
    let b = device(&service, "device-b").await;

    a.create_with_client_id(EntityType::Payment, "pay-1", json!({"amount": 40}))
        .await
        .unwrap();
    a.sync().await.unwrap();
    b.sync().await.unwrap();

    b.update(EntityType::Payment, "pay-1", json!({"amount": 45}))
        .await
        .unwrap();
    a.delete(EntityType::Payment, "pay-1").await.unwrap();
    a.sync().await.unwrap();

    let report = b.sync().await.unwrap();
    assert_eq!(report.push.conflicts, 1);

    let conflict = &b.conflicts().await.unwrap()[0];
    assert_eq!(conflict.record.reason, ConflictReason::DeletedOnServer);
    assert!(b
        .resolve_conflict(conflict.id, ResolutionStrategy::RetryClientWins)
        .await
        .is_err());

    let on_b = b.get(EntityType::Payment, "pay-1").await.unwrap().unwrap();
    assert!(on_b.is_deleted());
    assert!(b.list(EntityType::Payment).await.unwrap().is_empty());

    // A third device that never saw the row still learns about the delete
    let c = device(&service, "device-c").await;
    c.pull().await.unwrap();
    let on_c = c.get(EntityType::Payment, "pay-1").await.unwrap().unwrap();
    assert!(on_c.is_deleted());
    assert_eq!(on_c.version, 2);
}

#[tokio::test]
async fn repeated_pulls_leave_the_replica_unchanged() {
    let service = server().await;
    let a = device(&service, "device-a").await;
    let b = device(&service, "device-b").await;

    for i in 0..3 {
        a.create(EntityType::Product, json!({"sku": i})).await.unwrap();
    }
    a.sync().await.unwrap();

    b.pull().await.unwrap();
    let before = b.list(EntityType::Product).await.unwrap();
    b.pull().await.unwrap();
    let after = b.list(EntityType::Product).await.unwrap();

    assert_eq!(before, after);
    assert_eq!(after.len(), 3);
}

#[tokio::test]
async fn outbox_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("device.db").display());
    let service = server().await;

    {
        let pool = open_local(&url).await.unwrap();
        let client = SyncClient::new(pool.clone(), InProcessTransport::new(service.clone()), "d", config());
        client
            .create_with_client_id(EntityType::Collection, "col-1", json!({"kg": 8}))
            .await
            .unwrap();
        pool.close().await;
    }

    let pool = open_local(&url).await.unwrap();
    let client = SyncClient::new(pool, InProcessTransport::new(service.clone()), "d", config());
    client.recover().await.unwrap();
    assert_eq!(client.status().await.unwrap().pending, 1);

    let summary = client.push().await.unwrap();
    assert_eq!(summary.applied, 1);
    let local = client.get(EntityType::Collection, "col-1").await.unwrap().unwrap();
    assert!(local.server_id.is_some());
}
