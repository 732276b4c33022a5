// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! End-to-end tests for the sync orchestrator against a scripted transport.
//!
//! # Test Organization
//! - `fill_*` - first-contact stub fill
//! - `upload_*` - pending-change upload and acknowledgement reconciliation
//! - `delta_*` - versioned delta pull, paging, conflict parking
//! - `scheduler_*` - tick scheduling and the single-flight rule

mod common;

use common::{resource_metadata, wait_terminal, MockTransport};
use detached_sync::transport::{ResourcePermissions, Transport, TransportResult};
use detached_sync::{
    ErrorKind, FieldValue, Geometry, ReplicaConfig, ReplicaState, SyncConfig, SyncOrchestrator,
    TransportError, VersioningState,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn orchestrator_with(
    replicas: Vec<ReplicaConfig>,
    transport: Arc<MockTransport>,
) -> (SyncOrchestrator<MockTransport>, TempDir) {
    common::init_tracing();
    let dir = TempDir::new().unwrap();
    let mut config = SyncConfig::for_testing(dir.path());
    config.replicas = replicas;
    (SyncOrchestrator::with_transport(config, transport), dir)
}

async fn wait_idle(orch: &SyncOrchestrator<MockTransport>) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while orch.is_synchronizing().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "sync job never finished"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// =============================================================================
// Stub Fill Tests
// =============================================================================

#[tokio::test]
async fn fill_creates_replica_from_snapshot() {
    let transport = Arc::new(MockTransport::new());
    transport
        .stub_get("/resource/7", resource_metadata(false, 0))
        .await;
    transport
        .stub_get(
            "/resource/7/feature/",
            json!([
                {"id": 500, "geom": "POINT (1 2)", "version": 1,
                 "fields": {"100": "Main St", "101": 2}},
                {"id": 501, "fields": {"100": "Oak Ave", "101": null}}
            ]),
        )
        .await;
    transport
        .stub_get("/resource/7/extensions", json!({"500": {"description": "plaza"}}))
        .await;

    let (orch, _dir) = orchestrator_with(
        vec![ReplicaConfig::for_testing(7, "roads")],
        transport.clone(),
    );
    assert!(orch.tick().await);
    let state = wait_terminal(&orch, "roads").await;
    assert_eq!(state, ReplicaState::Synchronized);

    let store = orch.store("roads").await.unwrap();
    assert_eq!(store.feature_count().await.unwrap(), 2);
    let fid = store.fid_for_remote(500).await.unwrap().unwrap();
    let feature = store.feature(fid).await.unwrap().unwrap();
    assert_eq!(feature.geometry, Some(Geometry::Point(1.0, 2.0)));
    assert_eq!(feature.attrs[0], FieldValue::Text("Main St".into()));

    // Non-versioned replicas pull the extension objects too.
    assert_eq!(transport.get_count("/resource/7/extensions").await, 1);
    let mapping = store.mapping_for_fid(fid).await.unwrap().unwrap();
    assert_eq!(mapping.description, Some("plaza".to_string()));

    let status = orch.replica_status("roads").await.unwrap();
    assert_eq!(status.versioning, VersioningState::NotVersionedLayer);
    assert!(status.last_synced_at.is_some());
}

#[tokio::test]
async fn fill_refreshes_aliases_and_fetches_lookup_tables() {
    let transport = Arc::new(MockTransport::new());
    transport
        .stub_get("/resource/7", resource_metadata(false, 0))
        .await;
    transport.stub_get("/resource/7/extensions", json!({})).await;
    transport
        .stub_get(
            "/resource/7/aux",
            json!({"fields": [
                {"id": 100, "display_name": "Street Name", "lookup_table": 300},
                {"id": 101, "display_name": "Lane Count"}
            ]}),
        )
        .await;
    transport
        .stub_get(
            "/resource/300",
            json!({"items": {"1": "asphalt", "2": "gravel"}}),
        )
        .await;

    let (orch, _dir) = orchestrator_with(
        vec![ReplicaConfig::for_testing(7, "roads")],
        transport.clone(),
    );
    assert!(orch.tick().await);
    let state = wait_terminal(&orch, "roads").await;
    assert_eq!(state, ReplicaState::Synchronized);

    // Aliases and lookup bindings landed in the schema, and the bound
    // lookup table was pulled alongside the aux payload.
    let store = orch.store("roads").await.unwrap();
    let schema = store.field_schema().await.unwrap();
    let name = schema.by_field_id(100).unwrap();
    assert_eq!(name.display_name, "Street Name");
    assert_eq!(name.lookup_table_id, Some(300));
    assert_eq!(schema.by_field_id(101).unwrap().display_name, "Lane Count");
    assert_eq!(transport.get_count("/resource/300").await, 1);
}

#[tokio::test]
async fn fill_failure_parks_replica_in_error() {
    let transport = Arc::new(MockTransport::new());
    transport
        .stub_get_err("/resource/11", TransportError::Server("boom".into()))
        .await;

    let (orch, _dir) = orchestrator_with(
        vec![ReplicaConfig::for_testing(11, "broken")],
        transport.clone(),
    );
    assert!(orch.tick().await);
    let state = wait_terminal(&orch, "broken").await;
    assert_eq!(state, ReplicaState::Error);

    let status = orch.replica_status("broken").await.unwrap();
    assert_eq!(status.error_kind, Some(ErrorKind::Network));
    // No container was created, so the next tick retries the fill.
    assert!(orch.store("broken").await.is_none());
}

// =============================================================================
// Upload Tests
// =============================================================================

#[tokio::test]
async fn upload_create_is_acknowledged_and_reconciled() {
    let transport = Arc::new(MockTransport::new());
    transport
        .stub_get("/resource/7", resource_metadata(false, 0))
        .await;
    transport.stub_get("/resource/7/extensions", json!({})).await;
    transport
        .stub_post(json!([{"action": "create", "id": 42, "version": 1}]))
        .await;

    let (orch, _dir) = orchestrator_with(
        vec![ReplicaConfig::for_testing(7, "roads")],
        transport.clone(),
    );
    assert!(orch.tick().await);
    assert_eq!(wait_terminal(&orch, "roads").await, ReplicaState::Synchronized);

    // Host edit while offline.
    let store = orch.store("roads").await.unwrap();
    let fid = store
        .edit_insert(
            Some(Geometry::Point(1.0, 2.0)),
            vec![FieldValue::Text("Main St".into()), FieldValue::Integer(2)],
        )
        .await
        .unwrap();
    assert_eq!(store.added_fids().await.unwrap(), vec![fid]);

    assert!(orch.tick().await);
    wait_idle(&orch).await;
    assert_eq!(
        orch.replica_status("roads").await.unwrap().state,
        ReplicaState::Synchronized
    );

    // The acknowledgement linked the local row to its server identity and
    // cleared the log.
    let mapping = store.mapping_for_fid(fid).await.unwrap().unwrap();
    assert_eq!(mapping.remote_id, Some(42));
    assert_eq!(mapping.remote_version, Some(1));
    assert!(store.added_fids().await.unwrap().is_empty());
    assert!(!store.has_pending_changes().await.unwrap());

    // Exactly one transaction was posted, in the plain wire form.
    let bodies = transport.posted_bodies().await;
    assert_eq!(bodies.len(), 1);
    let batch = bodies[0].as_array().unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0]["action"], json!("create"));
    assert_eq!(batch[0]["geom"], json!("POINT (1 2)"));
    assert_eq!(batch[0]["fields"]["100"], json!("Main St"));
}

// =============================================================================
// Versioned Delta Tests
// =============================================================================

#[tokio::test]
async fn delta_pull_follows_continuation_pages() {
    let transport = Arc::new(MockTransport::new());
    transport
        .stub_get("/resource/108", resource_metadata(true, 7))
        .await;
    transport
        .stub_get(
            "/resource/108/delta",
            json!({
                "version": 9,
                "actions": [
                    {"seq": 1, "action": {
                        "action": "create", "id": 500, "version": 8,
                        "geom": Geometry::Point(1.0, 2.0).to_wkb_base64(),
                        "fields": [{"id": 100, "val": "A"}, {"id": 101, "val": 1}]
                    }},
                    {"seq": 2, "action": {
                        "action": "create", "id": 501, "version": 8,
                        "fields": [{"id": 100, "val": "B"}]
                    }},
                    {"continue": "/resource/108/delta?cursor=2"}
                ]
            }),
        )
        .await;
    transport
        .stub_get(
            "/resource/108/delta?cursor=2",
            json!([
                {"action": "create", "id": 502, "version": 9,
                 "fields": [{"id": 101, "val": 3}]}
            ]),
        )
        .await;

    let (orch, _dir) = orchestrator_with(
        vec![ReplicaConfig::for_testing(108, "versioned")],
        transport.clone(),
    );
    assert!(orch.tick().await);
    assert_eq!(
        wait_terminal(&orch, "versioned").await,
        ReplicaState::Synchronized
    );

    let store = orch.store("versioned").await.unwrap();
    assert_eq!(store.feature_count().await.unwrap(), 3);
    assert!(store.fid_for_remote(502).await.unwrap().is_some());
    // The envelope carried the new target version.
    assert_eq!(store.meta().await.unwrap().version, Some(9));
    // Both pages were fetched through the cursor chain.
    assert_eq!(transport.get_count("/resource/108/delta").await, 2);

    let status = orch.replica_status("versioned").await.unwrap();
    assert_eq!(status.versioning, VersioningState::Synchronized);
}

#[tokio::test]
async fn delta_conflict_parks_replica_without_applying() {
    let transport = Arc::new(MockTransport::new());
    transport
        .stub_get("/resource/9", resource_metadata(true, 7))
        .await;
    transport
        .stub_get(
            "/resource/9/feature/",
            json!([{"id": 500, "geom": "POINT (0 0)", "version": 1,
                    "fields": {"100": "Old", "101": 2}}]),
        )
        .await;

    let (orch, _dir) = orchestrator_with(
        vec![ReplicaConfig::for_testing(9, "contested")],
        transport.clone(),
    );
    assert!(orch.tick().await);
    assert_eq!(
        wait_terminal(&orch, "contested").await,
        ReplicaState::Synchronized
    );

    // Host edits field 100 while the server produces a competing update of
    // the same field.
    let store = orch.store("contested").await.unwrap();
    let fid = store.fid_for_remote(500).await.unwrap().unwrap();
    store
        .edit_update_attr(fid, 0, FieldValue::Text("Mine".into()))
        .await
        .unwrap();
    transport
        .stub_get(
            "/resource/9/delta",
            json!({
                "version": 8,
                "actions": [
                    {"action": "update", "id": 500, "version": 8,
                     "fields": [{"id": 100, "val": "Theirs"}]}
                ]
            }),
        )
        .await;

    assert!(orch.tick().await);
    wait_idle(&orch).await;

    let status = orch.replica_status("contested").await.unwrap();
    assert_eq!(status.state, ReplicaState::NotSynchronized);
    assert_eq!(status.versioning, VersioningState::ConflictSolving);
    assert_eq!(status.conflicts.len(), 1);
    assert_eq!(status.conflicts[0].remote_id, 500);

    // Neither side advanced: the remote value was not applied, the local
    // edit is still pending, and the replica version did not move.
    let feature = store.feature(fid).await.unwrap().unwrap();
    assert_eq!(feature.attrs[0], FieldValue::Text("Mine".into()));
    assert!(store.has_pending_changes().await.unwrap());
    assert_eq!(store.meta().await.unwrap().version, Some(7));
    assert!(transport.posted_bodies().await.is_empty());
}

// =============================================================================
// Scheduler Tests
// =============================================================================

/// Transport whose metadata fetch never completes within a test run.
struct StallTransport;

#[async_trait::async_trait]
impl Transport for StallTransport {
    async fn get(&self, _path: &str) -> TransportResult<Value> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(json!([]))
    }
    async fn post(&self, _path: &str, _body: Value) -> TransportResult<Value> {
        Ok(json!([]))
    }
    async fn patch(&self, _path: &str, _body: Value) -> TransportResult<Value> {
        Ok(json!([]))
    }
    async fn delete(&self, _path: &str, _body: Value) -> TransportResult<Value> {
        Ok(json!([]))
    }
    async fn permissions(&self, _resource_id: i64) -> TransportResult<ResourcePermissions> {
        Ok(ResourcePermissions {
            read: true,
            write: true,
        })
    }
}

#[tokio::test]
async fn scheduler_runs_one_job_per_tick() {
    common::init_tracing();
    let dir = TempDir::new().unwrap();
    let mut config = SyncConfig::for_testing(dir.path());
    config.replicas = vec![
        ReplicaConfig::for_testing(1, "first"),
        ReplicaConfig::for_testing(2, "second"),
    ];
    let orch = SyncOrchestrator::with_transport(config, Arc::new(StallTransport));

    assert!(orch.tick().await);
    // The second tick is a no-op while the first job is in flight.
    assert!(!orch.tick().await);

    let statuses = orch.status().await;
    let in_flight = statuses
        .iter()
        .filter(|s| s.state == ReplicaState::Synchronizing)
        .count();
    assert_eq!(in_flight, 1);
}

#[tokio::test]
async fn scheduler_skips_manual_replicas() {
    common::init_tracing();
    let transport = Arc::new(MockTransport::new());
    let dir = TempDir::new().unwrap();
    let mut config = SyncConfig::for_testing(dir.path());
    let mut manual = ReplicaConfig::for_testing(3, "manual");
    manual.auto_sync = false;
    config.replicas = vec![manual];
    let orch = SyncOrchestrator::with_transport(config, transport);

    assert!(!orch.tick().await);
    assert_eq!(
        orch.replica_status("manual").await.unwrap().state,
        ReplicaState::NotInitialized
    );
}
