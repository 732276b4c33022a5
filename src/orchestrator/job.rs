// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One sync job, start to finish.
//!
//! A job owns one replica for its whole duration: the scheduler guarantees
//! no second job runs anywhere in the process while this one is in flight.
//! Rows are flipped read-only on entry and restored on every exit path.
//! Transport calls are the only suspension points and each one is bounded
//! by the configured per-call timeout; expiry fails the job and the
//! scheduler retries on a later tick.

use super::types::{ReplicaState, VersioningState};
use super::ReplicaSlot;
use crate::action::{Action, FieldUpdate};
use crate::applier;
use crate::conflict::{self, Conflict};
use crate::config::TimingConfig;
use crate::error::{Result, SyncError};
use crate::extractor;
use crate::geometry::Geometry;
use crate::metrics;
use crate::reconcile::{self, Acknowledgement};
use crate::serializer;
use crate::store::{FieldDef, ReplicaMeta, ReplicaStore, CONTAINER_VERSION};
use crate::transport::{Transport, TransportResult};
use crate::value::FieldValue;
use serde_json::Value;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How a job that did not fail finished.
enum Outcome {
    Clean,
    Conflicts(Vec<Conflict>),
}

/// Run one sync job for one replica and fold the result into its status.
///
/// The caller has already moved the replica to `Synchronizing`; this
/// function owns every transition out of it.
pub(super) async fn run<T: Transport>(
    slot: Arc<ReplicaSlot>,
    transport: Arc<T>,
    timing: TimingConfig,
    connection_id: String,
) {
    let container = slot.config.container_name.clone();
    let started = Instant::now();
    {
        let mut status = slot.status.write().await;
        status.last_checked_at = Some(chrono::Utc::now());
    }

    let result = sync_replica(&slot, &*transport, &timing, &connection_id).await;

    // Exit path: restore editability per the server's write grant, then
    // publish the terminal state. Runs regardless of outcome.
    let editable = match bounded(
        "permissions",
        timing.call_timeout(),
        transport.permissions(slot.config.resource_id),
    )
    .await
    {
        Ok(perms) => perms.write,
        Err(e) => {
            debug!(container = %container, error = %e, "Permission check failed; restoring editable");
            true
        }
    };
    if let Some(store) = slot.store.read().await.clone() {
        if let Err(e) = store.set_read_only(!editable).await {
            warn!(container = %container, error = %e, "Failed to restore row editability");
        }
    }

    let mut status = slot.status.write().await;
    match result {
        Ok(Outcome::Clean) => {
            status.state = ReplicaState::Synchronized;
            status.error_kind = None;
            status.conflicts.clear();
            status.last_synced_at = Some(chrono::Utc::now());
            if let Some(store) = slot.store.read().await.clone() {
                let at = chrono::Utc::now().timestamp_millis();
                if let Err(e) = store.set_last_sync(at).await {
                    warn!(container = %container, error = %e, "Failed to persist sync timestamp");
                }
            }
            metrics::record_sync_job(&container, true, started.elapsed());
            info!(container = %container, elapsed_ms = started.elapsed().as_millis() as u64, "Sync complete");
        }
        Ok(Outcome::Conflicts(conflicts)) => {
            metrics::record_conflicts(&container, conflicts.len());
            metrics::record_sync_job(&container, false, started.elapsed());
            warn!(container = %container, count = conflicts.len(), "Conflicts parked for resolution");
            status.state = ReplicaState::NotSynchronized;
            status.versioning = VersioningState::ConflictSolving;
            status.error_kind = None;
            status.conflicts = conflicts;
        }
        Err(e) => {
            let kind = e.kind();
            metrics::record_error(&container, kind);
            metrics::record_sync_job(&container, false, started.elapsed());
            warn!(container = %container, error = %e, kind = %kind, "Sync job failed");
            status.state = ReplicaState::Error;
            status.error_kind = Some(kind);
            if let Some(store) = slot.store.read().await.clone() {
                if let Err(pe) = store.set_last_error_code(e.code()).await {
                    warn!(container = %container, error = %pe, "Failed to persist error code");
                }
            }
        }
    }
    metrics::set_replica_state(&container, &status.state.to_string());
    drop(status);

    // Aux metadata is refreshed after a successful job, at most once per
    // configured interval, independent of the delta/upload cycle.
    if slot.status.read().await.state == ReplicaState::Synchronized {
        maybe_refresh_aux(&slot, &*transport, &timing).await;
    }
}

async fn sync_replica<T: Transport>(
    slot: &ReplicaSlot,
    transport: &T,
    timing: &TimingConfig,
    connection_id: &str,
) -> Result<Outcome> {
    let store = open_or_fill(slot, transport, timing, connection_id).await?;
    store.set_read_only(true).await?;

    let meta = store.meta().await?;
    let versioned = meta.is_versioned();

    if versioned {
        set_versioning(slot, VersioningState::FetchingChanges).await;
        let from_version = meta.version.unwrap_or(0);
        let (pages, target_version) =
            pull_delta_pages(transport, timing, slot.config.resource_id, from_version, &store)
                .await?;

        set_versioning(slot, VersioningState::ConflictDetection).await;
        let local = extractor::extract_pending(&store).await?;
        let remote: Vec<Action> = pages.iter().flatten().cloned().collect();
        let conflicts = conflict::detect(&local, &remote);
        if !conflicts.is_empty() {
            return Ok(Outcome::Conflicts(conflicts));
        }

        set_versioning(slot, VersioningState::ChangesApplying).await;
        let mut pulled = 0;
        for page in &pages {
            if page.is_empty() {
                continue;
            }
            let stats = applier::apply_remote(&store, page).await?;
            metrics::record_apply_skipped(&slot.config.container_name, stats.skipped);
            pulled += page.len();
        }
        metrics::record_actions_pulled(&slot.config.container_name, pulled);
        if let Some(v) = target_version {
            store.set_resource_version(v).await?;
        }
    }

    // Rule: re-check after applying; anything still pending goes up.
    if store.has_pending_changes().await? {
        if versioned {
            set_versioning(slot, VersioningState::UploadingChanges).await;
        }
        upload_pending(slot, transport, timing, &store, versioned).await?;
    }

    if versioned {
        set_versioning(slot, VersioningState::Synchronized).await;
    } else {
        set_versioning(slot, VersioningState::NotVersionedLayer).await;
    }
    Ok(Outcome::Clean)
}

/// Open the replica store, running the stub fill first if the container
/// does not exist yet.
async fn open_or_fill<T: Transport>(
    slot: &ReplicaSlot,
    transport: &T,
    timing: &TimingConfig,
    connection_id: &str,
) -> Result<Arc<ReplicaStore>> {
    if let Some(store) = slot.store.read().await.clone() {
        return Ok(store);
    }

    let store = if slot.path.exists() {
        Arc::new(ReplicaStore::open(&slot.path).await?)
    } else {
        Arc::new(stub_fill(slot, transport, timing, connection_id).await?)
    };
    *slot.store.write().await = Some(store.clone());
    Ok(store)
}

/// First-contact fill: fetch resource metadata, create the container, then
/// download the full snapshot. Non-versioned replicas additionally pull the
/// extension objects (descriptions) the plain protocol carries.
async fn stub_fill<T: Transport>(
    slot: &ReplicaSlot,
    transport: &T,
    timing: &TimingConfig,
    connection_id: &str,
) -> Result<ReplicaStore> {
    let rid = slot.config.resource_id;
    info!(container = %slot.config.container_name, resource_id = rid, "Stub fill: creating replica");

    let payload = bounded(
        "resource_metadata",
        timing.call_timeout(),
        transport.get(&format!("/resource/{rid}")),
    )
    .await?;
    let (meta, fields) = parse_resource_metadata(
        &payload,
        connection_id,
        rid,
        &slot.config.container_name,
        slot.config.auto_sync,
    )?;
    let versioned = meta.is_versioned();
    let store = ReplicaStore::create(&slot.path, meta, fields).await?;

    let snapshot = bounded(
        "snapshot",
        timing.call_timeout(),
        transport.get(&format!("/resource/{rid}/feature/")),
    )
    .await?;
    let creates = decode_snapshot(&snapshot)?;
    if !creates.is_empty() {
        let stats = applier::apply_remote(&store, &creates).await?;
        info!(container = %slot.config.container_name, created = stats.created, "Snapshot applied");
    }

    if !versioned {
        let extensions = bounded(
            "extensions",
            timing.call_timeout(),
            transport.get(&format!("/resource/{rid}/extensions")),
        )
        .await?;
        let describes = serializer::decode_plain(&extensions)?;
        if !describes.is_empty() {
            applier::apply_remote(&store, &describes).await?;
        }
    }

    Ok(store)
}

/// Pull every delta page, following `Continue` cursors, without applying
/// anything. Returns the pages plus the server's target version if the
/// envelope carried one.
async fn pull_delta_pages<T: Transport>(
    transport: &T,
    timing: &TimingConfig,
    resource_id: i64,
    from_version: i64,
    store: &ReplicaStore,
) -> Result<(Vec<Vec<Action>>, Option<i64>)> {
    let schema = store.field_schema().await?;
    let mut pages = Vec::new();
    let mut target = None;
    let mut url = format!("/resource/{resource_id}/delta?from={from_version}");

    loop {
        let payload = bounded("delta_pull", timing.call_timeout(), transport.get(&url)).await?;
        // Pages are either bare arrays or `{"version": n, "actions": [...]}`
        // envelopes; the target version may arrive on any page.
        let body = if payload.get("actions").map_or(false, Value::is_array) {
            if let Some(v) = payload.get("version").and_then(Value::as_i64) {
                target = Some(v);
            }
            &payload["actions"]
        } else {
            &payload
        };

        let mut actions = serializer::decode_versioned(body, &schema)?;
        let next = match actions.last() {
            Some(Action::Continue { cursor_url }) => Some(cursor_url.clone()),
            _ => None,
        };
        if next.is_some() {
            actions.pop();
        }
        debug!(page = pages.len(), count = actions.len(), "Pulled delta page");
        pages.push(actions);

        match next {
            Some(cursor) => url = cursor,
            None => break,
        }
    }
    Ok((pages, target))
}

/// Extract, encode, transmit, and reconcile the pending local changes.
async fn upload_pending<T: Transport>(
    slot: &ReplicaSlot,
    transport: &T,
    timing: &TimingConfig,
    store: &ReplicaStore,
    versioned: bool,
) -> Result<()> {
    let actions = extractor::extract_pending(store).await?;
    if actions.is_empty() {
        return Ok(());
    }

    let rid = slot.config.resource_id;
    let last_seq = store.meta().await?.last_seq;
    let body = if versioned {
        serializer::encode_versioned(&actions, last_seq + 1)?
    } else {
        serializer::encode_plain(&actions)?
    };

    let response = bounded(
        "upload",
        timing.call_timeout(),
        transport.post(&format!("/resource/{rid}/tx"), body),
    )
    .await?;
    let acks = Acknowledgement::parse_batch(&response)?;
    reconcile::reconcile_acknowledged(store, &actions, &acks).await?;

    if versioned {
        store.set_last_seq(last_seq + actions.len() as i64).await?;
    }
    metrics::record_actions_pushed(&slot.config.container_name, actions.len());
    Ok(())
}

/// Refresh field aliases and lookup-table bindings, at most once per
/// configured interval. Failures are logged and never fail the job that
/// triggered the refresh.
async fn maybe_refresh_aux<T: Transport>(
    slot: &ReplicaSlot,
    transport: &T,
    timing: &TimingConfig,
) {
    {
        let last = slot.last_aux_refresh.lock().await;
        if let Some(at) = *last {
            if at.elapsed() < timing.aux_refresh() {
                return;
            }
        }
    }

    let container = &slot.config.container_name;
    match refresh_aux(slot, transport, timing).await {
        Ok(()) => {
            *slot.last_aux_refresh.lock().await = Some(Instant::now());
            metrics::record_aux_refresh(container, true);
            debug!(container = %container, "Aux metadata refreshed");
        }
        Err(e) => {
            metrics::record_aux_refresh(container, false);
            warn!(container = %container, error = %e, "Aux metadata refresh failed");
        }
    }
}

async fn refresh_aux<T: Transport>(
    slot: &ReplicaSlot,
    transport: &T,
    timing: &TimingConfig,
) -> Result<()> {
    let rid = slot.config.resource_id;
    let payload = bounded(
        "aux_metadata",
        timing.call_timeout(),
        transport.get(&format!("/resource/{rid}/aux")),
    )
    .await?;

    let Some(store) = slot.store.read().await.clone() else {
        return Ok(());
    };
    let Some(fields) = payload.get("fields").and_then(Value::as_array) else {
        return Ok(());
    };
    let mut lookup_ids = BTreeSet::new();
    for field in fields {
        let Some(id) = field.get("id").and_then(Value::as_i64) else {
            continue;
        };
        let Some(alias) = field.get("display_name").and_then(Value::as_str) else {
            continue;
        };
        let lookup = field.get("lookup_table").and_then(Value::as_i64);
        store.update_field_alias(id, alias, lookup).await?;
        lookup_ids.extend(lookup);
    }

    // The persisted layout keeps only the lookup-table id per field; the
    // tables themselves are fetched for freshness and not stored.
    for lookup_id in lookup_ids {
        let table = bounded(
            "lookup_table",
            timing.call_timeout(),
            transport.get(&format!("/resource/{lookup_id}")),
        )
        .await?;
        let entries = table
            .get("items")
            .and_then(Value::as_object)
            .map_or(0, |items| items.len());
        debug!(lookup_id, entries, "Fetched lookup table");
    }
    Ok(())
}

async fn set_versioning(slot: &ReplicaSlot, state: VersioningState) {
    slot.status.write().await.versioning = state;
}

/// Wrap one transport call in the per-call timeout.
async fn bounded<T, F>(phase: &'static str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = TransportResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(SyncError::Timeout { phase }),
    }
}

/// Build the replica metadata and field schema from a resource-metadata
/// payload.
fn parse_resource_metadata(
    payload: &Value,
    connection_id: &str,
    resource_id: i64,
    container_name: &str,
    auto_sync: bool,
) -> Result<(ReplicaMeta, Vec<FieldDef>)> {
    let resource = payload
        .get("resource")
        .ok_or_else(|| SyncError::Synchronization("resource metadata missing".into()))?;
    let layer = payload
        .get("feature_layer")
        .ok_or_else(|| SyncError::Synchronization("feature_layer metadata missing".into()))?;

    let display_name = resource
        .get("display_name")
        .and_then(Value::as_str)
        .unwrap_or(container_name)
        .to_string();
    let table_name = resource
        .get("keyname")
        .and_then(Value::as_str)
        .unwrap_or(&display_name)
        .to_string();
    let geometry_type = layer
        .get("geometry_type")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Synchronization("geometry_type missing".into()))?
        .to_string();

    let (epoch, version) = match payload.get("versioning") {
        Some(v) if v.get("enabled").and_then(Value::as_bool) == Some(true) => (
            v.get("epoch").and_then(Value::as_i64),
            v.get("version").and_then(Value::as_i64).or(Some(0)),
        ),
        _ => (None, None),
    };

    let meta = ReplicaMeta {
        container_version: CONTAINER_VERSION,
        connection_id: connection_id.to_string(),
        instance_id: resource
            .get("instance")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        resource_id,
        display_name,
        table_name,
        description: resource
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
        geometry_type,
        transaction_id: None,
        epoch,
        version,
        last_seq: 0,
        last_sync_at: None,
        last_error_code: 0,
        auto_sync,
        read_only: false,
    };

    let raw_fields = layer
        .get("fields")
        .and_then(Value::as_array)
        .ok_or_else(|| SyncError::Synchronization("field list missing".into()))?;
    let mut fields = Vec::with_capacity(raw_fields.len());
    for (index, field) in raw_fields.iter().enumerate() {
        let remote_field_id = field
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| SyncError::Synchronization("field id missing".into()))?;
        let keyname = field
            .get("keyname")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::Synchronization("field keyname missing".into()))?;
        fields.push(FieldDef {
            attr_index: index as i64,
            remote_field_id,
            datatype: field
                .get("datatype")
                .and_then(Value::as_str)
                .unwrap_or("STRING")
                .to_string(),
            keyname: keyname.to_string(),
            display_name: field
                .get("display_name")
                .and_then(Value::as_str)
                .unwrap_or(keyname)
                .to_string(),
            is_label: field.get("label_field").and_then(Value::as_bool) == Some(true),
            lookup_table_id: field.get("lookup_table").and_then(Value::as_i64),
        });
    }

    Ok((meta, fields))
}

/// Decode a full-snapshot page: flat feature objects with WKT geometry and
/// fields keyed by remote field id. Each becomes a remote-shaped `Create`.
fn decode_snapshot(payload: &Value) -> Result<Vec<Action>> {
    let items = payload
        .as_array()
        .ok_or_else(|| SyncError::Synchronization("snapshot is not an array".into()))?;

    let mut actions = Vec::with_capacity(items.len());
    for item in items {
        let remote_id = item
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| SyncError::Synchronization("snapshot feature missing id".into()))?;
        let geometry = match item.get("geom").and_then(Value::as_str) {
            Some(wkt) => Some(Geometry::from_wkt(wkt)?),
            None => None,
        };
        let mut fields = Vec::new();
        if let Some(map) = item.get("fields").and_then(Value::as_object) {
            for (key, raw) in map {
                let field_id = key.parse::<i64>().map_err(|_| {
                    SyncError::Synchronization(format!("snapshot field key {key:?} is not numeric"))
                })?;
                fields.push(FieldUpdate::new(field_id, FieldValue::from_json(raw)?));
            }
        }
        actions.push(Action::Create {
            local_id: remote_id,
            version: item.get("version").and_then(Value::as_i64),
            geometry,
            fields,
        });
    }
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata_payload(versioned: bool) -> Value {
        json!({
            "resource": {
                "display_name": "Roads",
                "keyname": "roads",
                "instance": "prod-1",
                "description": "street network"
            },
            "feature_layer": {
                "geometry_type": "POINT",
                "fields": [
                    {"id": 100, "keyname": "name", "datatype": "STRING",
                     "display_name": "Name", "label_field": true},
                    {"id": 101, "keyname": "lanes", "datatype": "INTEGER"}
                ]
            },
            "versioning": {"enabled": versioned, "epoch": 1, "version": 7}
        })
    }

    #[test]
    fn test_parse_metadata_versioned() {
        let (meta, fields) =
            parse_resource_metadata(&metadata_payload(true), "c1", 108, "roads.gpkg", true)
                .unwrap();
        assert_eq!(meta.resource_id, 108);
        assert_eq!(meta.table_name, "roads");
        assert_eq!(meta.epoch, Some(1));
        assert_eq!(meta.version, Some(7));
        assert!(meta.is_versioned());
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].attr_index, 0);
        assert_eq!(fields[0].remote_field_id, 100);
        assert!(fields[0].is_label);
        assert_eq!(fields[1].display_name, "lanes"); // falls back to keyname
    }

    #[test]
    fn test_parse_metadata_unversioned() {
        let (meta, _) =
            parse_resource_metadata(&metadata_payload(false), "c1", 108, "roads.gpkg", true)
                .unwrap();
        assert_eq!(meta.epoch, None);
        assert_eq!(meta.version, None);
        assert!(!meta.is_versioned());
    }

    #[test]
    fn test_parse_metadata_requires_geometry_type() {
        let mut payload = metadata_payload(true);
        payload["feature_layer"]
            .as_object_mut()
            .unwrap()
            .remove("geometry_type");
        assert!(matches!(
            parse_resource_metadata(&payload, "c1", 108, "r", true).unwrap_err(),
            SyncError::Synchronization(_)
        ));
    }

    #[test]
    fn test_decode_snapshot() {
        let payload = json!([
            {"id": 5, "geom": "POINT (1 2)", "fields": {"100": "High St", "101": 2}},
            {"id": 6, "fields": {}}
        ]);
        let actions = decode_snapshot(&payload).unwrap();
        assert_eq!(actions.len(), 2);
        let Action::Create {
            local_id,
            geometry,
            fields,
            ..
        } = &actions[0]
        else {
            panic!("expected create");
        };
        assert_eq!(*local_id, 5);
        assert_eq!(*geometry, Some(Geometry::Point(1.0, 2.0)));
        assert_eq!(fields.len(), 2);
        let Action::Create { geometry, .. } = &actions[1] else {
            panic!("expected create");
        };
        assert!(geometry.is_none());
    }

    #[test]
    fn test_decode_snapshot_rejects_non_numeric_field_key() {
        let payload = json!([{"id": 5, "fields": {"name": "x"}}]);
        assert!(decode_snapshot(&payload).is_err());
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let err = bounded("delta_pull", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            TransportResult::Ok(json!([]))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SyncError::Timeout { phase: "delta_pull" }));
    }
}
