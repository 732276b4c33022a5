// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Action extraction: change log → pending local actions.
//!
//! Reads the replica's change-log tables and produces the ordered set of
//! pending local [`Action`]s: created rows first, then deletions, then
//! restorations, then updates. Updates carry only the fields and geometry
//! that actually changed.
//!
//! Extraction is a pure read (one consistent snapshot); it never mutates the
//! log. Store failures surface as container errors and are not retried
//! here; the orchestrator decides whether to retry on a later tick.

use crate::action::{Action, FieldUpdate};
use crate::error::{Result, SyncError};
use crate::store::{FeatureMapping, ReplicaStore};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Build the full set of pending local actions.
pub async fn extract_pending(store: &ReplicaStore) -> Result<Vec<Action>> {
    let schema = store.field_schema().await?;
    let mut actions = Vec::new();

    // 1. Created rows: full field set, remote id absent.
    for fid in store.added_fids().await? {
        let feature = store.feature(fid).await?.ok_or_else(|| {
            SyncError::container(format!("created row {} missing from features", fid))
        })?;
        let mut fields = Vec::with_capacity(feature.attrs.len());
        for (idx, value) in feature.attrs.iter().enumerate() {
            fields.push(FieldUpdate::new(
                schema.field_id_for_index(idx as i64)?,
                value.clone(),
            ));
        }
        actions.push(Action::Create {
            local_id: fid,
            version: None,
            geometry: feature.geometry,
            fields,
        });
    }

    // 2. Deleted rows, resolved through the identity mapping. A row deleted
    //    before ever syncing produces no Delete action.
    for fid in store.removed_fids().await? {
        match store.mapping_for_fid(fid).await? {
            Some(FeatureMapping {
                remote_id: Some(remote_id),
                remote_version,
                ..
            }) => {
                actions.push(Action::Delete {
                    remote_id,
                    version: remote_version,
                });
            }
            _ => {
                debug!(fid, "Skipping delete of never-synced row");
            }
        }
    }

    // 3. Restored rows: undone deletions, re-asserting content at the last
    //    known remote version.
    for fid in store.restored_fids().await? {
        let mapping = store.mapping_for_fid(fid).await?;
        let (remote_id, remote_version) = match mapping {
            Some(m) => match (m.remote_id, m.remote_version) {
                (Some(id), Some(v)) => (id, v),
                _ => {
                    warn!(fid, "Restored row has no remote identity; skipping");
                    continue;
                }
            },
            None => {
                warn!(fid, "Restored row has no identity mapping; skipping");
                continue;
            }
        };
        let feature = store.feature(fid).await?.ok_or_else(|| {
            SyncError::container(format!("restored row {} missing from features", fid))
        })?;
        let mut fields = Vec::with_capacity(feature.attrs.len());
        for (idx, value) in feature.attrs.iter().enumerate() {
            fields.push(FieldUpdate::new(
                schema.field_id_for_index(idx as i64)?,
                value.clone(),
            ));
        }
        actions.push(Action::Restore {
            remote_id,
            version: remote_version,
            geometry: feature.geometry,
            fields,
        });
    }

    // 4. Updated rows: union of attribute-changed and geometry-changed ids,
    //    one Update per row carrying only what changed.
    let attr_updates = store.attr_updates().await?;
    let geom_fids: BTreeSet<i64> = store.geom_updated_fids().await?.into_iter().collect();
    let mut updated: BTreeSet<i64> = attr_updates.keys().copied().collect();
    updated.extend(geom_fids.iter().copied());

    for fid in updated {
        let (remote_id, remote_version) = match store.mapping_for_fid(fid).await? {
            Some(FeatureMapping {
                remote_id: Some(remote_id),
                remote_version,
                ..
            }) => (remote_id, remote_version),
            _ => {
                warn!(fid, "Updated row has no remote identity; skipping");
                continue;
            }
        };
        let feature = store.feature(fid).await?.ok_or_else(|| {
            SyncError::container(format!("updated row {} missing from features", fid))
        })?;

        let mut fields = Vec::new();
        if let Some(indexes) = attr_updates.get(&fid) {
            for &idx in indexes {
                let value = feature
                    .attrs
                    .get(idx as usize)
                    .cloned()
                    .unwrap_or(crate::value::FieldValue::Null);
                fields.push(FieldUpdate::new(schema.field_id_for_index(idx)?, value));
            }
        }
        let geometry = if geom_fids.contains(&fid) {
            feature.geometry
        } else {
            None
        };

        actions.push(Action::Update {
            remote_id,
            version: remote_version,
            geometry,
            fields,
        });
    }

    debug!(count = actions.len(), "Extracted pending actions");
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionKind;
    use crate::geometry::Geometry;
    use crate::store::{FieldDef, ReplicaMeta, CONTAINER_VERSION};
    use crate::value::FieldValue;
    use tempfile::tempdir;

    fn meta() -> ReplicaMeta {
        ReplicaMeta {
            container_version: CONTAINER_VERSION,
            connection_id: "c".into(),
            instance_id: "i".into(),
            resource_id: 108,
            display_name: "Roads".into(),
            table_name: "roads".into(),
            description: None,
            geometry_type: "POINT".into(),
            transaction_id: None,
            epoch: None,
            version: None,
            last_seq: 0,
            last_sync_at: None,
            last_error_code: 0,
            auto_sync: true,
            read_only: false,
        }
    }

    fn fields() -> Vec<FieldDef> {
        vec![
            FieldDef {
                attr_index: 0,
                remote_field_id: 100,
                datatype: "STRING".into(),
                keyname: "name".into(),
                display_name: "Name".into(),
                is_label: true,
                lookup_table_id: None,
            },
            FieldDef {
                attr_index: 1,
                remote_field_id: 101,
                datatype: "INTEGER".into(),
                keyname: "lanes".into(),
                display_name: "Lanes".into(),
                is_label: false,
                lookup_table_id: None,
            },
        ]
    }

    async fn create_store(dir: &tempfile::TempDir) -> ReplicaStore {
        ReplicaStore::create(dir.path().join("x.gpkg"), meta(), fields())
            .await
            .unwrap()
    }

    /// Mark a row acknowledged: clear its added entry and give it an identity.
    async fn ack(store: &ReplicaStore, fid: i64, remote_id: i64, version: i64) {
        crate::reconcile::reconcile_acknowledged(
            store,
            &[Action::Create {
                local_id: fid,
                version: None,
                geometry: None,
                fields: vec![],
            }],
            &[crate::reconcile::Acknowledgement {
                kind: ActionKind::Create,
                remote_id: Some(remote_id),
                version: Some(version),
            }],
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_created_row_yields_create_without_remote_id() {
        let dir = tempdir().unwrap();
        let store = create_store(&dir).await;
        let fid = store
            .edit_insert(
                Some(Geometry::Point(1.0, 2.0)),
                vec![FieldValue::Text("High St".into()), FieldValue::Integer(2)],
            )
            .await
            .unwrap();

        let actions = extract_pending(&store).await.unwrap();
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            Action::Create {
                local_id,
                version,
                geometry,
                fields,
            } => {
                assert_eq!(*local_id, fid);
                assert_eq!(*version, None);
                assert_eq!(*geometry, Some(Geometry::Point(1.0, 2.0)));
                assert_eq!(fields.len(), 2);
                assert_eq!(fields[0].field_id, 100);
                assert_eq!(fields[1].field_id, 101);
            }
            other => panic!("expected Create, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_carries_only_changed_fields() {
        let dir = tempdir().unwrap();
        let store = create_store(&dir).await;
        let fid = store
            .edit_insert(
                None,
                vec![FieldValue::Text("a".into()), FieldValue::Integer(1)],
            )
            .await
            .unwrap();
        ack(&store, fid, 42, 3).await;

        store
            .edit_update_attr(fid, 1, FieldValue::Integer(4))
            .await
            .unwrap();

        let actions = extract_pending(&store).await.unwrap();
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            Action::Update {
                remote_id,
                version,
                geometry,
                fields,
            } => {
                assert_eq!(*remote_id, 42);
                assert_eq!(*version, Some(3));
                assert!(geometry.is_none());
                assert_eq!(fields.len(), 1);
                assert_eq!(fields[0].field_id, 101);
                assert_eq!(fields[0].value, FieldValue::Integer(4));
            }
            other => panic!("expected Update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_geometry_only_update() {
        let dir = tempdir().unwrap();
        let store = create_store(&dir).await;
        let fid = store
            .edit_insert(
                None,
                vec![FieldValue::Text("a".into()), FieldValue::Integer(1)],
            )
            .await
            .unwrap();
        ack(&store, fid, 5, 1).await;

        store
            .edit_update_geom(fid, Geometry::Point(9.0, 9.0))
            .await
            .unwrap();

        let actions = extract_pending(&store).await.unwrap();
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            Action::Update {
                geometry, fields, ..
            } => {
                assert_eq!(*geometry, Some(Geometry::Point(9.0, 9.0)));
                assert!(fields.is_empty());
            }
            other => panic!("expected Update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_resolves_remote_id() {
        let dir = tempdir().unwrap();
        let store = create_store(&dir).await;
        let fid = store
            .edit_insert(
                None,
                vec![FieldValue::Text("a".into()), FieldValue::Integer(1)],
            )
            .await
            .unwrap();
        ack(&store, fid, 77, 2).await;

        store.edit_delete(fid).await.unwrap();

        let actions = extract_pending(&store).await.unwrap();
        assert_eq!(
            actions,
            vec![Action::Delete {
                remote_id: 77,
                version: Some(2)
            }]
        );
    }

    #[tokio::test]
    async fn test_restore_carries_full_content() {
        let dir = tempdir().unwrap();
        let store = create_store(&dir).await;
        let fid = store
            .edit_insert(
                None,
                vec![FieldValue::Text("a".into()), FieldValue::Integer(1)],
            )
            .await
            .unwrap();
        ack(&store, fid, 13, 6).await;

        store.edit_delete(fid).await.unwrap();
        store
            .edit_restore(
                fid,
                Some(Geometry::Point(3.0, 4.0)),
                vec![FieldValue::Text("a".into()), FieldValue::Integer(1)],
            )
            .await
            .unwrap();

        let actions = extract_pending(&store).await.unwrap();
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            Action::Restore {
                remote_id,
                version,
                geometry,
                fields,
            } => {
                assert_eq!(*remote_id, 13);
                assert_eq!(*version, 6);
                assert_eq!(*geometry, Some(Geometry::Point(3.0, 4.0)));
                assert_eq!(fields.len(), 2);
            }
            other => panic!("expected Restore, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_extraction_order_is_create_delete_restore_update() {
        let dir = tempdir().unwrap();
        let store = create_store(&dir).await;

        // A synced row we will update, and one we will delete.
        let upd = store
            .edit_insert(
                None,
                vec![FieldValue::Text("u".into()), FieldValue::Integer(1)],
            )
            .await
            .unwrap();
        ack(&store, upd, 1, 1).await;
        let del = store
            .edit_insert(
                None,
                vec![FieldValue::Text("d".into()), FieldValue::Integer(1)],
            )
            .await
            .unwrap();
        ack(&store, del, 2, 1).await;

        store.edit_delete(del).await.unwrap();
        store
            .edit_update_attr(upd, 0, FieldValue::Text("u2".into()))
            .await
            .unwrap();
        store
            .edit_insert(
                None,
                vec![FieldValue::Text("new".into()), FieldValue::Null],
            )
            .await
            .unwrap();

        let kinds: Vec<ActionKind> = extract_pending(&store)
            .await
            .unwrap()
            .iter()
            .map(Action::kind)
            .collect();
        assert_eq!(
            kinds,
            vec![ActionKind::Create, ActionKind::Delete, ActionKind::Update]
        );
    }

    #[tokio::test]
    async fn test_empty_log_extracts_nothing() {
        let dir = tempdir().unwrap();
        let store = create_store(&dir).await;
        assert!(extract_pending(&store).await.unwrap().is_empty());
    }
}
