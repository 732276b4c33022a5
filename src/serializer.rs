// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire encoding of actions, in two independent protocol modes.
//!
//! The mode is selected solely by whether the replica is versioned (carries
//! an epoch/version pair):
//!
//! - **Versioned mode**: outgoing batches are sequences of
//!   `{"seq": n, "action": {...}}` pairs, with sequence numbers continuing
//!   monotonically from the last number the server acknowledged. Only data
//!   actions (`create`/`update`/`delete`/`restore`/`describe_put`) may cross
//!   the wire; geometry is base64-encoded WKB (byte-exact, the server hashes
//!   it). `Create` omits its local-only fields (`local_id`, version).
//! - **Plain mode**: each feature action is a flat object keyed by remote id
//!   (omitted for `Create`), `fields` present only if non-empty and `geom`
//!   (WKT) present only if changed. Incoming plain payloads are whole-feature
//!   extension objects (description + attachments keyed by feature id), not
//!   action lists; decoding produces `DescribePut` actions only. Attachment
//!   entries are counted and dropped, never decoded.
//!
//! Field values map attribute index ↔ remote field id via the replica's
//! [`FieldSchema`]; unknown remote field ids fail decoding.

use crate::action::{Action, ActionKind, FieldUpdate};
use crate::error::{Result, SyncError};
use crate::geometry::Geometry;
use crate::store::FieldSchema;
use crate::value::FieldValue;
use serde_json::{json, Map, Value};
use tracing::debug;

// ── versioned mode ────────────────────────────────────────────────────────

/// Encode an upload batch for the versioned protocol.
///
/// `start_seq` is the first sequence number to assign; callers continue from
/// `replica_meta.last_seq + 1`.
pub fn encode_versioned(actions: &[Action], start_seq: i64) -> Result<Value> {
    let mut out = Vec::with_capacity(actions.len());
    for (i, action) in actions.iter().enumerate() {
        if !action.is_data_action() {
            return Err(SyncError::Synchronization(format!(
                "{} actions cannot cross the wire in versioned mode",
                action.kind()
            )));
        }
        out.push(json!({
            "seq": start_seq + i as i64,
            "action": versioned_action_object(action)?,
        }));
    }
    Ok(Value::Array(out))
}

fn versioned_action_object(action: &Action) -> Result<Value> {
    let mut obj = Map::new();
    obj.insert("action".into(), json!(action.kind().to_string()));
    match action {
        Action::Create {
            geometry, fields, ..
        } => {
            // local_id and version never cross the wire; the server assigns
            // the remote identity on acknowledgement.
            put_geom_wkb(&mut obj, geometry);
            put_fields(&mut obj, fields);
        }
        Action::Update {
            remote_id,
            version,
            geometry,
            fields,
        } => {
            obj.insert("id".into(), json!(remote_id));
            if let Some(v) = version {
                obj.insert("version".into(), json!(v));
            }
            put_geom_wkb(&mut obj, geometry);
            put_fields(&mut obj, fields);
        }
        Action::Delete { remote_id, version } => {
            obj.insert("id".into(), json!(remote_id));
            if let Some(v) = version {
                obj.insert("version".into(), json!(v));
            }
        }
        Action::Restore {
            remote_id,
            version,
            geometry,
            fields,
        } => {
            obj.insert("id".into(), json!(remote_id));
            obj.insert("version".into(), json!(version));
            put_geom_wkb(&mut obj, geometry);
            put_fields(&mut obj, fields);
        }
        Action::DescribePut {
            remote_id,
            version,
            text,
        } => {
            obj.insert("id".into(), json!(remote_id));
            if let Some(v) = version {
                obj.insert("version".into(), json!(v));
            }
            obj.insert("text".into(), json!(text));
        }
        // is_data_action() already excluded the rest.
        other => {
            return Err(SyncError::Internal(format!(
                "non-data action {} reached the versioned encoder",
                other.kind()
            )))
        }
    }
    Ok(Value::Object(obj))
}

/// Decode a versioned delta page.
///
/// Each element is either an action object or a continuation marker
/// `{"continue": "<cursor url>"}`; the continuation decodes to
/// [`Action::Continue`] and signals the orchestrator that another page must
/// be fetched before the batch is complete.
pub fn decode_versioned(payload: &Value, schema: &FieldSchema) -> Result<Vec<Action>> {
    let items = payload
        .as_array()
        .ok_or_else(|| SyncError::Synchronization("versioned delta is not an array".into()))?;

    let mut actions = Vec::with_capacity(items.len());
    for item in items {
        let obj = item.as_object().ok_or_else(|| {
            SyncError::Synchronization("versioned delta element is not an object".into())
        })?;

        if let Some(cursor) = obj.get("continue") {
            let cursor_url = cursor
                .as_str()
                .ok_or_else(|| {
                    SyncError::Synchronization("continuation cursor is not a string".into())
                })?
                .to_string();
            actions.push(Action::Continue { cursor_url });
            continue;
        }

        // Accept both bare action objects and {"seq": n, "action": {...}}
        // envelopes; the seq of incoming actions is the server's bookkeeping.
        let action_obj = match obj.get("action") {
            Some(Value::Object(inner)) => inner,
            _ => obj,
        };
        actions.push(decode_versioned_action(action_obj, schema)?);
    }
    Ok(actions)
}

fn decode_versioned_action(obj: &Map<String, Value>, schema: &FieldSchema) -> Result<Action> {
    let kind = obj
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Synchronization("action object missing 'action' tag".into()))?;
    let id = obj.get("id").and_then(Value::as_i64);
    let version = obj.get("version").and_then(Value::as_i64);
    let geometry = obj
        .get("geom")
        .and_then(Value::as_str)
        .map(Geometry::from_wkb_base64)
        .transpose()?;
    let fields = decode_fields(obj.get("fields"), schema)?;

    let require_id = || {
        id.ok_or_else(|| {
            SyncError::Synchronization(format!("{} action missing feature id", kind))
        })
    };

    match kind {
        "create" => Ok(Action::Create {
            // For a remote-originated create this is the server's feature id;
            // the applier links it into the identity mapping.
            local_id: require_id()?,
            version,
            geometry,
            fields,
        }),
        "update" => Ok(Action::Update {
            remote_id: require_id()?,
            version,
            geometry,
            fields,
        }),
        "delete" => Ok(Action::Delete {
            remote_id: require_id()?,
            version,
        }),
        "restore" => Ok(Action::Restore {
            remote_id: require_id()?,
            version: version.ok_or_else(|| {
                SyncError::Synchronization("restore action missing version".into())
            })?,
            geometry,
            fields,
        }),
        "describe_put" => Ok(Action::DescribePut {
            remote_id: require_id()?,
            version,
            text: obj
                .get("text")
                .and_then(Value::as_str)
                .map(str::to_string),
        }),
        "attachment_create" => Ok(Action::AttachmentCreate {
            remote_id: require_id()?,
            payload: Value::Object(obj.clone()),
        }),
        "attachment_update" => Ok(Action::AttachmentUpdate {
            remote_id: require_id()?,
            payload: Value::Object(obj.clone()),
        }),
        "attachment_delete" => Ok(Action::AttachmentDelete {
            remote_id: require_id()?,
            payload: Value::Object(obj.clone()),
        }),
        other => Err(SyncError::Synchronization(format!(
            "unknown action kind '{}'",
            other
        ))),
    }
}

fn put_geom_wkb(obj: &mut Map<String, Value>, geometry: &Option<Geometry>) {
    if let Some(g) = geometry {
        obj.insert("geom".into(), json!(g.to_wkb_base64()));
    }
}

fn put_fields(obj: &mut Map<String, Value>, fields: &[FieldUpdate]) {
    if !fields.is_empty() {
        let arr: Vec<Value> = fields
            .iter()
            .map(|f| json!({"id": f.field_id, "val": f.value.to_json()}))
            .collect();
        obj.insert("fields".into(), Value::Array(arr));
    }
}

fn decode_fields(value: Option<&Value>, schema: &FieldSchema) -> Result<Vec<FieldUpdate>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let items = value
        .as_array()
        .ok_or_else(|| SyncError::Synchronization("'fields' is not an array".into()))?;
    let mut fields = Vec::with_capacity(items.len());
    for item in items {
        let field_id = item
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| SyncError::Synchronization("field entry missing 'id'".into()))?;
        // Fail fast on field ids the local schema does not know.
        schema.index_for_field_id(field_id)?;
        let raw = item
            .get("val")
            .ok_or_else(|| SyncError::Synchronization("field entry missing 'val'".into()))?;
        fields.push(FieldUpdate::new(field_id, FieldValue::from_json(raw)?));
    }
    Ok(fields)
}

// ── plain mode ────────────────────────────────────────────────────────────

/// Encode an upload batch for the plain (non-versioned) protocol.
pub fn encode_plain(actions: &[Action]) -> Result<Value> {
    let mut out = Vec::with_capacity(actions.len());
    for action in actions {
        let mut obj = Map::new();
        obj.insert("action".into(), json!(action.kind().to_string()));
        match action {
            Action::Create {
                geometry, fields, ..
            } => {
                plain_body(&mut obj, geometry, fields);
            }
            Action::Update {
                remote_id,
                geometry,
                fields,
                ..
            } => {
                obj.insert("id".into(), json!(remote_id));
                plain_body(&mut obj, geometry, fields);
            }
            Action::Delete { remote_id, .. } => {
                obj.insert("id".into(), json!(remote_id));
            }
            Action::Restore {
                remote_id,
                geometry,
                fields,
                ..
            } => {
                obj.insert("id".into(), json!(remote_id));
                plain_body(&mut obj, geometry, fields);
            }
            Action::DescribePut {
                remote_id, text, ..
            } => {
                obj.insert("id".into(), json!(remote_id));
                obj.insert("description".into(), json!(text));
            }
            other => {
                return Err(SyncError::Synchronization(format!(
                    "{} actions cannot cross the wire in plain mode",
                    other.kind()
                )))
            }
        }
        out.push(Value::Object(obj));
    }
    Ok(Value::Array(out))
}

fn plain_body(obj: &mut Map<String, Value>, geometry: &Option<Geometry>, fields: &[FieldUpdate]) {
    if !fields.is_empty() {
        let mut map = Map::new();
        for f in fields {
            map.insert(f.field_id.to_string(), f.value.to_json());
        }
        obj.insert("fields".into(), Value::Object(map));
    }
    if let Some(g) = geometry {
        obj.insert("geom".into(), json!(g.to_wkt()));
    }
}

/// Decode an incoming plain-mode payload.
///
/// Plain-mode servers send whole-feature "extension" objects keyed by remote
/// feature id, carrying a description and attachment list. Only descriptions
/// decode into actions (`DescribePut`); attachment entries are counted and
/// dropped.
pub fn decode_plain(payload: &Value) -> Result<Vec<Action>> {
    let map = payload.as_object().ok_or_else(|| {
        SyncError::Synchronization("plain payload is not an object keyed by feature".into())
    })?;

    let mut actions = Vec::new();
    let mut dropped_attachments = 0usize;
    for (key, ext) in map {
        let remote_id: i64 = key.parse().map_err(|_| {
            SyncError::Synchronization(format!("plain payload key '{}' is not a feature id", key))
        })?;
        let ext = ext.as_object().ok_or_else(|| {
            SyncError::Synchronization(format!("extension object for feature {} malformed", key))
        })?;
        if let Some(desc) = ext.get("description") {
            actions.push(Action::DescribePut {
                remote_id,
                version: None,
                text: desc.as_str().map(str::to_string),
            });
        }
        if let Some(atts) = ext.get("attachments").and_then(Value::as_array) {
            dropped_attachments += atts.len();
        }
    }
    if dropped_attachments > 0 {
        debug!(
            count = dropped_attachments,
            "Dropped attachment entries from plain payload (attachment sync not supported)"
        );
    }
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FieldDef;

    fn schema() -> FieldSchema {
        FieldSchema::new(vec![
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
        ])
    }

    fn sample_update() -> Action {
        Action::Update {
            remote_id: 42,
            version: Some(3),
            geometry: Some(Geometry::Point(1.0, 2.0)),
            fields: vec![
                FieldUpdate::new(100, FieldValue::Text("it's \"quoted\"".into())),
                FieldUpdate::new(
                    101,
                    FieldValue::DateTime {
                        year: 2026,
                        month: 8,
                        day: 27,
                        hour: 1,
                        minute: 2,
                        second: 3,
                    },
                ),
            ],
        }
    }

    #[test]
    fn test_versioned_roundtrip_update() {
        let action = sample_update();
        let wire = encode_versioned(std::slice::from_ref(&action), 10).unwrap();
        let back = decode_versioned(&wire, &schema()).unwrap();
        assert_eq!(back, vec![action]);
    }

    #[test]
    fn test_versioned_roundtrip_all_data_kinds() {
        let actions = vec![
            Action::Update {
                remote_id: 1,
                version: None,
                geometry: None,
                fields: vec![FieldUpdate::new(101, FieldValue::Null)],
            },
            Action::Delete {
                remote_id: 2,
                version: Some(9),
            },
            Action::Restore {
                remote_id: 3,
                version: 4,
                geometry: Some(Geometry::LineString(vec![(0.0, 0.0), (1.0, 1.0)])),
                fields: vec![],
            },
            Action::DescribePut {
                remote_id: 5,
                version: None,
                text: Some("a note".into()),
            },
        ];
        let wire = encode_versioned(&actions, 1).unwrap();
        assert_eq!(decode_versioned(&wire, &schema()).unwrap(), actions);
    }

    #[test]
    fn test_versioned_sequence_numbers_continue_from_start() {
        let actions = vec![
            Action::Delete {
                remote_id: 1,
                version: None,
            },
            Action::Delete {
                remote_id: 2,
                version: None,
            },
        ];
        let wire = encode_versioned(&actions, 7).unwrap();
        let seqs: Vec<i64> = wire
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, vec![7, 8]);
    }

    #[test]
    fn test_versioned_create_omits_local_only_fields() {
        let action = Action::Create {
            local_id: 99,
            version: Some(5),
            geometry: None,
            fields: vec![FieldUpdate::new(100, FieldValue::Text("x".into()))],
        };
        let wire = encode_versioned(&[action], 1).unwrap();
        let obj = &wire[0]["action"];
        assert!(obj.get("id").is_none());
        assert!(obj.get("version").is_none());
        assert!(obj.get("fields").is_some());
    }

    #[test]
    fn test_versioned_rejects_non_data_actions() {
        for action in [
            Action::Continue {
                cursor_url: "/next".into(),
            },
            Action::AttachmentCreate {
                remote_id: 1,
                payload: json!({}),
            },
        ] {
            let err = encode_versioned(&[action], 1).unwrap_err();
            assert!(matches!(err, SyncError::Synchronization(_)));
        }
    }

    #[test]
    fn test_versioned_geometry_is_base64_wkb() {
        let g = Geometry::Point(1.0, 2.0);
        let action = Action::Update {
            remote_id: 1,
            version: None,
            geometry: Some(g.clone()),
            fields: vec![],
        };
        let wire = encode_versioned(&[action], 1).unwrap();
        let geom = wire[0]["action"]["geom"].as_str().unwrap();
        assert_eq!(geom, g.to_wkb_base64());
    }

    #[test]
    fn test_decode_versioned_continuation() {
        let payload = json!([
            {"action": "delete", "id": 1},
            {"continue": "/api/delta?page=2"},
        ]);
        let actions = decode_versioned(&payload, &schema()).unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(
            actions[1],
            Action::Continue {
                cursor_url: "/api/delta?page=2".into()
            }
        );
    }

    #[test]
    fn test_decode_unknown_field_id_fails() {
        let payload = json!([
            {"action": "update", "id": 1, "fields": [{"id": 999, "val": 1}]}
        ]);
        let err = decode_versioned(&payload, &schema()).unwrap_err();
        assert!(err.to_string().contains("999"));
    }

    #[test]
    fn test_decode_unknown_action_kind_fails() {
        let payload = json!([{"action": "explode", "id": 1}]);
        assert!(decode_versioned(&payload, &schema()).is_err());
    }

    #[test]
    fn test_decode_restore_requires_version() {
        let payload = json!([{"action": "restore", "id": 1}]);
        assert!(decode_versioned(&payload, &schema()).is_err());
    }

    #[test]
    fn test_plain_encode_shapes() {
        let actions = vec![
            Action::Create {
                local_id: 5,
                version: None,
                geometry: Some(Geometry::Point(1.0, 2.0)),
                fields: vec![FieldUpdate::new(100, FieldValue::Text("a".into()))],
            },
            Action::Update {
                remote_id: 8,
                version: None,
                geometry: None,
                fields: vec![],
            },
        ];
        let wire = encode_plain(&actions).unwrap();
        let create = &wire[0];
        assert!(create.get("id").is_none()); // keyed by remote id, absent for Create
        assert_eq!(create["geom"], json!("POINT (1 2)")); // WKT, not WKB
        assert_eq!(create["fields"]["100"], json!("a"));

        let update = &wire[1];
        assert_eq!(update["id"], json!(8));
        assert!(update.get("fields").is_none()); // only if non-empty
        assert!(update.get("geom").is_none()); // only if changed
    }

    #[test]
    fn test_plain_decode_yields_describe_put_only() {
        let payload = json!({
            "42": {"description": "hello", "attachments": [{"name": "a.jpg"}]},
            "43": {"description": null},
            "44": {"attachments": []},
        });
        let mut actions = decode_plain(&payload).unwrap();
        actions.sort_by_key(|a| a.remote_id());
        assert_eq!(
            actions,
            vec![
                Action::DescribePut {
                    remote_id: 42,
                    version: None,
                    text: Some("hello".into())
                },
                Action::DescribePut {
                    remote_id: 43,
                    version: None,
                    text: None
                },
            ]
        );
    }

    #[test]
    fn test_plain_decode_rejects_non_numeric_keys() {
        let payload = json!({"abc": {"description": "x"}});
        assert!(decode_plain(&payload).is_err());
    }

    #[test]
    fn test_plain_decode_rejects_array_payload() {
        assert!(decode_plain(&json!([])).is_err());
    }
}
