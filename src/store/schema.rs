// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persisted replica layout.
//!
//! One replica store is one SQLite file holding:
//! - `replica_meta`: a single metadata record (connection, resource,
//!   versioning epoch/version pair, last sync, last error).
//! - `fields`: the field schema, attribute index ↔ remote field id ↔
//!   key name ↔ display name ↔ optional lookup-table id.
//! - `features`: the dataset rows (WKB geometry blob + JSON attribute array
//!   positionally keyed by attribute index).
//! - `feature_map`: local id ↔ remote id ↔ remote version ↔ description.
//! - Five change-log tables (`log_added`, `log_removed`, `log_restored`,
//!   `log_attrs`, `log_geom`).
//! - Attachment log tables, reserved for future use.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Bump when the persisted layout changes shape.
pub const CONTAINER_VERSION: i64 = 2;

/// Statements run on store creation. Idempotent.
pub(super) const SCHEMA_DDL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS replica_meta (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        container_version INTEGER NOT NULL,
        connection_id TEXT NOT NULL,
        instance_id TEXT NOT NULL,
        resource_id INTEGER NOT NULL,
        display_name TEXT NOT NULL,
        table_name TEXT NOT NULL,
        description TEXT,
        geometry_type TEXT NOT NULL,
        transaction_id TEXT,
        epoch INTEGER,
        version INTEGER,
        last_seq INTEGER NOT NULL DEFAULT 0,
        last_sync_at INTEGER,
        last_error_code INTEGER NOT NULL DEFAULT 0,
        auto_sync INTEGER NOT NULL DEFAULT 1,
        read_only INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS fields (
        attr_index INTEGER PRIMARY KEY,
        remote_field_id INTEGER NOT NULL UNIQUE,
        datatype TEXT NOT NULL,
        keyname TEXT NOT NULL,
        display_name TEXT NOT NULL,
        is_label INTEGER NOT NULL DEFAULT 0,
        lookup_table_id INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS features (
        fid INTEGER PRIMARY KEY AUTOINCREMENT,
        geom BLOB,
        attrs TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS feature_map (
        fid INTEGER PRIMARY KEY,
        remote_id INTEGER UNIQUE,
        remote_version INTEGER,
        description TEXT
    )
    "#,
    "CREATE TABLE IF NOT EXISTS log_added (fid INTEGER PRIMARY KEY)",
    "CREATE TABLE IF NOT EXISTS log_removed (fid INTEGER PRIMARY KEY)",
    "CREATE TABLE IF NOT EXISTS log_restored (fid INTEGER PRIMARY KEY)",
    r#"
    CREATE TABLE IF NOT EXISTS log_attrs (
        fid INTEGER NOT NULL,
        attr_index INTEGER NOT NULL,
        PRIMARY KEY (fid, attr_index)
    )
    "#,
    "CREATE TABLE IF NOT EXISTS log_geom (fid INTEGER PRIMARY KEY)",
    // Reserved for attachment sync; the engine creates but never writes these.
    "CREATE TABLE IF NOT EXISTS log_att_added (fid INTEGER PRIMARY KEY)",
    "CREATE TABLE IF NOT EXISTS log_att_removed (fid INTEGER PRIMARY KEY)",
    "CREATE TABLE IF NOT EXISTS log_att_updated (fid INTEGER PRIMARY KEY)",
];

/// The replica metadata record.
///
/// Invariant: `epoch` and `version` are both present or both absent. That
/// pair alone determines whether the versioned or plain protocol is used.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaMeta {
    pub container_version: i64,
    pub connection_id: String,
    pub instance_id: String,
    pub resource_id: i64,
    pub display_name: String,
    pub table_name: String,
    pub description: Option<String>,
    pub geometry_type: String,
    pub transaction_id: Option<String>,
    pub epoch: Option<i64>,
    pub version: Option<i64>,
    /// Last upload sequence number acknowledged by the server.
    pub last_seq: i64,
    /// Unix millis of the last successful sync.
    pub last_sync_at: Option<i64>,
    pub last_error_code: i64,
    pub auto_sync: bool,
    pub read_only: bool,
}

impl ReplicaMeta {
    /// A versioned resource carries an epoch/version pair; a plain one
    /// carries neither.
    pub fn is_versioned(&self) -> bool {
        self.epoch.is_some() && self.version.is_some()
    }

    /// Enforce the epoch/version pairing invariant.
    pub fn validate(&self) -> Result<()> {
        if self.epoch.is_some() != self.version.is_some() {
            return Err(SyncError::container(
                "epoch and version must be both present or both absent",
            ));
        }
        Ok(())
    }
}

/// One field schema entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Position of this field in the attribute array.
    pub attr_index: i64,
    /// Server-side field identifier; the wire formats speak this id.
    pub remote_field_id: i64,
    pub datatype: String,
    pub keyname: String,
    pub display_name: String,
    pub is_label: bool,
    pub lookup_table_id: Option<i64>,
}

/// The field schema resolved into two-way index maps.
///
/// Resolved once per batch; never re-queried per field access.
#[derive(Debug, Clone, Default)]
pub struct FieldSchema {
    defs: Vec<FieldDef>,
    by_index: HashMap<i64, usize>,
    by_field_id: HashMap<i64, usize>,
}

impl FieldSchema {
    pub fn new(mut defs: Vec<FieldDef>) -> Self {
        defs.sort_by_key(|d| d.attr_index);
        let mut by_index = HashMap::with_capacity(defs.len());
        let mut by_field_id = HashMap::with_capacity(defs.len());
        for (i, def) in defs.iter().enumerate() {
            by_index.insert(def.attr_index, i);
            by_field_id.insert(def.remote_field_id, i);
        }
        Self {
            defs,
            by_index,
            by_field_id,
        }
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn defs(&self) -> &[FieldDef] {
        &self.defs
    }

    pub fn by_index(&self, attr_index: i64) -> Option<&FieldDef> {
        self.by_index.get(&attr_index).map(|&i| &self.defs[i])
    }

    pub fn by_field_id(&self, remote_field_id: i64) -> Option<&FieldDef> {
        self.by_field_id.get(&remote_field_id).map(|&i| &self.defs[i])
    }

    /// Remote field id for an attribute index, or a synchronization error.
    pub fn field_id_for_index(&self, attr_index: i64) -> Result<i64> {
        self.by_index(attr_index)
            .map(|d| d.remote_field_id)
            .ok_or_else(|| {
                SyncError::Synchronization(format!("unknown attribute index {}", attr_index))
            })
    }

    /// Attribute index for a remote field id, or a synchronization error.
    /// Unknown remote field ids fail decoding.
    pub fn index_for_field_id(&self, remote_field_id: i64) -> Result<i64> {
        self.by_field_id(remote_field_id)
            .map(|d| d.attr_index)
            .ok_or_else(|| {
                SyncError::Synchronization(format!(
                    "unknown remote field id {}",
                    remote_field_id
                ))
            })
    }
}
