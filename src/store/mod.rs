// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The replica store: one SQLite file per detached dataset.
//!
//! Holds the dataset's current rows, the change-log tables, and the
//! feature/metadata mappings (see [`schema`] for the layout). All mutations
//! belonging to one phase run inside a single explicit transaction: a crash
//! or abort mid-phase leaves the store in the prior consistent state, never a
//! partially-applied one. sqlx transactions roll back on drop, so every early
//! return is covered.
//!
//! Two write surfaces exist on purpose:
//! - the **edit API** ([`changelog`]) used by the host application's row
//!   edits, which writes rows *and* change-log entries together;
//! - the **sync API** (raw row/mapping helpers used by the applier and
//!   reconciler), which never touches the change log for remote-originated
//!   writes.

pub(crate) mod changelog;
mod schema;

pub use schema::{FieldDef, FieldSchema, ReplicaMeta, CONTAINER_VERSION};

use crate::error::{Result, SyncError};
use crate::geometry::Geometry;
use crate::value::FieldValue;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::SqliteConnection;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// One dataset row.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub fid: i64,
    pub geometry: Option<Geometry>,
    /// Positionally keyed by attribute index.
    pub attrs: Vec<FieldValue>,
}

/// Feature identity mapping row. Exactly one per fid; `remote_id` is null
/// only for rows created locally and not yet acknowledged by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMapping {
    pub fid: i64,
    pub remote_id: Option<i64>,
    pub remote_version: Option<i64>,
    pub description: Option<String>,
}

/// Handle to one replica store file.
#[derive(Debug)]
pub struct ReplicaStore {
    pool: SqlitePool,
    path: String,
}

impl ReplicaStore {
    /// Create a new replica store at `path` with the given metadata and
    /// field schema. Fails if the metadata violates the epoch/version
    /// pairing invariant.
    pub async fn create(
        path: impl AsRef<Path>,
        meta: ReplicaMeta,
        fields: Vec<FieldDef>,
    ) -> Result<Self> {
        meta.validate()?;
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, resource_id = meta.resource_id, "Creating replica store");

        let pool = connect(&path_str, true).await?;
        for ddl in schema::SCHEMA_DDL {
            sqlx::query(ddl).execute(&pool).await?;
        }

        let mut tx = pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO replica_meta (
                id, container_version, connection_id, instance_id, resource_id,
                display_name, table_name, description, geometry_type,
                transaction_id, epoch, version, last_seq, last_sync_at,
                last_error_code, auto_sync, read_only
            ) VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(schema::CONTAINER_VERSION)
        .bind(&meta.connection_id)
        .bind(&meta.instance_id)
        .bind(meta.resource_id)
        .bind(&meta.display_name)
        .bind(&meta.table_name)
        .bind(&meta.description)
        .bind(&meta.geometry_type)
        .bind(&meta.transaction_id)
        .bind(meta.epoch)
        .bind(meta.version)
        .bind(meta.last_seq)
        .bind(meta.last_sync_at)
        .bind(meta.last_error_code)
        .bind(meta.auto_sync)
        .bind(meta.read_only)
        .execute(&mut *tx)
        .await?;

        for f in &fields {
            sqlx::query(
                r#"
                INSERT INTO fields (attr_index, remote_field_id, datatype,
                                    keyname, display_name, is_label, lookup_table_id)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(f.attr_index)
            .bind(f.remote_field_id)
            .bind(&f.datatype)
            .bind(&f.keyname)
            .bind(&f.display_name)
            .bind(f.is_label)
            .bind(f.lookup_table_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(Self {
            pool,
            path: path_str,
        })
    }

    /// Open an existing replica store. Fails with a container error if the
    /// file is missing or the metadata record is absent or unreadable.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        if !path.as_ref().exists() {
            return Err(SyncError::container(format!(
                "replica store not found: {}",
                path_str
            )));
        }
        let pool = connect(&path_str, false).await?;
        let store = Self {
            pool,
            path: path_str,
        };
        // Verify the metadata record exists and is consistent.
        let meta = store.meta().await?;
        meta.validate()?;
        if meta.container_version > schema::CONTAINER_VERSION {
            return Err(SyncError::container(format!(
                "replica container version {} is newer than supported {}",
                meta.container_version,
                schema::CONTAINER_VERSION
            )));
        }
        debug!(path = %store.path, resource_id = meta.resource_id, "Opened replica store");
        Ok(store)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ── metadata ────────────────────────────────────────────────────────

    /// Load the replica metadata record.
    pub async fn meta(&self) -> Result<ReplicaMeta> {
        let row: Option<(
            i64,
            String,
            String,
            i64,
            String,
            String,
            Option<String>,
            String,
            Option<String>,
            Option<i64>,
            Option<i64>,
            i64,
            Option<i64>,
            i64,
            bool,
            bool,
        )> = sqlx::query_as(
            r#"
            SELECT container_version, connection_id, instance_id, resource_id,
                   display_name, table_name, description, geometry_type,
                   transaction_id, epoch, version, last_seq, last_sync_at,
                   last_error_code, auto_sync, read_only
            FROM replica_meta WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| SyncError::container("replica metadata record missing"))?;
        Ok(ReplicaMeta {
            container_version: row.0,
            connection_id: row.1,
            instance_id: row.2,
            resource_id: row.3,
            display_name: row.4,
            table_name: row.5,
            description: row.6,
            geometry_type: row.7,
            transaction_id: row.8,
            epoch: row.9,
            version: row.10,
            last_seq: row.11,
            last_sync_at: row.12,
            last_error_code: row.13,
            auto_sync: row.14,
            read_only: row.15,
        })
    }

    /// Load the field schema, resolved into two-way index maps.
    pub async fn field_schema(&self) -> Result<FieldSchema> {
        let rows: Vec<(i64, i64, String, String, String, bool, Option<i64>)> = sqlx::query_as(
            r#"
            SELECT attr_index, remote_field_id, datatype, keyname,
                   display_name, is_label, lookup_table_id
            FROM fields ORDER BY attr_index
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(FieldSchema::new(
            rows.into_iter()
                .map(|r| FieldDef {
                    attr_index: r.0,
                    remote_field_id: r.1,
                    datatype: r.2,
                    keyname: r.3,
                    display_name: r.4,
                    is_label: r.5,
                    lookup_table_id: r.6,
                })
                .collect(),
        ))
    }

    /// Set or clear the versioning epoch/version pair. Both or neither.
    pub async fn set_epoch_version(&self, epoch: Option<i64>, version: Option<i64>) -> Result<()> {
        if epoch.is_some() != version.is_some() {
            return Err(SyncError::container(
                "epoch and version must be both present or both absent",
            ));
        }
        sqlx::query("UPDATE replica_meta SET epoch = ?, version = ? WHERE id = 1")
            .bind(epoch)
            .bind(version)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Bump the resource version after a successfully applied delta.
    pub async fn set_resource_version(&self, version: i64) -> Result<()> {
        sqlx::query("UPDATE replica_meta SET version = ? WHERE id = 1")
            .bind(version)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record the last upload sequence number the server acknowledged.
    pub async fn set_last_seq(&self, seq: i64) -> Result<()> {
        sqlx::query("UPDATE replica_meta SET last_seq = ? WHERE id = 1")
            .bind(seq)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a successful sync: timestamp set, error code cleared.
    pub async fn set_last_sync(&self, at_millis: i64) -> Result<()> {
        sqlx::query("UPDATE replica_meta SET last_sync_at = ?, last_error_code = 0 WHERE id = 1")
            .bind(at_millis)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist the last error classification code.
    pub async fn set_last_error_code(&self, code: i64) -> Result<()> {
        sqlx::query("UPDATE replica_meta SET last_error_code = ? WHERE id = 1")
            .bind(code)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Toggle the rows-read-only flag. Set for the duration of a sync job;
    /// released on every exit path, regardless of outcome.
    pub async fn set_read_only(&self, read_only: bool) -> Result<()> {
        sqlx::query("UPDATE replica_meta SET read_only = ? WHERE id = 1")
            .bind(read_only)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Refresh a field's display alias and lookup-table binding from
    /// auxiliary server metadata. Unknown field ids are ignored.
    pub async fn update_field_alias(
        &self,
        remote_field_id: i64,
        display_name: &str,
        lookup_table_id: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE fields SET display_name = ?, lookup_table_id = ? WHERE remote_field_id = ?",
        )
        .bind(display_name)
        .bind(lookup_table_id)
        .bind(remote_field_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── rows ────────────────────────────────────────────────────────────

    /// Fetch one feature row.
    pub async fn feature(&self, fid: i64) -> Result<Option<Feature>> {
        let row: Option<(i64, Option<Vec<u8>>, String)> =
            sqlx::query_as("SELECT fid, geom, attrs FROM features WHERE fid = ?")
                .bind(fid)
                .fetch_optional(&self.pool)
                .await?;
        row.map(decode_feature).transpose()
    }

    /// Number of feature rows.
    pub async fn feature_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM features")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ── feature identity mapping ────────────────────────────────────────

    /// Mapping for a local id.
    pub async fn mapping_for_fid(&self, fid: i64) -> Result<Option<FeatureMapping>> {
        let row: Option<(i64, Option<i64>, Option<i64>, Option<String>)> = sqlx::query_as(
            "SELECT fid, remote_id, remote_version, description FROM feature_map WHERE fid = ?",
        )
        .bind(fid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| FeatureMapping {
            fid: r.0,
            remote_id: r.1,
            remote_version: r.2,
            description: r.3,
        }))
    }

    /// Resolve a remote id to its local id.
    pub async fn fid_for_remote(&self, remote_id: i64) -> Result<Option<i64>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT fid FROM feature_map WHERE remote_id = ?")
                .bind(remote_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| r.0))
    }
}

/// Open a SQLite pool with the store's standard options.
async fn connect(path: &str, create: bool) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path))
        .map_err(|e| SyncError::Config(format!("invalid replica store path: {}", e)))?
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .create_if_missing(create)
        .foreign_keys(true);

    Ok(SqlitePoolOptions::new()
        .max_connections(2) // one sync job + interactive edits
        .connect_with(options)
        .await?)
}

fn decode_feature(row: (i64, Option<Vec<u8>>, String)) -> Result<Feature> {
    let geometry = row.1.as_deref().map(Geometry::from_wkb).transpose()?;
    let raw: Vec<serde_json::Value> = serde_json::from_str(&row.2)
        .map_err(|e| SyncError::container(format!("corrupt attribute array: {}", e)))?;
    let attrs = raw
        .iter()
        .map(FieldValue::from_json)
        .collect::<Result<Vec<_>>>()?;
    Ok(Feature {
        fid: row.0,
        geometry,
        attrs,
    })
}

fn encode_attrs(attrs: &[FieldValue]) -> String {
    serde_json::Value::Array(attrs.iter().map(FieldValue::to_json).collect()).to_string()
}

// ── connection-level helpers shared by the edit API, applier, and
//    reconciler. These run inside the caller's transaction. ───────────────

pub(crate) async fn insert_feature_row(
    conn: &mut SqliteConnection,
    geometry: Option<&Geometry>,
    attrs: &[FieldValue],
) -> Result<i64> {
    let result = sqlx::query("INSERT INTO features (geom, attrs) VALUES (?, ?)")
        .bind(geometry.map(Geometry::to_wkb))
        .bind(encode_attrs(attrs))
        .execute(&mut *conn)
        .await?;
    Ok(result.last_insert_rowid())
}

pub(crate) async fn update_feature_row(
    conn: &mut SqliteConnection,
    fid: i64,
    geometry: Option<&Geometry>,
    attr_updates: &[(i64, FieldValue)],
) -> Result<()> {
    if let Some(geom) = geometry {
        sqlx::query("UPDATE features SET geom = ? WHERE fid = ?")
            .bind(geom.to_wkb())
            .bind(fid)
            .execute(&mut *conn)
            .await?;
    }
    if !attr_updates.is_empty() {
        let row: Option<(String,)> = sqlx::query_as("SELECT attrs FROM features WHERE fid = ?")
            .bind(fid)
            .fetch_optional(&mut *conn)
            .await?;
        let (attrs_json,) =
            row.ok_or_else(|| SyncError::container(format!("feature {} missing", fid)))?;
        let mut raw: Vec<serde_json::Value> = serde_json::from_str(&attrs_json)
            .map_err(|e| SyncError::container(format!("corrupt attribute array: {}", e)))?;
        for (attr_index, value) in attr_updates {
            let idx = *attr_index as usize;
            if idx >= raw.len() {
                raw.resize(idx + 1, serde_json::Value::Null);
            }
            raw[idx] = value.to_json();
        }
        sqlx::query("UPDATE features SET attrs = ? WHERE fid = ?")
            .bind(serde_json::Value::Array(raw).to_string())
            .bind(fid)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

pub(crate) async fn delete_feature_row(conn: &mut SqliteConnection, fid: i64) -> Result<()> {
    sqlx::query("DELETE FROM features WHERE fid = ?")
        .bind(fid)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn insert_mapping(
    conn: &mut SqliteConnection,
    mapping: &FeatureMapping,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO feature_map (fid, remote_id, remote_version, description) VALUES (?, ?, ?, ?)",
    )
    .bind(mapping.fid)
    .bind(mapping.remote_id)
    .bind(mapping.remote_version)
    .bind(&mapping.description)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn delete_mapping(conn: &mut SqliteConnection, fid: i64) -> Result<()> {
    sqlx::query("DELETE FROM feature_map WHERE fid = ?")
        .bind(fid)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn fid_for_remote_tx(
    conn: &mut SqliteConnection,
    remote_id: i64,
) -> Result<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT fid FROM feature_map WHERE remote_id = ?")
        .bind(remote_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(|r| r.0))
}

pub(crate) async fn set_remote_identity(
    conn: &mut SqliteConnection,
    fid: i64,
    remote_id: i64,
    remote_version: Option<i64>,
) -> Result<()> {
    sqlx::query("UPDATE feature_map SET remote_id = ?, remote_version = ? WHERE fid = ?")
        .bind(remote_id)
        .bind(remote_version)
        .bind(fid)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn set_mapping_description(
    conn: &mut SqliteConnection,
    fid: i64,
    description: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE feature_map SET description = ? WHERE fid = ?")
        .bind(description)
        .bind(fid)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn bump_remote_version(
    conn: &mut SqliteConnection,
    fid: i64,
    remote_version: Option<i64>,
) -> Result<()> {
    sqlx::query("UPDATE feature_map SET remote_version = ? WHERE fid = ?")
        .bind(remote_version)
        .bind(fid)
        .execute(&mut *conn)
        .await?;
    Ok(())
}
