// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The change log: edit-time logging with collapse rules.
//!
//! Five append-only sets keyed by local id record what must eventually reach
//! the server: *added*, *removed*, *restored*, *updated-attributes*
//! (fid × attribute index), *updated-geometry* (fid).
//!
//! # Collapse rules
//!
//! Edits to a row the server has never seen fold into its pending creation:
//!
//! - attribute/geometry edit on a fid in `log_added`: row updated, no log
//!   entry (the Create will carry the final state anyway);
//! - delete of a fid in `log_added`: every log entry for that fid is purged
//!   and nothing enters `log_removed`; from the server's point of view the
//!   row never existed;
//! - restore of a fid in `log_removed`: moves to `log_restored`;
//! - delete of a fid in `log_restored`: moves back to `log_removed`.
//!
//! Invariant: a fid in `log_added` is never simultaneously referenced by
//! `log_attrs`, `log_geom`, or `log_removed`.
//!
//! Each edit runs as one transaction (row write + log writes together), so a
//! crash mid-edit cannot leave the log and the rows disagreeing.

use super::{FeatureMapping, ReplicaStore};
use crate::error::{Result, SyncError};
use crate::geometry::Geometry;
use crate::value::FieldValue;
use sqlx::SqliteConnection;
use std::collections::BTreeMap;
use tracing::debug;

impl ReplicaStore {
    /// Insert a new locally-created row: feature + identity mapping (remote
    /// id absent) + `log_added` entry, one transaction.
    pub async fn edit_insert(
        &self,
        geometry: Option<Geometry>,
        attrs: Vec<FieldValue>,
    ) -> Result<i64> {
        self.ensure_editable().await?;
        let mut tx = self.pool().begin().await?;
        let fid = super::insert_feature_row(&mut tx, geometry.as_ref(), &attrs).await?;
        super::insert_mapping(
            &mut tx,
            &FeatureMapping {
                fid,
                remote_id: None,
                remote_version: None,
                description: None,
            },
        )
        .await?;
        sqlx::query("INSERT INTO log_added (fid) VALUES (?)")
            .bind(fid)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!(fid, "Logged row creation");
        Ok(fid)
    }

    /// Change one attribute cell. Rows still pending creation get the row
    /// update but no log entry.
    pub async fn edit_update_attr(
        &self,
        fid: i64,
        attr_index: i64,
        value: FieldValue,
    ) -> Result<()> {
        self.ensure_editable().await?;
        let mut tx = self.pool().begin().await?;
        super::update_feature_row(&mut tx, fid, None, &[(attr_index, value)]).await?;
        if !in_log(&mut tx, "log_added", fid).await? {
            sqlx::query("INSERT OR IGNORE INTO log_attrs (fid, attr_index) VALUES (?, ?)")
                .bind(fid)
                .bind(attr_index)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Change the geometry. Same collapse rule as attribute edits.
    pub async fn edit_update_geom(&self, fid: i64, geometry: Geometry) -> Result<()> {
        self.ensure_editable().await?;
        let mut tx = self.pool().begin().await?;
        super::update_feature_row(&mut tx, fid, Some(&geometry), &[]).await?;
        if !in_log(&mut tx, "log_added", fid).await? {
            sqlx::query("INSERT OR IGNORE INTO log_geom (fid) VALUES (?)")
                .bind(fid)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Delete a row. An unsynced row vanishes without trace (mapping and all
    /// log entries purged); a synced row's pending cell edits are purged too,
    /// since the delete supersedes them, and the fid enters `log_removed`.
    pub async fn edit_delete(&self, fid: i64) -> Result<()> {
        self.ensure_editable().await?;
        let mut tx = self.pool().begin().await?;
        super::delete_feature_row(&mut tx, fid).await?;

        if in_log(&mut tx, "log_added", fid).await? {
            purge_log_entries(&mut tx, fid).await?;
            super::delete_mapping(&mut tx, fid).await?;
            tx.commit().await?;
            debug!(fid, "Deleted unsynced row; creation cancelled");
            return Ok(());
        }

        sqlx::query("DELETE FROM log_attrs WHERE fid = ?")
            .bind(fid)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM log_geom WHERE fid = ?")
            .bind(fid)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM log_restored WHERE fid = ?")
            .bind(fid)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT OR IGNORE INTO log_removed (fid) VALUES (?)")
            .bind(fid)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!(fid, "Logged row deletion");
        Ok(())
    }

    /// Undo a deletion: re-insert the row content and move the fid from
    /// `log_removed` to `log_restored`.
    pub async fn edit_restore(
        &self,
        fid: i64,
        geometry: Option<Geometry>,
        attrs: Vec<FieldValue>,
    ) -> Result<()> {
        self.ensure_editable().await?;
        let mut tx = self.pool().begin().await?;
        if !in_log(&mut tx, "log_removed", fid).await? {
            return Err(SyncError::Internal(format!(
                "restore of fid {} which has no pending deletion",
                fid
            )));
        }
        sqlx::query("INSERT INTO features (fid, geom, attrs) VALUES (?, ?, ?)")
            .bind(fid)
            .bind(geometry.as_ref().map(Geometry::to_wkb))
            .bind(
                serde_json::Value::Array(attrs.iter().map(FieldValue::to_json).collect())
                    .to_string(),
            )
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM log_removed WHERE fid = ?")
            .bind(fid)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT OR IGNORE INTO log_restored (fid) VALUES (?)")
            .bind(fid)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!(fid, "Logged row restoration");
        Ok(())
    }

    // ── change-log queries (extraction read path) ───────────────────────

    pub async fn added_fids(&self) -> Result<Vec<i64>> {
        self.log_fids("log_added").await
    }

    pub async fn removed_fids(&self) -> Result<Vec<i64>> {
        self.log_fids("log_removed").await
    }

    pub async fn restored_fids(&self) -> Result<Vec<i64>> {
        self.log_fids("log_restored").await
    }

    pub async fn geom_updated_fids(&self) -> Result<Vec<i64>> {
        self.log_fids("log_geom").await
    }

    /// Changed attribute indexes grouped by fid, ordered.
    pub async fn attr_updates(&self) -> Result<BTreeMap<i64, Vec<i64>>> {
        let rows: Vec<(i64, i64)> =
            sqlx::query_as("SELECT fid, attr_index FROM log_attrs ORDER BY fid, attr_index")
                .fetch_all(self.pool())
                .await?;
        let mut map: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
        for (fid, attr_index) in rows {
            map.entry(fid).or_default().push(attr_index);
        }
        Ok(map)
    }

    /// The derived "has pending local changes" flag.
    pub async fn has_pending_changes(&self) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT (SELECT COUNT(*) FROM log_added)
                 + (SELECT COUNT(*) FROM log_removed)
                 + (SELECT COUNT(*) FROM log_restored)
                 + (SELECT COUNT(*) FROM log_attrs)
                 + (SELECT COUNT(*) FROM log_geom)
            "#,
        )
        .fetch_one(self.pool())
        .await?;
        Ok(count > 0)
    }

    async fn log_fids(&self, table: &str) -> Result<Vec<i64>> {
        // Table names come from the fixed set above, never from input.
        let rows: Vec<(i64,)> =
            sqlx::query_as(&format!("SELECT fid FROM {} ORDER BY fid", table))
                .fetch_all(self.pool())
                .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn ensure_editable(&self) -> Result<()> {
        let meta = self.meta().await?;
        if meta.read_only {
            return Err(SyncError::InvalidState {
                expected: "editable".to_string(),
                actual: "read-only (sync in progress)".to_string(),
            });
        }
        Ok(())
    }
}

async fn in_log(conn: &mut SqliteConnection, table: &str, fid: i64) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(&format!("SELECT fid FROM {} WHERE fid = ?", table))
        .bind(fid)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.is_some())
}

/// Remove every change-log entry for one fid, all five tables.
pub(crate) async fn purge_log_entries(conn: &mut SqliteConnection, fid: i64) -> Result<()> {
    for table in [
        "log_added",
        "log_removed",
        "log_restored",
        "log_attrs",
        "log_geom",
    ] {
        sqlx::query(&format!("DELETE FROM {} WHERE fid = ?", table))
            .bind(fid)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

// ── reconciliation helpers (run inside the transaction applier's tx) ──────

pub(crate) async fn clear_added(conn: &mut SqliteConnection, fid: i64) -> Result<()> {
    sqlx::query("DELETE FROM log_added WHERE fid = ?")
        .bind(fid)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn clear_removed(conn: &mut SqliteConnection, fid: i64) -> Result<()> {
    sqlx::query("DELETE FROM log_removed WHERE fid = ?")
        .bind(fid)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn clear_restored(conn: &mut SqliteConnection, fid: i64) -> Result<()> {
    sqlx::query("DELETE FROM log_restored WHERE fid = ?")
        .bind(fid)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn clear_updates(conn: &mut SqliteConnection, fid: i64) -> Result<()> {
    sqlx::query("DELETE FROM log_attrs WHERE fid = ?")
        .bind(fid)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM log_geom WHERE fid = ?")
        .bind(fid)
        .execute(&mut *conn)
        .await?;
    Ok(())
}
