// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dataset file creation.
//!
//! The stub-fill phase needs an empty local dataset before the first
//! snapshot lands in it. [`DatasetWriter`] is the seam for that; the bundled
//! [`SqliteDatasetWriter`] produces a plain SQLite file with one typed column
//! per schema field. The primary-id column name is auto-disambiguated
//! against the user schema so a user field called `id` never collides.

use crate::error::{Result, SyncError};
use crate::store::FieldSchema;
use async_trait::async_trait;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

/// Outcome of a successful dataset creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedDataset {
    pub path: PathBuf,
    /// The primary-id column name actually used.
    pub pk_column: String,
}

/// Creates an empty local dataset file for a given schema.
#[async_trait]
pub trait DatasetWriter: Send + Sync + 'static {
    async fn create_dataset(
        &self,
        path: &Path,
        schema: &FieldSchema,
        geometry_type: &str,
        srid: i32,
    ) -> Result<CreatedDataset>;
}

/// Pick a primary-id column name that no schema field already uses.
///
/// Tries `id`, then `id_1`, `id_2` and so on.
pub fn disambiguate_pk_name(schema: &FieldSchema) -> String {
    let taken = |name: &str| schema.defs().iter().any(|f| f.keyname == name);
    if !taken("id") {
        return "id".into();
    }
    let mut n = 1;
    loop {
        let candidate = format!("id_{n}");
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn sql_type(datatype: &str) -> &'static str {
    match datatype {
        "INTEGER" | "BIGINT" => "INTEGER",
        "REAL" => "REAL",
        _ => "TEXT",
    }
}

/// Writes a plain SQLite dataset: one `features` table with typed columns,
/// a geometry blob, and a one-row `dataset_meta` table recording geometry
/// type and spatial reference.
#[derive(Clone, Default)]
pub struct SqliteDatasetWriter;

#[async_trait]
impl DatasetWriter for SqliteDatasetWriter {
    async fn create_dataset(
        &self,
        path: &Path,
        schema: &FieldSchema,
        geometry_type: &str,
        srid: i32,
    ) -> Result<CreatedDataset> {
        if path.exists() {
            return Err(SyncError::Container {
                message: format!("dataset already exists at {}", path.display()),
                source: None,
            });
        }

        let pk = disambiguate_pk_name(schema);
        let mut columns = vec![format!("{pk} INTEGER PRIMARY KEY AUTOINCREMENT")];
        for field in schema.defs() {
            columns.push(format!("{} {}", field.keyname, sql_type(&field.datatype)));
        }
        columns.push("geom BLOB".into());

        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite://{}?mode=rwc",
            path.display()
        ))
        .map_err(|e| SyncError::Container {
            message: format!("invalid dataset path {}", path.display()),
            source: Some(e),
        })?
        .create_if_missing(true);

        let mut conn = options.connect().await?;
        let mut tx = conn.begin().await?;
        sqlx::query(&format!(
            "CREATE TABLE features ({})",
            columns.join(", ")
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE TABLE dataset_meta (
                 id INTEGER PRIMARY KEY CHECK (id = 1),
                 geometry_type TEXT NOT NULL,
                 srid INTEGER NOT NULL
             )",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("INSERT INTO dataset_meta (id, geometry_type, srid) VALUES (1, ?, ?)")
            .bind(geometry_type)
            .bind(srid)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        conn.close().await?;

        info!(path = %path.display(), pk, "Created empty dataset");
        Ok(CreatedDataset {
            path: path.to_path_buf(),
            pk_column: pk,
        })
    }
}
