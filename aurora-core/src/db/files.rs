use aurora_model::{File, FileKind};
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;

use super::Database;
use crate::error::{CoreError, Result};

fn map_file(row: &PgRow) -> Result<File> {
    let kind: String = row.try_get("kind")?;
    Ok(File {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        kind: FileKind::parse(&kind).ok_or_else(|| {
            CoreError::internal(format!("unknown file kind: {kind}"))
        })?,
        size: row.try_get("size")?,
        storage_path: row.try_get("storage_path")?,
        version: row.try_get("version")?,
        notes: row.try_get("notes")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

impl Database {
    pub async fn get_file(&self, file_id: i64) -> Result<File> {
        let row = sqlx::query("SELECT * FROM files WHERE id = $1")
            .bind(file_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| {
                CoreError::not_found(format!("file {file_id}"))
            })?;
        map_file(&row)
    }

    pub async fn create_file(
        &self,
        name: &str,
        kind: FileKind,
        size: i64,
        storage_path: &str,
    ) -> Result<File> {
        let row = sqlx::query(
            r#"
            INSERT INTO files (name, kind, size, storage_path)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(kind.as_str())
        .bind(size)
        .bind(storage_path)
        .fetch_one(self.pool())
        .await?;
        map_file(&row)
    }
}
