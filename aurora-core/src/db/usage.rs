use aurora_model::PortUsage;
use sqlx::Row;
use sqlx::postgres::PgRow;

use super::Database;
use crate::error::Result;
use crate::traffic::rollup::{TrafficObservation, roll_usage};

pub(crate) fn map_usage(row: &PgRow) -> Result<PortUsage> {
    Ok(PortUsage {
        port_id: row.try_get("port_id")?,
        download: row.try_get("download")?,
        upload: row.try_get("upload")?,
        download_accumulate: row.try_get("download_accumulate")?,
        upload_accumulate: row.try_get("upload_accumulate")?,
        download_checkpoint: row.try_get("download_checkpoint")?,
        upload_checkpoint: row.try_get("upload_checkpoint")?,
    })
}

impl Database {
    pub async fn get_usage(
        &self,
        port_id: i64,
    ) -> Result<Option<PortUsage>> {
        let row = sqlx::query(
            "SELECT * FROM port_usages WHERE port_id = $1",
        )
        .bind(port_id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(map_usage).transpose()
    }

    /// Apply one traffic observation to a port's counters.
    ///
    /// `prev` is the usage snapshot the collector loaded at pass start;
    /// the row is re-read under `FOR UPDATE` inside the same transaction
    /// that writes the result, so a concurrent accumulate roll-forward
    /// from the reconciler cannot be lost.
    pub async fn apply_observation(
        &self,
        port_id: i64,
        prev: Option<&PortUsage>,
        observed: &TrafficObservation,
        accumulate: bool,
    ) -> Result<PortUsage> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO port_usages (port_id)
            VALUES ($1)
            ON CONFLICT (port_id) DO NOTHING
            "#,
        )
        .bind(port_id)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            "SELECT * FROM port_usages WHERE port_id = $1 FOR UPDATE",
        )
        .bind(port_id)
        .fetch_one(&mut *tx)
        .await?;
        let current = map_usage(&row)?;

        let next = roll_usage(current, prev, observed, accumulate);

        sqlx::query(
            r#"
            UPDATE port_usages
            SET download = $2, upload = $3,
                download_accumulate = $4, upload_accumulate = $5,
                download_checkpoint = $6, upload_checkpoint = $7
            WHERE port_id = $1
            "#,
        )
        .bind(port_id)
        .bind(next.download)
        .bind(next.upload)
        .bind(next.download_accumulate)
        .bind(next.upload_accumulate)
        .bind(next.download_checkpoint)
        .bind(next.upload_checkpoint)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(next)
    }

    /// Operator reset: all four usage fields and both checkpoints to zero.
    pub async fn reset_usage(&self, port_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE port_usages
            SET download = 0, upload = 0,
                download_accumulate = 0, upload_accumulate = 0,
                download_checkpoint = 0, upload_checkpoint = 0
            WHERE port_id = $1
            "#,
        )
        .bind(port_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// After a plan resets the host-side counters, zero the checkpoints so
    /// an in-flight collection pass is skipped instead of double-counting.
    pub async fn zero_checkpoints(&self, port_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE port_usages
            SET download_checkpoint = 0, upload_checkpoint = 0
            WHERE port_id = $1
            "#,
        )
        .bind(port_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
