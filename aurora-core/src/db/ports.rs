use aurora_model::{Port, PortConfig, PortUsage};
use sqlx::Row;
use sqlx::postgres::PgRow;

use super::{Database, conflict_on_unique};
use crate::db::rules::map_rule;
use crate::db::usage::map_usage;
use crate::error::{CoreError, Result};

/// A port with the attachments the engine reads together: its rule, its
/// usage counters and the ids of users granted access.
#[derive(Debug, Clone)]
pub struct PortState {
    pub port: Port,
    pub rule: Option<aurora_model::ForwardRule>,
    pub usage: Option<PortUsage>,
    pub allowed_user_ids: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct PortInput {
    pub num: u16,
    pub external_num: Option<u16>,
    pub config: PortConfig,
    pub notes: Option<String>,
}

pub(crate) fn map_port(row: &PgRow) -> Result<Port> {
    let config: serde_json::Value = row.try_get("config")?;
    Ok(Port {
        id: row.try_get("id")?,
        server_id: row.try_get("server_id")?,
        num: row.try_get::<i32, _>("num")? as u16,
        external_num: row
            .try_get::<Option<i32>, _>("external_num")?
            .map(|n| n as u16),
        config: serde_json::from_value(config)?,
        notes: row.try_get("notes")?,
        is_active: row.try_get("is_active")?,
    })
}

impl Database {
    pub async fn get_port(&self, port_id: i64) -> Result<Port> {
        let row = sqlx::query("SELECT * FROM ports WHERE id = $1")
            .bind(port_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| {
                CoreError::not_found(format!("port {port_id}"))
            })?;
        map_port(&row)
    }

    pub async fn get_port_by_num(
        &self,
        server_id: i64,
        num: u16,
    ) -> Result<Option<Port>> {
        let row = sqlx::query(
            "SELECT * FROM ports WHERE server_id = $1 AND num = $2",
        )
        .bind(server_id)
        .bind(num as i32)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(map_port).transpose()
    }

    pub async fn list_ports(&self, server_id: i64) -> Result<Vec<Port>> {
        let rows = sqlx::query(
            "SELECT * FROM ports WHERE server_id = $1 ORDER BY num",
        )
        .bind(server_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(map_port).collect()
    }

    pub async fn create_port(
        &self,
        server_id: i64,
        input: PortInput,
    ) -> Result<Port> {
        let row = sqlx::query(
            r#"
            INSERT INTO ports (server_id, num, external_num, config, notes)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(server_id)
        .bind(input.num as i32)
        .bind(input.external_num.map(|n| n as i32))
        .bind(serde_json::to_value(&input.config)?)
        .bind(&input.notes)
        .fetch_one(self.pool())
        .await
        .map_err(|e| {
            conflict_on_unique(e, "port number already exists on this server")
        })?;
        map_port(&row)
    }

    pub async fn update_port(
        &self,
        port_id: i64,
        input: PortInput,
    ) -> Result<Port> {
        let row = sqlx::query(
            r#"
            UPDATE ports
            SET num = $1, external_num = $2, config = $3, notes = $4
            WHERE id = $5
            RETURNING *
            "#,
        )
        .bind(input.num as i32)
        .bind(input.external_num.map(|n| n as i32))
        .bind(serde_json::to_value(&input.config)?)
        .bind(&input.notes)
        .bind(port_id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| {
            conflict_on_unique(e, "port number already exists on this server")
        })?
        .ok_or_else(|| CoreError::not_found(format!("port {port_id}")))?;
        map_port(&row)
    }

    /// Policy-layer write: persists throttle tiers chosen by the limit
    /// enforcer (or the operator) without touching the rest of the row.
    pub async fn update_port_config(
        &self,
        port_id: i64,
        config: &PortConfig,
    ) -> Result<()> {
        sqlx::query("UPDATE ports SET config = $1 WHERE id = $2")
            .bind(serde_json::to_value(config)?)
            .bind(port_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn delete_port(&self, port_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM ports WHERE id = $1")
            .bind(port_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub(crate) async fn load_port_states(
        &self,
        server_id: i64,
    ) -> Result<Vec<PortState>> {
        let port_rows = sqlx::query(
            "SELECT * FROM ports WHERE server_id = $1 ORDER BY num",
        )
        .bind(server_id)
        .fetch_all(self.pool())
        .await?;

        let mut states = Vec::with_capacity(port_rows.len());
        for row in &port_rows {
            let port = map_port(row)?;

            let rule_row = sqlx::query(
                "SELECT * FROM port_forward_rules WHERE port_id = $1",
            )
            .bind(port.id)
            .fetch_optional(self.pool())
            .await?;
            let rule = rule_row.as_ref().map(map_rule).transpose()?;

            let usage_row = sqlx::query(
                "SELECT * FROM port_usages WHERE port_id = $1",
            )
            .bind(port.id)
            .fetch_optional(self.pool())
            .await?;
            let usage = usage_row.as_ref().map(map_usage).transpose()?;

            let allowed_user_ids: Vec<i64> = sqlx::query(
                "SELECT user_id FROM port_users WHERE port_id = $1",
            )
            .bind(port.id)
            .fetch_all(self.pool())
            .await?
            .iter()
            .map(|r| r.try_get("user_id"))
            .collect::<std::result::Result<_, _>>()?;

            states.push(PortState {
                port,
                rule,
                usage,
                allowed_user_ids,
            });
        }
        Ok(states)
    }
}
