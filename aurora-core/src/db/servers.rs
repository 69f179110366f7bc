use aurora_model::{
    Server, ServerConfig, ServerUsagePoint, ServerUser, UsagePolicy,
};
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;

use super::{Database, conflict_on_unique};
use crate::db::ports::PortState;
use crate::error::{CoreError, Result};

/// A server together with the port state the engine reads under one
/// snapshot: rules, usage counters and per-port grants.
#[derive(Debug, Clone)]
pub struct ServerSnapshot {
    pub server: Server,
    pub ports: Vec<PortState>,
}

impl ServerSnapshot {
    pub fn port_by_num(&self, num: u16) -> Option<&PortState> {
        self.ports.iter().find(|state| state.port.num == num)
    }
}

/// Operator-supplied fields for creating or replacing a server.
#[derive(Debug, Clone)]
pub struct ServerInput {
    pub name: String,
    pub address: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub ssh_password: Option<String>,
    pub sudo_password: Option<String>,
    pub key_file_id: Option<i64>,
}

pub(crate) fn map_server(row: &PgRow) -> Result<Server> {
    let config: serde_json::Value = row.try_get("config")?;
    Ok(Server {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        address: row.try_get("address")?,
        host: row.try_get("host")?,
        port: row.try_get::<i32, _>("port")? as u16,
        user: row.try_get("ssh_user")?,
        ssh_password: row.try_get("ssh_password")?,
        key_file_id: row.try_get("key_file_id")?,
        sudo_password: row.try_get("sudo_password")?,
        config: serde_json::from_value(config)?,
        is_active: row.try_get("is_active")?,
    })
}

fn map_server_user(row: &PgRow) -> Result<ServerUser> {
    let config: serde_json::Value = row.try_get("config")?;
    let config: UsagePolicy = serde_json::from_value(config)?;
    Ok(ServerUser {
        id: row.try_get("id")?,
        server_id: row.try_get("server_id")?,
        user_id: row.try_get("user_id")?,
        download: row.try_get("download")?,
        upload: row.try_get("upload")?,
        config,
    })
}

impl Database {
    pub async fn list_active_servers(&self) -> Result<Vec<Server>> {
        let rows = sqlx::query(
            "SELECT * FROM servers WHERE is_active ORDER BY id",
        )
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(map_server).collect()
    }

    pub async fn get_server(&self, server_id: i64) -> Result<Server> {
        let row = sqlx::query("SELECT * FROM servers WHERE id = $1")
            .bind(server_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| {
                CoreError::not_found(format!("server {server_id}"))
            })?;
        map_server(&row)
    }

    pub async fn create_server(&self, input: ServerInput) -> Result<Server> {
        let row = sqlx::query(
            r#"
            INSERT INTO servers
                (name, address, host, port, ssh_user, ssh_password,
                 sudo_password, key_file_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(&input.name)
        .bind(&input.address)
        .bind(&input.host)
        .bind(input.port as i32)
        .bind(&input.user)
        .bind(&input.ssh_password)
        .bind(&input.sudo_password)
        .bind(input.key_file_id)
        .fetch_one(self.pool())
        .await
        .map_err(|e| {
            conflict_on_unique(e, "server with the same name or host:port already exists")
        })?;
        map_server(&row)
    }

    pub async fn update_server(
        &self,
        server_id: i64,
        input: ServerInput,
    ) -> Result<Server> {
        let row = sqlx::query(
            r#"
            UPDATE servers
            SET name = $1, address = $2, host = $3, port = $4,
                ssh_user = $5, ssh_password = $6, sudo_password = $7,
                key_file_id = $8
            WHERE id = $9
            RETURNING *
            "#,
        )
        .bind(&input.name)
        .bind(&input.address)
        .bind(&input.host)
        .bind(input.port as i32)
        .bind(&input.user)
        .bind(&input.ssh_password)
        .bind(&input.sudo_password)
        .bind(input.key_file_id)
        .bind(server_id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| {
            conflict_on_unique(e, "server with the same name or host:port already exists")
        })?
        .ok_or_else(|| CoreError::not_found(format!("server {server_id}")))?;
        map_server(&row)
    }

    /// Engine-owned write: the reconciler persists facts, installed
    /// binary versions and the init marker here.
    pub async fn update_server_config(
        &self,
        server_id: i64,
        config: &ServerConfig,
    ) -> Result<()> {
        sqlx::query("UPDATE servers SET config = $1 WHERE id = $2")
            .bind(serde_json::to_value(config)?)
            .bind(server_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn delete_server(&self, server_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM servers WHERE id = $1")
            .bind(server_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Load a server and everything the engine reads about its ports in
    /// one snapshot.
    pub async fn load_server_snapshot(
        &self,
        server_id: i64,
    ) -> Result<ServerSnapshot> {
        let server = self.get_server(server_id).await?;
        let ports = self.load_port_states(server_id).await?;
        Ok(ServerSnapshot { server, ports })
    }

    pub async fn server_users(
        &self,
        server_id: i64,
    ) -> Result<Vec<ServerUser>> {
        let rows = sqlx::query(
            "SELECT * FROM server_users WHERE server_id = $1 ORDER BY id",
        )
        .bind(server_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(map_server_user).collect()
    }

    pub async fn set_server_user_usage(
        &self,
        server_user_id: i64,
        download: i64,
        upload: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE server_users SET download = $1, upload = $2 WHERE id = $3",
        )
        .bind(download)
        .bind(upload)
        .bind(server_user_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn record_server_usage(
        &self,
        point: &ServerUsagePoint,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO server_usages (server_id, timestamp, cpu, memory, disk)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(point.server_id)
        .bind(point.timestamp)
        .bind(point.cpu)
        .bind(point.memory)
        .bind(point.disk)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn prune_server_usage(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM server_usages WHERE timestamp < $1",
        )
        .bind(older_than)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}
