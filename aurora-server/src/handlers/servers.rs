use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};

use aurora_core::db::ServerInput;
use aurora_core::queue::{
    Job, JobPayload, PRIORITY_CLEAN, PRIORITY_SERVER,
};
use aurora_model::Server;

use crate::errors::AppResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ServerPayload {
    pub name: String,
    pub address: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub ssh_password: Option<String>,
    #[serde(default)]
    pub sudo_password: Option<String>,
    #[serde(default)]
    pub key_file_id: Option<i64>,
}

fn default_port() -> u16 {
    22
}

fn default_user() -> String {
    "root".to_string()
}

impl From<ServerPayload> for ServerInput {
    fn from(payload: ServerPayload) -> Self {
        ServerInput {
            name: payload.name,
            address: payload.address,
            host: payload.host,
            port: payload.port,
            user: payload.user,
            ssh_password: payload.ssh_password,
            sudo_password: payload.sudo_password,
            key_file_id: payload.key_file_id,
        }
    }
}

/// A mutated entity plus the job that is reconciling it; the caller can
/// subscribe to the job's stream immediately.
#[derive(Debug, Serialize)]
pub struct ServerWithJob {
    pub server: Server,
    pub job_id: String,
}

pub async fn list_servers(
    State(state): State<AppState>,
) -> AppResult<Json<Vec<Server>>> {
    Ok(Json(state.db().list_active_servers().await?))
}

pub async fn get_server(
    State(state): State<AppState>,
    Path(server_id): Path<i64>,
) -> AppResult<Json<Server>> {
    Ok(Json(state.db().get_server(server_id).await?))
}

pub async fn create_server(
    State(state): State<AppState>,
    Json(payload): Json<ServerPayload>,
) -> AppResult<(StatusCode, Json<ServerWithJob>)> {
    let server = state.db().create_server(payload.into()).await?;
    let job = state
        .engine
        .queue()
        .enqueue(Job::new(
            JobPayload::ServerInit {
                server_id: server.id,
            },
            PRIORITY_SERVER,
        ))
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ServerWithJob {
            server,
            job_id: job.id,
        }),
    ))
}

pub async fn update_server(
    State(state): State<AppState>,
    Path(server_id): Path<i64>,
    Json(payload): Json<ServerPayload>,
) -> AppResult<Json<ServerWithJob>> {
    let server =
        state.db().update_server(server_id, payload.into()).await?;
    let job = state
        .engine
        .queue()
        .enqueue(Job::new(
            JobPayload::ServerInit {
                server_id: server.id,
            },
            PRIORITY_SERVER,
        ))
        .await?;
    Ok(Json(ServerWithJob {
        server,
        job_id: job.id,
    }))
}

/// Destroying a server enqueues a clean job; the row is dropped by the
/// reconciler once the host has been cleaned.
pub async fn delete_server(
    State(state): State<AppState>,
    Path(server_id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    state.db().get_server(server_id).await?;
    let job = state
        .engine
        .queue()
        .enqueue(Job::new(
            JobPayload::CleanServer { server_id },
            PRIORITY_CLEAN,
        ))
        .await?;
    Ok(Json(serde_json::json!({ "job_id": job.id })))
}

/// Convenience: probe the server now and stream the output.
pub async fn connect_server(
    State(state): State<AppState>,
    Path(server_id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    state.db().get_server(server_id).await?;
    let job = state
        .engine
        .queue()
        .enqueue(Job::new(
            JobPayload::ServerInit { server_id },
            PRIORITY_SERVER,
        ))
        .await?;
    Ok(Json(serde_json::json!({ "job_id": job.id })))
}
