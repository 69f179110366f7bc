use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;

use aurora_core::db::PortInput;
use aurora_core::queue::{Job, JobPayload, PRIORITY_CLEAN};
use aurora_model::{Port, PortConfig};

use crate::errors::AppResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PortPayload {
    pub num: u16,
    #[serde(default)]
    pub external_num: Option<u16>,
    #[serde(default)]
    pub config: PortConfig,
    #[serde(default)]
    pub notes: Option<String>,
}

impl From<PortPayload> for PortInput {
    fn from(payload: PortPayload) -> Self {
        PortInput {
            num: payload.num,
            external_num: payload.external_num,
            config: payload.config,
            notes: payload.notes,
        }
    }
}

pub async fn list_ports(
    State(state): State<AppState>,
    Path(server_id): Path<i64>,
) -> AppResult<Json<Vec<Port>>> {
    Ok(Json(state.db().list_ports(server_id).await?))
}

pub async fn create_port(
    State(state): State<AppState>,
    Path(server_id): Path<i64>,
    Json(payload): Json<PortPayload>,
) -> AppResult<(StatusCode, Json<Port>)> {
    state.db().get_server(server_id).await?;
    let port =
        state.db().create_port(server_id, payload.into()).await?;
    Ok((StatusCode::CREATED, Json(port)))
}

pub async fn get_port(
    State(state): State<AppState>,
    Path(port_id): Path<i64>,
) -> AppResult<Json<Port>> {
    Ok(Json(state.db().get_port(port_id).await?))
}

pub async fn update_port(
    State(state): State<AppState>,
    Path(port_id): Path<i64>,
    Json(payload): Json<PortPayload>,
) -> AppResult<Json<Port>> {
    Ok(Json(state.db().update_port(port_id, payload.into()).await?))
}

/// Deleting a port cleans its host state first, then drops the row.
pub async fn delete_port(
    State(state): State<AppState>,
    Path(port_id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    let port = state.db().get_port(port_id).await?;
    let job = state
        .engine
        .queue()
        .enqueue(Job::new(
            JobPayload::CleanPort {
                server_id: port.server_id,
                port_num: port.num,
            },
            PRIORITY_CLEAN,
        ))
        .await?;
    state.db().delete_port(port_id).await?;
    Ok(Json(serde_json::json!({ "job_id": job.id })))
}

/// Operator reset: zero all usage fields and the host-side counters.
pub async fn reset_port_usage(
    State(state): State<AppState>,
    Path(port_id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    let port = state.db().get_port(port_id).await?;
    state.db().reset_usage(port_id).await?;
    let job = state
        .engine
        .queue()
        .enqueue(Job::new(
            JobPayload::ResetFilter {
                server_id: port.server_id,
                port_num: port.num,
            },
            PRIORITY_CLEAN,
        ))
        .await?;
    Ok(Json(serde_json::json!({ "job_id": job.id })))
}
