use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};

use aurora_core::queue::{Job, JobPayload, PRIORITY_CLEAN};
use aurora_core::translate::validate_rule;
use aurora_model::{ForwardRule, Method, RuleConfig, RuleParams};

use crate::errors::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RulePayload {
    pub method: Method,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct RuleWithJob {
    pub rule: ForwardRule,
    pub job_id: String,
}

/// Validate a submitted rule against its port and server, resolving the
/// iptables remote address up front the way the UI expects.
async fn validated_config(
    state: &AppState,
    server: &aurora_model::Server,
    port: &aurora_model::Port,
    payload: &RulePayload,
) -> AppResult<RuleConfig> {
    let mut config =
        validate_rule(server, port, payload.method, &payload.config)?;

    if let RuleParams::Iptables(params) = &config.params {
        if config.remote_ip.is_none() {
            // Pre-resolve so the UI can show the target address; the
            // reconciler re-resolves on every apply anyway.
            if let Ok(ip) = state
                .engine
                .resolver()
                .resolve(&params.remote_address)
                .await
            {
                config.remote_ip = Some(ip);
            }
        }
    }
    Ok(config)
}

pub async fn get_rule(
    State(state): State<AppState>,
    Path(port_id): Path<i64>,
) -> AppResult<Json<ForwardRule>> {
    state
        .db()
        .get_rule_for_port(port_id)
        .await?
        .map(Json)
        .ok_or_else(|| {
            AppError::not_found(format!("port {port_id} has no rule"))
        })
}

pub async fn create_rule(
    State(state): State<AppState>,
    Path(port_id): Path<i64>,
    Json(payload): Json<RulePayload>,
) -> AppResult<(StatusCode, Json<RuleWithJob>)> {
    let port = state.db().get_port(port_id).await?;
    let server = state.db().get_server(port.server_id).await?;

    let config =
        validated_config(&state, &server, &port, &payload).await?;
    let rule = state
        .db()
        .create_rule(port.id, payload.method, &config)
        .await?;
    let job = state
        .engine
        .submit_rule(&rule, port.server_id, port.num)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(RuleWithJob {
            rule,
            job_id: job.id,
        }),
    ))
}

pub async fn update_rule(
    State(state): State<AppState>,
    Path(port_id): Path<i64>,
    Json(payload): Json<RulePayload>,
) -> AppResult<Json<RuleWithJob>> {
    let port = state.db().get_port(port_id).await?;
    let server = state.db().get_server(port.server_id).await?;
    let existing = state
        .db()
        .get_rule_for_port(port_id)
        .await?
        .ok_or_else(|| {
            AppError::not_found(format!("port {port_id} has no rule"))
        })?;

    let config =
        validated_config(&state, &server, &port, &payload).await?;
    let rule = state
        .db()
        .update_rule(existing.id, payload.method, &config)
        .await?;
    let job = state
        .engine
        .submit_rule(&rule, port.server_id, port.num)
        .await?;

    Ok(Json(RuleWithJob {
        rule,
        job_id: job.id,
    }))
}

/// Deleting a rule drops the row, then cleans the port on the host; the
/// clean plan records the final counter delta before the filter entries
/// go away.
pub async fn delete_rule(
    State(state): State<AppState>,
    Path(port_id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    let port = state.db().get_port(port_id).await?;
    let rule = state
        .db()
        .get_rule_for_port(port_id)
        .await?
        .ok_or_else(|| {
            AppError::not_found(format!("port {port_id} has no rule"))
        })?;

    state.db().delete_rule(rule.id).await?;
    state
        .engine
        .queue()
        .cancel_by_key(&format!("expire:{port_id}"))
        .await?;
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
    Ok(Json(serde_json::json!({ "job_id": job.id })))
}

/// Fetch the stdout recorded by the rule's last plan run.
pub async fn rule_artifacts(
    State(state): State<AppState>,
    Path(port_id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    let port = state.db().get_port(port_id).await?;
    let rule = state
        .db()
        .get_rule_for_port(port_id)
        .await?
        .ok_or_else(|| {
            AppError::not_found(format!("port {port_id} has no rule"))
        })?;

    let runner = rule.config.runner.as_deref().ok_or_else(|| {
        AppError::not_found("rule has no recorded runner yet")
    })?;
    let stdout = state
        .engine
        .storage()
        .read_artifact_stdout(port.server_id, runner)
        .await
        .map_err(|_| AppError::not_found("artifacts already swept"))?;
    Ok(Json(serde_json::json!({ "stdout": stdout })))
}
