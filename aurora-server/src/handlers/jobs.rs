//! Job stream subscriptions: drain the persisted history, then follow
//! the live channel until the stopword arrives or the idle budget runs
//! out.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{Json, Response};
use futures::SinkExt;
use tracing::debug;

use crate::errors::AppResult;
use crate::state::AppState;

pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let status = state.engine.queue().status(&job_id).await?;
    Ok(Json(serde_json::json!({ "job_id": job_id, "status": status })))
}

/// Request cancellation of a running plan; it stops at the next step
/// boundary. A currently executing remote command runs to completion.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    state.engine.cancel_job(&job_id);
    Ok(Json(serde_json::json!({ "job_id": job_id, "cancelling": true })))
}

pub async fn stream_job(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| follow_stream(socket, state, job_id))
}

async fn follow_stream(
    mut socket: WebSocket,
    state: AppState,
    job_id: String,
) {
    let bus = state.engine.bus();
    let stopword = bus.stopword().to_string();
    let idle_budget = state.engine.settings().pubsub_timeout;

    // Late subscribers drain the persisted history first, then attach
    // to the live channel.
    if let Ok(history) = bus.history(&job_id).await {
        for item in history {
            let done = item == stopword;
            if socket.send(Message::Text(item.into())).await.is_err() {
                return;
            }
            if done {
                let _ = socket.close().await;
                return;
            }
        }
    }

    let mut live = match bus.subscribe(&job_id).await {
        Ok(subscription) => subscription,
        Err(err) => {
            debug!(job_id, "Stream subscribe failed: {err}");
            return;
        }
    };

    loop {
        let next = tokio::time::timeout(idle_budget, live.recv()).await;
        match next {
            Ok(Some(text)) => {
                let done = text == stopword;
                if socket.send(Message::Text(text.into())).await.is_err()
                {
                    return;
                }
                if done {
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => {
                debug!(job_id, "Stream idle budget exhausted");
                break;
            }
        }
    }
    let _ = socket.close().await;
}
