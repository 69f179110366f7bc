//! Uploaded blobs: SSH key material and other operator files. Content
//! lands in the dated storage tree with the kind's mode policy applied;
//! the row records where it went.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;

use aurora_model::{File, FileKind};

use crate::errors::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct FilePayload {
    pub name: String,
    pub kind: FileKind,
    pub content: String,
}

pub async fn upload_file(
    State(state): State<AppState>,
    Json(payload): Json<FilePayload>,
) -> AppResult<(StatusCode, Json<File>)> {
    if payload.name.contains('/') {
        return Err(AppError::bad_request(
            "file name must not contain path separators",
        ));
    }

    let bytes = payload.content.as_bytes();
    let path = state
        .engine
        .storage()
        .save_blob(&payload.name, payload.kind, bytes)
        .await?;
    let file = state
        .db()
        .create_file(
            &payload.name,
            payload.kind,
            bytes.len() as i64,
            &path.to_string_lossy(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(file)))
}

pub async fn get_file(
    State(state): State<AppState>,
    Path(file_id): Path<i64>,
) -> AppResult<Json<File>> {
    Ok(Json(state.db().get_file(file_id).await?))
}
