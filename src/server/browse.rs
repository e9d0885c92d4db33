use std::io::ErrorKind;
use std::path::PathBuf;

use axum::extract::{Multipart, Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::server::{AppError, AppState};
use crate::session::AuthSession;
use crate::workspace::Workspace;

pub async fn images(
    State(state): State<AppState>,
    auth: AuthSession,
) -> Result<Json<Value>, AppError> {
    let pairs = state.inner.workspace.list_image_pairs(&auth.session.username)?;
    Ok(Json(json!({ "filepairs": pairs })))
}

pub async fn results(
    State(state): State<AppState>,
    auth: AuthSession,
) -> Result<Json<Value>, AppError> {
    let files = state.inner.workspace.list_results(&auth.session.username)?;
    Ok(Json(json!({ "results": files })))
}

/// Lists the start models a new run can be trained from.
pub async fn training(
    State(state): State<AppState>,
    _auth: AuthSession,
) -> Result<Json<Value>, AppError> {
    let templates = state.inner.workspace.list_templates()?;
    Ok(Json(json!({ "templates": templates })))
}

pub async fn logs(
    State(state): State<AppState>,
    auth: AuthSession,
) -> Result<Json<Value>, AppError> {
    let files = state.inner.workspace.list_logs(&auth.session.username)?;
    Ok(Json(json!({ "logs": files })))
}

pub async fn download_result(
    State(state): State<AppState>,
    auth: AuthSession,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    serve_file(state.inner.workspace.results_dir(&auth.session.username), &filename).await
}

pub async fn download_log(
    State(state): State<AppState>,
    auth: AuthSession,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    serve_file(state.inner.workspace.logs_dir(&auth.session.username), &filename).await
}

/// Serves one file out of the user's own folder. Names with path
/// separators never reach the filesystem.
async fn serve_file(dir: PathBuf, filename: &str) -> Result<Response, AppError> {
    if filename.contains(['/', '\\']) || filename == ".." {
        return Err(AppError::BadRequest(format!("invalid file name: {filename}")));
    }
    let path = dir.join(filename);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(AppError::NotFound(format!("no such file: {filename}")))
        }
        Err(e) => return Err(anyhow::Error::from(e).into()),
    };
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

pub async fn upload(
    State(state): State<AppState>,
    auth: AuthSession,
    mut multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    let mut saved = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?
    {
        let Some(filename) = field.file_name().map(ToOwned::to_owned) else {
            continue;
        };
        if !Workspace::is_pair_filename(&filename) {
            return Err(AppError::BadRequest(format!(
                "unsupported file type: {filename}"
            )));
        }
        let data = field
            .bytes()
            .await
            .map_err(|e| AppError::BadRequest(e.to_string()))?;
        state
            .inner
            .workspace
            .save_pair_file(&auth.session.username, &filename, &data)?;
        saved.push(filename);
    }

    Ok(Json(json!({ "status": "Uploaded", "files": saved })))
}
