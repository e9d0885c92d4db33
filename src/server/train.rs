use std::path::Path;

use anyhow::Result;
use axum::extract::{Form, State};
use axum::Json;
use serde_derive::{Deserialize, Serialize};
use tracing::{error, info};

use crate::server::{AppError, AppState};
use crate::session::AuthSession;
use crate::training::command::{build_invocation, rename_aside_existing, sanitize_extra_parameters};
use crate::training::runner::{append_line, run_training};
use crate::training::TrainingJob;

#[derive(Debug, Deserialize)]
pub struct StartTrainingForm {
    pub templatename: Option<String>,
    pub model_name: Option<String>,
    pub more_parameters: Option<String>,
}

/// Acknowledgment returned as soon as the run is handed off; progress is
/// observed through the stream endpoint against `log_file`.
#[derive(Serialize)]
pub struct StartTrainingView {
    pub status: &'static str,
    pub model_name: String,
    pub log_file: String,
}

pub async fn start_training(
    State(state): State<AppState>,
    auth: AuthSession,
    Form(form): Form<StartTrainingForm>,
) -> Result<Json<StartTrainingView>, AppError> {
    let model_name = form.model_name.unwrap_or_default().trim().to_string();
    if model_name.is_empty() {
        return Err(AppError::BadRequest("model name is required".to_string()));
    }

    let username = auth.session.username.clone();
    let start_model = form
        .templatename
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    let extra_parameters = sanitize_extra_parameters(&form.more_parameters.unwrap_or_default());

    let log_path = state.inner.workspace.allocate_log(&username)?;
    let log_file = log_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    state.sessions().update(&auth.token, |s| {
        s.start_template = start_model.clone();
        s.model_name = Some(model_name.clone());
        s.more_parameters = Some(extra_parameters.clone());
        s.log_file = Some(log_path.clone());
    });

    match prepare_job(
        &state,
        &username,
        &model_name,
        start_model,
        extra_parameters,
        &log_path,
    ) {
        Ok(job) => {
            state.inner.coordinator.submit(&log_path);
            let coordinator = state.inner.coordinator.clone();
            tokio::spawn(run_training(coordinator, job));
            info!(model = %model_name, user = %username, "training job dispatched");
        }
        Err(err) => {
            // failure detail lives in the log stream; the submission still acks
            if let Err(log_err) = append_line(&log_path, &format!("Error: {err:#}")).await {
                error!(error = ?log_err, "failed to write submission error to training log");
            }
            error!(model = %model_name, error = ?err, "failed to prepare training job");
        }
    }

    Ok(Json(StartTrainingView {
        status: "Training started",
        model_name,
        log_file,
    }))
}

fn prepare_job(
    state: &AppState,
    username: &str,
    model_name: &str,
    start_model: Option<String>,
    extra_parameters: String,
    log_path: &Path,
) -> Result<TrainingJob> {
    let workspace = &state.inner.workspace;
    let ground_truth_dir = workspace.user_dir(username);
    std::fs::create_dir_all(&ground_truth_dir)?;
    let result_dir = workspace.results_dir(username);
    std::fs::create_dir_all(&result_dir)?;

    for path in rename_aside_existing(&result_dir, model_name)? {
        info!(renamed = %path.display(), "moved prior artifact aside");
    }

    let invocation = build_invocation(
        &state.inner.config.training,
        model_name,
        &ground_truth_dir,
        start_model.as_deref(),
        &extra_parameters,
    );

    Ok(TrainingJob {
        username: username.to_string(),
        model_name: model_name.to_string(),
        start_model,
        extra_parameters,
        ground_truth_dir,
        result_dir,
        artifact_dir: state.inner.config.artifact_dir(),
        log_path: log_path.to_path_buf(),
        invocation,
    })
}
