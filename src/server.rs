pub mod auth;
pub mod browse;
pub mod stream;
pub mod train;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_derive::Serialize;
use tokio::sync::mpsc::{self, Sender};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::db::{self, SqlCommand};
use crate::session::{self, Session, SessionStore};
use crate::training::JobCoordinator;
use crate::workspace::Workspace;

#[derive(Clone)]
pub struct AppState {
    pub(crate) inner: Arc<AppStateInner>,
}

pub(crate) struct AppStateInner {
    pub(crate) config: Config,
    pub(crate) sessions: SessionStore,
    pub(crate) coordinator: Arc<JobCoordinator>,
    pub(crate) workspace: Workspace,
    pub(crate) db: Sender<SqlCommand>,
}

impl AppState {
    pub fn new(config: Config, db: Sender<SqlCommand>) -> Self {
        let workspace = Workspace::new(config.root_dir.clone(), config.template_dir.clone());
        Self {
            inner: Arc::new(AppStateInner {
                config,
                sessions: SessionStore::default(),
                coordinator: Arc::new(JobCoordinator::default()),
                workspace,
                db,
            }),
        }
    }

    pub(crate) fn sessions(&self) -> &SessionStore {
        &self.inner.sessions
    }

    pub(crate) fn session_from_headers(&self, headers: &HeaderMap) -> Option<(String, Session)> {
        let token = headers
            .get(header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .and_then(session::token_from_cookie_header)?;
        let session = self.inner.sessions.get(&token)?;
        Some((token, session))
    }
}

pub fn run(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let conn = db::init(&config.db_path())?;
        let (db_tx, db_rx) = mpsc::channel(256);
        let db_fut = tokio::spawn(db::loop_db(conn, db_rx));

        let addr = format!("{}:{}", config.host, config.port);
        let state = AppState::new(config, db_tx);
        let app = router(state);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(%addr, "server running");
        let serve_fut = tokio::spawn(async move { axum::serve(listener, app).await });

        let e = tokio::select! {
            e = db_fut => anyhow!("user store loop exited unexpectedly {:#?}", e),
            e = serve_fut => anyhow!("http server exited unexpectedly {:#?}", e),
        };

        Err(e)
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(auth::home).post(auth::login))
        .route("/logout", get(auth::logout))
        .route("/signup", post(auth::signup))
        .route("/settings", get(auth::settings_view).post(auth::settings_save))
        .route("/images", get(browse::images))
        .route("/results", get(browse::results))
        .route("/results/{filename}", get(browse::download_result))
        .route("/logs", get(browse::logs))
        .route("/logs/{filename}", get(browse::download_log))
        .route("/upload", post(browse::upload))
        .route("/training", get(browse::training))
        .route("/start_training", post(train::start_training))
        .route("/stream", get(stream::stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}
