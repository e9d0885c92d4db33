use anyhow::Result;
use axum::extract::{Form, State};
use axum::http::{header, HeaderMap};
use axum::response::{AppendHeaders, IntoResponse, Redirect, Response};
use axum::Json;
use serde_derive::{Deserialize, Serialize};
use serde_json::json;

use crate::db;
use crate::server::{AppError, AppState};
use crate::session::{self, AuthSession};

#[derive(Debug, Deserialize)]
pub struct CredentialsForm {
    pub username: Option<String>,
    pub password: Option<String>,
    pub email: Option<String>,
}

#[derive(Serialize)]
pub struct StatusView {
    pub status: &'static str,
}

/// The login page doubles as the home page once a session exists.
pub async fn home(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    match state.session_from_headers(&headers) {
        Some((_token, session)) => {
            let user = db::get_user(&state.inner.db, session.username.clone())
                .await?
                .ok_or_else(|| AppError::NotFound(format!("unknown user {}", session.username)))?;
            Ok(Json(json!({"user": {"username": user.username, "email": user.email}}))
                .into_response())
        }
        None => Ok(Json(StatusView {
            status: "Please log in",
        })
        .into_response()),
    }
}

pub async fn login(
    State(state): State<AppState>,
    Form(form): Form<CredentialsForm>,
) -> Result<Response, AppError> {
    let username = form.username.unwrap_or_default().trim().to_lowercase();
    let password = form.password.unwrap_or_default();
    if username.is_empty() || password.is_empty() {
        return Ok(Json(StatusView {
            status: "Both fields required",
        })
        .into_response());
    }

    let user = db::get_user(&state.inner.db, username.clone()).await?;
    let valid = match &user {
        Some(user) => verify_password(password, user.password.clone()).await?,
        None => false,
    };
    if !valid {
        return Ok(Json(StatusView {
            status: "Invalid user/pass",
        })
        .into_response());
    }

    let token = state.sessions().create(&username);
    Ok((
        AppendHeaders([(header::SET_COOKIE, session::session_cookie(&token))]),
        Json(StatusView {
            status: "Login successful",
        }),
    )
        .into_response())
}

pub async fn signup(
    State(state): State<AppState>,
    Form(form): Form<CredentialsForm>,
) -> Result<Response, AppError> {
    let username = form.username.unwrap_or_default().trim().to_lowercase();
    let password = form.password.unwrap_or_default();
    if username.is_empty() || password.is_empty() {
        return Ok(Json(StatusView {
            status: "User/Pass required",
        })
        .into_response());
    }
    let email = form.email.filter(|e| !e.is_empty());

    let hash = hash_password(password).await?;
    let added = db::add_user(&state.inner.db, username.clone(), hash, email).await?;
    if !added {
        return Ok(Json(StatusView {
            status: "Username taken",
        })
        .into_response());
    }

    let token = state.sessions().create(&username);
    Ok((
        AppendHeaders([(header::SET_COOKIE, session::session_cookie(&token))]),
        Json(StatusView {
            status: "Signup successful",
        }),
    )
        .into_response())
}

pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some((token, _)) = state.session_from_headers(&headers) {
        state.sessions().remove(&token);
    }
    (
        AppendHeaders([(header::SET_COOKIE, session::clear_session_cookie())]),
        Redirect::to("/"),
    )
        .into_response()
}

pub async fn settings_view(
    State(state): State<AppState>,
    auth: AuthSession,
) -> Result<Json<serde_json::Value>, AppError> {
    let user = db::get_user(&state.inner.db, auth.session.username.clone())
        .await?
        .ok_or_else(|| AppError::NotFound(format!("unknown user {}", auth.session.username)))?;
    Ok(Json(
        json!({"user": {"username": user.username, "email": user.email}}),
    ))
}

pub async fn settings_save(
    State(state): State<AppState>,
    auth: AuthSession,
    Form(form): Form<CredentialsForm>,
) -> Result<Json<StatusView>, AppError> {
    let password = match form.password.filter(|p| !p.is_empty()) {
        Some(password) => Some(hash_password(password).await?),
        None => None,
    };
    db::update_user(&state.inner.db, auth.session.username.clone(), password, form.email).await?;
    Ok(Json(StatusView { status: "Saved" }))
}

async fn hash_password(password: String) -> Result<String> {
    let hash =
        tokio::task::spawn_blocking(move || bcrypt::hash(&password, bcrypt::DEFAULT_COST)).await??;
    Ok(hash)
}

async fn verify_password(password: String, hash: String) -> Result<bool> {
    let valid = tokio::task::spawn_blocking(move || bcrypt::verify(&password, &hash)).await??;
    Ok(valid)
}
