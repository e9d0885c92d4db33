use std::path::PathBuf;

use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts};
use axum::response::Redirect;
use dashmap::DashMap;
use uuid::Uuid;

use crate::server::AppState;

pub const SESSION_COOKIE: &str = "session";

/// Per-login state. The training fields mirror what the browser submitted
/// last, so the stream endpoint can find the active log without parameters.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub username: String,
    pub start_template: Option<String>,
    pub model_name: Option<String>,
    pub more_parameters: Option<String>,
    pub log_file: Option<PathBuf>,
}

#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<String, Session>,
}

impl SessionStore {
    pub fn create(&self, username: &str) -> String {
        let token = Uuid::new_v4().to_string();
        self.sessions.insert(
            token.clone(),
            Session {
                username: username.to_string(),
                ..Session::default()
            },
        );
        token
    }

    pub fn get(&self, token: &str) -> Option<Session> {
        self.sessions.get(token).map(|s| s.clone())
    }

    pub fn update(&self, token: &str, f: impl FnOnce(&mut Session)) -> bool {
        match self.sessions.get_mut(token) {
            Some(mut session) => {
                f(&mut session);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, token: &str) {
        self.sessions.remove(token);
    }
}

pub fn token_from_cookie_header(header: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

pub fn session_cookie(token: &str) -> String {
    format!("{SESSION_COOKIE}={token}; HttpOnly; Path=/")
}

pub fn clear_session_cookie() -> String {
    format!("{SESSION_COOKIE}=; Max-Age=0; HttpOnly; Path=/")
}

/// Extractor for endpoints that require a logged-in user. Requests without
/// a live session are redirected to the login page.
pub struct AuthSession {
    pub token: String,
    pub session: Session,
}

impl FromRequestParts<AppState> for AuthSession {
    type Rejection = Redirect;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .and_then(token_from_cookie_header)
            .and_then(|token| {
                let session = state.sessions().get(&token)?;
                Some(AuthSession { token, session })
            })
            .ok_or_else(|| Redirect::to("/"))
    }
}
