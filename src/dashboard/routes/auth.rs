use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Form, Json};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::ControlState;
use crate::dashboard::security::{constant_time_eq, CSRF_HEADER, SESSION_COOKIE};

const NO_STORE: [(header::HeaderName, &str); 3] = [
    (header::CACHE_CONTROL, "no-store, no-cache, must-revalidate, max-age=0"),
    (header::PRAGMA, "no-cache"),
    (header::EXPIRES, "0"),
];

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct NextQuery {
    pub next: Option<String>,
}

/// Only same-site absolute paths are followed after login.
fn safe_next(next: Option<&str>) -> &str {
    match next {
        Some(n) if n.starts_with('/') && !n.starts_with("//") && !n.contains('\\') => n,
        _ => "/",
    }
}

pub async fn login_page() -> Response {
    (
        NO_STORE,
        "pocketrig control API\nPOST the form field `password` to /login to sign in.\n",
    )
        .into_response()
}

pub async fn login(
    State(state): State<ControlState>,
    Query(query): Query<NextQuery>,
    Form(form): Form<LoginForm>,
) -> Response {
    let config = state.supervisor.config();
    if !constant_time_eq(form.password.as_bytes(), config.login_password.as_bytes()) {
        warn!("failed login attempt");
        tokio::time::sleep(config.timings.failed_login_delay).await;
        return (StatusCode::UNAUTHORIZED, NO_STORE, "invalid password").into_response();
    }

    let session = state.gate.sessions.create(Instant::now());
    let target = safe_next(query.next.as_deref());
    info!(next = target, "login succeeded");
    let cookie = format!("{SESSION_COOKIE}={session}; Path=/; HttpOnly; SameSite=Strict");
    (
        StatusCode::SEE_OTHER,
        [
            (header::LOCATION, target.to_string()),
            (header::SET_COOKIE, cookie),
            (header::HeaderName::from_static(CSRF_HEADER), state.gate.csrf_token().to_string()),
        ],
    )
        .into_response()
}

/// Session keep-alive. The idle guard already refreshed the session.
pub async fn activity(State(state): State<ControlState>, headers: HeaderMap) -> Response {
    if state.gate.session_of(&headers).is_some() {
        "ok".into_response()
    } else {
        (StatusCode::UNAUTHORIZED, "no").into_response()
    }
}

pub async fn csrf_token(State(state): State<ControlState>) -> Response {
    (NO_STORE, Json(json!({ "csrf_token": state.gate.csrf_token() }))).into_response()
}

pub async fn index(State(state): State<ControlState>) -> Response {
    let mode = if state.supervisor.mode().is_hidden() {
        "hidden"
    } else {
        "visible"
    };
    format!(
        "pocketrig control API ({mode} mode)\nGET /status, /netinfo, /csrf\nPOST /ensure_comfy, /ensure_mini, /ensure_gallery, /restart, /stop, /shutdown, /relaunch_hidden_full, /relaunch_visible_full\n"
    )
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::safe_next;

    #[test]
    fn next_must_be_a_local_path() {
        assert_eq!(safe_next(None), "/");
        assert_eq!(safe_next(Some("/status")), "/status");
        assert_eq!(safe_next(Some("//evil.example")), "/");
        assert_eq!(safe_next(Some("https://evil.example")), "/");
        assert_eq!(safe_next(Some("/\\evil")), "/");
    }
}
