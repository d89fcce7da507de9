pub mod auth;
pub mod control;
pub mod files;
pub mod status;

use std::sync::Arc;

use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use super::security::{self, SecurityGate};
use crate::folders::FolderGuard;
use crate::orchestrator::Supervisor;

#[derive(Clone)]
pub struct ControlState {
    pub supervisor: Supervisor,
    pub gate: Arc<SecurityGate>,
    pub folders: Arc<FolderGuard>,
}

impl ControlState {
    pub fn new(supervisor: Supervisor) -> Self {
        let config = supervisor.config();
        let gate = Arc::new(SecurityGate::new(config.session_idle_timeout));
        let folders = Arc::new(FolderGuard::new(config.folder_target()));
        Self {
            supervisor,
            gate,
            folders,
        }
    }
}

/// The full control API with its guards. Request order through the layers:
/// trace, CSRF, rate limit, idle expiry, then the login check on protected
/// routes.
pub fn control_router(state: ControlState) -> Router {
    let protected = Router::new()
        .route("/", get(auth::index))
        .route("/csrf", get(auth::csrf_token))
        .route("/status", get(status::get_status))
        .route("/netinfo", get(status::get_netinfo))
        .route("/ensure_comfy", post(control::ensure_comfy))
        .route("/ensure_mini", post(control::ensure_mini))
        .route("/ensure_gallery", post(control::ensure_gallery))
        .route("/restart", post(control::restart))
        .route("/stop", post(control::stop))
        .route("/shutdown", post(control::shutdown))
        .route("/relaunch_hidden_full", post(control::relaunch_hidden))
        .route("/relaunch_visible_full", post(control::relaunch_visible))
        .route("/checkpw", post(files::checkpw))
        .route("/delete", post(files::delete_folder))
        .route("/recreate", post(files::recreate_folder))
        .route_layer(from_fn_with_state(state.clone(), security::require_login));

    let public = Router::new()
        .route("/login", get(auth::login_page).post(auth::login))
        .route("/activity", post(auth::activity));

    Router::new()
        .merge(protected)
        .merge(public)
        .layer(from_fn_with_state(state.clone(), security::idle_guard))
        .layer(from_fn_with_state(state.clone(), security::rate_limit))
        .layer(from_fn_with_state(state.clone(), security::csrf_guard))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
