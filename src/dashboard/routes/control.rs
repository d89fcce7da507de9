//! Lifecycle endpoints. The ensure routes spawn inline and leave the
//! readiness wait to a background worker; the rest hand their whole flow to
//! one and acknowledge immediately.

use axum::extract::State;
use axum::http::StatusCode;
use tracing::{error, info};

use super::ControlState;
use crate::config::model::Role;
use crate::relaunch::{Relauncher, RunMode};

type EnsureReply = Result<&'static str, (StatusCode, &'static str)>;

async fn ensure(state: &ControlState, role: Role) -> EnsureReply {
    match state.supervisor.ensure_detached(role).await {
        Ok(ack) => {
            info!(role = %role, ?ack, "ensure accepted");
            Ok("success")
        }
        Err(e) => {
            error!(role = %role, "ensure failed: {}", e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, "fail"))
        }
    }
}

pub async fn ensure_comfy(State(state): State<ControlState>) -> EnsureReply {
    ensure(&state, Role::Comfy).await
}

pub async fn ensure_mini(State(state): State<ControlState>) -> EnsureReply {
    ensure(&state, Role::Mini).await
}

pub async fn ensure_gallery(State(state): State<ControlState>) -> EnsureReply {
    ensure(&state, Role::Gallery).await
}

pub async fn restart(State(state): State<ControlState>) -> &'static str {
    let supervisor = state.supervisor.clone();
    state.supervisor.spawn_background(async move {
        info!("restart requested");
        supervisor.restart().await;
    });
    "success"
}

pub async fn stop(State(state): State<ControlState>) -> &'static str {
    let supervisor = state.supervisor.clone();
    state.supervisor.spawn_background(async move {
        info!("stop requested");
        supervisor.stop_all().await;
    });
    "success"
}

pub async fn shutdown(State(state): State<ControlState>) -> &'static str {
    let relauncher = Relauncher::new(state.supervisor.clone());
    state.supervisor.spawn_background(async move {
        info!("shutdown requested");
        relauncher.shutdown().await;
    });
    "success"
}

fn spawn_relaunch(state: &ControlState, mode: RunMode) -> &'static str {
    let relauncher = Relauncher::new(state.supervisor.clone());
    state.supervisor.spawn_background(async move {
        info!(?mode, "relaunch requested");
        relauncher.relaunch_logged(mode).await;
    });
    "success"
}

pub async fn relaunch_hidden(State(state): State<ControlState>) -> &'static str {
    spawn_relaunch(&state, RunMode::Hidden)
}

pub async fn relaunch_visible(State(state): State<ControlState>) -> &'static str {
    spawn_relaunch(&state, RunMode::Visible)
}
