use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ControlState;
use crate::config::model::Role;
use crate::orchestrator::table::SlotView;
use crate::platform;

#[derive(Debug, Serialize)]
pub struct StatusBody {
    pub comfy: bool,
    pub mini: bool,
    pub gallery: bool,
    pub mode_hidden: bool,
    pub started_at: DateTime<Utc>,
    /// Children spawned by this instance.
    pub processes: Vec<SlotView>,
}

#[derive(Debug, Serialize)]
pub struct NetInfoBody {
    pub lan_ip: String,
    pub control_port: u16,
    pub comfy_port: Option<u16>,
    pub mini_port: Option<u16>,
    pub gallery_port: Option<u16>,
    pub comfy_running: bool,
    pub mini_running: bool,
    pub gallery_running: bool,
}

pub async fn get_status(State(state): State<ControlState>) -> Json<StatusBody> {
    let sup = &state.supervisor;
    let (comfy, mini, gallery) = tokio::join!(
        sup.refresh_status(Role::Comfy),
        sup.refresh_status(Role::Mini),
        sup.refresh_status(Role::Gallery),
    );
    Json(StatusBody {
        comfy,
        mini,
        gallery,
        mode_hidden: sup.mode().is_hidden(),
        started_at: sup.started_at(),
        processes: sup.table().snapshot(),
    })
}

pub async fn get_netinfo(State(state): State<ControlState>) -> Json<NetInfoBody> {
    let sup = &state.supervisor;
    let lan_ip = tokio::task::spawn_blocking(platform::lan_ip)
        .await
        .unwrap_or_else(|_| "127.0.0.1".to_string());
    let (comfy, mini, gallery) = tokio::join!(
        sup.port_info(Role::Comfy),
        sup.port_info(Role::Mini),
        sup.port_info(Role::Gallery),
    );
    Json(NetInfoBody {
        lan_ip,
        control_port: sup.config().control_port,
        comfy_port: comfy.port,
        mini_port: mini.port,
        gallery_port: gallery.port,
        comfy_running: comfy.running,
        mini_running: mini.running,
        gallery_running: gallery.running,
    })
}
