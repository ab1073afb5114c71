//! Health check endpoint.

use crate::controller::HubController;
use axum::{Extension, Json};
use serde::Serialize;
use std::sync::Arc;

/// Health status response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Overall status.
    pub status: String,
    /// Hub version.
    pub version: String,
    /// Number of connected devices.
    pub devices: usize,
    /// Running session, if any.
    pub active_session: Option<String>,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
}

/// Health check handler.
pub async fn health_handler(Extension(hub): Extension<Arc<HubController>>) -> Json<HealthStatus> {
    let devices = hub.snapshot();
    let connected = devices
        .iter()
        .filter(|d| d.status != tandem_core::DeviceStatus::Disconnected)
        .count();

    Json(HealthStatus {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        devices: connected,
        active_session: hub.active_session().map(|s| s.session_id),
        uptime_seconds: hub.uptime().as_secs(),
    })
}
