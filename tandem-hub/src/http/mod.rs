//! HTTP status endpoints for the tandem hub.
//!
//! Provides health checks, Prometheus metrics and a per-device view.

pub mod health;
mod metrics;

use crate::controller::{DeviceSnapshot, HubController};
use axum::{routing::get, Extension, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tandem_core::SessionStatus;
use tokio::net::TcpListener;

pub use health::HealthStatus;

/// Build the HTTP router with all endpoints.
pub fn build_router(hub: Arc<HubController>) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/devices", get(devices_handler))
        .layer(Extension(hub))
}

/// Serve the status endpoints on `listener` until the task is dropped.
pub async fn serve_http(listener: TcpListener, hub: Arc<HubController>) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Status endpoint listening on http://{}", addr);
    }
    axum::serve(listener, build_router(hub)).await
}

/// Response of `GET /devices`.
#[derive(Debug, Clone, Serialize)]
pub struct DevicesReport {
    /// Aggregate over every registered device.
    pub session: SessionStatus,
    /// Running session id, if any.
    pub active_session: Option<String>,
    /// Per-device state.
    pub devices: Vec<DeviceSnapshot>,
}

async fn devices_handler(Extension(hub): Extension<Arc<HubController>>) -> Json<DevicesReport> {
    Json(DevicesReport {
        session: hub.session_status(),
        active_session: hub.active_session().map(|s| s.session_id),
        devices: hub.snapshot(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ServerConfig, TransferConfig};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tandem_core::MonotonicClock;
    use tower::util::ServiceExt;

    async fn test_hub(root: &std::path::Path) -> Arc<HubController> {
        let config = Config {
            server: ServerConfig {
                advertise_host: "127.0.0.1".into(),
                transfer_bind: "127.0.0.1:0".into(),
            },
            transfer: TransferConfig {
                sessions_root: root.to_path_buf(),
                ..TransferConfig::default()
            },
            ..Config::default()
        };
        Arc::new(
            HubController::bind(config, Arc::new(MonotonicClock::new()))
                .await
                .unwrap(),
        )
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_hub(dir.path()).await);

        let (status, body) = get_body(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"status\":\"ok\""), "{body}");
        assert!(body.contains("\"devices\":0"), "{body}");
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_ok() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_hub(dir.path()).await);

        let (status, body) = get_body(app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("tandem_hub_commands_sent_total 0"), "{body}");
    }

    #[tokio::test]
    async fn devices_endpoint_reports_aggregate() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_hub(dir.path()).await);

        let (status, body) = get_body(app, "/devices").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["session"]["status"], "idle");
        assert_eq!(json["devices"], serde_json::json!([]));
        assert!(json["active_session"].is_null());
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_hub(dir.path()).await);

        let (status, _) = get_body(app, "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
