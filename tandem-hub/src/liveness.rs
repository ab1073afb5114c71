//! Background liveness monitor.
//!
//! Periodically reports devices that have gone silent, and those that
//! recover. Observation only; devices are never disconnected from here.

use crate::config::LivenessConfig;
use crate::controller::HubController;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// Spawn the liveness monitor.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_liveness_task(
    hub: Arc<HubController>,
    config: LivenessConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("Liveness monitor disabled");
            return;
        }

        let threshold = config.stale_after();
        tracing::info!(
            "Liveness monitor started (interval: {}ms, stale after: {}ms)",
            config.check_interval_ms,
            config.stale_after_ms
        );

        let mut timer = interval(Duration::from_millis(config.check_interval_ms));
        let mut stale = BTreeSet::new();

        loop {
            timer.tick().await;
            stale = check(&hub, threshold, stale);
        }
    })
}

/// One pass: log transitions and return the new stale set.
fn check(hub: &HubController, threshold: Duration, previous: BTreeSet<String>) -> BTreeSet<String> {
    let now: BTreeSet<String> = hub.stale_devices(threshold).into_iter().collect();

    for id in now.difference(&previous) {
        tracing::warn!("Device {} is stale (no message for over {:?})", id, threshold);
    }
    for id in previous.difference(&now) {
        tracing::info!("Device {} is responsive again", id);
    }
    if now.is_empty() {
        tracing::debug!("Liveness: all devices responsive");
    }
    now
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ServerConfig, TransferConfig};
    use crate::device::DeviceSession;
    use tandem_core::MonotonicClock;
    use tandem_types::{
        read_message, write_message, Ack, Capabilities, ControlMessage, Framing,
        DEFAULT_MAX_FRAME_LEN,
    };
    use tokio::io::BufReader;

    async fn hub(root: &std::path::Path) -> Arc<HubController> {
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

    /// Device that answers the capability query and then goes quiet.
    async fn quiet_device(hub: &HubController, id: &str) {
        let (hub_side, device_side) = tokio::io::duplex(16 * 1024);
        let caps = Capabilities {
            device_id: id.into(),
            device_model: "quiet".into(),
            android_sdk: None,
            service_port: None,
            has_rgb: false,
            has_thermal: false,
            has_gsr: false,
            cameras: Vec::new(),
        };
        tokio::spawn(async move {
            let (r, mut w) = tokio::io::split(device_side);
            let mut r = BufReader::new(r);
            while let Ok(ControlMessage::Command(cmd)) =
                read_message(&mut r, DEFAULT_MAX_FRAME_LEN).await
            {
                let ack = Ack::ok(cmd.id)
                    .with_field("capabilities", serde_json::to_value(&caps).unwrap());
                let _ = write_message(&mut w, &ControlMessage::Ack(ack), Framing::LengthPrefixed).await;
            }
        });
        let (options, sink) = hub.device_options();
        let session = DeviceSession::from_stream(hub_side, id, options, Some(sink), hub.metrics().clone());
        hub.attach(session).await.unwrap();
    }

    #[tokio::test]
    async fn liveness_task_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let config = LivenessConfig {
            enabled: false,
            ..LivenessConfig::default()
        };

        let handle = spawn_liveness_task(hub(dir.path()).await, config);

        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("Task should complete when disabled")
            .expect("Task should not panic");
    }

    #[tokio::test]
    async fn silent_device_becomes_stale_and_stays_connected() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(dir.path()).await;
        quiet_device(&hub, "dev-q").await;

        let threshold = Duration::from_millis(50);
        let stale = check(&hub, threshold, BTreeSet::new());
        assert!(stale.is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let stale = check(&hub, threshold, stale);
        assert!(stale.contains("dev-q"));
        assert!(hub.device("dev-q").unwrap().is_connected());
    }

    #[tokio::test]
    async fn running_task_can_be_aborted() {
        let dir = tempfile::tempdir().unwrap();
        let config = LivenessConfig {
            enabled: true,
            stale_after_ms: 10,
            check_interval_ms: 10,
        };
        let handle = spawn_liveness_task(hub(dir.path()).await, config);
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
    }
}
