//! Prometheus metrics endpoint.

use crate::controller::HubController;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::fmt::Write;
use std::sync::Arc;
use tandem_core::DeviceStatus;

/// Prometheus metrics handler.
///
/// Returns metrics in Prometheus text format.
/// Includes both gauges (current state) and counters (monotonic since startup).
pub async fn metrics_handler(Extension(hub): Extension<Arc<HubController>>) -> impl IntoResponse {
    let m = hub.metrics().snapshot();

    // Gauges: current state
    let devices = hub.snapshot();
    let count = |status: DeviceStatus| devices.iter().filter(|d| d.status == status).count();
    let stale = devices.iter().filter(|d| d.stale).count();
    let active = u8::from(hub.active_session().is_some());
    let jobs_open = hub
        .receiver()
        .jobs()
        .iter()
        .filter(|j| !j.status.is_finished())
        .count();

    let mut body = format!(
        r#"# HELP tandem_hub_info Hub information
# TYPE tandem_hub_info gauge
tandem_hub_info{{version="{version}"}} 1

# HELP tandem_hub_devices Registered devices by status
# TYPE tandem_hub_devices gauge
tandem_hub_devices{{status="idle"}} {idle}
tandem_hub_devices{{status="preparing"}} {preparing}
tandem_hub_devices{{status="recording"}} {recording}
tandem_hub_devices{{status="stopping"}} {stopping}
tandem_hub_devices{{status="disconnected"}} {disconnected}

# HELP tandem_hub_devices_stale Connected devices silent beyond the staleness threshold
# TYPE tandem_hub_devices_stale gauge
tandem_hub_devices_stale {stale}

# HELP tandem_hub_session_active Whether a session is recording
# TYPE tandem_hub_session_active gauge
tandem_hub_session_active {active}

# HELP tandem_hub_transfers_in_progress Transfer jobs not yet finished
# TYPE tandem_hub_transfers_in_progress gauge
tandem_hub_transfers_in_progress {jobs_open}

# HELP tandem_hub_connections_total Device control connections established
# TYPE tandem_hub_connections_total counter
tandem_hub_connections_total {connections}

# HELP tandem_hub_commands_sent_total Commands written to devices
# TYPE tandem_hub_commands_sent_total counter
tandem_hub_commands_sent_total {sent}

# HELP tandem_hub_commands_timed_out_total Commands without a reply within the budget
# TYPE tandem_hub_commands_timed_out_total counter
tandem_hub_commands_timed_out_total {timed_out}

# HELP tandem_hub_commands_rejected_total Commands answered with an error
# TYPE tandem_hub_commands_rejected_total counter
tandem_hub_commands_rejected_total {rejected}

# HELP tandem_hub_events_received_total Events received from devices
# TYPE tandem_hub_events_received_total counter
tandem_hub_events_received_total {events}

# HELP tandem_hub_events_dropped_total Events dropped because the sink was full
# TYPE tandem_hub_events_dropped_total counter
tandem_hub_events_dropped_total {dropped}

# HELP tandem_hub_transfers_completed_total Archives received and unpacked
# TYPE tandem_hub_transfers_completed_total counter
tandem_hub_transfers_completed_total {completed}

# HELP tandem_hub_transfers_failed_total Transfers that failed
# TYPE tandem_hub_transfers_failed_total counter
tandem_hub_transfers_failed_total {failed}

# HELP tandem_hub_bytes_received_total Archive bytes received
# TYPE tandem_hub_bytes_received_total counter
tandem_hub_bytes_received_total {bytes}
"#,
        version = env!("CARGO_PKG_VERSION"),
        idle = count(DeviceStatus::Idle),
        preparing = count(DeviceStatus::Preparing),
        recording = count(DeviceStatus::Recording),
        stopping = count(DeviceStatus::Stopping),
        disconnected = count(DeviceStatus::Disconnected),
        connections = m.connections_total,
        sent = m.commands_sent,
        timed_out = m.commands_timed_out,
        rejected = m.commands_rejected,
        events = m.events_received,
        dropped = m.events_dropped,
        completed = m.transfers_completed,
        failed = m.transfers_failed,
        bytes = m.bytes_received,
    );

    let synced: Vec<_> = devices
        .iter()
        .filter_map(|d| d.clock.map(|c| (d.device_id.as_str(), c.offset_ns)))
        .collect();
    if !synced.is_empty() {
        body.push_str(
            "\n# HELP tandem_hub_clock_offset_ns Device clock minus hub clock\n\
             # TYPE tandem_hub_clock_offset_ns gauge\n",
        );
        for (id, offset) in synced {
            let _ = writeln!(body, "tandem_hub_clock_offset_ns{{device=\"{id}\"}} {offset}");
        }
    }

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

#[cfg(test)]
mod tests {
    #[test]
    fn prometheus_label_escaping() {
        let sample = format!("tandem_hub_devices{{status=\"{}\"}} {}", "idle", 2);
        assert_eq!(sample, "tandem_hub_devices{status=\"idle\"} 2");
    }
}
