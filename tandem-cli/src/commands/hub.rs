//! Hub commands: record a session, probe a device.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tandem_core::MonotonicClock;
use tandem_hub::http::serve_http;
use tandem_hub::{spawn_liveness_task, Config, HubController, JobStatus};
use tokio::net::TcpListener;

/// Record one session across `devices` for `seconds`, then collect the
/// archives.
pub async fn record(
    config: Config,
    devices: &[String],
    seconds: u64,
    tag: Option<&str>,
    transfer_timeout: u64,
) -> Result<()> {
    let hub = Arc::new(
        HubController::bind(config, Arc::new(MonotonicClock::new()))
            .await
            .context("Failed to start hub")?,
    );

    let liveness = spawn_liveness_task(hub.clone(), hub.config().liveness.clone());
    let http = if hub.config().http.enabled {
        let bind = hub.config().http.bind_address.clone();
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("Failed to bind HTTP on {}", bind))?;
        println!("HTTP status on http://{}", listener.local_addr()?);
        let hub = hub.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = serve_http(listener, hub).await {
                tracing::error!("HTTP server stopped: {}", e);
            }
        }))
    } else {
        None
    };

    if let Some(mut events) = hub.take_events() {
        tokio::spawn(async move {
            while let Some(ev) = events.recv().await {
                tracing::debug!("Event {} from {}", ev.event.name, ev.device_id);
            }
        });
    }

    for addr in devices {
        let id = hub
            .connect(addr)
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?;
        println!("Connected {} ({})", id, addr);
    }

    let start = hub.start_session(tag).await.context("Failed to start session")?;
    println!();
    println!("Session {}", start.session_id);
    for (device, offset) in &start.offsets {
        println!("  {:<20} offset {} ns", device, offset);
    }
    for (device, err) in start.report.failed() {
        println!("  {:<20} FAILED to start: {}", device, err);
    }
    if start.report.succeeded().is_empty() {
        bail!("No device started recording");
    }

    match hub.flash_sync().await {
        Ok(report) => {
            for (device, ts) in report.values() {
                tracing::debug!("Flash sync {} at {}", device, ts);
            }
        }
        Err(e) => tracing::warn!("Flash sync failed: {}", e),
    }

    println!();
    println!("Recording for {}s (Ctrl-C to stop early)...", seconds);
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
        _ = tokio::signal::ctrl_c() => {
            println!("Interrupted, stopping");
        }
    }

    let stop = hub.stop_session().await.context("Failed to stop session")?;
    for (device, err) in stop.report.failed() {
        println!("  {:<20} FAILED to stop: {}", device, err);
    }

    let requested = hub
        .request_transfers(Some(&stop.session_id))
        .await
        .context("Failed to request transfers")?;
    for (device, err) in requested.failed() {
        println!("  {:<20} transfer request failed: {}", device, err);
    }

    println!("Waiting for transfers...");
    let jobs = hub
        .wait_for_transfers(&stop.session_id, Duration::from_secs(transfer_timeout))
        .await;

    println!();
    println!("=== Session {} ===", stop.session_id);
    match jobs {
        Ok(jobs) => {
            for job in &jobs {
                match &job.status {
                    JobStatus::Completed { files } => println!(
                        "  {:<20} {} bytes, {} files",
                        job.device_id, job.bytes, files
                    ),
                    JobStatus::Failed { reason } => {
                        println!("  {:<20} FAILED: {}", job.device_id, reason)
                    }
                    other => println!("  {:<20} {:?}", job.device_id, other),
                }
            }
        }
        Err(e) => println!("  Transfers incomplete: {}", e),
    }
    println!(
        "  Data: {}",
        hub.store().session_dir(&stop.session_id).display()
    );

    liveness.abort();
    if let Some(http) = http {
        http.abort();
    }
    Ok(())
}

/// Query one device's capabilities and measure its clock offset.
pub async fn probe(config: Config, device: &str, udp: Option<&str>) -> Result<()> {
    let hub = HubController::bind(config, Arc::new(MonotonicClock::new()))
        .await
        .context("Failed to start hub")?;

    let id = hub
        .connect(device)
        .await
        .with_context(|| format!("Failed to connect to {}", device))?;
    let Some(session) = hub.device(&id) else {
        bail!("Device {} vanished after connecting", id);
    };

    println!("=== Device {} ===", id);
    if let Some(caps) = session.capabilities() {
        println!("  Model:     {}", caps.device_model);
        if let Some(sdk) = caps.android_sdk {
            println!("  SDK:       {}", sdk);
        }
        println!(
            "  Sensors:   rgb={} thermal={} gsr={}",
            caps.has_rgb, caps.has_thermal, caps.has_gsr
        );
        println!("  Cameras:   {}", caps.cameras.len());
    }
    println!("  Status:    {:?}", session.status());

    let record = hub
        .clock_sync()
        .sync_once(&session)
        .await
        .context("Clock probe failed")?;
    println!("  Offset:    {} ns", record.offset_ns);
    println!("  Delay:     {} ns", record.delay_ns);

    if let Some(addr) = udp {
        let key = format!("{}/udp", id);
        let record = hub
            .clock_sync()
            .sync_udp(&key, addr)
            .await
            .with_context(|| format!("UDP probe of {} failed", addr))?;
        println!("  UDP:       {} ns (delay {} ns)", record.offset_ns, record.delay_ns);
    }

    session.close().await;
    Ok(())
}
