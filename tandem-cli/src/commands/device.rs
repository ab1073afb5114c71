//! Run a simulated device.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tandem_core::{Clock, MonotonicClock};
use tandem_spoke::{AgentConfig, DeviceAgent, SampledStream, SyntheticGsr};

/// Arguments for the `device` command.
#[derive(Debug)]
pub struct DeviceArgs {
    pub listen: SocketAddr,
    pub data_dir: PathBuf,
    pub device_id: String,
    pub model: Option<String>,
    pub time_echo: SocketAddr,
    pub rate_hz: f64,
}

/// Serve the device until Ctrl-C.
pub async fn run(args: DeviceArgs) -> Result<()> {
    std::fs::create_dir_all(&args.data_dir).with_context(|| {
        format!("Failed to create data directory {}", args.data_dir.display())
    })?;

    let mut config = AgentConfig::new(&args.device_id, &args.data_dir)
        .with_listen_addr(args.listen)
        .with_time_echo(args.time_echo)
        .with_sensors(false, false, true);
    if let Some(model) = &args.model {
        config = config.with_model(model);
    }

    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let gsr = SampledStream::new("gsr", SyntheticGsr, args.rate_hz, clock.clone());
    let agent = DeviceAgent::with_clock(config, vec![Box::new(gsr)], clock);

    println!("Device {} on {}", args.device_id, args.listen);
    println!("  Data:      {}", args.data_dir.display());
    println!("  Time echo: udp://{}", args.time_echo);
    println!("  GSR rate:  {} Hz", args.rate_hz);
    println!();
    println!("Press Ctrl-C to stop.");

    tokio::select! {
        result = agent.run() => {
            result.context("Device agent stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down device {}", args.device_id);
        }
    }

    Ok(())
}
