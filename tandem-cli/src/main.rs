//! # tandem
//!
//! Command-line front end for the tandem recording protocol.
//!
//! ## Commands
//!
//! - `device`: Run a simulated device with a synthetic GSR sensor
//! - `hub record`: Record one session across a set of devices
//! - `hub probe`: Query one device and measure its clock offset
//!
//! ## Example
//!
//! ```bash
//! # Two simulated devices
//! tandem device --listen 127.0.0.1:8080 --data-dir ./dev-a --device-id dev-a
//! tandem device --listen 127.0.0.1:8081 --data-dir ./dev-b --device-id dev-b
//!
//! # Record for ten seconds and collect the data
//! tandem hub record --device 127.0.0.1:8080 --device 127.0.0.1:8081 --seconds 10
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tandem_hub::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

use commands::{device, hub};

/// Run a tandem hub or a simulated tandem device.
#[derive(Parser, Debug)]
#[command(name = "tandem")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a simulated device
    Device {
        /// Control listener address
        #[arg(long, default_value = "0.0.0.0:8080")]
        listen: SocketAddr,

        /// Directory sessions are recorded into
        #[arg(long)]
        data_dir: PathBuf,

        /// Device identifier
        #[arg(long, default_value = "tandem-device")]
        device_id: String,

        /// Model string reported in capabilities
        #[arg(long)]
        model: Option<String>,

        /// UDP time echo address (defaults to the listen address)
        #[arg(long)]
        time_echo: Option<SocketAddr>,

        /// Synthetic GSR sample rate
        #[arg(long, default_value = "128")]
        rate_hz: f64,
    },

    /// Hub operations
    Hub {
        /// Hub configuration file (TOML)
        #[arg(long, global = true)]
        config: Option<PathBuf>,

        #[command(subcommand)]
        command: HubCommands,
    },
}

#[derive(Subcommand, Debug)]
enum HubCommands {
    /// Record one session across devices and collect the data
    Record {
        /// Device control address (repeatable)
        #[arg(long = "device", required = true)]
        devices: Vec<String>,

        /// Recording length in seconds
        #[arg(long, default_value = "10")]
        seconds: u64,

        /// Tag embedded in the session id
        #[arg(long)]
        tag: Option<String>,

        /// Seconds to wait for all transfers
        #[arg(long, default_value = "60")]
        transfer_timeout: u64,
    },

    /// Query one device and measure its clock offset
    Probe {
        /// Device control address
        #[arg(long)]
        device: String,

        /// Also probe the device's UDP time echo at this address
        #[arg(long)]
        udp: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Device {
            listen,
            data_dir,
            device_id,
            model,
            time_echo,
            rate_hz,
        } => {
            device::run(device::DeviceArgs {
                listen,
                data_dir,
                device_id,
                model,
                time_echo: time_echo.unwrap_or(listen),
                rate_hz,
            })
            .await?;
        }
        Commands::Hub { config, command } => {
            let config = load_config(config.as_deref())?;
            match command {
                HubCommands::Record {
                    devices,
                    seconds,
                    tag,
                    transfer_timeout,
                } => {
                    hub::record(
                        config,
                        &devices,
                        seconds,
                        tag.as_deref(),
                        transfer_timeout,
                    )
                    .await?;
                }
                HubCommands::Probe { device, udp } => {
                    hub::probe(config, &device, udp.as_deref()).await?;
                }
            }
        }
    }

    Ok(())
}

/// Load the hub configuration, or defaults when no file is given.
fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(Config::default()),
    }
}
