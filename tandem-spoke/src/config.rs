//! Device agent configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tandem_types::{Framing, DEFAULT_MAX_FRAME_LEN};

/// Configuration for [`DeviceAgent`](crate::DeviceAgent).
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Address the control listener binds to.
    pub listen_addr: SocketAddr,
    /// Root directory; each session records into `data_dir/<session_id>`.
    pub data_dir: PathBuf,
    /// Identifier reported in capabilities, heartbeats and transfers.
    pub device_id: String,
    /// Human-readable model string.
    pub device_model: String,
    /// Platform SDK level to report, if any.
    pub android_sdk: Option<u32>,
    /// Device has an RGB camera.
    pub has_rgb: bool,
    /// Device has a thermal imager.
    pub has_thermal: bool,
    /// Device has a GSR sensor.
    pub has_gsr: bool,
    /// Opaque camera descriptors for `query_capabilities`.
    pub cameras: Vec<serde_json::Value>,
    /// Framing used for replies and events.
    pub framing: Framing,
    /// Largest accepted control message.
    pub max_frame_len: usize,
    /// Interval between heartbeat events (`None` disables them).
    pub heartbeat_interval: Option<Duration>,
    /// UDP time echo bind address (`None` disables it).
    pub time_echo_addr: Option<SocketAddr>,
    /// Timeout to establish a transfer connection.
    pub transfer_connect_timeout: Duration,
    /// Timeout for each write during a transfer.
    pub transfer_write_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            data_dir: PathBuf::from("tandem-data"),
            device_id: "tandem-device".to_string(),
            device_model: "tandem simulated device".to_string(),
            android_sdk: None,
            has_rgb: false,
            has_thermal: false,
            has_gsr: false,
            cameras: Vec::new(),
            framing: Framing::LengthPrefixed,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            heartbeat_interval: Some(Duration::from_secs(3)),
            time_echo_addr: None,
            transfer_connect_timeout: Duration::from_secs(2),
            transfer_write_timeout: Duration::from_secs(5),
        }
    }
}

impl AgentConfig {
    /// Create a configuration for the given device id and data directory.
    pub fn new(device_id: &str, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            device_id: device_id.to_string(),
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Set the control listener address.
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Set the model string.
    pub fn with_model(mut self, model: &str) -> Self {
        self.device_model = model.to_string();
        self
    }

    /// Declare sensor capabilities.
    pub fn with_sensors(mut self, rgb: bool, thermal: bool, gsr: bool) -> Self {
        self.has_rgb = rgb;
        self.has_thermal = thermal;
        self.has_gsr = gsr;
        self
    }

    /// Set the reply framing.
    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    /// Set (or disable) the heartbeat interval.
    pub fn with_heartbeat(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Enable the UDP time echo on `addr`.
    pub fn with_time_echo(mut self, addr: SocketAddr) -> Self {
        self.time_echo_addr = Some(addr);
        self
    }

    /// Set transfer timeouts.
    pub fn with_transfer_timeouts(mut self, connect: Duration, write: Duration) -> Self {
        self.transfer_connect_timeout = connect;
        self.transfer_write_timeout = write;
        self
    }

    /// Directory a session records into.
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.data_dir.join(session_id)
    }
}
