//! Configuration loading for the tandem hub.
//!
//! Configuration is loaded from a TOML file (default: `hub.toml`). Every
//! section and every field is optional; missing values take the defaults
//! below.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for the hub.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Network configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Control protocol configuration.
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Clock synchronization configuration.
    #[serde(default)]
    pub clock: ClockConfig,
    /// File transfer configuration.
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Device liveness configuration.
    #[serde(default)]
    pub liveness: LivenessConfig,
    /// HTTP status endpoint configuration.
    #[serde(default)]
    pub http: HttpConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host devices should send transfers to (default: 127.0.0.1).
    #[serde(default = "default_advertise_host")]
    pub advertise_host: String,
    /// Bind address of the transfer receiver (default: 0.0.0.0:8082).
    #[serde(default = "default_transfer_bind")]
    pub transfer_bind: String,
}

/// Control protocol configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolConfig {
    /// Largest accepted control message in bytes (default: 4MB).
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Per-command response budget in milliseconds (default: 10000).
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Allow more than one outstanding command per device (default: false).
    #[serde(default)]
    pub pipelining: bool,
}

/// Clock synchronization configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClockConfig {
    /// Budget for one sync probe in milliseconds (default: 1500).
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
    /// Probes per device per sync round (default: 1).
    #[serde(default = "default_probes")]
    pub probes: usize,
    /// Fraction trimmed from each end when `probes > 1` (default: 0.1).
    #[serde(default = "default_trim_ratio")]
    pub trim_ratio: f64,
    /// Run a sync round before every session start (default: true).
    #[serde(default = "default_true")]
    pub sync_before_start: bool,
}

/// File transfer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    /// Directory holding one subdirectory per session (default: sessions).
    #[serde(default = "default_sessions_root")]
    pub sessions_root: PathBuf,
    /// Connect timeout devices are expected to honor, in milliseconds (default: 2000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Per-read timeout while receiving, in milliseconds (default: 5000).
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Longest accepted header line in bytes (default: 1MB).
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
}

/// Device liveness configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LivenessConfig {
    /// Run the liveness monitor (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Silence after which a device is reported stale, in milliseconds (default: 9000).
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
    /// Monitor interval in milliseconds (default: 3000).
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
}

/// HTTP status endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Serve the status endpoint (default: false).
    #[serde(default)]
    pub enabled: bool,
    /// Bind address for the HTTP server (default: 127.0.0.1:8090).
    #[serde(default = "default_http_bind")]
    pub bind_address: String,
}

// Default value functions
fn default_advertise_host() -> String {
    "127.0.0.1".to_string()
}

fn default_transfer_bind() -> String {
    "0.0.0.0:8082".to_string()
}

fn default_max_frame_bytes() -> usize {
    4 * 1024 * 1024 // 4MB
}

fn default_command_timeout_ms() -> u64 {
    10_000
}

fn default_sync_timeout_ms() -> u64 {
    1_500
}

fn default_probes() -> usize {
    1
}

fn default_trim_ratio() -> f64 {
    0.1
}

fn default_true() -> bool {
    true
}

fn default_sessions_root() -> PathBuf {
    PathBuf::from("sessions")
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

fn default_read_timeout_ms() -> u64 {
    5_000
}

fn default_max_header_bytes() -> usize {
    1024 * 1024 // 1MB
}

fn default_stale_after_ms() -> u64 {
    9_000
}

fn default_check_interval_ms() -> u64 {
    3_000
}

fn default_http_bind() -> String {
    "127.0.0.1:8090".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            advertise_host: default_advertise_host(),
            transfer_bind: default_transfer_bind(),
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: default_max_frame_bytes(),
            command_timeout_ms: default_command_timeout_ms(),
            pipelining: false,
        }
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            sync_timeout_ms: default_sync_timeout_ms(),
            probes: default_probes(),
            trim_ratio: default_trim_ratio(),
            sync_before_start: true,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            sessions_root: default_sessions_root(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            max_header_bytes: default_max_header_bytes(),
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stale_after_ms: default_stale_after_ms(),
            check_interval_ms: default_check_interval_ms(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: default_http_bind(),
        }
    }
}

impl ProtocolConfig {
    /// Command budget as a [`Duration`].
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl ClockConfig {
    /// Probe budget as a [`Duration`].
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}

impl TransferConfig {
    /// Per-read budget as a [`Duration`].
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Connect budget as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl LivenessConfig {
    /// Staleness threshold as a [`Duration`].
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the hub misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| {
            Err(ConfigError::Invalid {
                reason: reason.to_string(),
            })
        };
        if self.protocol.max_frame_bytes == 0 {
            return invalid("protocol.max_frame_bytes must be positive");
        }
        if self.protocol.command_timeout_ms == 0 {
            return invalid("protocol.command_timeout_ms must be positive");
        }
        if self.clock.sync_timeout_ms == 0 {
            return invalid("clock.sync_timeout_ms must be positive");
        }
        if !(0.0..0.5).contains(&self.clock.trim_ratio) {
            return invalid("clock.trim_ratio must be in [0, 0.5)");
        }
        if self.transfer.read_timeout_ms == 0 || self.transfer.connect_timeout_ms == 0 {
            return invalid("transfer timeouts must be positive");
        }
        if self.liveness.enabled && self.liveness.check_interval_ms == 0 {
            return invalid("liveness.check_interval_ms must be positive");
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// What is wrong.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.server.transfer_bind, "0.0.0.0:8082");
        assert_eq!(config.protocol.command_timeout(), Duration::from_secs(10));
        assert_eq!(config.clock.sync_timeout(), Duration::from_millis(1500));
        assert_eq!(config.transfer.read_timeout(), Duration::from_secs(5));
        assert_eq!(config.transfer.max_header_bytes, 1024 * 1024);
        assert_eq!(config.liveness.stale_after_ms, 9_000);
        assert!(!config.http.enabled);
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[server]
advertise_host = "192.168.1.10"

[protocol]
command_timeout_ms = 2500
pipelining = true

[clock]
probes = 8
trim_ratio = 0.25

[transfer]
sessions_root = "/data/sessions"

[http]
enabled = true
bind_address = "0.0.0.0:9090"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.advertise_host, "192.168.1.10");
        assert_eq!(config.server.transfer_bind, "0.0.0.0:8082");
        assert_eq!(config.protocol.command_timeout_ms, 2500);
        assert!(config.protocol.pipelining);
        assert_eq!(config.clock.probes, 8);
        assert_eq!(config.clock.trim_ratio, 0.25);
        assert_eq!(config.transfer.sessions_root, PathBuf::from("/data/sessions"));
        assert!(config.http.enabled);
        assert_eq!(config.http.bind_address, "0.0.0.0:9090");
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.protocol.max_frame_bytes, 4 * 1024 * 1024);
        assert!(config.clock.sync_before_start);
        assert!(config.liveness.enabled);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = Config::default();
        config.clock.trim_ratio = 0.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        let mut config = Config::default();
        config.protocol.command_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn from_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.toml");
        std::fs::write(&path, "[protocol]\ncommand_timeout_ms = \"soon\"\n").unwrap();
        match Config::from_file(&path) {
            Err(ConfigError::ParseError { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected parse error, got {other:?}"),
        }

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            Config::from_file(&missing),
            Err(ConfigError::ReadError { .. })
        ));
    }
}
