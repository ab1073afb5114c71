//! # tandem-hub
//!
//! Hub side of the tandem hub/spoke recording protocol.
//!
//! The hub holds one control connection per device, keeps every device's
//! clock offset, starts and stops recording sessions across all devices and
//! collects each device's session data afterwards.
//!
//! ## Architecture
//!
//! ```text
//!  Device A ──control──┐                 ┌──control── Device B
//!                      ▼                 ▼
//!              ┌──────────────────────────────┐
//!              │         HubController        │
//!              │  DeviceSession per device    │
//!              │  ClockSyncEngine             │
//!              │  SessionStore (metadata)     │
//!              └──────────────┬───────────────┘
//!                             │
//!  Device A ──archive──▶ TransferReceiver ◀──archive── Device B
//!                             │
//!                  sessions_root/<session>/<device>/
//! ```
//!
//! ## Components
//!
//! - [`device`]: command/reply correlation, timeouts, event forwarding
//! - [`clock`]: per-device offset estimates
//! - [`transfer`]: streamed archive receiver
//! - [`metadata`]: per-session `metadata.json`
//! - [`controller`]: session lifecycle across devices
//! - [`liveness`], [`http`]: observation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod http;
pub mod liveness;
pub mod metadata;
pub mod metrics;
pub mod transfer;

pub use clock::{ClockRecord, ClockSyncEngine};
pub use config::{Config, ConfigError};
pub use controller::{BroadcastReport, DeviceSnapshot, HubController, SessionStart, SessionStop};
pub use device::{DeviceEvent, DeviceOptions, DeviceSession};
pub use error::{CommandError, HubError, MetadataError, Result, SyncError, TransferError};
pub use liveness::spawn_liveness_task;
pub use metadata::{SessionMetadata, SessionState, SessionStore};
pub use metrics::{HubMetrics, MetricsSnapshot};
pub use transfer::{JobStatus, TransferJob, TransferReceiver};
