//! # tandem-spoke
//!
//! Device side of the tandem hub/spoke protocol.
//!
//! A spoke is a sensor-bearing device that records locally when the hub
//! tells it to and ships the recording back afterwards.
//!
//! ## Features
//!
//! - **Control agent**: accepts hub connections and answers commands
//! - **Recorder task**: drives the pure state machine from tandem-core
//! - **Capture boundary**: sensor pipelines plug in via [`CaptureResource`]
//! - **Streaming upload**: session directories leave as a ZIP stream, never staged
//! - **Time echo**: UDP side channel for clock probes
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tandem_core::MonotonicClock;
//! use tandem_spoke::{AgentConfig, DeviceAgent, SampledStream, SyntheticGsr};
//!
//! let clock = Arc::new(MonotonicClock::new());
//! let gsr = SampledStream::new("gsr", SyntheticGsr, 128.0, clock.clone());
//! let agent = DeviceAgent::with_clock(
//!     AgentConfig::new("phone-1", "./data"),
//!     vec![Box::new(gsr)],
//!     clock,
//! );
//! agent.run().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod agent;
pub mod capture;
pub mod config;
pub mod error;
pub mod events;
pub mod recorder;
pub mod time_echo;
pub mod transfer;

pub use agent::DeviceAgent;
pub use capture::{CaptureResource, SampledStream, ScalarSource, SyntheticGsr};
pub use config::AgentConfig;
pub use error::{AgentError, CaptureError, SendError};
pub use events::EventPublisher;
pub use recorder::RecorderHandle;
pub use time_echo::run_time_echo;
pub use transfer::{archive_name, send_session, SendRequest};
