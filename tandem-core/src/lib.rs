//! # tandem-core
//!
//! Pure logic for tandem (no network or disk I/O, instant tests).
//!
//! This crate implements the state machines and algorithms shared by the
//! hub and the devices:
//! - [`state`] - per-device recording state machine
//! - [`aggregate`] - session status reduced from device states
//! - [`clock`] - clock offset math and time sources
//! - [`ring`] - lock-free single-producer/single-consumer sample ring
//!
//! ## Design Philosophy
//!
//! The state machine is a reducer: it takes an event and returns the next
//! state plus a list of actions. The device agent in `tandem-spoke`
//! interprets those actions and performs the actual I/O, feeding results
//! back in as further events.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aggregate;
pub mod clock;
pub mod ring;
pub mod state;

pub use aggregate::{aggregate, DeviceStatus, SessionStatus, StatusCounts};
pub use clock::{
    robust_offset, Clock, ClockError, ManualClock, MonotonicClock, OffsetSample, RemoteTime,
    SyncStats,
};
pub use ring::Sample;
pub use state::{Action, Event, RecorderEvent, RecordingState};
