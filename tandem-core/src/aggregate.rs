//! Session-level status reduced from per-device states.

use serde::{Deserialize, Serialize};

use crate::state::RecordingState;

/// What the hub knows about one participating device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Connected, not recording.
    Idle,
    /// `start_recording` sent, not yet acknowledged.
    Preparing,
    /// Acknowledged `start_recording`.
    Recording,
    /// `stop_recording` sent, not yet acknowledged.
    Stopping,
    /// Control connection lost.
    Disconnected,
}

impl From<&RecordingState> for DeviceStatus {
    fn from(state: &RecordingState) -> Self {
        match state {
            RecordingState::Idle => DeviceStatus::Idle,
            RecordingState::Preparing { .. } => DeviceStatus::Preparing,
            RecordingState::Recording { .. } => DeviceStatus::Recording,
            RecordingState::Stopping { .. } => DeviceStatus::Stopping,
        }
    }
}

/// Per-status device counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    /// Devices in `Idle`.
    pub idle: usize,
    /// Devices in `Preparing`.
    pub preparing: usize,
    /// Devices in `Recording`.
    pub recording: usize,
    /// Devices in `Stopping`.
    pub stopping: usize,
    /// Devices that lost their connection.
    pub disconnected: usize,
}

impl StatusCounts {
    /// Total number of devices counted.
    pub fn total(&self) -> usize {
        self.idle + self.preparing + self.recording + self.stopping + self.disconnected
    }
}

/// Aggregate status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionStatus {
    /// Every device is idle (or there are no devices).
    Idle,
    /// Every device is recording.
    Recording,
    /// Anything else; surfaced as-is.
    Mixed(StatusCounts),
}

/// Reduce a snapshot of device statuses to one session status.
///
/// A disconnected device is neither idle nor recording, so a single
/// disconnect is enough to make the session `Mixed`.
pub fn aggregate<'a, I>(statuses: I) -> SessionStatus
where
    I: IntoIterator<Item = &'a DeviceStatus>,
{
    let mut counts = StatusCounts::default();
    for status in statuses {
        match status {
            DeviceStatus::Idle => counts.idle += 1,
            DeviceStatus::Preparing => counts.preparing += 1,
            DeviceStatus::Recording => counts.recording += 1,
            DeviceStatus::Stopping => counts.stopping += 1,
            DeviceStatus::Disconnected => counts.disconnected += 1,
        }
    }

    let total = counts.total();
    if counts.idle == total {
        SessionStatus::Idle
    } else if counts.recording == total {
        SessionStatus::Recording
    } else {
        SessionStatus::Mixed(counts)
    }
}
