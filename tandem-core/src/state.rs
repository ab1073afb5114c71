//! Per-device recording state machine.
//!
//! This module provides a pure, side-effect-free state machine for the
//! recording lifecycle of one device. It takes events as input and produces
//! a new state plus a list of actions to execute.
//!
//! Capture resources are opened and closed by the device agent, which feeds
//! their outcome back in as `ResourcesReady` / `ResourceFailed` /
//! `ResourcesFlushed`. The machine itself never touches hardware.

use tandem_types::ErrorCode;

/// Recording state of one device - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingState {
    /// Not recording.
    Idle,
    /// `start_recording` accepted, capture resources opening.
    Preparing {
        /// Session being started.
        session_id: String,
        /// Command to acknowledge once resources are ready.
        request_id: u64,
    },
    /// All capture resources running.
    Recording {
        /// Active session.
        session_id: String,
    },
    /// `stop_recording` accepted, capture resources flushing.
    Stopping {
        /// Session being stopped.
        session_id: String,
        /// Command to acknowledge once resources are closed.
        request_id: u64,
    },
}

impl RecordingState {
    /// Create a new state machine in the Idle state.
    pub fn new() -> Self {
        Self::Idle
    }

    /// Process an event and return the new state plus actions to execute.
    pub fn on_event(self, event: Event) -> (Self, Vec<Action>) {
        match (self, event) {
            // From Idle
            (Self::Idle, Event::StartRequested { request_id, session_id }) => {
                if session_id.trim().is_empty() {
                    return (
                        Self::Idle,
                        vec![Action::Reject {
                            request_id,
                            code: ErrorCode::BadParam,
                            message: "session_id is required".into(),
                        }],
                    );
                }
                (
                    Self::Preparing {
                        session_id: session_id.clone(),
                        request_id,
                    },
                    vec![Action::PrepareResources { session_id }],
                )
            }

            // Start is only accepted from Idle
            (state, Event::StartRequested { request_id, .. }) => {
                let message = match state.session_id() {
                    Some(active) => format!("session {active} is active"),
                    None => "recording is active".to_string(),
                };
                (
                    state,
                    vec![Action::Reject {
                        request_id,
                        code: ErrorCode::RecordingActive,
                        message,
                    }],
                )
            }

            // From Preparing
            (
                Self::Preparing {
                    session_id,
                    request_id,
                },
                Event::ResourcesReady,
            ) => (
                Self::Recording {
                    session_id: session_id.clone(),
                },
                vec![
                    Action::Ack { request_id },
                    Action::EmitEvent(RecorderEvent::Started { session_id }),
                ],
            ),
            (
                Self::Preparing {
                    session_id,
                    request_id,
                },
                Event::ResourceFailed { error },
            ) => (
                Self::Idle,
                vec![
                    Action::ReleaseResources,
                    Action::Reject {
                        request_id,
                        code: ErrorCode::SensorError,
                        message: error.clone(),
                    },
                    Action::EmitEvent(RecorderEvent::StartFailed { session_id, error }),
                ],
            ),

            // From Recording
            (Self::Recording { session_id }, Event::StopRequested { request_id }) => (
                Self::Stopping {
                    session_id: session_id.clone(),
                    request_id,
                },
                vec![Action::FlushResources { session_id }],
            ),

            // From Stopping: always reaches Idle, flush errors become events
            (
                Self::Stopping {
                    session_id,
                    request_id,
                },
                Event::ResourcesFlushed { errors },
            ) => {
                let mut actions: Vec<Action> = errors
                    .into_iter()
                    .map(|error| {
                        Action::EmitEvent(RecorderEvent::FlushError {
                            session_id: session_id.clone(),
                            error,
                        })
                    })
                    .collect();
                actions.push(Action::Ack { request_id });
                actions.push(Action::EmitEvent(RecorderEvent::Stopped { session_id }));
                (Self::Idle, actions)
            }

            // Stop outside Recording
            (state, Event::StopRequested { request_id }) => (
                state,
                vec![Action::Reject {
                    request_id,
                    code: ErrorCode::NotRecording,
                    message: "no recording in progress".into(),
                }],
            ),

            // Stale readiness signals - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Session this device is working on, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Idle => None,
            Self::Preparing { session_id, .. }
            | Self::Recording { session_id }
            | Self::Stopping { session_id, .. } => Some(session_id),
        }
    }

    /// Check if currently recording.
    pub fn is_recording(&self) -> bool {
        matches!(self, Self::Recording { .. })
    }

    /// Check if idle.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Short lowercase name, as reported in status snapshots.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Preparing { .. } => "preparing",
            Self::Recording { .. } => "recording",
            Self::Stopping { .. } => "stopping",
        }
    }
}

impl Default for RecordingState {
    fn default() -> Self {
        Self::new()
    }
}

/// Inputs to the recording state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Hub sent `start_recording`.
    StartRequested {
        /// Id of the command.
        request_id: u64,
        /// Requested session.
        session_id: String,
    },
    /// Hub sent `stop_recording`.
    StopRequested {
        /// Id of the command.
        request_id: u64,
    },
    /// Every capture resource opened successfully.
    ResourcesReady,
    /// A capture resource failed to open.
    ResourceFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// Every capture resource has been closed.
    ResourcesFlushed {
        /// Errors reported while closing, if any.
        errors: Vec<String>,
    },
}

/// Actions to be executed by the device agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open capture resources for the session.
    PrepareResources {
        /// Session to record into.
        session_id: String,
    },
    /// Close whatever a failed prepare managed to open.
    ReleaseResources,
    /// Flush and close capture resources.
    FlushResources {
        /// Session being stopped.
        session_id: String,
    },
    /// Acknowledge a command with `status: "ok"`.
    Ack {
        /// Command to acknowledge.
        request_id: u64,
    },
    /// Reject a command.
    Reject {
        /// Command to reject.
        request_id: u64,
        /// Error code for the hub.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
    },
    /// Report a lifecycle event.
    EmitEvent(RecorderEvent),
}

/// Lifecycle notifications produced by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderEvent {
    /// Recording started.
    Started {
        /// Active session.
        session_id: String,
    },
    /// A capture resource failed to start.
    StartFailed {
        /// Session that failed to start.
        session_id: String,
        /// Error message.
        error: String,
    },
    /// A capture resource reported an error while closing.
    FlushError {
        /// Session being stopped.
        session_id: String,
        /// Error message.
        error: String,
    },
    /// Recording stopped.
    Stopped {
        /// Session that stopped.
        session_id: String,
    },
}
