//! Error types for the device agent.

use std::path::PathBuf;
use tandem_types::CodecError;

/// Errors that end a control connection or stop the agent.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Framing or decoding failed; the connection is dropped.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The recorder task has exited.
    #[error("recorder task is gone")]
    RecorderGone,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A capture resource failed to open or close.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The underlying sensor reported a problem.
    #[error("{resource}: {reason}")]
    Sensor {
        /// Resource name.
        resource: String,
        /// What went wrong.
        reason: String,
    },

    /// Writing captured data failed.
    #[error("{resource}: I/O error: {source}")]
    Io {
        /// Resource name.
        resource: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// Sending a session archive failed.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The session directory does not exist.
    #[error("session directory not found: {path}")]
    MissingSession {
        /// Expected directory.
        path: PathBuf,
    },

    /// Could not resolve or reach the receiver.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Receiver address as given.
        addr: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Writing the archive failed.
    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Header serialization failed.
    #[error("header error: {0}")]
    Header(#[from] serde_json::Error),

    /// I/O error while streaming.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The blocking send task panicked or was cancelled.
    #[error("send task failed: {0}")]
    Join(String),
}
