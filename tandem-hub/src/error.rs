//! Error types for the tandem hub.

use std::path::PathBuf;
use std::time::Duration;
use tandem_core::ClockError;
use tandem_types::{CodecError, ErrorCode};

/// Main error type for hub operations.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A device command failed.
    #[error("command error: {0}")]
    Command(#[from] CommandError),

    /// Clock synchronization failed.
    #[error("clock sync error: {0}")]
    Sync(#[from] SyncError),

    /// Transfer failed.
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Session metadata could not be read or written.
    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    /// A session is already running.
    #[error("session {0} is already active")]
    SessionActive(String),

    /// No session is running.
    #[error("no active session")]
    NoActiveSession,

    /// No devices are connected.
    #[error("no devices connected")]
    NoDevices,

    /// Connecting to a device failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Address as given.
        addr: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Timed out waiting for something other than a command reply.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a single command that did not succeed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CommandError {
    /// No reply within the command budget.
    #[error("{command} timed out after {after:?}")]
    Timeout {
        /// Command name.
        command: String,
        /// Budget that elapsed.
        after: Duration,
    },

    /// The connection dropped before a reply arrived.
    #[error("connection lost")]
    ConnectionLost,

    /// The device rejected the command.
    #[error("rejected with {code}: {message}")]
    Rejected {
        /// Device error code.
        code: ErrorCode,
        /// Device error message.
        message: String,
    },

    /// The command could not be encoded or written.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The reply was not an ack or error, or lacked a required field.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl CommandError {
    /// Device error code, if the device rejected the command.
    pub fn code(&self) -> Option<&ErrorCode> {
        match self {
            CommandError::Rejected { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl From<CodecError> for CommandError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Closed | CodecError::Io(_) => CommandError::ConnectionLost,
            CodecError::Malformed { reason } => CommandError::Protocol(reason),
        }
    }
}

/// Clock probe failures. The stored offset is left untouched.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// No reply within the probe budget.
    #[error("clock probe timed out after {0:?}")]
    Timeout(Duration),

    /// The `time_sync` command failed.
    #[error("time_sync failed: {0}")]
    Command(#[from] CommandError),

    /// The reply could not be interpreted.
    #[error("bad time reply: {0}")]
    BadReply(String),

    /// Offset statistics could not be computed.
    #[error("{0}")]
    Clock(#[from] ClockError),

    /// UDP probe I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transfer receiver failures.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// Header missing, too long or not valid JSON.
    #[error("bad header: {0}")]
    BadHeader(String),

    /// A read stalled longer than the per-read budget.
    #[error("read timed out after {0:?}")]
    ReadTimeout(Duration),

    /// The sender closed before the announced size arrived.
    #[error("short read: got {received} of {expected} bytes")]
    ShortRead {
        /// Bytes received.
        received: u64,
        /// Bytes announced in the header.
        expected: u64,
    },

    /// The archive could not be read.
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// An archive entry would land outside the session directory.
    #[error("unsafe archive entry: {0}")]
    UnsafeEntry(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The extraction task panicked.
    #[error("extraction task failed: {0}")]
    Join(String),
}

/// Session metadata store failures.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// No metadata for this session.
    #[error("session not found: {0}")]
    NotFound(String),

    /// Metadata for this session already exists.
    #[error("session already exists: {0}")]
    AlreadyExists(String),

    /// Reading or writing the metadata file failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Metadata is not valid JSON.
    #[error("invalid metadata: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for hub operations.
pub type Result<T> = std::result::Result<T, HubError>;
