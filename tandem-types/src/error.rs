//! Error types for the tandem wire protocol.

use thiserror::Error;

/// Errors produced while encoding or decoding control messages.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The peer sent something that is not a valid control message.
    ///
    /// Covers oversized frames, invalid UTF-8, invalid JSON and missing
    /// discriminator fields. The connection should be dropped.
    #[error("malformed message: {reason}")]
    Malformed {
        /// Why the message was rejected.
        reason: String,
    },

    /// The stream ended cleanly at a message boundary.
    #[error("connection closed")]
    Closed,

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}
