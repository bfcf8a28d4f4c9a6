//! Error types for the chat engine.

use thiserror::Error;

/// Errors returned by the chat API.
///
/// Command failures reported by the modem are not errors: they arrive as
/// `ok == false` on the completion callback. These variants cover requests the
/// engine could not accept in the first place.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// The channel was torn down (disconnect or last handle released).
    #[error("chat channel is closed")]
    Closed,

    /// Channel-wide settings can only be changed through the primary handle.
    #[error("operation requires the primary group handle")]
    NotPrimaryGroup,

    /// The prefix is already registered with the opposite PDU expectation.
    #[error("prefix {prefix:?} is already registered with expect_pdu={registered}")]
    PduFlagMismatch {
        /// The notification prefix.
        prefix: String,
        /// The PDU flag the existing registration uses.
        registered: bool,
    },

    /// A buffer or queue could not grow.
    #[error("out of memory")]
    OutOfMemory,

    /// The transport reported an I/O error.
    #[error("transport error: {0:?}")]
    Io(std::io::ErrorKind),
}

impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        ChatError::Io(err.kind())
    }
}

impl From<std::collections::TryReserveError> for ChatError {
    fn from(_: std::collections::TryReserveError) -> Self {
        ChatError::OutOfMemory
    }
}

/// Result type alias for chat operations.
pub type ChatResult<T> = Result<T, ChatError>;

/// Errors that can occur while loading a [`ChatConfig`](crate::ChatConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The YAML document could not be parsed.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A value parsed but is not usable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
