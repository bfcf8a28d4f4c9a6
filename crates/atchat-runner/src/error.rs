//! Runner error type.

use thiserror::Error;

/// Errors that stop a runner session.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Socket or file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The chat configuration inside the script is invalid.
    #[error("config error: {0}")]
    Config(#[from] atchat::ConfigError),

    /// The chat engine refused a request.
    #[error("chat error: {0}")]
    Chat(#[from] atchat::ChatError),

    /// The script file could not be parsed.
    #[error("script error: {0}")]
    Script(#[from] serde_yaml::Error),

    /// The script parsed but does not make sense.
    #[error("invalid script: {0}")]
    InvalidScript(String),
}
