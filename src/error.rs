//! Error types for AgentBox

use thiserror::Error;

/// Result type alias using AgentBox's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for AgentBox
///
/// Expected execution outcomes (blocked payloads, timeouts, non-zero exits,
/// a missing container runtime) are reported inside `ExecutionResult`, not
/// here. This enum covers the genuinely unexpected: unusable configuration,
/// an unwritable filesystem, a broken Docker client.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Sandbox execution error
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// Docker/container error
    #[error("Container error: {0}")]
    Container(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Environment variable error
    #[error("Environment error: {0}")]
    Env(#[from] std::env::VarError),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        Error::Container(err.to_string())
    }
}
