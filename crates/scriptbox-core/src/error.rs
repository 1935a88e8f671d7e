//! Error types for the runner

use crate::sandbox::SandboxError;
use thiserror::Error;

/// Result type for runner operations
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Errors surfaced by the orchestrator, the session and configuration loading
#[derive(Error, Debug)]
pub enum RunnerError {
    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The sandbox could not be launched or addressed
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// The submitted source contained nothing to run
    #[error("There is no code to run")]
    EmptySource,

    /// The session actor is gone
    #[error("Session closed")]
    SessionClosed,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether the error is a user mistake rather than a host failure
    pub fn is_user_error(&self) -> bool {
        matches!(self, Self::EmptySource | Self::Config { .. })
    }
}

impl From<toml::de::Error> for RunnerError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(format!("TOML parsing error: {}", err))
    }
}

impl From<serde_json::Error> for RunnerError {
    fn from(err: serde_json::Error) -> Self {
        Self::config(format!("JSON parsing error: {}", err))
    }
}
