//! Provider-specific error types

use crate::RuntimeState;
use dockbridge_proto::ProtocolError;
use std::io;
use thiserror::Error;

/// Environment provider errors
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Unknown environment id
    #[error("Environment not found: {0}")]
    EnvironmentNotFound(String),

    /// Unknown exec session id
    #[error("Exec session not found: {0}")]
    ExecNotFound(String),

    /// Environment exists but is not running
    #[error("Environment {id} is not running (state: {state})")]
    NotRunning {
        /// Environment id
        id: String,
        /// Observed runtime state
        state: RuntimeState,
    },

    /// Provider API call failed
    #[error("Provider API error: {0}")]
    Api(String),

    /// Docker engine error
    #[cfg(feature = "docker")]
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// Attach stream error
    #[error("Exec stream error: {0}")]
    Stream(String),

    /// Malformed attach stream
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Remote command failed
    #[error("Remote command failed with exit code {code}: {message}")]
    CommandFailed {
        /// Exit code of the failed command
        code: i64,
        /// Error message
        message: String,
    },
}
