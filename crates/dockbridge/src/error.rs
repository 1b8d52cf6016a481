//! Error types for the dockbridge library

use dockbridge_provider::ProviderError;
use std::io;
use thiserror::Error;

/// Main error type for a launch attempt
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Environment creation, start, inspection or payload injection failed
    #[error("Provisioning failed: {0}")]
    Provisioning(#[source] ProviderError),

    /// Exec session creation or start failed
    #[error("Launch failed: {0}")]
    Launch(#[source] ProviderError),

    /// Steady-state transport failure while the channel was open
    #[error("Transport failed: {0}")]
    Transport(#[from] TransportError),

    /// The control channel refused the conduits
    #[error("Control channel error: {0}")]
    Channel(#[source] io::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration could not be parsed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures of the running exec transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// The exec output stream failed
    #[error("Failed to read exec output: {0}")]
    Read(#[source] ProviderError),

    /// Process output could not be written to the local conduit
    #[error("Failed to write process output: {0}")]
    Write(#[source] io::Error),

    /// The frame pump worker did not finish
    #[error("Frame pump aborted: {0}")]
    Aborted(String),
}
