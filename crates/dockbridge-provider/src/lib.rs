//! # Dockbridge Provider
//!
//! Remote environment provider abstraction for dockbridge, with an
//! in-process implementation and an optional Docker engine backend.

#![warn(missing_docs)]

/// Provider trait and the handles it hands out
pub mod provider;

/// Pre-flight hooks and the provisioning sequence
pub mod hooks;

/// In-process provider
pub mod memory;

/// Docker engine provider
#[cfg(feature = "docker")]
pub mod docker;

/// Provider-specific error types
pub mod error;

pub use error::ProviderError;
pub use hooks::{hold_open, provision, PreflightHooks, WAIT_COMMAND};
pub use memory::{InMemoryProvider, Operation, RemoteProcess};
pub use provider::{
    AttachFlags, CreateEnvironmentRequest, EnvironmentHandle, EnvironmentProvider,
    EnvironmentStatus, ExecConfig, ExecSessionHandle, ExecStdin, FrameStream, RuntimeState,
};

#[cfg(feature = "docker")]
pub use docker::DockerProvider;
