//! # Dockbridge
//!
//! Attach an agent process running inside a container exec session to a
//! control-plane channel.
//!
//! The exec transport delivers one interleaved stream of tagged frames. Dockbridge
//! splits it into a plain byte-stream pair for the channel, sends stderr to a
//! diagnostic sink, and closes the exec session exactly once when the channel ends.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use dockbridge_proto as proto;
pub use dockbridge_provider as provider;

/// Error types for the dockbridge library
pub mod error;

/// Connector configuration
pub mod config;

/// Frame demultiplexing and diagnostic sinks
pub mod demux;

/// Conduit pair between the exec transport and the channel
pub mod bridge;

/// Control-plane channel abstraction
pub mod channel;

/// Channel lifecycle and exec session teardown
pub mod lifecycle;

/// Exec session negotiation
pub mod launcher;

/// Attach connector tying provisioning, launch and teardown together
pub mod connector;

pub use bridge::{ConduitReader, ConduitWriter, FramePump, StreamBridge};
pub use channel::{ChannelInput, ChannelListener, ChannelOutput, ControlChannel};
pub use config::{AgentPayload, AttachConfig};
pub use connector::{AttachConnector, AttachHooks, LiveChannel};
pub use demux::{BufferedDiagnostics, Demultiplexer, DiagnosticSink, Dispatch, TracingDiagnostics};
pub use error::{BridgeError, TransportError};
pub use launcher::{ExecSession, LaunchedSession, SessionLauncher};
pub use lifecycle::{ChannelLifecycle, CloseReason, LifecycleState};

/// Result type alias for dockbridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
