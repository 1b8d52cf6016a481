//! # Dockbridge Protocol
//!
//! Frame model and wire codec for exec attach streams.

#![warn(missing_docs)]

/// Frame structure and stream classification
pub mod frame;

/// Codec for multiplexed and raw attach streams
pub mod codec;

/// Error types for protocol operations
pub mod error;

pub use codec::{frames_from_reader, MuxCodec, HEADER_LEN, MAX_FRAME_SIZE};
pub use error::ProtocolError;
pub use frame::{Frame, StreamType};
