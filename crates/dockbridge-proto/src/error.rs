//! Error types for protocol operations

use std::io;
use thiserror::Error;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame too large
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual frame size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Stream ended inside a frame
    #[error("Stream ended with {remaining} bytes of an incomplete frame")]
    TruncatedFrame {
        /// Bytes left in the buffer at end of stream
        remaining: usize,
    },

    /// Raw frames have no header tag on a multiplexed stream
    #[error("Raw frames cannot be encoded on a multiplexed stream")]
    UntaggedFrame,

    /// I/O error on the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
