//! Frame structure and stream classification

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stream a frame was emitted on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamType {
    /// Standard input echoed back by the transport
    Stdin,
    /// Standard output of the remote process
    Stdout,
    /// Standard error of the remote process
    Stderr,
    /// Untagged data from a TTY-attached stream
    Raw,
    /// Header tag outside the known range
    Unknown(u8),
}

impl StreamType {
    /// Classify a multiplexed header tag
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            0 => Self::Stdin,
            1 => Self::Stdout,
            2 => Self::Stderr,
            other => Self::Unknown(other),
        }
    }

    /// Header tag used on a multiplexed stream, `None` for raw data
    pub fn tag(self) -> Option<u8> {
        match self {
            Self::Stdin => Some(0),
            Self::Stdout => Some(1),
            Self::Stderr => Some(2),
            Self::Raw => None,
            Self::Unknown(tag) => Some(tag),
        }
    }

    /// Whether payloads on this stream belong to the process output conduit
    pub fn carries_output(self) -> bool {
        matches!(self, Self::Stdout | Self::Raw)
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdin => f.write_str("stdin"),
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
            Self::Raw => f.write_str("raw"),
            Self::Unknown(tag) => write!(f, "unknown({})", tag),
        }
    }
}

/// One unit of tagged data from an exec attach transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Stream the payload was emitted on
    pub stream_type: StreamType,
    /// Frame payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(stream_type: StreamType, payload: impl Into<Bytes>) -> Self {
        Self {
            stream_type,
            payload: payload.into(),
        }
    }

    /// Create a stdout frame
    pub fn stdout(payload: impl Into<Bytes>) -> Self {
        Self::new(StreamType::Stdout, payload)
    }

    /// Create a stderr frame
    pub fn stderr(payload: impl Into<Bytes>) -> Self {
        Self::new(StreamType::Stderr, payload)
    }

    /// Create a raw frame
    pub fn raw(payload: impl Into<Bytes>) -> Self {
        Self::new(StreamType::Raw, payload)
    }

    /// Get the payload size
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}
