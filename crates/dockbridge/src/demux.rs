//! Frame demultiplexing

use dockbridge_proto::{Frame, StreamType};
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Receiver of the remote process's standard error
pub trait DiagnosticSink: Send + Sync {
    /// Report one stderr payload, decoded as UTF-8
    fn error(&self, message: &str);
}

/// Forwards stderr text to `tracing`
#[derive(Debug, Clone)]
pub struct TracingDiagnostics {
    source: String,
}

impl TracingDiagnostics {
    /// Create a sink that tags messages with `source`
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

impl DiagnosticSink for TracingDiagnostics {
    fn error(&self, message: &str) {
        warn!(target: "dockbridge::remote", "[{}] {}", self.source, message.trim_end());
    }
}

/// Keeps stderr messages in memory
#[derive(Debug, Default)]
pub struct BufferedDiagnostics {
    messages: Mutex<Vec<String>>,
}

impl BufferedDiagnostics {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages received so far, in delivery order
    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }
}

impl DiagnosticSink for BufferedDiagnostics {
    fn error(&self, message: &str) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message.to_string());
        }
    }
}

/// Where a dispatched frame went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Payload bytes written to the output conduit
    Output(usize),
    /// Payload sent to the diagnostic sink
    Diagnostic,
    /// Frame discarded
    Dropped,
}

/// Routes frames to the process output conduit or the diagnostic sink
pub struct Demultiplexer<W> {
    output: W,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl<W> Demultiplexer<W>
where
    W: AsyncWrite + Unpin,
{
    /// Create a demultiplexer writing process output to `output`
    pub fn new(output: W, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            output,
            diagnostics,
        }
    }

    /// Route one frame
    ///
    /// Output payloads are written and flushed before this returns. An error
    /// means the output conduit is gone.
    pub async fn dispatch(&mut self, frame: Frame) -> io::Result<Dispatch> {
        match frame.stream_type {
            StreamType::Stdout | StreamType::Raw => {
                self.output.write_all(&frame.payload).await?;
                self.output.flush().await?;
                Ok(Dispatch::Output(frame.payload.len()))
            }
            StreamType::Stderr => {
                self.diagnostics
                    .error(&String::from_utf8_lossy(&frame.payload));
                Ok(Dispatch::Diagnostic)
            }
            other => {
                warn!(
                    "Dropping {} bytes received on unexpected {} stream",
                    frame.payload.len(),
                    other
                );
                Ok(Dispatch::Dropped)
            }
        }
    }

    /// Signal end of output to the conduit reader
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.output.shutdown().await
    }

    /// Recover the output writer
    pub fn into_inner(self) -> W {
        self.output
    }
}
