//! Conduit pair between the exec transport and the control-plane channel
//!
//! The bridge owns two bounded in-process conduits. The "to-remote" conduit
//! carries channel writes to the exec session's stdin; the "from-remote"
//! conduit carries the process output written by the frame pump. Both are
//! bounded, so a slow side stalls the other instead of buffering without limit.

use crate::demux::{Demultiplexer, DiagnosticSink};
use crate::error::TransportError;
use crate::lifecycle::{ChannelLifecycle, CloseReason};
use dockbridge_provider::{ExecStdin, FrameStream};
use futures::StreamExt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Write side of the "to-remote" conduit
#[derive(Debug)]
pub struct ConduitWriter {
    inner: DuplexStream,
}

impl AsyncWrite for ConduitWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Read side of the "from-remote" conduit
#[derive(Debug)]
pub struct ConduitReader {
    inner: DuplexStream,
}

impl AsyncRead for ConduitReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Conduit pair for one exec session
#[derive(Debug)]
pub struct StreamBridge {
    to_remote: DuplexStream,
    from_remote_writer: DuplexStream,
    from_remote_reader: DuplexStream,
}

impl StreamBridge {
    /// Create the conduits, returning the bridge and the exec session's stdin
    pub fn new(capacity: usize) -> (Self, ExecStdin) {
        let (to_remote, remote_stdin) = tokio::io::duplex(capacity);
        let (from_remote_writer, from_remote_reader) = tokio::io::duplex(capacity);

        let bridge = Self {
            to_remote,
            from_remote_writer,
            from_remote_reader,
        };
        (bridge, Box::new(remote_stdin))
    }

    /// Start pumping `frames` into the "from-remote" conduit
    ///
    /// Returns immediately with the local ends of both conduits and the handle
    /// of the pump worker. A transport failure while the lifecycle is open
    /// closes the exec session and is reported by [`FramePump::join`].
    pub fn open(
        self,
        frames: FrameStream,
        diagnostics: Arc<dyn DiagnosticSink>,
        lifecycle: Arc<ChannelLifecycle>,
    ) -> (ConduitWriter, ConduitReader, FramePump) {
        let demux = Demultiplexer::new(self.from_remote_writer, diagnostics);
        let handle = tokio::spawn(pump(frames, demux, lifecycle));

        (
            ConduitWriter {
                inner: self.to_remote,
            },
            ConduitReader {
                inner: self.from_remote_reader,
            },
            FramePump { handle },
        )
    }
}

/// Handle of the worker moving frames into the "from-remote" conduit
#[derive(Debug)]
pub struct FramePump {
    handle: JoinHandle<Result<(), TransportError>>,
}

impl FramePump {
    /// Check if the worker has stopped
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the worker and return its outcome
    pub async fn join(self) -> Result<(), TransportError> {
        self.handle
            .await
            .map_err(|e| TransportError::Aborted(e.to_string()))?
    }
}

async fn pump(
    mut frames: FrameStream,
    mut demux: Demultiplexer<DuplexStream>,
    lifecycle: Arc<ChannelLifecycle>,
) -> Result<(), TransportError> {
    let session = lifecycle.session().id.clone();
    let closing = lifecycle.wait_closing();
    tokio::pin!(closing);

    let outcome = loop {
        let next = tokio::select! {
            biased;
            next = frames.next() => next,
            _ = &mut closing => break Ok(()),
        };

        match next {
            Some(Ok(frame)) => {
                // A full conduit must not outlive the channel
                let dispatched = tokio::select! {
                    biased;
                    dispatched = demux.dispatch(frame) => dispatched,
                    _ = &mut closing => break Ok(()),
                };
                if let Err(e) = dispatched {
                    break Err(TransportError::Write(e));
                }
            }
            Some(Err(e)) => break Err(TransportError::Read(e)),
            None => break Ok(()),
        }
    };

    // The channel sees end of input either way
    if let Err(e) = demux.shutdown().await {
        debug!("Output conduit of exec session {} already closed: {}", session, e);
    }

    match outcome {
        Ok(()) => {
            debug!("Exec output of session {} ended", session);
            Ok(())
        }
        Err(e) => {
            if lifecycle.close(CloseReason::TransportFailure).await {
                error!("Transport of exec session {} failed: {}", session, e);
                Err(e)
            } else {
                debug!("Ignoring transport error of closed session {}: {}", session, e);
                Ok(())
            }
        }
    }
}
