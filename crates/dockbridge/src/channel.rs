//! Control-plane channel abstraction

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Bytes produced by the remote agent, read by the channel
pub type ChannelInput = Box<dyn AsyncRead + Send + Unpin>;

/// Bytes for the remote agent, written by the channel
pub type ChannelOutput = Box<dyn AsyncWrite + Send + Unpin>;

/// Closure notifications from a control-plane channel
pub trait ChannelListener: Send + Sync {
    /// The channel has closed, with the failure that closed it if any
    ///
    /// May be called more than once; only the first call has an effect.
    fn on_closed(&self, cause: Option<io::Error>);
}

/// Control-plane channel the agent's conduits are handed to
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Take ownership of the conduit pair and report closure to `listener`
    async fn set_channel(
        &self,
        input: ChannelInput,
        output: ChannelOutput,
        listener: Arc<dyn ChannelListener>,
    ) -> io::Result<()>;
}
