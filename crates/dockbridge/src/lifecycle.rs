//! Channel lifecycle and exec session teardown
//!
//! A [`ChannelLifecycle`] moves through `Open -> Closing -> Closed` exactly
//! once. Whichever side ends first (the channel, the transport, or a failed
//! bind) wins the `Open -> Closing` transition and performs the single
//! provider close; every later attempt is a no-op.

use crate::bridge::{ConduitReader, ConduitWriter};
use crate::channel::{ChannelListener, ControlChannel};
use crate::{BridgeError, Result};
use dockbridge_provider::{EnvironmentProvider, ExecSessionHandle};
use std::io;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, warn};

/// State of the logical channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Channel is live
    Open,
    /// Exec session is being closed
    Closing,
    /// Exec session has been closed
    Closed,
}

/// What ended the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The control-plane channel reported closure
    ChannelClosed,
    /// The exec transport failed while the channel was open
    TransportFailure,
    /// The channel refused the conduits
    BindFailed,
}

/// Owner of the exec session teardown
pub struct ChannelLifecycle {
    provider: Arc<dyn EnvironmentProvider>,
    session: ExecSessionHandle,
    state: watch::Sender<LifecycleState>,
}

impl ChannelLifecycle {
    /// Create an open lifecycle for an exec session
    pub fn new(provider: Arc<dyn EnvironmentProvider>, session: ExecSessionHandle) -> Self {
        let (state, _) = watch::channel(LifecycleState::Open);
        Self {
            provider,
            session,
            state,
        }
    }

    /// Exec session this lifecycle tears down
    pub fn session(&self) -> &ExecSessionHandle {
        &self.session
    }

    /// Current state
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Check if the channel is still open
    pub fn is_open(&self) -> bool {
        self.state() == LifecycleState::Open
    }

    /// Close the exec session unless another caller already did
    ///
    /// Returns `true` for the caller that performed the close. A provider
    /// failure is logged and still ends in [`LifecycleState::Closed`].
    pub async fn close(&self, reason: CloseReason) -> bool {
        if !self.begin_close(reason) {
            return false;
        }
        self.finish_close().await;
        true
    }

    /// Wait until the exec session has been closed
    pub async fn wait_closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|state| *state == LifecycleState::Closed).await;
    }

    /// Wait until the channel has left [`LifecycleState::Open`]
    pub async fn wait_closing(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|state| *state != LifecycleState::Open).await;
    }

    /// Hand the conduits to `channel` and register for its closure
    ///
    /// If the channel refuses them, the exec session is closed and the
    /// refusal is returned.
    pub async fn bind(
        self: &Arc<Self>,
        channel: &dyn ControlChannel,
        reader: ConduitReader,
        writer: ConduitWriter,
    ) -> Result<()> {
        let listener = Arc::new(TeardownListener {
            lifecycle: Arc::clone(self),
            runtime: Handle::current(),
        });

        match channel
            .set_channel(Box::new(reader), Box::new(writer), listener)
            .await
        {
            Ok(()) => {
                debug!("Channel bound to exec session {}", self.session.id);
                Ok(())
            }
            Err(e) => {
                self.close(CloseReason::BindFailed).await;
                Err(BridgeError::Channel(e))
            }
        }
    }

    fn begin_close(&self, reason: CloseReason) -> bool {
        let claimed = self.state.send_if_modified(|state| {
            if *state == LifecycleState::Open {
                *state = LifecycleState::Closing;
                true
            } else {
                false
            }
        });

        if claimed {
            debug!("Closing exec session {} ({:?})", self.session.id, reason);
        } else {
            debug!(
                "Exec session {} already {:?}, ignoring {:?}",
                self.session.id,
                self.state(),
                reason
            );
        }
        claimed
    }

    async fn finish_close(&self) {
        if let Err(e) = self.provider.close_exec_session(&self.session).await {
            warn!("Failed to close exec session {}: {}", self.session.id, e);
        }
        self.state.send_replace(LifecycleState::Closed);
        debug!("Exec session {} closed", self.session.id);
    }
}

impl std::fmt::Debug for ChannelLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelLifecycle")
            .field("session", &self.session)
            .field("state", &self.state())
            .finish()
    }
}

/// Listener handed to the channel at bind time
///
/// Channels may report closure from threads outside the runtime, so the
/// provider close is spawned on the runtime that bound the channel.
struct TeardownListener {
    lifecycle: Arc<ChannelLifecycle>,
    runtime: Handle,
}

impl ChannelListener for TeardownListener {
    fn on_closed(&self, cause: Option<io::Error>) {
        match &cause {
            Some(e) => debug!("Channel of exec session {} failed: {}", self.lifecycle.session.id, e),
            None => debug!("Channel of exec session {} closed", self.lifecycle.session.id),
        }

        // Leaves Open before returning; only the provider call is deferred
        if self.lifecycle.begin_close(CloseReason::ChannelClosed) {
            let lifecycle = Arc::clone(&self.lifecycle);
            self.runtime.spawn(async move { lifecycle.finish_close().await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::StreamBridge;
    use crate::channel::{ChannelInput, ChannelOutput};
    use crate::demux::BufferedDiagnostics;
    use async_trait::async_trait;
    use dockbridge_provider::{
        EnvironmentHandle, ExecConfig, AttachFlags, InMemoryProvider, Operation,
    };
    use futures::stream;
    use std::sync::Mutex;

    async fn open_session(provider: &Arc<InMemoryProvider>) -> ExecSessionHandle {
        let env_id = provider
            .create_environment(dockbridge_provider::CreateEnvironmentRequest::new("debian"))
            .await
            .unwrap();
        provider.start_environment(&env_id).await.unwrap();
        let env = EnvironmentHandle::new(env_id, "/home/agent");
        let config = ExecConfig {
            command: vec!["cat".to_string()],
            user: None,
            flags: AttachFlags::default(),
        };
        provider.create_exec_session(&env, &config).await.unwrap()
    }

    #[derive(Default)]
    struct RecordingChannel {
        listener: Mutex<Option<Arc<dyn ChannelListener>>>,
        refuse: bool,
    }

    #[async_trait]
    impl ControlChannel for RecordingChannel {
        async fn set_channel(
            &self,
            _input: ChannelInput,
            _output: ChannelOutput,
            listener: Arc<dyn ChannelListener>,
        ) -> io::Result<()> {
            if self.refuse {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "handshake failed"));
            }
            *self.listener.lock().unwrap() = Some(listener);
            Ok(())
        }
    }

    fn conduits() -> (ConduitReader, ConduitWriter) {
        let (bridge, _stdin) = StreamBridge::new(64);
        let lifecycle = Arc::new(ChannelLifecycle::new(
            Arc::new(InMemoryProvider::new()),
            ExecSessionHandle::new("unused", "unused"),
        ));
        let (writer, reader, _pump) = bridge.open(
            Box::pin(stream::empty()),
            Arc::new(BufferedDiagnostics::new()),
            lifecycle,
        );
        (reader, writer)
    }

    #[tokio::test]
    async fn test_close_is_performed_once() {
        let provider = Arc::new(InMemoryProvider::new());
        let session = open_session(&provider).await;
        let lifecycle = ChannelLifecycle::new(provider.clone(), session.clone());

        assert!(lifecycle.is_open());
        assert!(lifecycle.close(CloseReason::ChannelClosed).await);
        assert!(!lifecycle.close(CloseReason::ChannelClosed).await);
        assert!(!lifecycle.close(CloseReason::TransportFailure).await);

        assert_eq!(lifecycle.state(), LifecycleState::Closed);
        assert_eq!(provider.close_calls(&session.id).await, 1);
    }

    #[tokio::test]
    async fn test_close_failure_is_terminal() {
        let provider = Arc::new(InMemoryProvider::new());
        let session = open_session(&provider).await;
        provider.fail_on(Operation::CloseExec).await;
        let lifecycle = ChannelLifecycle::new(provider.clone(), session.clone());

        assert!(lifecycle.close(CloseReason::ChannelClosed).await);
        assert_eq!(lifecycle.state(), LifecycleState::Closed);

        assert!(!lifecycle.close(CloseReason::ChannelClosed).await);
        assert_eq!(provider.close_calls(&session.id).await, 1);
    }

    #[tokio::test]
    async fn test_listener_fired_twice_closes_once() {
        let provider = Arc::new(InMemoryProvider::new());
        let session = open_session(&provider).await;
        let lifecycle = Arc::new(ChannelLifecycle::new(provider.clone(), session.clone()));
        let channel = RecordingChannel::default();

        let (reader, writer) = conduits();
        lifecycle.bind(&channel, reader, writer).await.unwrap();

        let listener = channel.listener.lock().unwrap().clone().unwrap();
        listener.on_closed(None);
        assert!(!lifecycle.is_open());
        listener.on_closed(Some(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone")));

        lifecycle.wait_closed().await;
        assert_eq!(lifecycle.state(), LifecycleState::Closed);
        assert_eq!(provider.close_calls(&session.id).await, 1);
    }

    #[tokio::test]
    async fn test_closure_reported_from_foreign_thread() {
        let provider = Arc::new(InMemoryProvider::new());
        let session = open_session(&provider).await;
        let lifecycle = Arc::new(ChannelLifecycle::new(provider.clone(), session.clone()));
        let channel = RecordingChannel::default();

        let (reader, writer) = conduits();
        lifecycle.bind(&channel, reader, writer).await.unwrap();

        let listener = channel.listener.lock().unwrap().clone().unwrap();
        std::thread::spawn(move || listener.on_closed(None))
            .join()
            .unwrap();

        lifecycle.wait_closed().await;
        assert_eq!(lifecycle.state(), LifecycleState::Closed);
        assert_eq!(provider.close_calls(&session.id).await, 1);
    }

    #[tokio::test]
    async fn test_refused_bind_closes_session() {
        let provider = Arc::new(InMemoryProvider::new());
        let session = open_session(&provider).await;
        let lifecycle = Arc::new(ChannelLifecycle::new(provider.clone(), session.clone()));
        let channel = RecordingChannel {
            refuse: true,
            ..Default::default()
        };

        let (reader, writer) = conduits();
        let result = lifecycle.bind(&channel, reader, writer).await;

        assert!(matches!(result, Err(BridgeError::Channel(_))));
        assert_eq!(lifecycle.state(), LifecycleState::Closed);
        assert_eq!(provider.close_calls(&session.id).await, 1);
    }
}
