//! Attach connector
//!
//! Provisions an environment with the attach hooks, starts the agent in an
//! exec session and binds its conduits to a control-plane channel.

use crate::bridge::FramePump;
use crate::channel::ControlChannel;
use crate::config::{AgentPayload, AttachConfig};
use crate::demux::DiagnosticSink;
use crate::launcher::{ExecSession, LaunchedSession, SessionLauncher};
use crate::lifecycle::{ChannelLifecycle, CloseReason, LifecycleState};
use crate::{BridgeError, Result};
use async_trait::async_trait;
use dockbridge_provider::{
    hold_open, provision, CreateEnvironmentRequest, EnvironmentHandle, EnvironmentProvider,
    PreflightHooks, ProviderError,
};
use std::sync::Arc;
use tracing::info;

/// Pre-flight hooks of the attach connector
#[derive(Debug, Clone)]
pub struct AttachHooks {
    agent: AgentPayload,
}

impl AttachHooks {
    /// Create hooks that inject `agent`
    pub fn new(agent: AgentPayload) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl PreflightHooks for AttachHooks {
    fn ensure_waiting(&self, request: &mut CreateEnvironmentRequest) {
        hold_open(request);
    }

    async fn inject_agent_payload(
        &self,
        provider: &dyn EnvironmentProvider,
        env: &EnvironmentHandle,
    ) -> std::result::Result<(), ProviderError> {
        info!(
            "Copying {} into {}:{}",
            self.agent.local_path.display(),
            env.id(),
            env.remote_fs()
        );
        provider
            .copy_file_into_environment(env.id(), &self.agent.local_path, env.remote_fs())
            .await
    }
}

/// Connects agents running in container exec sessions
pub struct AttachConnector {
    config: AttachConfig,
    hooks: AttachHooks,
    diagnostics: Option<Arc<dyn DiagnosticSink>>,
}

impl AttachConnector {
    /// Create a connector, rejecting an unusable configuration
    pub fn new(config: AttachConfig) -> Result<Self> {
        config.validate()?;
        let hooks = AttachHooks::new(config.agent.clone());
        Ok(Self {
            config,
            hooks,
            diagnostics: None,
        })
    }

    /// Send agent stderr to `diagnostics` instead of the log
    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// Connector configuration
    pub fn config(&self) -> &AttachConfig {
        &self.config
    }

    /// Pre-flight hooks run during provisioning
    pub fn hooks(&self) -> &AttachHooks {
        &self.hooks
    }

    /// Command line that starts the agent in `env`
    pub fn bootstrap_command(&self, env: &EnvironmentHandle) -> Result<Vec<String>> {
        self.config.agent.bootstrap_command(env.remote_fs())
    }

    /// Create and start an environment ready for [`connect`](Self::connect)
    pub async fn provision(
        &self,
        provider: &dyn EnvironmentProvider,
        request: CreateEnvironmentRequest,
    ) -> Result<EnvironmentHandle> {
        provision(
            provider,
            request,
            &self.hooks,
            &self.config.remote_fs,
            self.config.effective_user().map(str::to_string),
        )
        .await
        .map_err(BridgeError::Provisioning)
    }

    /// Start the agent in `env` and hand its conduits to `channel`
    ///
    /// If the channel refuses the conduits, the exec session is closed before
    /// the error is returned. A launch failure closes nothing: an exec session
    /// that was created but could not be started is left to the provider.
    pub async fn connect(
        &self,
        provider: Arc<dyn EnvironmentProvider>,
        env: &EnvironmentHandle,
        channel: &dyn ControlChannel,
    ) -> Result<LiveChannel> {
        info!("Connecting to container {}", env.id());

        let command = self.bootstrap_command(env)?;
        let user = env
            .user()
            .filter(|user| !user.trim().is_empty())
            .or(self.config.effective_user());

        let mut launcher =
            SessionLauncher::new(provider).with_pipe_capacity(self.config.pipe_capacity);
        if let Some(diagnostics) = &self.diagnostics {
            launcher = launcher.with_diagnostics(Arc::clone(diagnostics));
        }

        let LaunchedSession {
            session,
            writer,
            reader,
            pump,
            lifecycle,
        } = launcher.launch(env, command, user).await?;

        lifecycle.bind(channel, reader, writer).await?;
        info!("Agent attached through exec session {}", session.handle.id);

        Ok(LiveChannel {
            session,
            lifecycle,
            pump,
        })
    }
}

/// An agent exec session bound to a control-plane channel
#[derive(Debug)]
pub struct LiveChannel {
    session: ExecSession,
    lifecycle: Arc<ChannelLifecycle>,
    pump: FramePump,
}

impl LiveChannel {
    /// Exec session running the agent
    pub fn session(&self) -> &ExecSession {
        &self.session
    }

    /// Current lifecycle state
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Close the exec session from the local side
    pub async fn close(&self) -> bool {
        self.lifecycle.close(CloseReason::ChannelClosed).await
    }

    /// Wait until the exec session has been closed
    pub async fn closed(&self) {
        self.lifecycle.wait_closed().await
    }

    /// Wait for the agent's output to end and return the outcome
    ///
    /// A transport failure while the channel was open is the only error.
    pub async fn wait(self) -> Result<()> {
        self.pump.join().await.map_err(BridgeError::from)
    }
}
