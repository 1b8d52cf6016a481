//! Exec session negotiation

use crate::bridge::{ConduitReader, ConduitWriter, FramePump, StreamBridge};
use crate::config::DEFAULT_PIPE_CAPACITY;
use crate::demux::{DiagnosticSink, TracingDiagnostics};
use crate::lifecycle::ChannelLifecycle;
use crate::{BridgeError, Result};
use dockbridge_provider::{
    AttachFlags, EnvironmentHandle, EnvironmentProvider, ExecConfig, ExecSessionHandle,
    ProviderError,
};
use std::sync::Arc;
use tracing::debug;

/// One exec invocation inside an environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSession {
    /// Provider handle of the session
    pub handle: ExecSessionHandle,
    /// Request the session was created with
    pub config: ExecConfig,
}

/// A started exec session with its live conduits
#[derive(Debug)]
pub struct LaunchedSession {
    /// The exec session
    pub session: ExecSession,
    /// Writes reach the process stdin
    pub writer: ConduitWriter,
    /// Reads yield the process stdout
    pub reader: ConduitReader,
    /// Worker feeding `reader`
    pub pump: FramePump,
    /// Teardown owner of the session
    pub lifecycle: Arc<ChannelLifecycle>,
}

/// Build the exec request for `command`
///
/// All three streams are attached and no TTY is allocated, so output arrives
/// as tagged frames. A blank user leaves the identity to the image.
pub fn exec_config(command: Vec<String>, user: Option<&str>) -> ExecConfig {
    ExecConfig {
        command,
        user: user
            .filter(|user| !user.trim().is_empty())
            .map(str::to_string),
        flags: AttachFlags {
            stdin: true,
            stdout: true,
            stderr: true,
            tty: false,
        },
    }
}

/// Starts exec sessions and wires them to a stream bridge
pub struct SessionLauncher {
    provider: Arc<dyn EnvironmentProvider>,
    pipe_capacity: usize,
    diagnostics: Option<Arc<dyn DiagnosticSink>>,
}

impl SessionLauncher {
    /// Create a launcher for `provider`
    pub fn new(provider: Arc<dyn EnvironmentProvider>) -> Self {
        Self {
            provider,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            diagnostics: None,
        }
    }

    /// Set the conduit buffer size
    pub fn with_pipe_capacity(mut self, pipe_capacity: usize) -> Self {
        self.pipe_capacity = pipe_capacity;
        self
    }

    /// Send process stderr to `diagnostics` instead of the log
    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// Run `command` in `env` and return the session with its conduits
    ///
    /// The environment must be running. Failures to create or start the
    /// session are not retried.
    pub async fn launch(
        &self,
        env: &EnvironmentHandle,
        command: Vec<String>,
        user: Option<&str>,
    ) -> Result<LaunchedSession> {
        let status = self
            .provider
            .inspect_environment(env.id())
            .await
            .map_err(BridgeError::Provisioning)?;
        if !status.state.is_running() {
            return Err(BridgeError::Provisioning(ProviderError::NotRunning {
                id: status.id,
                state: status.state,
            }));
        }

        let config = exec_config(command, user);
        debug!(
            "Creating exec session in {} for {:?} as {:?}",
            env.id(),
            config.command,
            config.user
        );

        let handle = self
            .provider
            .create_exec_session(env, &config)
            .await
            .map_err(BridgeError::Launch)?;

        let (bridge, stdin) = StreamBridge::new(self.pipe_capacity);
        let frames = self
            .provider
            .start_exec_session(&handle, stdin)
            .await
            .map_err(BridgeError::Launch)?;
        debug!("Exec session {} started", handle.id);

        let lifecycle = Arc::new(ChannelLifecycle::new(
            Arc::clone(&self.provider),
            handle.clone(),
        ));
        let diagnostics = self
            .diagnostics
            .clone()
            .unwrap_or_else(|| Arc::new(TracingDiagnostics::new(env.id())));
        let (writer, reader, pump) = bridge.open(frames, diagnostics, Arc::clone(&lifecycle));

        Ok(LaunchedSession {
            session: ExecSession { handle, config },
            writer,
            reader,
            pump,
            lifecycle,
        })
    }
}
