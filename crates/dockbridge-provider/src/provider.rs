//! Environment provider abstraction and the handles it hands out

use crate::ProviderError;
use async_trait::async_trait;
use dockbridge_proto::Frame;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::pin::Pin;
use tokio::io::AsyncRead;

/// Input source consumed by a started exec session
pub type ExecStdin = Box<dyn AsyncRead + Send + Unpin>;

/// Frames produced by a started exec session, in transport order
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, ProviderError>> + Send>>;

/// Remote environment provider
///
/// Implementations own the environment lifecycle and the exec attach
/// transport. `close_exec_session` is called at most once per session by
/// the bridge, so implementations need not make it idempotent.
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    /// Create an environment, returning its id
    async fn create_environment(
        &self,
        request: CreateEnvironmentRequest,
    ) -> Result<String, ProviderError>;

    /// Start a created environment
    async fn start_environment(&self, id: &str) -> Result<(), ProviderError>;

    /// Report the runtime state of an environment
    async fn inspect_environment(&self, id: &str) -> Result<EnvironmentStatus, ProviderError>;

    /// Create an exec session inside a running environment
    async fn create_exec_session(
        &self,
        env: &EnvironmentHandle,
        config: &ExecConfig,
    ) -> Result<ExecSessionHandle, ProviderError>;

    /// Start an exec session, consuming `stdin` on the provider's own I/O path
    async fn start_exec_session(
        &self,
        session: &ExecSessionHandle,
        stdin: ExecStdin,
    ) -> Result<FrameStream, ProviderError>;

    /// Detach from an exec session and release its transport
    async fn close_exec_session(&self, session: &ExecSessionHandle) -> Result<(), ProviderError>;

    /// Copy a local file into a directory of the environment
    async fn copy_file_into_environment(
        &self,
        id: &str,
        local_path: &Path,
        remote_dir: &str,
    ) -> Result<(), ProviderError>;
}

/// Request used to create a remote environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateEnvironmentRequest {
    /// Image the environment is created from
    pub image: String,
    /// Optional environment name
    pub name: Option<String>,
    /// Main process command, empty for the image default
    pub command: Vec<String>,
    /// Entrypoint override, empty for the image default
    pub entrypoint: Vec<String>,
    /// Allocate a TTY for the main process
    pub tty: bool,
    /// Keep the main process stdin open
    pub open_stdin: bool,
    /// Environment variables (`KEY=value`)
    pub env: Vec<String>,
    /// Working directory of the main process
    pub working_dir: Option<String>,
    /// Labels attached to the environment
    pub labels: HashMap<String, String>,
}

impl CreateEnvironmentRequest {
    /// Create a request for the given image
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Set the main process command
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }
}

/// Runtime state of a remote environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeState {
    /// Created but never started
    Created,
    /// Main process is running
    Running,
    /// Processes are frozen
    Paused,
    /// Restarting after exit
    Restarting,
    /// Being removed
    Removing,
    /// Main process exited
    Exited,
    /// Unrecoverable
    Dead,
    /// State not reported
    Unknown,
}

impl RuntimeState {
    /// Parse an engine state name such as `running`
    pub fn parse(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }

    /// Check if the environment can host exec sessions
    pub fn is_running(self) -> bool {
        self == Self::Running
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Result of inspecting an environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentStatus {
    /// Environment id
    pub id: String,
    /// Current runtime state
    pub state: RuntimeState,
}

/// Handle to a started remote environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentHandle {
    id: String,
    remote_fs: String,
    user: Option<String>,
}

impl EnvironmentHandle {
    /// Create a handle for an environment and its filesystem root
    pub fn new(id: impl Into<String>, remote_fs: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            remote_fs: remote_fs.into(),
            user: None,
        }
    }

    /// Set the execution user configured for the environment
    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    /// Environment id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Filesystem root the agent payload lives in
    pub fn remote_fs(&self) -> &str {
        &self.remote_fs
    }

    /// Configured execution user
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }
}

/// Stream attachment flags of an exec session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachFlags {
    /// Attach the process stdin
    pub stdin: bool,
    /// Attach the process stdout
    pub stdout: bool,
    /// Attach the process stderr
    pub stderr: bool,
    /// Allocate a TTY
    pub tty: bool,
}

impl Default for AttachFlags {
    fn default() -> Self {
        Self {
            stdin: true,
            stdout: true,
            stderr: true,
            tty: false,
        }
    }
}

/// Exec session request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Command line to run
    pub command: Vec<String>,
    /// Identity to run the command as
    pub user: Option<String>,
    /// Attachment flags
    pub flags: AttachFlags,
}

/// Provider-side handle to a created exec session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecSessionHandle {
    /// Exec session id
    pub id: String,
    /// Environment the session runs in
    pub environment_id: String,
}

impl ExecSessionHandle {
    /// Create a new exec session handle
    pub fn new(id: impl Into<String>, environment_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            environment_id: environment_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_flags_default() {
        let flags = AttachFlags::default();
        assert!(flags.stdin);
        assert!(flags.stdout);
        assert!(flags.stderr);
        assert!(!flags.tty);
    }

    #[test]
    fn test_runtime_state_parse() {
        assert_eq!(RuntimeState::parse("running"), RuntimeState::Running);
        assert_eq!(RuntimeState::parse(" Exited "), RuntimeState::Exited);
        assert_eq!(RuntimeState::parse(""), RuntimeState::Unknown);
        assert!(RuntimeState::Running.is_running());
        assert!(!RuntimeState::Paused.is_running());
        assert_eq!(RuntimeState::Dead.to_string(), "dead");
    }

    #[test]
    fn test_request_defaults() {
        let request = CreateEnvironmentRequest::new("alpine:3");
        assert_eq!(request.image, "alpine:3");
        assert!(request.command.is_empty());
        assert!(!request.tty);

        let request = request.with_command(["sleep", "infinity"]);
        assert_eq!(request.command, vec!["sleep", "infinity"]);
    }

    #[test]
    fn test_environment_handle() {
        let handle = EnvironmentHandle::new("abc123", "/home/agent")
            .with_user(Some("builder".to_string()));
        assert_eq!(handle.id(), "abc123");
        assert_eq!(handle.remote_fs(), "/home/agent");
        assert_eq!(handle.user(), Some("builder"));
    }
}
