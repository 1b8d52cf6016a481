//! Attach connector configuration

use crate::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default filesystem root of the agent inside the environment
pub const DEFAULT_REMOTE_FS: &str = "/home/agent";

/// Default size of each conduit buffer (64KB)
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// Agent executable injected into the environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentPayload {
    /// Local path of the payload; its file name is kept remotely
    pub local_path: PathBuf,
    /// Interpreter prefix used to start the payload
    pub launcher: Vec<String>,
}

impl Default for AgentPayload {
    fn default() -> Self {
        Self {
            local_path: PathBuf::from("remoting.jar"),
            launcher: vec!["java".to_string(), "-jar".to_string()],
        }
    }
}

impl AgentPayload {
    /// Create a payload started with the given launcher prefix
    pub fn new<I, S>(local_path: impl Into<PathBuf>, launcher: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            local_path: local_path.into(),
            launcher: launcher.into_iter().map(Into::into).collect(),
        }
    }

    /// File name of the payload
    pub fn file_name(&self) -> Result<&str> {
        self.local_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                BridgeError::Config(format!(
                    "agent payload {} has no file name",
                    self.local_path.display()
                ))
            })
    }

    /// Location of the payload under `remote_fs`
    pub fn remote_path(&self, remote_fs: &str) -> Result<String> {
        Ok(format!("{}/{}", remote_fs.trim_end_matches('/'), self.file_name()?))
    }

    /// Command line that starts the payload from `remote_fs`
    pub fn bootstrap_command(&self, remote_fs: &str) -> Result<Vec<String>> {
        let mut command = self.launcher.clone();
        command.push(self.remote_path(remote_fs)?);
        Ok(command)
    }
}

/// Configuration of the attach connector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachConfig {
    /// Identity the agent runs as; blank means the image default
    pub user: Option<String>,
    /// Filesystem root of the agent inside the environment
    pub remote_fs: String,
    /// Agent payload
    pub agent: AgentPayload,
    /// Buffer size of each conduit
    pub pipe_capacity: usize,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            user: None,
            remote_fs: DEFAULT_REMOTE_FS.to_string(),
            agent: AgentPayload::default(),
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
        }
    }
}

impl AttachConfig {
    /// Parse a configuration from JSON, filling unset fields with defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the execution user
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the filesystem root
    pub fn with_remote_fs(mut self, remote_fs: impl Into<String>) -> Self {
        self.remote_fs = remote_fs.into();
        self
    }

    /// Set the agent payload
    pub fn with_agent(mut self, agent: AgentPayload) -> Self {
        self.agent = agent;
        self
    }

    /// Set the conduit buffer size
    pub fn with_pipe_capacity(mut self, pipe_capacity: usize) -> Self {
        self.pipe_capacity = pipe_capacity;
        self
    }

    /// Execution user, if one is set and not blank
    pub fn effective_user(&self) -> Option<&str> {
        self.user.as_deref().filter(|user| !user.trim().is_empty())
    }

    /// Check the configuration for values no launch could work with
    pub fn validate(&self) -> Result<()> {
        if self.pipe_capacity == 0 {
            return Err(BridgeError::Config("pipe capacity must be non-zero".to_string()));
        }
        if !self.remote_fs.starts_with('/') {
            return Err(BridgeError::Config(format!(
                "remote filesystem root must be absolute: {:?}",
                self.remote_fs
            )));
        }
        if self.agent.launcher.is_empty() {
            return Err(BridgeError::Config("agent launcher is empty".to_string()));
        }
        self.agent.file_name()?;
        Ok(())
    }
}
