//! Pre-flight hooks and the provisioning sequence that invokes them

use crate::{CreateEnvironmentRequest, EnvironmentHandle, EnvironmentProvider, ProviderError};
use async_trait::async_trait;
use tracing::{debug, info};

/// Main process used when the request leaves the command unset
pub const WAIT_COMMAND: &[&str] = &["/bin/sh"];

/// Extension points invoked at fixed points of environment provisioning
#[async_trait]
pub trait PreflightHooks: Send + Sync {
    /// Adjust the creation request so the environment waits for an exec session
    fn ensure_waiting(&self, request: &mut CreateEnvironmentRequest);

    /// Make the agent payload available under the environment's filesystem root
    async fn inject_agent_payload(
        &self,
        provider: &dyn EnvironmentProvider,
        env: &EnvironmentHandle,
    ) -> Result<(), ProviderError>;
}

/// Keep an environment without a command from exiting right after start
///
/// An interactive shell with an open stdin and a TTY blocks until something
/// attaches, which leaves time for an exec session to be created.
pub fn hold_open(request: &mut CreateEnvironmentRequest) {
    if request.command.is_empty() {
        debug!("No command configured, holding environment open with {:?}", WAIT_COMMAND);
        request.command = WAIT_COMMAND.iter().map(|arg| arg.to_string()).collect();
        request.tty = true;
        request.open_stdin = true;
    }
}

/// Create and start an environment, running both hooks at their fixed points
pub async fn provision(
    provider: &dyn EnvironmentProvider,
    mut request: CreateEnvironmentRequest,
    hooks: &dyn PreflightHooks,
    remote_fs: &str,
    user: Option<String>,
) -> Result<EnvironmentHandle, ProviderError> {
    hooks.ensure_waiting(&mut request);

    info!("Creating environment from image {}", request.image);
    let id = provider.create_environment(request).await?;
    provider.start_environment(&id).await?;

    let status = provider.inspect_environment(&id).await?;
    if !status.state.is_running() {
        return Err(ProviderError::NotRunning {
            id,
            state: status.state,
        });
    }

    let handle = EnvironmentHandle::new(id, remote_fs).with_user(user);
    hooks.inject_agent_payload(provider, &handle).await?;

    info!("Environment {} is running and provisioned", handle.id());
    Ok(handle)
}
