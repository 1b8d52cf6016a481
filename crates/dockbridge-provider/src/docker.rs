//! Docker engine provider

use crate::{
    CreateEnvironmentRequest, EnvironmentHandle, EnvironmentProvider, EnvironmentStatus,
    ExecConfig, ExecSessionHandle, ExecStdin, FrameStream, ProviderError, RuntimeState,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::Docker;
use dockbridge_proto::{Frame, StreamType};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Script run by the exec that receives copied files
const RECEIVE_FILE_SCRIPT: &str = r#"mkdir -p "$1" && cat > "$2""#;

/// Environment provider backed by a Docker engine
pub struct DockerProvider {
    docker: Docker,
    /// Cancellation of live exec attachments, keyed by exec id
    attachments: Mutex<HashMap<String, CancellationToken>>,
}

impl DockerProvider {
    /// Wrap an existing engine client
    pub fn new(docker: Docker) -> Self {
        Self {
            docker,
            attachments: Mutex::new(HashMap::new()),
        }
    }

    /// Connect to the local engine using the environment defaults
    pub fn connect_local() -> Result<Self, ProviderError> {
        Ok(Self::new(Docker::connect_with_local_defaults()?))
    }

    /// Engine client used by this provider
    pub fn client(&self) -> &Docker {
        &self.docker
    }
}

fn non_empty<T>(values: Vec<T>) -> Option<Vec<T>> {
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

fn frame_from_log(output: LogOutput) -> Frame {
    match output {
        LogOutput::StdOut { message } => Frame::stdout(message),
        LogOutput::StdErr { message } => Frame::stderr(message),
        LogOutput::StdIn { message } => Frame::new(StreamType::Stdin, message),
        LogOutput::Console { message } => Frame::raw(message),
    }
}

#[async_trait]
impl EnvironmentProvider for DockerProvider {
    async fn create_environment(
        &self,
        request: CreateEnvironmentRequest,
    ) -> Result<String, ProviderError> {
        let options = request.name.clone().map(|name| CreateContainerOptions {
            name,
            platform: None,
        });
        let labels = if request.labels.is_empty() {
            None
        } else {
            Some(request.labels)
        };
        let config = Config {
            image: Some(request.image),
            cmd: non_empty(request.command),
            entrypoint: non_empty(request.entrypoint),
            tty: Some(request.tty),
            open_stdin: Some(request.open_stdin),
            env: non_empty(request.env),
            working_dir: request.working_dir,
            labels,
            ..Default::default()
        };

        let response = self.docker.create_container(options, config).await?;
        for warning in &response.warnings {
            warn!("Container {} created with warning: {}", response.id, warning);
        }
        info!("Created container {}", response.id);
        Ok(response.id)
    }

    async fn start_environment(&self, id: &str) -> Result<(), ProviderError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        debug!("Started container {}", id);
        Ok(())
    }

    async fn inspect_environment(&self, id: &str) -> Result<EnvironmentStatus, ProviderError> {
        let response = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;

        let state = response
            .state
            .and_then(|state| state.status)
            .map(|status| RuntimeState::parse(&status.to_string()))
            .unwrap_or(RuntimeState::Unknown);

        Ok(EnvironmentStatus {
            id: response.id.unwrap_or_else(|| id.to_string()),
            state,
        })
    }

    async fn create_exec_session(
        &self,
        env: &EnvironmentHandle,
        config: &ExecConfig,
    ) -> Result<ExecSessionHandle, ProviderError> {
        let options = CreateExecOptions {
            attach_stdin: Some(config.flags.stdin),
            attach_stdout: Some(config.flags.stdout),
            attach_stderr: Some(config.flags.stderr),
            tty: Some(config.flags.tty),
            cmd: Some(config.command.clone()),
            user: config.user.clone(),
            ..Default::default()
        };

        let created = self.docker.create_exec(env.id(), options).await?;
        debug!("Created exec {} in container {}", created.id, env.id());
        Ok(ExecSessionHandle::new(created.id, env.id()))
    }

    async fn start_exec_session(
        &self,
        session: &ExecSessionHandle,
        mut stdin: ExecStdin,
    ) -> Result<FrameStream, ProviderError> {
        let options = StartExecOptions {
            detach: false,
            ..Default::default()
        };

        match self.docker.start_exec(&session.id, Some(options)).await? {
            StartExecResults::Attached { output, mut input } => {
                let cancel = CancellationToken::new();
                self.attachments
                    .lock()
                    .await
                    .insert(session.id.clone(), cancel.clone());

                let exec_id = session.id.clone();
                let stdin_cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = stdin_cancel.cancelled() => {
                            debug!("Stdin pump for exec {} cancelled", exec_id);
                        }
                        copied = tokio::io::copy(&mut stdin, &mut input) => match copied {
                            Ok(bytes) => {
                                debug!("Stdin of exec {} ended after {} bytes", exec_id, bytes);
                                let _ = input.shutdown().await;
                            }
                            Err(e) => debug!("Stdin pump for exec {} stopped: {}", exec_id, e),
                        },
                    }
                });

                let frames = output
                    .map(|item| item.map(frame_from_log).map_err(ProviderError::from))
                    .take_until(async move { cancel.cancelled().await });
                Ok(Box::pin(frames))
            }
            StartExecResults::Detached => Err(ProviderError::Api(format!(
                "exec {} started detached",
                session.id
            ))),
        }
    }

    async fn close_exec_session(&self, session: &ExecSessionHandle) -> Result<(), ProviderError> {
        let token = self.attachments.lock().await.remove(&session.id);
        match token {
            Some(token) => {
                token.cancel();
                debug!("Detached from exec {}", session.id);
                Ok(())
            }
            None => Err(ProviderError::ExecNotFound(session.id.clone())),
        }
    }

    async fn copy_file_into_environment(
        &self,
        id: &str,
        local_path: &Path,
        remote_dir: &str,
    ) -> Result<(), ProviderError> {
        let name = local_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                ProviderError::Configuration(format!("{} has no file name", local_path.display()))
            })?;
        let dir = remote_dir.trim_end_matches('/');
        let target = format!("{}/{}", dir, name);
        let contents = tokio::fs::read(local_path).await?;

        let options = CreateExecOptions {
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                RECEIVE_FILE_SCRIPT.to_string(),
                "sh".to_string(),
                dir.to_string(),
                target.clone(),
            ]),
            ..Default::default()
        };
        let exec = self.docker.create_exec(id, options).await?;

        let mut stderr = String::new();
        match self.docker.start_exec(&exec.id, None).await? {
            StartExecResults::Attached {
                mut output,
                mut input,
            } => {
                input.write_all(&contents).await?;
                input.shutdown().await?;
                while let Some(item) = output.next().await {
                    if let LogOutput::StdErr { message } = item? {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(ProviderError::Api(format!(
                    "copy exec {} started detached",
                    exec.id
                )));
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        match inspect.exit_code {
            Some(0) => {
                info!("Copied {} to {}:{}", local_path.display(), id, target);
                Ok(())
            }
            Some(code) => Err(ProviderError::CommandFailed {
                code,
                message: stderr.trim().to_string(),
            }),
            None => Err(ProviderError::Api(format!(
                "copy exec {} reported no exit code",
                exec.id
            ))),
        }
    }
}
