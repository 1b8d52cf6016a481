//! In-process environment provider
//!
//! Environments and exec sessions live in memory. Every exec session comes
//! with a [`RemoteProcess`] that plays the remote side of the attach stream:
//! it writes wire-encoded frames the same way an engine's hijacked connection
//! would, and can inject transport faults. Bytes consumed from the session's
//! stdin are collected and can be read back once the input ends.
//!
//! Records are never removed so tests can inspect them after teardown.
//! Closing an exec session drops its connection ends and keeps only the
//! configuration, the collected stdin and the close count.

use crate::{
    CreateEnvironmentRequest, EnvironmentHandle, EnvironmentProvider, EnvironmentStatus,
    ExecConfig, ExecSessionHandle, ExecStdin, FrameStream, ProviderError, RuntimeState,
};
use async_trait::async_trait;
use bytes::Bytes;
use dockbridge_proto::{frames_from_reader, Frame, MuxCodec, ProtocolError};
use futures::{stream, SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Buffer size of the simulated attach connection
const ATTACH_CAPACITY: usize = 64 * 1024;

/// Provider operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `create_environment`
    CreateEnvironment,
    /// `start_environment`
    StartEnvironment,
    /// `inspect_environment`
    InspectEnvironment,
    /// `create_exec_session`
    CreateExec,
    /// `start_exec_session`
    StartExec,
    /// `close_exec_session`
    CloseExec,
    /// `copy_file_into_environment`
    CopyFile,
}

/// Remote end of an in-memory exec session
pub struct RemoteProcess {
    frames: FramedWrite<DuplexStream, MuxCodec>,
    faults: mpsc::UnboundedSender<ProviderError>,
}

impl RemoteProcess {
    /// Emit a frame on the attach stream
    pub async fn send(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        self.frames.send(frame).await
    }

    /// Write bytes to the attach stream without framing them
    pub async fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        let conn = self.frames.get_mut();
        conn.write_all(bytes).await?;
        conn.flush().await
    }

    /// Inject a transport fault into the session's frame stream
    ///
    /// Faults travel out of band, so they are not ordered with frames that
    /// are still buffered on the attach connection.
    pub fn fail(&self, error: ProviderError) {
        let _ = self.faults.send(error);
    }

    /// End the remote process, closing its attach stream
    pub fn exit(self) {}
}

struct EnvironmentRecord {
    request: CreateEnvironmentRequest,
    state: RuntimeState,
    files: HashMap<String, Bytes>,
}

struct ExecRecord {
    environment_id: String,
    config: ExecConfig,
    attach: Option<(DuplexStream, mpsc::UnboundedReceiver<ProviderError>)>,
    remote: Option<RemoteProcess>,
    stdin_task: Option<JoinHandle<Vec<u8>>>,
    cancel: CancellationToken,
    close_calls: usize,
}

struct State {
    environments: HashMap<String, EnvironmentRecord>,
    execs: HashMap<String, ExecRecord>,
    failures: HashSet<Operation>,
    start_state: RuntimeState,
}

impl State {
    fn check(&self, operation: Operation) -> Result<(), ProviderError> {
        if self.failures.contains(&operation) {
            return Err(ProviderError::Api(format!("{:?} rejected", operation)));
        }
        Ok(())
    }

    fn running_environment(&mut self, id: &str) -> Result<&mut EnvironmentRecord, ProviderError> {
        let record = self
            .environments
            .get_mut(id)
            .ok_or_else(|| ProviderError::EnvironmentNotFound(id.to_string()))?;
        if !record.state.is_running() {
            return Err(ProviderError::NotRunning {
                id: id.to_string(),
                state: record.state,
            });
        }
        Ok(record)
    }
}

/// Environment provider backed by process memory
pub struct InMemoryProvider {
    state: Mutex<State>,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProvider {
    /// Create an empty provider
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                environments: HashMap::new(),
                execs: HashMap::new(),
                failures: HashSet::new(),
                start_state: RuntimeState::Running,
            }),
        }
    }

    /// Make every future call of `operation` fail
    pub async fn fail_on(&self, operation: Operation) {
        self.state.lock().await.failures.insert(operation);
    }

    /// State environments enter when started (running by default)
    pub async fn start_in_state(&self, state: RuntimeState) {
        self.state.lock().await.start_state = state;
    }

    /// Force the runtime state of an environment
    pub async fn set_state(&self, id: &str, state: RuntimeState) -> Result<(), ProviderError> {
        let mut guard = self.state.lock().await;
        let record = guard
            .environments
            .get_mut(id)
            .ok_or_else(|| ProviderError::EnvironmentNotFound(id.to_string()))?;
        record.state = state;
        Ok(())
    }

    /// Request an environment was created with
    pub async fn created_request(&self, id: &str) -> Option<CreateEnvironmentRequest> {
        let guard = self.state.lock().await;
        guard.environments.get(id).map(|record| record.request.clone())
    }

    /// File copied into an environment, keyed by its remote path
    pub async fn file(&self, id: &str, remote_path: &str) -> Option<Bytes> {
        let guard = self.state.lock().await;
        guard
            .environments
            .get(id)
            .and_then(|record| record.files.get(remote_path).cloned())
    }

    /// Configuration an exec session was created with
    pub async fn exec_config(&self, exec_id: &str) -> Option<ExecConfig> {
        let guard = self.state.lock().await;
        guard.execs.get(exec_id).map(|record| record.config.clone())
    }

    /// Ids of the exec sessions created in an environment
    pub async fn exec_ids(&self, environment_id: &str) -> Vec<String> {
        let guard = self.state.lock().await;
        guard
            .execs
            .iter()
            .filter(|(_, record)| record.environment_id == environment_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of times `close_exec_session` was called for a session
    pub async fn close_calls(&self, exec_id: &str) -> usize {
        let guard = self.state.lock().await;
        guard.execs.get(exec_id).map_or(0, |record| record.close_calls)
    }

    /// Take the remote end of an exec session
    pub async fn remote_process(&self, exec_id: &str) -> Option<RemoteProcess> {
        let mut guard = self.state.lock().await;
        guard.execs.get_mut(exec_id)?.remote.take()
    }

    /// Wait for the session's stdin to end and return everything it carried
    pub async fn stdin_received(&self, exec_id: &str) -> Result<Vec<u8>, ProviderError> {
        let task = {
            let mut guard = self.state.lock().await;
            let record = guard
                .execs
                .get_mut(exec_id)
                .ok_or_else(|| ProviderError::ExecNotFound(exec_id.to_string()))?;
            record
                .stdin_task
                .take()
                .ok_or_else(|| ProviderError::Stream("stdin is not attached".to_string()))?
        };

        task.await
            .map_err(|e| ProviderError::Stream(format!("stdin reader failed: {}", e)))
    }
}

fn codec_for(config: &ExecConfig) -> MuxCodec {
    if config.flags.tty {
        MuxCodec::raw()
    } else {
        MuxCodec::new()
    }
}

async fn collect_stdin(mut stdin: ExecStdin, cancel: CancellationToken) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = stdin.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(e) => {
                    debug!("In-memory exec stdin failed: {}", e);
                    break;
                }
            },
        }
    }

    received
}

#[async_trait]
impl EnvironmentProvider for InMemoryProvider {
    async fn create_environment(
        &self,
        request: CreateEnvironmentRequest,
    ) -> Result<String, ProviderError> {
        let mut guard = self.state.lock().await;
        guard.check(Operation::CreateEnvironment)?;

        let id = Uuid::new_v4().simple().to_string();
        guard.environments.insert(
            id.clone(),
            EnvironmentRecord {
                request,
                state: RuntimeState::Created,
                files: HashMap::new(),
            },
        );
        Ok(id)
    }

    async fn start_environment(&self, id: &str) -> Result<(), ProviderError> {
        let mut guard = self.state.lock().await;
        guard.check(Operation::StartEnvironment)?;

        let start_state = guard.start_state;
        let record = guard
            .environments
            .get_mut(id)
            .ok_or_else(|| ProviderError::EnvironmentNotFound(id.to_string()))?;
        record.state = start_state;
        Ok(())
    }

    async fn inspect_environment(&self, id: &str) -> Result<EnvironmentStatus, ProviderError> {
        let guard = self.state.lock().await;
        guard.check(Operation::InspectEnvironment)?;

        let record = guard
            .environments
            .get(id)
            .ok_or_else(|| ProviderError::EnvironmentNotFound(id.to_string()))?;
        Ok(EnvironmentStatus {
            id: id.to_string(),
            state: record.state,
        })
    }

    async fn create_exec_session(
        &self,
        env: &EnvironmentHandle,
        config: &ExecConfig,
    ) -> Result<ExecSessionHandle, ProviderError> {
        let mut guard = self.state.lock().await;
        guard.check(Operation::CreateExec)?;
        guard.running_environment(env.id())?;

        let (remote_conn, local_conn) = tokio::io::duplex(ATTACH_CAPACITY);
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let remote = RemoteProcess {
            frames: FramedWrite::new(remote_conn, codec_for(config)),
            faults: faults_tx,
        };

        let id = Uuid::new_v4().simple().to_string();
        guard.execs.insert(
            id.clone(),
            ExecRecord {
                environment_id: env.id().to_string(),
                config: config.clone(),
                attach: Some((local_conn, faults_rx)),
                remote: Some(remote),
                stdin_task: None,
                cancel: CancellationToken::new(),
                close_calls: 0,
            },
        );
        Ok(ExecSessionHandle::new(id, env.id()))
    }

    async fn start_exec_session(
        &self,
        session: &ExecSessionHandle,
        stdin: ExecStdin,
    ) -> Result<FrameStream, ProviderError> {
        let mut guard = self.state.lock().await;
        guard.check(Operation::StartExec)?;

        let record = guard
            .execs
            .get_mut(&session.id)
            .ok_or_else(|| ProviderError::ExecNotFound(session.id.clone()))?;
        let (conn, faults) = record
            .attach
            .take()
            .ok_or_else(|| ProviderError::Api(format!("exec {} already started", session.id)))?;

        if record.config.flags.stdin {
            let task = tokio::spawn(collect_stdin(stdin, record.cancel.clone()));
            record.stdin_task = Some(task);
        }

        let decoded = frames_from_reader(conn, codec_for(&record.config))
            .map(|item| item.map_err(ProviderError::from));
        let faults = stream::unfold(faults, |mut rx| async move {
            rx.recv().await.map(|error| (Err::<Frame, ProviderError>(error), rx))
        });
        let cancel = record.cancel.clone();
        let frames = stream::select(decoded, faults)
            .take_until(async move { cancel.cancelled().await });

        Ok(Box::pin(frames))
    }

    async fn close_exec_session(&self, session: &ExecSessionHandle) -> Result<(), ProviderError> {
        let mut guard = self.state.lock().await;
        let failing = guard.check(Operation::CloseExec);

        let record = guard
            .execs
            .get_mut(&session.id)
            .ok_or_else(|| ProviderError::ExecNotFound(session.id.clone()))?;
        record.close_calls += 1;
        record.cancel.cancel();
        record.attach = None;
        record.remote = None;
        failing
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
            })?
            .to_string();
        let contents = tokio::fs::read(local_path).await?;

        let mut guard = self.state.lock().await;
        guard.check(Operation::CopyFile)?;
        let record = guard.running_environment(id)?;

        let remote_path = format!("{}/{}", remote_dir.trim_end_matches('/'), name);
        debug!("Copied {} into {}:{}", local_path.display(), id, remote_path);
        record.files.insert(remote_path, Bytes::from(contents));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AttachFlags;
    use dockbridge_proto::StreamType;
    use std::io::Write;

    fn exec_config(command: &[&str]) -> ExecConfig {
        ExecConfig {
            command: command.iter().map(|arg| arg.to_string()).collect(),
            user: None,
            flags: AttachFlags::default(),
        }
    }

    async fn running_env(provider: &InMemoryProvider) -> EnvironmentHandle {
        let id = provider
            .create_environment(CreateEnvironmentRequest::new("debian:stable"))
            .await
            .unwrap();
        provider.start_environment(&id).await.unwrap();
        EnvironmentHandle::new(id, "/home/agent")
    }

    #[tokio::test]
    async fn test_environment_lifecycle() {
        let provider = InMemoryProvider::new();
        let id = provider
            .create_environment(CreateEnvironmentRequest::new("debian:stable"))
            .await
            .unwrap();

        let status = provider.inspect_environment(&id).await.unwrap();
        assert_eq!(status.state, RuntimeState::Created);

        provider.start_environment(&id).await.unwrap();
        let status = provider.inspect_environment(&id).await.unwrap();
        assert_eq!(status.state, RuntimeState::Running);

        let missing = provider.inspect_environment("nope").await;
        assert!(matches!(missing, Err(ProviderError::EnvironmentNotFound(_))));
    }

    #[tokio::test]
    async fn test_exec_requires_running_environment() {
        let provider = InMemoryProvider::new();
        let env = running_env(&provider).await;
        provider.set_state(env.id(), RuntimeState::Exited).await.unwrap();

        let result = provider.create_exec_session(&env, &exec_config(&["true"])).await;
        assert!(matches!(
            result,
            Err(ProviderError::NotRunning { state: RuntimeState::Exited, .. })
        ));
    }

    #[tokio::test]
    async fn test_exec_frames_and_stdin() {
        let provider = InMemoryProvider::new();
        let env = running_env(&provider).await;
        let session = provider
            .create_exec_session(&env, &exec_config(&["cat"]))
            .await
            .unwrap();

        let (mut local, remote_stdin) = tokio::io::duplex(64);
        let mut frames = provider
            .start_exec_session(&session, Box::new(remote_stdin))
            .await
            .unwrap();

        let mut remote = provider.remote_process(&session.id).await.unwrap();
        remote.send(Frame::stdout("out")).await.unwrap();
        remote.send(Frame::stderr("err")).await.unwrap();
        remote.exit();

        let first = frames.next().await.unwrap().unwrap();
        assert_eq!(first, Frame::stdout("out"));
        let second = frames.next().await.unwrap().unwrap();
        assert_eq!(second.stream_type, StreamType::Stderr);
        assert!(frames.next().await.is_none());

        local.write_all(b"input bytes").await.unwrap();
        local.shutdown().await.unwrap();
        drop(local);
        assert_eq!(provider.stdin_received(&session.id).await.unwrap(), b"input bytes");
    }

    #[tokio::test]
    async fn test_close_ends_frame_stream() {
        let provider = InMemoryProvider::new();
        let env = running_env(&provider).await;
        let session = provider
            .create_exec_session(&env, &exec_config(&["cat"]))
            .await
            .unwrap();
        let (_local, remote_stdin) = tokio::io::duplex(64);
        let mut frames = provider
            .start_exec_session(&session, Box::new(remote_stdin))
            .await
            .unwrap();

        provider.close_exec_session(&session).await.unwrap();
        assert!(frames.next().await.is_none());
        assert_eq!(provider.close_calls(&session.id).await, 1);
    }

    #[tokio::test]
    async fn test_close_releases_connection_ends() {
        let provider = InMemoryProvider::new();
        let env = running_env(&provider).await;
        let session = provider
            .create_exec_session(&env, &exec_config(&["cat"]))
            .await
            .unwrap();

        provider.close_exec_session(&session).await.unwrap();
        assert!(provider.remote_process(&session.id).await.is_none());

        let (_local, remote_stdin) = tokio::io::duplex(64);
        let started = provider.start_exec_session(&session, Box::new(remote_stdin)).await;
        assert!(matches!(started, Err(ProviderError::Api(_))));

        assert_eq!(provider.close_calls(&session.id).await, 1);
        assert!(provider.exec_config(&session.id).await.is_some());
    }

    #[tokio::test]
    async fn test_injected_fault_surfaces_as_error() {
        let provider = InMemoryProvider::new();
        let env = running_env(&provider).await;
        let session = provider
            .create_exec_session(&env, &exec_config(&["cat"]))
            .await
            .unwrap();
        let (_local, remote_stdin) = tokio::io::duplex(64);
        let mut frames = provider
            .start_exec_session(&session, Box::new(remote_stdin))
            .await
            .unwrap();

        let remote = provider.remote_process(&session.id).await.unwrap();
        remote.fail(ProviderError::Stream("connection reset".to_string()));

        let item = frames.next().await.unwrap();
        assert!(matches!(item, Err(ProviderError::Stream(_))));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let provider = InMemoryProvider::new();
        let env = running_env(&provider).await;
        let session = provider
            .create_exec_session(&env, &exec_config(&["cat"]))
            .await
            .unwrap();

        let (_a, stdin_a) = tokio::io::duplex(64);
        let _frames = provider
            .start_exec_session(&session, Box::new(stdin_a))
            .await
            .unwrap();
        let (_b, stdin_b) = tokio::io::duplex(64);
        let second = provider.start_exec_session(&session, Box::new(stdin_b)).await;
        assert!(matches!(second, Err(ProviderError::Api(_))));
    }

    #[tokio::test]
    async fn test_copy_file() {
        let provider = InMemoryProvider::new();
        let env = running_env(&provider).await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.jar");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"PK\x03\x04payload")
            .unwrap();

        provider
            .copy_file_into_environment(env.id(), &path, "/home/agent/")
            .await
            .unwrap();

        let copied = provider.file(env.id(), "/home/agent/agent.jar").await.unwrap();
        assert_eq!(&copied[..], b"PK\x03\x04payload");
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let provider = InMemoryProvider::new();
        provider.fail_on(Operation::CreateEnvironment).await;

        let result = provider
            .create_environment(CreateEnvironmentRequest::new("debian:stable"))
            .await;
        assert!(matches!(result, Err(ProviderError::Api(_))));
    }
}
