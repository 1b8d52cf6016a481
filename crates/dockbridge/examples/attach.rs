//! Attach an agent in a local Docker container to this terminal
//!
//! ```text
//! cargo run -p dockbridge --features docker --example attach -- <image> <payload> [launcher...]
//! ```
//!
//! The container is created with the attach hooks, the payload is copied into
//! it and started with the launcher prefix (`java -jar` by default). The
//! terminal stands in for the control-plane channel: local stdin is sent to
//! the agent and the agent's stdout is printed. Set `RUST_LOG=debug` to follow
//! the lifecycle.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use dockbridge::provider::{CreateEnvironmentRequest, DockerProvider};
use dockbridge::{
    AgentPayload, AttachConfig, AttachConnector, ChannelInput, ChannelListener, ChannelOutput,
    ControlChannel,
};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Channel that copies the conduits to and from the local terminal
struct StdioChannel;

#[async_trait]
impl ControlChannel for StdioChannel {
    async fn set_channel(
        &self,
        mut input: ChannelInput,
        mut output: ChannelOutput,
        listener: Arc<dyn ChannelListener>,
    ) -> io::Result<()> {
        tokio::spawn(async move {
            let mut stdin = tokio::io::stdin();
            if let Err(e) = tokio::io::copy(&mut stdin, &mut output).await {
                error!("Failed to forward stdin: {}", e);
            }
        });

        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            match tokio::io::copy(&mut input, &mut stdout).await {
                Ok(_) => listener.on_closed(None),
                Err(e) => listener.on_closed(Some(e)),
            }
        });

        Ok(())
    }
}

async fn run() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let (Some(image), Some(payload)) = (args.next(), args.next()) else {
        bail!("usage: attach <image> <payload> [launcher...]");
    };
    let launcher: Vec<String> = args.collect();

    let mut config = match std::env::var("DOCKBRIDGE_CONFIG") {
        Ok(json) => AttachConfig::from_json(&json)?,
        Err(_) => AttachConfig::default(),
    };
    config.agent = if launcher.is_empty() {
        AgentPayload {
            local_path: payload.into(),
            ..AgentPayload::default()
        }
    } else {
        AgentPayload::new(payload, launcher)
    };

    let connector = AttachConnector::new(config)?;
    let provider = Arc::new(DockerProvider::connect_local().context("Docker is not reachable")?);

    let env = connector
        .provision(provider.as_ref(), CreateEnvironmentRequest::new(image))
        .await?;
    info!("Environment {} ready", env.id());

    let live = connector.connect(provider, &env, &StdioChannel).await?;
    live.closed().await;
    live.wait().await?;

    info!("Agent session in {} ended", env.id());
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = tokio::runtime::Runtime::new()?;
    let outcome = runtime.block_on(run());
    // A pending read of local stdin holds a blocking thread until input arrives
    runtime.shutdown_timeout(Duration::from_secs(1));
    outcome
}
