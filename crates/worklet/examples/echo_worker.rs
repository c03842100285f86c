//! Minimal worker: connects to its manager, echoes every message back, and
//! forwards its own logs as console output.
//!
//! The manager is expected to have set up the peer endpoint under the channel
//! name derived from this process's id (or `worker_debug` when launched with
//! the debug flag in WORKLET_LAUNCH_INFO).

use anyhow::Result;
use tracing_subscriber::prelude::*;
use worklet::{LifecycleHooks, WorkerClient, WorkerOptions};

#[tokio::main]
async fn main() -> Result<()> {
    let hooks = LifecycleHooks::new();
    let options = WorkerOptions::from_env()?;
    let client = WorkerClient::initialize(options, &hooks).await?;

    tracing_subscriber::registry()
        .with(client.console_layer())
        .init();
    tracing::info!("worker connected");

    while let Some(message) = client.receive(true).await {
        tracing::info!(id = message.id(), size = message.len(), "echoing message");
        if !client.send(message.id(), message.payload()) {
            break;
        }
    }

    hooks.emit_shutdown();
    Ok(())
}
