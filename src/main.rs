//! wsrelay - WebSocket message relay
//!
//! Runs a broker until Ctrl-C. Inbound messages are logged and, with
//! `--echo`, sent back to the client they came from.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wsrelay::relay::{Broker, RelayCli};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wsrelay=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = RelayCli::parse();
    let config = cli.broker_config().context("Failed to build configuration")?;

    if cli.print_config {
        print!("{}", config.describe());
        return Ok(());
    }

    let mut broker = Broker::new(config);
    let handle = broker.handle();
    let echo = cli.echo;

    broker.set_message_callback(move |id, payload| {
        info!("Message from {}: {} bytes", id, payload.len());
        if echo && !handle.send(payload.to_vec(), id) {
            tracing::warn!("Could not queue echo to {}", id);
        }
    });

    broker.start().context("Failed to start broker")?;
    if let Some(addr) = broker.local_addr() {
        info!("Relay listening on ws://{}", addr);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    tokio::task::spawn_blocking(move || broker.stop())
        .await
        .context("Broker shutdown task failed")?;

    Ok(())
}
