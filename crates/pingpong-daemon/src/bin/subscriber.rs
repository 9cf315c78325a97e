//! subscriber: answers every ping addressed to its key with a pong.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use pingpong_core::{shutdown, ConnectionManager, Identity, ResponderLoop};
use pingpong_daemon::signal::spawn_shutdown_listener;
use pingpong_daemon::{logging, RelayClientConfig, RetryArgs, WebSocketRelay};

#[derive(Parser, Debug)]
#[command(name = "subscriber")]
#[command(about = "Answer nostr pings with pongs")]
struct Args {
    /// Relay URL (ws:// or wss://)
    relay: String,

    /// Secret key, hex or nsec
    secret_key: String,

    #[command(flatten)]
    retry: RetryArgs,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    let identity = Arc::new(Identity::from_secret(&args.secret_key).context("Invalid secret key")?);
    info!("Subscriber public key: {}", identity.public_key());
    info!("Subscriber npub: {}", identity.npub().context("Failed to encode npub")?);

    let (trigger, shutdown) = shutdown::channel();
    spawn_shutdown_listener(trigger);

    let connector = Arc::new(WebSocketRelay::new(RelayClientConfig::default()));
    let manager = ConnectionManager::new(args.relay, connector, args.retry.into());

    let mut responder = ResponderLoop::new(identity);
    manager.drive(&mut responder, &shutdown).await;

    info!("Stopped after answering {} ping(s)", responder.answered());
    Ok(())
}
