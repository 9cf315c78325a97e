//! publisher: sends pings to a target set and records who answers.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use pingpong_core::targets::clock_seeded_rng;
use pingpong_core::{shutdown, ConnectionManager, Correspondents, Identity, Publisher, TargetSet};
use pingpong_daemon::signal::spawn_shutdown_listener;
use pingpong_daemon::{logging, RelayClientConfig, RetryArgs, WebSocketRelay};

#[derive(Parser, Debug)]
#[command(name = "publisher")]
#[command(about = "Ping a set of nostr identities through a relay")]
struct Args {
    /// Relay URL (ws:// or wss://)
    relay: String,

    /// JSON file holding an array of npub strings
    targets: PathBuf,

    /// Seconds between pings
    #[arg(value_parser = clap::value_parser!(u64).range(1..))]
    interval: u64,

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

    let decoded = TargetSet::load(&args.targets)
        .with_context(|| format!("Failed to load targets from {}", args.targets.display()))?;
    for (entry, reason) in &decoded.rejected {
        warn!("Skipping target {}: {}", entry, reason);
    }
    let targets = decoded.targets;
    if targets.is_empty() {
        warn!("No valid targets; the publisher will only listen");
    }

    let identity = Arc::new(Identity::generate());
    info!("Publisher public key: {}", identity.public_key());
    info!("Publisher npub: {}", identity.npub().context("Failed to encode npub")?);
    info!("Loaded {} target(s), pinging every {}s", targets.len(), args.interval);

    let (trigger, shutdown) = shutdown::channel();
    spawn_shutdown_listener(trigger);

    let connector = Arc::new(WebSocketRelay::new(RelayClientConfig::default()));
    let manager = ConnectionManager::new(args.relay, connector, args.retry.into());

    let correspondents = Correspondents::new();
    let mut publisher = Publisher::new(
        identity,
        targets,
        Duration::from_secs(args.interval),
        clock_seeded_rng(),
        correspondents.clone(),
    );

    manager.drive(&mut publisher, &shutdown).await;

    info!(
        "Stopped after {} round(s); {} of {} target(s) answered",
        publisher.dispatcher().rounds(),
        correspondents.len(),
        publisher.dispatcher().targets().len()
    );
    for (key, record) in correspondents.snapshot() {
        info!("  {}: {} pong(s), last at {}", key, record.count, record.last_seen);
    }

    Ok(())
}
