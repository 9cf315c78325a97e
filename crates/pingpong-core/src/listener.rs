//! Pong consumption for the publisher.
//!
//! Runs next to the dispatcher on the same session and records every pong
//! addressed to us under the key that signed it.

use nostr::{PublicKey, Timestamp};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::connection::{LoopExit, Session};
use crate::identity::Identity;
use crate::protocol::Payload;
use crate::shutdown::Shutdown;
use crate::targets::TargetSet;
use crate::transport::TransportError;

/// What we know about one responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PongRecord {
    /// Pongs received so far
    pub count: u64,
    /// `created_at` of the most recent pong
    pub last_seen: Timestamp,
}

/// Live correspondents, keyed by the responder's public key.
///
/// Clones share state, so the binary or a test can read what the listener records.
#[derive(Debug, Clone, Default)]
pub struct Correspondents {
    inner: Arc<Mutex<HashMap<PublicKey, PongRecord>>>,
}

impl Correspondents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pong from `responder`. Returns its pong count so far.
    pub fn record(&self, responder: PublicKey, at: Timestamp) -> u64 {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let record = inner.entry(responder).or_insert(PongRecord {
            count: 0,
            last_seen: at,
        });
        record.count += 1;
        record.last_seen = record.last_seen.max(at);
        record.count
    }

    pub fn get(&self, responder: &PublicKey) -> Option<PongRecord> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(responder)
            .cloned()
    }

    pub fn snapshot(&self) -> HashMap<PublicKey, PongRecord> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct ListenerLoop {
    identity: Arc<Identity>,
    targets: TargetSet,
    correspondents: Correspondents,
}

impl ListenerLoop {
    pub fn new(identity: Arc<Identity>, targets: TargetSet, correspondents: Correspondents) -> Self {
        Self {
            identity,
            targets,
            correspondents,
        }
    }

    pub fn correspondents(&self) -> &Correspondents {
        &self.correspondents
    }

    /// Consume pongs on `session` until the stream ends or shutdown.
    ///
    /// A transient subscribe failure parks the listener until shutdown,
    /// leaving the dispatcher running.
    pub async fn run(&self, session: &Session, shutdown: &Shutdown) -> LoopExit {
        let mut subscription = match session.subscribe_to(&self.identity.public_key()).await {
            Ok(subscription) => subscription,
            Err(e) if e.is_transport_failure() => {
                warn!("Failed to subscribe to pongs: {}", e);
                return LoopExit::Reconnect(e);
            }
            Err(e) => {
                warn!("Failed to subscribe to pongs: {} (listener stopped)", e);
                shutdown.cancelled().await;
                return LoopExit::Shutdown;
            }
        };
        debug!("Listening for pongs on {}", subscription.id());

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return LoopExit::Shutdown,
                event = subscription.recv() => event,
            };

            let Some(event) = event else {
                warn!("Pong stream closed by relay");
                return LoopExit::Reconnect(TransportError::ConnectionClosed);
            };

            if Payload::of(&event) != Some(Payload::Pong) {
                debug!("Ignoring non-pong event {} from {}", event.id, event.pubkey);
                continue;
            }

            let count = self.correspondents.record(event.pubkey, event.created_at);
            if self.targets.contains(&event.pubkey) {
                info!("Got pong from {} ({} total)", event.pubkey, count);
            } else {
                warn!("Got pong from unexpected key {}", event.pubkey);
            }
        }
    }
}
