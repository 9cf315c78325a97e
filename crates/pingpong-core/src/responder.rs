//! Ping answering for the subscriber.

use async_trait::async_trait;
use nostr::Event;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::connection::{LoopExit, Session, SessionTask};
use crate::identity::Identity;
use crate::protocol::{build_message, Payload};
use crate::shutdown::Shutdown;
use crate::transport::TransportError;

/// Answers every ping addressed to our identity with exactly one pong.
///
/// No deduplication: a redelivered ping gets a second pong.
pub struct ResponderLoop {
    identity: Arc<Identity>,
    answered: u64,
}

impl ResponderLoop {
    pub fn new(identity: Arc<Identity>) -> Self {
        Self {
            identity,
            answered: 0,
        }
    }

    /// Pongs accepted by the relay so far, across sessions.
    pub fn answered(&self) -> u64 {
        self.answered
    }

    /// Subscribe on `session` and answer pings until the session dies or shutdown.
    pub async fn run(&mut self, session: &Session, shutdown: &Shutdown) -> LoopExit {
        let mut subscription = match session.subscribe_to(&self.identity.public_key()).await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!("Failed to subscribe: {}", e);
                return LoopExit::Reconnect(e);
            }
        };
        info!("Successfully subscribed, waiting for pings...");

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return LoopExit::Shutdown,
                event = subscription.recv() => event,
            };

            let Some(event) = event else {
                warn!("Event stream closed, reconnecting...");
                return LoopExit::Reconnect(TransportError::ConnectionClosed);
            };

            if Payload::of(&event) != Some(Payload::Ping) {
                debug!("Ignoring non-ping event {} from {}", event.id, event.pubkey);
                continue;
            }

            if let Err(e) = self.answer(session, &event).await {
                return LoopExit::Reconnect(e);
            }
        }
    }

    /// Send one pong back to the author of `ping`.
    ///
    /// Only transport failures are returned; anything else is logged and dropped.
    async fn answer(&mut self, session: &Session, ping: &Event) -> Result<(), TransportError> {
        info!("Received ping from {}", ping.pubkey);

        let pong = match build_message(&self.identity, &ping.pubkey, Payload::Pong) {
            Ok(pong) => pong,
            Err(e) => {
                warn!("Failed to sign pong: {}", e);
                return Ok(());
            }
        };

        match session.publish(&pong).await {
            Ok(()) => {
                self.answered += 1;
                info!("Sent pong to {}", ping.pubkey);
                Ok(())
            }
            Err(e) if e.is_transport_failure() => {
                warn!("Failed to publish pong to {}: {}", ping.pubkey, e);
                Err(e)
            }
            Err(e) => {
                warn!("Failed to publish pong to {}: {}", ping.pubkey, e);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl SessionTask for ResponderLoop {
    async fn run_session(&mut self, session: &Session, shutdown: &Shutdown) -> LoopExit {
        self.run(session, shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionManager, RetryConfig};
    use crate::memory::MemoryRelay;
    use crate::protocol::recipient;
    use crate::shutdown;
    use std::time::Duration;

    struct Harness {
        relay: MemoryRelay,
        manager: Arc<ConnectionManager>,
        subscriber: Arc<Identity>,
    }

    fn harness() -> Harness {
        let relay = MemoryRelay::new();
        let config = RetryConfig {
            reconnect_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let manager = Arc::new(ConnectionManager::new(
            "mem://relay",
            Arc::new(relay.clone()),
            config,
        ));
        Harness {
            relay,
            manager,
            subscriber: Arc::new(Identity::generate()),
        }
    }

    fn pongs(relay: &MemoryRelay) -> Vec<Event> {
        relay
            .published()
            .into_iter()
            .map(|p| p.event)
            .filter(|e| e.content == "pong")
            .collect()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_one_pong_per_ping_addressed_to_sender() {
        let h = harness();
        let (trigger, shutdown) = shutdown::channel();
        let publisher = Identity::generate();

        let manager = h.manager.clone();
        let mut responder = ResponderLoop::new(h.subscriber.clone());
        let handle = tokio::spawn(async move {
            manager.drive(&mut responder, &shutdown).await;
            responder
        });
        let relay = h.relay.clone();
        wait_until(|| relay.subscription_count() == 1).await;

        let ping = build_message(&publisher, &h.subscriber.public_key(), Payload::Ping).unwrap();
        h.relay.inject(ping.clone());
        // Duplicate delivery yields a duplicate pong
        h.relay.inject(ping);

        wait_until(|| pongs(&relay).len() == 2).await;
        for pong in pongs(&h.relay) {
            assert_eq!(pong.pubkey, h.subscriber.public_key());
            assert_eq!(recipient(&pong), Some(publisher.public_key()));
        }

        trigger.trigger();
        let responder = handle.await.unwrap();
        assert_eq!(responder.answered(), 2);
    }

    #[tokio::test]
    async fn test_ignores_non_ping_content() {
        let h = harness();
        let (trigger, shutdown) = shutdown::channel();
        let publisher = Identity::generate();

        let manager = h.manager.clone();
        let mut responder = ResponderLoop::new(h.subscriber.clone());
        let handle = tokio::spawn(async move {
            manager.drive(&mut responder, &shutdown).await;
            responder
        });
        let relay = h.relay.clone();
        wait_until(|| relay.subscription_count() == 1).await;

        h.relay
            .inject(build_message(&publisher, &h.subscriber.public_key(), Payload::Pong).unwrap());
        h.relay
            .inject(build_message(&publisher, &h.subscriber.public_key(), Payload::Ping).unwrap());

        wait_until(|| pongs(&relay).len() == 1).await;

        trigger.trigger();
        assert_eq!(handle.await.unwrap().answered(), 1);
    }

    #[tokio::test]
    async fn test_transient_publish_error_keeps_session() {
        let h = harness();
        let (trigger, shutdown) = shutdown::channel();
        let publisher = Identity::generate();
        h.relay
            .script_publishes([Err(TransportError::Rejected("blocked".into()))]);

        let manager = h.manager.clone();
        let mut responder = ResponderLoop::new(h.subscriber.clone());
        let handle = tokio::spawn(async move {
            manager.drive(&mut responder, &shutdown).await;
            responder
        });
        let relay = h.relay.clone();
        wait_until(|| relay.subscription_count() == 1).await;

        h.relay
            .inject(build_message(&publisher, &h.subscriber.public_key(), Payload::Ping).unwrap());
        h.relay
            .inject(build_message(&publisher, &h.subscriber.public_key(), Payload::Ping).unwrap());

        wait_until(|| pongs(&relay).len() == 1).await;
        assert_eq!(h.relay.connect_attempts().len(), 1);

        trigger.trigger();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_publish_error_reconnects() {
        let h = harness();
        let (trigger, shutdown) = shutdown::channel();
        let publisher = Identity::generate();
        h.relay.script_publishes([Err(TransportError::ConnectionReset)]);

        let manager = h.manager.clone();
        let mut responder = ResponderLoop::new(h.subscriber.clone());
        let handle = tokio::spawn(async move {
            manager.drive(&mut responder, &shutdown).await;
        });
        let relay = h.relay.clone();
        wait_until(|| relay.subscription_count() == 1).await;

        h.relay
            .inject(build_message(&publisher, &h.subscriber.public_key(), Payload::Ping).unwrap());

        // Torn down, then a fresh session and subscription
        wait_until(|| relay.connect_attempts().len() == 2 && relay.subscription_count() == 1)
            .await;
        assert_eq!(h.relay.live_connections(), 1);

        h.relay
            .inject(build_message(&publisher, &h.subscriber.public_key(), Payload::Ping).unwrap());
        wait_until(|| pongs(&relay).len() == 1).await;

        trigger.trigger();
        handle.await.unwrap();
        assert_eq!(h.relay.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_relay_drop_resubscribes() {
        let h = harness();
        let (trigger, shutdown) = shutdown::channel();

        let manager = h.manager.clone();
        let mut responder = ResponderLoop::new(h.subscriber.clone());
        let handle = tokio::spawn(async move {
            manager.drive(&mut responder, &shutdown).await;
        });
        let relay = h.relay.clone();
        wait_until(|| relay.subscription_count() == 1).await;

        h.relay.drop_connections();

        wait_until(|| relay.connect_attempts().len() == 2 && relay.subscription_count() == 1)
            .await;

        trigger.trigger();
        handle.await.unwrap();
    }
}
