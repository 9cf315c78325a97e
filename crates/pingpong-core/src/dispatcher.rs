//! Outbound probe fan-out for the publisher.
//!
//! Each round pings every target once, in a fresh random order, waiting the
//! configured interval after every accepted ping. A transport failure ends the
//! round immediately; other publish errors only skip the affected target.

use nostr::PublicKey;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::connection::{LoopExit, Session};
use crate::identity::Identity;
use crate::protocol::{build_message, Payload};
use crate::shutdown::Shutdown;
use crate::targets::TargetSet;
use crate::transport::TransportError;

/// How a single dispatch round ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Every target was tried; `sent` pings were accepted
    Completed { sent: usize },
    /// The session died; the rest of the round was abandoned
    Reconnect(TransportError),
    /// Shutdown observed before a send or during the interval wait
    Shutdown,
}

pub struct ProbeDispatcher<R> {
    identity: Arc<Identity>,
    targets: TargetSet,
    interval: Duration,
    rng: R,
    rounds: u64,
}

impl<R: Rng + Send> ProbeDispatcher<R> {
    pub fn new(identity: Arc<Identity>, targets: TargetSet, interval: Duration, rng: R) -> Self {
        Self {
            identity,
            targets,
            interval,
            rng,
            rounds: 0,
        }
    }

    pub fn targets(&self) -> &TargetSet {
        &self.targets
    }

    /// Rounds started so far, across sessions.
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Run rounds back to back until the session dies or shutdown.
    pub async fn run(&mut self, session: &Session, shutdown: &Shutdown) -> LoopExit {
        loop {
            match self.run_round(session, shutdown).await {
                RoundOutcome::Completed { sent } => {
                    debug!("Round {} complete, {} ping(s) sent", self.rounds, sent);
                }
                RoundOutcome::Reconnect(e) => return LoopExit::Reconnect(e),
                RoundOutcome::Shutdown => return LoopExit::Shutdown,
            }
        }
    }

    /// Ping every target once in a freshly shuffled order.
    pub async fn run_round(&mut self, session: &Session, shutdown: &Shutdown) -> RoundOutcome {
        self.rounds += 1;
        let order = self.targets.shuffled(&mut self.rng);

        if order.is_empty() {
            // Nothing to send; still suspend so the loop never spins.
            return if shutdown.sleep(self.interval).await {
                RoundOutcome::Completed { sent: 0 }
            } else {
                RoundOutcome::Shutdown
            };
        }

        debug!(
            "Round {} order: {:?}",
            self.rounds,
            order.iter().map(PublicKey::to_hex).collect::<Vec<_>>()
        );

        let mut sent = 0;
        for target in order {
            if shutdown.is_cancelled() {
                return RoundOutcome::Shutdown;
            }

            let probe = match build_message(&self.identity, &target, Payload::Ping) {
                Ok(probe) => probe,
                Err(e) => {
                    warn!("Skipping ping to {}: {}", target, e);
                    continue;
                }
            };

            match session.publish(&probe).await {
                Ok(()) => {
                    sent += 1;
                    info!("Sent ping to {}", target);
                    if !shutdown.sleep(self.interval).await {
                        return RoundOutcome::Shutdown;
                    }
                }
                Err(e) if e.is_transport_failure() => {
                    warn!(
                        "Failed to publish ping to {}: {} (abandoning round {})",
                        target, e, self.rounds
                    );
                    return RoundOutcome::Reconnect(e);
                }
                Err(e) => {
                    warn!("Failed to publish ping to {}: {}", target, e);
                }
            }
        }

        RoundOutcome::Completed { sent }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionManager, RetryConfig};
    use crate::memory::MemoryRelay;
    use crate::protocol::recipient;
    use crate::shutdown;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    struct Fixture {
        relay: MemoryRelay,
        session: Arc<Session>,
        dispatcher: ProbeDispatcher<StdRng>,
        targets: Vec<PublicKey>,
        _manager: ConnectionManager,
    }

    async fn fixture(target_count: usize) -> Fixture {
        let relay = MemoryRelay::new();
        let manager =
            ConnectionManager::new("mem://relay", Arc::new(relay.clone()), RetryConfig::default());
        let (_trigger, shutdown) = shutdown::channel();
        let session = manager.connect(&shutdown).await.unwrap();

        let targets: Vec<PublicKey> = (0..target_count)
            .map(|_| Identity::generate().public_key())
            .collect();
        let dispatcher = ProbeDispatcher::new(
            Arc::new(Identity::generate()),
            TargetSet::new(targets.clone()),
            Duration::from_secs(1),
            StdRng::seed_from_u64(99),
        );

        Fixture {
            relay,
            session,
            dispatcher,
            targets,
            _manager: manager,
        }
    }

    fn recipients(relay: &MemoryRelay) -> Vec<PublicKey> {
        relay
            .published()
            .iter()
            .map(|p| recipient(&p.event).unwrap())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_pings_each_target_once() {
        let mut f = fixture(3).await;
        let (_trigger, shutdown) = shutdown::channel();

        let outcome = f.dispatcher.run_round(&f.session, &shutdown).await;

        assert_eq!(outcome, RoundOutcome::Completed { sent: 3 });
        assert_eq!(f.dispatcher.targets().len(), 3);
        let sent = recipients(&f.relay);
        assert_eq!(sent.len(), 3);
        let unique: HashSet<_> = sent.iter().collect();
        assert_eq!(unique, f.targets.iter().collect());

        for published in f.relay.published() {
            assert_eq!(published.event.content, "ping");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_round_is_a_permutation() {
        let mut f = fixture(5).await;
        let (_trigger, shutdown) = shutdown::channel();

        for _ in 0..4 {
            f.dispatcher.run_round(&f.session, &shutdown).await;
        }

        let sent = recipients(&f.relay);
        assert_eq!(sent.len(), 20);
        for round in sent.chunks(5) {
            let unique: HashSet<_> = round.iter().collect();
            assert_eq!(unique.len(), 5);
        }
        assert_eq!(f.dispatcher.rounds(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_interval_after_each_send() {
        let mut f = fixture(3).await;
        let (_trigger, shutdown) = shutdown::channel();

        let start = tokio::time::Instant::now();
        f.dispatcher.run_round(&f.session, &shutdown).await;

        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_abandons_round() {
        let mut f = fixture(3).await;
        let (_trigger, shutdown) = shutdown::channel();
        f.relay
            .script_publishes([Ok(()), Err(TransportError::BrokenPipe)]);

        let outcome = f.dispatcher.run_round(&f.session, &shutdown).await;

        assert_eq!(outcome, RoundOutcome::Reconnect(TransportError::BrokenPipe));
        // Only the first ping made it; the third target was never tried
        assert_eq!(f.relay.published().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_continues_without_delay() {
        let mut f = fixture(3).await;
        let (_trigger, shutdown) = shutdown::channel();
        f.relay
            .script_publishes([Err(TransportError::Rejected("rate-limited".into()))]);

        let start = tokio::time::Instant::now();
        let outcome = f.dispatcher.run_round(&f.session, &shutdown).await;

        assert_eq!(outcome, RoundOutcome::Completed { sent: 2 });
        assert_eq!(f.relay.published().len(), 2);
        // No interval after the rejected ping
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_checked_before_each_send() {
        let mut f = fixture(3).await;
        let (trigger, shutdown) = shutdown::channel();
        trigger.trigger();

        let outcome = f.dispatcher.run_round(&f.session, &shutdown).await;

        assert_eq!(outcome, RoundOutcome::Shutdown);
        assert!(f.relay.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_interval() {
        let mut f = fixture(3).await;
        let (trigger, shutdown) = shutdown::channel();
        let session = f.session.clone();

        let handle = tokio::spawn(async move {
            let outcome = f.dispatcher.run_round(&session, &shutdown).await;
            (outcome, f.relay)
        });
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.trigger();

        let (outcome, relay) = handle.await.unwrap();
        assert_eq!(outcome, RoundOutcome::Shutdown);
        assert_eq!(relay.published().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_target_set_still_suspends() {
        let mut f = fixture(0).await;
        let (_trigger, shutdown) = shutdown::channel();

        let start = tokio::time::Instant::now();
        let outcome = f.dispatcher.run_round(&f.session, &shutdown).await;

        assert_eq!(outcome, RoundOutcome::Completed { sent: 0 });
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_returns_reconnect_on_dead_session() {
        let mut f = fixture(2).await;
        let (_trigger, shutdown) = shutdown::channel();
        f.relay.drop_connections();

        let exit = f.dispatcher.run(&f.session, &shutdown).await;

        assert_eq!(exit, LoopExit::Reconnect(TransportError::ConnectionClosed));
    }
}
