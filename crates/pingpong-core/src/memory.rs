//! In-process relay for tests and simulations.
//!
//! Routes published events to every matching subscription across all
//! connections, like a real relay without storage. Failures can be scripted:
//! refused connects, per-publish results, and dropping every live connection.

use async_trait::async_trait;
use nostr::Event;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::protocol::ExchangeFilter;
use crate::transport::{RelayConnection, RelayConnector, Result, Subscription, TransportError};

/// An event accepted by the relay, tagged with the connection that sent it.
#[derive(Debug, Clone)]
pub struct Published {
    pub connection: u64,
    pub event: Event,
}

struct MemorySubscriber {
    connection: u64,
    id: String,
    filter: ExchangeFilter,
    tx: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
struct RelayState {
    refuse_connections: bool,
    failing_connects: u32,
    connect_attempts: Vec<Instant>,
    publish_script: VecDeque<Result<()>>,
    published: Vec<Published>,
    subscribers: Vec<MemorySubscriber>,
    connections: Vec<(u64, Arc<AtomicBool>)>,
    next_connection: u64,
    next_subscription: u64,
}

impl RelayState {
    fn route(&mut self, event: &Event) {
        self.subscribers
            .retain(|s| !s.filter.matches(event) || s.tx.send(event.clone()).is_ok());
    }
}

/// Shared in-memory relay. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().failing_connects = count;
    }

    /// Refuse every connection attempt until called again with `false`.
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// Queue results for upcoming publishes, consumed in order.
    ///
    /// Publishes beyond the script succeed.
    pub fn script_publishes(&self, results: impl IntoIterator<Item = Result<()>>) {
        self.lock().publish_script.extend(results);
    }

    /// Close every live connection, as if the relay restarted.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        for (_, open) in state.connections.drain(..) {
            open.store(false, Ordering::SeqCst);
        }
        state.subscribers.clear();
    }

    /// Deliver an event as if another client had published it.
    pub fn inject(&self, event: Event) {
        self.lock().route(&event);
    }

    /// When each connection attempt happened, successful or not.
    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.lock().connect_attempts.clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.lock().published.clone()
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn live_connections(&self) -> usize {
        self.lock().connections.len()
    }
}

#[async_trait]
impl RelayConnector for MemoryRelay {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn RelayConnection>> {
        let mut state = self.lock();
        state.connect_attempts.push(Instant::now());

        if state.refuse_connections {
            return Err(TransportError::ConnectFailed(format!(
                "{} refused connection",
                endpoint
            )));
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(TransportError::ConnectFailed(format!(
                "{} unreachable",
                endpoint
            )));
        }

        state.next_connection += 1;
        let id = state.next_connection;
        let open = Arc::new(AtomicBool::new(true));
        state.connections.push((id, open.clone()));

        Ok(Arc::new(MemoryConnection {
            id,
            open,
            relay: self.clone(),
        }))
    }
}

struct MemoryConnection {
    id: u64,
    open: Arc<AtomicBool>,
    relay: MemoryRelay,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::ConnectionClosed)
        }
    }
}

#[async_trait]
impl RelayConnection for MemoryConnection {
    async fn publish(&self, event: &Event) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.relay.lock();

        if let Some(result) = state.publish_script.pop_front() {
            result?;
        }

        state.published.push(Published {
            connection: self.id,
            event: event.clone(),
        });
        state.route(event);
        Ok(())
    }

    async fn subscribe(&self, filter: &ExchangeFilter) -> Result<Subscription> {
        self.ensure_open()?;
        let mut state = self.relay.lock();

        state.next_subscription += 1;
        let id = format!("mem-{}", state.next_subscription);
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push(MemorySubscriber {
            connection: self.id,
            id: id.clone(),
            filter: filter.clone(),
            tx,
        });

        Ok(Subscription::new(id, rx))
    }

    async fn unsubscribe(&self, subscription_id: &str) {
        self.relay
            .lock()
            .subscribers
            .retain(|s| !(s.connection == self.id && s.id == subscription_id));
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let mut state = self.relay.lock();
        state.connections.retain(|(id, _)| *id != self.id);
        state.subscribers.retain(|s| s.connection != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::protocol::{build_message, Payload};

    #[tokio::test]
    async fn test_publish_routes_to_matching_subscription() {
        let relay = MemoryRelay::new();
        let sender = Identity::generate();
        let target = Identity::generate();

        let conn = relay.connect("mem://relay").await.unwrap();
        let filter = ExchangeFilter::addressed_to(&target.public_key(), nostr::Timestamp::from(0));
        let mut sub = conn.subscribe(&filter).await.unwrap();

        let ping = build_message(&sender, &target.public_key(), Payload::Ping).unwrap();
        conn.publish(&ping).await.unwrap();

        let received = sub.recv().await.unwrap();
        assert_eq!(received.id, ping.id);
        assert_eq!(relay.published().len(), 1);
    }

    #[tokio::test]
    async fn test_fail_next_connects() {
        let relay = MemoryRelay::new();
        relay.fail_next_connects(2);

        assert!(relay.connect("mem://relay").await.is_err());
        assert!(relay.connect("mem://relay").await.is_err());
        assert!(relay.connect("mem://relay").await.is_ok());
        assert_eq!(relay.connect_attempts().len(), 3);
    }

    #[tokio::test]
    async fn test_scripted_publish_results() {
        let relay = MemoryRelay::new();
        let sender = Identity::generate();
        let target = Identity::generate().public_key();
        relay.script_publishes([Err(TransportError::Rejected("rate limited".into()))]);

        let conn = relay.connect("mem://relay").await.unwrap();
        let ping = build_message(&sender, &target, Payload::Ping).unwrap();

        assert_eq!(
            conn.publish(&ping).await,
            Err(TransportError::Rejected("rate limited".into()))
        );
        assert!(conn.publish(&ping).await.is_ok());
        assert_eq!(relay.published().len(), 1);
    }

    #[tokio::test]
    async fn test_drop_connections_ends_streams() {
        let relay = MemoryRelay::new();
        let target = Identity::generate().public_key();

        let conn = relay.connect("mem://relay").await.unwrap();
        let mut sub = conn
            .subscribe(&ExchangeFilter::addressed_to(&target, nostr::Timestamp::now()))
            .await
            .unwrap();

        relay.drop_connections();

        assert!(sub.recv().await.is_none());
        assert_eq!(relay.live_connections(), 0);

        let ping = build_message(&Identity::generate(), &target, Payload::Ping).unwrap();
        assert_eq!(
            conn.publish(&ping).await,
            Err(TransportError::ConnectionClosed)
        );
    }

    #[tokio::test]
    async fn test_close_removes_subscriptions() {
        let relay = MemoryRelay::new();
        let target = Identity::generate().public_key();
        let conn = relay.connect("mem://relay").await.unwrap();
        let _sub = conn
            .subscribe(&ExchangeFilter::addressed_to(&target, nostr::Timestamp::now()))
            .await
            .unwrap();
        assert_eq!(relay.subscription_count(), 1);

        conn.close().await;

        assert_eq!(relay.subscription_count(), 0);
        assert_eq!(relay.live_connections(), 0);
    }
}
