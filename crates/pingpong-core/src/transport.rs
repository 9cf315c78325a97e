//! Relay transport traits.
//!
//! Implementations:
//! - In-memory: `MemoryRelay` (tests and simulations)
//! - WebSocket: NIP-01 client in pingpong-daemon

use async_trait::async_trait;
use nostr::Event;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::ExchangeFilter;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("broken pipe")]
    BrokenPipe,

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Relay rejected event: {0}")]
    Rejected(String),

    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether the connection is gone and the session must be rebuilt.
    ///
    /// Everything else is scoped to the single operation that raised it.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionClosed
                | TransportError::BrokenPipe
                | TransportError::ConnectionReset
        )
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Inbound event stream for one relay subscription.
///
/// `recv` returning `None` means the transport terminated the stream.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    events: mpsc::UnboundedReceiver<Event>,
}

impl Subscription {
    pub fn new(id: String, events: mpsc::UnboundedReceiver<Event>) -> Self {
        Self { id, events }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the next event delivered to this subscription.
    pub async fn recv(&mut self) -> Option<Event> {
        self.events.recv().await
    }
}

/// An open connection to a relay.
#[async_trait]
pub trait RelayConnection: Send + Sync {
    /// Publish a signed event and wait for the relay to accept it.
    async fn publish(&self, event: &Event) -> Result<()>;

    /// Open a subscription for events matching `filter`.
    async fn subscribe(&self, filter: &ExchangeFilter) -> Result<Subscription>;

    /// Close one subscription. Unknown IDs are ignored.
    async fn unsubscribe(&self, subscription_id: &str);

    /// Close the connection. Open subscription streams terminate.
    async fn close(&self);
}

/// Opens relay connections.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn RelayConnection>>;
}
