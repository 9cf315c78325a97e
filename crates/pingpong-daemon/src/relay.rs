//! WebSocket relay client (NIP-01).
//!
//! Each connection wraps a WebSocket stream split into a locked write half and
//! a read task. The read task routes `EVENT`s to subscription channels and
//! resolves pending publishes when the relay's `OK` arrives. Events whose
//! signature does not verify are dropped before routing.
//!
//! A keepalive task pings the relay every `keepalive_interval`. A failed ping,
//! or two intervals without any inbound frame, marks the connection dead.
//! When the stream ends or the connection is declared dead, every subscription
//! channel is dropped and every pending publish fails with `ConnectionClosed`.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use nostr::Event;
use pingpong_core::transport::Result;
use pingpong_core::{ExchangeFilter, RelayConnection, RelayConnector, Subscription, TransportError};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::message::{ClientMessage, RelayMessage, MAX_MESSAGE_SIZE};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `close` may wait for the write half to send a close frame.
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeouts for relay operations.
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// How long the WebSocket handshake may take
    pub connect_timeout: Duration,
    /// How long to wait for the relay's `OK` after publishing
    pub publish_timeout: Duration,
    /// Period of the WebSocket pings that detect dead connections
    pub keepalive_interval: Duration,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(29),
        }
    }
}

/// Whether a connection silent for `silent_for` should be considered dead.
///
/// One missed keepalive round trip is tolerated; two are not.
pub fn is_unresponsive(silent_for: Duration, keepalive_interval: Duration) -> bool {
    silent_for >= keepalive_interval.saturating_mul(2)
}

/// Map a WebSocket error onto the transport taxonomy.
pub fn classify(error: WsError) -> TransportError {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::ConnectionClosed,
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            TransportError::ConnectionReset
        }
        WsError::Io(e) => match e.kind() {
            ErrorKind::BrokenPipe => TransportError::BrokenPipe,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                TransportError::ConnectionReset
            }
            ErrorKind::NotConnected | ErrorKind::UnexpectedEof => TransportError::ConnectionClosed,
            _ => TransportError::Other(e.to_string()),
        },
        other => TransportError::Other(other.to_string()),
    }
}

/// Opens NIP-01 connections over `ws://` or `wss://`.
#[derive(Debug, Clone, Default)]
pub struct WebSocketRelay {
    config: RelayClientConfig,
}

impl WebSocketRelay {
    pub fn new(config: RelayClientConfig) -> Self {
        // wss:// needs a process-wide rustls provider; a second install is a no-op error.
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self { config }
    }
}

#[async_trait]
impl RelayConnector for WebSocketRelay {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn RelayConnection>> {
        let (ws_stream, _) = tokio::time::timeout(self.config.connect_timeout, connect_async(endpoint))
            .await
            .map_err(|_| TransportError::Timeout(format!("connecting to {}", endpoint)))?
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        info!("WebSocket open to {}", endpoint);
        Ok(Arc::new(WebSocketConnection::start(
            endpoint.to_string(),
            ws_stream,
            self.config.clone(),
        )))
    }
}

/// Routing state shared between the connection and its read task.
#[derive(Default)]
struct Routes {
    subscriptions: HashMap<String, mpsc::UnboundedSender<Event>>,
    pending: HashMap<String, oneshot::Sender<Result<()>>>,
}

impl Routes {
    /// Drop every route: subscription streams end, pending publishes fail.
    fn fail_all(&mut self) {
        self.subscriptions.clear();
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(TransportError::ConnectionClosed));
        }
    }
}

type SharedRoutes = Arc<StdMutex<Routes>>;
type SharedWriter = Arc<Mutex<SplitSink<WsStream, Message>>>;

fn lock(routes: &SharedRoutes) -> MutexGuard<'_, Routes> {
    routes.lock().unwrap_or_else(|e| e.into_inner())
}

/// A single NIP-01 connection to a relay.
pub struct WebSocketConnection {
    endpoint: String,
    config: RelayClientConfig,
    write: SharedWriter,
    routes: SharedRoutes,
    closed: Arc<AtomicBool>,
    /// Read and keepalive tasks
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl WebSocketConnection {
    fn start(endpoint: String, ws_stream: WsStream, config: RelayClientConfig) -> Self {
        let (write, read) = ws_stream.split();
        let routes: SharedRoutes = Arc::default();
        let closed = Arc::new(AtomicBool::new(false));
        let write: SharedWriter = Arc::new(Mutex::new(write));
        let last_inbound = Arc::new(StdMutex::new(Instant::now()));

        let read_task = tokio::spawn(Self::read_loop(
            endpoint.clone(),
            read,
            routes.clone(),
            closed.clone(),
            last_inbound.clone(),
        ));
        let keepalive_task = tokio::spawn(Self::keepalive_loop(
            endpoint.clone(),
            write.clone(),
            routes.clone(),
            closed.clone(),
            last_inbound,
            config.keepalive_interval,
        ));

        Self {
            endpoint,
            config,
            write,
            routes,
            closed,
            tasks: StdMutex::new(vec![read_task, keepalive_task]),
        }
    }

    /// Ping the relay periodically and declare the connection dead when it
    /// stops answering.
    async fn keepalive_loop(
        endpoint: String,
        write: SharedWriter,
        routes: SharedRoutes,
        closed: Arc<AtomicBool>,
        last_inbound: Arc<StdMutex<Instant>>,
        interval: Duration,
    ) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);

        loop {
            ticker.tick().await;
            if closed.load(Ordering::SeqCst) {
                return;
            }

            let silent_for = last_inbound
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .elapsed();
            if is_unresponsive(silent_for, interval) {
                warn!(
                    "No traffic from {} for {:?}, closing connection",
                    endpoint, silent_for
                );
                break;
            }

            let sent = tokio::time::timeout(interval, async {
                let mut write = write.lock().await;
                write.send(Message::Ping(Default::default())).await
            })
            .await;
            match sent {
                Ok(Ok(())) => debug!("Sent keepalive ping to {}", endpoint),
                Ok(Err(e)) => {
                    warn!("Keepalive ping to {} failed: {}", endpoint, e);
                    break;
                }
                Err(_) => {
                    warn!("Keepalive ping to {} timed out", endpoint);
                    break;
                }
            }
        }

        closed.store(true, Ordering::SeqCst);
        lock(&routes).fail_all();
    }

    /// Read loop that routes relay messages until the stream ends.
    async fn read_loop(
        endpoint: String,
        mut read: SplitStream<WsStream>,
        routes: SharedRoutes,
        closed: Arc<AtomicBool>,
        last_inbound: Arc<StdMutex<Instant>>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    *last_inbound.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();

                    let text = match &msg {
                        Message::Text(text) => text.as_str(),
                        Message::Close(_) => {
                            debug!("Received close frame from {}", endpoint);
                            break;
                        }
                        _ => continue,
                    };

                    if text.len() > MAX_MESSAGE_SIZE {
                        warn!(
                            "Message from {} exceeds max size ({} > {}), dropping",
                            endpoint,
                            text.len(),
                            MAX_MESSAGE_SIZE
                        );
                        continue;
                    }

                    match RelayMessage::from_json(text) {
                        Ok(message) => Self::route(&endpoint, &routes, message),
                        Err(e) => warn!("Unparseable message from {}: {}", endpoint, e),
                    }
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection {} closed", endpoint);
                        }
                        _ => {
                            error!("WebSocket error on {}: {}", endpoint, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", endpoint);
                    break;
                }
            }
        }

        closed.store(true, Ordering::SeqCst);
        lock(&routes).fail_all();
    }

    fn route(endpoint: &str, routes: &SharedRoutes, message: RelayMessage) {
        if let RelayMessage::Event { event, .. } = &message {
            if let Err(e) = event.verify() {
                warn!(
                    "Dropping event {} from {} with invalid signature: {}",
                    event.id, endpoint, e
                );
                return;
            }
        }

        let mut routes = lock(routes);
        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                let delivered = routes
                    .subscriptions
                    .get(&subscription_id)
                    .map(|tx| tx.send(*event).is_ok());
                match delivered {
                    Some(true) => {}
                    Some(false) => {
                        routes.subscriptions.remove(&subscription_id);
                    }
                    None => debug!("Event for unknown subscription {}", subscription_id),
                }
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                if let Some(tx) = routes.pending.remove(&event_id) {
                    let result = if accepted {
                        Ok(())
                    } else {
                        Err(TransportError::Rejected(message))
                    };
                    let _ = tx.send(result);
                }
            }
            RelayMessage::EndOfStoredEvents(subscription_id) => {
                debug!("End of stored events for {}", subscription_id);
            }
            RelayMessage::Notice(notice) => {
                warn!("Notice from {}: {}", endpoint, notice);
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                warn!(
                    "Relay {} closed subscription {}: {}",
                    endpoint, subscription_id, message
                );
                routes.subscriptions.remove(&subscription_id);
            }
            RelayMessage::Other(kind) => {
                debug!("Ignoring {} message from {}", kind, endpoint);
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    async fn send_text(&self, text: String) -> Result<()> {
        let mut write = self.write.lock().await;
        write.send(Message::Text(text.into())).await.map_err(classify)
    }
}

#[async_trait]
impl RelayConnection for WebSocketConnection {
    async fn publish(&self, event: &Event) -> Result<()> {
        self.ensure_open()?;

        let event_id = event.id.to_hex();
        let (tx, rx) = oneshot::channel();
        lock(&self.routes).pending.insert(event_id.clone(), tx);

        if let Err(e) = self.send_text(ClientMessage::Event(event).to_json()).await {
            lock(&self.routes).pending.remove(&event_id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.publish_timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without an answer: the read task is gone
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                lock(&self.routes).pending.remove(&event_id);
                Err(TransportError::Timeout(format!("no OK for event {}", event_id)))
            }
        }
    }

    async fn subscribe(&self, filter: &ExchangeFilter) -> Result<Subscription> {
        self.ensure_open()?;

        let subscription_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.routes)
            .subscriptions
            .insert(subscription_id.clone(), tx);

        let req = ClientMessage::Req {
            subscription_id: &subscription_id,
            filter,
        };
        if let Err(e) = self.send_text(req.to_json()).await {
            lock(&self.routes).subscriptions.remove(&subscription_id);
            return Err(e);
        }

        Ok(Subscription::new(subscription_id, rx))
    }

    async fn unsubscribe(&self, subscription_id: &str) {
        lock(&self.routes).subscriptions.remove(subscription_id);
        if self.ensure_open().is_err() {
            return;
        }
        if let Err(e) = self
            .send_text(ClientMessage::Close(subscription_id).to_json())
            .await
        {
            debug!(
                "Failed to close subscription {} on {}: {}",
                subscription_id, self.endpoint, e
            );
        }
    }

    async fn close(&self) {
        let was_open = !self.closed.swap(true, Ordering::SeqCst);

        if was_open {
            let sent = tokio::time::timeout(CLOSE_FRAME_TIMEOUT, async {
                let mut write = self.write.lock().await;
                write.send(Message::Close(None)).await
            })
            .await;
            match sent {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Close frame to {} failed: {}", self.endpoint, e),
                Err(_) => debug!("Close frame to {} timed out", self.endpoint),
            }
        }

        // A connection declared dead may still have a read task parked on the socket
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
        lock(&self.routes).fail_all();
        debug!("Closed connection to {}", self.endpoint);
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        let tasks = std::mem::take(self.tasks.get_mut().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_classify_closed() {
        assert_eq!(classify(WsError::ConnectionClosed), TransportError::ConnectionClosed);
        assert_eq!(classify(WsError::AlreadyClosed), TransportError::ConnectionClosed);
    }

    #[test]
    fn test_classify_io_kinds() {
        let broken = WsError::Io(io::Error::new(ErrorKind::BrokenPipe, "write: broken pipe"));
        assert_eq!(classify(broken), TransportError::BrokenPipe);

        let reset = WsError::Io(io::Error::new(ErrorKind::ConnectionReset, "reset"));
        assert_eq!(classify(reset), TransportError::ConnectionReset);

        let other = WsError::Io(io::Error::new(ErrorKind::PermissionDenied, "denied"));
        assert!(!classify(other).is_transport_failure());
    }

    #[test]
    fn test_classify_reset_without_close() {
        assert_eq!(
            classify(WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)),
            TransportError::ConnectionReset
        );
    }

    #[test]
    fn test_classify_other_is_transient() {
        let err = classify(WsError::Utf8);
        assert!(!err.is_transport_failure());
    }

    #[test]
    fn test_default_config() {
        let config = RelayClientConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.publish_timeout, Duration::from_secs(10));
        assert_eq!(config.keepalive_interval, Duration::from_secs(29));
    }

    #[test]
    fn test_unresponsive_after_two_intervals() {
        let interval = Duration::from_secs(29);
        assert!(!is_unresponsive(Duration::from_secs(1), interval));
        assert!(!is_unresponsive(Duration::from_secs(57), interval));
        assert!(is_unresponsive(Duration::from_secs(58), interval));
        assert!(is_unresponsive(Duration::from_secs(600), interval));
    }

    // ==================== Keepalive ====================

    /// Accept one WebSocket handshake, then hold the socket without ever
    /// reading or writing again, like a peer that vanished without FIN/RST.
    async fn silent_relay() -> (String, JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            std::future::pending::<()>().await;
        });
        (format!("ws://{}", addr), handle)
    }

    #[tokio::test]
    async fn test_keepalive_detects_silent_relay() {
        let (url, relay) = silent_relay().await;
        let client = WebSocketRelay::new(RelayClientConfig {
            connect_timeout: Duration::from_secs(2),
            publish_timeout: Duration::from_secs(2),
            keepalive_interval: Duration::from_millis(50),
        });
        let connection = client.connect(&url).await.unwrap();

        let me = pingpong_core::Identity::generate();
        let filter = ExchangeFilter::addressed_to(&me.public_key(), nostr::Timestamp::now());
        let mut subscription = connection.subscribe(&filter).await.unwrap();

        // The relay never answers, so the stream must end on its own
        let next = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
            .await
            .expect("keepalive should end the stream of a silent relay");
        assert!(next.is_none());

        let ping = pingpong_core::protocol::build_message(
            &me,
            &me.public_key(),
            pingpong_core::Payload::Ping,
        )
        .unwrap();
        assert_eq!(
            connection.publish(&ping).await,
            Err(TransportError::ConnectionClosed)
        );

        connection.close().await;
        relay.abort();
    }
}
