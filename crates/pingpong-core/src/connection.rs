//! Relay connection lifecycle.
//!
//! `ConnectionManager` owns the single live `Session` of a process:
//! - Bounded fast retries with capped quadratic backoff inside one `connect`
//! - An unbounded slow retry loop (`reconnect_delay`) around it in `establish`
//! - Version-checked teardown so a stale session is never closed twice or reused
//! - `drive`, which runs a role task through the reconnect state machine

use async_trait::async_trait;
use nostr::{Event, PublicKey, Timestamp};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::protocol::ExchangeFilter;
use crate::shutdown::Shutdown;
use crate::transport::{RelayConnection, RelayConnector, Subscription, TransportError};

/// Retry budgets for connection establishment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts per `connect` call (the fast burst)
    pub max_attempts: u32,
    /// Base delay for the quadratic backoff
    pub initial_delay: Duration,
    /// Ceiling for the backoff delay
    pub max_delay: Duration,
    /// Pause before a new burst after exhaustion or a transport failure
    pub reconnect_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Delay after failed attempt number `attempt` (1-based): `initial * attempt²`, capped.
pub fn backoff_delay(attempt: u32, config: &RetryConfig) -> Duration {
    config
        .initial_delay
        .saturating_mul(attempt.saturating_mul(attempt))
        .min(config.max_delay)
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Failed to connect after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: TransportError },
    #[error("Connection cancelled by shutdown")]
    Cancelled,
}

impl ConnectionError {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, ConnectionError::Exhausted { .. })
    }
}

/// Link state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No session and no attempt in progress
    Disconnected,
    /// Running a burst of connection attempts
    Connecting,
    /// Session open, role loops running
    Active,
    /// Session torn down, waiting `reconnect_delay`
    Reconnecting,
    /// Terminal
    ShuttingDown,
}

/// Why a role loop stopped using its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// Shutdown requested
    Shutdown,
    /// The session is dead and must be rebuilt
    Reconnect(TransportError),
}

/// One live connection plus the subscriptions opened on it.
pub struct Session {
    generation: u64,
    opened_at: Timestamp,
    connection: Arc<dyn RelayConnection>,
    subscriptions: StdMutex<Vec<String>>,
    closed: AtomicBool,
}

impl Session {
    fn new(generation: u64, connection: Arc<dyn RelayConnection>) -> Self {
        Self {
            generation,
            opened_at: Timestamp::now(),
            connection,
            subscriptions: StdMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Version token; increases with every new session.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn opened_at(&self) -> Timestamp {
        self.opened_at
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Publish on this session. A closed session fails with `ConnectionClosed`.
    pub async fn publish(&self, event: &Event) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        self.connection.publish(event).await
    }

    /// Subscribe to exchange events addressed to `recipient`.
    ///
    /// `since` is captured now, so nothing older than this subscription is delivered.
    pub async fn subscribe_to(&self, recipient: &PublicKey) -> Result<Subscription, TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        let filter = ExchangeFilter::addressed_to(recipient, Timestamp::now());
        let subscription = self.connection.subscribe(&filter).await?;
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(subscription.id().to_string());
        debug!(
            "Session {} subscribed {} (since {})",
            self.generation,
            subscription.id(),
            filter.since()
        );
        Ok(subscription)
    }

    /// Close subscriptions, then the connection. Idempotent.
    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let subscriptions =
            std::mem::take(&mut *self.subscriptions.lock().unwrap_or_else(|e| e.into_inner()));
        for id in subscriptions {
            self.connection.unsubscribe(&id).await;
        }
        self.connection.close().await;
        debug!("Session {} closed", self.generation);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("generation", &self.generation)
            .field("opened_at", &self.opened_at)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

/// Role logic run against one session at a time.
#[async_trait]
pub trait SessionTask: Send {
    async fn run_session(&mut self, session: &Session, shutdown: &Shutdown) -> LoopExit;
}

/// Owns the relay session of a process.
pub struct ConnectionManager {
    endpoint: String,
    connector: Arc<dyn RelayConnector>,
    config: RetryConfig,
    current: Mutex<Option<Arc<Session>>>,
    generations: AtomicU64,
    state: watch::Sender<LinkState>,
}

impl ConnectionManager {
    pub fn new(
        endpoint: impl Into<String>,
        connector: Arc<dyn RelayConnector>,
        config: RetryConfig,
    ) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            endpoint: endpoint.into(),
            connector,
            config,
            current: Mutex::new(None),
            generations: AtomicU64::new(0),
            state,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: LinkState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Link state {:?} -> {:?}", previous, next);
        }
    }

    /// The session currently installed, if any.
    pub async fn current(&self) -> Option<Arc<Session>> {
        self.current.lock().await.clone()
    }

    /// Open a new session with a bounded burst of attempts.
    ///
    /// Any previous session is torn down first. Between attempts the delay is
    /// `backoff_delay(attempt)`; there is no delay after the last attempt.
    pub async fn connect(&self, shutdown: &Shutdown) -> Result<Arc<Session>, ConnectionError> {
        let mut current = self.current.lock().await;
        if let Some(stale) = current.take() {
            stale.close().await;
        }

        self.set_state(LinkState::Connecting);
        let max_attempts = self.config.max_attempts.max(1);
        let mut last = TransportError::ConnectFailed("no attempt made".into());

        for attempt in 1..=max_attempts {
            if shutdown.is_cancelled() {
                return Err(ConnectionError::Cancelled);
            }

            info!(
                "Connecting to {} (attempt {}/{})",
                self.endpoint, attempt, max_attempts
            );
            let result = tokio::select! {
                _ = shutdown.cancelled() => return Err(ConnectionError::Cancelled),
                result = self.connector.connect(&self.endpoint) => result,
            };

            match result {
                Ok(connection) => {
                    let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
                    let session = Arc::new(Session::new(generation, connection));
                    *current = Some(session.clone());
                    self.set_state(LinkState::Active);
                    info!("Connected to relay {} (session {})", self.endpoint, generation);
                    return Ok(session);
                }
                Err(e) => {
                    warn!(
                        "Connection attempt {}/{} failed: {}",
                        attempt, max_attempts, e
                    );
                    last = e;
                }
            }

            if attempt < max_attempts {
                let delay = backoff_delay(attempt, &self.config);
                info!("Retrying in {:?}...", delay);
                if !shutdown.sleep(delay).await {
                    return Err(ConnectionError::Cancelled);
                }
            }
        }

        self.set_state(LinkState::Disconnected);
        Err(ConnectionError::Exhausted {
            attempts: max_attempts,
            last,
        })
    }

    /// Keep calling `connect` until it succeeds, pausing `reconnect_delay`
    /// after each exhausted burst. Returns `None` only on shutdown.
    pub async fn establish(&self, shutdown: &Shutdown) -> Option<Arc<Session>> {
        loop {
            match self.connect(shutdown).await {
                Ok(session) => return Some(session),
                Err(ConnectionError::Cancelled) => return None,
                Err(e) => {
                    error!("Failed to connect to relay: {}", e);
                    if !self.reconnect_pause(shutdown).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Enter `Reconnecting` and wait `reconnect_delay`.
    ///
    /// Returns `false` if shutdown interrupted the wait.
    pub async fn reconnect_pause(&self, shutdown: &Shutdown) -> bool {
        self.set_state(LinkState::Reconnecting);
        info!("Reconnecting in {:?}", self.config.reconnect_delay);
        shutdown.sleep(self.config.reconnect_delay).await
    }

    /// Tear down `session` if it is still the current one.
    ///
    /// Returns `false` when a newer session has already replaced it.
    pub async fn teardown(&self, session: &Session) -> bool {
        let mut current = self.current.lock().await;
        match current.as_ref() {
            Some(live) if live.generation() == session.generation() => {
                if let Some(live) = current.take() {
                    live.close().await;
                }
                self.set_state(LinkState::Disconnected);
                true
            }
            _ => {
                debug!(
                    "Ignoring teardown of stale session {}",
                    session.generation()
                );
                false
            }
        }
    }

    /// Release the current session and enter the terminal state.
    pub async fn shutdown(&self) {
        self.set_state(LinkState::ShuttingDown);
        if let Some(session) = self.current.lock().await.take() {
            session.close().await;
        }
    }

    /// Run `task` against successive sessions until shutdown.
    ///
    /// A `LoopExit::Reconnect` tears the session down, waits
    /// `reconnect_delay`, and establishes a fresh one. Identity and any other
    /// state held by the task survive the reconnect.
    pub async fn drive<T: SessionTask + ?Sized>(&self, task: &mut T, shutdown: &Shutdown) {
        while let Some(session) = self.establish(shutdown).await {
            match task.run_session(&session, shutdown).await {
                LoopExit::Shutdown => break,
                LoopExit::Reconnect(e) => {
                    warn!("Transport failure on session {}: {}", session.generation(), e);
                    self.teardown(&session).await;
                    if !self.reconnect_pause(shutdown).await {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
        info!("Relay session released");
    }
}
