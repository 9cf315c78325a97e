//! pingpong-core: Liveness probes between nostr identities through a relay.
//!
//! This crate provides:
//! - The ping/pong event conventions (kind, tags, payloads)
//! - Identity and target-set handling
//! - `RelayConnector`/`RelayConnection` trait abstractions plus an in-memory relay
//! - `ConnectionManager`, which owns the relay session and reconnects on transport failure
//! - The role loops: `ProbeDispatcher` + `ListenerLoop` (publisher) and `ResponderLoop` (subscriber)

pub mod connection;
pub mod dispatcher;
pub mod identity;
pub mod listener;
pub mod memory;
pub mod protocol;
pub mod publisher;
pub mod responder;
pub mod shutdown;
pub mod targets;
pub mod transport;

pub use connection::{
    ConnectionError, ConnectionManager, LinkState, LoopExit, RetryConfig, Session, SessionTask,
};
pub use dispatcher::{ProbeDispatcher, RoundOutcome};
pub use identity::{Identity, IdentityError};
pub use listener::{Correspondents, ListenerLoop, PongRecord};
pub use memory::MemoryRelay;
pub use protocol::{ExchangeFilter, Payload, PINGPONG_KIND, TOPIC};
pub use publisher::Publisher;
pub use responder::ResponderLoop;
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use targets::{DecodedTargets, TargetSet, TargetsError};
pub use transport::{RelayConnection, RelayConnector, Subscription, TransportError};
