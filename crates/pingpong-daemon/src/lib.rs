//! pingpong-daemon library: relay client and process plumbing for the binaries.
//!
//! The binaries stay thin; integration tests reach the websocket client
//! through these modules.

pub mod cli;
pub mod logging;
pub mod message;
pub mod relay;
pub mod signal;

// Re-export key types for convenience
pub use cli::RetryArgs;
pub use message::{ClientMessage, MessageError, RelayMessage, MAX_MESSAGE_SIZE};
pub use relay::{RelayClientConfig, WebSocketConnection, WebSocketRelay};
