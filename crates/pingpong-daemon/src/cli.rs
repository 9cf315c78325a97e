//! Command-line options shared by the publisher and subscriber.

use clap::Args;
use pingpong_core::RetryConfig;
use std::time::Duration;

/// Connection retry tuning.
#[derive(Args, Debug, Clone)]
pub struct RetryArgs {
    /// Connection attempts per burst before pausing
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_attempts: u32,

    /// Base backoff delay in milliseconds (grows with the square of the attempt)
    #[arg(long, default_value_t = 1000)]
    pub initial_delay_ms: u64,

    /// Backoff cap in milliseconds
    #[arg(long, default_value_t = 30_000)]
    pub max_delay_ms: u64,

    /// Pause before reconnecting after a failure, in milliseconds
    #[arg(long, default_value_t = 5000)]
    pub reconnect_delay_ms: u64,
}

impl From<RetryArgs> for RetryConfig {
    fn from(args: RetryArgs) -> Self {
        RetryConfig {
            max_attempts: args.max_attempts,
            initial_delay: Duration::from_millis(args.initial_delay_ms),
            max_delay: Duration::from_millis(args.max_delay_ms),
            reconnect_delay: Duration::from_millis(args.reconnect_delay_ms),
        }
    }
}
