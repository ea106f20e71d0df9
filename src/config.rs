//! Connection and stream settings.

use std::time::Duration;

use crate::codec::{default_codec, SharedCodec};
use crate::outbound::DEFAULT_HIGH_WATER_MARK;
use crate::pending::DEFAULT_REQUEST_TIMEOUT;
use crate::protocol::{default_framer, SharedFramer, DEFAULT_MAX_FRAME_SIZE};

/// Default capacity of each event broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Default initial reconnect delay.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Default upper bound for the reconnect delay.
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Default number of reconnect attempts before a client gives up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 50;

/// Growth factor applied to the reconnect delay after each failure.
pub const RETRY_FACTOR: f64 = 1.2;

/// Per-connection settings.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Deadline for each outbound request.
    pub request_timeout: Duration,
    /// Coalescing limit for one write, in bytes.
    pub high_water_mark: usize,
    /// Emit a timeout event after this long without inbound data.
    pub idle_timeout: Option<Duration>,
    /// Largest frame payload, sent or received.
    pub max_frame_size: usize,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// Message encoding.
    pub codec: SharedCodec,
    /// Wire framing.
    pub framer: SharedFramer,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            idle_timeout: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            codec: default_codec(),
            framer: default_framer(),
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("request_timeout", &self.request_timeout)
            .field("high_water_mark", &self.high_water_mark)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_frame_size", &self.max_frame_size)
            .field("event_capacity", &self.event_capacity)
            .field("codec", &self.codec.name())
            .field("framer", &self.framer.name())
            .finish()
    }
}

/// Socket options applied to client streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    /// Disable Nagle's algorithm.
    pub no_delay: bool,
    /// Enable TCP keepalive.
    pub keep_alive: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            no_delay: true,
            keep_alive: true,
        }
    }
}

/// Reconnect policy for [`Client`](crate::Client).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay floor; the delay resets here after a successful connect.
    pub retry_delay: Duration,
    /// Delay ceiling.
    pub max_retry_delay: Duration,
    /// Give up after this many consecutive failed attempts.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Delay to wait after `delay`: grown by [`RETRY_FACTOR`], capped.
    pub fn next_delay(&self, delay: Duration) -> Duration {
        delay.mul_f64(RETRY_FACTOR).min(self.max_retry_delay)
    }

    /// Delay after `attempts` consecutive failures starting from the floor.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        (0..attempts).fold(self.retry_delay, |delay, _| self.next_delay(delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}
