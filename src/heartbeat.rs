//! Ping/pong liveness tracking.
//!
//! The connection driver sends [`ping`] on its ping timer and asks
//! [`Heartbeat::is_expired`] on its liveness timer. Time comes from
//! `tokio::time::Instant` so paused-clock tests control it.

use std::time::Duration;

use tokio::time::Instant;

use crate::constants::PONG_TIMEOUT;
use crate::protocol::Message;

/// Last-pong bookkeeping for one connection.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    last_pong: Instant,
    timeout: Duration,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Heartbeat {
    /// Start tracking now, with the protocol's pong timeout.
    pub fn new() -> Self {
        Self::with_timeout(PONG_TIMEOUT)
    }

    /// Start tracking now, with a custom timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            last_pong: Instant::now(),
            timeout,
        }
    }

    /// Record a pong received now.
    pub fn record_pong(&mut self) {
        self.last_pong = Instant::now();
    }

    /// Time since the last pong (or since tracking started).
    pub fn silence(&self) -> Duration {
        self.last_pong.elapsed()
    }

    /// Whether the peer has been silent for longer than the timeout.
    pub fn is_expired(&self) -> bool {
        self.silence() > self.timeout
    }
}

/// Build a ping stamped with the current wall clock.
pub fn ping() -> Message {
    Message::Ping {
        timestamp: chrono::Utc::now().timestamp_millis(),
    }
}
