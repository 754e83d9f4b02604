//! Protocol-wide constants for event-courier.
//!
//! Centralizes the timing and sizing numbers of the delivery protocol so
//! the connection driver, the tests, and the simulator agree on them.
//!
//! # Categories
//!
//! - **Delivery**: queue polling and retransmission
//! - **Heartbeat**: ping cadence and liveness detection
//! - **Transport**: socket buffers and key names

use std::time::Duration;

// ============================================================================
// Delivery
// ============================================================================

/// Interval between polls of a client's event queue.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Interval between retransmissions of an unacknowledged event.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(1000);

/// Retransmissions allowed before an in-flight event is abandoned.
///
/// The event is abandoned on the retry tick whose counter exceeds this
/// value, so a client sees the original send plus this many repeats.
pub const MAX_RETRY_ATTEMPTS: u32 = 2;

/// Consecutive non-matching acks that force the queue head to be dropped.
pub const MAX_INVALID_ACKS: u32 = 2;

/// Longest a single store call may take before the tick gives up on it.
pub const STORE_CALL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Prefix of the per-client event queue key (`event-<clientId>`).
pub const EVENT_QUEUE_PREFIX: &str = "event-";

/// Prefix of the key client payloads are persisted under
/// (`usage-<clientId>-<unix millis>`).
pub const CLIENT_PAYLOAD_PREFIX: &str = "usage-";

// ============================================================================
// Heartbeat
// ============================================================================

/// Interval between server pings.
pub const PING_INTERVAL: Duration = Duration::from_millis(5000);

/// Interval between liveness checks.
pub const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_millis(3000);

/// Silence after the last pong that marks a connection as dead.
pub const PONG_TIMEOUT: Duration = Duration::from_millis(10_000);

// ============================================================================
// Transport
// ============================================================================

/// Size of the per-connection socket read buffer.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Delay before retrying after a failed `accept()`.
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Default TCP port, matching the legacy deployment.
pub const DEFAULT_PORT: u16 = 9300;

/// Build the queue key for a client.
pub fn event_queue_key(client_id: &str) -> String {
    format!("{EVENT_QUEUE_PREFIX}{client_id}")
}

/// Build the storage key for a drained client payload.
pub fn client_payload_key(client_id: &str, unix_millis: i64) -> String {
    format!("{CLIENT_PAYLOAD_PREFIX}{client_id}-{unix_millis}")
}
