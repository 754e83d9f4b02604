//! External queue and payload storage.
//!
//! Each client owns one ordered queue (`event-<clientId>`) that something
//! outside this process fills. Connections only read its head and pop it
//! once the client acknowledges. Client payloads are written back as plain
//! key/value pairs.
//!
//! Every method can fail; the connection driver logs the failure and
//! retries on its next poll rather than dropping the connection.

mod memory;
mod redis;

use async_trait::async_trait;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Storage the delivery engine reads events from and writes payloads to.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Return the head of the list at `key` without removing it.
    async fn peek_head(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Remove and return the head of the list at `key`.
    async fn pop_head(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
}
