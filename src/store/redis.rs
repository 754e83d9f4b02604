//! Redis-backed [`EventStore`].
//!
//! Queues are Redis lists read with `LINDEX key 0` and consumed with
//! `LPOP key`; payloads are written with `SET`. One multiplexed connection
//! is shared by every client connection in the process.

use anyhow::Context;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};

use super::EventStore;
use crate::config::RedisConfig;

/// [`EventStore`] over a multiplexed Redis connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    addr: String,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").field("addr", &self.addr).finish()
    }
}

impl RedisStore {
    /// Connect to the server described by `config`.
    pub async fn connect(config: &RedisConfig) -> anyhow::Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(config.host.clone(), config.port),
            redis: RedisConnectionInfo {
                password: config.password.clone(),
                ..RedisConnectionInfo::default()
            },
        };

        let client = redis::Client::open(info)
            .with_context(|| format!("Invalid Redis address {addr}"))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .with_context(|| format!("Failed to connect to Redis at {addr}"))?;

        log::info!("[Store] Connected to Redis at {addr}");
        Ok(Self { conn, addr })
    }
}

#[async_trait]
impl EventStore for RedisStore {
    async fn peek_head(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.conn.clone();
        let head: Option<String> = conn
            .lindex(key, 0)
            .await
            .with_context(|| format!("LINDEX {key} failed"))?;
        Ok(head)
    }

    async fn pop_head(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.conn.clone();
        let head: Option<String> = conn
            .lpop(key, None)
            .await
            .with_context(|| format!("LPOP {key} failed"))?;
        Ok(head)
    }

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value)
            .await
            .with_context(|| format!("SET {key} failed"))?;
        Ok(())
    }
}
