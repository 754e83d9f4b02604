//! Registry of handshaken connections, keyed by client id.
//!
//! The registry never owns a connection. Each connection task owns its
//! own state and registers a [`ConnectionHandle`]: enough to identify it
//! and to cancel it from outside.
//!
//! A second handshake for a client id that is already registered replaces
//! the entry. The displaced connection keeps running until it closes on its
//! own, and its cleanup leaves the newer entry alone because the connection
//! ids differ.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// External view of one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    /// Per-socket id, unique for the process lifetime.
    pub conn_id: String,
    /// Identity the client declared in its handshake.
    pub client_id: String,
    /// Remote address.
    pub peer: SocketAddr,
    /// When the handshake completed.
    pub connected_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle for a connection that completed its handshake now.
    pub fn new(
        conn_id: impl Into<String>,
        client_id: impl Into<String>,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            conn_id: conn_id.into(),
            client_id: client_id.into(),
            peer,
            connected_at: Utc::now(),
            cancel,
        }
    }

    /// Ask the connection task to run its cleanup.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether the connection has been asked to close.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Shared map of client id to live connection.
///
/// Cheap to clone; every clone sees the same map.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<String, ConnectionHandle>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handshaken connection, replacing any previous entry for
    /// the same client id.
    ///
    /// Returns the displaced handle, if any.
    pub fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let mut connections = self
            .connections
            .write()
            .expect("registry lock poisoned");
        let previous = connections.insert(handle.client_id.clone(), handle);
        if let Some(ref old) = previous {
            log::warn!(
                "[Registry] Client {} re-registered; replacing {}",
                old.client_id,
                old.conn_id
            );
        }
        previous
    }

    /// Remove the entry for `client_id` if it still belongs to `conn_id`.
    ///
    /// Returns true if an entry was removed.
    pub fn unregister(&self, client_id: &str, conn_id: &str) -> bool {
        let mut connections = self
            .connections
            .write()
            .expect("registry lock poisoned");
        match connections.get(client_id) {
            Some(handle) if handle.conn_id == conn_id => {
                connections.remove(client_id);
                true
            }
            Some(handle) => {
                log::debug!(
                    "[Registry] Not removing {client_id}: entry now belongs to {}",
                    handle.conn_id
                );
                false
            }
            None => false,
        }
    }

    /// Look up the connection registered for `client_id`.
    pub fn get(&self, client_id: &str) -> Option<ConnectionHandle> {
        self.connections
            .read()
            .expect("registry lock poisoned")
            .get(client_id)
            .cloned()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections
            .read()
            .expect("registry lock poisoned")
            .len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered client ids, sorted.
    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .connections
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Close the connection registered for `client_id`.
    ///
    /// The entry disappears once the connection finishes its cleanup.
    /// Returns false if no such client is registered.
    pub fn close(&self, client_id: &str) -> bool {
        match self.get(client_id) {
            Some(handle) => {
                log::info!("[Registry] Closing {client_id} ({})", handle.conn_id);
                handle.close();
                true
            }
            None => false,
        }
    }

    /// Close every registered connection. Returns how many were signalled.
    pub fn close_all(&self) -> usize {
        let handles: Vec<ConnectionHandle> = self
            .connections
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        for handle in &handles {
            handle.close();
        }
        handles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn handle(conn_id: &str, client_id: &str) -> ConnectionHandle {
        ConnectionHandle::new(conn_id, client_id, peer(), CancellationToken::new())
    }

    #[test]
    fn test_register_and_get() {
        let registry = ConnectionRegistry::new();
        assert!(registry.is_empty());

        assert!(registry.register(handle("conn:1", "42")).is_none());
        assert_eq!(registry.len(), 1);

        let found = registry.get("42").unwrap();
        assert_eq!(found.conn_id, "conn:1");
        assert_eq!(found.peer, peer());
        assert!(registry.get("43").is_none());
    }

    #[test]
    fn test_register_replaces_same_client() {
        let registry = ConnectionRegistry::new();
        registry.register(handle("conn:1", "42"));

        let displaced = registry.register(handle("conn:2", "42")).unwrap();
        assert_eq!(displaced.conn_id, "conn:1");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("42").unwrap().conn_id, "conn:2");
        // Replacing does not close the old connection.
        assert!(!displaced.is_closed());
    }

    #[test]
    fn test_unregister_requires_matching_conn_id() {
        let registry = ConnectionRegistry::new();
        registry.register(handle("conn:1", "42"));
        registry.register(handle("conn:2", "42"));

        // The displaced connection's cleanup must not evict the new one.
        assert!(!registry.unregister("42", "conn:1"));
        assert_eq!(registry.get("42").unwrap().conn_id, "conn:2");

        assert!(registry.unregister("42", "conn:2"));
        assert!(registry.is_empty());
        assert!(!registry.unregister("42", "conn:2"));
    }

    #[test]
    fn test_client_ids_sorted() {
        let registry = ConnectionRegistry::new();
        for (i, id) in ["c", "a", "b"].iter().enumerate() {
            registry.register(handle(&format!("conn:{i}"), id));
        }
        assert_eq!(registry.client_ids(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_close_cancels_token() {
        let registry = ConnectionRegistry::new();
        let token = CancellationToken::new();
        registry.register(ConnectionHandle::new("conn:1", "42", peer(), token.clone()));

        assert!(registry.close("42"));
        assert!(token.is_cancelled());
        assert!(!registry.close("missing"));
    }

    #[test]
    fn test_close_all_signals_everyone() {
        let registry = ConnectionRegistry::new();
        let tokens: Vec<_> = (0..3).map(|_| CancellationToken::new()).collect();
        for (i, token) in tokens.iter().enumerate() {
            registry.register(ConnectionHandle::new(
                format!("conn:{i}"),
                format!("client-{i}"),
                peer(),
                token.clone(),
            ));
        }

        assert_eq!(registry.close_all(), 3);
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
    }

    #[test]
    fn test_clones_share_state() {
        let registry = ConnectionRegistry::new();
        let other = registry.clone();
        registry.register(handle("conn:1", "42"));
        assert_eq!(other.len(), 1);
    }
}
