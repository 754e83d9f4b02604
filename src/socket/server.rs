//! TCP server for accepting protocol clients.
//!
//! Binds a listener and spawns an accept loop that hands every accepted
//! socket to [`Connection::spawn`]. Connections run independently; the
//! server only keeps the shared [`ServerContext`] so it can stop them.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use super::connection::{Connection, ServerContext};
use crate::constants::ACCEPT_RETRY_DELAY;
use crate::registry::ConnectionRegistry;

/// Listening server plus its accept loop.
#[derive(Debug)]
pub struct SocketServer {
    local_addr: SocketAddr,
    ctx: ServerContext,
    accept_handle: JoinHandle<()>,
}

impl SocketServer {
    /// Bind `addr` and start accepting connections.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub fn start(addr: SocketAddr, ctx: ServerContext) -> Result<Self> {
        let listener = std::net::TcpListener::bind(addr)
            .with_context(|| format!("Failed to bind {addr}"))?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let local_addr = listener.local_addr()?;

        log::info!("[Socket] Listening on {local_addr}");

        let accept_handle = tokio::spawn(Self::accept_loop(listener, ctx.clone()));

        Ok(Self {
            local_addr,
            ctx,
            accept_handle,
        })
    }

    /// Accept loop; runs until the shutdown token fires.
    async fn accept_loop(listener: TcpListener, ctx: ServerContext) {
        loop {
            tokio::select! {
                biased;
                () = ctx.shutdown.cancelled() => {
                    log::info!("[Socket] Shutdown requested, stopping accept loop");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            log::debug!("[Socket] set_nodelay failed for {peer}: {e}");
                        }
                        drop(Connection::spawn(stream, peer, ctx.clone()));
                    }
                    Err(e) => {
                        log::error!("[Socket] Accept error: {e}");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        }
    }

    /// Address the listener is bound to (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Live handshaken connections.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.ctx.registry
    }

    /// Stop accepting and close every connection.
    pub async fn shutdown(self) {
        let open = self.ctx.registry.len();
        self.ctx.shutdown.cancel();
        if let Err(e) = self.accept_handle.await {
            log::warn!("[Socket] Accept loop ended abnormally: {e}");
        }
        log::info!("[Socket] Server stopped ({open} client connections closed)");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::client::ProtocolClient;
    use crate::crypto::CipherKey;
    use crate::protocol::Message;
    use crate::store::MemoryStore;

    fn start_server() -> (SocketServer, MemoryStore) {
        let store = MemoryStore::new();
        let ctx = ServerContext::new(Arc::new(store.clone()), CipherKey::legacy_shared());
        let server = SocketServer::start("127.0.0.1:0".parse().unwrap(), ctx).unwrap();
        (server, store)
    }

    async fn connect(server: &SocketServer) -> ProtocolClient<tokio::net::TcpStream> {
        ProtocolClient::connect(server.local_addr(), CipherKey::legacy_shared())
            .await
            .unwrap()
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Timed out waiting for condition");
    }

    #[tokio::test]
    async fn test_handshake_registers_client() {
        let (server, _store) = start_server();
        let mut client = connect(&server).await;

        client.send_plain_handshake(json!("abc"), 1).await.unwrap();
        wait_for(|| server.registry().get("abc").is_some()).await;

        let handle = server.registry().get("abc").unwrap();
        assert!(handle.conn_id.starts_with("conn-"));
        assert_eq!(handle.peer.ip(), server.local_addr().ip());
    }

    #[tokio::test]
    async fn test_disconnect_unregisters_client() {
        let (server, _store) = start_server();
        let mut client = connect(&server).await;
        client.send(&Message::handshake("gone")).await.unwrap();
        wait_for(|| server.registry().len() == 1).await;

        drop(client);
        wait_for(|| server.registry().is_empty()).await;
    }

    #[tokio::test]
    async fn test_message_before_handshake_closes_connection() {
        let (server, _store) = start_server();
        let mut client = connect(&server).await;

        client.send(&Message::Pong {}).await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(2), client.recv())
            .await
            .expect("Timed out");
        assert!(matches!(next, Ok(None) | Err(_)), "Expected close, got: {next:?}");
        assert!(server.registry().is_empty());
    }

    #[tokio::test]
    async fn test_registry_close_disconnects_client() {
        let (server, _store) = start_server();
        let mut client = connect(&server).await;
        client.send(&Message::handshake("c1")).await.unwrap();
        wait_for(|| server.registry().len() == 1).await;

        assert!(server.registry().close("c1"));
        let next = tokio::time::timeout(Duration::from_secs(2), client.recv())
            .await
            .expect("Timed out");
        assert!(matches!(next, Ok(None) | Err(_)), "Expected close, got: {next:?}");
        wait_for(|| server.registry().is_empty()).await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_all_connections() {
        let (server, _store) = start_server();
        let addr = server.local_addr();
        let registry = server.registry().clone();

        let mut clients = Vec::new();
        for i in 0..3 {
            let mut client = connect(&server).await;
            client.send(&Message::handshake(format!("c{i}"))).await.unwrap();
            clients.push(client);
        }
        wait_for(|| registry.len() == 3).await;

        server.shutdown().await;
        wait_for(|| registry.is_empty()).await;
        for client in &mut clients {
            let next = tokio::time::timeout(Duration::from_secs(2), client.recv())
                .await
                .expect("Timed out");
            assert!(matches!(next, Ok(None) | Err(_)));
        }

        // The listener is gone with the accept loop.
        let reconnect = tokio::time::timeout(
            Duration::from_secs(2),
            tokio::net::TcpStream::connect(addr),
        )
        .await
        .expect("Timed out");
        assert!(reconnect.is_err());
    }

    #[tokio::test]
    async fn test_many_clients_delivered_independently() {
        let (server, store) = start_server();
        let mut clients = Vec::new();
        for i in 0..5 {
            store.push_back(&format!("event-{i}"), format!("ev-{i}|{i}|1000"));
            let mut client = connect(&server).await;
            client.send(&Message::handshake(i.to_string())).await.unwrap();
            clients.push(client);
        }

        for (i, client) in clients.iter_mut().enumerate() {
            let message = tokio::time::timeout(Duration::from_secs(2), client.recv())
                .await
                .expect("Timed out")
                .unwrap();
            match message {
                Some(Message::ServerEvent { event_id, .. }) => assert_eq!(event_id, format!("ev-{i}")),
                other => panic!("Expected ServerEvent, got: {other:?}"),
            }
        }
    }
}
