//! End-to-end delivery over real loopback TCP.
//!
//! Starts a `SocketServer` on an ephemeral port backed by a `MemoryStore`
//! and talks to it with `ProtocolClient`, the same client the simulator
//! uses.

use std::sync::Arc;
use std::time::Duration;

use event_courier::{
    CipherKey, ConnectionRegistry, MemoryStore, Message, ProtocolClient, ServerContext,
    SocketServer,
};
use serde_json::json;
use tokio::net::TcpStream;

fn start_server() -> (SocketServer, MemoryStore) {
    let store = MemoryStore::new();
    let ctx = ServerContext::new(Arc::new(store.clone()), CipherKey::legacy_shared());
    let server = SocketServer::start("127.0.0.1:0".parse().unwrap(), ctx).unwrap();
    (server, store)
}

async fn connect(server: &SocketServer) -> ProtocolClient<TcpStream> {
    ProtocolClient::connect(server.local_addr(), CipherKey::legacy_shared())
        .await
        .unwrap()
}

async fn recv(client: &mut ProtocolClient<TcpStream>) -> Option<Message> {
    tokio::time::timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("Timed out waiting for server message")
        .expect("Failed to read from server")
}

/// Next message that is not a ping.
async fn recv_skipping_pings(client: &mut ProtocolClient<TcpStream>) -> Option<Message> {
    loop {
        match recv(client).await {
            Some(Message::Ping { .. }) => continue,
            other => return other,
        }
    }
}

async fn wait_until_empty(registry: &ConnectionRegistry) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Timed out waiting for registry to empty");
}

#[tokio::test]
async fn test_split_handshake_deliver_ack_disconnect() {
    let (server, store) = start_server();
    store.push_back("event-42", "ev1|1|1000");

    let mut client = connect(&server).await;
    client.send_plain_handshake(json!(42), 2).await.unwrap();

    match recv_skipping_pings(&mut client).await {
        Some(Message::ServerEvent {
            event_id,
            event_number,
            timestamp,
        }) => {
            assert_eq!(event_id, "ev1");
            assert_eq!(event_number.as_deref(), Some("1"));
            assert_eq!(timestamp.as_deref(), Some("1000"));
        }
        other => panic!("Expected ServerEvent, got: {other:?}"),
    }
    assert!(server.registry().get("42").is_some());

    client.send(&Message::ack("ev1")).await.unwrap();

    // The acked event must not come back: wait past the first retry.
    let quiet = tokio::time::timeout(Duration::from_millis(1500), recv_skipping_pings(&mut client)).await;
    assert!(quiet.is_err(), "Unexpected message after ack: {quiet:?}");
    assert!(store.list("event-42").is_empty());

    let registry = server.registry().clone();
    drop(client);
    wait_until_empty(&registry).await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_encrypted_handshake_in_chunks() {
    let (server, store) = start_server();
    store.push_back("event-7", "first|1|1");
    store.push_back("event-7", "second|2|2");

    let mut client = connect(&server).await;
    client.send_split(&Message::handshake("7"), 4).await.unwrap();

    for expected in ["first", "second"] {
        match recv_skipping_pings(&mut client).await {
            Some(Message::ServerEvent { event_id, .. }) => {
                assert_eq!(event_id, expected);
                client.send(&Message::ack(event_id)).await.unwrap();
            }
            other => panic!("Expected ServerEvent, got: {other:?}"),
        }
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.list("event-7").is_empty());
    server.shutdown().await;
}

#[tokio::test]
async fn test_unacked_event_is_retransmitted() {
    let (server, store) = start_server();
    store.push_back("event-r", "retry-me|1|1");

    let mut client = connect(&server).await;
    client.send(&Message::handshake("r")).await.unwrap();

    for _ in 0..2 {
        match recv_skipping_pings(&mut client).await {
            Some(Message::ServerEvent { event_id, .. }) => assert_eq!(event_id, "retry-me"),
            other => panic!("Expected ServerEvent, got: {other:?}"),
        }
    }
    assert_eq!(store.list("event-r").len(), 1);
    server.shutdown().await;
}

#[tokio::test]
async fn test_client_event_stored_after_queue_drains() {
    let (server, store) = start_server();
    let mut client = connect(&server).await;
    client.send(&Message::handshake("u1")).await.unwrap();

    let mut fields = serde_json::Map::new();
    fields.insert("minutes".into(), json!(3));
    client.send(&Message::ClientEvent(fields)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while store.keys_with_prefix("usage-u1-").is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("Timed out waiting for stored client event");

    let key = &store.keys_with_prefix("usage-u1-")[0];
    let stored: serde_json::Value = serde_json::from_str(&store.get(key).unwrap()).unwrap();
    assert_eq!(stored["minutes"], 3);
    assert_eq!(stored["type"], "client-event");
    server.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_after_disconnect_redelivers() {
    let (server, store) = start_server();
    store.push_back("event-back", "sticky|1|1");

    let mut first = connect(&server).await;
    first.send(&Message::handshake("back")).await.unwrap();
    assert!(matches!(
        recv_skipping_pings(&mut first).await,
        Some(Message::ServerEvent { .. })
    ));
    let registry = server.registry().clone();
    drop(first);
    wait_until_empty(&registry).await;

    let mut second = connect(&server).await;
    second.send(&Message::handshake("back")).await.unwrap();
    match recv_skipping_pings(&mut second).await {
        Some(Message::ServerEvent { event_id, .. }) => assert_eq!(event_id, "sticky"),
        other => panic!("Expected ServerEvent, got: {other:?}"),
    }
    server.shutdown().await;
}
