//! Event Courier - encrypted TCP event delivery.
//!
//! Clients connect over TCP, identify themselves with a handshake, and then
//! receive their per-client event queue one event at a time. Every event is
//! resent until acknowledged or until the retry budget runs out, and a
//! ping/pong heartbeat drops clients that go silent.
//!
//! # Modules
//!
//! - [`socket`] - TCP server, per-connection driver and wire framing
//! - [`protocol`] - message types and sealed envelopes
//! - [`crypto`] - AES-256-GCM payload encryption
//! - [`delivery`] - in-flight event and ack tracking
//! - [`heartbeat`] - liveness tracking
//! - [`registry`] - live connections by client id
//! - [`store`] - event queues and payload storage (Redis or in-memory)
//! - [`client`] - client half of the protocol
//! - [`config`] - configuration loading

pub mod client;
pub mod commands;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod delivery;
pub mod heartbeat;
pub mod protocol;
pub mod registry;
pub mod socket;
pub mod store;

// Re-export commonly used types
pub use client::ProtocolClient;
pub use config::Config;
pub use crypto::CipherKey;
pub use protocol::Message;
pub use registry::ConnectionRegistry;
pub use socket::{ServerContext, SocketServer};
pub use store::{EventStore, MemoryStore, RedisStore};
