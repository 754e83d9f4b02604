//! TCP transport for the delivery protocol.
//!
//! # Architecture
//!
//! ```text
//! SocketServer (accept loop)
//!    │ per accepted socket
//!    ▼
//! Connection task ──select!──┬─ socket reads ─► FrameDecoder ─► dispatch
//!                            ├─ poll / retry timers ─► EventStore
//!                            ├─ ping / liveness timers
//!                            └─ cancellation (registry, shutdown)
//!    │ encoded frames (mpsc)
//!    ▼
//! writer task ─► socket
//! ```
//!
//! # Wire Protocol
//!
//! NUL-terminated JSON: `{...}\0{...}\0`. See [`framing`].

pub mod connection;
pub mod framing;
pub mod server;

pub use connection::{CloseReason, Connection, ConnectionState, ServerContext};
pub use server::SocketServer;
