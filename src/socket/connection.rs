//! Per-connection protocol driver.
//!
//! Each accepted socket gets one task that owns a [`Connection`]: the
//! framer, the delivery and heartbeat state, and the timers. A second task
//! drains encoded frames to the write half, so nothing in the driver ever
//! blocks on the socket.
//!
//! The driver is a single `select!` loop, which makes every handler run to
//! completion before the next one starts. Polls never overlap and no
//! handler runs after cleanup. Store calls are awaited inline but bounded
//! by [`STORE_CALL_TIMEOUT`] and abandoned on cancellation, so a stalled
//! store only costs the tick that hit it.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::framing::{FrameDecoder, FrameError};
use crate::constants::{
    client_payload_key, event_queue_key, LIVENESS_CHECK_INTERVAL, PING_INTERVAL, POLL_INTERVAL,
    READ_BUFFER_SIZE, RETRY_INTERVAL, STORE_CALL_TIMEOUT,
};
use crate::crypto::CipherKey;
use crate::delivery::{AckDecision, DeliveryState, EventRecord, RetryDecision};
use crate::heartbeat::{self, Heartbeat};
use crate::protocol::{Envelope, Message, ProtocolError};
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::store::EventStore;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Everything a connection shares with the rest of the server.
#[derive(Clone)]
pub struct ServerContext {
    /// Event queues and payload storage.
    pub store: Arc<dyn EventStore>,
    /// Handshaken connections by client id.
    pub registry: ConnectionRegistry,
    /// Payload key.
    pub key: Arc<CipherKey>,
    /// Partial-frame limit per connection; `None` is unbounded.
    pub max_frame_bytes: Option<usize>,
    /// Parent of every connection's cancellation token.
    pub shutdown: CancellationToken,
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("registry", &self.registry)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .finish_non_exhaustive()
    }
}

impl ServerContext {
    /// Create a context with an unbounded frame buffer and a fresh shutdown token.
    pub fn new(store: Arc<dyn EventStore>, key: CipherKey) -> Self {
        Self {
            store,
            registry: ConnectionRegistry::new(),
            key: Arc::new(key),
            max_frame_bytes: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Set the partial-frame limit.
    #[must_use]
    pub fn with_max_frame_bytes(mut self, limit: Option<usize>) -> Self {
        self.max_frame_bytes = limit;
        self
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted; only a handshake is acceptable.
    AwaitingHandshake,
    /// Bound to a client id; delivery and heartbeat are running.
    Active,
    /// Cleaned up. Terminal.
    Closed,
}

/// Why a connection ended.
#[derive(Debug, Error)]
pub enum CloseReason {
    /// The peer closed its end.
    #[error("peer closed the connection")]
    PeerClosed,

    /// Reading from the socket failed.
    #[error("read error: {0}")]
    Read(#[from] io::Error),

    /// The byte stream could not be framed.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The client broke the protocol.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// No pong within the timeout.
    #[error("no pong for {0:?}")]
    HeartbeatTimeout(Duration),

    /// The writer task is gone.
    #[error("writer closed")]
    WriterClosed,

    /// Closed through the registry or by server shutdown.
    #[error("closed by server")]
    Cancelled,
}

#[derive(Default)]
struct Timers {
    poll: Option<Interval>,
    retry: Option<Interval>,
    ping: Option<Interval>,
    liveness: Option<Interval>,
}

fn interval_after(period: Duration) -> Interval {
    time::interval_at(Instant::now() + period, period)
}

/// Tick `timer`, or wait forever if it is not running.
async fn next_tick(timer: &mut Option<Interval>) -> Instant {
    match timer {
        Some(interval) => interval.tick().await,
        None => std::future::pending().await,
    }
}

/// Await one store call.
///
/// The outer `Err` means the connection was cancelled mid-call. A call that
/// outlives [`STORE_CALL_TIMEOUT`] comes back as an ordinary store error.
async fn store_call<T>(
    cancel: &CancellationToken,
    call: impl Future<Output = anyhow::Result<T>>,
) -> Result<anyhow::Result<T>, CloseReason> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(CloseReason::Cancelled),
        result = time::timeout(STORE_CALL_TIMEOUT, call) => Ok(match result {
            Ok(outcome) => outcome,
            Err(elapsed) => Err(anyhow::Error::new(elapsed)
                .context(format!("no reply within {STORE_CALL_TIMEOUT:?}"))),
        }),
    }
}

/// One client connection, owned by its driver task.
pub struct Connection {
    conn_id: String,
    client_id: Option<String>,
    peer: SocketAddr,
    state: ConnectionState,
    ctx: ServerContext,
    cancel: CancellationToken,
    decoder: FrameDecoder,
    delivery: DeliveryState,
    heartbeat: Heartbeat,
    timers: Timers,
    /// Sealed frame of the in-flight event, resent verbatim on retry.
    in_flight_frame: Option<Vec<u8>>,
    frame_tx: UnboundedSender<Vec<u8>>,
    writer: JoinHandle<()>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("conn_id", &self.conn_id)
            .field("client_id", &self.client_id)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Take ownership of an accepted stream and drive it on a new task.
    ///
    /// The task resolves once the connection is cleaned up, with the reason.
    pub fn spawn<S>(stream: S, peer: SocketAddr, ctx: ServerContext) -> JoinHandle<CloseReason>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let conn_id = format!("conn-{}", NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed));
        let cancel = ctx.shutdown.child_token();
        let writer = tokio::spawn(write_loop(
            conn_id.clone(),
            writer,
            frame_rx,
            cancel.clone(),
        ));

        let conn = Self {
            conn_id,
            client_id: None,
            peer,
            state: ConnectionState::AwaitingHandshake,
            decoder: FrameDecoder::with_limit(ctx.max_frame_bytes),
            ctx,
            cancel,
            delivery: DeliveryState::new(),
            heartbeat: Heartbeat::new(),
            timers: Timers::default(),
            in_flight_frame: None,
            frame_tx,
            writer,
        };

        log::info!("[Socket] Accepted {} from {peer}", conn.conn_id);
        tokio::spawn(conn.run(reader))
    }

    async fn run<R: AsyncRead + Unpin>(mut self, mut reader: R) -> CloseReason {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        let reason = loop {
            let step = tokio::select! {
                biased;
                () = self.cancel.cancelled() => Err(CloseReason::Cancelled),
                read = reader.read(&mut buf) => match read {
                    Ok(0) => Err(CloseReason::PeerClosed),
                    Ok(n) => self.on_bytes(&buf[..n]).await,
                    Err(e) => Err(CloseReason::Read(e)),
                },
                // Heartbeat ahead of delivery: after a poll stalls on the
                // store, an overdue liveness check runs before the next poll.
                _ = next_tick(&mut self.timers.ping) => self.on_ping(),
                _ = next_tick(&mut self.timers.liveness) => self.on_liveness_check(),
                _ = next_tick(&mut self.timers.retry) => self.on_retry_tick(),
                _ = next_tick(&mut self.timers.poll) => self.on_poll().await,
            };

            if let Err(reason) = step {
                break reason;
            }
        };

        self.cleanup(&reason);
        reason
    }

    /// Client id once known, connection id before.
    fn label(&self) -> &str {
        self.client_id.as_deref().unwrap_or(&self.conn_id)
    }

    async fn on_bytes(&mut self, bytes: &[u8]) -> Result<(), CloseReason> {
        for frame in self.decoder.feed(bytes)? {
            self.dispatch(frame).await?;
        }
        Ok(())
    }

    async fn dispatch(&mut self, frame: Value) -> Result<(), CloseReason> {
        let envelope = Envelope::classify(frame)?;
        let plaintext = envelope.is_plain();
        let message = envelope.open(&self.ctx.key)?;

        if message.is_server_originated() {
            return Err(ProtocolError::WrongDirection(message.kind()).into());
        }
        if plaintext && self.state == ConnectionState::Active {
            return Err(ProtocolError::PlaintextAfterHandshake(message.kind()).into());
        }

        match (self.state, message) {
            (ConnectionState::AwaitingHandshake, Message::Handshake { client_id }) => {
                self.on_handshake(client_id)
            }
            (ConnectionState::AwaitingHandshake, other) => {
                Err(ProtocolError::HandshakeRequired(other.kind()).into())
            }
            (ConnectionState::Active, Message::Handshake { client_id }) => {
                self.on_repeat_handshake(client_id)
            }
            (ConnectionState::Active, Message::Ack { event_id }) => {
                self.on_ack(event_id.as_deref()).await
            }
            (ConnectionState::Active, message @ Message::ClientEvent(_)) => {
                let payload = serde_json::to_string(&message).map_err(ProtocolError::from)?;
                self.delivery.enqueue_payload(payload);
                log::debug!(
                    "[Delivery] Buffered client payload from {} ({} pending)",
                    self.label(),
                    self.delivery.pending_payloads()
                );
                Ok(())
            }
            (ConnectionState::Active, Message::Pong {}) => {
                self.heartbeat.record_pong();
                log::debug!("[Heartbeat] Pong from {}", self.label());
                Ok(())
            }
            (ConnectionState::Active, Message::Ping { .. } | Message::ServerEvent { .. })
            | (ConnectionState::Closed, _) => Ok(()),
        }
    }

    fn on_handshake(&mut self, client_id: Option<String>) -> Result<(), CloseReason> {
        let client_id = client_id
            .filter(|id| !id.is_empty())
            .ok_or(ProtocolError::MissingClientId)?;

        self.ctx.registry.register(ConnectionHandle::new(
            self.conn_id.clone(),
            client_id.clone(),
            self.peer,
            self.cancel.clone(),
        ));
        log::info!(
            "[Socket] Handshake completed: client {client_id} on {} ({})",
            self.conn_id,
            self.peer
        );

        self.client_id = Some(client_id);
        self.state = ConnectionState::Active;
        self.start_timers();
        Ok(())
    }

    fn on_repeat_handshake(&self, client_id: Option<String>) -> Result<(), CloseReason> {
        let requested = client_id
            .filter(|id| !id.is_empty())
            .ok_or(ProtocolError::MissingClientId)?;
        let current = self.label();
        if requested == current {
            log::debug!("[Socket] Ignoring repeated handshake from {current}");
            return Ok(());
        }
        Err(ProtocolError::IdentityChange {
            current: current.to_string(),
            requested,
        }
        .into())
    }

    fn start_timers(&mut self) {
        let mut poll = interval_after(POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.timers.poll = Some(poll);
        self.timers.ping = Some(interval_after(PING_INTERVAL));
        self.timers.liveness = Some(interval_after(LIVENESS_CHECK_INTERVAL));
    }

    fn send(&self, frame: Vec<u8>) -> Result<(), CloseReason> {
        if self.frame_tx.send(frame).is_err() {
            return Err(CloseReason::WriterClosed);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------

    async fn on_poll(&mut self) -> Result<(), CloseReason> {
        let Some(client_id) = self.client_id.clone() else {
            return Ok(());
        };
        let queue = event_queue_key(&client_id);

        let head = match store_call(&self.cancel, self.ctx.store.peek_head(&queue)).await? {
            Ok(head) => head,
            Err(e) => {
                log::error!("[Delivery] Poll of {queue} failed: {e:#}");
                return Ok(());
            }
        };

        match head {
            None => self.flush_payloads(&client_id).await?,
            Some(entry) => {
                let adopted = self.delivery.observe_head(&entry).map(EventRecord::to_message);
                if let Some(message) = adopted {
                    self.send_event(&message)?;
                }
            }
        }
        Ok(())
    }

    fn send_event(&mut self, message: &Message) -> Result<(), CloseReason> {
        let frame = message.seal(&self.ctx.key)?;
        if let Message::ServerEvent { event_id, .. } = message {
            log::debug!("[Delivery] Sending {event_id} to {}", self.label());
        }
        self.send(frame.clone())?;
        self.in_flight_frame = Some(frame);
        // Replacing the interval cancels the previous event's retries.
        self.timers.retry = Some(interval_after(RETRY_INTERVAL));
        Ok(())
    }

    fn stop_retry(&mut self) {
        self.timers.retry = None;
        self.in_flight_frame = None;
    }

    fn on_retry_tick(&mut self) -> Result<(), CloseReason> {
        match self.delivery.on_retry_tick() {
            RetryDecision::Idle => self.stop_retry(),
            RetryDecision::Retransmit { attempt } => {
                log::warn!(
                    "[Delivery] Retrying {} for {}, attempt {attempt}",
                    self.delivery
                        .current()
                        .map_or("?", |record| record.event_id.as_str()),
                    self.label()
                );
                if let Some(frame) = self.in_flight_frame.clone() {
                    self.send(frame)?;
                }
            }
            RetryDecision::Abandon { event_id, attempts } => {
                log::warn!(
                    "[Delivery] Event {event_id} for {} timed out after {attempts} retries",
                    self.label()
                );
                self.stop_retry();
            }
        }
        Ok(())
    }

    async fn on_ack(&mut self, event_id: Option<&str>) -> Result<(), CloseReason> {
        let decision = self.delivery.on_ack(event_id);
        match decision {
            AckDecision::Matched { ref event_id } => {
                log::debug!("[Delivery] Ack for {event_id} from {}", self.label());
            }
            AckDecision::Mismatched { invalid_acks } => {
                log::warn!(
                    "[Delivery] Invalid ack {event_id:?} from {} ({invalid_acks} so far)",
                    self.label()
                );
            }
            AckDecision::ForceDrop {
                invalid_acks,
                ref dropped,
            } => {
                log::warn!(
                    "[Delivery] {} sent {invalid_acks} invalid acks; dropping head {dropped:?}",
                    self.label()
                );
            }
        }

        if !decision.pops_head() {
            return Ok(());
        }
        self.stop_retry();

        let Some(ref client_id) = self.client_id else {
            return Ok(());
        };
        let queue = event_queue_key(client_id);
        if let Err(e) = store_call(&self.cancel, self.ctx.store.pop_head(&queue)).await? {
            // The head stays queued and is adopted again by the next poll.
            log::error!("[Delivery] Pop of {queue} failed: {e:#}");
        }
        Ok(())
    }

    async fn flush_payloads(&mut self, client_id: &str) -> Result<(), CloseReason> {
        while let Some(payload) = self.delivery.next_payload() {
            let key = client_payload_key(client_id, chrono::Utc::now().timestamp_millis());
            match store_call(&self.cancel, self.ctx.store.set(&key, payload)).await? {
                Ok(()) => self.delivery.commit_payload(),
                Err(e) => {
                    log::error!("[Delivery] Storing payload {key} failed: {e:#}");
                    break;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------

    fn on_ping(&mut self) -> Result<(), CloseReason> {
        let frame = heartbeat::ping().seal(&self.ctx.key)?;
        log::trace!("[Heartbeat] Ping to {}", self.label());
        self.send(frame)
    }

    fn on_liveness_check(&mut self) -> Result<(), CloseReason> {
        if self.heartbeat.is_expired() {
            return Err(CloseReason::HeartbeatTimeout(self.heartbeat.silence()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cleanup
    // ------------------------------------------------------------------

    /// Stop everything and release the connection. Safe to call twice.
    fn cleanup(&mut self, reason: &CloseReason) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;

        self.timers = Timers::default();
        self.in_flight_frame = None;
        self.cancel.cancel();
        self.writer.abort();

        if let Some(ref client_id) = self.client_id {
            self.ctx.registry.unregister(client_id, &self.conn_id);
        }

        match reason {
            CloseReason::PeerClosed | CloseReason::Cancelled => {
                log::info!("[Socket] Closed {}: {reason}", self.label());
            }
            _ => log::warn!("[Socket] Closed {}: {reason}", self.label()),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cleanup(&CloseReason::Cancelled);
    }
}

/// Write loop: receives encoded frames and writes them to the socket.
async fn write_loop<S: AsyncWrite>(
    conn_id: String,
    mut writer: WriteHalf<S>,
    mut frame_rx: UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    while let Some(data) = frame_rx.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            log::error!("[Socket] Write error on {conn_id}: {e}");
            cancel.cancel();
            return;
        }
    }
    if let Err(e) = writer.shutdown().await {
        log::debug!("[Socket] Shutdown of {conn_id} write half failed: {e}");
    }
}
