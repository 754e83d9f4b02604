//! Client side of the delivery protocol.
//!
//! Used by the simulator and the integration tests. Works over any
//! byte stream, so tests can run it against an in-memory duplex pipe.

use std::collections::VecDeque;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::constants::READ_BUFFER_SIZE;
use crate::crypto::CipherKey;
use crate::protocol::{Envelope, Message};
use crate::socket::framing::{self, FrameDecoder};

/// Split `bytes` into at most `chunks` roughly equal, non-empty pieces.
fn split_chunks(bytes: &[u8], chunks: usize) -> impl Iterator<Item = &[u8]> {
    let size = bytes.len().div_ceil(chunks.max(1)).max(1);
    bytes.chunks(size)
}

/// A connection speaking the client half of the protocol.
pub struct ProtocolClient<S> {
    stream: S,
    key: CipherKey,
    decoder: FrameDecoder,
    received: VecDeque<Message>,
}

impl<S> std::fmt::Debug for ProtocolClient<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolClient")
            .field("buffered", &self.received.len())
            .finish_non_exhaustive()
    }
}

impl ProtocolClient<TcpStream> {
    /// Open a TCP connection to a server.
    pub async fn connect(addr: impl ToSocketAddrs, key: CipherKey) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .context("Failed to connect to server")?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, key))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> ProtocolClient<S> {
    /// Wrap an established stream.
    pub fn new(stream: S, key: CipherKey) -> Self {
        Self {
            stream,
            key,
            decoder: FrameDecoder::new(),
            received: VecDeque::new(),
        }
    }

    /// Send an unencrypted handshake, split across `chunks` writes.
    ///
    /// `client_id` is sent as given, so a JSON number stays a number.
    pub async fn send_plain_handshake(&mut self, client_id: Value, chunks: usize) -> Result<()> {
        let frame = framing::encode(&json!({"type": "handshake", "clientId": client_id}))?;
        self.send_chunked(&frame, chunks).await
    }

    /// Encrypt and send one message.
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        let frame = message.seal(&self.key)?;
        self.send_raw(&frame).await
    }

    /// Encrypt one message and send it across `chunks` writes.
    pub async fn send_split(&mut self, message: &Message, chunks: usize) -> Result<()> {
        let frame = message.seal(&self.key)?;
        self.send_chunked(&frame, chunks).await
    }

    /// Write bytes exactly as given.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream
            .write_all(bytes)
            .await
            .context("Failed to write to server")?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn send_chunked(&mut self, frame: &[u8], chunks: usize) -> Result<()> {
        for chunk in split_chunks(frame, chunks) {
            self.send_raw(chunk).await?;
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    /// Receive the next server message.
    ///
    /// Returns `Ok(None)` once the server has closed the connection.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            if let Some(message) = self.received.pop_front() {
                return Ok(Some(message));
            }

            let n = self
                .stream
                .read(&mut buf)
                .await
                .context("Failed to read from server")?;
            if n == 0 {
                return Ok(None);
            }

            for value in self.decoder.feed(&buf[..n])? {
                let message = Envelope::classify(value)?.open(&self.key)?;
                self.received.push_back(message);
            }
        }
    }

    /// Key used to seal and open messages.
    pub fn key(&self) -> &CipherKey {
        &self.key
    }

    /// Consume the client and return the stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}
