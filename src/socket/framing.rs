//! Wire codec for the TCP delivery protocol.
//!
//! Frames are UTF-8 JSON objects terminated by a single NUL byte:
//!
//! ```text
//! {"payload":"<base64>"}\0{"payload":"<base64>"}\0...
//! ```
//!
//! JSON text never contains a raw `0x00` (serde_json escapes control
//! characters), so the delimiter is unambiguous.
//!
//! Decoding is tolerant per segment: a segment that is not valid JSON is
//! logged and dropped, and the rest of the stream keeps decoding. Whether
//! a *valid* JSON object is an acceptable message is decided one layer up,
//! in the connection state machine.

use serde::Serialize;
use thiserror::Error;

/// Byte that terminates every frame on the wire.
pub const DELIMITER: u8 = 0x00;

/// Errors that make the byte stream itself unusable.
#[derive(Debug, Error)]
pub enum FrameError {
    /// More than the configured limit was buffered without seeing a delimiter.
    #[error("frame exceeds {limit} bytes without a delimiter ({buffered} buffered)")]
    TooLarge {
        /// Configured limit in bytes.
        limit: usize,
        /// Bytes currently buffered.
        buffered: usize,
    },
}

/// Encode a message as one frame: its JSON text followed by [`DELIMITER`].
pub fn encode<T: Serialize + ?Sized>(message: &T) -> serde_json::Result<Vec<u8>> {
    let mut buf = serde_json::to_vec(message)?;
    buf.push(DELIMITER);
    Ok(buf)
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and extract complete frames.
/// Handles TCP-style byte stream reassembly, including a delimiter that
/// arrives as the first byte of a later chunk.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Prefix of `buf` already scanned for a delimiter.
    scanned: usize,
    max_frame_bytes: Option<usize>,
}

impl FrameDecoder {
    /// Create a decoder with an unbounded buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a decoder that fails once `limit` bytes are buffered without
    /// a delimiter. `None` keeps the buffer unbounded.
    pub fn with_limit(limit: Option<usize>) -> Self {
        Self {
            max_frame_bytes: limit,
            ..Self::default()
        }
    }

    /// Feed bytes into the decoder and extract all complete frames.
    ///
    /// Returns the parsed JSON of every delimiter-terminated segment, in
    /// arrival order. Incomplete data is buffered for the next call.
    /// Segments that fail to parse are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::TooLarge`] if a size limit is configured and
    /// the pending partial frame exceeds it.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<serde_json::Value>, FrameError> {
        log::trace!("[Framing] Received chunk of {} bytes", bytes.len());
        self.buf.extend_from_slice(bytes);

        let mut frames = Vec::new();
        let mut start = 0;

        while let Some(offset) = self.buf[start.max(self.scanned)..]
            .iter()
            .position(|&b| b == DELIMITER)
        {
            let end = start.max(self.scanned) + offset;
            let segment = &self.buf[start..end];
            match serde_json::from_slice::<serde_json::Value>(segment) {
                Ok(value) => frames.push(value),
                Err(e) => {
                    log::warn!(
                        "[Framing] Dropping invalid JSON segment ({} bytes): {e}",
                        segment.len()
                    );
                }
            }
            start = end + 1;
            self.scanned = start;
        }

        // Remove consumed bytes
        self.buf.drain(..start);
        self.scanned = self.buf.len();

        if let Some(limit) = self.max_frame_bytes {
            if self.buf.len() > limit {
                return Err(FrameError::TooLarge {
                    limit,
                    buffered: self.buf.len(),
                });
            }
        }

        Ok(frames)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Number of bytes waiting for a delimiter.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}
