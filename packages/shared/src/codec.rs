//! Line-delimited JSON codec for `ChatMessage`.
//!
//! Each message is serialized as a single JSON object followed by `\n`.
//! JSON escapes control characters inside strings, so a raw newline can only
//! ever appear as the frame boundary and no length prefix is needed.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::message::ChatMessage;

/// Upper bound for a single encoded message, newline excluded.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Errors raised while decoding a message from an open connection.
///
/// A clean close by the peer is not an error; see [`MessageReader::decode`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed in the middle of a message ({len} bytes buffered)")]
    Truncated { len: usize },

    #[error("message exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Encode a message into its wire representation (JSON + `\n`).
pub fn encode(message: &ChatMessage) -> Vec<u8> {
    // Two string fields cannot fail to serialize.
    let mut frame = serde_json::to_vec(message).expect("ChatMessage is always serializable");
    frame.push(b'\n');
    frame
}

/// Reads messages from the read half of a connection.
pub struct MessageReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    /// Wait for the next message.
    ///
    /// Returns `Ok(None)` when the peer closed the connection cleanly before a
    /// new message began, which callers treat as "the connection is done".
    ///
    /// Not cancel safe: a partially received frame is discarded if the future
    /// is dropped, so only race it against signals that end the connection.
    pub async fn decode(&mut self) -> Result<Option<ChatMessage>, DecodeError> {
        self.buf.clear();

        let limit = MAX_FRAME_LEN as u64 + 1;
        let read = (&mut self.inner)
            .take(limit)
            .read_until(b'\n', &mut self.buf)
            .await?;

        if read == 0 {
            return Ok(None);
        }

        if self.buf.last() != Some(&b'\n') {
            if self.buf.len() > MAX_FRAME_LEN {
                return Err(DecodeError::FrameTooLarge {
                    limit: MAX_FRAME_LEN,
                });
            }
            return Err(DecodeError::Truncated {
                len: self.buf.len(),
            });
        }

        self.buf.pop();
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }

        let message = serde_json::from_slice(&self.buf)?;
        Ok(Some(message))
    }
}

/// Writes messages to the write half of a connection.
pub struct MessageWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Encode, write and flush one message.
    pub async fn write_message(&mut self, message: &ChatMessage) -> io::Result<()> {
        let frame = encode(message);
        self.inner.write_all(&frame).await?;
        self.inner.flush().await
    }

    /// Half-close the write side so the peer observes end of stream.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}
