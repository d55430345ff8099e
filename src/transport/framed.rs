//! Framed Transport
//!
//! Exact-count reads and writes over a byte stream, plus newline-delimited
//! control lines carved out of the same buffer.
//!
//! ## Buffer Management
//!
//! TCP is a stream protocol: a single read may return half a control line,
//! or a control line followed by the first bytes of a payload. Everything
//! read from the socket goes into one `BytesMut` buffer, and both
//! [`FramedTransport::read_line`] and [`FramedTransport::recv_exact`] consume
//! from that buffer before touching the socket again. Nothing read ahead is
//! ever lost between a control line and the payload that follows it.
//!
//! ```text
//!   socket ──read_buf──> [ IMAGE:visible:a.jpg:5\n | ab ]
//!                          └── read_line() ───────┘  │
//!                                                     └── recv_exact(5) pulls
//!                                                         "ab" + 3 more bytes
//! ```
//!
//! Every read and write is bounded by the idle timeout.

use crate::protocol::{parse_control, ControlMessage, ParseError, LINE_END};
use bytes::{Bytes, BytesMut};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::trace;

/// Maximum length of a single control line, terminator excluded
pub const MAX_CONTROL_LINE: usize = 1024;

/// Default chunk size used when streaming files
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Largest single reservation made while waiting for a payload
const MAX_READ_RESERVE: usize = 64 * 1024;

/// Errors raised by the framed transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No data within the idle window
    #[error("timed out after {0:?} of inactivity")]
    Timeout(Duration),

    /// Peer closed the connection between messages
    #[error("connection closed by peer")]
    Closed,

    /// Peer closed the connection in the middle of a frame
    #[error("connection closed after {received} of {expected} bytes")]
    PrematureClose { expected: usize, received: usize },

    /// The stream accepted zero bytes
    #[error("write returned zero bytes")]
    WriteZero,

    /// Control line exceeded [`MAX_CONTROL_LINE`]
    #[error("control line exceeds {max} bytes")]
    LineTooLong { max: usize },

    /// Control line is not valid UTF-8
    #[error("control line is not valid UTF-8")]
    InvalidUtf8,

    /// Control line could not be parsed
    #[error("protocol error: {0}")]
    Parse(#[from] ParseError),
}

impl TransportError {
    /// True when the peer simply went away, as opposed to misbehaving.
    pub fn is_disconnect(&self) -> bool {
        match self {
            TransportError::Closed => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// A byte stream with exact-count framing and control lines.
pub struct FramedTransport<S> {
    stream: S,
    buffer: BytesMut,
    idle_timeout: Duration,
    last_activity: Instant,
    bytes_read: u64,
    bytes_written: u64,
}

impl<S> FramedTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a stream. Every read and write waits at most `idle_timeout`.
    pub fn new(stream: S, idle_timeout: Duration) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            idle_timeout,
            last_activity: Instant::now(),
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    /// The underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// The underlying stream, e.g. to shut down its write half.
    ///
    /// Writing to it directly bypasses the byte counters.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// When bytes last moved in either direction.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Receives exactly `n` bytes.
    ///
    /// Bytes already buffered by a previous `read_line` are consumed first.
    /// Fails with [`TransportError::PrematureClose`] if the peer closes early
    /// and [`TransportError::Timeout`] if the peer stalls.
    pub async fn recv_exact(&mut self, n: usize) -> TransportResult<Bytes> {
        while self.buffer.len() < n {
            let missing = n - self.buffer.len();
            self.buffer.reserve(missing.min(MAX_READ_RESERVE));

            if self.read_more().await? == 0 {
                return Err(TransportError::PrematureClose {
                    expected: n,
                    received: self.buffer.len(),
                });
            }
        }

        Ok(self.buffer.split_to(n).freeze())
    }

    /// Sends all of `data`, looping on partial writes.
    pub async fn send_exact(&mut self, data: &[u8]) -> TransportResult<()> {
        let mut sent = 0;

        while sent < data.len() {
            let n = timeout(self.idle_timeout, self.stream.write(&data[sent..]))
                .await
                .map_err(|_| TransportError::Timeout(self.idle_timeout))??;

            if n == 0 {
                return Err(TransportError::WriteZero);
            }

            sent += n;
            self.bytes_written += n as u64;
            self.last_activity = Instant::now();
        }

        timeout(self.idle_timeout, self.stream.flush())
            .await
            .map_err(|_| TransportError::Timeout(self.idle_timeout))??;

        trace!(bytes = data.len(), "Sent frame");
        Ok(())
    }

    /// Reads one `\n`-terminated control line. A trailing `\r` is dropped.
    pub async fn read_line(&mut self) -> TransportResult<String> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == LINE_END) {
                if pos > MAX_CONTROL_LINE {
                    return Err(TransportError::LineTooLong {
                        max: MAX_CONTROL_LINE,
                    });
                }

                let frame = self.buffer.split_to(pos + 1);
                let mut line = &frame[..pos];
                if let [rest @ .., b'\r'] = line {
                    line = rest;
                }

                let line = std::str::from_utf8(line).map_err(|_| TransportError::InvalidUtf8)?;
                trace!(line = line, "Read control line");
                return Ok(line.to_string());
            }

            if self.buffer.len() > MAX_CONTROL_LINE {
                return Err(TransportError::LineTooLong {
                    max: MAX_CONTROL_LINE,
                });
            }

            if self.buffer.capacity() - self.buffer.len() < 256 {
                self.buffer.reserve(INITIAL_BUFFER_SIZE);
            }

            if self.read_more().await? == 0 {
                return if self.buffer.is_empty() {
                    Err(TransportError::Closed)
                } else {
                    Err(TransportError::PrematureClose {
                        expected: self.buffer.len() + 1,
                        received: self.buffer.len(),
                    })
                };
            }
        }
    }

    /// Writes one control line, appending the terminator.
    pub async fn write_line(&mut self, line: &str) -> TransportResult<()> {
        let mut frame = Vec::with_capacity(line.len() + 1);
        frame.extend_from_slice(line.as_bytes());
        frame.push(LINE_END);
        self.send_exact(&frame).await
    }

    /// Reads and parses the next control message.
    pub async fn recv_message(&mut self) -> TransportResult<ControlMessage> {
        let line = self.read_line().await?;
        Ok(parse_control(&line)?)
    }

    pub async fn send_message(&mut self, msg: &ControlMessage) -> TransportResult<()> {
        self.write_line(&msg.encode()).await
    }

    /// Streams the first `len` bytes of a file in `chunk_size` pieces.
    ///
    /// Returns the bytes actually sent, which is less than `len` only if the
    /// file turned out to be shorter.
    pub async fn send_file(&mut self, path: &Path, len: u64, chunk_size: usize) -> TransportResult<u64> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut chunk = vec![0u8; chunk_size.max(1)];
        let mut total = 0u64;

        while total < len {
            let want = chunk.len().min((len - total) as usize);
            let n = file.read(&mut chunk[..want]).await?;
            if n == 0 {
                break;
            }
            self.send_exact(&chunk[..n]).await?;
            total += n as u64;
        }

        Ok(total)
    }

    /// Reads whatever the socket has into the buffer.
    async fn read_more(&mut self) -> TransportResult<usize> {
        let n = timeout(self.idle_timeout, self.stream.read_buf(&mut self.buffer))
            .await
            .map_err(|_| TransportError::Timeout(self.idle_timeout))??;

        if n > 0 {
            self.bytes_read += n as u64;
            self.last_activity = Instant::now();
            trace!(bytes = n, buffered = self.buffer.len(), "Read data");
        }

        Ok(n)
    }
}
