//! Framed Transport Module
//!
//! Everything that crosses the wire goes through [`FramedTransport`]:
//! control lines via `read_line`/`write_line`, payloads via
//! `recv_exact`/`send_exact`. No other code reads from a socket directly.
//!
//! ## Example
//!
//! ```ignore
//! use pairlink::transport::FramedTransport;
//! use pairlink::protocol::ControlMessage;
//! use std::time::Duration;
//!
//! let stream = TcpStream::connect("127.0.0.1:9000").await?;
//! let mut transport = FramedTransport::new(stream, Duration::from_secs(30));
//!
//! transport.send_message(&ControlMessage::Heartbeat).await?;
//! assert_eq!(transport.recv_message().await?, ControlMessage::Alive);
//! ```

pub mod framed;

// Re-export commonly used types
pub use framed::{
    FramedTransport, TransportError, TransportResult, DEFAULT_CHUNK_SIZE, MAX_CONTROL_LINE,
};
