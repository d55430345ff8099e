//! Control Protocol
//!
//! This module implements the text control vocabulary that frames every
//! pair exchange.
//!
//! ## Overview
//!
//! Control messages are short UTF-8 lines. They negotiate the handshake,
//! keep the connection alive, and announce binary payloads together with
//! their exact length. The payload bytes themselves are moved by the
//! [`transport`](crate::transport) layer with `recv_exact`/`send_exact`.
//!
//! ## Modules
//!
//! - `types`: Defines `ControlMessage`, `Modality` and encoding
//! - `parser`: Parses a received line back into a `ControlMessage`
//!
//! ## Example
//!
//! ```
//! use pairlink::protocol::{parse_control, ControlMessage, Modality};
//!
//! let line = ControlMessage::image(Modality::Visible, "p1.jpg", 2048).encode();
//! assert_eq!(line, "IMAGE:visible:p1.jpg:2048");
//!
//! let msg = parse_control(&line).unwrap();
//! assert!(matches!(msg, ControlMessage::Image(ref img) if img.size == 2048));
//! ```

pub mod parser;
pub mod types;

// Re-export commonly used types for convenience
pub use parser::{parse_control, validate_filename, ParseError, ParseResult, MAX_PAYLOAD_SIZE};
pub use types::{ControlMessage, ImageAnnounce, Modality, ResultAnnounce, LINE_END};
