//! # pairlink - Paired Image Transfer over TCP
//!
//! pairlink moves pairs of images (one visible-spectrum, one thermal) from a
//! producer to a consumer over plain TCP. The consumer runs each completed
//! pair through an external processor and streams the result images back.
//!
//! ## Features
//!
//! - **Exact framing**: payloads are length-announced and read with
//!   `recv_exact`, control messages are newline-delimited lines
//! - **Liveness**: handshake, heartbeats and an idle timeout on every read
//! - **Isolation**: one task per consumer session, one connection per pair
//! - **Bounded producer**: at most `max_workers` pairs in flight
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────┐                ┌──────────────────────────────┐
//! │          Producer           │                │           Consumer           │
//! │                             │                │                              │
//! │  run_pairs ──> Worker p1 ───┼── TCP ────────>│  Server ──> SessionHandler   │
//! │            ──> Worker p2 ───┼── TCP ────────>│         ──> SessionHandler   │
//! │            ──> ...          │                │                 │            │
//! │                             │                │                 ▼            │
//! │  results/<file>  <──────────┼── RESULT_IMAGE─│           PairProcessor      │
//! └─────────────────────────────┘                └──────────────────────────────┘
//!                 both sides speak through FramedTransport
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use pairlink::{Config, NoopProcessor, Server};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Arc::new(Config::default());
//!     let server = Server::bind(config, Arc::new(NoopProcessor)).await?;
//!     server.run().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`transport`]: exact-count reads/writes and control lines
//! - [`protocol`]: control message vocabulary and parser
//! - [`session`]: consumer-side session handler
//! - [`server`]: consumer accept loop
//! - [`client`]: producer connection worker and worker pool
//! - [`processing`]: the pair processor interface
//! - [`config`]: configuration file and command-line flags
//! - [`logging`]: tracing subscriber setup

pub mod client;
pub mod config;
pub mod logging;
pub mod processing;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

// Re-export commonly used types for convenience
pub use client::{run_pairs, ConnectionWorker, PairOutcome, PairReport, WorkerError};
pub use config::{CliCommand, Config, ConfigError, ProcessorConfig, DEFAULT_HOST, DEFAULT_PORT};
pub use processing::{CommandProcessor, NoopProcessor, PairProcessor, ProcessingError};
pub use protocol::{parse_control, ControlMessage, Modality, ParseError};
pub use server::Server;
pub use session::{handle_session, SessionContext, SessionError, SessionHandler, SessionStats};
pub use transport::{FramedTransport, TransportError};

/// Version of pairlink
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
