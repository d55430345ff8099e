//! Session Handler
//!
//! This module owns one accepted producer connection from handshake to
//! close. Each session runs in its own task and shares nothing with other
//! sessions except the statistics counters.
//!
//! ## Session Lifecycle
//!
//! ```text
//! 1. Producer connects (TCP handshake)
//!        │
//!        ▼
//! 2. AwaitHandshake ── anything but CLIENT:<id> ──> dropped
//!        │ ACCEPTED
//!        ▼
//! 3. ┌──────────────────────────────────────────┐
//!    │ Idle                                     │
//!    │   HEARTBEAT ─────────────> ALIVE         │
//!    │   IMAGE:... ─> ReceivingImage            │
//!    │                 READY, recv_exact(size)  │
//!    │                 RECEIVED | FAILED+close  │
//!    │   both modalities stored?                │
//!    │     └─> Processing ─> SendingResults     │
//!    │           RESULT_IMAGE / RESULT_FAILED   │
//!    │           RESULTS_DONE                   │
//!    │   anything else ──────────> ignored      │
//!    └──────────────────────────────────────────┘
//!        │
//!        ▼
//! 4. Producer disconnects / timeout / error ──> Closed
//! ```

use crate::config::Config;
use crate::processing::{PairProcessor, ProcessingError};
use crate::protocol::{validate_filename, ControlMessage, ImageAnnounce, Modality};
use crate::transport::{FramedTransport, TransportError};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// Statistics shared by all sessions
#[derive(Debug, Default)]
pub struct SessionStats {
    /// Total number of connections accepted
    pub sessions_accepted: AtomicU64,
    /// Currently open sessions
    pub active_sessions: AtomicU64,
    /// Sessions that got past the handshake
    pub handshakes_completed: AtomicU64,
    /// Images received and stored
    pub images_received: AtomicU64,
    /// Pairs handed to the processor
    pub pairs_processed: AtomicU64,
    /// Result images delivered to producers
    pub results_sent: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_opened(&self) {
        self.sessions_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn handshake_completed(&self) {
        self.handshakes_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn image_received(&self) {
        self.images_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pair_processed(&self) {
        self.pairs_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn result_sent(&self) {
        self.results_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_transferred(&self, read: u64, written: u64) {
        self.bytes_read.fetch_add(read, Ordering::Relaxed);
        self.bytes_written.fetch_add(written, Ordering::Relaxed);
    }
}

/// Everything a session needs from the server.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<Config>,
    pub processor: Arc<dyn PairProcessor>,
    pub stats: Arc<SessionStats>,
}

impl SessionContext {
    pub fn new(config: Arc<Config>, processor: Arc<dyn PairProcessor>) -> Self {
        Self {
            config,
            processor,
            stats: Arc::new(SessionStats::new()),
        }
    }
}

/// Protocol state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitHandshake,
    Idle,
    ReceivingImage,
    Processing,
    SendingResults,
    Closed,
}

/// Source images stored so far for one filename.
#[derive(Debug, Default)]
struct PendingPair {
    visible: Option<PathBuf>,
    thermal: Option<PathBuf>,
}

impl PendingPair {
    fn set(&mut self, modality: Modality, path: PathBuf) {
        match modality {
            Modality::Visible => self.visible = Some(path),
            Modality::Thermal => self.thermal = Some(path),
        }
    }

    fn complete(&self) -> Option<(PathBuf, PathBuf)> {
        match (&self.visible, &self.thermal) {
            (Some(v), Some(t)) => Some((v.clone(), t.clone())),
            _ => None,
        }
    }
}

/// Handles a single producer connection.
pub struct SessionHandler<S> {
    transport: FramedTransport<S>,

    /// Producer's address (for logging)
    addr: SocketAddr,

    /// Identity presented in the handshake
    identity: Option<String>,

    state: SessionState,

    /// Images received in this session, by filename
    pending: HashMap<String, PendingPair>,

    ctx: SessionContext,
}

impl<S> SessionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S, addr: SocketAddr, ctx: SessionContext) -> Self {
        ctx.stats.session_opened();

        Self {
            transport: FramedTransport::new(stream, ctx.config.idle_timeout()),
            addr,
            identity: None,
            state: SessionState::AwaitHandshake,
            pending: HashMap::new(),
            ctx,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn last_activity(&self) -> Instant {
        self.transport.last_activity()
    }

    /// Runs the session until the producer leaves or something fails.
    pub async fn run(mut self) -> Result<(), SessionError> {
        info!(peer = %self.addr, "Producer connected");

        let result = self.main_loop().await;
        self.state = SessionState::Closed;

        match &result {
            Ok(()) => info!(peer = %self.addr, "Producer disconnected"),
            Err(e) if e.is_disconnect() => debug!(peer = %self.addr, "Connection closed by producer"),
            Err(e) => warn!(peer = %self.addr, error = %e, "Session failed"),
        }

        self.ctx
            .stats
            .bytes_transferred(self.transport.bytes_read(), self.transport.bytes_written());
        self.ctx.stats.session_closed();
        result
    }

    async fn main_loop(&mut self) -> Result<(), SessionError> {
        self.handshake().await?;

        loop {
            let msg = match self.transport.recv_message().await {
                Ok(msg) => msg,
                Err(TransportError::Closed) => return Ok(()),
                Err(TransportError::Parse(e)) => {
                    self.reply_failed().await;
                    return Err(SessionError::Transport(TransportError::Parse(e)));
                }
                Err(e) => return Err(e.into()),
            };

            match msg {
                ControlMessage::Heartbeat => {
                    self.transport.send_message(&ControlMessage::Alive).await?;
                }
                ControlMessage::Image(image) => self.receive_image(image).await?,
                other => {
                    warn!(peer = %self.addr, command = %other, "Unknown command ignored");
                }
            }
        }
    }

    /// Waits for `CLIENT:<identity>` and accepts or drops the producer.
    async fn handshake(&mut self) -> Result<(), SessionError> {
        match self.transport.recv_message().await? {
            ControlMessage::Client(identity) => {
                if !self.ctx.config.is_client_allowed(&identity) {
                    warn!(peer = %self.addr, identity = %identity, "Producer not allowed");
                    return Err(SessionError::HandshakeRejected(identity));
                }

                self.transport.send_message(&ControlMessage::Accepted).await?;
                info!(peer = %self.addr, identity = %identity, "Handshake accepted");

                self.identity = Some(identity);
                self.state = SessionState::Idle;
                self.ctx.stats.handshake_completed();
                Ok(())
            }
            other => {
                warn!(peer = %self.addr, command = %other, "Handshake failed");
                Err(SessionError::HandshakeFailed(other.encode()))
            }
        }
    }

    /// Receives one announced image and stores it under its modality.
    async fn receive_image(&mut self, image: ImageAnnounce) -> Result<(), SessionError> {
        self.state = SessionState::ReceivingImage;
        self.transport.send_message(&ControlMessage::Ready).await?;

        let data = match self.transport.recv_exact(image.size as usize).await {
            Ok(data) => data,
            Err(source) => {
                error!(
                    peer = %self.addr,
                    file = %image.filename,
                    error = %source,
                    "Incomplete image data"
                );
                self.reply_failed().await;
                return Err(SessionError::TransferFailed {
                    filename: image.filename,
                    source,
                });
            }
        };

        let dir = self
            .ctx
            .config
            .received_folder
            .join(image.modality.as_str());
        let path = dir.join(&image.filename);

        if let Err(e) = store(&dir, &path, &data).await {
            error!(peer = %self.addr, path = %path.display(), error = %e, "Failed to store image");
            self.reply_failed().await;
            return Err(e.into());
        }

        self.transport.send_message(&ControlMessage::Received).await?;
        self.ctx.stats.image_received();
        info!(
            peer = %self.addr,
            modality = %image.modality,
            path = %path.display(),
            bytes = data.len(),
            "Image stored"
        );

        let pair = self.pending.entry(image.filename.clone()).or_default();
        pair.set(image.modality, path);
        let complete = pair.complete();
        self.state = SessionState::Idle;

        if let Some((visible, thermal)) = complete {
            self.pending.remove(&image.filename);
            self.process_pair(&image.filename, visible, thermal).await?;
        }

        Ok(())
    }

    /// Runs the processor on a complete pair and streams its results back.
    async fn process_pair(
        &mut self,
        filename: &str,
        visible: PathBuf,
        thermal: PathBuf,
    ) -> Result<(), SessionError> {
        self.state = SessionState::Processing;
        info!(peer = %self.addr, pair = %filename, "Processing pair");

        let processor = Arc::clone(&self.ctx.processor);
        let outcome = tokio::task::spawn_blocking(move || processor.process(&visible, &thermal))
            .await
            .unwrap_or_else(|e| Err(ProcessingError::Io(std::io::Error::other(e.to_string()))));
        self.ctx.stats.pair_processed();

        self.state = SessionState::SendingResults;
        match outcome {
            Ok(results) if !results.is_empty() => {
                for path in &results {
                    self.send_result(path).await?;
                }
            }
            Ok(_) => {
                error!(peer = %self.addr, pair = %filename, "Processing produced no results");
                self.fail_all_slots().await?;
            }
            Err(e) => {
                error!(peer = %self.addr, pair = %filename, error = %e, "Processing failed");
                self.fail_all_slots().await?;
            }
        }

        self.transport
            .send_message(&ControlMessage::ResultsDone)
            .await?;
        self.state = SessionState::Idle;
        Ok(())
    }

    /// Sends one result image, or `RESULT_FAILED` if it can't be read.
    async fn send_result(&mut self, path: &Path) -> Result<(), SessionError> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let data = match validate_filename(&filename) {
            Ok(_) => tokio::fs::read(path).await,
            Err(e) => Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)),
        };

        let data = match data {
            Ok(data) => data,
            Err(e) => {
                error!(peer = %self.addr, path = %path.display(), error = %e, "Result image missing");
                self.transport
                    .send_message(&ControlMessage::ResultFailed)
                    .await?;
                return Ok(());
            }
        };

        self.transport
            .send_message(&ControlMessage::result_image(&filename, data.len() as u64))
            .await?;
        self.expect(ControlMessage::Ready).await?;

        self.transport.send_exact(&data).await?;
        self.expect(ControlMessage::Received).await?;

        self.ctx.stats.result_sent();
        info!(peer = %self.addr, file = %filename, bytes = data.len(), "Result image sent");
        Ok(())
    }

    async fn fail_all_slots(&mut self) -> Result<(), SessionError> {
        for _ in 0..self.ctx.config.result_slots {
            self.transport
                .send_message(&ControlMessage::ResultFailed)
                .await?;
        }
        Ok(())
    }

    async fn expect(&mut self, expected: ControlMessage) -> Result<(), SessionError> {
        let got = self.transport.recv_message().await?;
        if got == expected {
            Ok(())
        } else {
            Err(SessionError::UnexpectedReply {
                expected: expected.kind(),
                got: got.encode(),
            })
        }
    }

    /// Best-effort `FAILED`; the session ends right after anyway.
    async fn reply_failed(&mut self) {
        if let Err(e) = self.transport.send_message(&ControlMessage::Failed).await {
            debug!(peer = %self.addr, error = %e, "Could not send FAILED");
        }
    }
}

async fn store(dir: &Path, path: &Path, data: &[u8]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(path, data).await
}

/// Errors that end a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// First message was not `CLIENT:<identity>`
    #[error("handshake failed, got {0:?}")]
    HandshakeFailed(String),

    /// Identity not in the allow list
    #[error("client {0:?} not allowed")]
    HandshakeRejected(String),

    /// Payload shorter than announced, or the peer stalled
    #[error("transfer of {filename} failed: {source}")]
    TransferFailed {
        filename: String,
        #[source]
        source: TransportError,
    },

    #[error("expected {expected}, got {got:?}")]
    UnexpectedReply { expected: &'static str, got: String },
}

impl SessionError {
    pub fn is_disconnect(&self) -> bool {
        match self {
            SessionError::Transport(e) => e.is_disconnect(),
            _ => false,
        }
    }
}

/// Handles a producer connection.
///
/// This is a convenience function that creates a SessionHandler
/// and runs it to completion. The socket is closed when it returns.
pub async fn handle_session(stream: TcpStream, addr: SocketAddr, ctx: SessionContext) {
    let handler = SessionHandler::new(stream, addr, ctx);
    if let Err(e) = handler.run().await {
        debug!(peer = %addr, error = %e, "Session ended with error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ParseError;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct TestServer {
        addr: SocketAddr,
        stats: Arc<SessionStats>,
        received: tempfile::TempDir,
    }

    async fn create_test_server(processor: Arc<dyn PairProcessor>) -> TestServer {
        create_test_server_with_timeout(processor, 5).await
    }

    async fn create_test_server_with_timeout(
        processor: Arc<dyn PairProcessor>,
        idle_timeout_secs: u64,
    ) -> TestServer {
        let received = tempfile::tempdir().unwrap();
        let config = Config {
            received_folder: received.path().to_path_buf(),
            idle_timeout_secs,
            ..Config::default()
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ctx = SessionContext::new(Arc::new(config), processor);
        let stats = Arc::clone(&ctx.stats);

        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                tokio::spawn(handle_session(stream, peer, ctx.clone()));
            }
        });

        TestServer {
            addr,
            stats,
            received,
        }
    }

    async fn connect(addr: SocketAddr) -> FramedTransport<TcpStream> {
        let stream = TcpStream::connect(addr).await.unwrap();
        FramedTransport::new(stream, TIMEOUT)
    }

    async fn handshake(client: &mut FramedTransport<TcpStream>) {
        client.write_line("CLIENT:10.0.0.9").await.unwrap();
        assert_eq!(client.read_line().await.unwrap(), "ACCEPTED");
    }

    async fn send_image(client: &mut FramedTransport<TcpStream>, modality: &str, name: &str, data: &[u8]) {
        client
            .write_line(&format!("IMAGE:{}:{}:{}", modality, name, data.len()))
            .await
            .unwrap();
        assert_eq!(client.read_line().await.unwrap(), "READY");
        client.send_exact(data).await.unwrap();
        assert_eq!(client.read_line().await.unwrap(), "RECEIVED");
    }

    fn never_called(flag: Arc<AtomicBool>) -> Arc<dyn PairProcessor> {
        Arc::new(move |_: &Path, _: &Path| -> Result<Vec<PathBuf>, ProcessingError> {
            flag.store(true, Ordering::SeqCst);
            Ok(Vec::new())
        })
    }

    #[tokio::test]
    async fn test_handshake_and_heartbeat() {
        let server = create_test_server(Arc::new(crate::processing::NoopProcessor)).await;
        let mut client = connect(server.addr).await;

        handshake(&mut client).await;
        for _ in 0..3 {
            client.write_line("HEARTBEAT").await.unwrap();
            assert_eq!(client.read_line().await.unwrap(), "ALIVE");
        }
    }

    #[tokio::test]
    async fn test_bad_handshake_drops_connection() {
        let server = create_test_server(Arc::new(crate::processing::NoopProcessor)).await;
        let mut client = connect(server.addr).await;

        client.write_line("HELLO").await.unwrap();
        assert!(matches!(
            client.read_line().await,
            Err(TransportError::Closed) | Err(TransportError::Io(_))
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.stats.handshakes_completed.load(Ordering::Relaxed), 0);
        assert_eq!(server.stats.active_sessions.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_close_before_handshake() {
        let flag = Arc::new(AtomicBool::new(false));
        let server = create_test_server(never_called(Arc::clone(&flag))).await;

        let client = connect(server.addr).await;
        drop(client);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.stats.sessions_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(server.stats.handshakes_completed.load(Ordering::Relaxed), 0);
        assert_eq!(server.stats.images_received.load(Ordering::Relaxed), 0);
        assert_eq!(server.stats.active_sessions.load(Ordering::Relaxed), 0);
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unknown_command_is_ignored() {
        let server = create_test_server(Arc::new(crate::processing::NoopProcessor)).await;
        let mut client = connect(server.addr).await;

        handshake(&mut client).await;
        client.write_line("STATUS").await.unwrap();
        client.write_line("HEARTBEAT").await.unwrap();
        assert_eq!(client.read_line().await.unwrap(), "ALIVE");
    }

    #[tokio::test]
    async fn test_heartbeat_between_images_keeps_pair_state() {
        let processor: Arc<dyn PairProcessor> =
            Arc::new(|_: &Path, _: &Path| -> Result<Vec<PathBuf>, ProcessingError> { Ok(Vec::new()) });
        let server = create_test_server(processor).await;
        let mut client = connect(server.addr).await;

        handshake(&mut client).await;
        send_image(&mut client, "visible", "p1.jpg", b"visible-bytes").await;

        client.write_line("HEARTBEAT").await.unwrap();
        assert_eq!(client.read_line().await.unwrap(), "ALIVE");

        send_image(&mut client, "thermal", "p1.jpg", b"thermal-bytes").await;

        // Empty output is a processing failure: one RESULT_FAILED per slot
        assert_eq!(client.read_line().await.unwrap(), "RESULT_FAILED");
        assert_eq!(client.read_line().await.unwrap(), "RESULT_FAILED");
        assert_eq!(client.read_line().await.unwrap(), "RESULTS_DONE");
        assert_eq!(server.stats.pairs_processed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_images_stored_by_modality() {
        let server = create_test_server(Arc::new(crate::processing::NoopProcessor)).await;
        let mut client = connect(server.addr).await;

        handshake(&mut client).await;
        send_image(&mut client, "thermal", "p9.jpg", b"\x00\x01\x02").await;

        let stored = std::fs::read(server.received.path().join("thermal").join("p9.jpg")).unwrap();
        assert_eq!(stored, b"\x00\x01\x02");
        assert_eq!(server.stats.pairs_processed.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_result_streamed_back() {
        let outputs = tempfile::tempdir().unwrap();
        let result_path = outputs.path().join("p1_ir.jpg");
        std::fs::write(&result_path, vec![7u8; 2048]).unwrap();

        let processor: Arc<dyn PairProcessor> = {
            let result_path = result_path.clone();
            Arc::new(move |_: &Path, _: &Path| -> Result<Vec<PathBuf>, ProcessingError> {
                Ok(vec![result_path.clone()])
            })
        };
        let server = create_test_server(processor).await;
        let mut client = connect(server.addr).await;

        handshake(&mut client).await;
        send_image(&mut client, "visible", "p1.jpg", b"vis").await;
        send_image(&mut client, "thermal", "p1.jpg", b"ir").await;

        assert_eq!(
            client.read_line().await.unwrap(),
            "RESULT_IMAGE:p1_ir.jpg:2048"
        );
        client.write_line("READY").await.unwrap();
        let data = client.recv_exact(2048).await.unwrap();
        assert!(data.iter().all(|b| *b == 7));
        client.write_line("RECEIVED").await.unwrap();

        assert_eq!(client.read_line().await.unwrap(), "RESULTS_DONE");
        assert_eq!(server.stats.results_sent.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_missing_result_reports_failed_slot() {
        let processor: Arc<dyn PairProcessor> =
            Arc::new(|_: &Path, _: &Path| -> Result<Vec<PathBuf>, ProcessingError> {
                Ok(vec![PathBuf::from("/nonexistent/pairlink/p1_ir.jpg")])
            });
        let server = create_test_server(processor).await;
        let mut client = connect(server.addr).await;

        handshake(&mut client).await;
        send_image(&mut client, "visible", "p1.jpg", b"v").await;
        send_image(&mut client, "thermal", "p1.jpg", b"t").await;

        assert_eq!(client.read_line().await.unwrap(), "RESULT_FAILED");
        assert_eq!(client.read_line().await.unwrap(), "RESULTS_DONE");
    }

    #[tokio::test]
    async fn test_processor_error_fails_every_slot() {
        let processor: Arc<dyn PairProcessor> =
            Arc::new(|_: &Path, _: &Path| -> Result<Vec<PathBuf>, ProcessingError> {
                Err(ProcessingError::NoOutputs("p3".to_string()))
            });
        let server = create_test_server(processor).await;
        let mut client = connect(server.addr).await;

        handshake(&mut client).await;
        send_image(&mut client, "visible", "p3.jpg", b"v").await;
        send_image(&mut client, "thermal", "p3.jpg", b"t").await;

        assert_eq!(client.read_line().await.unwrap(), "RESULT_FAILED");
        assert_eq!(client.read_line().await.unwrap(), "RESULT_FAILED");
        assert_eq!(client.read_line().await.unwrap(), "RESULTS_DONE");
    }

    #[tokio::test]
    async fn test_short_payload_fails_without_processing() {
        let flag = Arc::new(AtomicBool::new(false));
        let server = create_test_server(never_called(Arc::clone(&flag))).await;
        let mut client = connect(server.addr).await;

        handshake(&mut client).await;
        send_image(&mut client, "visible", "p4.jpg", b"full").await;

        client.write_line("IMAGE:thermal:p4.jpg:10").await.unwrap();
        assert_eq!(client.read_line().await.unwrap(), "READY");
        client.send_exact(b"shrt").await.unwrap();
        client.get_mut().shutdown().await.unwrap();

        assert_eq!(client.read_line().await.unwrap(), "FAILED");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!flag.load(Ordering::SeqCst));
        assert_eq!(server.stats.images_received.load(Ordering::Relaxed), 1);
        assert!(!server.received.path().join("thermal").join("p4.jpg").exists());
    }

    #[tokio::test]
    async fn test_silent_producer_dropped_after_idle_timeout() {
        let server = create_test_server_with_timeout(Arc::new(crate::processing::NoopProcessor), 1).await;
        let mut client = connect(server.addr).await;

        let started = std::time::Instant::now();
        assert!(matches!(
            client.read_line().await,
            Err(TransportError::Closed) | Err(TransportError::Io(_))
        ));
        assert!(started.elapsed() >= Duration::from_millis(900));
        assert_eq!(server.stats.handshakes_completed.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_stalled_payload_fails_after_idle_timeout() {
        let flag = Arc::new(AtomicBool::new(false));
        let server = create_test_server_with_timeout(never_called(Arc::clone(&flag)), 1).await;
        let mut client = connect(server.addr).await;

        handshake(&mut client).await;
        client.write_line("IMAGE:visible:s.jpg:100").await.unwrap();
        assert_eq!(client.read_line().await.unwrap(), "READY");
        client.send_exact(&[0u8; 10]).await.unwrap();

        // Socket stays open, the consumer gives up on its own
        assert_eq!(client.read_line().await.unwrap(), "FAILED");
        assert!(matches!(
            client.read_line().await,
            Err(TransportError::Closed) | Err(TransportError::Io(_))
        ));

        assert!(!flag.load(Ordering::SeqCst));
        assert_eq!(server.stats.images_received.load(Ordering::Relaxed), 0);
        assert!(!server.received.path().join("visible").join("s.jpg").exists());
    }

    #[tokio::test]
    async fn test_malformed_image_header_fails_session() {
        let server = create_test_server(Arc::new(crate::processing::NoopProcessor)).await;
        let mut client = connect(server.addr).await;

        handshake(&mut client).await;
        client.write_line("IMAGE:visible:../../evil:3").await.unwrap();
        assert_eq!(client.read_line().await.unwrap(), "FAILED");
        assert!(matches!(
            client.read_line().await,
            Err(TransportError::Closed) | Err(TransportError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_rejected_identity() {
        let config = Config {
            allowed_clients: vec!["10.0.0.1".to_string()],
            ..Config::default()
        };
        let ctx = SessionContext::new(Arc::new(config), Arc::new(crate::processing::NoopProcessor));
        let stats = Arc::clone(&ctx.stats);

        let (client, server) = tokio::io::duplex(1024);
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let session = tokio::spawn(SessionHandler::new(server, addr, ctx).run());

        let mut client = FramedTransport::new(client, TIMEOUT);
        client.write_line("CLIENT:10.0.0.2").await.unwrap();

        let result = session.await.unwrap();
        assert!(matches!(result, Err(SessionError::HandshakeRejected(ref id)) if id == "10.0.0.2"));
        assert_eq!(stats.handshakes_completed.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_session_state_after_handshake() {
        let ctx = SessionContext::new(
            Arc::new(Config::default()),
            Arc::new(crate::processing::NoopProcessor),
        );
        let (client, server) = tokio::io::duplex(1024);
        let addr: SocketAddr = "127.0.0.1:5001".parse().unwrap();

        let mut handler = SessionHandler::new(server, addr, ctx);
        assert_eq!(handler.state(), SessionState::AwaitHandshake);

        let mut client = FramedTransport::new(client, TIMEOUT);
        client.write_line("CLIENT:edge-01").await.unwrap();
        handler.handshake().await.unwrap();

        assert_eq!(handler.state(), SessionState::Idle);
        assert_eq!(handler.identity(), Some("edge-01"));
        assert_eq!(client.read_line().await.unwrap(), "ACCEPTED");
    }

    #[test]
    fn test_parse_errors_are_not_disconnects() {
        let err = SessionError::Transport(TransportError::Parse(ParseError::InvalidSize(
            "x".to_string(),
        )));
        assert!(!err.is_disconnect());
        assert!(SessionError::Transport(TransportError::Closed).is_disconnect());
    }
}
