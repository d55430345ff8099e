//! Connection Worker
//!
//! Sends one pair over one connection and collects its results. The walk
//! is strictly linear and the first failure fails the whole pair:
//!
//! ```text
//! check sources ─> connect ─> CLIENT:<id>/ACCEPTED
//!   ─> for visible, thermal:
//!        HEARTBEAT/ALIVE ─> IMAGE:.../READY ─> <bytes> ─> RECEIVED
//!   ─> until RESULTS_DONE:
//!        RESULT_IMAGE:... ─> READY ─> <bytes> ─> RECEIVED
//!        RESULT_FAILED    ─> pair failed
//! ```
//!
//! Both source files are checked before the socket is opened, so a pair
//! with a missing image costs no network traffic at all.

use crate::config::Config;
use crate::protocol::{validate_filename, ControlMessage, Modality, ResultAnnounce};
use crate::transport::{FramedTransport, TransportError};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// What a successful pair produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairReport {
    pub pair: String,
    /// Result images saved in the results folder
    pub results: Vec<PathBuf>,
    /// Source bytes streamed to the consumer
    pub bytes_sent: u64,
}

/// Sends one pair to the consumer.
pub struct ConnectionWorker {
    config: Arc<Config>,
    pair: String,
}

impl ConnectionWorker {
    pub fn new(config: Arc<Config>, pair: impl Into<String>) -> Self {
        Self {
            config,
            pair: pair.into(),
        }
    }

    pub fn pair(&self) -> &str {
        &self.pair
    }

    /// Local path of the source image for `modality`.
    pub fn source_path(&self, modality: Modality) -> PathBuf {
        let folder = match modality {
            Modality::Visible => &self.config.visible_folder,
            Modality::Thermal => &self.config.thermal_folder,
        };
        folder.join(format!("{}.jpg", self.pair))
    }

    /// Checks that both source images exist, in transfer order.
    pub fn validate_sources(&self) -> Result<Vec<(Modality, PathBuf)>, WorkerError> {
        validate_filename(&self.pair).map_err(|_| WorkerError::InvalidPair(self.pair.clone()))?;

        let mut sources = Vec::with_capacity(Modality::ALL.len());
        for modality in Modality::ALL {
            let path = self.source_path(modality);
            if !path.is_file() {
                return Err(WorkerError::MissingSource { modality, path });
            }
            sources.push((modality, path));
        }
        Ok(sources)
    }

    /// Runs the full exchange for this pair.
    pub async fn run(self) -> Result<PairReport, WorkerError> {
        let sources = self.validate_sources()?;

        let stream = self.connect().await?;
        let mut transport = FramedTransport::new(stream, self.config.client_timeout());
        info!(pair = %self.pair, server = %self.config.server_address(), "Connected to consumer");

        self.exchange(&mut transport, &sources).await
    }

    /// Runs the protocol over an already open transport.
    pub async fn exchange<S>(
        &self,
        transport: &mut FramedTransport<S>,
        sources: &[(Modality, PathBuf)],
    ) -> Result<PairReport, WorkerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.handshake(transport).await?;

        let mut bytes_sent = 0;
        for (modality, path) in sources {
            bytes_sent += self.send_image(transport, *modality, path).await?;
        }

        let results = self.receive_results(transport).await?;
        Ok(PairReport {
            pair: self.pair.clone(),
            results,
            bytes_sent,
        })
    }

    async fn connect(&self) -> Result<TcpStream, WorkerError> {
        let addr = self.config.server_address();

        let stream = timeout(self.config.connect_timeout(), self.open_stream(&addr))
            .await
            .map_err(|_| WorkerError::ConnectTimeout(addr.clone()))?
            .map_err(|source| WorkerError::Connect {
                addr: addr.clone(),
                source,
            })?;

        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Connects to `addr`, from `client_ip` when one is configured.
    async fn open_stream(&self, addr: &str) -> std::io::Result<TcpStream> {
        let target = tokio::net::lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved"))?;

        let Some(ip) = &self.config.client_ip else {
            return TcpStream::connect(target).await;
        };

        let local: IpAddr = ip.parse().map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid client_ip {:?}", ip),
            )
        })?;

        let socket = if target.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.bind(SocketAddr::new(local, 0))?;
        socket.connect(target).await
    }

    async fn handshake<S>(&self, transport: &mut FramedTransport<S>) -> Result<(), WorkerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        transport
            .send_message(&ControlMessage::client(self.config.client_identity()))
            .await?;

        match transport.recv_message().await {
            Ok(ControlMessage::Accepted) => Ok(()),
            Ok(other) => Err(WorkerError::Rejected(other.encode())),
            Err(e) if e.is_disconnect() => Err(WorkerError::Rejected("connection closed".to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Sends one source image. Returns the payload size.
    async fn send_image<S>(
        &self,
        transport: &mut FramedTransport<S>,
        modality: Modality,
        path: &Path,
    ) -> Result<u64, WorkerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        transport.send_message(&ControlMessage::Heartbeat).await?;
        expect(transport, ControlMessage::Alive).await?;

        if !path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg"))
        {
            warn!(pair = %self.pair, path = %path.display(), "Source image is not a JPG");
        }

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let size = tokio::fs::metadata(path).await?.len();

        transport
            .send_message(&ControlMessage::image(modality, &filename, size))
            .await?;
        expect(transport, ControlMessage::Ready).await?;

        let sent = transport.send_file(path, size, self.config.chunk_size).await?;
        if sent != size {
            return Err(WorkerError::SourceChanged {
                path: path.to_path_buf(),
                expected: size,
                sent,
            });
        }

        expect(transport, ControlMessage::Received).await?;
        info!(pair = %self.pair, modality = %modality, bytes = size, "Image sent");
        Ok(size)
    }

    /// Collects result images until the consumer says it is done.
    async fn receive_results<S>(
        &self,
        transport: &mut FramedTransport<S>,
    ) -> Result<Vec<PathBuf>, WorkerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut results = Vec::new();

        loop {
            match transport.recv_message().await? {
                ControlMessage::ResultImage(announce) => {
                    let path = self.receive_result(transport, announce).await?;
                    results.push(path);
                }
                ControlMessage::ResultFailed => {
                    warn!(pair = %self.pair, "Consumer reported a failed result");
                    return Err(WorkerError::ResultFailed);
                }
                ControlMessage::ResultsDone => {
                    debug!(pair = %self.pair, count = results.len(), "All results received");
                    return Ok(results);
                }
                other => {
                    return Err(WorkerError::UnexpectedReply {
                        expected: "RESULT_IMAGE",
                        got: other.encode(),
                    })
                }
            }
        }
    }

    async fn receive_result<S>(
        &self,
        transport: &mut FramedTransport<S>,
        announce: ResultAnnounce,
    ) -> Result<PathBuf, WorkerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        transport.send_message(&ControlMessage::Ready).await?;

        let data = transport
            .recv_exact(announce.size as usize)
            .await
            .map_err(|source| WorkerError::TransferFailed {
                filename: announce.filename.clone(),
                source,
            })?;

        tokio::fs::create_dir_all(&self.config.results_folder).await?;
        let path = self.config.results_folder.join(&announce.filename);
        tokio::fs::write(&path, &data).await?;

        transport.send_message(&ControlMessage::Received).await?;
        info!(pair = %self.pair, path = %path.display(), bytes = data.len(), "Result saved");
        Ok(path)
    }
}

async fn expect<S>(transport: &mut FramedTransport<S>, expected: ControlMessage) -> Result<(), WorkerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let got = transport.recv_message().await?;
    if got == expected {
        Ok(())
    } else {
        Err(WorkerError::UnexpectedReply {
            expected: expected.kind(),
            got: got.encode(),
        })
    }
}

/// Errors that fail a pair.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// A source image is missing locally
    #[error("{modality} image not found: {}", .path.display())]
    MissingSource { modality: Modality, path: PathBuf },

    /// Pair identifier can't be used as a file name
    #[error("invalid pair name: {0:?}")]
    InvalidPair(String),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),

    /// Consumer did not accept the handshake
    #[error("consumer rejected the connection: {0}")]
    Rejected(String),

    #[error("expected {expected}, got {got:?}")]
    UnexpectedReply { expected: &'static str, got: String },

    /// Source file shrank while it was being sent
    #[error("{} changed while sending: announced {expected} bytes, sent {sent}", .path.display())]
    SourceChanged {
        path: PathBuf,
        expected: u64,
        sent: u64,
    },

    #[error("transfer of {filename} failed: {source}")]
    TransferFailed {
        filename: String,
        #[source]
        source: TransportError,
    },

    /// Consumer could not produce a result
    #[error("consumer reported a failed result")]
    ResultFailed,

    /// Worker task died before finishing
    #[error("worker aborted: {0}")]
    Aborted(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::io::Builder;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Fixture {
        _dir: tempfile::TempDir,
        config: Arc<Config>,
    }

    fn fixture(pairs: &[(&str, &[u8], &[u8])]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            visible_folder: dir.path().join("visible"),
            thermal_folder: dir.path().join("thermal"),
            results_folder: dir.path().join("results"),
            identity: Some("edge".to_string()),
            ..Config::default()
        };
        std::fs::create_dir_all(&config.visible_folder).unwrap();
        std::fs::create_dir_all(&config.thermal_folder).unwrap();

        for (name, visible, thermal) in pairs {
            std::fs::write(config.visible_folder.join(format!("{}.jpg", name)), visible).unwrap();
            std::fs::write(config.thermal_folder.join(format!("{}.jpg", name)), thermal).unwrap();
        }

        Fixture {
            _dir: dir,
            config: Arc::new(config),
        }
    }

    fn source_exchange(builder: &mut Builder) -> &mut Builder {
        builder
            .write(b"CLIENT:edge\n")
            .read(b"ACCEPTED\n")
            .write(b"HEARTBEAT\n")
            .read(b"ALIVE\n")
            .write(b"IMAGE:visible:p1.jpg:3\n")
            .read(b"READY\n")
            .write(b"vis")
            .read(b"RECEIVED\n")
            .write(b"HEARTBEAT\n")
            .read(b"ALIVE\n")
            .write(b"IMAGE:thermal:p1.jpg:2\n")
            .read(b"READY\n")
            .write(b"ir")
            .read(b"RECEIVED\n")
    }

    #[tokio::test]
    async fn test_full_exchange_saves_results() {
        let fx = fixture(&[("p1", b"vis", b"ir")]);
        let worker = ConnectionWorker::new(Arc::clone(&fx.config), "p1");
        let sources = worker.validate_sources().unwrap();

        let mock = source_exchange(&mut Builder::new())
            .read(b"RESULT_IMAGE:p1_ir.jpg:4\n")
            .write(b"READY\n")
            .read(b"abcd")
            .write(b"RECEIVED\n")
            .read(b"RESULTS_DONE\n")
            .build();
        let mut transport = FramedTransport::new(mock, TIMEOUT);

        let report = worker.exchange(&mut transport, &sources).await.unwrap();
        let saved = fx.config.results_folder.join("p1_ir.jpg");
        assert_eq!(report.results, vec![saved.clone()]);
        assert_eq!(report.bytes_sent, 5);
        assert_eq!(std::fs::read(saved).unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_result_failed_fails_pair() {
        let fx = fixture(&[("p1", b"vis", b"ir")]);
        let worker = ConnectionWorker::new(Arc::clone(&fx.config), "p1");
        let sources = worker.validate_sources().unwrap();

        let mock = source_exchange(&mut Builder::new())
            .read(b"RESULT_FAILED\n")
            .build();
        let mut transport = FramedTransport::new(mock, TIMEOUT);

        let err = worker.exchange(&mut transport, &sources).await.unwrap_err();
        assert!(matches!(err, WorkerError::ResultFailed));
    }

    #[tokio::test]
    async fn test_handshake_rejected() {
        let fx = fixture(&[("p1", b"vis", b"ir")]);
        let worker = ConnectionWorker::new(Arc::clone(&fx.config), "p1");
        let sources = worker.validate_sources().unwrap();

        let mock = Builder::new()
            .write(b"CLIENT:edge\n")
            .read(b"DENIED\n")
            .build();
        let mut transport = FramedTransport::new(mock, TIMEOUT);

        let err = worker.exchange(&mut transport, &sources).await.unwrap_err();
        assert!(matches!(err, WorkerError::Rejected(ref got) if got == "DENIED"));
    }

    #[tokio::test]
    async fn test_missing_heartbeat_reply() {
        let fx = fixture(&[("p1", b"vis", b"ir")]);
        let worker = ConnectionWorker::new(Arc::clone(&fx.config), "p1");
        let sources = worker.validate_sources().unwrap();

        let mock = Builder::new()
            .write(b"CLIENT:edge\n")
            .read(b"ACCEPTED\n")
            .write(b"HEARTBEAT\n")
            .read(b"BUSY\n")
            .build();
        let mut transport = FramedTransport::new(mock, TIMEOUT);

        let err = worker.exchange(&mut transport, &sources).await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::UnexpectedReply { expected: "ALIVE", .. }
        ));
    }

    #[tokio::test]
    async fn test_image_failed_reply() {
        let fx = fixture(&[("p1", b"vis", b"ir")]);
        let worker = ConnectionWorker::new(Arc::clone(&fx.config), "p1");
        let sources = worker.validate_sources().unwrap();

        let mock = Builder::new()
            .write(b"CLIENT:edge\n")
            .read(b"ACCEPTED\n")
            .write(b"HEARTBEAT\n")
            .read(b"ALIVE\n")
            .write(b"IMAGE:visible:p1.jpg:3\n")
            .read(b"READY\n")
            .write(b"vis")
            .read(b"FAILED\n")
            .build();
        let mut transport = FramedTransport::new(mock, TIMEOUT);

        let err = worker.exchange(&mut transport, &sources).await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::UnexpectedReply { expected: "RECEIVED", .. }
        ));
    }

    #[tokio::test]
    async fn test_truncated_result() {
        let fx = fixture(&[("p1", b"vis", b"ir")]);
        let worker = ConnectionWorker::new(Arc::clone(&fx.config), "p1");
        let sources = worker.validate_sources().unwrap();

        let mock = source_exchange(&mut Builder::new())
            .read(b"RESULT_IMAGE:p1_ir.jpg:10\n")
            .write(b"READY\n")
            .read(b"abc")
            .build();
        let mut transport = FramedTransport::new(mock, TIMEOUT);

        let err = worker.exchange(&mut transport, &sources).await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::TransferFailed {
                source: TransportError::PrematureClose { .. },
                ..
            }
        ));
        assert!(!fx.config.results_folder.join("p1_ir.jpg").exists());
    }

    #[test]
    fn test_validate_sources_missing_thermal() {
        let fx = fixture(&[]);
        std::fs::write(fx.config.visible_folder.join("p2.jpg"), b"v").unwrap();

        let worker = ConnectionWorker::new(Arc::clone(&fx.config), "p2");
        let err = worker.validate_sources().unwrap_err();
        assert!(matches!(
            err,
            WorkerError::MissingSource {
                modality: Modality::Thermal,
                ..
            }
        ));
    }

    #[test]
    fn test_validate_sources_order() {
        let fx = fixture(&[("p1", b"v", b"t")]);
        let worker = ConnectionWorker::new(Arc::clone(&fx.config), "p1");

        let sources = worker.validate_sources().unwrap();
        assert_eq!(sources[0].0, Modality::Visible);
        assert_eq!(sources[1].0, Modality::Thermal);
    }

    #[test]
    fn test_invalid_pair_name() {
        let fx = fixture(&[]);
        let worker = ConnectionWorker::new(Arc::clone(&fx.config), "../p1");
        assert!(matches!(
            worker.validate_sources(),
            Err(WorkerError::InvalidPair(_))
        ));
    }

    #[test]
    fn test_pair_name_with_newline_is_invalid() {
        let fx = fixture(&[]);
        // The files exist, so only the name can fail
        std::fs::write(fx.config.visible_folder.join("a\nb.jpg"), b"v").unwrap();
        std::fs::write(fx.config.thermal_folder.join("a\nb.jpg"), b"t").unwrap();

        let worker = ConnectionWorker::new(Arc::clone(&fx.config), "a\nb");
        assert!(matches!(
            worker.validate_sources(),
            Err(WorkerError::InvalidPair(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_source_never_connects() {
        let fx = fixture(&[]);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let config = Config {
            server_port: port,
            ..(*fx.config).clone()
        };
        let worker = ConnectionWorker::new(Arc::new(config), "p2");

        let err = worker.run().await.unwrap_err();
        assert!(matches!(err, WorkerError::MissingSource { .. }));

        let accepted = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(accepted.is_err(), "no connection should have been made");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let fx = fixture(&[("p1", b"v", b"t")]);
        // Bind then drop to get a port with nothing listening
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let config = Config {
            server_port: port,
            ..(*fx.config).clone()
        };
        let err = ConnectionWorker::new(Arc::new(config), "p1")
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Connect { .. }));
    }
}
