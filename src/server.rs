//! Consumer Accept Loop
//!
//! Accepts producer connections and spawns one detached session task per
//! connection. There is no limit on concurrent sessions; a failing or
//! panicking session only takes down its own task.

use crate::config::Config;
use crate::processing::PairProcessor;
use crate::session::{handle_session, SessionContext, SessionStats};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// A bound consumer, ready to accept producers.
pub struct Server {
    listener: TcpListener,
    ctx: SessionContext,
}

impl Server {
    /// Binds to the configured address and prepares the received folder.
    pub async fn bind(config: Arc<Config>, processor: Arc<dyn PairProcessor>) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(&config.received_folder).await?;
        let listener = TcpListener::bind(config.server_address()).await?;
        Ok(Self::from_listener(listener, config, processor))
    }

    pub fn from_listener(
        listener: TcpListener,
        config: Arc<Config>,
        processor: Arc<dyn PairProcessor>,
    ) -> Self {
        Self {
            listener,
            ctx: SessionContext::new(config, processor),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        Arc::clone(&self.ctx.stats)
    }

    /// Main loop that accepts incoming connections. Never returns.
    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, "Accepting producers");
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        error!(peer = %addr, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let ctx = self.ctx.clone();
                    tokio::spawn(async move {
                        handle_session(stream, addr, ctx).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}
