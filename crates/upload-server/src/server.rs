//! TCP listener that upgrades each client to a WebSocket connection.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;

use slicedrop_protocol::constants::WS_MAX_MESSAGE_SIZE;

use crate::ServerError;
use crate::connection::ClientConnection;
use crate::handler::Handler;

/// Time a client gets to complete the WebSocket upgrade.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind.
    pub host: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }
}

/// Serves any number of upload clients against one shared [`Handler`].
pub struct UploadServer<H: Handler> {
    config: ServerConfig,
    handler: Arc<H>,
    cancel: CancellationToken,
    bound: OnceLock<SocketAddr>,
    connections: AtomicUsize,
}

/// Counts a connection for as long as it is alive.
struct Live<'a>(&'a AtomicUsize);

impl<'a> Live<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for Live<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<H: Handler> UploadServer<H> {
    pub fn new(config: ServerConfig, handler: H) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler: Arc::new(handler),
            cancel: CancellationToken::new(),
            bound: OnceLock::new(),
            connections: AtomicUsize::new(0),
        })
    }

    /// Address the listener is bound to, once [`run`](Self::run) has bound it.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound.get().copied()
    }

    /// Listening port, or 0 before the socket is bound.
    pub fn port(&self) -> u16 {
        self.local_addr().map_or(0, |a| a.port())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Stops accepting and closes every open connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Accepts clients until [`shutdown`](Self::shutdown).
    ///
    /// Returns once the listener is closed and every connection task has
    /// finished.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(SocketAddr::new(self.config.host, self.config.port)).await?;
        let local_addr = listener.local_addr()?;
        let _ = self.bound.set(local_addr);
        tracing::info!(%local_addr, "upload server listening");

        let mut clients = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                Some(_) = clients.join_next(), if !clients.is_empty() => {}

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(self);
                        clients.spawn(async move {
                            if let Err(e) = server.serve(stream, peer).await {
                                tracing::warn!(%peer, "connection failed: {e}");
                            }
                        });
                    }
                    Err(e) => tracing::error!("accept failed: {e}"),
                },
            }
        }

        drop(listener);
        tracing::info!(open = clients.len(), "server shutting down");
        while clients.join_next().await.is_some() {}
        Ok(())
    }

    async fn serve(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<(), ServerError> {
        let upgrade = accept_async_with_config(stream, Some(ws_config()));
        let ws_stream = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            upgraded = tokio::time::timeout(HANDSHAKE_TIMEOUT, upgrade) => {
                upgraded.map_err(|_| ServerError::HandshakeTimeout)??
            }
        };

        let _live = Live::enter(&self.connections);
        tracing::info!(%peer, "client connected");
        ClientConnection::spawn(ws_stream, peer.to_string(), Arc::clone(&self.handler), &self.cancel)
            .closed()
            .await;
        Ok(())
    }
}

fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
    config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
    config
}
