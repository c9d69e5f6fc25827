//! TCP listener and WebSocket upgrade
//!
//! Accepts sockets, performs the WebSocket handshake with the inbound size
//! limit applied, and hands every upgraded stream to the registry. Runs
//! until the shutdown token is cancelled, then tears down all connections.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::session_registry::SessionRegistry;

pub struct Server {
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
}

impl Server {
    /// Bind the listening socket. Port 0 picks a free port; see
    /// [`Server::local_addr`].
    pub async fn bind(addr: SocketAddr, registry: Arc<SessionRegistry>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, registry })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Accept connections until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let ws_config = websocket_config(self.registry.config().read_limit);
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "listening");
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        tokio::spawn(upgrade(stream, peer, Arc::clone(&self.registry), ws_config));
                    }
                    Err(e) => warn!("accept error: {}", e),
                },
            }
        }

        info!("shutting down");
        self.registry.close_all();
    }
}

/// Frames and messages larger than `read_limit` fail the read and end the
/// connection.
fn websocket_config(read_limit: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(read_limit);
    config.max_frame_size = Some(read_limit);
    config
}

async fn upgrade(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<SessionRegistry>,
    ws_config: WebSocketConfig,
) {
    let ws = match tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, "websocket handshake failed: {}", e);
            return;
        }
    };

    registry.serve(ws, Some(peer)).await;
}

#[cfg(test)]
mod server_tests {
    use super::*;

    #[test]
    fn test_websocket_config_applies_read_limit() {
        let config = websocket_config(512);
        assert_eq!(config.max_message_size, Some(512));
        assert_eq!(config.max_frame_size, Some(512));
    }
}
