//! TCP server for game clients.
//!
//! The server:
//! - Listens on a TCP port for client connections
//! - Spawns a `ConnectionHandler` for each client
//! - Fans merged game state out to every registered connection
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  GameServer<T>  │
//! │                 │
//! │   TcpListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│   GameHandle    │
//! │   (per client)  │     │                 │
//! └───────┬─────────┘     └────────┬────────┘
//!         │ register               │ GameEvent
//!         ▼                        ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionRegistry◀────│event broadcaster│
//! └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Accept errors are logged and the server keeps accepting

mod connection;
mod registry;
mod transport;

pub use connection::{
    send_locked, send_outbound, ConnectionError, ConnectionHandler, FrameWriter, OutboundSink,
    SessionState, SharedWriter, HANDSHAKE_TIMEOUT, WRITE_TIMEOUT,
};
pub use registry::{shared, ConnectionRegistry};
pub use transport::{
    Accepted, JsonLinesCodec, JsonLinesTransport, Transport, TransportKind, WebSocketTransport,
    MAX_LINE_LENGTH,
};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ttt_core::ConnectionId;
use ttt_protocol::frame::Outbound;
use ttt_protocol::message::ServerMessage;

use crate::game::{GameEvent, GameHandle};

/// Identity reported by this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Unique per process; tags published snapshots and the health report.
    pub instance_id: String,
}

impl ServerInfo {
    pub fn new(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
        }
    }
}

/// Game server over transport `T`.
pub struct GameServer<T: Transport> {
    listener: TcpListener,
    transport: Arc<T>,
    game: GameHandle,
    registry: ConnectionRegistry<FrameWriter<T>>,
    info: Arc<ServerInfo>,
    cancel_token: CancellationToken,
    connection_counter: AtomicU64,
}

impl<T: Transport> GameServer<T> {
    /// Binds the listener.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Bind` if the address is invalid or in use.
    pub async fn bind(
        addr: &str,
        transport: T,
        game: GameHandle,
        info: ServerInfo,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| ServerError::Bind {
            addr: addr.to_string(),
            error: e.to_string(),
        })?;

        Ok(Self {
            listener,
            transport: Arc::new(transport),
            registry: ConnectionRegistry::new(game.clone()),
            game,
            info: Arc::new(info),
            cancel_token,
            connection_counter: AtomicU64::new(1),
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::Io(e.to_string()))
    }

    pub fn registry(&self) -> &ConnectionRegistry<FrameWriter<T>> {
        &self.registry
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    /// Runs the server.
    ///
    /// Accepts connections until the cancellation token is triggered, then
    /// closes every open connection.
    pub async fn run(&self) -> Result<(), ServerError> {
        info!(
            addr = ?self.listener.local_addr().ok(),
            transport = self.transport.name(),
            instance = %self.info.instance_id,
            "Game server listening"
        );

        let broadcaster = self.spawn_event_broadcaster();

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let next = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            let id = ConnectionId::new(next);
                            debug!(connection = %id, peer = %addr, "Accepted connection");
                            self.handle_connection(stream, id);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        self.cleanup().await;
        let _ = broadcaster.await;
        Ok(())
    }

    /// Spawns a handler task for a new connection.
    fn handle_connection(&self, stream: TcpStream, id: ConnectionId) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(connection = %id, error = %e, "Failed to set TCP_NODELAY");
        }

        let handler = ConnectionHandler::new(
            id,
            Arc::clone(&self.transport),
            self.game.clone(),
            self.registry.clone(),
            Arc::clone(&self.info),
            self.cancel_token.clone(),
        );

        tokio::spawn(handler.run(stream));
    }

    /// Spawns the event broadcaster task.
    ///
    /// Every merged snapshot becomes one `gameState` message to all
    /// registered connections, the sender's included.
    fn spawn_event_broadcaster(&self) -> JoinHandle<()> {
        let mut event_rx = self.game.subscribe();
        let registry = self.registry.clone();
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Event broadcaster shutting down");
                        break;
                    }

                    result = event_rx.recv() => {
                        match result {
                            Ok(event) => broadcast_event(&registry, event).await,
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "Event broadcaster lagged, skipped events");
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                debug!("Event channel closed");
                                break;
                            }
                        }
                    }
                }
            }
        })
    }

    async fn cleanup(&self) {
        let closed = self.registry.close_all().await;
        info!(closed, "Game server stopped");
    }
}

/// Writes one game event to every registered connection.
async fn broadcast_event<S: OutboundSink>(registry: &ConnectionRegistry<S>, event: GameEvent) {
    match event {
        GameEvent::StateChanged { state, sequence } => {
            let json = match ServerMessage::game_state(state).to_json() {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "Failed to serialize game state");
                    return;
                }
            };

            let delivered = registry.broadcast(Outbound::Text(json)).await;
            debug!(sequence, delivered, "Broadcast game state");
        }
    }
}

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: String, error: String },

    #[error("I/O error: {0}")]
    Io(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::spawn_game;

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let (game, _outbox) = spawn_game("server-test".to_string());
        let server = GameServer::bind(
            "127.0.0.1:0",
            WebSocketTransport,
            game,
            ServerInfo::new("server-test"),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.info().instance_id, "server-test");
    }

    #[tokio::test]
    async fn test_bind_invalid_address() {
        let (game, _outbox) = spawn_game("server-test".to_string());
        let result = GameServer::bind(
            "not an address",
            JsonLinesTransport,
            game,
            ServerInfo::new("server-test"),
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (game, _outbox) = spawn_game("server-test".to_string());
        let cancel = CancellationToken::new();
        let server = GameServer::bind(
            "127.0.0.1:0",
            WebSocketTransport,
            game,
            ServerInfo::new("server-test"),
            cancel.clone(),
        )
        .await
        .unwrap();

        cancel.cancel();
        assert!(server.run().await.is_ok());
        assert!(server.registry().is_empty().await);
    }
}
