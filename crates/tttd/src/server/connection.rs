//! Session handler for individual client connections.
//!
//! Each accepted stream gets its own `ConnectionHandler` that:
//! - Runs the transport's opening exchange (WebSocket upgrade or nothing)
//! - Registers with the connection registry and reports the assigned role
//! - Parses client messages and routes them to the game actor
//! - Answers pings and close frames
//! - Unregisters on any exit path
//!
//! Outgoing state broadcasts do not pass through the handler. They are
//! written by the server's event broadcaster through the registry, sharing
//! the same writer under a mutex.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?` or pattern matching
//! - Connection errors are logged and result in graceful disconnect

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::{Sink, SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncReadExt, Chain};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ttt_core::ConnectionId;
use ttt_protocol::frame::{
    Inbound, Outbound, ProtocolError, CLOSE_POLICY_VIOLATION, CLOSE_PROTOCOL_ERROR,
};
use ttt_protocol::handshake::HandshakeError;
use ttt_protocol::message::{ClientMessage, MessageError, ServerMessage};

use super::registry::{shared, ConnectionRegistry};
use super::transport::{Accepted, Transport};
use super::ServerInfo;
use crate::game::{GameError, GameHandle, MoveOutcome};

/// Write timeout (10 seconds)
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for the opening exchange (10 seconds)
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Anything the server can write `Outbound` items into.
pub trait OutboundSink: Sink<Outbound, Error = ProtocolError> + Unpin + Send + 'static {}

impl<S> OutboundSink for S where
    S: Sink<Outbound, Error = ProtocolError> + Unpin + Send + 'static
{
}

/// Writer shared between a connection and the broadcaster.
pub type SharedWriter<S> = Arc<Mutex<S>>;

/// Concrete writer type for connections served by transport `T`.
pub type FrameWriter<T> = FramedWrite<OwnedWriteHalf, <T as Transport>::Codec>;

/// Bytes read past the handshake, then the socket.
type SessionInput = Chain<Cursor<BytesMut>, OwnedReadHalf>;

type FrameReader<T> = FramedRead<SessionInput, <T as Transport>::Codec>;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Open,
    Closed,
}

/// Writes one item to an already locked sink, bounded by `WRITE_TIMEOUT`.
pub async fn send_locked<S: OutboundSink>(
    sink: &mut S,
    item: Outbound,
) -> Result<(), ConnectionError> {
    match timeout(WRITE_TIMEOUT, sink.send(item)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Protocol(e)),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

/// Locks `writer` and writes one item.
pub async fn send_outbound<S: OutboundSink>(
    writer: &Mutex<S>,
    item: Outbound,
) -> Result<(), ConnectionError> {
    let mut sink = writer.lock().await;
    send_locked(&mut *sink, item).await
}

/// Flushes and shuts the writer. Errors are ignored; the peer may be gone.
async fn close_writer<S: OutboundSink>(writer: &Mutex<S>) {
    let mut sink = writer.lock().await;
    let _ = timeout(WRITE_TIMEOUT, sink.close()).await;
}

fn encode(message: &ServerMessage) -> Result<Outbound, ConnectionError> {
    message
        .to_json()
        .map(Outbound::Text)
        .map_err(|e| ConnectionError::Serialize(e.to_string()))
}

/// Handler for a single client connection.
pub struct ConnectionHandler<T: Transport> {
    id: ConnectionId,
    transport: Arc<T>,
    game: GameHandle,
    registry: ConnectionRegistry<FrameWriter<T>>,
    info: Arc<ServerInfo>,
    cancel: CancellationToken,
    state: SessionState,
}

impl<T: Transport> ConnectionHandler<T> {
    pub fn new(
        id: ConnectionId,
        transport: Arc<T>,
        game: GameHandle,
        registry: ConnectionRegistry<FrameWriter<T>>,
        info: Arc<ServerInfo>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            transport,
            game,
            registry,
            info,
            cancel,
            state: SessionState::Handshaking,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Runs the session until the client leaves or the server shuts down.
    ///
    /// Always ends in `SessionState::Closed` with the connection removed from
    /// the registry.
    pub async fn run(mut self, stream: TcpStream) -> SessionState {
        debug!(connection = %self.id, transport = self.transport.name(), "New client connected");
        let (mut reader, mut writer) = stream.into_split();

        let leftover = match self.handshake(&mut reader, &mut writer).await {
            Ok(Some(leftover)) => leftover,
            Ok(None) => {
                self.state = SessionState::Closed;
                return self.state;
            }
            Err(e) => {
                debug!(connection = %self.id, error = %e, "Closing without a session");
                self.state = SessionState::Closed;
                return self.state;
            }
        };

        let input = Cursor::new(leftover).chain(reader);
        let mut frames = FramedRead::new(input, self.transport.codec());
        let writer = shared(FramedWrite::new(writer, self.transport.codec()));
        // Cancelled on server shutdown or when the registry drops us.
        let evicted = self.cancel.child_token();

        match self.open(&writer, evicted.clone()).await {
            Ok(true) => {
                self.state = SessionState::Open;
                let result = self.process_messages(&mut frames, &writer, &evicted).await;
                if let Err(e) = result {
                    debug!(connection = %self.id, error = %e, "Connection closed");
                }
            }
            Ok(false) => {
                info!(connection = %self.id, "Rejected connection, game is full");
            }
            Err(e) => {
                warn!(connection = %self.id, error = %e, "Failed to open session");
            }
        }

        self.state = SessionState::Closed;
        let released = self.registry.unregister(self.id).await;
        close_writer(&writer).await;

        info!(connection = %self.id, role = ?released, "Client disconnected");
        self.state
    }

    /// Runs the transport's opening exchange under `HANDSHAKE_TIMEOUT`.
    ///
    /// Returns the bytes read past the handshake, or `None` if the request
    /// was answered in full and no session follows.
    async fn handshake(
        &self,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
    ) -> Result<Option<BytesMut>, ConnectionError> {
        let accept = self.transport.accept(reader, writer, &self.info);
        match timeout(HANDSHAKE_TIMEOUT, accept).await {
            Ok(Ok(Accepted::Open { leftover })) => Ok(Some(leftover)),
            Ok(Ok(Accepted::Served)) => Ok(None),
            Ok(Err(e)) => Err(ConnectionError::Handshake(e)),
            Err(_) => Err(ConnectionError::HandshakeTimeout),
        }
    }

    /// Registers the connection and sends the role assignment.
    ///
    /// The writer stays locked from registration until the assignment is
    /// written, so no broadcast can reach the client first.
    ///
    /// Returns `false` if the game was full; the client has then been told
    /// and sent a close frame.
    async fn open(
        &self,
        writer: &SharedWriter<FrameWriter<T>>,
        evicted: CancellationToken,
    ) -> Result<bool, ConnectionError> {
        let mut sink = writer.lock().await;

        match self.registry.register(self.id, Arc::clone(writer), evicted).await {
            Ok((role, state)) => {
                let assignment = encode(&ServerMessage::player_assignment(role, state))?;
                send_locked(&mut *sink, assignment).await?;
                info!(connection = %self.id, role = %role, "Player joined");
                Ok(true)
            }
            Err(GameError::GameFull) => {
                send_locked(&mut *sink, encode(&ServerMessage::game_full())?).await?;
                send_locked(&mut *sink, Outbound::Close(Some(CLOSE_POLICY_VIOLATION))).await?;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Main message processing loop.
    ///
    /// There is no idle timeout; a player may think as long as they like.
    async fn process_messages(
        &self,
        frames: &mut FrameReader<T>,
        writer: &SharedWriter<FrameWriter<T>>,
        evicted: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        loop {
            let next = tokio::select! {
                _ = evicted.cancelled() => {
                    if self.cancel.is_cancelled() {
                        debug!(connection = %self.id, "Server shutting down");
                    } else {
                        info!(connection = %self.id, "Dropped by the registry, closing");
                    }
                    return Ok(());
                }
                next = frames.next() => next,
            };

            match next {
                None => {
                    debug!(connection = %self.id, "Client sent EOF");
                    return Ok(());
                }
                Some(Err(e)) => {
                    let close = Outbound::Close(Some(CLOSE_PROTOCOL_ERROR));
                    let _ = send_outbound(writer, close).await;
                    return Err(e.into());
                }
                Some(Ok(Inbound::Text(text))) => self.handle_text(&text).await?,
                Some(Ok(Inbound::Ping(payload))) => {
                    send_outbound(writer, Outbound::Pong(payload)).await?;
                }
                Some(Ok(Inbound::Pong(_))) => {}
                Some(Ok(Inbound::Close(code))) => {
                    debug!(connection = %self.id, code = ?code, "Client sent close");
                    let _ = send_outbound(writer, Outbound::Close(code)).await;
                    return Ok(());
                }
            }
        }
    }

    /// Handles one text message. Unparseable input is logged and ignored.
    async fn handle_text(&self, text: &str) -> Result<(), ConnectionError> {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(MessageError::UnknownType(kind)) => {
                warn!(connection = %self.id, kind = %kind, "Unrecognized message type");
                return Ok(());
            }
            Err(e) => {
                debug!(connection = %self.id, error = %e, "Ignoring malformed message");
                return Ok(());
            }
        };

        match message {
            ClientMessage::MakeMove { data } => {
                // Negative or huge cells fall out of range and are rejected.
                let cell = usize::try_from(data).unwrap_or(usize::MAX);
                match self.game.apply_move(self.id, cell).await? {
                    MoveOutcome::Accepted(snapshot) => {
                        debug!(
                            connection = %self.id,
                            cell,
                            sequence = snapshot.sequence,
                            "Move applied"
                        );
                    }
                    MoveOutcome::Rejected(reason) => {
                        debug!(
                            connection = %self.id,
                            cell = data,
                            reason = %reason,
                            "Move ignored"
                        );
                    }
                    MoveOutcome::NoRole => {
                        debug!(connection = %self.id, "Move from connection without a role");
                    }
                }
            }
            ClientMessage::RestartGame => {
                let snapshot = self.game.reset().await?;
                info!(connection = %self.id, sequence = snapshot.sequence, "Game restarted");
            }
        }

        Ok(())
    }
}

/// Connection errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Game error: {0}")]
    Game(#[from] GameError),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Write timeout")]
    WriteTimeout,
}
