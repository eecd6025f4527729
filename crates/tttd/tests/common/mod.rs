//! Shared helpers for tttd integration tests.
//!
//! Tests CAN use `.unwrap()` and `.expect()`; the panic-free policy covers
//! production code only.

#![allow(dead_code)]

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::BytesMut;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Chain};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use ttt_core::{GameState, Role};
use ttt_protocol::frame::{encode_masked_frame, Inbound, Opcode, WebSocketCodec};
use ttt_protocol::handshake::{compute_accept_key, find_head_end};
use ttt_protocol::message::{ClientMessage, ServerMessage};
use tttd::game::{spawn_game, GameHandle};
use tttd::replication::{InMemoryBroker, ReplicationChannel, DEFAULT_TOPIC};
use tttd::server::{GameServer, JsonLinesTransport, ServerInfo, Transport, WebSocketTransport};

// ============================================================================
// Constants
// ============================================================================

/// Upper bound on waiting for any single server reaction
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// How long "nothing arrives" is observed for
pub const SILENCE: Duration = Duration::from_millis(150);

/// Longer than the resubscribe backoff cap, so a returning broker is
/// always picked up in time
pub const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(8);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Client masking key; any value works.
const MASK: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

// ============================================================================
// Test Server
// ============================================================================

/// One server instance with its game actor and replication channel.
pub struct TestServer {
    pub addr: SocketAddr,
    pub game: GameHandle,
    pub channel: ReplicationChannel,
    cancel_token: CancellationToken,
}

impl TestServer {
    /// WebSocket server on its own in-memory broker.
    pub async fn spawn() -> Self {
        Self::spawn_on(InMemoryBroker::new(), "node-a").await
    }

    /// WebSocket server replicating through `broker`.
    pub async fn spawn_on(broker: InMemoryBroker, name: &str) -> Self {
        let server = Self::start(WebSocketTransport, broker, name).await;
        server.wait_subscribed().await;
        server
    }

    /// WebSocket server whose broker is down from the start.
    pub async fn spawn_degraded(name: &str) -> (Self, InMemoryBroker) {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        (Self::start(WebSocketTransport, broker.clone(), name).await, broker)
    }

    /// JSON-lines server on its own in-memory broker.
    pub async fn spawn_lines() -> Self {
        let server = Self::start(JsonLinesTransport, InMemoryBroker::new(), "lines-node").await;
        server.wait_subscribed().await;
        server
    }

    async fn start<T: Transport>(transport: T, broker: InMemoryBroker, name: &str) -> Self {
        let cancel_token = CancellationToken::new();
        let (game, outbox) = spawn_game(name.to_string());

        let channel = ReplicationChannel::new(Arc::new(broker), DEFAULT_TOPIC);
        channel
            .clone()
            .spawn(game.clone(), outbox, cancel_token.clone());

        let server = GameServer::bind(
            "127.0.0.1:0",
            transport,
            game.clone(),
            ServerInfo::new(name),
            cancel_token.clone(),
        )
        .await
        .expect("bind test server");
        let addr = server.local_addr().expect("local addr");

        tokio::spawn(async move {
            let _ = server.run().await;
        });

        Self {
            addr,
            game,
            channel,
            cancel_token,
        }
    }

    /// Waits until the replication subscription is live, so every move is
    /// delivered exactly once through the broker.
    pub async fn wait_subscribed(&self) {
        timeout(SUBSCRIBE_TIMEOUT, async {
            while !self.channel.is_subscribed() {
                sleep(POLL_INTERVAL).await;
            }
        })
        .await
        .expect("replication never subscribed");
    }

    pub async fn connect(&self) -> WsClient {
        WsClient::connect(self.addr).await
    }

    /// Connects and reads the role assignment.
    pub async fn join(&self) -> (WsClient, Role, GameState) {
        let mut client = self.connect().await;
        let (role, state) = client.recv_assignment().await;
        (client, role, state)
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

// ============================================================================
// WebSocket Client
// ============================================================================

pub fn random_key() -> String {
    STANDARD.encode(rand_bytes())
}

fn rand_bytes() -> [u8; 16] {
    // Distinct enough for tests; the server only checks the length.
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(7);
    let mut out = [0u8; 16];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = (nanos >> (i % 4 * 8)) as u8 ^ i as u8;
    }
    out
}

pub fn upgrade_request(key: &str) -> String {
    format!(
        "GET / HTTP/1.1\r\n\
         Host: localhost\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    )
}

/// Minimal WebSocket client: masked frames out, server frames in.
///
/// Remembers the last game state it received so helpers know whose turn
/// it is.
pub struct WsClient {
    frames: FramedRead<Chain<Cursor<BytesMut>, OwnedReadHalf>, WebSocketCodec>,
    writer: OwnedWriteHalf,
    last_state: GameState,
}

impl WsClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self::connect_with(addr, &[]).await
    }

    /// Connects, writing `early` in the same write as the upgrade request.
    pub async fn connect_with(addr: SocketAddr, early: &[u8]) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (mut reader, mut writer) = stream.into_split();

        let key = random_key();
        let mut request = upgrade_request(&key).into_bytes();
        request.extend_from_slice(early);
        writer.write_all(&request).await.unwrap();

        let mut buf = BytesMut::with_capacity(1024);
        let head_end = timeout(RECV_TIMEOUT, async {
            loop {
                if let Some(end) = find_head_end(&buf) {
                    return end;
                }
                let n = reader.read_buf(&mut buf).await.unwrap();
                assert!(n > 0, "server closed during handshake");
            }
        })
        .await
        .expect("handshake response");

        let head = String::from_utf8(buf[..head_end].to_vec()).unwrap();
        assert!(
            head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"),
            "unexpected response: {head}"
        );
        let expected = format!("Sec-WebSocket-Accept: {}\r\n", compute_accept_key(&key));
        assert!(head.contains(&expected), "bad accept key in: {head}");

        // Frames may have arrived together with the response head.
        let leftover = buf.split_off(head_end);
        let frames = FramedRead::new(Cursor::new(leftover).chain(reader), WebSocketCodec::new());

        Self {
            frames,
            writer,
            last_state: GameState::new(),
        }
    }

    /// Most recent state seen in an assignment or broadcast.
    pub fn last_state(&self) -> &GameState {
        &self.last_state
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub async fn send_frame(&mut self, opcode: Opcode, payload: &[u8]) {
        let frame = encode_masked_frame(opcode, payload, MASK);
        self.send_raw(&frame).await;
    }

    pub async fn send_text(&mut self, text: &str) {
        self.send_frame(Opcode::Text, text.as_bytes()).await;
    }

    pub async fn send(&mut self, message: &ClientMessage) {
        let json = serde_json::to_string(message).unwrap();
        self.send_text(&json).await;
    }

    pub async fn make_move(&mut self, cell: i64) {
        self.send(&ClientMessage::make_move(cell)).await;
    }

    pub async fn restart(&mut self) {
        self.send(&ClientMessage::restart_game()).await;
    }

    /// Next frame; `None` on EOF. Panics if nothing arrives in time.
    pub async fn recv(&mut self) -> Option<Inbound> {
        timeout(RECV_TIMEOUT, self.frames.next())
            .await
            .expect("timed out waiting for server")
            .map(|frame| frame.expect("server sent an invalid frame"))
    }

    pub async fn recv_message(&mut self) -> ServerMessage {
        let message: ServerMessage = match self.recv().await {
            Some(Inbound::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {other:?}"),
        };
        match &message {
            ServerMessage::GameState { data } => self.last_state = data.clone(),
            ServerMessage::PlayerAssignment { data } => self.last_state = data.game_state.clone(),
            ServerMessage::Error { .. } => {}
        }
        message
    }

    pub async fn recv_assignment(&mut self) -> (Role, GameState) {
        match self.recv_message().await {
            ServerMessage::PlayerAssignment { data } => (data.player_role, data.game_state),
            other => panic!("expected playerAssignment, got {other:?}"),
        }
    }

    pub async fn recv_state(&mut self) -> GameState {
        match self.recv_message().await {
            ServerMessage::GameState { data } => data,
            other => panic!("expected gameState, got {other:?}"),
        }
    }

    /// Asserts nothing arrives for a short while.
    pub async fn expect_silence(&mut self) {
        if let Ok(frame) = timeout(SILENCE, self.frames.next()).await {
            panic!("expected silence, got {frame:?}");
        }
    }

    /// Reads until EOF, returning the close code if a close frame came first.
    pub async fn expect_closed(&mut self) -> Option<u16> {
        let mut code = None;
        loop {
            match self.recv().await {
                None => return code,
                Some(Inbound::Close(c)) => code = c,
                Some(other) => panic!("expected close, got {other:?}"),
            }
        }
    }

    /// Sends a close frame and waits for the server to finish the session.
    pub async fn close(mut self) {
        self.send_frame(Opcode::Close, &1000u16.to_be_bytes()).await;
        self.expect_closed().await;
    }
}

// ============================================================================
// JSON-lines Client
// ============================================================================

pub struct LinesClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl LinesClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    pub async fn send_line(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub async fn send(&mut self, message: &ClientMessage) {
        let json = serde_json::to_string(message).unwrap();
        self.send_line(&json).await;
    }

    /// Next message; `None` on EOF.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        let mut line = String::new();
        let n = timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for server")
            .unwrap();
        if n == 0 {
            return None;
        }
        Some(serde_json::from_str(line.trim_end()).unwrap())
    }
}

// ============================================================================
// Game helpers
// ============================================================================

/// Two connected players, X first.
pub async fn two_players(server: &TestServer) -> (WsClient, WsClient) {
    let (x, role_x, _) = server.join().await;
    let (o, role_o, _) = server.join().await;
    assert_eq!(role_x, Role::X);
    assert_eq!(role_o, Role::O);
    (x, o)
}

/// Plays `cells` in turn order, starting with whoever X last saw as next,
/// and returns the last state both players saw.
pub async fn play(x: &mut WsClient, o: &mut WsClient, cells: &[i64]) -> GameState {
    let mut last = x.last_state().clone();
    for &cell in cells {
        match last.next_role {
            Role::X => x.make_move(cell).await,
            Role::O => o.make_move(cell).await,
        }
        let seen_by_x = x.recv_state().await;
        let seen_by_o = o.recv_state().await;
        assert_eq!(seen_by_x, seen_by_o);
        last = seen_by_x;
    }
    last
}
