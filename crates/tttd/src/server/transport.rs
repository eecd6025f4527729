//! Session transports.
//!
//! A transport decides how a freshly accepted TCP stream becomes a stream of
//! `Inbound` items: the opening exchange (if any) and the codec used
//! afterwards. The server picks one at startup and is generic over it, so
//! there is no per-message dispatch.

use std::fmt;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};
use tracing::debug;

use ttt_protocol::frame::{Inbound, Outbound, ProtocolError, WebSocketCodec};
use ttt_protocol::handshake::{
    find_head_end, health_response, upgrade_response, HandshakeError, HealthReport, HttpRequest,
    UpgradeRequest, MAX_HEAD_SIZE,
};

use super::ServerInfo;

/// Longest line accepted by the JSON-lines transport (1 MiB).
pub const MAX_LINE_LENGTH: usize = 1_048_576;

const READ_CHUNK: usize = 1024;

/// Result of the opening exchange.
#[derive(Debug)]
pub enum Accepted {
    /// The session is open. `leftover` holds bytes read past the handshake.
    Open { leftover: BytesMut },

    /// The request was answered in full (health probe); close the stream.
    Served,
}

/// How a connection is opened and framed.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Codec: Decoder<Item = Inbound, Error = ProtocolError>
        + Encoder<Outbound, Error = ProtocolError>
        + Send
        + Unpin
        + 'static;

    /// Short name for logs and the health report.
    fn name(&self) -> &'static str;

    /// A fresh codec for one direction of one connection.
    fn codec(&self) -> Self::Codec;

    /// Performs the opening exchange.
    async fn accept<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        info: &ServerInfo,
    ) -> Result<Accepted, HandshakeError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send;
}

// ============================================================================
// WebSocket
// ============================================================================

/// WebSocket over a hand-rolled HTTP/1.1 upgrade. Also answers
/// `GET /health`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Reads until the end of the request head.
    ///
    /// Returns the buffer and the length of the head within it.
    async fn read_head<R>(reader: &mut R) -> Result<(BytesMut, usize), HandshakeError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);

        loop {
            if let Some(end) = find_head_end(&buf) {
                return Ok((buf, end));
            }
            if buf.len() >= MAX_HEAD_SIZE {
                return Err(HandshakeError::HeadTooLarge { max: MAX_HEAD_SIZE });
            }

            buf.reserve(READ_CHUNK);
            let read = reader.read_buf(&mut buf).await?;
            if read == 0 {
                return Err(HandshakeError::ConnectionClosed);
            }
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    type Codec = WebSocketCodec;

    fn name(&self) -> &'static str {
        "websocket"
    }

    fn codec(&self) -> WebSocketCodec {
        WebSocketCodec::new()
    }

    async fn accept<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        info: &ServerInfo,
    ) -> Result<Accepted, HandshakeError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let (mut buf, head_end) = Self::read_head(reader).await?;
        if head_end > MAX_HEAD_SIZE {
            return Err(HandshakeError::HeadTooLarge { max: MAX_HEAD_SIZE });
        }

        let head = std::str::from_utf8(&buf[..head_end]).map_err(|_| {
            HandshakeError::MalformedRequest("request head is not UTF-8".to_string())
        })?;
        let request = HttpRequest::parse(head)?;

        if request.is_health_probe() {
            let now = chrono::Utc::now().to_rfc3339();
            let report = HealthReport::ok(self.name(), &info.instance_id, now);
            let body = serde_json::to_string(&report)
                .map_err(|e| HandshakeError::MalformedRequest(e.to_string()))?;
            writer.write_all(health_response(&body).as_bytes()).await?;
            writer.shutdown().await?;
            debug!("Answered health probe");
            return Ok(Accepted::Served);
        }

        let upgrade = UpgradeRequest::from_request(&request)?;
        writer
            .write_all(upgrade_response(&upgrade.accept_key()).as_bytes())
            .await?;
        writer.flush().await?;

        debug!(path = %upgrade.path, "WebSocket upgrade complete");
        Ok(Accepted::Open {
            leftover: buf.split_off(head_end),
        })
    }
}

// ============================================================================
// JSON lines
// ============================================================================

/// Newline-delimited JSON over plain TCP. No handshake, no control frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesTransport;

/// Codec for `JsonLinesTransport`: one message per line.
#[derive(Debug)]
pub struct JsonLinesCodec {
    lines: LinesCodec,
}

impl Default for JsonLinesCodec {
    fn default() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        }
    }
}

fn map_lines_error(err: LinesCodecError) -> ProtocolError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => ProtocolError::LineTooLong {
            max: MAX_LINE_LENGTH,
        },
        LinesCodecError::Io(e) => e.into(),
    }
}

impl Decoder for JsonLinesCodec {
    type Item = Inbound;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, ProtocolError> {
        self.lines
            .decode(src)
            .map(|line| line.map(Inbound::Text))
            .map_err(map_lines_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, ProtocolError> {
        self.lines
            .decode_eof(src)
            .map(|line| line.map(Inbound::Text))
            .map_err(map_lines_error)
    }
}

impl Encoder<Outbound> for JsonLinesCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match item {
            Outbound::Text(text) => self.lines.encode(text, dst).map_err(map_lines_error),
            // Lines have no control messages; closing is a plain shutdown.
            Outbound::Pong(_) | Outbound::Close(_) => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for JsonLinesTransport {
    type Codec = JsonLinesCodec;

    fn name(&self) -> &'static str {
        "lines"
    }

    fn codec(&self) -> JsonLinesCodec {
        JsonLinesCodec::default()
    }

    async fn accept<R, W>(
        &self,
        _reader: &mut R,
        _writer: &mut W,
        _info: &ServerInfo,
    ) -> Result<Accepted, HandshakeError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        Ok(Accepted::Open {
            leftover: BytesMut::new(),
        })
    }
}

/// Transport selected in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    JsonLines,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::JsonLines => "lines",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(Self::WebSocket),
            "lines" | "json-lines" | "jsonl" => Ok(Self::JsonLines),
            other => Err(format!("unknown transport: {other} (expected websocket or lines)")),
        }
    }
}
