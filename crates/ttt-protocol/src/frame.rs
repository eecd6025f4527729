//! WebSocket frame codec.
//!
//! Pure `decode` / `encode` functions for single frames, plus a streaming
//! `WebSocketCodec` for `tokio_util::codec` that accumulates bytes across
//! reads. The streaming decoder is an explicit two-state machine:
//!
//! ```text
//! AwaitingHeader ──(header complete)──▶ AwaitingPayload ──(payload complete)──▶ item
//!       ▲                                                                        │
//!       └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Fragmented messages are not supported: non-final data frames and
//! continuation frames are rejected, which is fatal to the connection.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Largest payload accepted in a single frame (1 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 1_048_576;

/// Control frames carry at most 125 payload bytes.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Close status: normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close status: endpoint going away (server shutdown).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close status: protocol error.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Close status: policy violation (used when the game is full).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

const FIN_BIT: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const OPCODE_BITS: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LENGTH_BITS: u8 = 0x7F;
const LENGTH_16: u8 = 126;
const LENGTH_64: u8 = 127;

// ============================================================================
// Errors
// ============================================================================

/// Frame-level failures. Every variant except `Incomplete` is fatal to the
/// connection since the framer has no way to resynchronize.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("incomplete frame: need {needed} bytes, have {available}")]
    Incomplete { needed: usize, available: usize },

    #[error("reserved bits set without a negotiated extension")]
    ReservedBits,

    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),

    #[error("unsupported opcode {0:#x}")]
    UnsupportedOpcode(u8),

    #[error("fragmented messages are not supported")]
    Fragmented,

    #[error("invalid control frame")]
    InvalidControlFrame,

    #[error("invalid payload length")]
    InvalidLength,

    #[error("frame too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: u64, max: usize },

    #[error("text payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("line exceeds {max} bytes")]
    LineTooLong { max: usize },

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

// ============================================================================
// Opcodes and Headers
// ============================================================================

/// Frame opcodes defined by RFC 6455.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask: Option<[u8; 4]>,
    pub payload_len: usize,
    /// Bytes occupied by the header, including extended length and mask key.
    pub header_len: usize,
}

/// Number of header bytes implied by what has arrived so far.
fn header_len_hint(buf: &[u8]) -> usize {
    let Some(&second) = buf.get(1) else {
        return 2;
    };
    let extended = match second & LENGTH_BITS {
        LENGTH_16 => 2,
        LENGTH_64 => 8,
        _ => 0,
    };
    let mask = if second & MASK_BIT != 0 { 4 } else { 0 };
    2 + extended + mask
}

/// Parses a frame header from the front of `buf`.
///
/// Returns `Ok(None)` while the header is still incomplete. Frames this
/// server refuses to handle (fragments, binary, oversized, malformed control
/// frames) are rejected here so the pure and streaming decoders agree.
pub fn parse_header(buf: &[u8]) -> Result<Option<FrameHeader>, ProtocolError> {
    let header_len = header_len_hint(buf);
    if buf.len() < header_len {
        return Ok(None);
    }

    let first = buf[0];
    let second = buf[1];

    if first & RSV_BITS != 0 {
        return Err(ProtocolError::ReservedBits);
    }

    let fin = first & FIN_BIT != 0;
    let opcode = Opcode::from_u8(first & OPCODE_BITS)?;
    let masked = second & MASK_BIT != 0;

    let (raw_len, length_end) = match second & LENGTH_BITS {
        LENGTH_16 => (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4),
        LENGTH_64 => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(bytes);
            if len & (1 << 63) != 0 {
                return Err(ProtocolError::InvalidLength);
            }
            (len, 10)
        }
        inline => (u64::from(inline), 2),
    };

    let mask = if masked {
        let mut key = [0u8; 4];
        key.copy_from_slice(&buf[length_end..length_end + 4]);
        Some(key)
    } else {
        None
    };

    if opcode.is_control() {
        if !fin || raw_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(ProtocolError::InvalidControlFrame);
        }
    } else {
        if opcode == Opcode::Continuation || !fin {
            return Err(ProtocolError::Fragmented);
        }
        if opcode == Opcode::Binary {
            return Err(ProtocolError::UnsupportedOpcode(opcode.as_u8()));
        }
    }

    let payload_len = usize::try_from(raw_len)
        .ok()
        .filter(|&len| len <= MAX_PAYLOAD_SIZE)
        .ok_or(ProtocolError::MessageTooLarge {
            size: raw_len,
            max: MAX_PAYLOAD_SIZE,
        })?;

    Ok(Some(FrameHeader {
        fin,
        opcode,
        mask,
        payload_len,
        header_len,
    }))
}

/// XORs every payload byte with `key[i % 4]`. Applying it twice restores
/// the input.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

// ============================================================================
// Pure Decode / Encode
// ============================================================================

/// A fully received, unmasked frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Decodes one frame from the front of `buf`.
///
/// Returns the frame and the number of bytes it occupied. A buffer shorter
/// than the header implies yields `ProtocolError::Incomplete`; the caller
/// keeps the bytes and retries once more arrive.
pub fn decode(buf: &[u8]) -> Result<(Frame, usize), ProtocolError> {
    let header = parse_header(buf)?.ok_or(ProtocolError::Incomplete {
        needed: header_len_hint(buf),
        available: buf.len(),
    })?;

    let total = header.header_len + header.payload_len;
    if buf.len() < total {
        return Err(ProtocolError::Incomplete {
            needed: total,
            available: buf.len(),
        });
    }

    let mut payload = buf[header.header_len..total].to_vec();
    if let Some(key) = header.mask {
        apply_mask(&mut payload, key);
    }

    Ok((
        Frame {
            fin: header.fin,
            opcode: header.opcode,
            payload,
        },
        total,
    ))
}

/// Decodes a single text frame into its message.
pub fn decode_text(buf: &[u8]) -> Result<String, ProtocolError> {
    let (frame, _) = decode(buf)?;
    if frame.opcode != Opcode::Text {
        return Err(ProtocolError::UnsupportedOpcode(frame.opcode.as_u8()));
    }
    String::from_utf8(frame.payload).map_err(|_| ProtocolError::InvalidUtf8)
}

/// Frames `text` as one final, unmasked text frame.
pub fn encode(text: &str) -> Vec<u8> {
    encode_frame(Opcode::Text, text.as_bytes())
}

/// Frames `payload` as one final, unmasked frame with the given opcode.
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    write_frame(&mut out, opcode, payload, None);
    out
}

/// Frames `payload` masked with `key`, as a client must send it.
pub fn encode_masked_frame(opcode: Opcode, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    write_frame(&mut out, opcode, payload, Some(key));
    out
}

fn write_frame<B: BufMut>(dst: &mut B, opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>) {
    dst.put_u8(FIN_BIT | opcode.as_u8());

    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
    let len = payload.len();
    if len < usize::from(LENGTH_16) {
        // fits in the low 7 bits
        dst.put_u8(mask_bit | len as u8);
    } else if let Ok(len) = u16::try_from(len) {
        dst.put_u8(mask_bit | LENGTH_16);
        dst.put_u16(len);
    } else {
        dst.put_u8(mask_bit | LENGTH_64);
        dst.put_u64(len as u64);
    }

    match mask {
        Some(key) => {
            dst.put_slice(&key);
            let mut masked = payload.to_vec();
            apply_mask(&mut masked, key);
            dst.put_slice(&masked);
        }
        None => dst.put_slice(payload),
    }
}

// ============================================================================
// Session Items
// ============================================================================

/// A decoded inbound message as seen by the session handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<u16>),
}

impl Inbound {
    fn from_frame(opcode: Opcode, payload: Bytes) -> Result<Self, ProtocolError> {
        match opcode {
            Opcode::Text => String::from_utf8(payload.to_vec())
                .map(Inbound::Text)
                .map_err(|_| ProtocolError::InvalidUtf8),
            Opcode::Ping => Ok(Inbound::Ping(payload)),
            Opcode::Pong => Ok(Inbound::Pong(payload)),
            Opcode::Close => {
                let code = match payload.get(..2) {
                    Some(&[hi, lo]) => Some(u16::from_be_bytes([hi, lo])),
                    _ => None,
                };
                Ok(Inbound::Close(code))
            }
            other => Err(ProtocolError::UnsupportedOpcode(other.as_u8())),
        }
    }
}

/// A message the server writes to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Pong(Bytes),
    Close(Option<u16>),
}

// ============================================================================
// Streaming Codec
// ============================================================================

#[derive(Debug, Default)]
enum DecodeState {
    #[default]
    AwaitingHeader,
    AwaitingPayload(FrameHeader),
}

/// Server-side WebSocket codec for `FramedRead` / `FramedWrite`.
///
/// Decodes client frames (masked or not) across any number of reads and
/// encodes unmasked server frames.
#[derive(Debug, Default)]
pub struct WebSocketCodec {
    state: DecodeState,
}

impl WebSocketCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a header has been consumed but its payload has not.
    pub fn is_mid_frame(&self) -> bool {
        matches!(self.state, DecodeState::AwaitingPayload(_))
    }
}

impl Decoder for WebSocketCodec {
    type Item = Inbound;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, ProtocolError> {
        loop {
            match std::mem::take(&mut self.state) {
                DecodeState::AwaitingHeader => match parse_header(src)? {
                    Some(header) => {
                        src.advance(header.header_len);
                        self.state = DecodeState::AwaitingPayload(header);
                    }
                    None => {
                        src.reserve(header_len_hint(src).saturating_sub(src.len()));
                        return Ok(None);
                    }
                },
                DecodeState::AwaitingPayload(header) => {
                    if src.len() < header.payload_len {
                        src.reserve(header.payload_len - src.len());
                        self.state = DecodeState::AwaitingPayload(header);
                        return Ok(None);
                    }

                    let mut payload = src.split_to(header.payload_len);
                    if let Some(key) = header.mask {
                        apply_mask(&mut payload, key);
                    }
                    return Inbound::from_frame(header.opcode, payload.freeze()).map(Some);
                }
            }
        }
    }
}

impl Encoder<Outbound> for WebSocketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match item {
            Outbound::Text(text) => {
                dst.reserve(text.len() + 10);
                write_frame(dst, Opcode::Text, text.as_bytes(), None);
            }
            Outbound::Pong(payload) => {
                let len = payload.len().min(MAX_CONTROL_PAYLOAD);
                write_frame(dst, Opcode::Pong, &payload[..len], None);
            }
            Outbound::Close(code) => {
                let body = code.map(u16::to_be_bytes);
                write_frame(dst, Opcode::Close, body.as_ref().map_or(&[][..], |b| &b[..]), None);
            }
        }
        Ok(())
    }
}
