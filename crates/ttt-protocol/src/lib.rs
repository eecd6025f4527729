//! TTT Protocol - Wire formats for the tic-tac-toe server
//!
//! This crate provides the WebSocket frame codec and upgrade handshake,
//! the JSON messages exchanged with game clients, and the snapshot format
//! replicated between server processes. Nothing in here performs I/O.

pub mod frame;
pub mod handshake;
pub mod message;
pub mod replication;

pub use frame::{Inbound, Opcode, Outbound, ProtocolError, WebSocketCodec};
pub use handshake::{HandshakeError, HealthReport, HttpRequest, UpgradeRequest};
pub use message::{ClientMessage, MessageError, PlayerAssignment, ServerMessage};
pub use replication::ReplicationMessage;
