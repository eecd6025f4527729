//! JSON messages exchanged with game clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use ttt_core::{GameState, Role};

/// Sent to a connection that arrives while both roles are taken.
pub const GAME_FULL_MESSAGE: &str = "Game is full. Try again later.";

/// Reasons an inbound text message could not be understood.
///
/// The session handler logs these and keeps the connection open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("invalid JSON: {0}")]
    Json(String),

    #[error("message has no string `type` field")]
    MissingType,

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid payload for {0}")]
    InvalidPayload(&'static str),
}

/// Messages sent from clients to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Place the sender's marker on a cell
    MakeMove {
        /// Cell index; anything outside 0..9 is rejected by the game
        data: i64,
    },

    /// Reset the shared game
    RestartGame,
}

impl ClientMessage {
    /// Creates a move message.
    pub fn make_move(cell: i64) -> Self {
        Self::MakeMove { data: cell }
    }

    /// Creates a restart message.
    pub fn restart_game() -> Self {
        Self::RestartGame
    }

    /// Classifies an inbound text message.
    ///
    /// Unlike plain deserialization this tells apart broken JSON, a missing
    /// discriminator, an unknown type and a bad payload.
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| MessageError::Json(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(MessageError::MissingType)?;

        match kind {
            "makeMove" => value
                .get("data")
                .and_then(Value::as_i64)
                .map(Self::make_move)
                .ok_or(MessageError::InvalidPayload("makeMove")),
            "restartGame" => Ok(Self::RestartGame),
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }
}

/// Payload of a `playerAssignment` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerAssignment {
    pub player_role: Role,
    pub game_state: GameState,
}

/// Messages sent from the server to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Full game state after any change
    GameState { data: GameState },

    /// Role handed to a newly registered connection
    PlayerAssignment { data: PlayerAssignment },

    /// Human-readable error
    Error { message: String },
}

impl ServerMessage {
    /// Creates a game state broadcast.
    pub fn game_state(state: GameState) -> Self {
        Self::GameState { data: state }
    }

    /// Creates a role assignment.
    pub fn player_assignment(role: Role, state: GameState) -> Self {
        Self::PlayerAssignment {
            data: PlayerAssignment {
                player_role: role,
                game_state: state,
            },
        }
    }

    /// Creates an error message.
    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
        }
    }

    /// The rejection sent when both roles are taken.
    pub fn game_full() -> Self {
        Self::error(GAME_FULL_MESSAGE)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
