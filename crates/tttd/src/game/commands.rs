//! Game actor commands, errors, and events.
//!
//! - `GameCommand`: requests sent to the actor
//! - `GameError`: failures surfaced to callers
//! - `MoveOutcome` / `MergeOutcome`: results of state-changing commands
//! - `GameEvent`: notifications published after local state changes

use thiserror::Error;
use tokio::sync::oneshot;

use ttt_core::{ConnectionId, GameFull, GameState, IllegalMove, Role};
use ttt_protocol::ReplicationMessage;

// ============================================================================
// Game Commands
// ============================================================================

/// Commands sent to the game actor.
///
/// Each request carries a oneshot sender for the reply.
#[derive(Debug)]
pub enum GameCommand {
    /// Claim a role for a new connection.
    ///
    /// # Errors
    /// - `GameError::GameFull` if both roles are held
    AssignRole {
        connection: ConnectionId,
        respond_to: oneshot::Sender<Result<(Role, GameState), GameError>>,
    },

    /// Free the role held by a departing connection. Idempotent.
    ReleaseRole {
        connection: ConnectionId,
        respond_to: oneshot::Sender<Option<Role>>,
    },

    /// Apply a move on behalf of a connection.
    ApplyMove {
        connection: ConnectionId,
        cell: usize,
        respond_to: oneshot::Sender<MoveOutcome>,
    },

    /// Reset the game unconditionally.
    Reset {
        respond_to: oneshot::Sender<ReplicationMessage>,
    },

    /// Merge a snapshot received from the broker (or looped back locally).
    Merge {
        message: Box<ReplicationMessage>,
        respond_to: oneshot::Sender<MergeOutcome>,
    },

    /// Read the current snapshot.
    Snapshot {
        respond_to: oneshot::Sender<ReplicationMessage>,
    },
}

// ============================================================================
// Results
// ============================================================================

/// Errors from game operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GameError {
    #[error("game is full")]
    GameFull,

    #[error("game channel closed")]
    ChannelClosed,
}

impl From<GameFull> for GameError {
    fn from(_: GameFull) -> Self {
        Self::GameFull
    }
}

/// Result of a move request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    /// The move was applied; the snapshot has been queued for publishing.
    Accepted(ReplicationMessage),

    /// The move broke a rule; nothing changed.
    Rejected(IllegalMove),

    /// The connection holds no role.
    NoRole,
}

/// Result of merging a replicated snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Local state was replaced and subscribers were notified.
    Applied,

    /// The snapshot was older than local state and was dropped.
    Stale { local: u64, incoming: u64 },
}

// ============================================================================
// Game Events
// ============================================================================

/// Events published by the game actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameEvent {
    /// Local state was replaced by a merged snapshot.
    StateChanged { state: GameState, sequence: u64 },
}
