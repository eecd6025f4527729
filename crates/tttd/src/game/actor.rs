//! Game actor - owns the game state, role slots and replication sequence.
//!
//! Every read-modify-write on the game goes through this single task, so two
//! concurrent moves can never both pass the turn check against a stale
//! board.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Reply and event send failures are ignored or logged, never fatal

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use ttt_core::{ConnectionId, GameState, MoveResult, Role, RoleSlots};
use ttt_protocol::ReplicationMessage;

use super::commands::{GameCommand, GameError, GameEvent, MergeOutcome, MoveOutcome};

/// Source of the floor for the next local sequence number.
pub type Clock = fn() -> u64;

/// Milliseconds since the Unix epoch.
///
/// Local sequences never fall below this, so a freshly started process
/// still outranks snapshots its peers published earlier.
pub fn wall_clock() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

// ============================================================================
// Game Actor
// ============================================================================

/// The game actor.
///
/// Accepted moves and resets are not broadcast to clients from here. They
/// are pushed to the publish outbox and come back through `Merge` (from the
/// broker, or directly in degraded mode), which is the only path that emits
/// `GameEvent::StateChanged`.
pub struct GameActor {
    receiver: mpsc::Receiver<GameCommand>,

    state: GameState,
    roles: RoleSlots,

    /// Sequence of the last applied snapshot or local mutation.
    sequence: u64,

    /// Stamped on outgoing snapshots as `origin`.
    instance_id: String,

    clock: Clock,

    outbox: mpsc::UnboundedSender<ReplicationMessage>,
    event_publisher: broadcast::Sender<GameEvent>,
}

impl GameActor {
    pub fn new(
        receiver: mpsc::Receiver<GameCommand>,
        outbox: mpsc::UnboundedSender<ReplicationMessage>,
        event_publisher: broadcast::Sender<GameEvent>,
        instance_id: String,
    ) -> Self {
        Self::with_clock(receiver, outbox, event_publisher, instance_id, wall_clock)
    }

    /// Like `new`, with a custom sequence clock.
    pub fn with_clock(
        receiver: mpsc::Receiver<GameCommand>,
        outbox: mpsc::UnboundedSender<ReplicationMessage>,
        event_publisher: broadcast::Sender<GameEvent>,
        instance_id: String,
        clock: Clock,
    ) -> Self {
        Self {
            receiver,
            state: GameState::new(),
            roles: RoleSlots::new(),
            sequence: 0,
            instance_id,
            clock,
            outbox,
            event_publisher,
        }
    }

    /// Processes commands until every handle has been dropped.
    pub async fn run(mut self) {
        info!(instance = %self.instance_id, "Game actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(
            sequence = self.sequence,
            moves = self.state.moves_played(),
            "Game actor stopped"
        );
    }

    fn handle_command(&mut self, cmd: GameCommand) {
        match cmd {
            GameCommand::AssignRole {
                connection,
                respond_to,
            } => {
                let result = self.handle_assign_role(connection);
                // Ignore send error - caller may have gone away
                let _ = respond_to.send(result);
            }
            GameCommand::ReleaseRole {
                connection,
                respond_to,
            } => {
                let result = self.handle_release_role(connection);
                let _ = respond_to.send(result);
            }
            GameCommand::ApplyMove {
                connection,
                cell,
                respond_to,
            } => {
                let result = self.handle_apply_move(connection, cell);
                let _ = respond_to.send(result);
            }
            GameCommand::Reset { respond_to } => {
                let result = self.handle_reset();
                let _ = respond_to.send(result);
            }
            GameCommand::Merge {
                message,
                respond_to,
            } => {
                let result = self.handle_merge(*message);
                let _ = respond_to.send(result);
            }
            GameCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn handle_assign_role(
        &mut self,
        connection: ConnectionId,
    ) -> Result<(Role, GameState), GameError> {
        match self.roles.assign(connection) {
            Ok(role) => {
                info!(
                    connection = %connection,
                    role = %role,
                    occupied = self.roles.occupied(),
                    "Role assigned"
                );
                Ok((role, self.state.clone()))
            }
            Err(full) => {
                info!(connection = %connection, "Game is full, rejecting connection");
                Err(full.into())
            }
        }
    }

    fn handle_release_role(&mut self, connection: ConnectionId) -> Option<Role> {
        let released = self.roles.release(connection);
        if let Some(role) = released {
            info!(connection = %connection, role = %role, "Role released");
        }
        released
    }

    fn handle_apply_move(&mut self, connection: ConnectionId, cell: usize) -> MoveOutcome {
        let Some(role) = self.roles.role_of(connection) else {
            debug!(connection = %connection, cell, "Move from connection without a role");
            return MoveOutcome::NoRole;
        };

        match self.state.apply_move(role, cell) {
            MoveResult::Applied => {
                self.advance_sequence();
                debug!(
                    connection = %connection,
                    role = %role,
                    cell,
                    sequence = self.sequence,
                    "Move applied"
                );
                MoveOutcome::Accepted(self.queue_publish())
            }
            MoveResult::Illegal(reason) => {
                debug!(
                    connection = %connection,
                    role = %role,
                    cell,
                    reason = %reason,
                    "Illegal move ignored"
                );
                MoveOutcome::Rejected(reason)
            }
        }
    }

    fn handle_reset(&mut self) -> ReplicationMessage {
        self.state.reset();
        self.advance_sequence();
        info!(sequence = self.sequence, "Game reset");
        self.queue_publish()
    }

    fn handle_merge(&mut self, message: ReplicationMessage) -> MergeOutcome {
        if !message.supersedes(self.sequence) {
            debug!(
                local = self.sequence,
                incoming = message.sequence,
                origin = ?message.origin,
                "Dropping stale snapshot"
            );
            return MergeOutcome::Stale {
                local: self.sequence,
                incoming: message.sequence,
            };
        }

        self.state = message.state;
        self.sequence = self.sequence.max(message.sequence);

        debug!(
            sequence = self.sequence,
            origin = ?message.origin,
            "Snapshot merged"
        );

        // Ignore if no subscribers
        let _ = self.event_publisher.send(GameEvent::StateChanged {
            state: self.state.clone(),
            sequence: self.sequence,
        });

        MergeOutcome::Applied
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Moves the sequence past both the last applied value and the clock.
    fn advance_sequence(&mut self) {
        self.sequence = self.sequence.saturating_add(1).max((self.clock)());
    }

    fn snapshot(&self) -> ReplicationMessage {
        ReplicationMessage::new(
            self.state.clone(),
            self.sequence,
            Some(self.instance_id.clone()),
        )
    }

    /// Snapshots the current state and hands it to the replication publisher.
    fn queue_publish(&self) -> ReplicationMessage {
        let message = self.snapshot();
        if self.outbox.send(message.clone()).is_err() {
            warn!(
                sequence = message.sequence,
                "Publish outbox closed, snapshot not replicated"
            );
        }
        message
    }
}
