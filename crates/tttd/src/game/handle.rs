//! Client interface for the game actor.
//!
//! `GameHandle` is cheap to clone and shared by every connection task, the
//! replication channel and the server's event broadcaster. Channel errors
//! map to `GameError::ChannelClosed`.

use tokio::sync::{broadcast, mpsc, oneshot};

use ttt_core::{ConnectionId, GameState, Role};
use ttt_protocol::ReplicationMessage;

use super::commands::{GameCommand, GameError, GameEvent, MergeOutcome, MoveOutcome};

/// Handle for interacting with the game actor.
#[derive(Clone)]
pub struct GameHandle {
    sender: mpsc::Sender<GameCommand>,
    event_sender: broadcast::Sender<GameEvent>,
}

impl GameHandle {
    pub fn new(
        sender: mpsc::Sender<GameCommand>,
        event_sender: broadcast::Sender<GameEvent>,
    ) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    /// Claims a role for `connection` and returns it with the current state.
    ///
    /// # Errors
    ///
    /// - `GameError::GameFull` if both roles are held
    /// - `GameError::ChannelClosed` if the actor has shut down
    pub async fn assign_role(
        &self,
        connection: ConnectionId,
    ) -> Result<(Role, GameState), GameError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(GameCommand::AssignRole {
                connection,
                respond_to: tx,
            })
            .await
            .map_err(|_| GameError::ChannelClosed)?;

        rx.await.map_err(|_| GameError::ChannelClosed)?
    }

    /// Releases whatever role `connection` holds.
    ///
    /// Returns `None` if it held none or the actor is gone.
    pub async fn release_role(&self, connection: ConnectionId) -> Option<Role> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(GameCommand::ReleaseRole {
                connection,
                respond_to: tx,
            })
            .await
            .ok()?;

        rx.await.ok()?
    }

    /// Applies a move for the role `connection` holds.
    ///
    /// # Errors
    ///
    /// - `GameError::ChannelClosed` if the actor has shut down
    pub async fn apply_move(
        &self,
        connection: ConnectionId,
        cell: usize,
    ) -> Result<MoveOutcome, GameError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(GameCommand::ApplyMove {
                connection,
                cell,
                respond_to: tx,
            })
            .await
            .map_err(|_| GameError::ChannelClosed)?;

        rx.await.map_err(|_| GameError::ChannelClosed)
    }

    /// Resets the game and returns the snapshot queued for publishing.
    ///
    /// # Errors
    ///
    /// - `GameError::ChannelClosed` if the actor has shut down
    pub async fn reset(&self) -> Result<ReplicationMessage, GameError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(GameCommand::Reset { respond_to: tx })
            .await
            .map_err(|_| GameError::ChannelClosed)?;

        rx.await.map_err(|_| GameError::ChannelClosed)
    }

    /// Merges a replicated snapshot into local state.
    ///
    /// # Errors
    ///
    /// - `GameError::ChannelClosed` if the actor has shut down
    pub async fn merge(&self, message: ReplicationMessage) -> Result<MergeOutcome, GameError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(GameCommand::Merge {
                message: Box::new(message),
                respond_to: tx,
            })
            .await
            .map_err(|_| GameError::ChannelClosed)?;

        rx.await.map_err(|_| GameError::ChannelClosed)
    }

    /// Current snapshot, or `None` if the actor is gone.
    pub async fn snapshot(&self) -> Option<ReplicationMessage> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(GameCommand::Snapshot { respond_to: tx })
            .await
            .ok()?;

        rx.await.ok()
    }

    /// Subscribes to state change events.
    pub fn subscribe(&self) -> broadcast::Receiver<GameEvent> {
        self.event_sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::spawn_game;

    fn id(n: u64) -> ConnectionId {
        ConnectionId::new(n)
    }

    #[tokio::test]
    async fn test_handle_roundtrip() {
        let (game, mut outbox) = spawn_game("handle-test".to_string());

        let (role, state) = game.assign_role(id(1)).await.unwrap();
        assert_eq!(role, Role::X);
        assert_eq!(state, GameState::new());

        let outcome = game.apply_move(id(1), 4).await.unwrap();
        let MoveOutcome::Accepted(accepted) = outcome else {
            panic!("expected Accepted, got {outcome:?}");
        };
        let published = outbox.recv().await.unwrap();
        assert_eq!(published, accepted);
        assert_eq!(published.state.board[4], Some(Role::X));

        let snapshot = game.snapshot().await.unwrap();
        assert_eq!(snapshot.sequence, accepted.sequence);
        assert!(snapshot.sequence > 0);
        assert_eq!(snapshot.state.next_role, Role::O);
    }

    #[tokio::test]
    async fn test_handle_merge_emits_event() {
        let (game, _outbox) = spawn_game("handle-test".to_string());
        let mut events = game.subscribe();

        let mut state = GameState::new();
        let _ = state.apply_move(Role::X, 8);
        let outcome = game
            .merge(ReplicationMessage::new(state.clone(), 1, None))
            .await
            .unwrap();
        assert_eq!(outcome, MergeOutcome::Applied);

        let GameEvent::StateChanged { state: received, .. } = events.recv().await.unwrap();
        assert_eq!(received, state);
    }

    #[tokio::test]
    async fn test_concurrent_moves_only_one_wins() {
        let (game, _outbox) = spawn_game("handle-test".to_string());
        game.assign_role(id(1)).await.unwrap();

        // same role racing for two cells: exactly one passes the turn check
        let a = game.clone();
        let b = game.clone();
        let (first, second) = tokio::join!(a.apply_move(id(1), 0), b.apply_move(id(1), 1));

        let accepted = [first.unwrap(), second.unwrap()]
            .into_iter()
            .filter(|o| matches!(o, MoveOutcome::Accepted(_)))
            .count();
        assert_eq!(accepted, 1);
    }

    #[tokio::test]
    async fn test_closed_channel_errors() {
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        let (event_tx, _) = broadcast::channel(1);
        drop(cmd_rx);
        let handle = GameHandle::new(cmd_tx, event_tx);

        assert_eq!(handle.assign_role(id(1)).await, Err(GameError::ChannelClosed));
        assert_eq!(handle.reset().await, Err(GameError::ChannelClosed));
        assert_eq!(handle.release_role(id(1)).await, None);
        assert!(handle.snapshot().await.is_none());
    }
}
