//! Domain errors for game rules and role assignment.

use crate::Role;
use thiserror::Error;

/// Reasons a move is rejected.
///
/// Rejection never mutates the game; callers decide whether the sender
/// hears about it.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IllegalMove {
    #[error("cell {cell} is outside the board")]
    OutOfRange { cell: usize },

    #[error("cell {cell} is already occupied")]
    Occupied { cell: usize },

    #[error("game is already over")]
    GameOver,

    #[error("not {got}'s turn (expected {expected})")]
    WrongTurn { expected: Role, got: Role },
}

/// Both role slots are held by live connections.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("game is full")]
pub struct GameFull;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_illegal_move_display() {
        assert_eq!(
            IllegalMove::OutOfRange { cell: 9 }.to_string(),
            "cell 9 is outside the board"
        );
        assert_eq!(
            IllegalMove::Occupied { cell: 4 }.to_string(),
            "cell 4 is already occupied"
        );
        assert_eq!(IllegalMove::GameOver.to_string(), "game is already over");
        assert_eq!(
            IllegalMove::WrongTurn {
                expected: Role::X,
                got: Role::O
            }
            .to_string(),
            "not O's turn (expected X)"
        );
    }

    #[test]
    fn test_game_full_display() {
        assert_eq!(GameFull.to_string(), "game is full");
    }
}
