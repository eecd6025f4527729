//! Game state machine: board mutation, win and draw detection, turn order.
//!
//! Everything here is pure. The daemon owns exactly one `GameState` inside
//! its game actor and funnels every mutation through `apply_move`, `reset`
//! or a wholesale replacement from a replicated snapshot.

use serde::{Deserialize, Serialize};

use crate::error::IllegalMove;
use crate::Role;

/// Number of cells on the fixed 3×3 board.
pub const BOARD_SIZE: usize = 9;

/// Row-major board; `None` is an empty cell.
pub type Board = [Option<Role>; BOARD_SIZE];

/// The 8 winning lines: 3 rows, 3 columns, 2 diagonals.
pub const LINES: [[usize; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    [0, 4, 8],
    [2, 4, 6],
];

// ============================================================================
// Evaluation
// ============================================================================

/// Result of evaluating a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub winner: Option<Role>,
    pub is_draw: bool,
}

/// Evaluates a board for a winner or a draw.
///
/// A line wins when its first cell is non-empty and all three cells are
/// equal. A draw is a full board with no winning line.
pub fn evaluate(board: &Board) -> Outcome {
    let winner = LINES.iter().find_map(|&[a, b, c]| match board[a] {
        Some(role) if board[b] == Some(role) && board[c] == Some(role) => Some(role),
        _ => None,
    });

    let is_full = board.iter().all(Option::is_some);

    Outcome {
        winner,
        is_draw: winner.is_none() && is_full,
    }
}

// ============================================================================
// Game State
// ============================================================================

/// Coarse phase of a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameStatus {
    InProgress,
    Won(Role),
    Draw,
}

/// Result of attempting a move.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveResult {
    Applied,
    Illegal(IllegalMove),
}

impl MoveResult {
    pub fn is_applied(&self) -> bool {
        matches!(self, MoveResult::Applied)
    }
}

/// The single shared game record.
///
/// Serialized with the camelCase field names clients and peer processes
/// expect: `board`, `nextRole`, `winner`, `isDraw`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    pub board: Board,
    pub next_role: Role,
    pub winner: Option<Role>,
    pub is_draw: bool,
}

impl Default for GameState {
    fn default() -> Self {
        Self::new()
    }
}

impl GameState {
    /// Canonical start state: empty board, `X` to move.
    pub const fn new() -> Self {
        Self {
            board: [None; BOARD_SIZE],
            next_role: Role::X,
            winner: None,
            is_draw: false,
        }
    }

    /// Attempts to place `role`'s marker on `cell`.
    ///
    /// Rejections leave `self` untouched. Checks run in a fixed order:
    /// range, terminality, turn, occupancy.
    pub fn apply_move(&mut self, role: Role, cell: usize) -> MoveResult {
        if let Err(reason) = self.check_move(role, cell) {
            return MoveResult::Illegal(reason);
        }

        self.board[cell] = Some(role);
        self.next_role = role.opponent();

        let outcome = evaluate(&self.board);
        self.winner = outcome.winner;
        self.is_draw = outcome.is_draw;

        MoveResult::Applied
    }

    /// Validates a move without applying it.
    pub fn check_move(&self, role: Role, cell: usize) -> Result<(), IllegalMove> {
        if cell >= BOARD_SIZE {
            return Err(IllegalMove::OutOfRange { cell });
        }
        if self.is_over() {
            return Err(IllegalMove::GameOver);
        }
        if role != self.next_role {
            return Err(IllegalMove::WrongTurn {
                expected: self.next_role,
                got: role,
            });
        }
        if self.board[cell].is_some() {
            return Err(IllegalMove::Occupied { cell });
        }
        Ok(())
    }

    /// Reinitializes every field in a single assignment.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn status(&self) -> GameStatus {
        match (self.winner, self.is_draw) {
            (Some(role), _) => GameStatus::Won(role),
            (None, true) => GameStatus::Draw,
            (None, false) => GameStatus::InProgress,
        }
    }

    /// True once there is a winner or a draw.
    pub fn is_over(&self) -> bool {
        self.winner.is_some() || self.is_draw
    }

    pub fn moves_played(&self) -> usize {
        self.board.iter().filter(|cell| cell.is_some()).count()
    }
}
