//! TTT Core - Shared domain types for the replicated tic-tac-toe server
//!
//! This crate provides the game rules and role bookkeeping shared between
//! the wire protocol (`ttt-protocol`) and the daemon (`tttd`). Nothing in
//! here performs I/O.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()` or `todo!()` outside of tests.

pub mod error;
pub mod game;
pub mod role;
pub mod roles;

// Re-exports for convenience
pub use error::{GameFull, IllegalMove};
pub use game::{evaluate, Board, GameState, GameStatus, MoveResult, Outcome, BOARD_SIZE, LINES};
pub use role::{ConnectionId, Role};
pub use roles::RoleSlots;
