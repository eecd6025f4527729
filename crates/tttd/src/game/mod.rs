//! The shared game, owned by a single actor task.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  GameCommand   ┌──────────────┐  snapshot  ┌──────────────────┐
//! │ ConnectionHandler│───(mpsc)──────▶│  GameActor   │──(outbox)─▶│ReplicationChannel│
//! └──────────────────┘                └──────┬───────┘            └────────┬─────────┘
//!                                            │ GameEvent                   │ Merge
//!                                            │ (broadcast)                 │
//!                                            ▼                             │
//!                                   ┌──────────────────┐                   │
//!                                   │ event broadcaster│◀──────────────────┘
//!                                   └──────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - Channel operations handle closure gracefully

use tokio::sync::{broadcast, mpsc};

use ttt_protocol::ReplicationMessage;

mod actor;
mod commands;
mod handle;

pub use actor::{wall_clock, Clock, GameActor};
pub use commands::{GameCommand, GameError, GameEvent, MergeOutcome, MoveOutcome};
pub use handle::GameHandle;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 100;
const EVENT_BUFFER: usize = 100;

/// Spawns the game actor.
///
/// Returns the handle and the receiving end of the publish outbox, which
/// the replication channel drains.
pub fn spawn_game(
    instance_id: String,
) -> (GameHandle, mpsc::UnboundedReceiver<ReplicationMessage>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();

    let actor = GameActor::new(cmd_rx, outbox_tx, event_tx.clone(), instance_id);
    tokio::spawn(actor.run());

    (GameHandle::new(cmd_tx, event_tx), outbox_rx)
}
