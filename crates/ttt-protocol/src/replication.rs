//! Snapshots exchanged between server processes over the broker.

use serde::{Deserialize, Serialize};
use ttt_core::GameState;

/// A complete game snapshot published after every local mutation.
///
/// The game fields sit at the top level, so a bare serialized `GameState`
/// is also a valid message (with `sequence` 0).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationMessage {
    #[serde(flatten)]
    pub state: GameState,

    /// Per-game version. 0 means unversioned.
    #[serde(default)]
    pub sequence: u64,

    /// Instance that produced the snapshot, for logs only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl ReplicationMessage {
    pub fn new(state: GameState, sequence: u64, origin: Option<String>) -> Self {
        Self {
            state,
            sequence,
            origin,
        }
    }

    /// A snapshot without version information; always accepted on merge.
    pub fn unversioned(state: GameState) -> Self {
        Self::new(state, 0, None)
    }

    /// Whether this snapshot should replace local state at `local_sequence`.
    ///
    /// Unversioned snapshots always win. Versioned ones win unless strictly
    /// older than what is already applied; equal sequences are accepted so
    /// a process re-applies its own echo.
    pub fn supersedes(&self, local_sequence: u64) -> bool {
        self.sequence == 0 || self.sequence >= local_sequence
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}
