//! Player roles and connection identity.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Role
// ============================================================================

/// One of the two participant identities.
///
/// Serialized as the bare marker string (`"X"` / `"O"`), which is also what
/// occupies a board cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    X,
    O,
}

impl Role {
    /// Both roles, in assignment order.
    pub const ALL: [Role; 2] = [Role::X, Role::O];

    /// Returns the role that moves after this one.
    #[must_use]
    pub fn opponent(self) -> Role {
        match self {
            Role::X => Role::O,
            Role::O => Role::X,
        }
    }

    /// Returns the marker character.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::X => "X",
            Role::O => "O",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Connection Identity
// ============================================================================

/// Opaque handle for a live client connection.
///
/// Allocated by the server from a monotonically increasing counter; never
/// reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

impl From<u64> for ConnectionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}
