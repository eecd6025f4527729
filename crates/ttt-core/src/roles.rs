//! First-come role assignment limited to two slots.

use crate::error::GameFull;
use crate::{ConnectionId, Role};

/// The `X` and `O` slots, each empty or held by one live connection.
///
/// A connection holds at most one role. A slot is only handed to a new
/// connection after its holder has been released.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleSlots {
    x: Option<ConnectionId>,
    o: Option<ConnectionId>,
}

impl RoleSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the first free slot for `connection`, `X` before `O`.
    ///
    /// A connection that already holds a role gets that role back.
    pub fn assign(&mut self, connection: ConnectionId) -> Result<Role, GameFull> {
        if let Some(role) = self.role_of(connection) {
            return Ok(role);
        }

        for role in Role::ALL {
            let slot = self.slot_mut(role);
            if slot.is_none() {
                *slot = Some(connection);
                return Ok(role);
            }
        }

        Err(GameFull)
    }

    /// Frees whatever slot `connection` holds. Releasing twice is a no-op.
    pub fn release(&mut self, connection: ConnectionId) -> Option<Role> {
        let role = self.role_of(connection)?;
        *self.slot_mut(role) = None;
        Some(role)
    }

    pub fn role_of(&self, connection: ConnectionId) -> Option<Role> {
        Role::ALL
            .into_iter()
            .find(|&role| self.holder(role) == Some(connection))
    }

    pub fn holder(&self, role: Role) -> Option<ConnectionId> {
        match role {
            Role::X => self.x,
            Role::O => self.o,
        }
    }

    /// Number of occupied slots.
    pub fn occupied(&self) -> usize {
        usize::from(self.x.is_some()) + usize::from(self.o.is_some())
    }

    pub fn is_full(&self) -> bool {
        self.occupied() == Role::ALL.len()
    }

    fn slot_mut(&mut self, role: Role) -> &mut Option<ConnectionId> {
        match role {
            Role::X => &mut self.x,
            Role::O => &mut self.o,
        }
    }
}
