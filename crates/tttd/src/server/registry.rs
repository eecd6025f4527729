//! Live connections and their writers.
//!
//! The registry pairs each open connection with its role and its shared
//! writer. Role bookkeeping itself lives in the game actor; the registry
//! asks the actor for a role before inserting and releases it on removal.
//!
//! Broadcasts clone the writer handles under the read lock, release it, and
//! write to every connection concurrently, each bounded by the write
//! timeout. Connections whose write fails are removed afterwards, and their
//! eviction token is cancelled so the session handler closes the socket.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use futures::SinkExt;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use ttt_core::{ConnectionId, GameState, Role};
use ttt_protocol::frame::{Outbound, CLOSE_GOING_AWAY};

use super::connection::{send_outbound, OutboundSink, SharedWriter, WRITE_TIMEOUT};
use crate::game::{GameError, GameHandle};

struct Registered<S> {
    role: Role,
    writer: SharedWriter<S>,
    /// Cancelled when the registry drops the connection.
    evicted: CancellationToken,
}

/// Registry of open connections, generic over the writer type.
pub struct ConnectionRegistry<S> {
    game: GameHandle,
    connections: Arc<RwLock<HashMap<ConnectionId, Registered<S>>>>,
}

impl<S> Clone for ConnectionRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            game: self.game.clone(),
            connections: Arc::clone(&self.connections),
        }
    }
}

impl<S: OutboundSink> ConnectionRegistry<S> {
    pub fn new(game: GameHandle) -> Self {
        Self {
            game,
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Assigns a role to `id` and records its writer.
    ///
    /// `evicted` is cancelled once the connection is removed, whether by
    /// `unregister`, a failed broadcast or `close_all`.
    ///
    /// # Errors
    ///
    /// - `GameError::GameFull` if both roles are taken; the registry is left
    ///   untouched
    /// - `GameError::ChannelClosed` if the game actor is gone
    pub async fn register(
        &self,
        id: ConnectionId,
        writer: SharedWriter<S>,
        evicted: CancellationToken,
    ) -> Result<(Role, GameState), GameError> {
        let (role, state) = self.game.assign_role(id).await?;

        let mut connections = self.connections.write().await;
        connections.insert(
            id,
            Registered {
                role,
                writer,
                evicted,
            },
        );
        debug!(
            connection = %id,
            role = %role,
            total = connections.len(),
            "Connection registered"
        );

        Ok((role, state))
    }

    /// Removes `id` and releases its role. Safe to call more than once.
    pub async fn unregister(&self, id: ConnectionId) -> Option<Role> {
        let removed = self.connections.write().await.remove(&id);
        let released = self.game.release_role(id).await;

        if let Some(entry) = removed {
            entry.evicted.cancel();
            debug!(connection = %id, role = ?released, "Connection unregistered");
        }
        released
    }

    /// Sends `item` to every registered connection.
    ///
    /// Returns how many connections it reached.
    pub async fn broadcast(&self, item: Outbound) -> usize {
        let targets: Vec<(ConnectionId, SharedWriter<S>)> = {
            let connections = self.connections.read().await;
            connections
                .iter()
                .map(|(id, entry)| (*id, Arc::clone(&entry.writer)))
                .collect()
        };

        let results = join_all(targets.iter().map(|(id, writer)| {
            let item = item.clone();
            async move { (*id, send_outbound(writer, item).await) }
        }))
        .await;

        let mut delivered = 0;
        for (id, result) in results {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(connection = %id, error = %e, "Broadcast failed, dropping connection");
                    self.unregister(id).await;
                }
            }
        }
        delivered
    }

    /// Calls `f` with the id and role of every registered connection.
    pub async fn for_each_active<F>(&self, mut f: F)
    where
        F: FnMut(ConnectionId, Role),
    {
        let connections = self.connections.read().await;
        for (id, entry) in connections.iter() {
            f(*id, entry.role);
        }
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Sends a close to every connection, shuts their writers and empties the
    /// registry. Used on server shutdown.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<(ConnectionId, Registered<S>)> =
            self.connections.write().await.drain().collect();

        let closed = drained.len();
        join_all(drained.iter().map(|(_, entry)| async move {
            entry.evicted.cancel();
            let _ = send_outbound(&entry.writer, Outbound::Close(Some(CLOSE_GOING_AWAY))).await;
            let mut sink = entry.writer.lock().await;
            let _ = timeout(WRITE_TIMEOUT, sink.close()).await;
        }))
        .await;

        for (id, _) in drained {
            self.game.release_role(id).await;
        }

        if closed > 0 {
            info!(closed, "Closed all connections");
        }
        closed
    }
}

/// Wraps a sink for registration.
pub fn shared<S>(sink: S) -> SharedWriter<S> {
    Arc::new(Mutex::new(sink))
}
