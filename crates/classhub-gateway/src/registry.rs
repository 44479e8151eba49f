use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use classhub_types::events::ServerEvent;
use classhub_types::models::{ConnectionId, Identity, RoomId};

use crate::error::RegistryError;

/// Outbound half of a connection's event queue.
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

struct ConnectionEntry {
    identity: Option<Identity>,
    rooms: HashSet<RoomId>,
    tx: EventSender,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    /// Reverse index for fan-out: room_id -> joined connections
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
}

/// Live connections, the identity bound to each, and who has joined which room.
///
/// Both indexes sit behind one lock so a join, leave or disconnect is atomic
/// with respect to every other membership change.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<RegistryState>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh, unbound connection. Returns (conn_id, receiver).
    pub async fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.write().await.connections.insert(
            conn_id,
            ConnectionEntry {
                identity: None,
                rooms: HashSet::new(),
                tx,
            },
        );
        (conn_id, rx)
    }

    /// Associate an identity with a connection. Only allowed once.
    pub async fn bind(&self, conn_id: ConnectionId, identity: Identity) -> Result<(), RegistryError> {
        let mut state = self.inner.write().await;
        let entry = state
            .connections
            .get_mut(&conn_id)
            .ok_or(RegistryError::UnknownConnection(conn_id))?;

        if entry.identity.is_some() {
            return Err(RegistryError::IdentityAlreadyBound(conn_id));
        }
        entry.identity = Some(identity);
        Ok(())
    }

    pub async fn identity(&self, conn_id: ConnectionId) -> Option<Identity> {
        self.inner
            .read()
            .await
            .connections
            .get(&conn_id)
            .and_then(|entry| entry.identity.clone())
    }

    /// Add the connection to a room. Returns false if it was already there.
    pub async fn join_room(&self, conn_id: ConnectionId, room_id: &str) -> Result<bool, RegistryError> {
        let mut state = self.inner.write().await;
        let entry = state
            .connections
            .get_mut(&conn_id)
            .ok_or(RegistryError::UnknownConnection(conn_id))?;

        let added = entry.rooms.insert(room_id.to_string());
        state
            .rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(conn_id);
        Ok(added)
    }

    /// Remove the connection from a room. Returns whether it was a member.
    pub async fn leave_room(&self, conn_id: ConnectionId, room_id: &str) -> bool {
        let mut state = self.inner.write().await;
        let was_member = state
            .connections
            .get_mut(&conn_id)
            .is_some_and(|entry| entry.rooms.remove(room_id));

        if let Some(members) = state.rooms.get_mut(room_id) {
            members.remove(&conn_id);
            if members.is_empty() {
                state.rooms.remove(room_id);
            }
        }
        was_member
    }

    /// Connections currently joined to a room.
    pub async fn members_of(&self, room_id: &str) -> HashSet<ConnectionId> {
        self.inner
            .read()
            .await
            .rooms
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn is_member(&self, conn_id: ConnectionId, room_id: &str) -> bool {
        self.inner
            .read()
            .await
            .rooms
            .get(room_id)
            .is_some_and(|members| members.contains(&conn_id))
    }

    /// Drop a connection and its room memberships. Peers are not told.
    pub async fn unbind(&self, conn_id: ConnectionId) -> Option<Identity> {
        let mut state = self.inner.write().await;
        let entry = state.connections.remove(&conn_id)?;

        for room_id in &entry.rooms {
            if let Some(members) = state.rooms.get_mut(room_id) {
                members.remove(&conn_id);
                if members.is_empty() {
                    state.rooms.remove(room_id);
                }
            }
        }
        entry.identity
    }

    /// Send a targeted event to a single connection.
    pub async fn send_to(&self, conn_id: ConnectionId, event: ServerEvent) -> Result<(), RegistryError> {
        let state = self.inner.read().await;
        let entry = state
            .connections
            .get(&conn_id)
            .ok_or(RegistryError::UnknownConnection(conn_id))?;

        // A closed receiver means the socket task is already gone
        entry
            .tx
            .send(event)
            .map_err(|_| RegistryError::UnknownConnection(conn_id))
    }

    /// Fan an event out to the room's current members, optionally skipping one.
    /// Returns how many connections it was queued for.
    pub async fn broadcast(
        &self,
        room_id: &str,
        event: ServerEvent,
        except: Option<ConnectionId>,
    ) -> usize {
        let state = self.inner.read().await;
        let Some(members) = state.rooms.get(room_id) else {
            return 0;
        };

        let mut delivered = 0;
        for conn_id in members {
            if Some(*conn_id) == except {
                continue;
            }
            if let Some(entry) = state.connections.get(conn_id) {
                if entry.tx.send(event.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }
}
