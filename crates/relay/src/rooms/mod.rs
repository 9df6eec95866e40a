// Room membership: an arena of room name -> member handles. Rooms are
// created by the first join and dropped when the last member leaves.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use dashmap::{mapref::entry::Entry, DashMap};
use taskhub_common::types::RoomName;
use tracing::debug;

use crate::error::{ErrorCode, RelayError};
use crate::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry};

#[derive(Debug)]
pub struct RoomManager {
    registry: Arc<ConnectionRegistry>,
    rooms: DashMap<RoomName, HashMap<ConnectionId, ConnectionHandle>>,
}

impl RoomManager {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry, rooms: DashMap::new() }
    }

    /// Add `id` to `room`. Returns whether the membership is new.
    pub fn join(&self, id: ConnectionId, room: RoomName) -> Result<bool, RelayError> {
        let joined = self
            .registry
            .record_room(id, &room, |handle| {
                self.rooms.entry(room.clone()).or_default().insert(id, handle.clone()).is_none()
            })
            .ok_or_else(|| RelayError::new(ErrorCode::NotFound, "connection is not registered"))?;

        if joined {
            debug!(connection_id = %id, room = %room, "joined room");
        }
        Ok(joined)
    }

    /// Remove `id` from `room`. Returns whether it was a member.
    pub fn leave(&self, id: ConnectionId, room: &RoomName) -> bool {
        let left = self.registry.forget_room(id, room, || self.remove_member(id, room));
        if left {
            debug!(connection_id = %id, room = %room, "left room");
        }
        left
    }

    pub fn members_of(&self, room: &RoomName) -> HashSet<ConnectionId> {
        self.rooms.get(room).map(|members| members.keys().copied().collect()).unwrap_or_default()
    }

    pub fn is_member(&self, id: ConnectionId, room: &RoomName) -> bool {
        self.rooms.get(room).is_some_and(|members| members.contains_key(&id))
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Drop `id` from every listed room (disconnect path).
    pub fn remove_everywhere<'a>(
        &self,
        id: ConnectionId,
        rooms: impl IntoIterator<Item = &'a RoomName>,
    ) -> usize {
        rooms.into_iter().filter(|room| self.remove_member(id, room)).count()
    }

    /// Run `f` over the members of `room` with the room entry held
    /// exclusively, so concurrent publishes to one room reach every member
    /// in the same order. `None` when the room does not exist.
    pub(crate) fn with_members<R>(
        &self,
        room: &RoomName,
        f: impl FnOnce(&HashMap<ConnectionId, ConnectionHandle>) -> R,
    ) -> Option<R> {
        let members = self.rooms.get_mut(room)?;
        Some(f(&members))
    }

    fn remove_member(&self, id: ConnectionId, room: &RoomName) -> bool {
        match self.rooms.entry(room.clone()) {
            Entry::Occupied(mut entry) => {
                let removed = entry.get_mut().remove(&id).is_some();
                if entry.get().is_empty() {
                    entry.remove();
                }
                removed
            }
            Entry::Vacant(_) => false,
        }
    }
}
