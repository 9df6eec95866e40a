// Connection registry: live connections, their bound identity, and the
// user -> connections index used for user-addressed delivery.
//
// Lock order: a connection entry may be held while taking a user or room
// entry, never the reverse.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use taskhub_common::{protocol::events::ServerEvent, types::RoomName, types::UserId};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ErrorCode, RelayError};

pub type ConnectionId = Uuid;

/// Cheap, cloneable write side of one connection's ordered outbound stream.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<ServerEvent>,
    closed: Arc<AtomicBool>,
}

impl ConnectionHandle {
    fn new(id: ConnectionId, outbound: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self { id, outbound, closed: Arc::new(AtomicBool::new(false)) }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue an event. Returns false once the connection started closing.
    pub fn send(&self, event: ServerEvent) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.outbound.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[derive(Debug)]
struct ConnectionRecord {
    handle: ConnectionHandle,
    user_id: Option<UserId>,
    rooms: HashSet<RoomName>,
    connected_at: DateTime<Utc>,
}

/// Outcome of a successful `bind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Bound,
    AlreadyBound,
}

/// What was left of a connection when it was removed.
#[derive(Debug, Clone)]
pub struct DisconnectedConnection {
    pub id: ConnectionId,
    pub user_id: Option<UserId>,
    pub rooms: Vec<RoomName>,
    pub connected_at: DateTime<Utc>,
    /// Whether the bound user still has other live connections.
    pub user_still_connected: bool,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionRecord>,
    users: DashMap<UserId, HashMap<ConnectionId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    /// Register a new, unbound connection.
    pub fn connect(&self, outbound: mpsc::UnboundedSender<ServerEvent>) -> ConnectionId {
        let id = Uuid::new_v4();
        self.connections.insert(
            id,
            ConnectionRecord {
                handle: ConnectionHandle::new(id, outbound),
                user_id: None,
                rooms: HashSet::new(),
                connected_at: Utc::now(),
            },
        );
        debug!(connection_id = %id, "connection registered");
        id
    }

    /// Associate a connection with a user. Re-binding the same user is a
    /// no-op; binding a different user is refused.
    pub fn bind(&self, id: ConnectionId, user_id: &UserId) -> Result<BindOutcome, RelayError> {
        let mut record = self.connections.get_mut(&id).ok_or_else(unknown_connection)?;

        match &record.user_id {
            Some(bound) if bound == user_id => return Ok(BindOutcome::AlreadyBound),
            Some(bound) => {
                return Err(RelayError::new(
                    ErrorCode::AlreadyBound,
                    format!("connection is already bound to user {bound}"),
                ))
            }
            None => {}
        }

        record.user_id = Some(user_id.clone());
        self.users.entry(user_id.clone()).or_default().insert(id, record.handle.clone());
        debug!(connection_id = %id, user_id = %user_id, "connection bound");
        Ok(BindOutcome::Bound)
    }

    pub fn user_for(&self, id: ConnectionId) -> Option<UserId> {
        self.connections.get(&id).and_then(|record| record.user_id.clone())
    }

    /// The bound user, or `NotBound` for user-addressed operations.
    pub fn require_user(&self, id: ConnectionId) -> Result<UserId, RelayError> {
        let record = self.connections.get(&id).ok_or_else(unknown_connection)?;
        record.user_id.clone().ok_or_else(|| RelayError::from_code(ErrorCode::NotBound))
    }

    pub fn lookup_connections(&self, user_id: &UserId) -> HashSet<ConnectionId> {
        self.users
            .get(user_id)
            .map(|connections| connections.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_user_connected(&self, user_id: &UserId) -> bool {
        self.users.get(user_id).is_some_and(|connections| !connections.is_empty())
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn size(&self) -> usize {
        self.connections.len()
    }

    pub fn rooms_of(&self, id: ConnectionId) -> Vec<RoomName> {
        let mut rooms = self
            .connections
            .get(&id)
            .map(|record| record.rooms.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    /// Queue an event on one connection.
    pub fn send_to(&self, id: ConnectionId, event: ServerEvent) -> bool {
        match self.connections.get(&id) {
            Some(record) => record.handle.send(event),
            None => false,
        }
    }

    /// Run `f` over a user's handles while the user entry is locked, so
    /// deliveries to one user are not interleaved with binds or removals.
    pub(crate) fn for_each_user_connection(
        &self,
        user_id: &UserId,
        mut f: impl FnMut(&ConnectionHandle),
    ) {
        if let Some(connections) = self.users.get(user_id) {
            for handle in connections.values() {
                f(handle);
            }
        }
    }

    /// Record room membership on the connection and run `attach` with its
    /// handle while the connection entry is held. `None` when the connection
    /// is unknown or closing.
    pub(crate) fn record_room<R>(
        &self,
        id: ConnectionId,
        room: &RoomName,
        attach: impl FnOnce(&ConnectionHandle) -> R,
    ) -> Option<R> {
        let mut record = self.connections.get_mut(&id)?;
        if record.handle.is_closed() {
            return None;
        }
        record.rooms.insert(room.clone());
        Some(attach(&record.handle))
    }

    /// Counterpart of [`record_room`](Self::record_room) for leaving.
    pub(crate) fn forget_room<R>(
        &self,
        id: ConnectionId,
        room: &RoomName,
        detach: impl FnOnce() -> R,
    ) -> R {
        match self.connections.get_mut(&id) {
            Some(mut record) => {
                record.rooms.remove(room);
                detach()
            }
            None => detach(),
        }
    }

    /// First step of disconnect: stop delivery, drop the record and the
    /// user-index entry. Returns `None` if the connection was already gone.
    pub fn begin_disconnect(&self, id: ConnectionId) -> Option<DisconnectedConnection> {
        if let Some(record) = self.connections.get(&id) {
            record.handle.close();
        }

        let (_, record) = self.connections.remove(&id)?;
        let user_still_connected = match &record.user_id {
            Some(user_id) => match self.users.entry(user_id.clone()) {
                Entry::Occupied(mut entry) => {
                    entry.get_mut().remove(&id);
                    if entry.get().is_empty() {
                        entry.remove();
                        false
                    } else {
                        true
                    }
                }
                Entry::Vacant(_) => false,
            },
            None => false,
        };

        debug!(
            connection_id = %id,
            user_id = record.user_id.as_ref().map(UserId::as_str).unwrap_or(""),
            rooms = record.rooms.len(),
            "connection removed from registry"
        );

        Some(DisconnectedConnection {
            id,
            user_id: record.user_id,
            rooms: record.rooms.into_iter().collect(),
            connected_at: record.connected_at,
            user_still_connected,
        })
    }
}

fn unknown_connection() -> RelayError {
    RelayError::new(ErrorCode::NotFound, "connection is not registered")
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskhub_common::protocol::events::{ErrorFrame, ServerEvent};

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn ping() -> ServerEvent {
        ServerEvent::Error(ErrorFrame {
            code: "TEST".into(),
            message: "ping".into(),
            retryable: false,
            event: None,
        })
    }

    #[test]
    fn new_connections_start_unbound() {
        let registry = ConnectionRegistry::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.connect(tx);

        assert_eq!(registry.size(), 1);
        assert!(registry.user_for(id).is_none());
        assert_eq!(registry.require_user(id).unwrap_err().code(), ErrorCode::NotBound);
    }

    #[test]
    fn bind_is_idempotent_and_refuses_identity_change() {
        let registry = ConnectionRegistry::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.connect(tx);

        assert_eq!(registry.bind(id, &user("u1")).unwrap(), BindOutcome::Bound);
        assert_eq!(registry.bind(id, &user("u1")).unwrap(), BindOutcome::AlreadyBound);
        assert_eq!(registry.bind(id, &user("u2")).unwrap_err().code(), ErrorCode::AlreadyBound);
        assert_eq!(registry.lookup_connections(&user("u1")).len(), 1);
        assert!(registry.lookup_connections(&user("u2")).is_empty());
    }

    #[test]
    fn one_user_can_bind_many_connections() {
        let registry = ConnectionRegistry::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = registry.connect(tx.clone());
        let second = registry.connect(tx);

        registry.bind(first, &user("u1")).unwrap();
        registry.bind(second, &user("u1")).unwrap();

        let connections = registry.lookup_connections(&user("u1"));
        assert!(connections.contains(&first));
        assert!(connections.contains(&second));
    }

    #[test]
    fn bind_unknown_connection_is_not_found() {
        let registry = ConnectionRegistry::default();
        let error = registry.bind(Uuid::new_v4(), &user("u1")).unwrap_err();
        assert_eq!(error.code(), ErrorCode::NotFound);
    }

    #[test]
    fn begin_disconnect_reports_remaining_connections_once() {
        let registry = ConnectionRegistry::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = registry.connect(tx.clone());
        let second = registry.connect(tx);
        registry.bind(first, &user("u1")).unwrap();
        registry.bind(second, &user("u1")).unwrap();

        let dropped = registry.begin_disconnect(first).unwrap();
        assert!(dropped.user_still_connected);
        assert!(registry.is_user_connected(&user("u1")));

        let dropped = registry.begin_disconnect(second).unwrap();
        assert!(!dropped.user_still_connected);
        assert!(!registry.is_user_connected(&user("u1")));
        assert_eq!(registry.size(), 0);

        assert!(registry.begin_disconnect(second).is_none());
    }

    #[test]
    fn closed_handles_stop_accepting_events() {
        let registry = ConnectionRegistry::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = registry.connect(tx);
        let handle = registry.connections.get(&id).unwrap().handle.clone();

        assert!(registry.send_to(id, ping()));
        assert!(rx.try_recv().is_ok());

        registry.begin_disconnect(id);
        assert!(!handle.send(ping()));
        assert!(!registry.send_to(id, ping()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn record_room_refuses_unknown_connections() {
        let registry = ConnectionRegistry::default();
        let room: RoomName = "task:1".parse().unwrap();
        assert!(registry.record_room(Uuid::new_v4(), &room, |_| ()).is_none());
    }
}
