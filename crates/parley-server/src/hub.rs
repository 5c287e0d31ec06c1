//! Registry of live client connections.
//!
//! Each connection owns a bounded outbound queue drained by its writer task.
//! The hub never waits on a queue: a frame that does not fit means the
//! client is too slow, and that connection is closed and deregistered while
//! delivery to everyone else carries on.
//!
//! Lock order is registry first, then a connection's state. No lock is held
//! while deregistering, since deregistration broadcasts `user_left`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use parley_shared::RoomId;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::SessionError;
use crate::events::ServerEvent;
use crate::rooms::{Room, RoomAuthority};

pub type ConnectionId = Uuid;

/// Item queued for a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Serialized JSON, shared between every recipient of a broadcast.
    Text(Bytes),
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser {
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated(SessionUser),
    Subscribed { user: SessionUser, room_id: RoomId },
    Closed,
}

impl SessionState {
    pub fn user(&self) -> Option<&SessionUser> {
        match self {
            SessionState::Authenticated(user) | SessionState::Subscribed { user, .. } => Some(user),
            SessionState::Connecting | SessionState::Closed => None,
        }
    }

    pub fn room(&self) -> Option<RoomId> {
        match self {
            SessionState::Subscribed { room_id, .. } => Some(*room_id),
            _ => None,
        }
    }
}

pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    closed: CancellationToken,
    state: RwLock<SessionState>,
    last_ack: Mutex<Instant>,
}

impl ConnectionHandle {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: Uuid::new_v4(),
            tx,
            closed: CancellationToken::new(),
            state: RwLock::new(SessionState::Connecting),
            last_ack: Mutex::new(Instant::now()),
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state.read().clone()
    }

    pub fn user(&self) -> Option<SessionUser> {
        self.state.read().user().cloned()
    }

    pub fn room(&self) -> Option<RoomId> {
        self.state.read().room()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Cancelled once the connection is closed. Wakes both reader and writer.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Liveness acknowledgement from the client.
    pub fn record_pong(&self) {
        *self.last_ack.lock() = Instant::now();
    }

    pub fn last_ack(&self) -> Instant {
        *self.last_ack.lock()
    }

    fn enqueue(&self, item: Outbound) -> Result<(), TrySendError<Outbound>> {
        self.tx.try_send(item)
    }

    /// Move to `Closed`. Returns the previous state the first time only.
    fn close(&self) -> Option<SessionState> {
        let mut state = self.state.write();
        if *state == SessionState::Closed {
            return None;
        }
        let previous = std::mem::replace(&mut *state, SessionState::Closed);
        self.closed.cancel();
        Some(previous)
    }
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub queue_capacity: usize,
    pub ping_interval: Duration,
    pub liveness_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            ping_interval: Duration::from_secs(54),
            liveness_timeout: Duration::from_secs(60),
        }
    }
}

pub struct ConnectionHub {
    connections: RwLock<HashMap<ConnectionId, Arc<ConnectionHandle>>>,
    rooms: Arc<RoomAuthority>,
    config: HubConfig,
}

impl ConnectionHub {
    pub fn new(rooms: Arc<RoomAuthority>, config: HubConfig) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            rooms,
            config,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Create and register a connection with a fresh bounded queue.
    pub fn open(&self) -> (Arc<ConnectionHandle>, mpsc::Receiver<Outbound>) {
        let (handle, outbound) = ConnectionHandle::new(self.config.queue_capacity);
        let handle = Arc::new(handle);
        self.register(handle.clone());
        (handle, outbound)
    }

    pub fn register(&self, handle: Arc<ConnectionHandle>) {
        let id = handle.id();
        let total = {
            let mut connections = self.connections.write();
            connections.insert(id, handle);
            connections.len()
        };
        debug!(connection = %id, total, "Connection registered");
    }

    /// Remove a connection, close it and tell its room it left. Returns
    /// `false` if the connection was already gone.
    pub fn deregister(&self, id: ConnectionId) -> bool {
        let Some(handle) = self.connections.write().remove(&id) else {
            return false;
        };

        if let Some(SessionState::Subscribed { user, room_id }) = handle.close() {
            self.broadcast(
                room_id,
                &ServerEvent::UserLeft {
                    room_id,
                    user_id: user.user_id,
                    username: user.username,
                },
                Some(id),
            );
        }

        info!(connection = %id, "Connection deregistered");
        true
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.read().get(&id).cloned()
    }

    fn handle(&self, id: ConnectionId) -> Result<Arc<ConnectionHandle>, SessionError> {
        self.get(id).ok_or(SessionError::Closed)
    }

    /// `Connecting` to `Authenticated`.
    pub fn authenticate(&self, id: ConnectionId, user: SessionUser) -> Result<(), SessionError> {
        let handle = self.handle(id)?;
        let mut state = handle.state.write();
        match *state {
            SessionState::Connecting => {
                debug!(connection = %id, user = %user.username, "Connection authenticated");
                *state = SessionState::Authenticated(user);
                Ok(())
            }
            SessionState::Closed => Err(SessionError::Closed),
            _ => Err(SessionError::AlreadyAuthenticated),
        }
    }

    /// Subscribe a connection to a room its user is an unblocked member of.
    /// Switching rooms notifies the previous room as well.
    pub fn join_room(&self, id: ConnectionId, room_id: RoomId) -> Result<Room, SessionError> {
        let handle = self.handle(id)?;
        let user = handle.user().ok_or(SessionError::NotAuthenticated)?;

        let room = self.rooms.get_room(room_id)?;
        let member = room.member(&user.user_id).ok_or(SessionError::NotMember)?;
        if member.is_blocked {
            return Err(SessionError::Blocked);
        }

        let previous = {
            let mut state = handle.state.write();
            if *state == SessionState::Closed {
                return Err(SessionError::Closed);
            }
            let previous = state.room();
            *state = SessionState::Subscribed {
                user: user.clone(),
                room_id,
            };
            previous
        };

        if previous == Some(room_id) {
            return Ok(room);
        }
        if let Some(previous) = previous {
            self.broadcast(previous, &user_left(previous, &user), Some(id));
        }
        self.broadcast(
            room_id,
            &ServerEvent::UserJoined {
                room_id,
                user_id: user.user_id.clone(),
                username: user.username.clone(),
            },
            Some(id),
        );

        info!(connection = %id, room = %room_id, user = %user.username, "Subscribed to room");
        Ok(room)
    }

    /// `Subscribed` back to `Authenticated`. Returns the room left.
    pub fn leave_room(&self, id: ConnectionId) -> Result<RoomId, SessionError> {
        let handle = self.handle(id)?;
        let (user, room_id) = {
            let mut state = handle.state.write();
            let SessionState::Subscribed { user, room_id } = state.clone() else {
                return Err(SessionError::NotInRoom);
            };
            *state = SessionState::Authenticated(user.clone());
            (user, room_id)
        };

        self.broadcast(room_id, &user_left(room_id, &user), Some(id));
        info!(connection = %id, room = %room_id, user = %user.username, "Unsubscribed from room");
        Ok(room_id)
    }

    /// Unsubscribe every connection of `user_id` from `room_id`, telling each
    /// of them with `room_left`. Returns how many were moved.
    pub fn unsubscribe_user(&self, room_id: RoomId, user_id: &str) -> usize {
        let handles: Vec<_> = self.connections.read().values().cloned().collect();
        let mut moved = Vec::new();
        for handle in handles {
            let mut state = handle.state.write();
            if let SessionState::Subscribed { user, room_id: current } = &*state {
                if *current == room_id && user.user_id == user_id {
                    *state = SessionState::Authenticated(user.clone());
                    moved.push(handle.id());
                }
            }
        }
        for id in &moved {
            self.send_to(*id, &ServerEvent::RoomLeft { room_id });
        }
        moved.len()
    }

    /// Serialize `payload` once and queue it for every subscriber of
    /// `room_id` except `exclude`. Returns the number of connections it was
    /// queued for.
    pub fn broadcast<T: Serialize>(
        &self,
        room_id: RoomId,
        payload: &T,
        exclude: Option<ConnectionId>,
    ) -> usize {
        match serde_json::to_vec(payload) {
            Ok(bytes) => self.broadcast_frame(room_id, Bytes::from(bytes), exclude),
            Err(e) => {
                error!(room = %room_id, error = %e, "Failed to serialize broadcast");
                0
            }
        }
    }

    pub fn broadcast_frame(
        &self,
        room_id: RoomId,
        frame: Bytes,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let mut delivered = 0;
        let mut overflowed = Vec::new();
        {
            let connections = self.connections.read();
            for handle in connections.values() {
                if Some(handle.id()) == exclude || handle.room() != Some(room_id) {
                    continue;
                }
                match handle.enqueue(Outbound::Text(frame.clone())) {
                    Ok(()) => delivered += 1,
                    Err(_) => overflowed.push(handle.id()),
                }
            }
        }

        for id in overflowed {
            warn!(connection = %id, room = %room_id, "Outbound queue full, dropping slow connection");
            self.deregister(id);
        }
        delivered
    }

    /// Queue a payload for a single connection.
    pub fn send_to<T: Serialize>(&self, id: ConnectionId, payload: &T) -> bool {
        let Some(handle) = self.get(id) else {
            return false;
        };
        let frame = match serde_json::to_vec(payload) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                error!(connection = %id, error = %e, "Failed to serialize event");
                return false;
            }
        };
        if handle.enqueue(Outbound::Text(frame)).is_err() {
            warn!(connection = %id, "Outbound queue full, dropping slow connection");
            self.deregister(id);
            return false;
        }
        true
    }

    /// Queue a payload for every authenticated session of `username`.
    pub fn send_to_username<T: Serialize>(&self, username: &str, payload: &T) -> usize {
        let targets: Vec<ConnectionId> = self
            .connections
            .read()
            .values()
            .filter(|h| h.user().is_some_and(|u| u.username == username))
            .map(|h| h.id())
            .collect();
        targets
            .into_iter()
            .filter(|id| self.send_to(*id, payload))
            .count()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn subscriber_count(&self, room_id: RoomId) -> usize {
        self.connections
            .read()
            .values()
            .filter(|h| h.room() == Some(room_id))
            .count()
    }

    /// Rooms with at least one subscribed connection.
    pub fn active_rooms(&self) -> Vec<RoomId> {
        let rooms: BTreeSet<RoomId> = self
            .connections
            .read()
            .values()
            .filter_map(|h| h.room())
            .collect();
        rooms.into_iter().collect()
    }

    /// Queue a ping on every connection and close those whose last pong is
    /// older than the liveness timeout. Returns how many were closed.
    pub fn sweep_liveness(&self) -> usize {
        let now = Instant::now();
        let handles: Vec<_> = self.connections.read().values().cloned().collect();

        let mut stale = Vec::new();
        for handle in handles {
            if now.duration_since(handle.last_ack()) > self.config.liveness_timeout {
                stale.push(handle.id());
            } else if handle.enqueue(Outbound::Ping).is_err() {
                stale.push(handle.id());
            }
        }

        for id in &stale {
            info!(connection = %id, "Closing unresponsive connection");
            self.deregister(*id);
        }
        stale.len()
    }

    /// Run [`sweep_liveness`](Self::sweep_liveness) every ping interval
    /// until `shutdown` fires.
    pub fn spawn_liveness(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.ping_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let closed = self.sweep_liveness();
                        if closed > 0 {
                            debug!(closed, remaining = self.connection_count(), "Liveness sweep");
                        }
                    }
                }
            }
        })
    }

    /// Deregister every connection.
    pub fn close_all(&self) {
        let ids: Vec<_> = self.connections.read().keys().copied().collect();
        for id in ids {
            self.deregister(id);
        }
    }
}

fn user_left(room_id: RoomId, user: &SessionUser) -> ServerEvent {
    ServerEvent::UserLeft {
        room_id,
        user_id: user.user_id.clone(),
        username: user.username.clone(),
    }
}

#[cfg(test)]
mod tests {
    use parley_store::MemoryStorage;

    use super::*;

    struct Client {
        handle: Arc<ConnectionHandle>,
        outbound: mpsc::Receiver<Outbound>,
    }

    impl Client {
        fn drain(&mut self) -> Vec<ServerEvent> {
            let mut events = Vec::new();
            while let Ok(item) = self.outbound.try_recv() {
                if let Outbound::Text(bytes) = item {
                    events.push(serde_json::from_slice(&bytes).unwrap());
                }
            }
            events
        }
    }

    fn hub_with(capacity: usize) -> (Arc<ConnectionHub>, Arc<RoomAuthority>) {
        let rooms = Arc::new(RoomAuthority::new(Arc::new(MemoryStorage::new())));
        let hub = Arc::new(ConnectionHub::new(
            rooms.clone(),
            HubConfig {
                queue_capacity: capacity,
                ..HubConfig::default()
            },
        ));
        (hub, rooms)
    }

    /// A room with `n` members, each with one subscribed connection.
    fn subscribed(capacity: usize, n: usize) -> (Arc<ConnectionHub>, Arc<RoomAuthority>, Room, Vec<Client>) {
        let (hub, rooms) = hub_with(capacity);
        let room = rooms.create_room("General", "", false, "u0", "user0", "k0").unwrap();
        let mut clients = Vec::new();
        for i in 0..n {
            if i > 0 {
                rooms
                    .join_by_invite(&room.invite_code, &format!("u{i}"), &format!("user{i}"), "k")
                    .unwrap();
            }
            let (handle, outbound) = hub.open();
            hub.authenticate(
                handle.id(),
                SessionUser {
                    user_id: format!("u{i}"),
                    username: format!("user{i}"),
                },
            )
            .unwrap();
            hub.join_room(handle.id(), room.id).unwrap();
            clients.push(Client { handle, outbound });
            for client in &mut clients {
                client.drain();
            }
        }
        (hub, rooms, room, clients)
    }

    #[test]
    fn broadcast_skips_the_excluded_connection() {
        let (hub, _rooms, room, mut clients) = subscribed(16, 5);
        let excluded = clients[2].handle.id();

        let delivered = hub.broadcast(room.id, &ServerEvent::RoomLeft { room_id: room.id }, Some(excluded));
        assert_eq!(delivered, 4);
        for client in &mut clients {
            let got = client.drain().len();
            assert_eq!(got, usize::from(client.handle.id() != excluded));
        }
    }

    #[test]
    fn broadcast_only_reaches_the_room() {
        let (hub, rooms, room, mut clients) = subscribed(16, 2);
        let other = rooms.create_room("Other", "", false, "u0", "user0", "k0").unwrap();
        hub.join_room(clients[0].handle.id(), other.id).unwrap();
        clients[1].drain();

        assert_eq!(hub.broadcast(room.id, &"ping", None), 1);
        assert!(clients[0].drain().is_empty());
        assert_eq!(clients[1].drain().len(), 1);
        assert_eq!(hub.active_rooms().len(), 2);
    }

    #[test]
    fn slow_consumer_is_evicted_without_stalling_others() {
        let capacity = 8;
        let (hub, _rooms, room, mut clients) = subscribed(capacity, 21);
        let mut slow = clients.remove(0);
        let slow_id = slow.handle.id();

        let rounds = 50;
        for i in 0..rounds {
            let delivered = hub.broadcast(room.id, &format!("m{i}"), None);
            assert!(delivered >= clients.len());
            for fast in &mut clients {
                let got = fast.drain();
                assert!(!got.is_empty());
            }
        }

        assert!(hub.get(slow_id).is_none());
        assert!(slow.handle.is_closed());
        assert_eq!(hub.subscriber_count(room.id), 20);
        // The slow client got exactly what fit in its queue, then nothing.
        let mut buffered = 0;
        while slow.outbound.try_recv().is_ok() {
            buffered += 1;
        }
        assert_eq!(buffered, capacity);
    }

    #[test]
    fn deregister_is_idempotent_and_notifies_the_room() {
        let (hub, _rooms, room, mut clients) = subscribed(16, 3);
        let leaving = clients[0].handle.id();

        assert!(hub.deregister(leaving));
        assert!(!hub.deregister(leaving));
        assert!(clients[0].handle.is_closed());
        assert_eq!(clients[0].handle.state(), SessionState::Closed);

        for client in &mut clients[1..] {
            let events = client.drain();
            assert_eq!(events.len(), 1);
            assert!(matches!(
                &events[0],
                ServerEvent::UserLeft { room_id, user_id, .. } if *room_id == room.id && user_id == "u0"
            ));
        }
        assert_eq!(hub.connection_count(), 2);
    }

    #[test]
    fn state_machine_guards_transitions() {
        let (hub, rooms) = hub_with(4);
        let room = rooms.create_room("General", "", false, "u1", "alice", "k1").unwrap();
        let (handle, _outbound) = hub.open();
        let id = handle.id();
        let alice = SessionUser {
            user_id: "u1".into(),
            username: "alice".into(),
        };

        assert!(matches!(hub.join_room(id, room.id), Err(SessionError::NotAuthenticated)));
        hub.authenticate(id, alice.clone()).unwrap();
        assert!(matches!(
            hub.authenticate(id, alice.clone()),
            Err(SessionError::AlreadyAuthenticated)
        ));
        assert!(matches!(hub.leave_room(id), Err(SessionError::NotInRoom)));

        hub.join_room(id, room.id).unwrap();
        assert_eq!(handle.room(), Some(room.id));
        assert_eq!(hub.leave_room(id).unwrap(), room.id);
        assert_eq!(handle.state(), SessionState::Authenticated(alice));

        hub.deregister(id);
        assert!(matches!(hub.join_room(id, room.id), Err(SessionError::Closed)));
    }

    #[test]
    fn join_requires_unblocked_membership() {
        let (hub, rooms) = hub_with(4);
        let room = rooms.create_room("General", "", false, "u1", "alice", "k1").unwrap();
        let (handle, _outbound) = hub.open();
        hub.authenticate(
            handle.id(),
            SessionUser {
                user_id: "u2".into(),
                username: "bob".into(),
            },
        )
        .unwrap();

        assert!(matches!(hub.join_room(handle.id(), room.id), Err(SessionError::NotMember)));
        assert!(matches!(
            hub.join_room(handle.id(), RoomId::new()),
            Err(SessionError::Room(_))
        ));

        rooms.join_by_invite(&room.invite_code, "u2", "bob", "k2").unwrap();
        rooms.set_blocked(room.id, "u2", true).unwrap();
        assert!(matches!(hub.join_room(handle.id(), room.id), Err(SessionError::Blocked)));
    }

    #[test]
    fn unsubscribe_user_moves_every_session() {
        let (hub, _rooms, room, mut clients) = subscribed(16, 2);
        // Second session of user1.
        let (extra, mut extra_rx) = hub.open();
        hub.authenticate(
            extra.id(),
            SessionUser {
                user_id: "u1".into(),
                username: "user1".into(),
            },
        )
        .unwrap();
        hub.join_room(extra.id(), room.id).unwrap();
        clients[0].drain();
        clients[1].drain();

        assert_eq!(hub.unsubscribe_user(room.id, "u1"), 2);
        assert_eq!(hub.subscriber_count(room.id), 1);
        assert!(matches!(clients[1].drain().as_slice(), [ServerEvent::RoomLeft { .. }]));
        assert!(matches!(extra_rx.try_recv(), Ok(Outbound::Text(_))));
        assert_eq!(hub.send_to_username("user1", &"hi"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_sweep_closes_silent_connections() {
        let (hub, _rooms) = hub_with(4);
        let (quiet, _quiet_rx) = hub.open();
        let (chatty, mut chatty_rx) = hub.open();

        assert_eq!(hub.sweep_liveness(), 0);
        assert!(matches!(chatty_rx.try_recv(), Ok(Outbound::Ping)));

        tokio::time::advance(Duration::from_secs(40)).await;
        chatty.record_pong();
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(hub.sweep_liveness(), 1);
        assert!(quiet.is_closed());
        assert!(!chatty.is_closed());
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_task_stops_on_shutdown() {
        let (hub, _rooms) = hub_with(4);
        let (handle, _rx) = hub.open();
        let shutdown = CancellationToken::new();
        let task = hub.clone().spawn_liveness(shutdown.clone());

        tokio::time::sleep(Duration::from_secs(130)).await;
        assert!(handle.is_closed());

        shutdown.cancel();
        task.await.unwrap();
    }
}
