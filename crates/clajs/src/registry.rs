use crate::room::{ConnHandle, ConnId, Room};
use claj_common::code::generate_code;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Arena slot of a room. Allocated in increasing order, so iterating the
/// arena visits rooms in creation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(u64);

#[derive(Debug, Default)]
struct Inner {
    rooms: BTreeMap<RoomId, Room>,
    bindings: HashMap<ConnId, RoomId>,
    next_id: u64,
}

impl Inner {
    fn insert(&mut self, room: Room) -> RoomId {
        let id = RoomId(self.next_id);
        self.next_id += 1;
        self.rooms.insert(id, room);
        id
    }

    /// Bind `conn` to `room`, dropping whatever room it was bound to before
    /// if nothing else references it.
    fn register(&mut self, conn: ConnId, room: RoomId) {
        if let Some(old) = self.bindings.insert(conn, room) {
            if old != room {
                self.collect(old);
            }
        }
    }

    fn release(&mut self, conn: ConnId) {
        if let Some(old) = self.bindings.remove(&conn) {
            self.collect(old);
        }
    }

    fn collect(&mut self, room: RoomId) {
        if !self.bindings.values().any(|bound| *bound == room) {
            self.rooms.remove(&room);
        }
    }

    fn find_open(&self, code: &str) -> Option<RoomId> {
        self.rooms
            .iter()
            .find(|(_, room)| room.is_open() && room.code() == code)
            .map(|(id, _)| *id)
    }
}

/// Connection → room bindings and the rooms themselves, behind one lock.
///
/// Every compound operation (create, join, close) runs under a single lock
/// acquisition, so no caller can observe a room half-joined or
/// half-torn-down.
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a room to the arena without binding anyone to it.
    #[cfg(test)]
    pub(crate) fn insert(&self, room: Room) -> RoomId {
        self.lock().insert(room)
    }

    /// Bind `conn` to `room`, overwriting any previous binding.
    pub fn register(&self, conn: ConnId, room: RoomId) {
        self.lock().register(conn, room);
    }

    /// Room bound to `conn`.
    #[must_use]
    pub fn lookup(&self, conn: ConnId) -> Option<RoomId> {
        self.lock().bindings.get(&conn).copied()
    }

    /// First open room (in creation order) whose code is `code`.
    #[must_use]
    pub fn find_open_room_by_code(&self, code: &str) -> Option<RoomId> {
        self.lock().find_open(code)
    }

    /// Remove the binding for `conn`.
    pub fn release(&self, conn: ConnId) {
        self.lock().release(conn);
    }

    /// Open a room for `host` under a fresh code and bind the host to it.
    pub fn create_room(&self, host: ConnHandle) -> (RoomId, String) {
        let code = generate_code();
        let conn = host.id;
        let mut inner = self.lock();
        let id = inner.insert(Room::create(host, code.clone()));
        inner.register(conn, id);
        (id, code)
    }

    /// Bind `peer` to the open room holding `code`.
    ///
    /// Returns `None` if no open room has that code, including rooms that
    /// are already paired, or if `peer` is the room's own host.
    pub fn join(&self, code: &str, peer: ConnHandle) -> Option<RoomId> {
        let conn = peer.id;
        let mut inner = self.lock();
        let id = inner.find_open(code)?;
        let room = inner.rooms.get_mut(&id)?;
        if room.is_host(conn) {
            return None;
        }
        room.join(peer);
        inner.register(conn, id);
        Some(id)
    }

    /// Run `f` against the room bound to `conn`.
    pub fn with_room<R>(&self, conn: ConnId, f: impl FnOnce(&mut Room) -> R) -> Option<R> {
        let mut inner = self.lock();
        let id = *inner.bindings.get(&conn)?;
        inner.rooms.get_mut(&id).map(f)
    }

    /// Remove the room bound to `conn` together with its host and peer
    /// bindings, handing the room back for teardown.
    pub fn close_room(&self, conn: ConnId) -> Option<Room> {
        let mut inner = self.lock();
        let id = *inner.bindings.get(&conn)?;
        let room = inner.rooms.remove(&id)?;
        inner.bindings.remove(&conn);
        if inner.bindings.get(&room.host().id) == Some(&id) {
            inner.bindings.remove(&room.host().id);
        }
        if let Some(peer) = room.peer() {
            if inner.bindings.get(&peer.id) == Some(&id) {
                inner.bindings.remove(&peer.id);
            }
        }
        Some(room)
    }

    /// Number of rooms in the arena.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.lock().rooms.len()
    }

    /// Number of rooms still waiting for a peer.
    #[must_use]
    pub fn open_room_count(&self) -> usize {
        self.lock().rooms.values().filter(|room| room.is_open()).count()
    }

    /// Number of connection bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().bindings.len()
    }

    /// Returns `true` if no connection is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::tests::make_conn;
    use claj_common::code::is_well_formed_code;

    #[test]
    fn create_room_binds_host() {
        let registry = Registry::new();
        let (host, _rx) = make_conn(1);

        let (id, code) = registry.create_room(host);
        assert!(is_well_formed_code(&code));
        assert_eq!(registry.lookup(ConnId(1)), Some(id));
        assert_eq!(registry.find_open_room_by_code(&code), Some(id));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.open_room_count(), 1);
    }

    #[test]
    fn lookup_on_unbound_conn_returns_none() {
        let registry = Registry::new();
        assert!(registry.lookup(ConnId(9)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn join_pairs_and_hides_code() {
        let registry = Registry::new();
        let (host, _h) = make_conn(1);
        let (peer, _p) = make_conn(2);
        let (late, _l) = make_conn(3);

        let (id, code) = registry.create_room(host);
        assert_eq!(registry.join(&code, peer), Some(id));
        assert_eq!(registry.lookup(ConnId(2)), Some(id));
        assert!(registry.find_open_room_by_code(&code).is_none());
        assert!(registry.join(&code, late).is_none());
        assert!(registry.lookup(ConnId(3)).is_none());
        assert_eq!(registry.open_room_count(), 0);
    }

    #[test]
    fn join_with_unknown_code_fails() {
        let registry = Registry::new();
        let (peer, _p) = make_conn(2);
        assert!(registry.join("CLaJnope", peer).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn find_returns_first_match_in_creation_order() {
        let registry = Registry::new();
        let (a, _a) = make_conn(1);
        let (b, _b) = make_conn(2);
        let first = registry.insert(Room::create(a, "CLaJdup".into()));
        registry.register(ConnId(1), first);
        let second = registry.insert(Room::create(b, "CLaJdup".into()));
        registry.register(ConnId(2), second);

        assert_eq!(registry.find_open_room_by_code("CLaJdup"), Some(first));
    }

    #[test]
    fn close_room_removes_both_bindings() {
        let registry = Registry::new();
        let (host, _h) = make_conn(1);
        let (peer, _p) = make_conn(2);
        let (_, code) = registry.create_room(host);
        registry.join(&code, peer);

        let room = registry.close_room(ConnId(1)).unwrap();
        assert_eq!(room.code(), code);
        assert!(registry.lookup(ConnId(1)).is_none());
        assert!(registry.lookup(ConnId(2)).is_none());
        assert!(registry.find_open_room_by_code(&code).is_none());
        assert_eq!(registry.room_count(), 0);
        assert!(registry.close_room(ConnId(2)).is_none());
    }

    #[test]
    fn close_room_from_peer_side() {
        let registry = Registry::new();
        let (host, _h) = make_conn(1);
        let (peer, _p) = make_conn(2);
        let (_, code) = registry.create_room(host);
        registry.join(&code, peer);

        assert!(registry.close_room(ConnId(2)).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn rebinding_host_collects_abandoned_open_room() {
        let registry = Registry::new();
        let (host, _h) = make_conn(1);
        let (_, first_code) = registry.create_room(host.clone());
        let (second, _) = registry.create_room(host);

        assert!(registry.find_open_room_by_code(&first_code).is_none());
        assert_eq!(registry.lookup(ConnId(1)), Some(second));
        assert_eq!(registry.room_count(), 1);
    }

    #[test]
    fn release_drops_binding_and_unreferenced_room() {
        let registry = Registry::new();
        let (host, _h) = make_conn(1);
        let (_, code) = registry.create_room(host);
        registry.release(ConnId(1));
        assert!(registry.lookup(ConnId(1)).is_none());
        assert!(registry.find_open_room_by_code(&code).is_none());
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn with_room_runs_against_bound_room() {
        let registry = Registry::new();
        let (host, _h) = make_conn(1);
        let (_, code) = registry.create_room(host);
        let seen = registry.with_room(ConnId(1), |room| room.code().to_string());
        assert_eq!(seen, Some(code));
        assert!(registry.with_room(ConnId(5), |_| ()).is_none());
    }

    #[test]
    fn host_joining_own_code_is_refused() {
        let registry = Registry::new();
        let (host, _h) = make_conn(1);
        let (id, code) = registry.create_room(host.clone());

        assert!(registry.join(&code, host).is_none());
        assert_eq!(registry.lookup(ConnId(1)), Some(id));
        assert_eq!(registry.find_open_room_by_code(&code), Some(id));
    }
}
