use crate::blacklist::Blacklist;
use crate::config::ServerConfig;
use crate::metrics::{counters, gauges};
use crate::ratelimit::RateTracker;
use crate::registry::Registry;
use crate::room::{CloseReason, ConnHandle, ConnId, DisconnectReason, RelayOutcome};
use claj_common::frame::Frame;
use claj_common::types::NEW_ROOM;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Packet spam limits applied to every connection.
#[derive(Debug, Clone, Copy)]
pub struct SpamPolicy {
    /// Length of one counting window.
    pub window: Duration,
    /// Packets allowed per window.
    pub limit: u32,
    /// Minimum time between two pardons for the same host.
    pub host_grace: Duration,
}

impl Default for SpamPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(3000),
            limit: 300,
            host_grace: Duration::from_secs(60),
        }
    }
}

impl From<&ServerConfig> for SpamPolicy {
    fn from(config: &ServerConfig) -> Self {
        Self {
            window: config.spam_window(),
            limit: config.spam_limit,
            host_grace: config.host_grace(),
        }
    }
}

#[derive(Debug, Default)]
struct Session {
    rate: RateTracker,
    kicked_for_spam: bool,
}

/// Turns connection events into registry and room operations.
///
/// Connection tasks call in here from many threads at once. Per-connection
/// rate state lives in a sharded side table; room state lives behind the
/// registry lock. The two are never held together.
pub struct EventRouter {
    registry: Registry,
    sessions: DashMap<ConnId, Session>,
    blacklist: Arc<Blacklist>,
    policy: SpamPolicy,
}

impl EventRouter {
    /// Create a router with an empty registry.
    #[must_use]
    pub fn new(blacklist: Arc<Blacklist>, policy: SpamPolicy) -> Self {
        Self {
            registry: Registry::new(),
            sessions: DashMap::new(),
            blacklist,
            policy,
        }
    }

    /// Room registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Number of connections currently tracked.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// A socket has been accepted. Returns `false` if it was refused.
    pub fn on_connect(&self, conn: &ConnHandle) -> bool {
        if self.blacklist.contains(conn.addr.ip()) {
            warn!(conn = %conn.id, addr = %conn.addr, "connection rejected: address is blacklisted");
            counters::kicks_total("blacklist");
            conn.close(CloseReason::Closed);
            return false;
        }
        self.sessions.insert(conn.id, Session::default());
        true
    }

    /// A complete frame arrived from `conn`.
    pub fn on_message(&self, conn: &ConnHandle, frame: Frame) {
        self.on_message_at(conn, frame, Instant::now());
    }

    /// [`EventRouter::on_message`] with an explicit arrival time.
    pub fn on_message_at(&self, conn: &ConnHandle, frame: Frame, now: Instant) {
        let allowed = match self.sessions.get_mut(&conn.id) {
            Some(session) if session.kicked_for_spam => {
                // close already requested; nothing more from this socket counts
                return;
            }
            Some(mut session) => {
                let ok = session
                    .rate
                    .allow_at(now, self.policy.window, self.policy.limit);
                if !ok {
                    session.rate.penalize(self.policy.limit);
                }
                ok
            }
            None => {
                debug!(conn = %conn.id, "message from untracked connection");
                return;
            }
        };
        if !allowed {
            self.on_spam(conn, now);
            return;
        }

        match frame {
            Frame::KeepAlive => {}
            Frame::Link(link) if link == NEW_ROOM => self.create_room(conn),
            Frame::Link(code) => self.join_room(conn, &code),
            Frame::Notice(_) => {
                debug!(conn = %conn.id, "dropping notice sent by a client");
                counters::messages_dropped_total("client_notice");
            }
            other => self.relay(conn, &other),
        }
    }

    /// `conn` is gone. Tears down the room it was bound to, if any.
    pub fn on_disconnect(&self, conn: &ConnHandle, reason: DisconnectReason) {
        let spam = self
            .sessions
            .remove(&conn.id)
            .is_some_and(|(_, session)| session.kicked_for_spam);
        let Some(room) = self.registry.close_room(conn.id) else {
            return;
        };
        info!(conn = %conn.id, code = room.code(), %reason, "room closed");
        gauges::set_rooms_active(self.registry.room_count());
        room.teardown(conn.id, reason, spam);
    }

    fn on_spam(&self, conn: &ConnHandle, now: Instant) {
        let pardoned = self.registry.with_room(conn.id, |room| {
            if room.is_host(conn.id) && room.try_grant_grace(now, self.policy.host_grace) {
                return true;
            }
            room.send_message(&format!(
                "\u{26A0} Room {} closed due to packet spam.",
                room.code()
            ));
            false
        });
        if pardoned == Some(true) {
            warn!(conn = %conn.id, "host spammed with packets but was not disconnected");
            counters::messages_dropped_total("spam");
            return;
        }

        warn!(conn = %conn.id, addr = %conn.addr, "disconnected due to packet spam");
        if let Some(mut session) = self.sessions.get_mut(&conn.id) {
            session.kicked_for_spam = true;
        }
        counters::kicks_total("spam");
        conn.close(CloseReason::Closed);
    }

    fn create_room(&self, conn: &ConnHandle) {
        let (_, code) = self.registry.create_room(conn.clone());
        conn.send(&Frame::link(&code));
        info!(conn = %conn.id, code = %code, "room created");
        counters::rooms_created_total();
        gauges::set_rooms_active(self.registry.room_count());
    }

    fn join_room(&self, conn: &ConnHandle, code: &str) {
        if self.registry.join(code, conn.clone()).is_some() {
            info!(conn = %conn.id, code, "connection joined room");
            counters::joins_total("joined");
            // rebinding may have collected a room the joiner was hosting
            gauges::set_rooms_active(self.registry.room_count());
        } else {
            debug!(conn = %conn.id, code, "no joinable room with that code");
            counters::joins_total("not_found");
            conn.close(CloseReason::Error);
        }
    }

    fn relay(&self, conn: &ConnHandle, frame: &Frame) {
        let len = frame.body_len();
        let outcome = self
            .registry
            .with_room(conn.id, |room| room.relay(conn.id, frame.serialize()));
        match outcome {
            Some(RelayOutcome::Delivered) => {
                counters::messages_relayed_total();
                counters::payload_bytes_total(len as u64);
            }
            Some(RelayOutcome::NoRecipient) => counters::messages_dropped_total("no_peer"),
            Some(RelayOutcome::Dropped) => counters::messages_dropped_total("queue_full"),
            None => counters::messages_dropped_total("unbound"),
        }
    }
}
