use claj_common::frame::Frame;
use claj_common::types::close_reason;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};

/// Process-unique identity of one accepted socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why the relay closed a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Policy closure: blacklisted address, packet spam, or room teardown.
    Closed,
    /// Protocol misuse: unknown or already-paired room code.
    Error,
}

impl CloseReason {
    /// Reason text carried in the WebSocket close frame.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => close_reason::CLOSED,
            Self::Error => close_reason::ERROR,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a connection went away, as seen by the connection task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The relay closed it.
    Kicked(CloseReason),
    /// The remote sent a close frame or the stream ended.
    Closed,
    /// No inbound traffic within the idle timeout.
    Timeout,
    /// Transport or framing error.
    Error,
    /// The server is shutting down.
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kicked(reason) => write!(f, "kicked ({reason})"),
            Self::Closed => f.write_str("closed"),
            Self::Timeout => f.write_str("timeout"),
            Self::Error => f.write_str("error"),
            Self::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Handle to a live connection, used to push frames to its task or close it.
///
/// The connection task owns the socket; handles only reach it through a
/// bounded queue and a close signal, so every operation here is
/// non-blocking and harmless once the task has gone.
#[derive(Clone, Debug)]
pub struct ConnHandle {
    /// Stable identity for the lifetime of the socket.
    pub id: ConnId,
    /// Remote socket address.
    pub addr: SocketAddr,
    tx: mpsc::Sender<Vec<u8>>,
    close_tx: Arc<watch::Sender<Option<CloseReason>>>,
}

/// Task-side ends of a [`ConnHandle`].
#[derive(Debug)]
pub struct ConnReceivers {
    /// Serialized frames to write to the socket.
    pub frames: mpsc::Receiver<Vec<u8>>,
    /// Close requests from the relay.
    pub close: watch::Receiver<Option<CloseReason>>,
}

impl ConnHandle {
    /// Create a handle with an outbound queue of `capacity` frames.
    #[must_use]
    pub fn new(id: ConnId, addr: SocketAddr, capacity: usize) -> (Self, ConnReceivers) {
        let (tx, frames) = mpsc::channel(capacity);
        let (close_tx, close) = watch::channel(None);
        let handle = Self {
            id,
            addr,
            tx,
            close_tx: Arc::new(close_tx),
        };
        (handle, ConnReceivers { frames, close })
    }

    /// Queue raw frame bytes. Returns `false` if the queue is full or the
    /// connection is gone.
    pub fn send_raw(&self, bytes: Vec<u8>) -> bool {
        match self.tx.try_send(bytes) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(conn = %self.id, "outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a frame.
    pub fn send(&self, frame: &Frame) -> bool {
        self.send_raw(frame.serialize())
    }

    /// Ask the connection task to close the socket with `reason`.
    /// The first reason wins.
    pub fn close(&self, reason: CloseReason) {
        self.close_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    /// Reason passed to [`ConnHandle::close`], if any.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_tx.borrow()
    }
}

/// Result of relaying one message through a room.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Queued for the other participant.
    Delivered,
    /// The room is still open; nobody to deliver to.
    NoRecipient,
    /// The other participant's queue was full or closed.
    Dropped,
}

/// One relay session: a host and, once paired, a peer.
#[derive(Debug)]
pub struct Room {
    code: String,
    host: ConnHandle,
    peer: Option<ConnHandle>,
    last_warned_at: Option<Instant>,
}

impl Room {
    /// Open a room for `host` under `code`.
    #[must_use]
    pub fn create(host: ConnHandle, code: String) -> Self {
        Self {
            code,
            host,
            peer: None,
            last_warned_at: None,
        }
    }

    /// The room code.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The connection that created the room.
    #[must_use]
    pub fn host(&self) -> &ConnHandle {
        &self.host
    }

    /// The connection that joined, if paired.
    #[must_use]
    pub fn peer(&self) -> Option<&ConnHandle> {
        self.peer.as_ref()
    }

    /// `true` while no peer has joined.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.peer.is_none()
    }

    /// `true` if `id` is the host.
    #[must_use]
    pub fn is_host(&self, id: ConnId) -> bool {
        self.host.id == id
    }

    /// Bind the peer. The registry only hands out open rooms, so this is
    /// never called on a paired room.
    pub fn join(&mut self, peer: ConnHandle) {
        debug_assert!(self.peer.is_none(), "join on a paired room");
        self.peer = Some(peer);
    }

    /// Forward `bytes` unmodified to whichever participant is not `from`.
    pub fn relay(&self, from: ConnId, bytes: Vec<u8>) -> RelayOutcome {
        let Some(peer) = &self.peer else {
            return RelayOutcome::NoRecipient;
        };
        let receiver = if from == self.host.id { peer } else { &self.host };
        if receiver.send_raw(bytes) {
            RelayOutcome::Delivered
        } else {
            RelayOutcome::Dropped
        }
    }

    /// Grant the host spam grace if `grace` has passed since the last one.
    /// Returns `true` and records `now` when granted.
    pub fn try_grant_grace(&mut self, now: Instant, grace: std::time::Duration) -> bool {
        let eligible = self
            .last_warned_at
            .map_or(true, |at| now.saturating_duration_since(at) >= grace);
        if eligible {
            self.last_warned_at = Some(now);
        }
        eligible
    }

    /// When the host was last granted spam grace.
    #[must_use]
    pub fn last_warned_at(&self) -> Option<Instant> {
        self.last_warned_at
    }

    /// Best-effort notice to both participants.
    pub fn send_message(&self, text: &str) {
        let bytes = Frame::notice(text).serialize();
        self.host.send_raw(bytes.clone());
        if let Some(peer) = &self.peer {
            peer.send_raw(bytes);
        }
    }

    /// Notify and close whoever is left after `gone` disconnected.
    ///
    /// Must run after the room has been removed from the registry. When the
    /// room ended over packet spam the survivor already got the spam notice.
    pub fn teardown(self, gone: ConnId, reason: DisconnectReason, spam: bool) {
        let (survivor, role) = if gone == self.host.id {
            (self.peer, "host")
        } else {
            (Some(self.host), "client")
        };
        tracing::debug!(code = %self.code, conn = %gone, %reason, "tearing down room");
        let Some(survivor) = survivor else {
            return;
        };
        if !spam {
            survivor.send(&Frame::notice(&format!(
                "\u{26A0} Room {} closed: the {} disconnected.",
                self.code, role
            )));
        }
        survivor.close(CloseReason::Closed);
    }
}
