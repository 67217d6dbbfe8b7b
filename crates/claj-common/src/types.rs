//! Protocol constants shared by the relay and its clients.

/// WebSocket subprotocol identifier offered by clients.
/// Bump this on breaking wire-format changes.
pub const PROTOCOL_VERSION: &str = "claj.v1";

/// Link string a client sends to ask the relay for a fresh room.
pub const NEW_ROOM: &str = "new";

/// Reasons carried in the close frame when the relay drops a connection.
pub mod close_reason {
    /// Policy closure: blacklisted address, packet spam, or the room ended.
    pub const CLOSED: &str = "closed";
    /// Protocol misuse: the presented room code is unknown or already paired.
    pub const ERROR: &str = "error";
}
