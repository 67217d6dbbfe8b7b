//! CLaJ binary frame serialization and parsing.
//!
//! Each frame is one WebSocket binary message. The first byte identifies the
//! frame type; remaining bytes carry the body.

use thiserror::Error;

/// LINK frame type: pairing control string (`"new"`, a room code, or the
/// relay's code reply).
pub const TYPE_LINK: u8 = 0x01;
/// PAYLOAD frame type: opaque bytes relayed to the other room participant.
pub const TYPE_PAYLOAD: u8 = 0x02;
/// KEEPALIVE frame type: application-level keepalive, never relayed.
pub const TYPE_KEEPALIVE: u8 = 0x03;
/// NOTICE frame type: relay → client human-readable message.
pub const TYPE_NOTICE: u8 = 0x04;

/// Maximum body size in bytes (64 KiB - 1).
pub const MAX_PAYLOAD: usize = 65_535;

/// Maximum total frame size (type byte + max body).
pub const MAX_FRAME_SIZE: usize = 1 + MAX_PAYLOAD;

/// A parsed CLaJ protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Pairing control string.
    Link(String),
    /// Opaque application data.
    Payload(Vec<u8>),
    /// Keepalive with no body.
    KeepAlive,
    /// Human-readable message from the relay.
    Notice(String),
}

/// Errors that can occur during frame parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The input byte slice was empty.
    #[error("frame is empty")]
    Empty,
    /// The frame body exceeds the maximum allowed size.
    #[error("payload too large: max {max}, got {actual}")]
    PayloadTooLarge {
        /// Maximum allowed body size.
        max: usize,
        /// Actual body size received.
        actual: usize,
    },
    /// A LINK or NOTICE body was not valid UTF-8.
    #[error("frame text is not valid utf-8")]
    InvalidUtf8,
    /// The first byte does not match any known frame type.
    #[error("unknown frame type")]
    UnknownType(u8),
}

impl Frame {
    /// Creates a `Link` frame.
    #[must_use]
    pub fn link(text: &str) -> Self {
        Self::Link(text.to_owned())
    }

    /// Creates a `Payload` frame.
    #[must_use]
    pub fn payload(data: &[u8]) -> Self {
        Self::Payload(data.to_vec())
    }

    /// Creates a `KeepAlive` frame.
    #[must_use]
    pub const fn keep_alive() -> Self {
        Self::KeepAlive
    }

    /// Creates a `Notice` frame.
    #[must_use]
    pub fn notice(text: &str) -> Self {
        Self::Notice(text.to_owned())
    }

    /// Serializes this frame into a byte vector for WebSocket transmission.
    ///
    /// # Examples
    ///
    /// ```
    /// use claj_common::frame::{Frame, TYPE_LINK};
    /// let bytes = Frame::link("new").serialize();
    /// assert_eq!(bytes, [TYPE_LINK, b'n', b'e', b'w']);
    /// ```
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Self::Link(text) => tagged(TYPE_LINK, text.as_bytes()),
            Self::Payload(data) => tagged(TYPE_PAYLOAD, data),
            Self::KeepAlive => vec![TYPE_KEEPALIVE],
            Self::Notice(text) => tagged(TYPE_NOTICE, text.as_bytes()),
        }
    }

    /// Parses a byte slice into a typed `Frame`.
    ///
    /// Bytes following a KEEPALIVE type byte are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] if the data is empty, the body is too large,
    /// a text body is not UTF-8, or the type byte is unrecognized.
    ///
    /// # Examples
    ///
    /// ```
    /// use claj_common::frame::Frame;
    /// let frame = Frame::payload(b"\x00\x01 snapshot");
    /// let parsed = Frame::parse(&frame.serialize()).unwrap();
    /// assert_eq!(frame, parsed);
    /// ```
    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        let (&kind, body) = data.split_first().ok_or(FrameError::Empty)?;
        if body.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge {
                max: MAX_PAYLOAD,
                actual: body.len(),
            });
        }
        match kind {
            TYPE_LINK => Ok(Self::Link(utf8(body)?)),
            TYPE_PAYLOAD => Ok(Self::Payload(body.to_vec())),
            TYPE_KEEPALIVE => Ok(Self::KeepAlive),
            TYPE_NOTICE => Ok(Self::Notice(utf8(body)?)),
            t => Err(FrameError::UnknownType(t)),
        }
    }

    /// Returns the wire type byte for this frame.
    #[must_use]
    pub const fn frame_type(&self) -> u8 {
        match self {
            Self::Link(_) => TYPE_LINK,
            Self::Payload(_) => TYPE_PAYLOAD,
            Self::KeepAlive => TYPE_KEEPALIVE,
            Self::Notice(_) => TYPE_NOTICE,
        }
    }

    /// Returns the body length, zero for keepalives.
    #[must_use]
    pub fn body_len(&self) -> usize {
        match self {
            Self::Link(text) | Self::Notice(text) => text.len(),
            Self::Payload(data) => data.len(),
            Self::KeepAlive => 0,
        }
    }
}

fn tagged(kind: u8, body: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(1 + body.len());
    v.push(kind);
    v.extend_from_slice(body);
    v
}

fn utf8(body: &[u8]) -> Result<String, FrameError> {
    String::from_utf8(body.to_vec()).map_err(|_| FrameError::InvalidUtf8)
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_frame() -> impl Strategy<Value = Frame> {
        prop_oneof![
            ".{0,64}".prop_map(Frame::Link),
            prop::collection::vec(any::<u8>(), 0..1024).prop_map(Frame::Payload),
            Just(Frame::KeepAlive),
            ".{0,64}".prop_map(Frame::Notice),
        ]
    }

    proptest! {
        #[test]
        fn serialize_parse_roundtrip(frame in arb_frame()) {
            let parsed = Frame::parse(&frame.serialize()).unwrap();
            prop_assert_eq!(frame, parsed);
        }

        #[test]
        fn first_byte_is_always_frame_type(frame in arb_frame()) {
            prop_assert_eq!(frame.serialize()[0], frame.frame_type());
        }

        #[test]
        fn parse_never_panics(data in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = Frame::parse(&data);
        }
    }
}
