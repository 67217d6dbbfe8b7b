use thiserror::Error;

/// Errors that can occur during relay server operation.
#[derive(Error, Debug)]
pub enum ClajsError {
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A blacklist entry is neither an IP address nor a CIDR range.
    #[error("invalid blacklist entry: {0}")]
    InvalidBlockEntry(String),
    /// Fetching the remote blacklist failed.
    #[error("blacklist fetch failed: {0}")]
    BlacklistFetch(#[from] reqwest::Error),
    /// The remote blacklist document did not have the expected shape.
    #[error("malformed blacklist document: {0}")]
    BlacklistFormat(&'static str),
}
