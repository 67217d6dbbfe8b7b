//! CLaJ relay server: pairs a host with one client under a room code and
//! forwards traffic between them.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Refreshable IP blacklist.
pub mod blacklist;
/// CLI argument parsing and server configuration.
pub mod config;
mod connection;
/// Error types for relay server operations.
pub mod error;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// Per-connection packet spam counter.
pub mod ratelimit;
/// Connection-to-room bindings.
pub mod registry;
/// Rooms, connection handles and close reasons.
pub mod room;
/// Connection event dispatch.
pub mod router;
/// Accept loop and shared server state.
pub mod server;

pub use connection::OUTBOUND_QUEUE;
pub use server::{run, run_with_shutdown, ServerState};
