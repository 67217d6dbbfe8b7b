//! Common types and utilities shared across the CLaJ relay protocol.
//!
//! This crate provides:
//! - Binary frame serialization and parsing ([`frame`])
//! - Room code generation ([`code`])
//! - Protocol constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod code;
pub mod frame;
pub mod types;

pub use frame::{Frame, FrameError};
