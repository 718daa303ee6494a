// A user-space L4 TCP/UDP forwarding relay.

#![recursion_limit = "256"]

pub mod access;
pub mod config;
pub mod engine;
pub mod rule;
pub mod server;
pub mod sinks;
pub mod telemetry;
pub mod utils;

// Re-export commonly used types
pub use utils::error::{RelayError, Result};
