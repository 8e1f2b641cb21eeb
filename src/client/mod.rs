//! Tunnel client implementation.
//!
//! This module provides the core tunnel functionality:
//! - [`TunnelClient`] - session manager that owns the relay connection
//! - HTTP replay of relay requests against the local service
//! - Encoding of local responses back onto the wire

mod connection;
mod encoder;
mod events;
mod http_proxy;

#[cfg(test)]
mod test_support;

pub use connection::{SessionTimings, TunnelClient};
pub use events::{log_events, SessionExit};
