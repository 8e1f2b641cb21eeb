//! Protocol message types for relay communication.
//!
//! Defines the JSON message format exchanged with the relay:
//! - [`OutgoingMessage`] - registration and responses sent to the relay
//! - [`IncomingMessage`] - registration acknowledgments and replay requests
//!
//! Correlation ids are opaque and round-trip in whatever JSON type the relay
//! used.

mod ids;
mod messages;

pub use ids::*;
pub use messages::*;
