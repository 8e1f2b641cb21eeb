use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::CorrelationId;

/// Events that flow from the session manager to an observer
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A fresh connection attempt is starting
    Connecting,
    /// The relay acknowledged registration
    Registered { public_url: String },
    /// A replay task was spawned for an inbound request
    RequestDispatched {
        id: CorrelationId,
        method: String,
        path: String,
    },
    /// The relay connection was lost
    Disconnected { reason: String },
}

/// Why the session manager stopped for good
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    /// Operator-requested shutdown
    Interrupted,
    /// The anonymous session lifetime elapsed
    Expired,
}

/// Drain session events into the debug log until the session manager drops
/// its sender
pub async fn log_events(mut events: mpsc::Receiver<SessionEvent>) -> usize {
    let mut seen = 0;

    while let Some(event) = events.recv().await {
        seen += 1;
        match event {
            SessionEvent::Connecting => debug!("session: connecting"),
            SessionEvent::Registered { public_url } => {
                debug!("session: registered at {}", public_url)
            }
            SessionEvent::RequestDispatched { id, method, path } => {
                debug!("session: request {} dispatched: {} {}", id, method, path)
            }
            SessionEvent::Disconnected { reason } => debug!("session: disconnected: {}", reason),
        }
    }

    seen
}
