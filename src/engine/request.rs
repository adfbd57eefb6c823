//! Cross-thread request gateway.
//!
//! Caller threads never touch protocol state. They post a [`Request`] to the
//! event loop's queue instead; the event loop drains the queue in arrival
//! order and executes each request with exclusive access to the connection.

use tokio::sync::mpsc;
use tracing::trace;

use super::ConnectionId;
use crate::core::{SdgError, SdgResult};

/// Work the event loop performs on behalf of another thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Terminate the connection with state `Closed`.
    Close(ConnectionId),
    /// Send a payload on a connected link.
    Send(ConnectionId, Vec<u8>),
    /// A ping interval changed; recompute timer deadlines.
    RecomputeTimers,
    /// Stop the event loop.
    Shutdown,
}

/// Sending half of the request queue.
///
/// Sending never blocks and wakes the event loop if it is parked waiting for
/// work.
#[derive(Debug, Clone)]
pub struct RequestGateway {
    tx: mpsc::UnboundedSender<Request>,
}

impl RequestGateway {
    /// Create a gateway and the receiving half for the event loop.
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Request>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueue a request.
    pub fn send(&self, request: Request) -> SdgResult<()> {
        trace!(?request, "enqueue request");
        self.tx.send(request).map_err(|_| SdgError::Shutdown)
    }

    /// Whether the event loop has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
