//! Interfaces the core consumes from the transport.

use std::fmt;
use std::future::Future;

use super::error::{TransportError, TransportResult};
use crate::connection::Connection;
use crate::crypto::PeerId;
use crate::engine::ConnectionId;

/// Opaque handle of a physical socket owned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketToken(pub u64);

impl fmt::Display for SocketToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock#{}", self.0)
    }
}

/// Outcome of one [`Transport::receive_packet`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// More bytes are needed before a packet is complete.
    Incomplete,
    /// A packet was decrypted in place; the plaintext is `buffer[..len]`.
    Packet {
        /// Plaintext length.
        len: usize,
    },
}

/// Something the transport noticed on one of its sockets.
#[derive(Debug)]
pub enum TransportEvent {
    /// The connection's socket has data to read.
    Readable(ConnectionId),
    /// The handshake finished; the remote end proved it owns `PeerId`.
    HandshakeDone(ConnectionId, PeerId),
    /// The socket failed outside a read or a send.
    Failed(ConnectionId, TransportError),
}

impl TransportEvent {
    /// Connection the event is about.
    pub fn connection(&self) -> ConnectionId {
        match self {
            Self::Readable(id) | Self::HandshakeDone(id, _) | Self::Failed(id, _) => *id,
        }
    }
}

/// Socket framing and decryption, driven by the event loop.
///
/// Every method runs on the event-processing thread.
pub trait Transport: Send {
    /// Read from the connection's socket into `buffer`.
    ///
    /// `pending` counts bytes of a partial packet already sitting in
    /// `buffer`; it is preserved across calls until a packet completes.
    fn receive_packet(
        &mut self,
        conn: &Connection,
        buffer: &mut [u8],
        pending: &mut usize,
    ) -> TransportResult<Received>;

    /// Wait for the next readiness or handshake event.
    ///
    /// Raced against the request queue in [`EventLoop::run`], so the future
    /// must be cancel safe: dropping it before it completes must not lose
    /// an event. A transport with nothing to report never completes.
    ///
    /// [`EventLoop::run`]: crate::engine::EventLoop::run
    fn next_event(&mut self) -> impl Future<Output = TransportEvent> + Send;

    /// Frame, encrypt and write one payload.
    fn send_packet(&mut self, conn: &Connection, data: &[u8]) -> TransportResult<()>;

    /// Send a keep-alive on a connected link.
    fn send_ping(&mut self, conn: &Connection) -> TransportResult<()>;

    /// Close a socket the core no longer needs.
    fn release_socket(&mut self, conn: ConnectionId, socket: SocketToken);
}
