//! In-memory transport for engine tests.

use std::collections::{HashMap, VecDeque};
use std::future::Future;

use super::{Received, SocketToken, Transport, TransportError, TransportEvent, TransportResult};
use crate::connection::Connection;
use crate::engine::ConnectionId;

/// One scripted reaction to `receive_packet`.
#[derive(Debug)]
pub(crate) enum Step {
    /// Bytes that complete the current packet.
    Packet(Vec<u8>),
    /// Bytes of a packet that is not complete yet.
    Partial(Vec<u8>),
    /// The transport claims a packet of this length without writing it.
    Claim(usize),
    /// The read fails.
    Fail(TransportError),
}

/// Transport that replays scripted steps per connection.
#[derive(Debug, Default)]
pub(crate) struct ScriptedTransport {
    steps: HashMap<ConnectionId, VecDeque<Step>>,
    events: VecDeque<TransportEvent>,
    pub(crate) sent: Vec<(ConnectionId, Vec<u8>)>,
    pub(crate) failing_sends: Vec<ConnectionId>,
    pub(crate) pings: Vec<ConnectionId>,
    pub(crate) failing_pings: Vec<ConnectionId>,
    pub(crate) released: Vec<(ConnectionId, SocketToken)>,
}

impl ScriptedTransport {
    pub(crate) fn push(&mut self, conn: ConnectionId, step: Step) {
        self.steps.entry(conn).or_default().push_back(step);
    }

    pub(crate) fn push_event(&mut self, event: TransportEvent) {
        self.events.push_back(event);
    }
}

impl Transport for ScriptedTransport {
    fn receive_packet(
        &mut self,
        conn: &Connection,
        buffer: &mut [u8],
        pending: &mut usize,
    ) -> TransportResult<Received> {
        let step = self
            .steps
            .get_mut(&conn.id())
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| TransportError::Protocol("nothing scripted".into()))?;

        match step {
            Step::Packet(bytes) => {
                let end = *pending + bytes.len();
                buffer[*pending..end].copy_from_slice(&bytes);
                *pending = 0;
                Ok(Received::Packet { len: end })
            }
            Step::Partial(bytes) => {
                let end = *pending + bytes.len();
                buffer[*pending..end].copy_from_slice(&bytes);
                *pending = end;
                Ok(Received::Incomplete)
            }
            Step::Claim(len) => {
                *pending = 0;
                Ok(Received::Packet { len })
            }
            Step::Fail(e) => Err(e),
        }
    }

    fn next_event(&mut self) -> impl Future<Output = TransportEvent> + Send {
        // Popped on poll, so a dropped future loses nothing.
        async move {
            match self.events.pop_front() {
                Some(event) => event,
                None => std::future::pending().await,
            }
        }
    }

    fn send_packet(&mut self, conn: &Connection, data: &[u8]) -> TransportResult<()> {
        if self.failing_sends.contains(&conn.id()) {
            return Err(std::io::Error::from_raw_os_error(32).into());
        }
        self.sent.push((conn.id(), data.to_vec()));
        Ok(())
    }

    fn send_ping(&mut self, conn: &Connection) -> TransportResult<()> {
        if self.failing_pings.contains(&conn.id()) {
            return Err(TransportError::Closed);
        }
        self.pings.push(conn.id());
        Ok(())
    }

    fn release_socket(&mut self, conn: ConnectionId, socket: SocketToken) {
        self.released.push((conn, socket));
    }
}
