//! The event-processing core.
//!
//! [`EventLoop`] is the only owner of connection protocol state. It is not
//! `Clone` and all its mutating methods take `&mut self`, so whoever holds it
//! is by construction the single event-processing thread. Other threads reach
//! it exclusively through the [`RequestGateway`](super::RequestGateway).
//!
//! Readiness polling is the transport's business. [`EventLoop::run`] races
//! the request queue against [`Transport::next_event`] and the ping timer,
//! and routes each [`TransportEvent`] to [`EventLoop::on_readable`],
//! [`EventLoop::complete_handshake`] or [`EventLoop::fail`]. A caller that
//! drives the loop by hand does the same through
//! [`EventLoop::handle_event`] and [`EventLoop::process_pending`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use super::{ConnectionId, Request};
use crate::client::Shared;
use crate::connection::{ConnectGuard, Connection, ConnectionState, Mode};
use crate::core::{ErrorKind, SdgError, SdgResult};
use crate::crypto::PeerId;
use crate::transport::{Received, SocketToken, Transport, TransportError, TransportEvent};

/// Single-threaded owner of all connection protocol state.
pub struct EventLoop<T> {
    pub(super) shared: Arc<Shared>,
    requests: mpsc::UnboundedReceiver<Request>,
    pub(super) transport: T,
    ping_deadline: Option<Instant>,
    stopped: bool,
}

impl<T: Transport> EventLoop<T> {
    pub(crate) fn new(
        shared: Arc<Shared>,
        requests: mpsc::UnboundedReceiver<Request>,
        transport: T,
    ) -> Self {
        Self {
            shared,
            requests,
            transport,
            ping_deadline: None,
            stopped: false,
        }
    }

    /// The transport this loop drives.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable access to the transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Look up a live connection.
    pub fn connection(&self, id: ConnectionId) -> SdgResult<Connection> {
        self.shared
            .registry
            .get(id)
            .map(|inner| Connection::from_parts(inner, self.shared.clone()))
            .ok_or(SdgError::UnknownConnection(id))
    }

    /// Whether a shutdown request has been processed.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    // -------------------------------------------------------------------------
    // Request queue
    // -------------------------------------------------------------------------

    /// Execute every request queued so far, in arrival order.
    ///
    /// Returns the number of requests taken off the queue.
    pub fn process_pending(&mut self) -> usize {
        let mut processed = 0;
        while !self.stopped {
            let Ok(request) = self.requests.try_recv() else {
                break;
            };
            processed += 1;
            self.dispatch(request);
        }
        processed
    }

    /// Drive the loop until [`Request::Shutdown`] arrives.
    ///
    /// Returns the loop so its connections and transport can be inspected
    /// after it stops.
    pub async fn run(mut self) -> Self {
        info!("event loop started");

        while !self.stopped {
            let deadline = self.ping_deadline;
            let sleep = tokio::time::sleep_until(tokio::time::Instant::from_std(
                deadline.unwrap_or_else(Instant::now),
            ));

            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.dispatch(request),
                    None => self.stopped = true,
                },
                event = self.transport.next_event() => self.handle_event(event),
                _ = sleep, if deadline.is_some() => self.fire_due_pings(Instant::now()),
            }
        }

        info!("event loop stopped");
        self
    }

    fn dispatch(&mut self, request: Request) {
        trace!(?request, "processing request");
        match request {
            Request::Close(id) => self.execute_close(id),
            Request::Send(id, data) => self.execute_send(id, &data),
            Request::RecomputeTimers => self.recompute_timers(),
            Request::Shutdown => {
                info!("shutdown requested");
                self.stopped = true;
            }
        }
    }

    fn execute_close(&mut self, id: ConnectionId) {
        let Ok(conn) = self.connection(id) else {
            debug!(conn = %id, "close request for destroyed connection dropped");
            return;
        };

        conn.clear_closing();
        self.terminate(&conn, ConnectionState::Closed);
    }

    fn execute_send(&mut self, id: ConnectionId, data: &[u8]) {
        let Ok(conn) = self.connection(id) else {
            debug!(conn = %id, "send request for destroyed connection dropped");
            return;
        };
        if conn.state() != ConnectionState::Connected {
            debug!(conn = %id, state = %conn.state(), "send request for idle connection dropped");
            return;
        }

        if let Err(e) = self.transport.send_packet(&conn, data) {
            warn!(conn = %id, error = %e, "send failed");
            conn.record_result(e.kind(), e.errno());
            self.terminate(&conn, ConnectionState::Error);
        }
    }

    /// Route one transport event to the matching entry point.
    pub fn handle_event(&mut self, event: TransportEvent) {
        let id = event.connection();
        let result = match event {
            TransportEvent::Readable(id) => self.on_readable(id),
            TransportEvent::HandshakeDone(id, peer) => self.complete_handshake(id, peer),
            TransportEvent::Failed(id, error) => self.fail(id, error),
        };

        if let Err(e) = result {
            warn!(conn = %id, error = %e, "transport event not handled");
        }
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    /// Record that the connection's socket is now polled by this loop.
    pub fn register(&mut self, id: ConnectionId, socket: SocketToken) -> SdgResult<()> {
        let conn = self.connection(id)?;
        conn.proto().socket = Some(socket);
        conn.set_registered(true);
        debug!(conn = %id, %socket, "registered with event loop");
        Ok(())
    }

    /// Accept a connect request: `Closed -> Connecting` in role `mode`.
    pub fn begin_connect(&mut self, id: ConnectionId, mode: Mode) -> SdgResult<()> {
        let conn = self.connection(id)?;
        let _hold = self.prepare_connect(&conn, mode)?;
        conn.transition(ConnectionState::Connecting);
        Ok(())
    }

    /// Validate a connect and get buffers ready. Does not change state.
    ///
    /// The returned guard refuses close requests until it is dropped, which
    /// callers do after moving the connection to `Connecting`.
    pub(super) fn prepare_connect<'c>(
        &mut self,
        conn: &'c Connection,
        mode: Mode,
    ) -> SdgResult<ConnectGuard<'c>> {
        let hold = conn.lock_connect()?;
        if conn.state() != ConnectionState::Closed {
            return Err(SdgError::WrongState("connection is not closed"));
        }

        let mut proto = conn.proto();
        if let Err(e) = proto.pool.prime() {
            drop(proto);
            conn.record_result(e.kind(), 0);
            return Err(e);
        }
        proto.mode = mode;
        proto.peer_id = PeerId::default();
        proto.discard_first_bytes = 0;
        proto.last_ping = None;
        drop(proto);

        conn.reset_result();
        Ok(hold)
    }

    /// The handshake finished: `Connecting -> Connected`.
    pub fn complete_handshake(&mut self, id: ConnectionId, peer: PeerId) -> SdgResult<()> {
        let conn = self.connection(id)?;
        if conn.state() != ConnectionState::Connecting {
            return Err(SdgError::WrongState("no handshake in progress"));
        }

        {
            let mut proto = conn.proto();
            proto.peer_id = peer;
            proto.last_activity = Instant::now();
        }

        info!(conn = %id, %peer, "connection established");
        conn.transition(ConnectionState::Connected);
        self.recompute_timers();
        Ok(())
    }

    /// The transport detected a failure on this connection.
    pub fn fail(&mut self, id: ConnectionId, error: TransportError) -> SdgResult<()> {
        let conn = self.connection(id)?;
        warn!(conn = %id, %error, "connection failed");
        conn.record_result(error.kind(), error.errno());
        self.terminate(&conn, ConnectionState::Error);
        Ok(())
    }

    /// Tear the connection (and everything forwarded through it) down.
    pub fn terminate_connection(
        &mut self,
        id: ConnectionId,
        state: ConnectionState,
    ) -> SdgResult<()> {
        let conn = self.connection(id)?;
        self.terminate(&conn, state);
        Ok(())
    }

    /// Drop the connection from polling and give its socket back.
    pub(super) fn deregister(&mut self, conn: &Connection) {
        if conn.is_registered() {
            conn.set_registered(false);
            trace!(conn = %conn.id(), "deregistered from event loop");
        }
        if let Some(socket) = conn.shutdown() {
            self.transport.release_socket(conn.id(), socket);
        }
    }

    // -------------------------------------------------------------------------
    // Receive path
    // -------------------------------------------------------------------------

    /// Skip the first `bytes` of the next payload delivered on `id`.
    pub fn discard_next(&mut self, id: ConnectionId, bytes: usize) -> SdgResult<()> {
        self.connection(id)?.proto().discard_first_bytes = bytes;
        Ok(())
    }

    /// Hand a decrypted payload to the connection.
    ///
    /// A failing receive callback terminates the connection with `Error`.
    pub fn deliver(&mut self, id: ConnectionId, data: &[u8]) -> SdgResult<()> {
        let conn = self.connection(id)?;
        self.dispatch_inbound(&conn, data);
        Ok(())
    }

    fn dispatch_inbound(&mut self, conn: &Connection, data: &[u8]) {
        if let Err(kind) = conn.handle_inbound(data) {
            // A failure has to leave a reason behind.
            let kind = match kind {
                ErrorKind::NoError => ErrorKind::Error,
                kind => kind,
            };
            debug!(conn = %conn.id(), %kind, "receive callback failed");
            conn.record_result(kind, 0);
            self.terminate(conn, ConnectionState::Error);
        }
    }

    /// The connection's socket is readable: run one receive cycle.
    ///
    /// Allocation failure is returned to the caller and leaves the
    /// connection's state alone; transport failures terminate it.
    pub fn on_readable(&mut self, id: ConnectionId) -> SdgResult<()> {
        let conn = self.connection(id)?;

        let (mut buffer, mut pending) = {
            let mut proto = conn.proto();
            match proto.receive_buffer.take() {
                Some(buffer) => (buffer, proto.bytes_pending),
                None => match proto.pool.acquire() {
                    Ok(buffer) => {
                        proto.bytes_pending = 0;
                        (buffer, 0)
                    }
                    Err(e) => {
                        drop(proto);
                        conn.record_result(ErrorKind::MemoryError, 0);
                        return Err(e);
                    }
                },
            }
        };

        let received = self
            .transport
            .receive_packet(&conn, &mut buffer[..], &mut pending)
            .and_then(|received| match received {
                Received::Packet { len } if len > buffer.len() => Err(TransportError::Protocol(
                    format!("packet length {len} exceeds buffer of {}", buffer.len()),
                )),
                received => Ok(received),
            });

        match received {
            Ok(Received::Incomplete) => {
                let mut proto = conn.proto();
                proto.receive_buffer = Some(buffer);
                proto.bytes_pending = pending;
            }
            Ok(Received::Packet { len }) => {
                conn.proto().bytes_pending = 0;
                self.dispatch_inbound(&conn, &buffer[..len]);
                conn.put_buffer(buffer);
            }
            Err(e) => {
                error!(conn = %id, error = %e, "connection died");
                conn.put_buffer(buffer);
                conn.record_result(e.kind(), e.errno());
                self.terminate(&conn, ConnectionState::Error);
            }
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Ping timers
    // -------------------------------------------------------------------------

    fn pingable(&self) -> Vec<Connection> {
        self.shared
            .registry
            .ids()
            .into_iter()
            .filter_map(|id| self.connection(id).ok())
            .filter(|c| c.is_registered() && c.state() == ConnectionState::Connected)
            .collect()
    }

    /// Earliest moment a connected link is due a ping.
    pub fn next_ping_deadline(&self) -> Option<Instant> {
        self.pingable().iter().filter_map(Connection::ping_due_at).min()
    }

    /// Re-read ping intervals and reset the timer.
    pub fn recompute_timers(&mut self) {
        self.ping_deadline = self.next_ping_deadline();
        trace!(deadline = ?self.ping_deadline, "timers recomputed");
    }

    /// Send pings on every link whose deadline is at or before `now`.
    pub fn fire_due_pings(&mut self, now: Instant) {
        for conn in self.pingable() {
            if conn.is_destroyed() || conn.state() != ConnectionState::Connected {
                continue;
            }
            match conn.ping_due_at() {
                Some(due) if due <= now => {}
                _ => continue,
            }

            match self.transport.send_ping(&conn) {
                Ok(()) => {
                    trace!(conn = %conn.id(), "ping sent");
                    conn.proto().last_ping = Some(now);
                }
                Err(e) => {
                    warn!(conn = %conn.id(), error = %e, "ping failed");
                    conn.record_result(e.kind(), e.errno());
                    self.terminate(&conn, ConnectionState::Error);
                }
            }
        }

        self.recompute_timers();
    }

    /// Deadline the timer is currently armed with.
    pub fn ping_deadline(&self) -> Option<Instant> {
        self.ping_deadline
    }
}

impl Connection {
    /// When this link next needs a ping, if pinging is enabled.
    pub(crate) fn ping_due_at(&self) -> Option<Instant> {
        let interval = self.ping_interval();
        if interval == 0 {
            return None;
        }

        let proto = self.proto();
        let last = match proto.last_ping {
            Some(ping) if ping > proto.last_activity => ping,
            _ => proto.last_activity,
        };
        Some(last + Duration::from_secs(u64::from(interval)))
    }
}

impl<T> std::fmt::Debug for EventLoop<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("connections", &self.shared.registry.len())
            .field("ping_deadline", &self.ping_deadline)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}
