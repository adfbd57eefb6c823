//! The connection object and its thread-safe public operations.
//!
//! A [`Connection`] is a cheap, cloneable handle. Protocol state behind it
//! (buffers, forwarding list, receive buffer, tunnel id) is only touched by
//! the event loop; the handle itself exposes the operations that are safe
//! from any thread.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, trace};

use super::buffer::{Buffer, BufferPool, PoolStats};
use super::state::{CloseFlag, ConnectGuard, ConnectionState, FlagHolder, Mode, StateCell};
use crate::client::Shared;
use crate::core::{ErrorKind, SdgError, SdgResult};
use crate::crypto::PeerId;
use crate::engine::{ConnectionId, Request};
use crate::transport::SocketToken;

/// Called on the event-processing thread after every state transition.
///
/// The callback must not block. It may close or destroy any connection,
/// including the one it is called for.
pub type StateChangeCallback = Arc<dyn Fn(&Connection, ConnectionState) + Send + Sync>;

/// Called on the event-processing thread with each inbound payload.
///
/// Returning an error terminates the connection with that result.
pub type ReceiveDataCallback = Arc<dyn Fn(&Connection, &[u8]) -> Result<(), ErrorKind> + Send + Sync>;

/// Opaque caller data attached to a connection.
pub type UserData = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    state_change: Option<StateChangeCallback>,
    receive_data: Option<ReceiveDataCallback>,
}

/// Event-thread-owned protocol state.
#[derive(Debug)]
pub(crate) struct Protocol {
    pub(crate) mode: Mode,
    pub(crate) socket: Option<SocketToken>,
    pub(crate) peer_id: PeerId,
    pub(crate) tunnel_id: Option<Box<[u8]>>,
    pub(crate) receive_buffer: Option<Buffer>,
    pub(crate) bytes_pending: usize,
    pub(crate) discard_first_bytes: usize,
    pub(crate) last_activity: Instant,
    pub(crate) last_ping: Option<Instant>,
    /// Children waiting for a forwarding reply through this connection.
    pub(crate) forward_list: Vec<ConnectionId>,
    /// Parent whose forwarding list holds us. Not an owning reference.
    pub(crate) parent: Option<ConnectionId>,
    pub(crate) pool: BufferPool,
}

pub(crate) struct ConnectionInner {
    id: ConnectionId,
    state: StateCell,
    closing: CloseFlag,
    error_kind: AtomicU8,
    error_code: AtomicI32,
    ping_interval: AtomicU32,
    registered: AtomicBool,
    destroyed: AtomicBool,
    proto: Mutex<Protocol>,
    callbacks: RwLock<Callbacks>,
    user_data: RwLock<Option<UserData>>,
}

impl ConnectionInner {
    pub(crate) fn new(
        id: ConnectionId,
        buffer_size: usize,
        prime_count: usize,
        ping_interval: u32,
    ) -> Self {
        Self {
            id,
            state: StateCell::default(),
            closing: CloseFlag::default(),
            error_kind: AtomicU8::new(ErrorKind::NoError as u8),
            error_code: AtomicI32::new(0),
            ping_interval: AtomicU32::new(ping_interval),
            registered: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            proto: Mutex::new(Protocol {
                mode: Mode::None,
                socket: None,
                peer_id: PeerId::default(),
                tunnel_id: None,
                receive_buffer: None,
                bytes_pending: 0,
                discard_first_bytes: 0,
                last_activity: Instant::now(),
                last_ping: None,
                forward_list: Vec::new(),
                parent: None,
                pool: BufferPool::new(buffer_size, prime_count),
            }),
            callbacks: RwLock::new(Callbacks::default()),
            user_data: RwLock::new(None),
        }
    }
}

/// Handle to one logical tunnel endpoint.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
    shared: Arc<Shared>,
}

impl Connection {
    pub(crate) fn from_parts(inner: Arc<ConnectionInner>, shared: Arc<Shared>) -> Self {
        Self { inner, shared }
    }

    /// Stable identifier of this connection.
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.load()
    }

    /// Whether a close has been requested and not yet executed.
    pub fn is_closing(&self) -> bool {
        self.inner.closing.is_set()
    }

    /// Role of this connection.
    pub fn mode(&self) -> Mode {
        self.proto().mode
    }

    /// Result of the last failed operation.
    pub fn last_result(&self) -> ErrorKind {
        ErrorKind::from_u8(self.inner.error_kind.load(Ordering::Acquire))
    }

    /// Platform error code. Only meaningful when `last_result()` is
    /// [`ErrorKind::SocketError`].
    pub fn last_errno(&self) -> i32 {
        self.inner.error_code.load(Ordering::Acquire)
    }

    /// Public key of the remote end, all zeroes until a handshake completes.
    pub fn peer_id(&self) -> PeerId {
        self.proto().peer_id
    }

    /// Remote tunnel identifier, present on forwarded peer connections once
    /// the relay has answered.
    pub fn tunnel_id(&self) -> Option<Vec<u8>> {
        self.proto().tunnel_id.as_deref().map(<[u8]>::to_vec)
    }

    /// When data was last received.
    pub fn last_activity(&self) -> Instant {
        self.proto().last_activity
    }

    /// Connections currently waiting for a forwarding reply through this one.
    pub fn forward_children(&self) -> Vec<ConnectionId> {
        self.proto().forward_list.clone()
    }

    /// Buffer pool counters.
    pub fn buffer_stats(&self) -> PoolStats {
        self.proto().pool.stats()
    }

    /// Attach caller data.
    pub fn set_user_data(&self, data: UserData) {
        *self.inner.user_data.write() = Some(data);
    }

    /// Caller data previously attached.
    pub fn user_data(&self) -> Option<UserData> {
        self.inner.user_data.read().clone()
    }

    /// Caller data downcast to a concrete type.
    pub fn user_data_as<D: Any + Send + Sync>(&self) -> Option<Arc<D>> {
        self.user_data()?.downcast::<D>().ok()
    }

    /// Install the state change callback.
    pub fn set_state_change_callback<F>(&self, f: F)
    where
        F: Fn(&Connection, ConnectionState) + Send + Sync + 'static,
    {
        self.inner.callbacks.write().state_change = Some(Arc::new(f));
    }

    /// Install the receive callback.
    ///
    /// Server links and pairing sessions parse their own traffic, so while
    /// they are in use the callback can't be replaced.
    pub fn set_receive_data_callback<F>(&self, f: F) -> SdgResult<()>
    where
        F: Fn(&Connection, &[u8]) -> Result<(), ErrorKind> + Send + Sync + 'static,
    {
        if self.state().in_use() && self.mode().has_internal_handler() {
            return Err(SdgError::WrongState("connection has an internal data handler"));
        }

        self.inner.callbacks.write().receive_data = Some(Arc::new(f));
        Ok(())
    }

    /// Current ping interval in seconds. Zero means disabled.
    pub fn ping_interval(&self) -> u32 {
        self.inner.ping_interval.load(Ordering::Relaxed)
    }

    /// Set the ping interval in seconds. Zero disables pinging.
    ///
    /// Best effort: the event loop picks the new value up the next time it
    /// recomputes its timers, which this call triggers for connected links.
    pub fn set_ping_interval(&self, seconds: u32) {
        self.inner.ping_interval.store(seconds, Ordering::Relaxed);

        if self.state() == ConnectionState::Connected {
            if let Err(e) = self.shared.gateway.send(Request::RecomputeTimers) {
                trace!(conn = %self.id(), error = %e, "timer update not delivered");
            }
        }
    }

    /// Request the connection to be closed.
    ///
    /// Returns immediately; the close runs on the event loop and completion
    /// is reported through the state change callback. Fails with
    /// `WrongState` while a connect is in flight or if a close is already
    /// pending.
    pub fn close(&self) -> SdgResult<()> {
        if self.is_destroyed() {
            return Err(SdgError::UnknownConnection(self.id()));
        }
        match self.inner.closing.try_claim() {
            Ok(()) => {}
            Err(FlagHolder::Close) => return Err(SdgError::WrongState("close already pending")),
            Err(FlagHolder::Connect) => return Err(SdgError::WrongState("connect in progress")),
        }
        // Checked after the claim: a connect accepted from here on sees the
        // flag and is refused.
        if self.state() == ConnectionState::Connecting {
            self.inner.closing.clear();
            return Err(SdgError::WrongState("connect in progress"));
        }

        if let Err(e) = self.shared.gateway.send(Request::Close(self.id())) {
            self.inner.closing.clear();
            return Err(e);
        }

        debug!(conn = %self.id(), "close requested");
        Ok(())
    }

    /// Queue `data` for sending on an established link.
    ///
    /// The payload is copied; the send itself runs on the event loop. A
    /// transport failure terminates the connection with `Error`.
    pub fn send_data(&self, data: &[u8]) -> SdgResult<()> {
        if self.is_destroyed() {
            return Err(SdgError::UnknownConnection(self.id()));
        }
        if self.state() != ConnectionState::Connected {
            return Err(SdgError::WrongState("connection is not connected"));
        }

        let mut payload = Vec::new();
        payload.try_reserve_exact(data.len())?;
        payload.extend_from_slice(data);

        self.shared.gateway.send(Request::Send(self.id(), payload))?;
        trace!(conn = %self.id(), len = data.len(), "send queued");
        Ok(())
    }

    /// Destroy the connection and free its buffers.
    ///
    /// The connection must be shut down first: destroying one that is still
    /// registered with the event loop or still relays for other connections
    /// fails with `WrongState`. A connection waiting in a relay's forwarding
    /// list is unlinked from it.
    pub fn destroy(self) -> SdgResult<()> {
        if self.inner.registered.load(Ordering::Acquire) {
            return Err(SdgError::WrongState("connection is registered with the event loop"));
        }

        let parent = {
            let mut proto = self.proto();
            if !proto.forward_list.is_empty() {
                return Err(SdgError::WrongState("connection still forwards for peers"));
            }
            if self.inner.destroyed.swap(true, Ordering::AcqRel) {
                return Err(SdgError::UnknownConnection(self.id()));
            }

            proto.tunnel_id = None;
            proto.bytes_pending = 0;
            if let Some(buffer) = proto.receive_buffer.take() {
                proto.pool.discard(buffer);
            }
            proto.pool.clear();
            proto.parent.take()
        };

        self.shared.registry.remove(self.id());

        if let Some(parent) = parent.and_then(|p| self.shared.registry.get(p)) {
            parent.proto.lock().forward_list.retain(|c| *c != self.id());
        }

        // Callbacks may hold clones of this handle.
        *self.inner.callbacks.write() = Callbacks::default();
        *self.inner.user_data.write() = None;

        debug!(conn = %self.id(), "connection destroyed");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Event-thread internals
    // ---------------------------------------------------------------------

    pub(crate) fn proto(&self) -> MutexGuard<'_, Protocol> {
        self.inner.proto.lock()
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.inner.registered.load(Ordering::Acquire)
    }

    pub(crate) fn set_registered(&self, registered: bool) {
        self.inner.registered.store(registered, Ordering::Release);
    }

    pub(crate) fn clear_closing(&self) {
        self.inner.closing.clear();
    }

    pub(crate) fn receive_callback(&self) -> Option<ReceiveDataCallback> {
        self.inner.callbacks.read().receive_data.clone()
    }

    /// Record the outcome of an operation. `NoError` leaves the previous
    /// result in place.
    pub(crate) fn record_result(&self, kind: ErrorKind, errno: i32) {
        if kind == ErrorKind::NoError {
            return;
        }
        if kind == ErrorKind::SocketError {
            self.inner.error_code.store(errno, Ordering::Release);
        }
        self.inner.error_kind.store(kind as u8, Ordering::Release);
    }

    pub(crate) fn reset_result(&self) {
        self.inner.error_code.store(0, Ordering::Release);
        self.inner
            .error_kind
            .store(ErrorKind::NoError as u8, Ordering::Release);
    }

    /// Copy the failure reason of `other` onto this connection.
    pub(crate) fn inherit_error(&self, other: &Connection) {
        self.inner
            .error_code
            .store(other.last_errno(), Ordering::Release);
        self.inner
            .error_kind
            .store(other.last_result() as u8, Ordering::Release);
    }

    /// Release the transport-side resources. Idempotent.
    ///
    /// Returns the socket token so the caller can hand it back to the
    /// transport.
    pub(crate) fn shutdown(&self) -> Option<SocketToken> {
        let mut proto = self.proto();
        proto.tunnel_id = None;
        proto.bytes_pending = 0;
        if let Some(buffer) = proto.receive_buffer.take() {
            proto.pool.release(buffer);
        }
        proto.socket.take()
    }

    /// Hand a buffer back after a receive cycle. If the connection was
    /// destroyed meanwhile the buffer is freed instead of pooled.
    pub(crate) fn put_buffer(&self, buffer: Buffer) {
        let mut proto = self.proto();
        if self.is_destroyed() {
            trace!(conn = %self.id(), "connection gone, freeing buffer");
            proto.pool.discard(buffer);
            return;
        }
        proto.pool.release(buffer);
    }

    /// Keep closes out while a connect is being accepted.
    pub(crate) fn lock_connect(&self) -> SdgResult<ConnectGuard<'_>> {
        self.inner.closing.try_lock_connect().map_err(|holder| match holder {
            FlagHolder::Close => SdgError::WrongState("close pending"),
            FlagHolder::Connect => SdgError::WrongState("connect in progress"),
        })
    }

    /// Set the state and notify the user.
    pub(crate) fn transition(&self, state: ConnectionState) {
        let old = self.inner.state.load();
        self.inner.state.store(state);
        debug!(conn = %self.id(), from = %old, to = %state, "state change");

        let callback = self.inner.callbacks.read().state_change.clone();
        if let Some(callback) = callback {
            callback(self, state);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("closing", &self.is_closing())
            .field("last_result", &self.last_result())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use super::*;
    use crate::client::Client;
    use crate::crypto::PeerId;
    use crate::engine::EventLoop;
    use crate::transport::mock::ScriptedTransport;

    fn setup() -> (Client, EventLoop<ScriptedTransport>) {
        Client::builder()
            .primed_buffers(2)
            .buffer_size(64)
            .build(ScriptedTransport::default())
    }

    fn connected(
        client: &Client,
        event_loop: &mut EventLoop<ScriptedTransport>,
        mode: Mode,
    ) -> Connection {
        let conn = client.connection_create().unwrap();
        event_loop.register(conn.id(), SocketToken(u64::from(conn.id().as_u32()))).unwrap();
        event_loop.begin_connect(conn.id(), mode).unwrap();
        event_loop
            .complete_handshake(conn.id(), PeerId::from_bytes([9; 32]))
            .unwrap();
        conn
    }

    #[test]
    fn test_new_connection_is_closed() {
        let (client, _event_loop) = setup();
        let conn = client.connection_create().unwrap();

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.mode(), Mode::None);
        assert_eq!(conn.last_result(), ErrorKind::NoError);
        assert!(!conn.is_closing());
        assert!(conn.peer_id().is_unset());
        assert!(conn.tunnel_id().is_none());
        assert_eq!(conn.buffer_stats().allocated, 0);
    }

    #[test]
    fn test_close_executes_on_event_loop() {
        let (client, mut event_loop) = setup();
        let conn = connected(&client, &mut event_loop, Mode::ServerLink);

        let states = Arc::new(Mutex::new(Vec::new()));
        let log = states.clone();
        conn.set_state_change_callback(move |_, state| log.lock().push(state));

        conn.close().unwrap();
        assert!(conn.is_closing());
        assert_eq!(conn.state(), ConnectionState::Connected);

        assert_eq!(event_loop.process_pending(), 1);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.is_closing());
        assert_eq!(states.lock().as_slice(), &[ConnectionState::Closed]);
    }

    #[test]
    fn test_second_close_is_rejected_while_pending() {
        let (client, mut event_loop) = setup();
        let conn = connected(&client, &mut event_loop, Mode::ServerLink);

        conn.close().unwrap();
        assert!(matches!(conn.close(), Err(SdgError::WrongState(_))));

        assert_eq!(event_loop.process_pending(), 1);
        assert_eq!(conn.state(), ConnectionState::Closed);

        // Once executed, the connection can be closed again
        conn.close().unwrap();
        assert_eq!(event_loop.process_pending(), 1);
    }

    #[test]
    fn test_racing_closes_enqueue_once() {
        let (client, mut event_loop) = setup();
        let conn = connected(&client, &mut event_loop, Mode::ServerLink);

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let conn = conn.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    conn.close()
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(SdgError::WrongState(_)))));

        assert_eq!(event_loop.process_pending(), 1);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.is_closing());
    }

    #[test]
    fn test_close_rejected_while_connecting() {
        let (client, mut event_loop) = setup();
        let conn = client.connection_create().unwrap();
        event_loop.begin_connect(conn.id(), Mode::ServerLink).unwrap();

        assert!(matches!(conn.close(), Err(SdgError::WrongState(_))));
        assert!(!conn.is_closing());
        assert_eq!(event_loop.process_pending(), 0);
    }

    #[test]
    fn test_close_and_connect_exclude_each_other() {
        let (client, mut event_loop) = setup();
        let conn = client.connection_create().unwrap();

        // Close requested first: the connect is refused
        conn.close().unwrap();
        assert!(matches!(
            event_loop.begin_connect(conn.id(), Mode::ServerLink),
            Err(SdgError::WrongState(_))
        ));
        assert_eq!(conn.state(), ConnectionState::Closed);
        event_loop.process_pending();

        // Connect being accepted: the close is refused and leaves no mark
        let hold = conn.lock_connect().unwrap();
        assert!(matches!(conn.close(), Err(SdgError::WrongState(_))));
        assert!(!conn.is_closing());
        drop(hold);

        event_loop.begin_connect(conn.id(), Mode::ServerLink).unwrap();
        assert!(matches!(conn.close(), Err(SdgError::WrongState(_))));
        assert!(!conn.is_closing());
        assert_eq!(event_loop.process_pending(), 0);
    }

    #[test]
    fn test_send_data_on_destroyed_connection() {
        let (client, _event_loop) = setup();
        let conn = client.connection_create().unwrap();
        conn.clone().destroy().unwrap();

        assert!(matches!(
            conn.send_data(b"x"),
            Err(SdgError::UnknownConnection(_))
        ));
    }

    #[test]
    fn test_receive_callback_rejected_for_internal_handlers() {
        let (client, mut event_loop) = setup();

        let link = client.connection_create().unwrap();
        link.set_receive_data_callback(|_, _| Ok(())).unwrap();
        event_loop.begin_connect(link.id(), Mode::ServerLink).unwrap();
        assert!(matches!(
            link.set_receive_data_callback(|_, _| Ok(())),
            Err(SdgError::WrongState(_))
        ));

        let pairing = client.connection_create().unwrap();
        event_loop.begin_connect(pairing.id(), Mode::Pairing).unwrap();
        assert!(pairing.set_receive_data_callback(|_, _| Ok(())).is_err());

        let peer = client.connection_create().unwrap();
        event_loop.begin_connect(peer.id(), Mode::PeerForward).unwrap();
        assert!(peer.set_receive_data_callback(|_, _| Ok(())).is_ok());
    }

    #[test]
    fn test_user_data() {
        let (client, _event_loop) = setup();
        let conn = client.connection_create().unwrap();
        assert!(conn.user_data().is_none());

        conn.set_user_data(Arc::new(42u64));
        assert_eq!(conn.user_data_as::<u64>().as_deref(), Some(&42));
        assert!(conn.user_data_as::<String>().is_none());
    }

    #[test]
    fn test_destroy_requires_deregistration() {
        let (client, mut event_loop) = setup();
        let conn = connected(&client, &mut event_loop, Mode::ServerLink);

        assert!(matches!(
            conn.clone().destroy(),
            Err(SdgError::WrongState(_))
        ));

        conn.close().unwrap();
        event_loop.process_pending();
        assert_eq!(
            event_loop.transport().released,
            vec![(conn.id(), SocketToken(u64::from(conn.id().as_u32())))]
        );

        let id = conn.id();
        conn.clone().destroy().unwrap();
        assert_eq!(client.connection_count(), 0);
        assert!(client.connection(id).is_none());

        // Stale handles see the connection as gone
        assert!(matches!(conn.close(), Err(SdgError::UnknownConnection(_))));
        assert!(matches!(
            conn.destroy(),
            Err(SdgError::UnknownConnection(_))
        ));
    }

    #[test]
    fn test_close_request_for_destroyed_connection_is_dropped() {
        let (client, mut event_loop) = setup();
        let conn = client.connection_create().unwrap();

        conn.close().unwrap();
        conn.clone().destroy().unwrap();

        assert_eq!(event_loop.process_pending(), 1);
        assert_eq!(client.connection_count(), 0);
    }

    #[test]
    fn test_destroy_frees_buffers() {
        let (client, mut event_loop) = setup();
        let conn = client.connection_create().unwrap();
        event_loop.begin_connect(conn.id(), Mode::PeerForward).unwrap();

        let stats = conn.buffer_stats();
        assert_eq!(stats.allocated, 2);
        assert_eq!(stats.free, 2);

        event_loop
            .terminate_connection(conn.id(), ConnectionState::Closed)
            .unwrap();
        conn.clone().destroy().unwrap();
        assert_eq!(conn.buffer_stats().allocated, 0);
    }

    #[test]
    fn test_ping_interval_update_wakes_event_loop() {
        let (client, mut event_loop) = setup();
        let conn = client.connection_create().unwrap();

        // Not connected: nothing to recompute
        conn.set_ping_interval(10);
        assert_eq!(conn.ping_interval(), 10);
        assert_eq!(event_loop.process_pending(), 0);

        let link = connected(&client, &mut event_loop, Mode::ServerLink);
        link.set_ping_interval(5);
        assert_eq!(event_loop.process_pending(), 1);
        assert!(event_loop.ping_deadline().is_some());
    }
}
