//! Client context.
//!
//! A [`Client`] ties together the things every connection needs: the
//! identity keypair, the connection arena and the request queue of the event
//! loop. It is the explicit replacement for process-wide globals: build one
//! at startup, install the private key before creating connections, and hand
//! the [`EventLoop`] to the thread that will drive I/O.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::connection::{Connection, ConnectionInner};
use crate::core::{
    SdgError, SdgResult, DEFAULT_BUFFER_SIZE, DEFAULT_PING_INTERVAL, PRIMED_BUFFERS,
    PRIVATE_KEY_SIZE,
};
use crate::crypto::{Identity, PeerId};
use crate::engine::{ConnectionId, EventLoop, Registry, Request, RequestGateway};
use crate::transport::Transport;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Size of each receive buffer.
    pub buffer_size: usize,

    /// Buffers allocated into a connection's pool when it first connects.
    pub primed_buffers: usize,

    /// Ping interval (seconds) given to new connections. Zero disables.
    pub ping_interval: u32,

    /// Identity private key installed at construction.
    pub private_key: Option<[u8; PRIVATE_KEY_SIZE]>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            primed_buffers: PRIMED_BUFFERS,
            ping_interval: DEFAULT_PING_INTERVAL,
            private_key: None,
        }
    }
}

/// Builder for creating a [`Client`].
#[derive(Debug, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new client builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the receive buffer size.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    /// Set how many buffers are preallocated per connection.
    pub fn primed_buffers(mut self, count: usize) -> Self {
        self.config.primed_buffers = count;
        self
    }

    /// Set the default ping interval in seconds.
    pub fn ping_interval(mut self, seconds: u32) -> Self {
        self.config.ping_interval = seconds;
        self
    }

    /// Set the identity private key.
    pub fn private_key(mut self, key: [u8; PRIVATE_KEY_SIZE]) -> Self {
        self.config.private_key = Some(key);
        self
    }

    /// Use an existing configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Create the client and the event loop that serves it.
    pub fn build<T: Transport>(self, transport: T) -> (Client, EventLoop<T>) {
        let (gateway, requests) = RequestGateway::channel();
        let identity = self.config.private_key.map(Identity::from_private_key);

        let shared = Arc::new(Shared {
            config: self.config,
            identity: RwLock::new(identity),
            registry: Registry::default(),
            gateway,
        });

        let event_loop = EventLoop::new(shared.clone(), requests, transport);
        (Client { shared }, event_loop)
    }
}

/// State shared by the client, its connections and the event loop.
pub(crate) struct Shared {
    pub(crate) config: ClientConfig,
    pub(crate) identity: RwLock<Option<Identity>>,
    pub(crate) registry: Registry,
    pub(crate) gateway: RequestGateway,
}

/// Handle to the client context. Cheap to clone, safe from any thread.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Start building a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Install the identity keypair and derive its public key.
    ///
    /// This is the single initialization point for the identity: once
    /// connections exist it fails with `WrongState`.
    pub fn set_private_key(&self, key: [u8; PRIVATE_KEY_SIZE]) -> SdgResult<()> {
        let mut identity = self.shared.identity.write();
        if !self.shared.registry.is_empty() {
            return Err(SdgError::WrongState("connections already exist"));
        }

        let installed = Identity::from_private_key(key);
        info!(peer_id = %installed.peer_id(), "identity installed");
        *identity = Some(installed);
        Ok(())
    }

    /// Our public key, if an identity has been installed.
    pub fn my_peer_id(&self) -> Option<PeerId> {
        self.shared.identity.read().as_ref().map(Identity::peer_id)
    }

    /// A copy of the installed identity, for the handshake layer.
    pub fn identity(&self) -> Option<Identity> {
        self.shared.identity.read().clone()
    }

    /// Create a connection with the configured buffer size.
    pub fn connection_create(&self) -> SdgResult<Connection> {
        self.connection_create_with_buffer_size(self.shared.config.buffer_size)
    }

    /// Create a connection whose receive buffers are `buffer_size` bytes.
    pub fn connection_create_with_buffer_size(&self, buffer_size: usize) -> SdgResult<Connection> {
        let config = &self.shared.config;
        // Keeps set_private_key out while the connection is inserted.
        let _identity = self.shared.identity.read();
        let inner = self.shared.registry.insert(|id| {
            ConnectionInner::new(id, buffer_size, config.primed_buffers, config.ping_interval)
        })?;

        let conn = Connection::from_parts(inner, self.shared.clone());
        debug!(conn = %conn.id(), buffer_size, "connection created");
        Ok(conn)
    }

    /// Look up a live connection by id.
    pub fn connection(&self, id: ConnectionId) -> Option<Connection> {
        self.shared
            .registry
            .get(id)
            .map(|inner| Connection::from_parts(inner, self.shared.clone()))
    }

    /// Number of connections that have not been destroyed.
    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Ask the event loop to stop.
    pub fn shutdown(&self) -> SdgResult<()> {
        self.shared.gateway.send(Request::Shutdown)
    }

    /// The configuration this client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("peer_id", &self.my_peer_id())
            .field("connections", &self.connection_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use crate::transport::mock::ScriptedTransport;

    const ALICE_PRIVATE: &str = "77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a";
    const ALICE_PUBLIC: &str = "8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a";

    fn key(s: &str) -> [u8; 32] {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.primed_buffers, PRIMED_BUFFERS);
        assert_eq!(config.ping_interval, 0);
        assert!(config.private_key.is_none());
    }

    #[test]
    fn test_builder() {
        let (client, _event_loop) = Client::builder()
            .buffer_size(512)
            .primed_buffers(1)
            .ping_interval(15)
            .build(ScriptedTransport::default());

        assert_eq!(client.config().buffer_size, 512);
        let conn = client.connection_create().unwrap();
        assert_eq!(conn.ping_interval(), 15);
        assert!(client.my_peer_id().is_none());
    }

    #[test]
    fn test_private_key_from_config() {
        let (client, _event_loop) = Client::builder()
            .private_key(key(ALICE_PRIVATE))
            .build(ScriptedTransport::default());

        assert_eq!(client.my_peer_id().unwrap().as_bytes(), &key(ALICE_PUBLIC));
        assert_eq!(client.identity().unwrap().private_key(), &key(ALICE_PRIVATE));
    }

    #[test]
    fn test_set_private_key_before_connections() {
        let (client, _event_loop) = Client::builder().build(ScriptedTransport::default());
        client.set_private_key(key(ALICE_PRIVATE)).unwrap();
        assert_eq!(client.my_peer_id().unwrap().as_bytes(), &key(ALICE_PUBLIC));

        // Replacing it is fine while nothing uses it
        client.set_private_key([1; 32]).unwrap();
        assert_ne!(client.my_peer_id().unwrap().as_bytes(), &key(ALICE_PUBLIC));
    }

    #[test]
    fn test_set_private_key_rejected_with_connections() {
        let (client, _event_loop) = Client::builder().build(ScriptedTransport::default());
        let conn = client.connection_create().unwrap();

        let err = client.set_private_key(key(ALICE_PRIVATE)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WrongState);
        assert!(client.my_peer_id().is_none());

        conn.destroy().unwrap();
        client.set_private_key(key(ALICE_PRIVATE)).unwrap();
    }

    #[test]
    fn test_connection_lookup() {
        let (client, _event_loop) = Client::builder().build(ScriptedTransport::default());
        let a = client.connection_create().unwrap();
        let b = client.connection_create().unwrap();

        assert_ne!(a.id(), b.id());
        assert_eq!(client.connection(a.id()), Some(a));
        assert_eq!(client.connection_count(), 2);
    }

    #[test]
    fn test_shutdown_after_event_loop_dropped() {
        let (client, event_loop) = Client::builder().build(ScriptedTransport::default());
        drop(event_loop);

        assert!(matches!(client.shutdown(), Err(SdgError::Shutdown)));
    }
}
