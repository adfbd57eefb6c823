//! # SDG client core
//!
//! Connection layer of a tunneling client that talks to peers through
//! relay servers. Connections are end-to-end encrypted tunnels over TCP; a
//! connection to a peer may be brokered by an already established server
//! link, in which case it waits in that link's forwarding list until the
//! relay answers.
//!
//! This crate provides:
//!
//! - **State machine**: every connection moves between `Closed`,
//!   `Connecting`, `Connected` and `Error`, reported through a callback
//! - **Close gateway**: any thread may close a connection; the close runs on
//!   the event-processing thread, at most once per request
//! - **Buffer pool**: per-connection receive buffers, primed on connect
//! - **Forwarding tree**: a relay failure tears down every peer waiting on it
//! - **Identity**: the static X25519 keypair used by the handshake
//!
//! ## Modules
//!
//! - [`core`]: constants, error types and version information
//! - [`crypto`]: identity keypair
//! - [`connection`]: connection handle, states and buffers
//! - [`engine`]: event loop, request queue and forwarding tree
//! - [`transport`]: boundary to socket I/O, framing and encryption
//! - [`client`]: client context and configuration
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use sdg_client::prelude::*;
//!
//! let (client, mut event_loop) = Client::builder()
//!     .private_key([7u8; 32])
//!     .ping_interval(30)
//!     .build(my_transport);
//!
//! let conn = client.connection_create()?;
//! conn.set_state_change_callback(|conn, state| {
//!     println!("{} is now {}", conn.id(), state);
//! });
//!
//! event_loop.begin_connect(conn.id(), Mode::ServerLink)?;
//! tokio::spawn(event_loop.run());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module
pub mod core;

// Identity keys
pub mod crypto;

// Connection object model
pub mod connection;

// Event loop and forwarding
pub mod engine;

// Transport boundary
pub mod transport;

// Client API
pub mod client;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::client::{Client, ClientBuilder, ClientConfig};
    pub use crate::connection::{Connection, ConnectionState, Mode};
    pub use crate::core::{ErrorKind, SdgError, SdgResult};
    pub use crate::crypto::{Identity, PeerId};
    pub use crate::engine::{ConnectionId, EventLoop};
    pub use crate::transport::{
        Received, SocketToken, Transport, TransportError, TransportEvent, TransportResult,
    };
}

// Re-export commonly used items at crate root
pub use client::{Client, ClientBuilder, ClientConfig};
pub use connection::{Connection, ConnectionState, Mode};
pub use crate::core::{version, ErrorKind, SdgError, SdgResult, Version};
pub use crypto::{calc_public_key, Identity, PeerId};
pub use engine::{ConnectionId, EventLoop};
pub use transport::Transport;
