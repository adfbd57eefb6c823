//! Protocol and engine constants.
//!
//! These values match what deployed gateways expect and MUST NOT be changed
//! without a matching change on the device side.

// =============================================================================
// IDENTITY (crypto::keys)
// =============================================================================

/// Curve25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Curve25519 private key size.
pub const PRIVATE_KEY_SIZE: usize = 32;

// =============================================================================
// RECEIVE BUFFERS (connection::buffer)
// =============================================================================

/// Default receive buffer size. Holds one full encrypted frame.
pub const DEFAULT_BUFFER_SIZE: usize = 1536;

/// Number of buffers put into a connection's pool on first use.
pub const PRIMED_BUFFERS: usize = 3;

// =============================================================================
// TIMERS (engine::event_loop)
// =============================================================================

/// Ping interval for new connections. Zero disables pinging.
pub const DEFAULT_PING_INTERVAL: u32 = 0;
