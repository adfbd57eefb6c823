//! Identity keys.
//!
//! The handshake itself (key exchange, session keys, AEAD framing) lives in
//! the transport; this module only owns the static keypair it needs.

mod keys;

pub use keys::{calc_public_key, Identity, PeerId};
