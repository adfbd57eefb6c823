//! Curve25519 identity keys.
//!
//! The client proves who it is to the relay server and to peers with a single
//! long-term keypair. Only the public half (the "peer id") ever leaves the
//! process.

use std::fmt;

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::core::{PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE};

/// Public key identifying a client or a peer device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PeerId(pub [u8; PUBLIC_KEY_SIZE]);

impl PeerId {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Whether this is the all-zero placeholder of a peer we have not met yet.
    pub fn is_unset(&self) -> bool {
        self.0 == [0u8; PUBLIC_KEY_SIZE]
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Derive the public key belonging to a private key.
pub fn calc_public_key(private: &[u8; PRIVATE_KEY_SIZE]) -> PeerId {
    let secret = StaticSecret::from(*private);
    PeerId(PublicKey::from(&secret).to_bytes())
}

/// The client's long-term keypair.
///
/// The private key is zeroized on drop.
#[derive(Clone)]
pub struct Identity {
    /// Private key (32 bytes) - zeroized on drop
    private: [u8; PRIVATE_KEY_SIZE],
    /// Public key derived from `private`
    public: PeerId,
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self::from_private_key(secret.to_bytes())
    }

    /// Install an existing private key and derive its public key.
    pub fn from_private_key(private: [u8; PRIVATE_KEY_SIZE]) -> Self {
        let public = calc_public_key(&private);
        Self { private, public }
    }

    /// Our peer id (the public key).
    pub fn peer_id(&self) -> PeerId {
        self.public
    }

    /// Get the private key.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material. It is meant
    /// for the handshake layer only.
    pub fn private_key(&self) -> &[u8; PRIVATE_KEY_SIZE] {
        &self.private
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

impl Drop for Identity {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}
