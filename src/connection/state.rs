//! Connection state machine types.
//!
//! ```text
//!            connect request            handshake done
//!  ┌────────┐ ───────────────► ┌────────────┐ ─────────────► ┌───────────┐
//!  │ Closed │                  │ Connecting │                │ Connected │
//!  └────────┘ ◄─────┐          └─────┬──────┘                └─────┬─────┘
//!                   │                │ I/O failure / parent error  │
//!                   │                ▼                             │
//!                   │           ┌─────────┐ ◄──────────────────────┘
//!                   └───────────│  Error  │
//!                  close done   └─────────┘
//! ```
//!
//! Any non-closed state goes to `Closed` once a close request has been
//! processed or a relay parent is terminated with `Closed`.
//!
//! The close-pending marker ([`CloseFlag`]) lives outside the state enum:
//! a close request and a failure may land at the same moment on different
//! threads and must not overwrite each other.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ConnectionState {
    /// Not connected. Initial and resting state.
    #[default]
    Closed = 0,
    /// Connect or handshake in flight.
    Connecting = 1,
    /// Usable for data transfer.
    Connected = 2,
    /// Failed; see `last_result()` for the reason.
    Error = 3,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Closed,
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Error,
        }
    }

    /// Whether a connect or an established link is in progress.
    pub fn in_use(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Role a connection plays. Assigned on connect, kept until it is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    /// No role yet.
    #[default]
    None,
    /// Direct link to the rendezvous/relay server.
    ServerLink,
    /// Tunnel to a peer, forwarded through a server link.
    PeerForward,
    /// Device pairing session.
    Pairing,
}

impl Mode {
    /// Roles that handle inbound data internally and don't accept a user
    /// receive callback while in use.
    pub fn has_internal_handler(self) -> bool {
        !matches!(self, Self::PeerForward)
    }
}

/// Atomic cell holding a [`ConnectionState`].
///
/// Written only by the event-processing thread; readable from anywhere.
#[derive(Debug, Default)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

const IDLE: u8 = 0;
const CLOSING: u8 = 1;
const CONNECTING: u8 = 2;

/// Which operation currently holds a [`CloseFlag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlagHolder {
    /// A close request is queued.
    Close,
    /// The event loop is moving the connection to `Connecting`.
    Connect,
}

/// Close-pending marker.
///
/// Set by whichever thread wins the race to request a close, cleared by the
/// event loop when the close executes. The event loop also holds it, through
/// a [`ConnectGuard`], while it accepts a connect, so a close can never be
/// queued against a connection that is about to start connecting.
#[derive(Debug, Default)]
pub(crate) struct CloseFlag(AtomicU8);

impl CloseFlag {
    fn holder(raw: u8) -> FlagHolder {
        if raw == CONNECTING {
            FlagHolder::Connect
        } else {
            FlagHolder::Close
        }
    }

    /// Claim the flag for a close request.
    pub(crate) fn try_claim(&self) -> Result<(), FlagHolder> {
        self.0
            .compare_exchange(IDLE, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(Self::holder)
    }

    /// Hold the flag while a connect is accepted.
    pub(crate) fn try_lock_connect(&self) -> Result<ConnectGuard<'_>, FlagHolder> {
        self.0
            .compare_exchange(IDLE, CONNECTING, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ConnectGuard { flag: self })
            .map_err(Self::holder)
    }

    /// Drop a pending close. Leaves a connect hold alone.
    pub(crate) fn clear(&self) {
        let _ = self
            .0
            .compare_exchange(CLOSING, IDLE, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Whether a close is pending.
    pub(crate) fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire) == CLOSING
    }
}

/// Releases the connect hold on a [`CloseFlag`] when dropped.
#[derive(Debug)]
pub(crate) struct ConnectGuard<'a> {
    flag: &'a CloseFlag,
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        self.flag.0.store(IDLE, Ordering::Release);
    }
}
