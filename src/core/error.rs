//! Error types for the SDG client core.

use std::fmt;

use thiserror::Error;

use crate::engine::ConnectionId;

/// Result classification stored on every connection.
///
/// This is the value returned by [`Connection::last_result`]; it survives the
/// operation that produced it so the caller can inspect it after observing an
/// `Error` state change.
///
/// [`Connection::last_result`]: crate::connection::Connection::last_result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ErrorKind {
    /// Nothing went wrong.
    #[default]
    NoError = 0,
    /// A buffer or bookkeeping allocation failed.
    MemoryError = 1,
    /// Operation is not valid for the current state or flags.
    WrongState = 2,
    /// Socket failure; the platform error code is valid.
    SocketError = 3,
    /// Generic terminal connection failure.
    Error = 4,
}

impl ErrorKind {
    /// Human readable description of the result.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoError => "no error",
            Self::MemoryError => "memory allocation error",
            Self::WrongState => "operation not valid in current state",
            Self::SocketError => "socket I/O error",
            Self::Error => "connection failed",
        }
    }

    /// Decode from the stored representation.
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::NoError,
            1 => Self::MemoryError,
            2 => Self::WrongState,
            3 => Self::SocketError,
            _ => Self::Error,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned synchronously by the public API.
#[derive(Debug, Error)]
pub enum SdgError {
    /// Operation is not valid for the connection's current state.
    #[error("wrong state: {0}")]
    WrongState(&'static str),

    /// Allocation failed.
    #[error("memory allocation failed: {0}")]
    Memory(String),

    /// Socket failure with platform error code.
    #[error("socket error (errno {errno})")]
    Socket {
        /// Platform error code.
        errno: i32,
    },

    /// The connection is not (or no longer) known to the engine.
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// The event loop has shut down and can no longer accept requests.
    #[error("event loop shut down")]
    Shutdown,

    /// Generic connection failure.
    #[error("connection failed: {0}")]
    Connection(String),
}

impl SdgError {
    /// Map onto the stored result taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::WrongState(_) | Self::UnknownConnection(_) => ErrorKind::WrongState,
            Self::Memory(_) => ErrorKind::MemoryError,
            Self::Socket { .. } => ErrorKind::SocketError,
            Self::Shutdown | Self::Connection(_) => ErrorKind::Error,
        }
    }

    /// Platform error code, zero unless this is a socket error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Socket { errno } => *errno,
            _ => 0,
        }
    }
}

impl From<std::collections::TryReserveError> for SdgError {
    fn from(e: std::collections::TryReserveError) -> Self {
        Self::Memory(e.to_string())
    }
}

/// Result alias for the public API.
pub type SdgResult<T> = Result<T, SdgError>;
