//! Transport error types.

use std::io;

use thiserror::Error;

use crate::core::ErrorKind;

/// Failures reported by the transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket level failure.
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    /// The remote end closed the link.
    #[error("connection closed by remote")]
    Closed,

    /// Malformed, unexpected or undecryptable packet.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Result kind to record on the connection.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::SocketError,
            Self::Closed | Self::Protocol(_) => ErrorKind::Error,
        }
    }

    /// Platform error code for socket failures, zero otherwise.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Io(e) => e.raw_os_error().unwrap_or(0),
            Self::Closed | Self::Protocol(_) => 0,
        }
    }
}

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
