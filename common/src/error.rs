use std::io;

use thiserror::Error;

/// Result type used throughout the transport crates
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while connecting, authenticating or exchanging frames
#[derive(Debug, Error)]
pub enum Error {
    /// No socket exists at the given address
    #[error("no socket found at {address}")]
    AddressNotFound {
        /// Address that was tried
        address: String,
    },

    /// The socket exists but this process may not connect to it
    #[error("permission denied connecting to {address}")]
    PermissionDenied {
        /// Address that was tried
        address: String,
    },

    /// Nothing is listening on the socket
    #[error("connection refused by {address}")]
    ConnectionRefused {
        /// Address that was tried
        address: String,
    },

    /// The address string or value could not be used
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The SASL exchange ended without the server accepting us
    #[error("authentication failed: {reason}")]
    AuthenticationFailed {
        /// Why the handshake gave up
        reason: String,
    },

    /// The peer did not answer a handshake step in time
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// A frame claims more bytes than the configured maximum
    #[error("frame of {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Size announced by the header (or produced by the writer)
        size: u64,
        /// Configured limit
        max:  u64,
    },

    /// The peer sent bytes that do not follow the wire protocol
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Underlying socket failure
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The connection has not finished its handshake yet
    #[error("connection is not ready")]
    NotReady,

    /// The connection was closed
    #[error("connection closed")]
    ConnectionClosed,
}

impl Error {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::ProtocolViolation(message.into())
    }

    pub(crate) fn auth_failed(reason: impl Into<String>) -> Self {
        Error::AuthenticationFailed {
            reason: reason.into(),
        }
    }

    /// Whether the error leaves the connection unusable
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::NotReady)
    }

    /// Map a handshake-time I/O failure, turning socket timeouts into
    /// [`Error::HandshakeTimeout`]
    pub fn from_handshake_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::HandshakeTimeout,
            _ => Error::Transport(err),
        }
    }

    /// Map a connect-time OS error for `address` into the connect taxonomy
    pub fn from_connect_io(err: io::Error, address: impl std::fmt::Display) -> Self {
        let address = address.to_string();
        match err.kind() {
            io::ErrorKind::NotFound => Error::AddressNotFound { address },
            io::ErrorKind::PermissionDenied => Error::PermissionDenied { address },
            io::ErrorKind::ConnectionRefused => Error::ConnectionRefused { address },
            _ => Error::Transport(err),
        }
    }
}
