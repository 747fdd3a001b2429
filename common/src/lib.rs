//! D-Bus Unix Transport Common Library
//!
//! Building blocks shared by the client and server ends of a D-Bus
//! connection over Unix domain sockets:
//!
//! - Socket addresses and the `unix:` address syntax
//! - Connecting and listening on path and abstract-namespace sockets
//! - The SASL handshake in both client and server roles
//! - The DBUS_COOKIE_SHA1 keyring
//! - Frame encoding and decoding with size limits
//! - Configuration and the error taxonomy
//!
//! Everything here is blocking and works on plain [`std::io::Read`] /
//! [`std::io::Write`] streams.
#![cfg(unix)]

/// Socket and bus address types
pub mod address;

/// Transport configuration and protocol limits
pub mod config;

/// DBUS_COOKIE_SHA1 keyring
pub mod cookie;

/// Error taxonomy
pub mod error;

/// Frame types, reader and writer
pub mod frame;

/// Basic value marshalling
pub mod marshal;

/// Unix domain socket connector and listener
pub mod platform_socket;

/// SASL handshake engine
pub mod sasl;

// Re-export commonly used types for convenience
pub use address::{BusAddress, SocketAddress};
pub use config::{TransportConfig, MAX_MESSAGE_SIZE, SYSTEM_BUS_SOCKET};
pub use error::{Error, Result};
pub use frame::{
    FdSink, FdSource, Flags, Frame, FrameReader, FrameWriter, MessageType, MAX_UNIX_FDS,
};
pub use marshal::{Endianness, Value};
pub use platform_socket::{connect_socket, BusListener, BusSocket, PeerCredentials};
pub use sasl::{AuthMechanism, ClientAuth, ServerAuth, Session};
