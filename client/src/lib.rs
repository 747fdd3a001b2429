//! D-Bus Unix Transport Client Library
//!
//! This crate provides [`Connection`], a blocking D-Bus connection over a
//! Unix domain socket. Opening a connection dials the socket, runs the SASL
//! handshake and leaves a channel that exchanges whole [`Frame`]s.
//!
//! # Example
//!
//! ```no_run
//! use dbus_unix_client::{AuthMechanism, Connection, Frame, SocketAddress, SYSTEM_BUS_SOCKET};
//!
//! # fn main() -> anyhow::Result<()> {
//! let address = SocketAddress::path(SYSTEM_BUS_SOCKET)?;
//! let conn = Connection::open(&address, AuthMechanism::External)?;
//!
//! let hello = Frame::method_call("/org/freedesktop/DBus", "Hello")
//!     .with_interface("org.freedesktop.DBus")
//!     .with_destination("org.freedesktop.DBus")
//!     .with_serial(conn.next_serial());
//! conn.send(&hello)?;
//!
//! let reply = conn.receive()?;
//! println!("Unique name: {:?}", reply.body_values()?);
//!
//! conn.close()?;
//! # Ok(())
//! # }
//! ```

mod connection;

pub use connection::*;
// Re-export important types from dbus-unix-common for convenience
pub use dbus_unix_common::{
    AuthMechanism, BusAddress, Error, Flags, Frame, MessageType, PeerCredentials, Result,
    Session, SocketAddress, TransportConfig, Value, SYSTEM_BUS_SOCKET,
};
