use std::{
    fmt,
    io::BufReader,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Mutex, MutexGuard, OnceLock, PoisonError,
    },
};

use dbus_unix_common::{
    address::SocketAddress,
    config::TransportConfig,
    error::{Error, Result},
    frame::{Frame, FrameReader, FrameWriter},
    platform_socket::{connect_socket, BusSocket, PeerCredentials},
    sasl::{AuthMechanism, ClientAuth, Session},
};

/// Lifecycle of a [`Connection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Ready => "ready",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Everything that exists once the handshake succeeded
struct Channel {
    reader:  Mutex<FrameReader<BufReader<BusSocket>>>,
    writer:  Mutex<FrameWriter<BusSocket>>,
    control: BusSocket,
    session: Session,
    peer:    Option<PeerCredentials>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An authenticated D-Bus connection over a Unix domain socket.
///
/// `send` and `receive` may be called from different threads at the same
/// time; concurrent senders are serialized. `close` may be called from any
/// thread and wakes up a blocked `receive` or a handshake in progress.
pub struct Connection {
    address:   SocketAddress,
    config:    TransportConfig,
    state:     Mutex<ConnectionState>,
    // socket of a handshake in progress; locked after `state`
    handshake: Mutex<Option<BusSocket>>,
    channel:   OnceLock<Channel>,
    closed:    AtomicBool,
    serial:    AtomicU32,
}

impl Connection {
    /// Creates a connection in the `Disconnected` state; call
    /// [`establish`](Self::establish) to connect and authenticate
    pub fn new(address: SocketAddress, config: TransportConfig) -> Self {
        Self {
            address,
            config,
            state: Mutex::new(ConnectionState::Disconnected),
            handshake: Mutex::new(None),
            channel: OnceLock::new(),
            closed: AtomicBool::new(false),
            serial: AtomicU32::new(1),
        }
    }

    /// Connect and authenticate with a single mechanism, using settings from
    /// the environment for everything else
    pub fn open(address: &SocketAddress, mechanism: AuthMechanism) -> Result<Self> {
        Self::open_with_config(address, TransportConfig::from_env().with_mechanism(mechanism))
    }

    /// Connect and authenticate with an explicit configuration
    pub fn open_with_config(address: &SocketAddress, config: TransportConfig) -> Result<Self> {
        let connection = Self::new(address.clone(), config);
        connection.establish()?;
        Ok(connection)
    }

    /// Run the connector and the SASL handshake. On failure the connection
    /// ends up `Closed` and the socket is released. A concurrent `close`
    /// interrupts the handshake, which then fails with `ConnectionClosed`.
    pub fn establish(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            match *state {
                ConnectionState::Disconnected => *state = ConnectionState::Connecting,
                ConnectionState::Ready => return Ok(()),
                ConnectionState::Closed => return Err(Error::ConnectionClosed),
                ConnectionState::Connecting | ConnectionState::Authenticating => {
                    return Err(Error::NotReady)
                }
            }
        }

        let result = self.connect_and_authenticate();
        let mut state = lock(&self.state);
        lock(&self.handshake).take();

        match result {
            Ok(channel) => {
                if self.closed.load(Ordering::SeqCst) {
                    let _ = channel.control.shutdown();
                    *state = ConnectionState::Closed;
                    return Err(Error::ConnectionClosed);
                }
                tracing::info!(
                    "Connection to {} ready (mechanism {}, guid {})",
                    self.address,
                    channel.session.mechanism,
                    channel.session.guid
                );
                // only reachable once, guarded by the Connecting transition
                let _ = self.channel.set(channel);
                *state = ConnectionState::Ready;
                Ok(())
            }
            Err(e) => {
                *state = ConnectionState::Closed;
                if self.closed.swap(true, Ordering::SeqCst) {
                    tracing::debug!("Handshake with {} cancelled by close: {}", self.address, e);
                    return Err(Error::ConnectionClosed);
                }
                tracing::warn!("Failed to establish connection to {}: {}", self.address, e);
                Err(e)
            }
        }
    }

    fn connect_and_authenticate(&self) -> Result<Channel> {
        let socket = connect_socket(&self.address)?;

        let peer = match socket.peer_credentials() {
            Ok(creds) => {
                tracing::debug!(
                    "Peer credentials: PID={}, UID={}, GID={}",
                    creds.pid,
                    creds.uid,
                    creds.gid
                );
                Some(creds)
            }
            Err(e) => {
                tracing::debug!("Peer credentials unavailable: {}", e);
                None
            }
        };

        self.enter_authenticating(&socket)?;
        socket.set_read_timeout(self.config.handshake_deadline())?;
        socket.set_write_timeout(self.config.handshake_deadline())?;

        let mut reader = BufReader::new(socket.try_clone()?);
        let mut writer = socket.try_clone()?;
        let session = ClientAuth::new(&self.config).authenticate(&mut reader, &mut writer)?;

        socket.set_read_timeout(None)?;
        socket.set_write_timeout(self.config.write_timeout)?;

        let max = self.config.max_message_size;
        Ok(Channel {
            // keeps whatever the handshake reader buffered past BEGIN
            reader: Mutex::new(FrameReader::new(reader, max)),
            writer: Mutex::new(FrameWriter::new(writer, max)),
            control: socket,
            session,
            peer,
        })
    }

    /// Move to `Authenticating` unless closed meanwhile, leaving a handle
    /// that `close` can shut down
    fn enter_authenticating(&self, socket: &BusSocket) -> Result<()> {
        let mut state = lock(&self.state);
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        *lock(&self.handshake) = Some(socket.try_clone()?);
        *state = ConnectionState::Authenticating;
        Ok(())
    }

    fn ready_channel(&self) -> Result<&Channel> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        self.channel.get().ok_or(Error::NotReady)
    }

    /// Write one frame. Blocks while another thread is sending. File
    /// descriptors attached to the frame need unix fd passing to have been
    /// agreed during the handshake.
    pub fn send(&self, frame: &Frame) -> Result<()> {
        let channel = self.ready_channel()?;
        if !frame.fds().is_empty() && !channel.session.unix_fd {
            return Err(Error::ProtocolViolation(
                "unix fd passing was not agreed with the peer".into(),
            ));
        }
        let result = lock(&channel.writer).write_frame_with_fds(frame);
        match result {
            // local validation failed before anything reached the socket
            Err(e @ (Error::FrameTooLarge { .. } | Error::ProtocolViolation(_))) => Err(e),
            Err(e) => Err(self.fail(e)),
            Ok(()) => Ok(()),
        }
    }

    /// Block until one complete frame has arrived
    pub fn receive(&self) -> Result<Frame> {
        let channel = self.ready_channel()?;
        let result = lock(&channel.reader).read_frame_with_fds();
        result.map_err(|e| self.fail(e))
    }

    /// Close the connection. Idempotent; a `receive` blocked in another
    /// thread returns [`Error::ConnectionClosed`].
    pub fn close(&self) -> Result<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        self.teardown();
        tracing::info!("Connection to {} closed", self.address);
        Ok(())
    }

    /// Tear down after a fatal error, unless a concurrent close got there
    /// first in which case the caller sees `ConnectionClosed`
    fn fail(&self, err: Error) -> Error {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Error::ConnectionClosed;
        }
        tracing::warn!("Closing connection to {} after error: {}", self.address, err);
        self.teardown();
        err
    }

    fn teardown(&self) {
        let mut state = lock(&self.state);
        *state = ConnectionState::Closed;
        let pending = lock(&self.handshake).take();
        let sockets = pending.iter().chain(self.channel.get().map(|c| &c.control));
        for socket in sockets {
            if let Err(e) = socket.shutdown() {
                tracing::debug!("Socket shutdown failed: {}", e);
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Handshake outcome, once ready
    pub fn session(&self) -> Option<&Session> {
        self.channel.get().map(|c| &c.session)
    }

    /// Credentials of the bus process, if the platform reports them
    pub fn peer_credentials(&self) -> Option<PeerCredentials> {
        self.channel.get().and_then(|c| c.peer)
    }

    /// Next serial for an outgoing frame; never 0
    pub fn next_serial(&self) -> u32 {
        loop {
            let serial = self.serial.fetch_add(1, Ordering::Relaxed);
            if serial != 0 {
                return serial;
            }
        }
    }

    pub fn address(&self) -> &SocketAddress {
        &self.address
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("state", &self.state())
            .field("session", &self.session())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn operations_before_establish_are_not_ready() {
        let conn = Connection::new(
            SocketAddress::path("/nonexistent/bus").unwrap(),
            TransportConfig::new(),
        );
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(matches!(conn.receive(), Err(Error::NotReady)));
        let frame = Frame::method_call("/", "Ping").with_serial(1);
        assert!(matches!(conn.send(&frame), Err(Error::NotReady)));
        assert!(conn.session().is_none());
    }

    #[test]
    fn failed_establish_closes() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::new(
            SocketAddress::path(dir.path().join("missing")).unwrap(),
            TransportConfig::new(),
        );
        assert!(matches!(conn.establish(), Err(Error::AddressNotFound { .. })));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(conn.establish(), Err(Error::ConnectionClosed)));
        assert!(matches!(conn.receive(), Err(Error::ConnectionClosed)));
    }

    #[test]
    fn close_is_idempotent_without_a_socket() {
        let conn = Connection::new(SocketAddress::path("/x").unwrap(), TransportConfig::new());
        conn.close().unwrap();
        conn.close().unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(conn.establish(), Err(Error::ConnectionClosed)));
    }

    #[test]
    fn serials_are_unique_across_threads() {
        let conn = Arc::new(Connection::new(
            SocketAddress::path("/x").unwrap(),
            TransportConfig::new(),
        ));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let conn = conn.clone();
                std::thread::spawn(move || (0..100).map(|_| conn.next_serial()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<u32> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 400);
        assert!(!all.contains(&0));
    }
}
