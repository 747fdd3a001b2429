//! D-Bus Unix Transport Server Library
//!
//! A listening D-Bus peer: it accepts connections on a Unix domain socket,
//! runs the server side of the SASL handshake and answers every method call
//! with a reply carrying the same body. `org.freedesktop.DBus.Hello` is
//! answered with a unique connection name the way a bus daemon would.

use std::{
    io::{self, BufReader},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use dbus_unix_common::{
    address::{BusAddress, SocketAddress},
    config::TransportConfig,
    error::Error,
    frame::{Flags, Frame, FrameReader, FrameWriter, MessageType},
    marshal::Value,
    platform_socket::{lookup_user, BusListener, BusSocket, PeerCredentials},
    sasl::ServerAuth,
};

mod settings;

pub use settings::{ServerSettings, DEFAULT_ADDRESS};

const BUS_NAME: &str = "org.freedesktop.DBus";
const BUS_PATH: &str = "/org/freedesktop/DBus";

/// An echo peer listening on a Unix domain socket
#[derive(Clone)]
pub struct BusServer {
    settings:    ServerSettings,
    address:     SocketAddress,
    config:      TransportConfig,
    auth:        ServerAuth,
    next_unique: Arc<AtomicU32>,
}

impl BusServer {
    /// Creates a server from settings; fails on an unusable address or GUID
    pub fn new(settings: ServerSettings) -> Result<Self> {
        let address = BusAddress::parse(&settings.address)
            .and_then(|a| a.socket_address())
            .with_context(|| format!("Invalid listen address '{}'", settings.address))?;

        let guid = settings
            .guid
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

        let config = settings.transport_config();
        let mut auth = ServerAuth::new(guid, &config).context("Invalid server GUID")?;
        if let Some(context) = &settings.cookie_context {
            auth = auth
                .with_cookie_context(context.clone())
                .context("Invalid cookie context")?;
        }

        tracing::info!(
            "Creating D-Bus echo server on {} (guid {}, mechanisms {:?})",
            address,
            auth.guid(),
            settings.mechanisms
        );

        Ok(Self {
            settings,
            address,
            config,
            auth,
            next_unique: Arc::new(AtomicU32::new(1)),
        })
    }

    /// Address the server listens on
    pub fn address(&self) -> &SocketAddress {
        &self.address
    }

    /// GUID announced to clients
    pub fn guid(&self) -> &str {
        self.auth.guid()
    }

    /// Bind the listening socket without accepting yet
    pub fn bind(&self) -> Result<BusListener> {
        let listener = BusListener::bind(&self.address)
            .with_context(|| format!("Failed to bind to socket: {}", self.address))?;
        tracing::info!("D-Bus echo server listening on: {}", self.address);
        Ok(listener)
    }

    /// Starts the server and handles incoming connections indefinitely.
    pub fn run(&self) -> Result<()> {
        let listener = self.bind()?;

        for connection in listener.incoming() {
            match connection {
                Ok(socket) => self.spawn_client(socket),
                Err(e) => tracing::error!("Connection error: {}", e),
            }
        }

        Ok(())
    }

    /// Starts the server; it stops once `running` is set to false.
    pub fn run_with_shutdown(&self, running: Arc<AtomicBool>) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener, running)
    }

    /// Accept on an already bound listener until `running` is set to false
    pub fn serve(&self, listener: BusListener, running: Arc<AtomicBool>) -> Result<()> {
        // non-blocking accept so the flag is polled
        listener
            .set_nonblocking(true)
            .context("Failed to set listener to non-blocking mode")?;

        while running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok(socket) => self.spawn_client(socket),
                Err(Error::Transport(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Sleep briefly to avoid busy waiting
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => tracing::error!("Connection error: {}", e),
            }
        }

        tracing::info!("Server shutdown signal received, stopping gracefully");
        Ok(())
    }

    fn spawn_client(&self, socket: BusSocket) {
        tracing::info!("New connection received");
        let server = self.clone();
        thread::spawn(move || {
            if let Err(e) = server.handle_client(socket) {
                tracing::error!("Client error: {:#}", e);
            }
        });
    }

    /// Authenticate one client and answer its frames until it hangs up
    fn handle_client(&self, socket: BusSocket) -> Result<()> {
        let credentials = match socket.peer_credentials() {
            Ok(creds) => {
                tracing::info!("Client PID: {}, UID: {}", creds.pid, creds.uid);
                Some(creds)
            }
            Err(e) => {
                tracing::warn!("Could not read client credentials: {}", e);
                None
            }
        };

        if self.settings.restrict_to_owner {
            let creds = credentials
                .as_ref()
                .ok_or_else(|| anyhow!("Client credentials are required but unavailable"))?;
            if !self.verify_client_user(creds) {
                return Err(anyhow!("Client user verification failed"));
            }
        }

        socket.set_read_timeout(self.config.handshake_deadline())?;
        socket.set_write_timeout(self.config.handshake_deadline())?;
        let mut reader = BufReader::new(socket.try_clone()?);
        let mut writer = socket.try_clone()?;

        let session = self
            .auth
            .authenticate(&mut reader, &mut writer, credentials.map(|c| c.uid))
            .context("Authentication failed")?;
        tracing::info!(
            "✓ Client authenticated via {} (unix fds: {})",
            session.mechanism,
            session.unix_fd
        );

        socket.set_read_timeout(None)?;
        socket.set_write_timeout(None)?;
        let max = self.config.max_message_size;
        let mut frames = FrameReader::new(reader, max);
        let mut replies = FrameWriter::new(writer, max);
        let mut serial = 0u32;

        loop {
            let frame = match frames.read_frame_with_fds() {
                Ok(frame) => frame,
                Err(Error::Transport(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    tracing::info!("Client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e).context("Failed to read frame"),
            };

            if let Some(reply) = self.reply_to(&frame)? {
                serial = serial.wrapping_add(1).max(1);
                replies
                    .write_frame_with_fds(&reply.with_serial(serial))
                    .context("Failed to send reply")?;
            }
        }
    }

    fn reply_to(&self, frame: &Frame) -> Result<Option<Frame>> {
        if frame.message_type() != MessageType::MethodCall
            || frame.flags().contains(Flags::NO_REPLY_EXPECTED)
        {
            tracing::debug!("Not answering {:?} serial={}", frame.message_type(), frame.serial());
            return Ok(None);
        }

        let reply = if frame.interface() == Some(BUS_NAME)
            && frame.path() == Some(BUS_PATH)
            && frame.member() == Some("Hello")
        {
            let unique = format!(":1.{}", self.next_unique.fetch_add(1, Ordering::Relaxed));
            tracing::info!("Assigned unique name {}", unique);
            Frame::method_return(frame)
                .with_sender(BUS_NAME)
                .with_body(&[Value::String(unique)])?
        } else {
            Frame::method_return(frame)
                .with_raw_body(frame.signature(), frame.body().to_vec())
                .with_fds(frame.fds().iter().cloned())
        };
        Ok(Some(reply))
    }

    /// Verifies that the client user is authorized to connect: UIDs must
    /// match, or the server runs as root via sudo and the client is the
    /// original sudo user.
    fn verify_client_user(&self, credentials: &PeerCredentials) -> bool {
        // SAFETY: getuid() is always safe to call - returns the real user ID
        let current_uid = unsafe { libc::getuid() };

        if credentials.uid == current_uid {
            tracing::info!(
                "✓ Client UID {} matches server UID {}",
                credentials.uid,
                current_uid
            );
            return true;
        }

        if current_uid == 0 {
            match std::env::var("SUDO_USER") {
                Ok(sudo_user) => match lookup_user(&sudo_user) {
                    Ok((sudo_uid, _)) if credentials.uid == sudo_uid => {
                        tracing::info!(
                            "✓ Client UID {} matches original sudo user '{}' (UID {})",
                            credentials.uid,
                            sudo_user,
                            sudo_uid
                        );
                        return true;
                    }
                    Ok((sudo_uid, _)) => tracing::warn!(
                        "✗ Client UID {} does not match sudo user '{}' (UID {})",
                        credentials.uid,
                        sudo_user,
                        sudo_uid
                    ),
                    Err(e) => tracing::warn!(
                        "⚠️  Failed to get UID for sudo user '{}': {}",
                        sudo_user,
                        e
                    ),
                },
                Err(_) => tracing::warn!("⚠️  Server running as root but SUDO_USER not set"),
            }
        }

        tracing::warn!(
            "✗ User verification failed: client UID {} != server UID {}",
            credentials.uid,
            current_uid
        );
        false
    }
}
