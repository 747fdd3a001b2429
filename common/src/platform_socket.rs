use std::{
    collections::VecDeque,
    ffi::CString,
    fs,
    io::{self, IoSlice, IoSliceMut, Read, Write},
    net::Shutdown,
    os::{
        fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
        unix::{
            ffi::OsStrExt,
            fs::{FileTypeExt, PermissionsExt},
            net::{UnixListener, UnixStream},
        },
    },
    path::Path,
    time::Duration,
};

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
#[cfg(any(target_os = "linux", target_os = "android"))]
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials as PeerCredentialsOpt};

use crate::{
    address::SocketAddress,
    error::{Error, Result},
    frame::{FdSink, FdSource, MAX_UNIX_FDS},
};

/// Credentials of the process on the other end of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    /// Process ID of the peer
    pub pid: u32,
    /// User ID of the peer
    pub uid: u32,
    /// Group ID of the peer
    pub gid: u32,
}

/// Connected Unix domain socket
///
/// Reads go through `recvmsg`, so file descriptors the peer attaches are
/// queued on this handle until a frame claims them.
#[derive(Debug)]
pub struct BusSocket {
    stream:   UnixStream,
    address:  SocketAddress,
    received: VecDeque<OwnedFd>,
}

impl BusSocket {
    /// Wrap an already connected stream
    pub fn from_stream(stream: UnixStream, address: SocketAddress) -> Self {
        Self {
            stream,
            address,
            received: VecDeque::new(),
        }
    }

    /// Address this socket is connected to (or accepted on)
    pub fn address(&self) -> &SocketAddress {
        &self.address
    }

    /// Set the socket to blocking or non-blocking mode
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.stream.set_nonblocking(nonblocking)
    }

    /// Set read timeout for the socket
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    /// Set write timeout for the socket
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_write_timeout(timeout)
    }

    /// Another handle to the same OS socket
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self::from_stream(self.stream.try_clone()?, self.address.clone()))
    }

    /// Shut down both directions, waking up any thread blocked on this socket
    pub fn shutdown(&self) -> Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // peer already went away
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Extract the peer's credentials from the kernel
    pub fn peer_credentials(&self) -> Result<PeerCredentials> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            let creds = getsockopt(&self.stream, PeerCredentialsOpt)
                .map_err(|errno| Error::Transport(io::Error::from(errno)))?;

            Ok(PeerCredentials {
                pid: creds.pid() as u32,
                uid: creds.uid(),
                gid: creds.gid(),
            })
        }

        #[cfg(target_os = "macos")]
        {
            use std::os::unix::io::AsRawFd;

            let fd = self.stream.as_raw_fd();
            let mut uid: libc::uid_t = 0;
            let mut gid: libc::gid_t = 0;

            // SAFETY: getpeereid is safe to call with a valid file descriptor and
            // mutable references to uid_t and gid_t on the stack
            if unsafe { libc::getpeereid(fd, &mut uid, &mut gid) } != 0 {
                return Err(io::Error::last_os_error().into());
            }

            let mut pid: libc::pid_t = 0;
            let mut pid_len = std::mem::size_of::<libc::pid_t>() as libc::socklen_t;

            // SAFETY: getsockopt is safe with a valid fd, a valid level/option pair
            // and a buffer whose size matches pid_len
            let result = unsafe {
                libc::getsockopt(
                    fd,
                    libc::SOL_LOCAL,
                    libc::LOCAL_PEERPID,
                    &mut pid as *mut _ as *mut libc::c_void,
                    &mut pid_len,
                )
            };
            if result != 0 {
                return Err(io::Error::last_os_error().into());
            }

            tracing::debug!("macOS peer credentials: PID={}, UID={}", pid, uid);

            Ok(PeerCredentials {
                pid: pid as u32,
                uid,
                gid,
            })
        }

        #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
        {
            Err(Error::Transport(io::Error::new(
                io::ErrorKind::Unsupported,
                "peer credentials are not supported on this platform",
            )))
        }
    }

    pub fn get_ref(&self) -> &UnixStream {
        &self.stream
    }

    pub fn into_stream(self) -> UnixStream {
        self.stream
    }
}

impl Read for BusSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut iov = [IoSliceMut::new(buf)];
        let mut space = nix::cmsg_space!([RawFd; MAX_UNIX_FDS]);
        let msg = recvmsg::<()>(self.stream.as_raw_fd(), &mut iov, Some(&mut space), recv_flags())
            .map_err(io::Error::from)?;

        match msg.cmsgs() {
            Ok(cmsgs) => {
                for cmsg in cmsgs {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        tracing::trace!("Received {} file descriptors", fds.len());
                        // SAFETY: SCM_RIGHTS installs fresh descriptors in this
                        // process that nothing else owns
                        self.received
                            .extend(fds.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
                    }
                }
            }
            Err(_) => tracing::warn!("Ancillary data was truncated, file descriptors were lost"),
        }
        Ok(msg.bytes)
    }
}

fn recv_flags() -> MsgFlags {
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    {
        MsgFlags::MSG_CMSG_CLOEXEC
    }
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        MsgFlags::empty()
    }
}

impl FdSource for BusSocket {
    fn take_fds(&mut self, count: usize) -> Vec<OwnedFd> {
        let count = count.min(self.received.len());
        self.received.drain(..count).collect()
    }
}

impl FdSink for BusSocket {
    fn write_with_fds(&mut self, buf: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
        let raw: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
        let cmsgs = [ControlMessage::ScmRights(&raw)];
        sendmsg::<()>(
            self.stream.as_raw_fd(),
            &[IoSlice::new(buf)],
            &cmsgs,
            MsgFlags::empty(),
            None,
        )
        .map_err(io::Error::from)
    }
}

impl Write for BusSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn abstract_addr(name: &str) -> io::Result<std::os::unix::net::SocketAddr> {
    #[cfg(target_os = "android")]
    use std::os::android::net::SocketAddrExt;
    #[cfg(target_os = "linux")]
    use std::os::linux::net::SocketAddrExt;

    std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn abstract_unsupported() -> Error {
    Error::InvalidAddress("abstract sockets are only available on Linux".into())
}

/// Connect to a Unix domain socket in blocking mode
pub fn connect_socket(address: &SocketAddress) -> Result<BusSocket> {
    tracing::debug!("Attempting to connect to {}", address);

    let stream = match address {
        SocketAddress::Path(path) => {
            match fs::metadata(path) {
                Ok(metadata) if metadata.file_type().is_socket() => {
                    tracing::debug!(
                        "Socket file exists with permissions {:o}",
                        metadata.permissions().mode() & 0o777
                    );
                }
                Ok(_) => tracing::warn!("{} exists but is not a socket", path.display()),
                Err(e) => tracing::debug!("Cannot stat {}: {}", path.display(), e),
            }
            UnixStream::connect(path)
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        SocketAddress::Abstract(name) => {
            abstract_addr(name).and_then(|addr| UnixStream::connect_addr(&addr))
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        SocketAddress::Abstract(_) => return Err(abstract_unsupported()),
    };

    match stream {
        Ok(stream) => {
            stream.set_nonblocking(false)?;
            tracing::info!("Connected to {}", address);
            Ok(BusSocket::from_stream(stream, address.clone()))
        }
        Err(e) => {
            tracing::error!("Connection to {} failed: {} (kind: {:?})", address, e, e.kind());
            Err(Error::from_connect_io(e, address))
        }
    }
}

/// Listening Unix domain socket
#[derive(Debug)]
pub struct BusListener {
    listener: UnixListener,
    address:  SocketAddress,
}

impl BusListener {
    /// Bind to `address`. A stale socket file left behind by a dead server is
    /// removed first; a live one is an error.
    pub fn bind(address: &SocketAddress) -> Result<Self> {
        tracing::info!("Setting up Unix socket server on {}", address);

        let listener = match address {
            SocketAddress::Path(path) => bind_path(path)?,
            #[cfg(any(target_os = "linux", target_os = "android"))]
            SocketAddress::Abstract(name) => abstract_addr(name)
                .and_then(|addr| UnixListener::bind_addr(&addr))
                .map_err(|e| {
                    tracing::error!("Failed to bind abstract socket {}: {}", name, e);
                    Error::Transport(e)
                })?,
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            SocketAddress::Abstract(_) => return Err(abstract_unsupported()),
        };

        tracing::info!("Unix socket server setup complete!");
        Ok(Self {
            listener,
            address: address.clone(),
        })
    }

    pub fn local_address(&self) -> &SocketAddress {
        &self.address
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.listener.set_nonblocking(nonblocking)
    }

    /// Accept one connection; the returned socket is always blocking
    pub fn accept(&self) -> Result<BusSocket> {
        let (stream, _) = self.listener.accept()?;
        stream.set_nonblocking(false)?;
        Ok(BusSocket::from_stream(stream, self.address.clone()))
    }

    /// Get iterator over incoming connections
    pub fn incoming(&self) -> Incoming<'_> {
        Incoming { listener: self }
    }
}

impl Drop for BusListener {
    fn drop(&mut self) {
        if let SocketAddress::Path(path) = &self.address {
            match fs::remove_file(path) {
                Ok(()) => tracing::debug!("Removed socket file {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove socket file {}: {}", path.display(), e),
            }
        }
    }
}

/// Iterator over incoming connections
pub struct Incoming<'a> {
    listener: &'a BusListener,
}

impl Iterator for Incoming<'_> {
    type Item = Result<BusSocket>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.listener.accept())
    }
}

fn bind_path(path: &Path) -> Result<UnixListener> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_socket() => {
            if UnixStream::connect(path).is_ok() {
                return Err(Error::Transport(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("another server is listening on {}", path.display()),
                )));
            }
            tracing::warn!("Existing socket file found, removing it...");
            fs::remove_file(path).map_err(|e| {
                tracing::error!("Failed to remove old socket file: {}", e);
                Error::Transport(e)
            })?;
            tracing::info!("Old socket file removed successfully");
        }
        Ok(_) => {
            return Err(Error::InvalidAddress(format!(
                "{} exists and is not a socket",
                path.display()
            )));
        }
        Err(_) => tracing::debug!("No existing socket file found"),
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.is_dir() {
            return Err(Error::InvalidAddress(format!(
                "parent '{}' is not an accessible directory",
                parent.display()
            )));
        }
    }

    tracing::debug!("Binding to socket...");
    let listener = UnixListener::bind(path).map_err(|e| {
        tracing::error!("Failed to bind to socket: {} (kind: {:?})", e, e.kind());
        Error::Transport(e)
    })?;

    tracing::debug!("Setting socket permissions and ownership...");
    match fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        Ok(()) => tracing::debug!("Socket permissions set to 600 (owner read/write only)"),
        Err(e) => tracing::warn!("Failed to set socket permissions: {}", e),
    }

    // SAFETY: geteuid() is always safe to call
    if unsafe { libc::geteuid() } == 0 {
        if let Ok(sudo_user) = std::env::var("SUDO_USER") {
            tracing::info!(
                "Detected sudo execution, changing socket ownership to user: {}",
                sudo_user
            );
            match lookup_user(&sudo_user) {
                Ok((uid, gid)) => chown(path, uid, gid),
                Err(e) => tracing::warn!("Failed to get user IDs for {}: {}", sudo_user, e),
            }
        }
    }

    Ok(listener)
}

fn chown(path: &Path, uid: u32, gid: u32) {
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        tracing::warn!("Socket path {} contains a NUL byte", path.display());
        return;
    };

    // SAFETY: chown is safe when called with a valid C string pointer and
    // uid/gid values that came from getpwnam
    if unsafe { libc::chown(c_path.as_ptr(), uid, gid) } == 0 {
        tracing::info!("Socket ownership changed to {}:{}", uid, gid);
    } else {
        tracing::warn!(
            "Failed to change socket ownership: {}",
            io::Error::last_os_error()
        );
    }
}

/// Look up a user's UID and primary GID by name
pub fn lookup_user(username: &str) -> Result<(u32, u32)> {
    let c_name = CString::new(username)
        .map_err(|_| Error::InvalidAddress(format!("user name '{username}' contains NUL")))?;

    // SAFETY: getpwnam is safe when called with a valid C string pointer. The
    // returned pointer is either null (handled) or points to a valid passwd
    // struct that we only read from before returning.
    unsafe {
        let passwd = libc::getpwnam(c_name.as_ptr());
        if passwd.is_null() {
            return Err(Error::Transport(io::Error::new(
                io::ErrorKind::NotFound,
                format!("user '{username}' not found"),
            )));
        }
        Ok(((*passwd).pw_uid, (*passwd).pw_gid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_is_address_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let addr = SocketAddress::path(dir.path().join("absent")).unwrap();
        let err = connect_socket(&addr).unwrap_err();
        assert!(matches!(err, Error::AddressNotFound { .. }), "{err:?}");
    }

    #[test]
    fn stale_socket_file_is_connection_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale");
        drop(UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let err = connect_socket(&SocketAddress::path(&path).unwrap()).unwrap_err();
        assert!(matches!(err, Error::ConnectionRefused { .. }), "{err:?}");
    }

    #[test]
    fn listener_replaces_stale_file_and_reports_peer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bus");
        drop(UnixListener::bind(&path).unwrap());

        let addr = SocketAddress::path(&path).unwrap();
        let listener = BusListener::bind(&addr).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        let client = connect_socket(&addr).unwrap();
        let server = listener.accept().unwrap();

        #[cfg(target_os = "linux")]
        {
            let creds = server.peer_credentials().unwrap();
            assert_eq!(creds.uid, unsafe { libc::getuid() });
            assert_eq!(creds.pid, std::process::id());
            assert_eq!(client.peer_credentials().unwrap().uid, creds.uid);
        }

        drop(listener);
        assert!(!path.exists());
        drop((client, server));
    }

    #[test]
    fn live_socket_is_not_stolen() {
        let dir = tempfile::tempdir().unwrap();
        let addr = SocketAddress::path(dir.path().join("bus")).unwrap();
        let _first = BusListener::bind(&addr).unwrap();
        assert!(BusListener::bind(&addr).is_err());
    }

    #[test]
    fn regular_file_is_not_removed() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let addr = SocketAddress::path(file.path()).unwrap();
        assert!(matches!(BusListener::bind(&addr), Err(Error::InvalidAddress(_))));
        assert!(file.path().exists());
    }

    fn socket_pair() -> (BusSocket, BusSocket) {
        let (a, b) = UnixStream::pair().unwrap();
        let addr = SocketAddress::path("/socketpair").unwrap();
        (
            BusSocket::from_stream(a, addr.clone()),
            BusSocket::from_stream(b, addr),
        )
    }

    #[test]
    fn descriptors_travel_with_their_frame() {
        use std::io::BufReader;

        use crate::{
            config::MAX_MESSAGE_SIZE,
            frame::{Frame, FrameReader, FrameWriter},
            marshal::Value,
        };

        let (left, right) = socket_pair();
        let (mut near, far) = UnixStream::pair().unwrap();

        let call = Frame::method_call("/org/example", "Take")
            .with_serial(7)
            .with_body(&[Value::UnixFd(0)])
            .unwrap()
            .with_fds([OwnedFd::from(far)]);
        FrameWriter::new(left, MAX_MESSAGE_SIZE)
            .write_frame_with_fds(&call)
            .unwrap();

        let mut reader = FrameReader::new(BufReader::new(right), MAX_MESSAGE_SIZE);
        let received = reader.read_frame_with_fds().unwrap();
        assert_eq!(received.fds().len(), 1);
        assert_eq!(received.body_values().unwrap(), vec![Value::UnixFd(0)]);

        let mut passed = UnixStream::from(received.fds()[0].try_clone().unwrap());
        passed.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        near.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn announced_descriptors_that_never_arrive_are_a_violation() {
        use std::io::BufReader;

        use crate::{
            config::MAX_MESSAGE_SIZE,
            frame::{Frame, FrameReader},
        };

        let (mut left, right) = socket_pair();
        let (_near, far) = UnixStream::pair().unwrap();
        let call = Frame::method_call("/org/example", "Take")
            .with_serial(7)
            .with_fds([OwnedFd::from(far)]);
        // bytes only, no SCM_RIGHTS
        left.write_all(&call.encode(MAX_MESSAGE_SIZE).unwrap()).unwrap();

        let err = FrameReader::new(BufReader::new(right), MAX_MESSAGE_SIZE)
            .read_frame_with_fds()
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)), "{err:?}");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn abstract_names_connect_and_refuse() {
        let name = format!("dbus-unix-test-{}", std::process::id());
        let addr = SocketAddress::abstract_name(name).unwrap();
        let listener = BusListener::bind(&addr).unwrap();
        let mut client = connect_socket(&addr).unwrap();
        let mut server = listener.accept().unwrap();
        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        drop(listener);

        let missing = SocketAddress::abstract_name("dbus-unix-test-nobody-home").unwrap();
        assert!(matches!(
            connect_socket(&missing),
            Err(Error::ConnectionRefused { .. })
        ));
    }

    #[test]
    fn shutdown_unblocks_a_reader() {
        let (a, b) = UnixStream::pair().unwrap();
        let addr = SocketAddress::path("/pair").unwrap();
        let socket = BusSocket::from_stream(a, addr);
        let mut reader = socket.try_clone().unwrap();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 1];
            reader.read(&mut buf)
        });
        std::thread::sleep(Duration::from_millis(50));
        socket.shutdown().unwrap();
        assert_eq!(handle.join().unwrap().unwrap(), 0);
        drop(b);
    }
}
