//! Connection lifecycle against the echo server

use std::{
    collections::BTreeSet,
    io::{Read, Write},
    os::{
        fd::OwnedFd,
        unix::net::{UnixListener, UnixStream},
    },
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use dbus_unix_client::{
    AuthMechanism, Connection, ConnectionState, Error, Frame, MessageType, SocketAddress,
    TransportConfig, Value,
};
use dbus_unix_server::{BusServer, ServerSettings};
use tempfile::TempDir;

struct TestServer {
    dir:     TempDir,
    address: SocketAddress,
    running: Arc<AtomicBool>,
    handle:  Option<JoinHandle<anyhow::Result<()>>>,
}

impl TestServer {
    fn start() -> Self {
        Self::start_with(|settings| settings)
    }

    fn start_with(configure: impl FnOnce(ServerSettings) -> ServerSettings) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bus");
        let settings = configure(
            ServerSettings::new().with_address(format!("unix:path={}", path.display())),
        );
        let server = BusServer::new(settings).unwrap();
        let listener = server.bind().unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let r = running.clone();
        let handle = thread::spawn(move || server.serve(listener, r));

        Self {
            dir,
            address: SocketAddress::path(path).unwrap(),
            running,
            handle: Some(handle),
        }
    }

    fn connect(&self) -> Connection {
        Connection::open_with_config(&self.address, TransportConfig::new()).unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[test]
fn method_calls_are_echoed() {
    let server = TestServer::start();
    let conn = server.connect();
    assert_eq!(conn.state(), ConnectionState::Ready);
    assert_eq!(conn.session().unwrap().guid.len(), 32);

    let call = Frame::method_call("/org/example/Echo", "Echo")
        .with_interface("org.example.Echo")
        .with_serial(conn.next_serial())
        .with_body(&[
            Value::String("hello".into()),
            Value::Uint32(7),
            Value::ObjectPath("/a/b".into()),
        ])
        .unwrap();
    conn.send(&call).unwrap();

    let reply = conn.receive().unwrap();
    assert_eq!(reply.message_type(), MessageType::MethodReturn);
    assert_eq!(reply.reply_serial(), Some(call.serial()));
    assert_eq!(reply.signature(), "suo");
    assert_eq!(reply.body_values().unwrap(), call.body_values().unwrap());
}

#[test]
fn hello_returns_a_unique_name() {
    let server = TestServer::start();
    let conn = server.connect();

    let hello = Frame::method_call("/org/freedesktop/DBus", "Hello")
        .with_interface("org.freedesktop.DBus")
        .with_destination("org.freedesktop.DBus")
        .with_serial(conn.next_serial());
    conn.send(&hello).unwrap();
    let reply = conn.receive().unwrap();
    match reply.body_values().unwrap().as_slice() {
        [Value::String(name)] => assert!(name.starts_with(":1."), "{name}"),
        other => panic!("unexpected Hello reply {other:?}"),
    }
    assert_eq!(reply.sender(), Some("org.freedesktop.DBus"));
}

#[test]
fn close_is_idempotent_and_final() {
    let server = TestServer::start();
    let conn = server.connect();

    conn.close().unwrap();
    conn.close().unwrap();
    assert_eq!(conn.state(), ConnectionState::Closed);

    let call = Frame::method_call("/", "Ping").with_serial(conn.next_serial());
    assert!(matches!(conn.send(&call), Err(Error::ConnectionClosed)));
    assert!(matches!(conn.receive(), Err(Error::ConnectionClosed)));
    assert!(matches!(conn.establish(), Err(Error::ConnectionClosed)));
}

#[test]
fn close_wakes_a_blocked_receive() {
    let server = TestServer::start();
    let conn = Arc::new(server.connect());

    let receiver = {
        let conn = conn.clone();
        thread::spawn(move || conn.receive())
    };
    thread::sleep(Duration::from_millis(100));
    conn.close().unwrap();

    let result = receiver.join().unwrap();
    assert!(matches!(result, Err(Error::ConnectionClosed)), "{result:?}");
}

#[test]
fn concurrent_closes_all_succeed() {
    let server = TestServer::start();
    let conn = Arc::new(server.connect());

    let receiver = {
        let conn = conn.clone();
        thread::spawn(move || conn.receive())
    };
    thread::sleep(Duration::from_millis(100));

    let closers: Vec<_> = (0..4)
        .map(|_| {
            let conn = conn.clone();
            thread::spawn(move || conn.close())
        })
        .collect();
    for closer in closers {
        closer.join().unwrap().unwrap();
    }

    let result = receiver.join().unwrap();
    assert!(matches!(result, Err(Error::ConnectionClosed)), "{result:?}");
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[test]
fn concurrent_senders_do_not_interleave() {
    let server = TestServer::start();
    let conn = Arc::new(server.connect());

    let senders: Vec<_> = (0..4)
        .map(|t| {
            let conn = conn.clone();
            thread::spawn(move || {
                (0..25)
                    .map(|i| {
                        let call = Frame::method_call("/", "Echo")
                            .with_serial(conn.next_serial())
                            .with_body(&[Value::String(format!("{t}-{i}").repeat(50))])
                            .unwrap();
                        conn.send(&call).unwrap();
                        call.serial()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let sent: BTreeSet<u32> = senders
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    let received: BTreeSet<u32> = (0..sent.len())
        .map(|_| conn.receive().unwrap().reply_serial().unwrap())
        .collect();
    assert_eq!(sent, received);
}

#[test]
fn oversized_frames_are_refused_locally() {
    let server = TestServer::start();
    let config = TransportConfig::new().with_max_message_size(1024);
    let conn = Connection::open_with_config(&server.address, config).unwrap();

    let call = Frame::method_call("/", "Echo")
        .with_serial(conn.next_serial())
        .with_body(&[Value::String("x".repeat(4096))])
        .unwrap();
    assert!(matches!(conn.send(&call), Err(Error::FrameTooLarge { .. })));
    assert_eq!(conn.state(), ConnectionState::Ready);

    let small = Frame::method_call("/", "Echo").with_serial(conn.next_serial());
    conn.send(&small).unwrap();
    assert_eq!(conn.receive().unwrap().reply_serial(), Some(small.serial()));
}

#[test]
fn missing_socket_is_address_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let address = SocketAddress::path(dir.path().join("nobody-home")).unwrap();
    let err = Connection::open(&address, AuthMechanism::External).unwrap_err();
    assert!(matches!(err, Error::AddressNotFound { .. }), "{err:?}");
}

#[test]
fn stale_socket_is_connection_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stale");
    drop(UnixListener::bind(&path).unwrap());
    assert!(path.exists());

    let address = SocketAddress::path(&path).unwrap();
    let err = Connection::open(&address, AuthMechanism::External).unwrap_err();
    assert!(matches!(err, Error::ConnectionRefused { .. }), "{err:?}");
}

#[test]
fn unoffered_mechanism_is_rejected() {
    let server = TestServer::start();
    let config = TransportConfig::new().with_mechanism(AuthMechanism::Anonymous);
    let err = Connection::open_with_config(&server.address, config).unwrap_err();
    assert!(matches!(err, Error::AuthenticationFailed { .. }), "{err:?}");
}

#[test]
fn cookie_mechanism_with_a_shared_keyring() {
    let keyrings = tempfile::tempdir().unwrap();
    let keyring_dir = keyrings.path().join("keyrings");
    let server = TestServer::start_with(|settings| {
        settings
            .with_mechanisms([AuthMechanism::Cookie])
            .with_keyring_dir(&keyring_dir)
    });

    let config = TransportConfig::new()
        .with_mechanism(AuthMechanism::Cookie)
        .with_keyring_dir(&keyring_dir);
    let conn = Connection::open_with_config(&server.address, config).unwrap();
    assert_eq!(conn.session().unwrap().mechanism, AuthMechanism::Cookie);

    let call = Frame::method_call("/", "Ping").with_serial(conn.next_serial());
    conn.send(&call).unwrap();
    assert_eq!(conn.receive().unwrap().reply_serial(), Some(call.serial()));
}

#[test]
fn unix_fd_agreement_follows_server_settings() {
    let server = TestServer::start_with(|settings| settings.with_unix_fd(true));
    let config = TransportConfig::new().with_unix_fd_negotiation(true);
    let conn = Connection::open_with_config(&server.address, config).unwrap();
    assert!(conn.session().unwrap().unix_fd);

    let server = TestServer::start();
    let config = TransportConfig::new().with_unix_fd_negotiation(true);
    let conn = Connection::open_with_config(&server.address, config).unwrap();
    assert!(!conn.session().unwrap().unix_fd);
}

#[test]
fn descriptors_are_echoed_when_agreed() {
    let server = TestServer::start_with(|settings| settings.with_unix_fd(true));
    let config = TransportConfig::new().with_unix_fd_negotiation(true);
    let conn = Connection::open_with_config(&server.address, config).unwrap();

    let (mut near, far) = UnixStream::pair().unwrap();
    let call = Frame::method_call("/org/example/Echo", "Echo")
        .with_serial(conn.next_serial())
        .with_body(&[Value::UnixFd(0)])
        .unwrap()
        .with_fds([OwnedFd::from(far)]);
    conn.send(&call).unwrap();

    let reply = conn.receive().unwrap();
    assert_eq!(reply.unix_fds(), Some(1));
    assert_eq!(reply.fds().len(), 1);
    assert_eq!(reply.body_values().unwrap(), vec![Value::UnixFd(0)]);

    let mut echoed = UnixStream::from(reply.fds()[0].try_clone().unwrap());
    echoed.write_all(b"ping").unwrap();
    let mut buf = [0u8; 4];
    near.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");
}

#[test]
fn descriptors_need_agreement() {
    let server = TestServer::start();
    let conn = server.connect();
    assert!(!conn.session().unwrap().unix_fd);

    let (_near, far) = UnixStream::pair().unwrap();
    let call = Frame::method_call("/org/example/Echo", "Echo")
        .with_serial(conn.next_serial())
        .with_fds([OwnedFd::from(far)]);
    assert!(matches!(conn.send(&call), Err(Error::ProtocolViolation(_))));
    assert_eq!(conn.state(), ConnectionState::Ready);

    let ping = Frame::method_call("/org/example/Echo", "Ping").with_serial(conn.next_serial());
    conn.send(&ping).unwrap();
    assert_eq!(conn.receive().unwrap().reply_serial(), Some(ping.serial()));
}

#[test]
fn listener_removes_its_socket_file() {
    let mut server = TestServer::start();
    let path = server.dir.path().join("bus");
    assert!(path.exists());
    drop(server.connect());

    server.running.store(false, Ordering::SeqCst);
    server.handle.take().unwrap().join().unwrap().unwrap();
    assert!(!path.exists());
}
