//! Client handshake against scripted peers on a real Unix socket

use std::{
    io::{BufRead, BufReader, Read, Write},
    os::unix::net::{UnixListener, UnixStream},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use dbus_unix_client::{
    AuthMechanism, Connection, ConnectionState, Error, Frame, SocketAddress, TransportConfig,
    Value,
};
use dbus_unix_common::{FrameWriter, MAX_MESSAGE_SIZE};
use tempfile::TempDir;

const GUID: &str = "0123456789abcdef0123456789abcdef";

/// Server end of one accepted connection
struct Peer {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl Peer {
    fn expect_nul(&mut self) {
        let mut byte = [0xffu8];
        self.reader.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], 0, "client must open with a NUL byte");
    }

    fn line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        assert!(line.ends_with("\r\n"), "line {line:?} not CRLF terminated");
        line.trim_end().to_string()
    }

    fn send(&mut self, line: &str) {
        self.writer.write_all(format!("{line}\r\n").as_bytes()).unwrap();
    }
}

fn fake_bus<F>(script: F) -> (TempDir, SocketAddress, JoinHandle<()>)
where
    F: FnOnce(Peer) + Send + 'static,
{
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bus");
    let listener = UnixListener::bind(&path).unwrap();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let peer = Peer {
            reader: BufReader::new(stream.try_clone().unwrap()),
            writer: stream,
        };
        script(peer);
    });
    (dir, SocketAddress::path(path).unwrap(), handle)
}

fn hex(text: &str) -> String {
    text.bytes().map(|b| format!("{b:02x}")).collect()
}

#[test]
fn external_completes_in_one_round_trip() {
    let (_dir, address, peer) = fake_bus(|mut peer| {
        peer.expect_nul();
        let auth = peer.line();
        let uid = auth.strip_prefix("AUTH EXTERNAL ").expect("EXTERNAL first");
        assert_eq!(uid, hex(&uid_of_this_process().to_string()));
        peer.send(&format!("OK {GUID}"));
        assert_eq!(peer.line(), "BEGIN");
    });

    let conn = Connection::open(&address, AuthMechanism::External).unwrap();
    assert_eq!(conn.state(), ConnectionState::Ready);
    let session = conn.session().unwrap();
    assert_eq!(session.guid, GUID);
    assert_eq!(session.mechanism, AuthMechanism::External);
    assert!(!session.unix_fd);
    peer.join().unwrap();
}

#[test]
fn claimed_uid_can_be_overridden() {
    let (_dir, address, peer) = fake_bus(|mut peer| {
        peer.expect_nul();
        assert_eq!(peer.line(), format!("AUTH EXTERNAL {}", hex("4242")));
        peer.send(&format!("OK {GUID}"));
        assert_eq!(peer.line(), "BEGIN");
    });

    let config = TransportConfig::new().with_sasl_uid(4242);
    Connection::open_with_config(&address, config).unwrap();
    peer.join().unwrap();
}

#[test]
fn bytes_after_ok_are_kept_for_the_first_frame() {
    let (_dir, address, peer) = fake_bus(|mut peer| {
        peer.expect_nul();
        peer.line();
        // OK and the first frame arrive in a single write
        let frame = Frame::signal("/org/example", "org.example.Bus", "Welcome")
            .with_serial(1)
            .with_body(&[Value::String("hi".into())])
            .unwrap()
            .encode(MAX_MESSAGE_SIZE)
            .unwrap();
        let mut bytes = format!("OK {GUID}\r\n").into_bytes();
        bytes.extend_from_slice(&frame);
        peer.writer.write_all(&bytes).unwrap();
        assert_eq!(peer.line(), "BEGIN");
    });

    let conn = Connection::open(&address, AuthMechanism::External).unwrap();
    let frame = conn.receive().unwrap();
    assert_eq!(frame.member(), Some("Welcome"));
    assert_eq!(frame.body_values().unwrap(), vec![Value::String("hi".into())]);
    peer.join().unwrap();
}

#[test]
fn anonymous_sends_a_trace_string() {
    let (_dir, address, peer) = fake_bus(|mut peer| {
        peer.expect_nul();
        let auth = peer.line();
        assert!(auth.starts_with("AUTH ANONYMOUS "), "{auth}");
        peer.send(&format!("OK {GUID}"));
        assert_eq!(peer.line(), "BEGIN");
    });

    let conn = Connection::open(&address, AuthMechanism::Anonymous).unwrap();
    assert_eq!(conn.session().unwrap().mechanism, AuthMechanism::Anonymous);
    peer.join().unwrap();
}

#[test]
fn falls_back_to_the_next_offered_mechanism() {
    let (_dir, address, peer) = fake_bus(|mut peer| {
        peer.expect_nul();
        assert!(peer.line().starts_with("AUTH EXTERNAL"));
        peer.send("REJECTED ANONYMOUS");
        assert!(peer.line().starts_with("AUTH ANONYMOUS"));
        peer.send(&format!("OK {GUID}"));
        assert_eq!(peer.line(), "BEGIN");
    });

    let config = TransportConfig::new()
        .with_mechanisms([AuthMechanism::External, AuthMechanism::Anonymous]);
    let conn = Connection::open_with_config(&address, config).unwrap();
    assert_eq!(conn.session().unwrap().mechanism, AuthMechanism::Anonymous);
    peer.join().unwrap();
}

#[test]
fn rejection_of_every_mechanism_fails() {
    let (_dir, address, peer) = fake_bus(|mut peer| {
        peer.expect_nul();
        let mut line = String::new();
        while peer.reader.read_line(&mut line).unwrap_or(0) > 0 {
            if line.starts_with("AUTH") {
                peer.send("REJECTED EXTERNAL ANONYMOUS");
            }
            line.clear();
        }
    });

    let config = TransportConfig::new()
        .with_mechanisms([AuthMechanism::External, AuthMechanism::Anonymous]);
    let conn = Connection::new(address, config);
    let err = conn.establish().unwrap_err();
    assert!(matches!(err, Error::AuthenticationFailed { .. }), "{err:?}");
    assert_eq!(conn.state(), ConnectionState::Closed);
    drop(conn);
    peer.join().unwrap();
}

#[test]
fn attempts_are_bounded() {
    let (_dir, address, peer) = fake_bus(|mut peer| {
        peer.expect_nul();
        let mut auths = 0;
        let mut line = String::new();
        while peer.reader.read_line(&mut line).unwrap_or(0) > 0 {
            if line.starts_with("AUTH") {
                auths += 1;
                // an empty list places no restriction on the next attempt
                peer.send("REJECTED");
            }
            line.clear();
        }
        assert_eq!(auths, 1);
    });

    let config = TransportConfig::new()
        .with_mechanisms([AuthMechanism::External, AuthMechanism::Anonymous])
        .with_max_auth_attempts(1);
    let err = Connection::open_with_config(&address, config).unwrap_err();
    assert!(matches!(err, Error::AuthenticationFailed { .. }), "{err:?}");
    peer.join().unwrap();
}

#[test]
fn silent_peer_times_out() {
    let (_dir, address, peer) = fake_bus(|mut peer| {
        peer.expect_nul();
        peer.line();
        thread::sleep(Duration::from_millis(500));
    });

    let config = TransportConfig::new().with_handshake_timeout(Duration::from_millis(100));
    let err = Connection::open_with_config(&address, config).unwrap_err();
    assert!(matches!(err, Error::HandshakeTimeout), "{err:?}");
    peer.join().unwrap();
}

#[test]
fn zero_handshake_timeout_waits_without_limit() {
    let (_dir, address, peer) = fake_bus(|mut peer| {
        peer.expect_nul();
        peer.line();
        thread::sleep(Duration::from_millis(150));
        peer.send(&format!("OK {GUID}"));
        assert_eq!(peer.line(), "BEGIN");
    });

    let config = TransportConfig::new().with_handshake_timeout(Duration::ZERO);
    let conn = Connection::open_with_config(&address, config).unwrap();
    assert_eq!(conn.state(), ConnectionState::Ready);
    peer.join().unwrap();
}

#[test]
fn close_cancels_a_handshake_in_progress() {
    let (_dir, address, peer) = fake_bus(|mut peer| {
        peer.expect_nul();
        peer.line();
        // never answers; returns once the client hangs up
        let mut rest = Vec::new();
        let _ = peer.reader.read_to_end(&mut rest);
    });

    let config = TransportConfig::new().with_handshake_timeout(Duration::from_secs(5));
    let conn = Arc::new(Connection::new(address, config));
    let establishing = {
        let conn = Arc::clone(&conn);
        thread::spawn(move || {
            let started = Instant::now();
            (conn.establish(), started.elapsed())
        })
    };

    thread::sleep(Duration::from_millis(200));
    conn.close().unwrap();

    let (result, elapsed) = establishing.join().unwrap();
    assert!(matches!(result, Err(Error::ConnectionClosed)), "{result:?}");
    assert!(elapsed < Duration::from_secs(2), "establish returned after {elapsed:?}");
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(conn.session().is_none());
    peer.join().unwrap();
}

#[test]
fn close_before_establish_never_connects() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bus");
    let listener = UnixListener::bind(&path).unwrap();
    listener.set_nonblocking(true).unwrap();

    let conn = Connection::new(SocketAddress::path(&path).unwrap(), TransportConfig::new());
    conn.close().unwrap();
    assert!(matches!(conn.establish(), Err(Error::ConnectionClosed)));
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(listener.accept().is_err(), "no connection attempt expected");
}

#[test]
fn peer_hangup_during_handshake_is_a_transport_error() {
    let (_dir, address, peer) = fake_bus(|mut peer| {
        peer.expect_nul();
        peer.line();
    });

    let err = Connection::open(&address, AuthMechanism::External).unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "{err:?}");
    peer.join().unwrap();
}

#[test]
fn malformed_guid_is_a_protocol_violation() {
    let (_dir, address, peer) = fake_bus(|mut peer| {
        peer.expect_nul();
        peer.line();
        peer.send("OK not-a-guid");
    });

    let err = Connection::open(&address, AuthMechanism::External).unwrap_err();
    assert!(matches!(err, Error::ProtocolViolation(_)), "{err:?}");
    peer.join().unwrap();
}

#[test]
fn unix_fd_passing_is_negotiated_after_ok() {
    let (_dir, address, peer) = fake_bus(|mut peer| {
        peer.expect_nul();
        peer.line();
        peer.send(&format!("OK {GUID}"));
        assert_eq!(peer.line(), "NEGOTIATE_UNIX_FD");
        peer.send("AGREE_UNIX_FD");
        assert_eq!(peer.line(), "BEGIN");
    });

    let config = TransportConfig::new().with_unix_fd_negotiation(true);
    let conn = Connection::open_with_config(&address, config).unwrap();
    assert!(conn.session().unwrap().unix_fd);
    peer.join().unwrap();
}

#[test]
fn declined_unix_fd_passing_still_connects() {
    let (_dir, address, peer) = fake_bus(|mut peer| {
        peer.expect_nul();
        peer.line();
        peer.send(&format!("OK {GUID}"));
        assert_eq!(peer.line(), "NEGOTIATE_UNIX_FD");
        peer.send("ERROR \"unix fd passing not supported\"");
        assert_eq!(peer.line(), "BEGIN");
    });

    let config = TransportConfig::new().with_unix_fd_negotiation(true);
    let conn = Connection::open_with_config(&address, config).unwrap();
    assert!(!conn.session().unwrap().unix_fd);
    peer.join().unwrap();
}

#[test]
fn frames_flow_both_ways_after_begin() {
    let (_dir, address, peer) = fake_bus(|mut peer| {
        peer.expect_nul();
        peer.line();
        peer.send(&format!("OK {GUID}"));
        assert_eq!(peer.line(), "BEGIN");

        let mut frames = dbus_unix_common::FrameReader::new(peer.reader, MAX_MESSAGE_SIZE);
        let call = frames.read_frame().unwrap();
        assert_eq!(call.member(), Some("Ping"));
        let reply = Frame::method_return(&call).with_serial(7);
        FrameWriter::new(&mut peer.writer, MAX_MESSAGE_SIZE)
            .write_frame(&reply)
            .unwrap();
    });

    let conn = Connection::open(&address, AuthMechanism::External).unwrap();
    #[cfg(target_os = "linux")]
    assert_eq!(conn.peer_credentials().unwrap().pid, std::process::id());

    let call = Frame::method_call("/", "Ping").with_serial(conn.next_serial());
    conn.send(&call).unwrap();
    let reply = conn.receive().unwrap();
    assert_eq!(reply.reply_serial(), Some(call.serial()));
    peer.join().unwrap();
}

fn uid_of_this_process() -> u32 {
    TransportConfig::new().effective_uid()
}

#[test]
fn peer_hangup_after_begin_closes_the_connection() {
    let (_dir, address, peer) = fake_bus(|mut peer| {
        peer.expect_nul();
        peer.line();
        peer.send(&format!("OK {GUID}"));
        assert_eq!(peer.line(), "BEGIN");
    });

    let conn = Connection::open(&address, AuthMechanism::External).unwrap();
    peer.join().unwrap();

    let err = conn.receive().unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "{err:?}");
    assert_eq!(conn.state(), ConnectionState::Closed);
    let call = Frame::method_call("/", "Ping").with_serial(conn.next_serial());
    assert!(matches!(conn.send(&call), Err(Error::ConnectionClosed)));
}
