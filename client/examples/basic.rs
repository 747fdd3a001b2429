use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use anyhow::{Context, Result};
use dbus_unix_client::{AuthMechanism, Connection, Frame, SocketAddress, TransportConfig, Value};
use dbus_unix_server::{BusServer, ServerSettings};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    println!("=== D-Bus Unix Client Basic Example ===");

    let dir = tempfile::tempdir().context("Failed to create socket directory")?;
    let path = dir.path().join("bus");
    let settings = ServerSettings::new()
        .with_address(format!("unix:path={}", path.display()))
        .with_mechanisms([AuthMechanism::External, AuthMechanism::Anonymous])
        .with_unix_fd(true);
    let server = BusServer::new(settings)?;
    let listener = server.bind()?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    let handle = thread::spawn(move || server.serve(listener, r));

    let address = SocketAddress::path(&path)?;

    println!("\n1. EXTERNAL with defaults:");
    example_with_defaults(&address)?;

    println!("\n2. ANONYMOUS with unix fd negotiation:");
    example_with_custom_config(&address)?;

    running.store(false, Ordering::SeqCst);
    match handle.join() {
        Ok(result) => result?,
        Err(_) => anyhow::bail!("Server thread panicked"),
    }

    println!("\n✓ All examples completed successfully!");
    Ok(())
}

fn example_with_defaults(address: &SocketAddress) -> Result<()> {
    let conn = Connection::open(address, AuthMechanism::External)?;
    println!("  ✓ Connected: {:?}", conn.session());

    let hello = Frame::method_call("/org/freedesktop/DBus", "Hello")
        .with_interface("org.freedesktop.DBus")
        .with_destination("org.freedesktop.DBus")
        .with_serial(conn.next_serial());
    conn.send(&hello)?;
    let reply = conn.receive()?;
    println!("  ✓ Hello reply: {:?}", reply.body_values()?);

    conn.close()?;
    println!("  ✓ Closed ({})", conn.state());
    Ok(())
}

fn example_with_custom_config(address: &SocketAddress) -> Result<()> {
    let config = TransportConfig::new()
        .with_mechanism(AuthMechanism::Anonymous)
        .with_unix_fd_negotiation(true);
    let conn = Connection::open_with_config(address, config)?;
    if let Some(session) = conn.session() {
        println!("  ✓ Mechanism {}, unix fds {}", session.mechanism, session.unix_fd);
    }

    let call = Frame::method_call("/org/example/Echo", "Echo")
        .with_serial(conn.next_serial())
        .with_body(&[Value::String("ping".into()), Value::Double(1.5)])?;
    conn.send(&call)?;
    let reply = conn.receive()?;
    println!("  ✓ Echoed: {:?}", reply.body_values()?);
    Ok(())
}
