use std::{
    io::BufReader,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use anyhow::{Context, Result};
use dbus_unix_common::{
    connect_socket, ClientAuth, Frame, FrameReader, FrameWriter, TransportConfig, Value,
};
use dbus_unix_server::{BusServer, ServerSettings};
use tracing::info;

/// Runs an echo server in the background and talks to it with the
/// low-level transport pieces: connector, SASL client and frame codec.
fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    println!("=== D-Bus Unix Echo Example ===");

    let dir = std::env::temp_dir().join(format!("dbus-unix-echo-{}", std::process::id()));
    std::fs::create_dir_all(&dir).context("Failed to create socket directory")?;
    let address = format!("unix:path={}", dir.join("bus").display());

    let server = BusServer::new(ServerSettings::new().with_address(&address))
        .context("Failed to create echo server")?;
    let listener = server.bind()?;
    let socket_address = server.address().clone();
    println!("✓ Echo server listening on {}", address);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    let handle = thread::spawn(move || server.serve(listener, r));

    let socket = connect_socket(&socket_address)?;
    let config = TransportConfig::new();
    let mut reader = BufReader::new(socket.try_clone()?);
    let mut writer = socket.try_clone()?;
    let session = ClientAuth::new(&config).authenticate(&mut reader, &mut writer)?;
    println!("✓ Authenticated with {} (guid {})", session.mechanism, session.guid);

    let mut frames = FrameReader::new(reader, config.max_message_size);
    let mut calls = FrameWriter::new(writer, config.max_message_size);

    for (serial, text) in (1u32..).zip(["hello", "world", "goodbye"]) {
        let call = Frame::method_call("/org/example/Echo", "Echo")
            .with_interface("org.example.Echo")
            .with_serial(serial)
            .with_body(&[Value::String(text.to_string()), Value::Uint32(serial)])?;
        calls.write_frame(&call)?;

        let reply = frames.read_frame()?;
        info!("Reply to serial {:?}: {:?}", reply.reply_serial(), reply.body_values()?);
        println!("  {} -> {:?}", text, reply.body_values()?);
    }

    socket.shutdown()?;
    running.store(false, Ordering::SeqCst);
    match handle.join() {
        Ok(result) => result?,
        Err(_) => anyhow::bail!("Server thread panicked"),
    }
    std::fs::remove_dir_all(&dir).ok();
    println!("Done");
    Ok(())
}
