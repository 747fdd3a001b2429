use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dbus_unix_client::{
    AuthMechanism, BusAddress, Connection, Frame, MessageType, TransportConfig, Value,
    SYSTEM_BUS_SOCKET,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, ValueEnum)]
enum Mechanism {
    External,
    Anonymous,
    Cookie,
}

impl From<Mechanism> for AuthMechanism {
    fn from(m: Mechanism) -> Self {
        match m {
            Mechanism::External => AuthMechanism::External,
            Mechanism::Anonymous => AuthMechanism::Anonymous,
            Mechanism::Cookie => AuthMechanism::Cookie,
        }
    }
}

#[derive(Parser)]
#[command(name = "dbus-unix-probe")]
#[command(about = "Connect to a D-Bus socket, authenticate and exchange a message")]
struct Args {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// D-Bus address, e.g. unix:path=/run/dbus/system_bus_socket
    #[arg(short, long)]
    address: Option<String>,

    /// Mechanisms to try, in order
    #[arg(short, long, value_enum, default_values_t = [Mechanism::External])]
    mechanism: Vec<Mechanism>,

    /// Ask for unix fd passing after authentication
    #[arg(long)]
    negotiate_unix_fd: bool,

    /// Handshake timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authenticate and print the session details
    Handshake,
    /// Call org.freedesktop.DBus.Hello and print the assigned unique name
    Hello,
    /// Send a string to an echo peer and print what comes back
    Echo {
        /// Text to send
        message: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let address = match &args.address {
        Some(text) => BusAddress::parse(text)
            .and_then(|a| a.socket_address())
            .with_context(|| format!("Invalid address '{text}'"))?,
        None => dbus_unix_client::SocketAddress::path(SYSTEM_BUS_SOCKET)?,
    };

    let mut config = TransportConfig::from_env()
        .with_mechanisms(args.mechanism.iter().copied().map(AuthMechanism::from))
        .with_unix_fd_negotiation(args.negotiate_unix_fd);
    if let Some(ms) = args.timeout_ms {
        config = config.with_handshake_timeout(Duration::from_millis(ms));
    }

    info!("Connecting to {}", address);
    let conn = Connection::open_with_config(&address, config)
        .with_context(|| format!("Failed to open connection to {address}"))?;

    match args.command {
        Commands::Handshake => {
            if let Some(session) = conn.session() {
                println!("guid:      {}", session.guid);
                println!("mechanism: {}", session.mechanism);
                println!("unix fds:  {}", session.unix_fd);
            }
            if let Some(peer) = conn.peer_credentials() {
                println!("peer:      pid={} uid={} gid={}", peer.pid, peer.uid, peer.gid);
            }
        }

        Commands::Hello => {
            let call = Frame::method_call("/org/freedesktop/DBus", "Hello")
                .with_interface("org.freedesktop.DBus")
                .with_destination("org.freedesktop.DBus")
                .with_serial(conn.next_serial());
            let reply = call_and_wait(&conn, &call)?;
            match reply.body_values()?.first() {
                Some(Value::String(name)) => println!("Unique name: {name}"),
                other => bail!("Unexpected Hello reply body: {other:?}"),
            }
        }

        Commands::Echo { message } => {
            let call = Frame::method_call("/", "Echo")
                .with_interface("org.example.Echo")
                .with_serial(conn.next_serial())
                .with_body(&[Value::String(message)])?;
            let reply = call_and_wait(&conn, &call)?;
            println!("Echo reply: {:?}", reply.body_values()?);
        }
    }

    conn.close()?;
    Ok(())
}

/// Send `call` and skip unrelated frames until its reply arrives
fn call_and_wait(conn: &Connection, call: &Frame) -> Result<Frame> {
    conn.send(call).context("Failed to send method call")?;
    loop {
        let frame = conn.receive().context("Failed to receive reply")?;
        if frame.reply_serial() != Some(call.serial()) {
            info!("Skipping unrelated {:?} frame", frame.message_type());
            continue;
        }
        if frame.message_type() == MessageType::Error {
            bail!(
                "{} returned error {}",
                call.member().unwrap_or("call"),
                frame.error_name().unwrap_or("<unnamed>")
            );
        }
        return Ok(frame);
    }
}
