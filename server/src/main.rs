use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use clap::Parser;
use dbus_unix_common::sasl::AuthMechanism;
use dbus_unix_server::{BusServer, ServerSettings};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dbus-unix-server")]
#[command(about = "D-Bus echo peer over a Unix domain socket")]
struct Args {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// JSON settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the settings file
    #[arg(short, long)]
    address: Option<String>,

    /// Also accept ANONYMOUS clients
    #[arg(long)]
    allow_anonymous: bool,

    /// Accept clients running as any user
    #[arg(long)]
    any_user: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let mut settings = match &args.config {
        Some(path) => ServerSettings::from_file(path)?,
        None => ServerSettings::new(),
    };
    if let Some(address) = args.address {
        settings = settings.with_address(address);
    }
    if args.allow_anonymous && !settings.mechanisms.contains(&AuthMechanism::Anonymous) {
        settings.mechanisms.push(AuthMechanism::Anonymous);
    }
    if args.any_user {
        warn!("Accepting clients of any user");
        settings.restrict_to_owner = false;
    }

    let server = BusServer::new(settings).context("Failed to create D-Bus echo server")?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, stopping server...");
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    info!("Starting D-Bus echo server (guid {})...", server.guid());
    server.run_with_shutdown(running)?;
    info!("Server stopped");
    Ok(())
}
