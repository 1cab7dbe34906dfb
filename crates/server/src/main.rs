//! Bridge server: accepts client sessions over TCP, holds the device
//! registry, and routes URBs between the local host-controller queue and
//! whichever client session owns the target device.
//!
//! Grounded on the teacher's `main.rs`: the same config/CLI/systemd
//! wiring, generalised from the teacher's Iroh endpoint + USB worker thread
//! to this crate's TCP listener + in-process host-controller queue (the
//! kernel-mode virtual host-controller driver that would sit on the other
//! end of that queue is out of scope; see `server::hostctl`).

mod config;
mod error;
mod hostctl;
mod pending;
mod registry;
mod router;
mod service;
mod session;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "vusb-server")]
#[command(author, version, about = "USB-over-network bridge server")]
#[command(long_about = "
Accepts client sessions over TCP and re-presents USB devices attached by
those clients to the host-controller queue, routing URBs between the two.

EXAMPLES:
    # Run with default config
    vusb-server

    # Run with custom config
    vusb-server --config /path/to/config.toml

    # Run as systemd service (Type=notify)
    vusb-server --service

CONFIGURATION:
    The server looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/vusb-bridge/server.toml
    3. /etc/vusb-bridge/server.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Override the configured bind address
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,

    /// Run as a systemd service (enables sd-notify / watchdog integration)
    #[arg(long)]
    service: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = config::ServerConfig::default();
        let path = config::ServerConfig::default_path();
        config.save(&path).context("failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        config::ServerConfig::load(Some(path.clone())).context("failed to load configuration")?
    } else {
        config::ServerConfig::load_or_default()
    };

    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }
    if args.service {
        config.server.service_mode = true;
    }

    let log_level = args.log_level.as_deref().unwrap_or(&config.server.log_level);
    common::setup_logging(log_level).context("failed to set up logging")?;

    info!("vusb-server v{}", env!("CARGO_PKG_VERSION"));
    info!(bind_addr = %config.server.bind_addr, "starting");

    let listener = TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_addr))?;

    let (completions_tx, completions_rx) = mpsc::unbounded_channel();
    let urb_timeout = Duration::from_millis(config.limits.urb_timeout_ms);
    let shared = Arc::new(session::Shared::new(completions_tx, urb_timeout));

    // The kernel-mode virtual host-controller driver is out of scope for
    // this crate; `hostctl::channel_queue` stands in for the two ioctls it
    // would otherwise expose. Nothing submits through `host_handle` without
    // that driver attached, but it must stay alive for the process
    // lifetime or the router sees its submit side close and treats that as
    // a shutdown signal.
    let (host_handle, host_queue) = hostctl::channel_queue();
    let _host_handle = host_handle;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let router_handle = tokio::spawn(router::run_router(
        host_queue,
        shared.clone(),
        completions_rx,
        shutdown_rx.clone(),
    ));
    let accept_handle = tokio::spawn(session::run_accept_loop(listener, shared, shutdown_rx));

    let watchdog_handle = if config.server.service_mode {
        if service::is_systemd() {
            info!("running under systemd");
        }
        service::notify_ready().context("failed to notify systemd ready")?;
        service::notify_status("running").context("failed to send status to systemd")?;
        Some(
            service::spawn_watchdog_task()
                .await
                .context("failed to spawn watchdog task")?,
        )
    } else {
        None
    };

    info!("press Ctrl+C to shut down");
    match signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C, shutting down"),
        Err(e) => error!("error waiting for Ctrl+C: {e}"),
    }

    if config.server.service_mode {
        service::notify_stopping().ok();
    }
    if let Some(handle) = watchdog_handle {
        handle.abort();
    }

    shutdown_tx.send(true).ok();
    router_handle.abort();
    accept_handle.abort();

    info!("shutdown complete");
    Ok(())
}
