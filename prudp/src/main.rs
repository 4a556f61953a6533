//! Entry point for `prudp`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client** mode.
//! The server echoes every payload back to its sender; the client sends one
//! message and prints the echo.  Protocol work lives in the library; `main.rs`
//! owns only process setup (logging, argument parsing).

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use prudp::timer::TimerConfig;
use prudp::{ConnectionConfig, ConnectionEvent, ConnectionHandle, Listener, ListenerConfig};

/// Reliable datagram protocol over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run an echo server.
    Server {
        /// Local address to bind (e.g. 0.0.0.0:9000).
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: SocketAddr,
        /// Shared access key.
        #[arg(short, long)]
        access_key: String,
        /// Ignore a new handshake from an already connected origin instead of
        /// replacing the old connection.
        #[arg(long)]
        keep_old_connections: bool,
        /// Retransmit timeout in milliseconds.
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
    /// Connect, send one message and print the echo.
    Client {
        /// Remote server address (e.g. 127.0.0.1:9000).
        #[arg(short, long)]
        server: SocketAddr,
        #[arg(short, long)]
        access_key: String,
        #[arg(short, long, default_value = "hello")]
        message: String,
        /// Retransmit timeout in milliseconds.
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
        /// Give up if the handshake or echo takes longer than this (seconds).
        #[arg(long, default_value_t = 30)]
        deadline_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Server {
            bind,
            access_key,
            keep_old_connections,
            timeout_ms,
        } => {
            let mut config = ListenerConfig::new(bind, access_key.as_str());
            config.destroy_old_connections = !keep_old_connections;
            config.timers = timers(timeout_ms);
            serve(config).await
        }
        Mode::Client {
            server,
            access_key,
            message,
            timeout_ms,
            deadline_secs,
        } => {
            let mut config = ConnectionConfig::new(access_key.as_str());
            config.timers = timers(timeout_ms);
            let deadline = Duration::from_secs(deadline_secs);
            tokio::time::timeout(deadline, run_client(server, config, message))
                .await
                .context("timed out waiting for the server")?
        }
    }
}

fn timers(timeout_ms: u64) -> TimerConfig {
    TimerConfig {
        retransmit_timeout: Duration::from_millis(timeout_ms),
        ..TimerConfig::default()
    }
}

async fn serve(config: ListenerConfig) -> Result<()> {
    let mut listener = Listener::bind(config)
        .await
        .context("failed to bind listener")?;
    log::info!("Echo server on {}", listener.local_addr());

    loop {
        let conn = listener.accept().await?;
        log::info!("Accepted {}", conn.remote_addr());
        tokio::spawn(echo(conn));
    }
}

async fn echo(mut conn: ConnectionHandle) {
    while let Some(event) = conn.next_event().await {
        match event {
            ConnectionEvent::Data(payload) => match conn.send(payload).await {
                Ok(true) => {}
                Ok(false) => log::warn!("{}: window full, echo dropped", conn.remote_addr()),
                Err(e) => log::warn!("{}: echo failed: {e}", conn.remote_addr()),
            },
            ConnectionEvent::Disconnected => break,
            ConnectionEvent::Error(e) => log::debug!("{}: {e}", conn.remote_addr()),
            ConnectionEvent::Connected => {}
        }
    }
    log::info!("{} disconnected", conn.remote_addr());
}

async fn run_client(server: SocketAddr, config: ConnectionConfig, message: String) -> Result<()> {
    let mut conn = prudp::connect(server, config).await?;
    conn.wait_connected().await.context("handshake failed")?;
    log::info!("Connected to {server}");

    if !conn.send(message.into_bytes()).await? {
        bail!("congestion window full");
    }

    loop {
        match conn.next_event().await {
            Some(ConnectionEvent::Data(payload)) => {
                println!("{}", String::from_utf8_lossy(&payload));
                break;
            }
            Some(ConnectionEvent::Error(e)) => log::debug!("{e}"),
            Some(ConnectionEvent::Connected) => {}
            Some(ConnectionEvent::Disconnected) | None => bail!("server closed the connection"),
        }
    }

    conn.disconnect().await?;
    conn.closed().await;
    Ok(())
}
