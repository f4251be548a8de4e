//! Entry point for `udp-file-transfer`.
//!
//! Parses CLI arguments and dispatches into either **send** or **recv** mode.
//! All protocol work is delegated to library modules; `main.rs` owns only
//! process setup (logging, signal handling, argument parsing, file opening).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use udp_file_transfer::chunk::{open_destination, open_source};
use udp_file_transfer::config::DEFAULT_CAPACITY;
use udp_file_transfer::{AbortSignal, ReceiverEngine, SenderEngine, Socket, TransferConfig};

/// Reliable file transfer over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,

    #[command(flatten)]
    timing: Timing,
}

#[derive(Subcommand)]
enum Mode {
    /// Send a file to a listening receiver.
    Send {
        /// Receiver host name or address.
        host: String,
        /// Receiver UDP port.
        port: u16,
        /// File to send.
        file: String,
        /// Number of bytes to send from the start of the file.
        bytes: u64,
    },
    /// Wait for one sender and write what it sends to a file.
    Recv {
        /// UDP port to listen on.
        port: u16,
        /// Output file (created or truncated).
        file: String,
        /// Bytes written per second; 0 means unlimited.
        #[arg(short, long, default_value_t = 0)]
        write_rate: u64,
        /// Reassembly queue capacity, in segments.
        #[arg(short, long, default_value_t = DEFAULT_CAPACITY)]
        capacity: usize,
    },
}

#[derive(Args)]
struct Timing {
    /// Initial retransmission timeout in milliseconds.
    #[arg(long, global = true, default_value_t = 1000)]
    rto_ms: u64,
    /// Consecutive retransmission timeouts before giving up.
    #[arg(long, global = true, default_value_t = udp_file_transfer::config::MAX_RETRIES)]
    max_retries: u32,
    /// SYN / FIN attempts before giving up on a handshake or teardown.
    #[arg(long, global = true, default_value_t = 5)]
    attempts: u32,
    /// Seconds without traffic before the receiver gives up.
    #[arg(long, global = true, default_value_t = 60)]
    idle_secs: u64,
    /// Tries per datagram when the OS reports a transient send error.
    #[arg(long, global = true, default_value_t = udp_file_transfer::socket::SEND_ATTEMPTS)]
    send_attempts: u32,
}

impl Timing {
    fn config(&self) -> TransferConfig {
        TransferConfig {
            initial_rto: Duration::from_millis(self.rto_ms),
            max_retries: self.max_retries,
            handshake_attempts: self.attempts,
            teardown_attempts: self.attempts,
            idle_timeout: Duration::from_secs(self.idle_secs),
            ..TransferConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let abort = AbortSignal::new();
    {
        let abort = abort.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("interrupted; aborting transfer");
                abort.abort();
            }
        });
    }

    match cli.mode {
        Mode::Send {
            host,
            port,
            file,
            bytes,
        } => send(&host, port, &file, bytes, &cli.timing, abort).await,
        Mode::Recv {
            port,
            file,
            write_rate,
            capacity,
        } => recv(port, &file, write_rate, capacity, &cli.timing, abort).await,
    }
}

async fn send(
    host: &str,
    port: u16,
    file: &str,
    bytes: u64,
    timing: &Timing,
    abort: AbortSignal,
) -> Result<()> {
    let dest = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("resolving {host}:{port}"))?
        .next()
        .with_context(|| format!("{host} has no address"))?;
    let bind: SocketAddr = if dest.is_ipv4() {
        "0.0.0.0:0".parse()?
    } else {
        "[::]:0".parse()?
    };
    let socket = Socket::bind(bind)
        .await
        .context("binding UDP socket")?
        .with_send_attempts(timing.send_attempts);
    let socket = Arc::new(socket);
    let source = open_source(file)
        .await
        .with_context(|| format!("opening {file}"))?;

    log::info!("Sending up to {bytes} bytes of {file} to {dest}");
    let engine = SenderEngine::new(socket, timing.config()).with_abort(abort);
    let report = engine
        .transfer_with_report(source, dest, bytes)
        .await
        .context("transfer failed")?;
    if report.bytes_sent < bytes {
        log::warn!(
            "{file} ended after {} of {bytes} requested bytes",
            report.bytes_sent
        );
    }
    println!(
        "sent {} bytes ({} segments, {} retransmitted)",
        report.bytes_sent, report.stats.data_segments_sent, report.stats.retransmissions
    );
    Ok(())
}

async fn recv(
    port: u16,
    file: &str,
    write_rate: u64,
    capacity: usize,
    timing: &Timing,
    abort: AbortSignal,
) -> Result<()> {
    if capacity == 0 {
        bail!("capacity must be at least 1");
    }
    let bind = SocketAddr::from(([0, 0, 0, 0], port));
    let socket = Socket::bind(bind)
        .await
        .with_context(|| format!("binding UDP port {port}"))?
        .with_send_attempts(timing.send_attempts);
    let socket = Arc::new(socket);
    let sink = open_destination(file)
        .await
        .with_context(|| format!("creating {file}"))?;

    log::info!("Listening on {bind}, writing to {file}");
    let engine = ReceiverEngine::new(socket, timing.config()).with_abort(abort);
    let delivery = engine
        .receive(sink, capacity, write_rate)
        .await
        .context("transfer failed")?;
    println!(
        "received {} bytes ({} duplicates, {} NAKs sent)",
        delivery.bytes_written, delivery.stats.duplicates, delivery.stats.naks_sent
    );
    Ok(())
}
