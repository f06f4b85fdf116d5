//! Switchboard Daemon - Framed Command Server
//!
//! Entry point for the switchboard daemon, which serves framed commands to
//! local peers over a Unix socket (default) or TCP.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (Unix socket under XDG_RUNTIME_DIR)
//! switchboard-daemon
//!
//! # Custom endpoint
//! switchboard-daemon --addr tcp:127.0.0.1:7400
//! switchboard-daemon --addr unix:/tmp/my-switchboard.sock
//!
//! # With config file
//! switchboard-daemon --config /etc/switchboard/switchboard.toml
//!
//! # Daemonize (run in background)
//! switchboard-daemon --daemonize
//!
//! # Verbose logging
//! RUST_LOG=debug switchboard-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown (drain in-flight commands)

mod server;

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use switchboard_core::transport::{Addr, FramingMode, TransportConfig};

use server::DaemonServer;

/// Switchboard Daemon - framed command server for local services
#[derive(Parser, Debug)]
#[command(name = "switchboard-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Endpoint to listen on (unix:/path, tcp:host:port, or a bare path)
    #[arg(short = 'a', long, env = "SWITCHBOARD_ADDR", value_name = "ADDR")]
    addr: Option<Addr>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "SWITCHBOARD_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run as daemon (fork to background)
    #[arg(short = 'd', long)]
    daemonize: bool,

    /// PID file path (for daemon mode)
    #[arg(long, env = "SWITCHBOARD_PID_FILE", value_name = "PATH")]
    pid_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "SWITCHBOARD_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Maximum message body size in bytes (0 = unlimited)
    #[arg(long, value_name = "BYTES")]
    max_message_size: Option<i64>,

    /// Per-call timeout in milliseconds
    #[arg(long, value_name = "MS")]
    call_timeout_ms: Option<u64>,

    /// Framing mode: "crlf" or "telnet-eof"
    #[arg(long, value_name = "MODE")]
    framing: Option<String>,
}

/// Parse a `--framing` flag value.
fn parse_framing(mode: &str) -> Result<FramingMode> {
    match mode {
        "crlf" => Ok(FramingMode::default()),
        "telnet-eof" | "telnet" => Ok(FramingMode::TelnetEof),
        other => anyhow::bail!("unknown framing mode: {other:?} (expected crlf or telnet-eof)"),
    }
}

/// Get the default PID file path
///
/// Uses XDG_RUNTIME_DIR if available, otherwise /tmp/switchboard-$UID/
fn default_pid_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir)
            .join("switchboard")
            .join("switchboard.pid")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/switchboard-{uid}/switchboard.pid"))
    }
}

/// Write PID file
fn write_pid_file(path: &PathBuf) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create PID directory: {parent:?}"))?;
    }

    let pid = std::process::id();
    let mut file =
        fs::File::create(path).with_context(|| format!("Failed to create PID file: {path:?}"))?;
    writeln!(file, "{pid}")?;

    info!(pid = pid, path = ?path, "PID file created");
    Ok(())
}

/// Remove PID file
fn remove_pid_file(path: &PathBuf) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(error = %e, path = ?path, "Failed to remove PID file");
        } else {
            info!(path = ?path, "PID file removed");
        }
    }
}

/// Check if another daemon is running by checking PID file
fn check_existing_daemon(pid_path: &PathBuf) -> Result<()> {
    if !pid_path.exists() {
        return Ok(());
    }

    let pid_str = fs::read_to_string(pid_path)
        .with_context(|| format!("Failed to read PID file: {pid_path:?}"))?;

    let pid: i32 = pid_str
        .trim()
        .parse()
        .with_context(|| "Invalid PID in file")?;

    // Check if process is running (signal 0 just checks existence)
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        anyhow::bail!(
            "Another switchboard-daemon is already running (PID: {pid}). \
             Stop it first or remove {pid_path:?} if it's stale."
        );
    }

    // Process not running, PID file is stale
    warn!(pid = pid, "Removing stale PID file");
    fs::remove_file(pid_path)?;
    Ok(())
}

/// Initialize logging with the specified level
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "switchboard_daemon={level},switchboard_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    Ok(())
}

/// Daemonize the process (fork to background)
fn daemonize() -> Result<()> {
    use nix::unistd::{fork, setsid, ForkResult};

    // First fork
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => {
            // Parent exits
            std::process::exit(0);
        }
        Ok(ForkResult::Child) => {
            // Child continues
        }
        Err(e) => {
            anyhow::bail!("First fork failed: {e}");
        }
    }

    // Create new session
    setsid().context("setsid failed")?;

    // Second fork (prevent acquiring controlling terminal)
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => {
            std::process::exit(0);
        }
        Ok(ForkResult::Child) => {
            // Grandchild continues as daemon
        }
        Err(e) => {
            anyhow::bail!("Second fork failed: {e}");
        }
    }

    Ok(())
}

/// Resolve the transport configuration from file, environment, and flags,
/// in increasing precedence.
fn resolve_config(args: &Args) -> Result<TransportConfig> {
    let mut config = match &args.config {
        Some(path) => TransportConfig::from_file(path)
            .with_context(|| format!("Failed to load config: {path:?}"))?,
        None => TransportConfig::from_env(),
    };
    if let Some(addr) = &args.addr {
        config.addr = addr.clone();
    }
    if let Some(size) = args.max_message_size {
        config.max_message_size = size;
    }
    if let Some(timeout) = args.call_timeout_ms {
        config.call_timeout_ms = timeout;
    }
    if let Some(mode) = &args.framing {
        config.framing = parse_framing(mode)?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging first
    init_logging(&args.log_level)?;

    info!("Switchboard Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let config = resolve_config(&args)?;
    let pid_path = args.pid_file.clone().unwrap_or_else(default_pid_path);

    info!(addr = %config.addr, "Endpoint");
    info!(pid_path = ?pid_path, "PID file path");

    // Check for existing daemon
    check_existing_daemon(&pid_path)?;

    // Daemonize if requested
    if args.daemonize {
        info!("Daemonizing...");
        daemonize()?;
        // After daemonizing, PID changes
        info!("Daemonized, new PID: {}", std::process::id());
    }

    // Write PID file
    write_pid_file(&pid_path)?;

    // Root cancellation for the whole shutdown sequence
    let root = CancellationToken::new();

    // Spawn signal handler task
    let root_clone = root.clone();
    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating shutdown");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating shutdown");
            }
        }
        root_clone.cancel();
    });

    // Create and run the daemon server
    let server = DaemonServer::new(config)?;
    let result = server.run(&root).await;

    // Cleanup
    info!("Shutting down...");
    remove_pid_file(&pid_path);

    match result {
        Ok(()) => {
            info!("Switchboard daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
