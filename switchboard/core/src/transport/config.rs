//! Transport Configuration
//!
//! Configuration surface for the framed transport: bind/connect address,
//! maximum message size, per-call timeout, read chunk size, connection
//! limit, and framing mode.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::ConfigError;
use super::frame::{FrameCodec, FramingMode};

/// A transport endpoint: a network address or a filesystem socket path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Addr {
    /// TCP endpoint.
    Tcp(SocketAddr),
    /// Unix domain socket path.
    Unix(PathBuf),
}

impl Addr {
    /// Whether this is a Unix socket address.
    #[must_use]
    pub fn is_unix(&self) -> bool {
        matches!(self, Self::Unix(_))
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp:{addr}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl FromStr for Addr {
    type Err = ConfigError;

    /// Accepted forms: `tcp:host:port`, `unix:/path`, a bare `host:port`
    /// socket address, or a bare filesystem path starting with `/` or `.`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("unix:") {
            return Ok(Self::Unix(PathBuf::from(rest)));
        }
        if let Some(rest) = s.strip_prefix("tcp:") {
            return rest
                .parse::<SocketAddr>()
                .map(Self::Tcp)
                .map_err(|_| ConfigError::InvalidAddress(s.to_string()));
        }
        if s.starts_with('/') || s.starts_with('.') {
            return Ok(Self::Unix(PathBuf::from(s)));
        }
        s.parse::<SocketAddr>()
            .map(Self::Tcp)
            .map_err(|_| ConfigError::InvalidAddress(s.to_string()))
    }
}

/// Transport configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Endpoint to bind (server) or connect to (client).
    pub addr: Addr,

    /// Maximum message body size in bytes (0 = unlimited; negative = error).
    pub max_message_size: i64,

    /// Per-call timeout in milliseconds for the request correlator.
    pub call_timeout_ms: u64,

    /// Read chunk size in bytes for draining a ready connection.
    pub read_buffer_size: usize,

    /// Maximum number of concurrent server connections.
    pub max_connections: usize,

    /// How the byte stream is split into messages. Exactly one mode is
    /// active per transport; there is no fallback between modes.
    pub framing: FramingMode,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            addr: Addr::Unix(default_socket_path()),
            max_message_size: 1024 * 1024,
            call_timeout_ms: 5000,
            read_buffer_size: 4096,
            max_connections: 100,
            framing: FramingMode::default(),
        }
    }
}

impl TransportConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `SWITCHBOARD_ADDR`: `tcp:host:port`, `unix:/path`, or a bare path
    /// - `SWITCHBOARD_MAX_MESSAGE_SIZE`: bytes, 0 = unlimited
    /// - `SWITCHBOARD_CALL_TIMEOUT_MS`: per-call timeout
    /// - `SWITCHBOARD_READ_BUFFER`: read chunk size in bytes
    /// - `SWITCHBOARD_MAX_CONNECTIONS`: concurrent connection limit
    /// - `SWITCHBOARD_FRAMING`: `crlf` or `telnet-eof`
    /// - `SWITCHBOARD_DELIMITER`: custom delimiter (overrides `crlf`)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let addr = std::env::var("SWITCHBOARD_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.addr);

        let framing = match std::env::var("SWITCHBOARD_FRAMING")
            .as_deref()
            .map(str::to_lowercase)
        {
            Ok(ref s) if s == "telnet-eof" || s == "telnet" => FramingMode::TelnetEof,
            _ => match std::env::var("SWITCHBOARD_DELIMITER") {
                Ok(d) if !d.is_empty() => FramingMode::Delimiter(d.into_bytes()),
                _ => defaults.framing,
            },
        };

        Self {
            addr,
            max_message_size: std::env::var("SWITCHBOARD_MAX_MESSAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_message_size),
            call_timeout_ms: std::env::var("SWITCHBOARD_CALL_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.call_timeout_ms),
            read_buffer_size: std::env::var("SWITCHBOARD_READ_BUFFER")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.read_buffer_size),
            max_connections: std::env::var("SWITCHBOARD_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            framing,
        }
    }

    /// Load configuration from a TOML file. The file must be complete;
    /// missing keys are not defaulted.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::InvalidConfig(format!("{}: {e}", path.display())))?;
        toml::from_str(&raw).map_err(|e| ConfigError::InvalidConfig(e.to_string()))
    }

    /// Validate settings and build the frame codec for this transport.
    /// Size and delimiter validation live in [`FrameCodec::new`].
    pub fn codec(&self) -> Result<FrameCodec, ConfigError> {
        Ok(FrameCodec::new(self.framing.clone(), self.max_message_size)?)
    }

    /// Per-call timeout as a [`std::time::Duration`].
    #[must_use]
    pub fn call_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.call_timeout_ms)
    }
}

/// Get the default Unix socket path.
///
/// Uses `XDG_RUNTIME_DIR` if available, otherwise `/tmp/switchboard-$UID/`.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir)
            .join("switchboard")
            .join("switchboard.sock")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/switchboard-{uid}/switchboard.sock"))
    }
}
