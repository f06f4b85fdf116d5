//! Transport Error Types
//!
//! The error taxonomy follows the failure-isolation rules of the transport:
//!
//! - [`ConfigError`] and [`FrameError::InvalidSize`] are setup-time failures
//!   and abort startup; they are never retried.
//! - Connection-scoped errors ([`TransportError::Io`], [`FrameError::MaximumSize`],
//!   [`TransportError::Timeout`], [`TransportError::Truncated`]) close only the
//!   one connection they occurred on.
//! - Protocol-level failures travel back to the peer as a normal `err ...`
//!   response payload and surface client-side as [`TransportError::Remote`];
//!   the connection stays open.

use thiserror::Error;

use super::registry::ConnectionId;

/// Errors produced by the framing codec.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Accumulated byte count exceeded the configured cap before a
    /// terminator was found, or an over-size message was handed to `encode`.
    #[error("message exceeds maximum size ({size} > {max} bytes)")]
    MaximumSize {
        /// Bytes seen so far
        size: usize,
        /// Configured cap
        max: usize,
    },

    /// Negative maximum-size configuration.
    #[error("invalid maximum message size: {0}")]
    InvalidSize(i64),

    /// A delimiter framing mode was configured with no delimiter bytes.
    #[error("empty framing delimiter")]
    EmptyDelimiter,
}

/// Setup-time configuration errors. These abort startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A command name was registered twice on the same dispatcher.
    #[error("duplicate command registration: {0:?}")]
    DuplicateCommand(String),

    /// Command name contains the name/payload separator or is empty.
    #[error("invalid command name: {0:?}")]
    InvalidCommandName(String),

    /// Address string could not be parsed as `tcp:host:port`, `unix:/path`,
    /// or a bare filesystem path.
    #[error("invalid address: {0:?}")]
    InvalidAddress(String),

    /// Configuration file could not be read or parsed, or holds an invalid
    /// setting (e.g. an empty framing delimiter).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid framing settings (forwarded from the codec): negative
    /// maximum size or an empty delimiter.
    #[error(transparent)]
    Framing(#[from] FrameError),
}

/// Errors that can occur during transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Framing failure on this connection.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// IO error from the underlying stream or listener.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed the connection cleanly (EOF on a frame boundary).
    #[error("connection closed")]
    Closed,

    /// Peer closed the connection mid-message (EOF after a partial read).
    #[error("connection closed with a truncated message in flight")]
    Truncated,

    /// A call was issued on a handle that already has a call in flight.
    #[error("connection is busy with an in-flight call")]
    Busy,

    /// The per-call timeout elapsed before a response arrived. The
    /// connection is poisoned and closed.
    #[error("call timed out")]
    Timeout,

    /// Protocol-level error reported by the remote peer (for example an
    /// unknown command). The connection remains usable.
    #[error("remote error: {0}")]
    Remote(String),

    /// The response frame did not start with an `ok`/`err` status token.
    #[error("malformed response frame")]
    MalformedResponse,

    /// No connection with this identity is open.
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Setup-time failure (forwarded so `serve`/`new` callers see one type).
    #[error(transparent)]
    Config(#[from] ConfigError),
}
