//! Framed command transport over TCP and Unix domain sockets.
//!
//! The pieces, bottom-up:
//!
//! - [`frame`]: delimiter and sentinel framing over a byte stream
//! - [`config`]: addresses, sizes, timeouts, and framing selection
//! - [`socket`]: transport-agnostic streams and listeners
//! - [`registry`]: live connection state and identity
//! - [`reactor`]: single-loop readiness multiplexing
//! - [`dispatcher`]: command table and request/response encoding
//! - [`client`]: the one-call-in-flight request correlator
//! - [`server`]: accept loop and staged teardown

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod reactor;
pub mod registry;
pub mod server;
pub mod socket;

pub use client::CommandClient;
pub use config::{default_socket_path, Addr, TransportConfig};
pub use dispatcher::{CallObserver, CommandDispatcher, HandlerResult, NoopObserver};
pub use error::{ConfigError, FrameError, TransportError};
pub use frame::{FrameBuffer, FrameCodec, FramingMode};
pub use reactor::{Interest, Reactor, ReactorError, ReactorEvent};
pub use registry::{Connection, ConnectionId, ConnectionRegistry};
pub use server::{CommandServer, SHUTDOWN_STEPS};
pub use socket::{Listener, SocketStream};
