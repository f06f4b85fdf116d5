//! # Switchboard Core
//!
//! Connection multiplexing and framed request/response transport for
//! local services.
//!
//! A [`transport::CommandServer`] accepts TCP or Unix-socket peers, watches
//! them all from one readiness loop, and dispatches each framed command to a
//! registered async handler. A [`transport::CommandClient`] opens persistent
//! connections and issues synchronous calls with at most one request in
//! flight per connection handle. Teardown is coordinated through named
//! [`shutdown::Shutdown`] steps, with spawned work supervised by a
//! [`tasks::TaskGroup`].
//!
//! ```no_run
//! use switchboard_core::shutdown::Shutdown;
//! use switchboard_core::transport::{
//!     CommandClient, CommandDispatcher, CommandServer, TransportConfig, SHUTDOWN_STEPS,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TransportConfig::from_env();
//!
//! let mut dispatcher = CommandDispatcher::new();
//! dispatcher.handle("ping", |_payload| async move { Ok(b"pong".to_vec()) })?;
//!
//! let server = CommandServer::new(config.clone(), dispatcher)?;
//! let root = CancellationToken::new();
//! let shutdown = Shutdown::new(&root, SHUTDOWN_STEPS)?;
//! tokio::spawn(async move {
//!     // ... later: root.cancel() or shutdown steps marked individually
//! });
//! server.serve(&shutdown).await?;
//! # Ok(())
//! # }
//! ```

pub mod shutdown;
pub mod tasks;
pub mod transport;

pub use shutdown::{Shutdown, ShutdownError};
pub use tasks::TaskGroup;
