//! Daemon server: built-in commands wired onto the core transport.
//!
//! Owns the [`CommandServer`] lifecycle: registers the daemon's built-in
//! commands, declares the shutdown steps, and serves until the root
//! cancellation (normally a signal) fires.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use switchboard_core::shutdown::Shutdown;
use switchboard_core::transport::{
    CommandDispatcher, CommandServer, ConnectionRegistry, TransportConfig, SHUTDOWN_STEPS,
};

/// The daemon's server: core transport plus built-in commands.
pub struct DaemonServer {
    server: CommandServer,
}

impl DaemonServer {
    /// Build the server with the daemon's built-in command set.
    pub fn new(config: TransportConfig) -> Result<Self> {
        // The registry is created first so the stats command can observe
        // the same connection set the server maintains
        let registry = ConnectionRegistry::new();

        let mut dispatcher = CommandDispatcher::new();
        register_builtins(&mut dispatcher, registry.clone())
            .context("Failed to register built-in commands")?;

        let server = CommandServer::with_registry(config, dispatcher, registry)
            .context("Invalid transport configuration")?;
        Ok(Self { server })
    }

    /// Serve until `root` is cancelled, then drain and return.
    pub async fn run(&self, root: &CancellationToken) -> Result<()> {
        let shutdown =
            Shutdown::new(root, SHUTDOWN_STEPS).context("Failed to declare shutdown steps")?;

        info!(addr = %self.server.addr(), "Serving commands");
        self.server
            .serve(&shutdown)
            .await
            .context("Serve loop failed")?;

        info!("All connections drained");
        Ok(())
    }
}

/// Register the daemon's built-in commands.
fn register_builtins(
    dispatcher: &mut CommandDispatcher,
    registry: ConnectionRegistry,
) -> Result<()> {
    dispatcher.handle("ping", |_payload| async move { Ok(b"pong".to_vec()) })?;

    dispatcher.handle("echo", |payload| async move { Ok(payload) })?;

    dispatcher.handle("version", |_payload| async move {
        Ok(env!("CARGO_PKG_VERSION").as_bytes().to_vec())
    })?;

    dispatcher.handle("stats", move |_payload| {
        let registry = registry.clone();
        async move {
            let stats = format!("connections={}", registry.len());
            Ok(stats.into_bytes())
        }
    })?;

    Ok(())
}
