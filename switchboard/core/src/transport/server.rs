//! Command Server
//!
//! Wires the listener, registry, reactor, and dispatcher into one serving
//! loop:
//!
//! ```text
//!   accept loop ──> registry ──> reactor (readiness)
//!                                   │ readable
//!                                   v
//!                             service task ──> dispatcher ──> write reply
//!                                   │ done
//!                                   v
//!                                 rearm
//! ```
//!
//! Each accepted connection is registered for read readiness. When it fires,
//! a short-lived service task drains the socket, dispatches every complete
//! message in arrival order, writes the replies, and re-arms the connection.
//! One connection's handler never blocks another's readiness.
//!
//! Shutdown is staged through named steps: `accept` stops the accept loop,
//! `reactor` marks the readiness loop drained, and `drain` marks all
//! in-flight service tasks finished. The latter two are detached steps so a
//! root-scope cancel cannot mark teardown complete before it has happened.

use std::sync::Arc;

use super::config::{Addr, TransportConfig};
use super::dispatcher::CommandDispatcher;
use super::error::{ConfigError, TransportError};
use super::frame::FrameCodec;
use super::reactor::{Interest, Reactor, ReactorEvent};
use super::registry::{Connection, ConnectionRegistry};
use super::socket::{Listener, SocketStream};
use crate::shutdown::Shutdown;
use crate::tasks::TaskGroup;

/// Declarations of the serving teardown steps, in completion order.
///
/// `accept` is a child of the caller's root scope, so cancelling the root
/// stops the accept loop. `reactor` and `drain` are detached: they report
/// actual teardown progress and complete only when [`CommandServer::serve`]
/// marks them, never via the root cancel.
pub const SHUTDOWN_STEPS: [&str; 3] = ["accept", "!reactor", "!drain"];

/// Serves registered commands to connecting peers.
pub struct CommandServer {
    config: TransportConfig,
    codec: FrameCodec,
    dispatcher: Arc<CommandDispatcher>,
    registry: ConnectionRegistry,
    reactor: Arc<Reactor>,
    tasks: TaskGroup,
}

impl CommandServer {
    /// Build a server from a validated configuration and a populated
    /// dispatcher.
    pub fn new(
        config: TransportConfig,
        dispatcher: CommandDispatcher,
    ) -> Result<Self, ConfigError> {
        Self::with_registry(config, dispatcher, ConnectionRegistry::new())
    }

    /// Build a server around an externally created registry, so handlers
    /// (e.g. a stats command) can observe the live connection set.
    pub fn with_registry(
        config: TransportConfig,
        dispatcher: CommandDispatcher,
        registry: ConnectionRegistry,
    ) -> Result<Self, ConfigError> {
        let codec = config.codec()?;
        Ok(Self {
            config,
            codec,
            dispatcher: Arc::new(dispatcher),
            registry,
            reactor: Arc::new(Reactor::new()),
            tasks: TaskGroup::new(),
        })
    }

    /// Handle on the live connection registry, e.g. for stats commands.
    #[must_use]
    pub fn registry(&self) -> ConnectionRegistry {
        self.registry.clone()
    }

    /// The address this server is configured to listen on.
    #[must_use]
    pub fn addr(&self) -> &Addr {
        &self.config.addr
    }

    /// Accept and serve connections until the `accept` shutdown step fires,
    /// then tear down in stages, marking `reactor` and `drain` as they
    /// complete.
    pub async fn serve(&self, shutdown: &Shutdown) -> Result<(), TransportError> {
        let listener = Listener::bind(&self.config.addr).await?;

        let reactor_task = {
            let reactor = Arc::clone(&self.reactor);
            let worker = ServiceWorker {
                codec: self.codec.clone(),
                dispatcher: Arc::clone(&self.dispatcher),
                registry: self.registry.clone(),
                reactor: Arc::clone(&self.reactor),
                chunk_size: self.config.read_buffer_size,
            };
            let tasks = self.tasks.clone();
            self.tasks.background(async move {
                reactor
                    .run(move |conn, event| {
                        let worker = worker.clone();
                        tasks.background(async move {
                            worker.service(conn, event).await;
                        });
                    })
                    .await
            })
        };

        loop {
            tokio::select! {
                () = shutdown.wait("accept") => {
                    tracing::info!("Accept loop stopping");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok(stream) => self.admit(stream),
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                    }
                },
            }
        }

        // Staged teardown: readiness loop first, then in-flight work
        if let Err(e) = self.reactor.stop() {
            tracing::warn!(error = %e, "Reactor stop failed");
        }
        if let Ok(Err(e)) = reactor_task.await {
            tracing::warn!(error = %e, "Reactor loop exited with error");
        }
        shutdown.done("reactor");

        self.tasks.wait().await;
        let dropped = self.registry.clear();
        if dropped > 0 {
            tracing::debug!(connections = dropped, "Dropped remaining connections");
        }
        shutdown.done("drain");

        listener.cleanup();
        Ok(())
    }

    /// Admit one accepted stream: enforce the connection limit and, for
    /// Unix sockets, same-UID peer credentials, then register it with the
    /// reactor.
    fn admit(&self, stream: SocketStream) {
        let limit = self.config.max_connections;
        if limit > 0 && self.registry.len() >= limit {
            tracing::warn!(limit, "Connection limit reached, rejecting peer");
            return;
        }

        if let Some(peer_uid) = stream.peer_uid() {
            let my_uid = unsafe { libc::getuid() };
            if peer_uid != my_uid {
                tracing::warn!(peer_uid, "Rejecting connection from foreign UID");
                return;
            }
        }

        let conn = Arc::new(Connection::new(stream));
        let id = conn.id();
        self.registry.add(Arc::clone(&conn));
        if let Err(e) = self.reactor.register(conn, Interest::READABLE) {
            tracing::warn!(conn_id = %id, error = %e, "Failed to register connection");
            self.registry.remove(id);
        } else {
            tracing::debug!(conn_id = %id, total = self.registry.len(), "Connection admitted");
        }
    }
}

/// Per-event servicing state, cloned into each short-lived service task.
#[derive(Clone)]
struct ServiceWorker {
    codec: FrameCodec,
    dispatcher: Arc<CommandDispatcher>,
    registry: ConnectionRegistry,
    reactor: Arc<Reactor>,
    chunk_size: usize,
}

impl ServiceWorker {
    async fn service(&self, conn: Arc<Connection>, event: ReactorEvent) {
        match event {
            ReactorEvent::Readable => {
                if let Err(e) = self.drain(&conn).await {
                    tracing::debug!(conn_id = %conn.id(), error = %e, "Connection closed");
                    self.discard(&conn);
                }
            }
            ReactorEvent::Writable => {
                // Servers register read interest only; re-arm and move on
                let _ = self.reactor.rearm(conn.id());
            }
            ReactorEvent::Failed(e) => {
                tracing::warn!(conn_id = %conn.id(), error = %e, "Connection failed");
                self.registry.remove(conn.id());
            }
        }
    }

    /// Read everything available, dispatch complete messages in order, and
    /// either re-arm the connection or report why it cannot continue.
    async fn drain(&self, conn: &Arc<Connection>) -> Result<(), TransportError> {
        let eof = conn.fill_inbox(self.chunk_size).await?;

        while let Some(request) = conn.next_message(&self.codec).await? {
            let reply = self.dispatcher.dispatch(&request).await;
            let framed = self.codec.encode(&reply)?;
            conn.write_frame(&framed).await?;
        }

        if eof {
            return if conn.has_partial().await {
                Err(TransportError::Truncated)
            } else {
                Err(TransportError::Closed)
            };
        }

        // Rearm failure means the loop is stopping; the connection will be
        // dropped with the registry
        let _ = self.reactor.rearm(conn.id());
        Ok(())
    }

    fn discard(&self, conn: &Arc<Connection>) {
        self.registry.remove(conn.id());
        let _ = self.reactor.unregister(conn.id());
    }
}
