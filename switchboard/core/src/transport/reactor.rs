//! Readiness Multiplexer
//!
//! A single event loop over I/O readiness for many registered connections.
//! The loop never blocks on handler work: it reports ready connections to a
//! callback and goes back to waiting, so one slow handler cannot stall
//! readiness detection for the others.
//!
//! # Dispatch model
//!
//! Dispatch is one-shot: a connection reported ready is parked until
//! [`Reactor::rearm`] is called for it. This keeps level-triggered readiness
//! from re-reporting a connection whose bytes are still being processed and
//! guarantees at most one handler services a connection at a time.
//!
//! On each wake the loop delivers a batch: the connection that woke it plus
//! every other connection that is already ready. An empty poll set is not an
//! error; the loop just waits for control traffic (registration, rearm,
//! stop).
//!
//! # Failure policy
//!
//! Readiness errors are isolated to their connection: the entry is removed
//! and [`ReactorEvent::Failed`] is reported; the loop continues. Loss of the
//! control channel is the only loop-fatal condition and propagates out of
//! [`Reactor::run`].

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::mpsc;

use super::registry::{Connection, ConnectionId};

/// Which readiness kinds a registration watches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interest {
    readable: bool,
    writable: bool,
}

impl Interest {
    /// Watch read readiness.
    pub const READABLE: Self = Self {
        readable: true,
        writable: false,
    };
    /// Watch write readiness.
    pub const WRITABLE: Self = Self {
        readable: false,
        writable: true,
    };
    /// Watch both.
    pub const BOTH: Self = Self {
        readable: true,
        writable: true,
    };

    /// Whether read readiness is watched.
    #[must_use]
    pub fn is_readable(&self) -> bool {
        self.readable
    }

    /// Whether write readiness is watched.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

/// What happened on a registered connection.
#[derive(Debug)]
pub enum ReactorEvent {
    /// The connection has bytes (or EOF) to read.
    Readable,
    /// The connection can accept writes.
    Writable,
    /// Readiness polling failed; the connection was removed from the loop.
    Failed(io::Error),
}

/// Errors from reactor lifecycle operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReactorError {
    /// `run` was invoked while the loop is already running.
    #[error("reactor is already running")]
    AlreadyRunning,

    /// `stop` was invoked on a stopped (or already stopping) loop.
    #[error("reactor is already stopped")]
    AlreadyStopped,

    /// The control channel was lost mid-run; the loop cannot continue.
    #[error("reactor control channel closed")]
    ControlChannelClosed,
}

const STOPPED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;

enum Ctrl {
    Register(Arc<Connection>, Interest),
    Unregister(ConnectionId),
    Rearm(ConnectionId),
    Stop,
}

struct Entry {
    conn: Arc<Connection>,
    interest: Interest,
    /// Parked entries were dispatched and wait for a rearm.
    parked: bool,
}

/// Single-loop readiness multiplexer.
///
/// States: `Stopped -> Running -> Stopping -> Stopped`. Registrations made
/// while stopped are queued and picked up when `run` starts; registrations
/// do not survive across runs.
pub struct Reactor {
    ctrl_tx: mpsc::UnboundedSender<Ctrl>,
    ctrl_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Ctrl>>>,
    state: AtomicU8,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    /// Create a stopped reactor.
    #[must_use]
    pub fn new() -> Self {
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        Self {
            ctrl_tx,
            ctrl_rx: parking_lot::Mutex::new(Some(ctrl_rx)),
            state: AtomicU8::new(STOPPED),
        }
    }

    /// Whether the loop is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RUNNING
    }

    fn send(&self, msg: Ctrl) -> Result<(), ReactorError> {
        self.ctrl_tx
            .send(msg)
            .map_err(|_| ReactorError::ControlChannelClosed)
    }

    /// Add a connection to the loop for the given readiness interest.
    pub fn register(&self, conn: Arc<Connection>, interest: Interest) -> Result<(), ReactorError> {
        tracing::debug!(conn_id = %conn.id(), "Registering connection");
        self.send(Ctrl::Register(conn, interest))
    }

    /// Remove a connection from the loop. Idempotent; no callback fires for
    /// this connection after the removal is processed.
    pub fn unregister(&self, id: ConnectionId) -> Result<(), ReactorError> {
        self.send(Ctrl::Unregister(id))
    }

    /// Re-arm a parked connection after its handler finished.
    pub fn rearm(&self, id: ConnectionId) -> Result<(), ReactorError> {
        self.send(Ctrl::Rearm(id))
    }

    /// Request the running loop to stop after the current wake.
    ///
    /// Stopping a stopped (or already stopping) reactor is a logic error
    /// and fails with [`ReactorError::AlreadyStopped`].
    pub fn stop(&self) -> Result<(), ReactorError> {
        self.state
            .compare_exchange(RUNNING, STOPPING, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| ReactorError::AlreadyStopped)?;
        self.send(Ctrl::Stop)
    }

    /// Drive the event-wait-and-dispatch loop until stopped.
    ///
    /// `on_ready` is invoked for each ready connection; it must not block —
    /// hand the work to independently scheduled tasks.
    pub async fn run<F>(&self, on_ready: F) -> Result<(), ReactorError>
    where
        F: Fn(Arc<Connection>, ReactorEvent) + Send + Sync,
    {
        if self
            .state
            .compare_exchange(STOPPED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ReactorError::AlreadyRunning);
        }

        // Invariant: the receiver is parked here whenever the state is
        // Stopped, so the exchange above guarantees it is present.
        let Some(mut rx) = self.ctrl_rx.lock().take() else {
            self.state.store(STOPPED, Ordering::SeqCst);
            return Err(ReactorError::AlreadyRunning);
        };

        tracing::debug!("Reactor loop started");
        let result = self.event_loop(&mut rx, &on_ready).await;

        *self.ctrl_rx.lock() = Some(rx);
        self.state.store(STOPPED, Ordering::SeqCst);
        tracing::debug!("Reactor loop stopped");
        result
    }

    async fn event_loop<F>(
        &self,
        rx: &mut mpsc::UnboundedReceiver<Ctrl>,
        on_ready: &F,
    ) -> Result<(), ReactorError>
    where
        F: Fn(Arc<Connection>, ReactorEvent) + Send + Sync,
    {
        let mut entries: HashMap<ConnectionId, Entry> = HashMap::new();

        loop {
            // Readiness futures for every armed connection. Rebuilt each
            // wake; the futures only observe readiness and hold no state.
            let mut ready: FuturesUnordered<_> = entries
                .values()
                .filter(|e| !e.parked)
                .map(|e| {
                    let conn = Arc::clone(&e.conn);
                    let interest = e.interest;
                    async move {
                        let result = wait_ready(&conn, interest).await;
                        (conn.id(), result)
                    }
                })
                .collect();

            tokio::select! {
                ctrl = rx.recv() => match ctrl {
                    Some(Ctrl::Register(conn, interest)) => {
                        entries.insert(conn.id(), Entry { conn, interest, parked: false });
                    }
                    Some(Ctrl::Unregister(id)) => {
                        entries.remove(&id);
                    }
                    Some(Ctrl::Rearm(id)) => {
                        if let Some(entry) = entries.get_mut(&id) {
                            entry.parked = false;
                        }
                    }
                    Some(Ctrl::Stop) => return Ok(()),
                    None => return Err(ReactorError::ControlChannelClosed),
                },
                // With nothing armed the stream yields None and this branch
                // disables itself; only control traffic can wake us then.
                Some(first) = ready.next() => {
                    let mut batch = vec![first];
                    while let Some(Some(more)) = ready.next().now_or_never() {
                        batch.push(more);
                    }
                    drop(ready);

                    for (id, result) in batch {
                        let Some(entry) = entries.get_mut(&id) else {
                            // Unregistered while in the batch
                            continue;
                        };
                        entry.parked = true;
                        let conn = Arc::clone(&entry.conn);
                        match result {
                            Ok(event) => on_ready(conn, event),
                            Err(e) => {
                                tracing::warn!(conn_id = %id, error = %e, "Readiness poll failed");
                                entries.remove(&id);
                                on_ready(conn, ReactorEvent::Failed(e));
                            }
                        }
                    }
                }
            }
        }
    }
}

async fn wait_ready(conn: &Connection, interest: Interest) -> io::Result<ReactorEvent> {
    let stream = conn.stream();
    if interest.is_readable() && interest.is_writable() {
        tokio::select! {
            r = stream.readable() => r.map(|()| ReactorEvent::Readable),
            w = stream.writable() => w.map(|()| ReactorEvent::Writable),
        }
    } else if interest.is_writable() {
        stream.writable().await.map(|()| ReactorEvent::Writable)
    } else {
        stream.readable().await.map(|()| ReactorEvent::Readable)
    }
}
