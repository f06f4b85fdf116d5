//! Connection Registry
//!
//! Concurrency-safe mapping from connection identity to connection state.
//! The registry is the only structure touched by multiple concurrent
//! readiness callbacks, so it is sharded (`DashMap`) and every per-connection
//! flag carries its own narrow lock instead of a registry-wide one — two
//! unrelated connections never serialize on each other.
//!
//! # Ownership
//!
//! The registry owns connections by identity; the reactor and callers hold
//! `Arc` clones, never a second registry entry. Removal is idempotent
//! because close can race with an in-flight readiness callback: the loser of
//! the race sees a no-op.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::error::TransportError;
use super::frame::{FrameBuffer, FrameCodec};
use super::socket::SocketStream;

/// Unique identifier for a connection.
///
/// Assigned from a process-wide counter when the connection is created and
/// stable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Mint a new unique connection ID.
    #[must_use]
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// State for one live connection.
///
/// The `awaiting` flag marks a request in flight with no response matched
/// yet; it is what serializes calls on a shared handle. The `inbox` holds
/// partial-read bytes between readiness wakeups — the codec itself is
/// stateless and shared across connections.
pub struct Connection {
    id: ConnectionId,
    stream: SocketStream,
    /// True while a call is in flight on this connection. Guarded by a lock
    /// scoped to this connection only.
    awaiting: parking_lot::Mutex<bool>,
    /// Partial-frame accumulation between reads.
    inbox: tokio::sync::Mutex<FrameBuffer>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).finish()
    }
}

impl Connection {
    /// Wrap an accepted or connected stream.
    #[must_use]
    pub fn new(stream: SocketStream) -> Self {
        Self {
            id: ConnectionId::new(),
            stream,
            awaiting: parking_lot::Mutex::new(false),
            inbox: tokio::sync::Mutex::new(FrameBuffer::new()),
        }
    }

    /// This connection's identity.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Underlying stream.
    #[must_use]
    pub fn stream(&self) -> &SocketStream {
        &self.stream
    }

    /// Atomically claim the connection for a call. Returns `false` if a
    /// call is already in flight (the caller must not write any bytes).
    #[must_use]
    pub fn try_begin_await(&self) -> bool {
        let mut awaiting = self.awaiting.lock();
        if *awaiting {
            false
        } else {
            *awaiting = true;
            true
        }
    }

    /// Release the connection after a call completes on any path.
    pub fn end_await(&self) {
        *self.awaiting.lock() = false;
    }

    /// Whether a call is currently in flight.
    #[must_use]
    pub fn is_awaiting(&self) -> bool {
        *self.awaiting.lock()
    }

    /// Write one framed message, waiting for writability as needed.
    pub async fn write_frame(&self, framed: &[u8]) -> io::Result<()> {
        self.stream.write_all(framed).await
    }

    /// Drain everything currently readable into the inbox without blocking.
    ///
    /// Returns `Ok(true)` if the peer closed the stream (EOF observed).
    pub async fn fill_inbox(&self, chunk_size: usize) -> Result<bool, TransportError> {
        let mut chunk = vec![0u8; chunk_size.max(1)];
        let mut inbox = self.inbox.lock().await;
        loop {
            match self.stream.try_read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => inbox.push(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }

    /// Decode the next buffered message, if a complete one is available.
    pub async fn next_message(&self, codec: &FrameCodec) -> Result<Option<Vec<u8>>, TransportError> {
        let mut inbox = self.inbox.lock().await;
        Ok(codec.decode(&mut inbox)?)
    }

    /// Whether the inbox holds a partial message. Distinguishes a clean
    /// close from a truncated one at EOF.
    pub async fn has_partial(&self) -> bool {
        !self.inbox.lock().await.is_empty()
    }

    /// Read one complete framed message directly from the stream, blocking
    /// until it arrives. This is the correlator's read path; server-side
    /// reads go through the reactor instead.
    pub async fn read_frame(
        &self,
        codec: &FrameCodec,
        chunk_size: usize,
    ) -> Result<Vec<u8>, TransportError> {
        loop {
            if let Some(msg) = self.next_message(codec).await? {
                return Ok(msg);
            }
            self.stream.readable().await?;
            let eof = self.fill_inbox(chunk_size).await?;
            if eof {
                if let Some(msg) = self.next_message(codec).await? {
                    return Ok(msg);
                }
                return if self.has_partial().await {
                    Err(TransportError::Truncated)
                } else {
                    Err(TransportError::Closed)
                };
            }
        }
    }
}

/// Concurrency-safe registry of live connections.
///
/// A connection must never be present in two registries simultaneously.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    conns: Arc<DashMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection under its identity.
    pub fn add(&self, conn: Arc<Connection>) {
        self.conns.insert(conn.id(), conn);
    }

    /// Remove a connection. Idempotent: removing an absent identity is a
    /// no-op and returns `None`.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.conns.remove(&id).map(|(_, conn)| conn)
    }

    /// Look up a connection by identity.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.conns.get(&id).map(|r| Arc::clone(r.value()))
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Snapshot of live connection identities.
    #[must_use]
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.conns.iter().map(|r| *r.key()).collect()
    }

    /// Remove every connection, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let n = self.conns.len();
        self.conns.clear();
        n
    }
}
