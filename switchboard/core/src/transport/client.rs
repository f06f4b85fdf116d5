//! Request Correlator
//!
//! Client side of the framed command protocol: opens or reuses a persistent
//! connection, writes one framed request, and blocks the caller until the
//! matching framed response arrives or the timeout elapses.
//!
//! # Correlation rule
//!
//! At most one call may be outstanding per connection handle. The second
//! caller on a busy handle fails immediately with [`TransportError::Busy`]
//! before any bytes are written; callers that need overlap open distinct
//! handles with [`CommandClient::open_new`]. Because responses on a handle
//! can only belong to the single in-flight request, no per-request sequence
//! numbers are needed.
//!
//! A call that times out poisons its connection: the handle is closed and
//! removed, so a stray late response can never be matched to a later,
//! unrelated call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::config::{Addr, TransportConfig};
use super::dispatcher::{encode_request, parse_response};
use super::error::{ConfigError, TransportError};
use super::frame::FrameCodec;
use super::registry::{Connection, ConnectionId, ConnectionRegistry};
use super::socket::SocketStream;

/// Clears the awaiting flag on every exit path of a call.
struct AwaitGuard<'a>(&'a Connection);

impl Drop for AwaitGuard<'_> {
    fn drop(&mut self) {
        self.0.end_await();
    }
}

/// Client for issuing synchronous commands over persistent connections.
pub struct CommandClient {
    codec: FrameCodec,
    default_timeout: Duration,
    read_buffer_size: usize,
    conns: ConnectionRegistry,
    /// Connection reuse table; guarded by an async lock so concurrent opens
    /// to the same address serialize instead of racing two dials.
    by_addr: tokio::sync::Mutex<HashMap<Addr, ConnectionId>>,
}

impl CommandClient {
    /// Create a client from a transport configuration. Fails on invalid
    /// size or framing settings.
    pub fn new(config: &TransportConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            codec: config.codec()?,
            default_timeout: config.call_timeout(),
            read_buffer_size: config.read_buffer_size,
            conns: ConnectionRegistry::new(),
            by_addr: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// The configured per-call timeout.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Open a connection to `addr`, reusing an existing healthy one.
    pub async fn open(&self, addr: &Addr) -> Result<ConnectionId, TransportError> {
        let mut by_addr = self.by_addr.lock().await;
        if let Some(&id) = by_addr.get(addr) {
            if self.conns.get(id).is_some() {
                return Ok(id);
            }
            // Poisoned or closed since; dial again
            by_addr.remove(addr);
        }

        let id = self.dial(addr).await?;
        by_addr.insert(addr.clone(), id);
        Ok(id)
    }

    /// Open a fresh connection to `addr`, never reusing. Distinct handles
    /// are the supported way to overlap calls to one peer.
    pub async fn open_new(&self, addr: &Addr) -> Result<ConnectionId, TransportError> {
        self.dial(addr).await
    }

    async fn dial(&self, addr: &Addr) -> Result<ConnectionId, TransportError> {
        let stream = SocketStream::connect(addr).await?;
        let conn = Arc::new(Connection::new(stream));
        let id = conn.id();
        self.conns.add(conn);
        tracing::debug!(conn_id = %id, addr = %addr, "Connection opened");
        Ok(id)
    }

    /// Issue one command and wait for its response with the default timeout.
    pub async fn call(
        &self,
        handle: ConnectionId,
        name: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        self.call_with_timeout(handle, name, payload, self.default_timeout)
            .await
    }

    /// Issue one command and wait for its response.
    ///
    /// Fails with [`TransportError::Busy`] — without writing any bytes — if
    /// another call is in flight on this handle. On timeout or any
    /// connection-scoped failure the handle is closed; protocol-level `err`
    /// responses surface as [`TransportError::Remote`] and leave the
    /// connection open for reuse.
    pub async fn call_with_timeout(
        &self,
        handle: ConnectionId,
        name: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let conn = self
            .conns
            .get(handle)
            .ok_or(TransportError::UnknownConnection(handle))?;

        if !conn.try_begin_await() {
            return Err(TransportError::Busy);
        }
        let _guard = AwaitGuard(&conn);

        let result = self.exchange(&conn, name, payload, timeout).await;

        if let Err(ref e) = result {
            if is_connection_fatal(e) {
                tracing::debug!(conn_id = %handle, error = %e, "Closing poisoned connection");
                self.close(handle).await;
            }
        }
        result
    }

    async fn exchange(
        &self,
        conn: &Connection,
        name: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let framed = self.codec.encode(&encode_request(name, payload))?;

        // The write is inside the timeout window too: a peer that stops
        // reading can stall the write once the send buffer fills.
        let exchange = async {
            conn.write_frame(&framed).await?;
            conn.read_frame(&self.codec, self.read_buffer_size).await
        };
        let response = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout)??;

        match parse_response(&response) {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(TransportError::Remote(message)),
            None => Err(TransportError::MalformedResponse),
        }
    }

    /// Close a handle and release its stream. Idempotent.
    pub async fn close(&self, handle: ConnectionId) {
        self.conns.remove(handle);
        let mut by_addr = self.by_addr.lock().await;
        by_addr.retain(|_, &mut id| id != handle);
    }

    /// Number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }
}

/// Whether this error poisons the connection it occurred on.
fn is_connection_fatal(e: &TransportError) -> bool {
    matches!(
        e,
        TransportError::Timeout
            | TransportError::Closed
            | TransportError::Truncated
            | TransportError::Io(_)
            | TransportError::Frame(_)
            | TransportError::MalformedResponse
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::dispatcher::{encode_err, encode_ok, split_request};
    use crate::transport::socket::Listener;
    use tempfile::TempDir;
    use tokio::task::JoinHandle;

    fn test_config(dir: &TempDir) -> TransportConfig {
        TransportConfig {
            addr: Addr::Unix(dir.path().join("test.sock")),
            call_timeout_ms: 1000,
            ..Default::default()
        }
    }

    /// A hand-rolled peer that answers `n` requests with the given behavior.
    fn spawn_peer<F>(listener: Listener, n: usize, respond: F) -> JoinHandle<()>
    where
        F: Fn(&[u8], &[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        tokio::spawn(async move {
            let codec = FrameCodec::crlf();
            let conn = Connection::new(listener.accept().await.unwrap());
            for _ in 0..n {
                let request = conn.read_frame(&codec, 4096).await.unwrap();
                let (name, payload) = split_request(&request);
                if let Some(reply) = respond(name, payload) {
                    let framed = codec.encode(&reply).unwrap();
                    conn.write_frame(&framed).await.unwrap();
                }
            }
        })
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);
        let listener = Listener::bind(&config.addr).await.unwrap();
        let peer = spawn_peer(listener, 1, |name, payload| {
            assert_eq!(name, b"echo");
            Some(encode_ok(payload))
        });

        let client = CommandClient::new(&config).unwrap();
        let handle = client.open(&config.addr).await.unwrap();
        let reply = client.call(handle, "echo", b"hello").await.unwrap();
        assert_eq!(reply, b"hello");

        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_call_unknown_handle() {
        let temp_dir = TempDir::new().unwrap();
        let client = CommandClient::new(&test_config(&temp_dir)).unwrap();
        let err = client
            .call(ConnectionId::new(), "echo", b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::UnknownConnection(_)));
    }

    #[tokio::test]
    async fn test_second_call_on_busy_handle_fails_fast() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);
        let listener = Listener::bind(&config.addr).await.unwrap();

        // Peer answers the first request only after a delay
        let peer = tokio::spawn(async move {
            let codec = FrameCodec::crlf();
            let conn = Connection::new(listener.accept().await.unwrap());
            let request = conn.read_frame(&codec, 4096).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            let (_, payload) = split_request(&request);
            let framed = codec.encode(&encode_ok(payload)).unwrap();
            conn.write_frame(&framed).await.unwrap();
        });

        let client = Arc::new(CommandClient::new(&config).unwrap());
        let handle = client.open(&config.addr).await.unwrap();

        let slow_client = Arc::clone(&client);
        let first = tokio::spawn(async move { slow_client.call(handle, "slow", b"x").await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = client.call(handle, "echo", b"y").await.unwrap_err();
        assert!(matches!(err, TransportError::Busy));

        // The first call is unaffected and completes
        assert_eq!(first.await.unwrap().unwrap(), b"x");
        peer.await.unwrap();

        // The handle is released after completion
        assert!(!client.conns.get(handle).unwrap().is_awaiting());
    }

    #[tokio::test]
    async fn test_timeout_poisons_connection() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);
        let listener = Listener::bind(&config.addr).await.unwrap();
        // Peer reads but never answers, and stays connected well past the
        // client's deadline so the timeout fires before any EOF
        let _peer = tokio::spawn(async move {
            let codec = FrameCodec::crlf();
            let conn = Connection::new(listener.accept().await.unwrap());
            let _request = conn.read_frame(&codec, 4096).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = CommandClient::new(&config).unwrap();
        let handle = client.open(&config.addr).await.unwrap();

        let err = client
            .call_with_timeout(handle, "stall", b"", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout));

        // The poisoned handle is gone; a late response cannot be delivered
        let err = client.call(handle, "echo", b"x").await.unwrap_err();
        assert!(matches!(err, TransportError::UnknownConnection(_)));
        assert_eq!(client.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_covers_a_blocked_write() {
        let temp_dir = TempDir::new().unwrap();
        let config = TransportConfig {
            max_message_size: 0,
            ..test_config(&temp_dir)
        };
        let listener = Listener::bind(&config.addr).await.unwrap();
        // Peer accepts but never reads, so the kernel send buffer fills
        // and the client's write stalls
        let _peer = tokio::spawn(async move {
            let _held = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = CommandClient::new(&config).unwrap();
        let handle = client.open(&config.addr).await.unwrap();

        let big = vec![b'x'; 8 * 1024 * 1024];
        let started = std::time::Instant::now();
        let err = client
            .call_with_timeout(handle, "sink", &big, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_remote_error_keeps_connection_open() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);
        let listener = Listener::bind(&config.addr).await.unwrap();
        let peer = spawn_peer(listener, 2, |name, payload| {
            if name == b"ghost" {
                Some(encode_err("unknown command: \"ghost\""))
            } else {
                Some(encode_ok(payload))
            }
        });

        let client = CommandClient::new(&config).unwrap();
        let handle = client.open(&config.addr).await.unwrap();

        let err = client.call(handle, "ghost", b"").await.unwrap_err();
        assert!(matches!(err, TransportError::Remote(ref m) if m.contains("ghost")));

        // Same handle remains usable
        let reply = client.call(handle, "echo", b"still here").await.unwrap();
        assert_eq!(reply, b"still here");
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_open_reuses_open_new_does_not() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);
        let listener = Listener::bind(&config.addr).await.unwrap();
        // Accept connections in the background so dials complete
        let _acceptor = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                held.push(listener.accept().await.unwrap());
            }
        });

        let client = CommandClient::new(&config).unwrap();
        let first = client.open(&config.addr).await.unwrap();
        let second = client.open(&config.addr).await.unwrap();
        assert_eq!(first, second);

        let third = client.open_new(&config.addr).await.unwrap();
        assert_ne!(first, third);
        assert_eq!(client.connection_count(), 2);

        client.close(first).await;
        client.close(first).await; // idempotent
        assert_eq!(client.connection_count(), 1);

        // After closing, open dials a fresh connection
        let fourth = client.open(&config.addr).await.unwrap();
        assert_ne!(fourth, first);
    }
}
