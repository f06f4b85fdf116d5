//! Socket Abstraction
//!
//! Uniform wrapper over TCP and Unix-domain streams and listeners so the
//! registry, reactor, and correlator are transport-agnostic. Readiness is
//! exposed through `readable()`/`writable()` with non-blocking
//! `try_read`/`try_write`, which is what lets a single reactor loop watch
//! many connections without owning split halves.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use super::config::Addr;

/// A connected bidirectional byte stream.
#[derive(Debug)]
pub enum SocketStream {
    /// TCP connection.
    Tcp(TcpStream),
    /// Unix domain socket connection.
    Unix(UnixStream),
}

impl SocketStream {
    /// Connect to a peer at `addr`.
    pub async fn connect(addr: &Addr) -> io::Result<Self> {
        match addr {
            Addr::Tcp(a) => Ok(Self::Tcp(TcpStream::connect(a).await?)),
            Addr::Unix(p) => Ok(Self::Unix(UnixStream::connect(p).await?)),
        }
    }

    /// Wait for the stream to become readable.
    pub async fn readable(&self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.readable().await,
            Self::Unix(s) => s.readable().await,
        }
    }

    /// Wait for the stream to become writable.
    pub async fn writable(&self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.writable().await,
            Self::Unix(s) => s.writable().await,
        }
    }

    /// Non-blocking read; `Err(WouldBlock)` when the socket is drained.
    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.try_read(buf),
            Self::Unix(s) => s.try_read(buf),
        }
    }

    /// Non-blocking write; `Err(WouldBlock)` when the socket buffer is full.
    pub fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.try_write(buf),
            Self::Unix(s) => s.try_write(buf),
        }
    }

    /// Write the whole buffer, waiting for writability as needed.
    pub async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            self.writable().await?;
            match self.try_write(buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => buf = &buf[n..],
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Peer UID for Unix connections (Linux `SO_PEERCRED`).
    ///
    /// Returns `None` for TCP streams, on non-Linux platforms, and when the
    /// credentials cannot be read.
    #[cfg(target_os = "linux")]
    pub fn peer_uid(&self) -> Option<u32> {
        use std::os::unix::io::AsRawFd;

        let Self::Unix(s) = self else {
            return None;
        };
        let fd = s.as_raw_fd();
        let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        let result = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                &mut cred as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };

        if result == 0 {
            Some(cred.uid)
        } else {
            None
        }
    }

    /// Peer UID (non-Linux fallback). Filesystem permissions are the only
    /// admission control on platforms without `SO_PEERCRED`.
    #[cfg(not(target_os = "linux"))]
    pub fn peer_uid(&self) -> Option<u32> {
        None
    }
}

/// A bound listener accepting [`SocketStream`] connections.
#[derive(Debug)]
pub enum Listener {
    /// TCP listener.
    Tcp(TcpListener),
    /// Unix domain socket listener. The path is kept for cleanup.
    Unix(UnixListener, PathBuf),
}

impl Listener {
    /// Bind a listener on `addr`.
    ///
    /// For Unix sockets this creates parent directories, removes a stale
    /// socket file, and restricts the new socket to owner-only (0600).
    pub async fn bind(addr: &Addr) -> io::Result<Self> {
        match addr {
            Addr::Tcp(a) => {
                let listener = TcpListener::bind(a).await?;
                tracing::info!(addr = %a, "Listening on TCP");
                Ok(Self::Tcp(listener))
            }
            Addr::Unix(path) => {
                prepare_socket_path(path)?;
                let listener = UnixListener::bind(path)?;
                let perms = std::fs::Permissions::from_mode(0o600);
                std::fs::set_permissions(path, perms)?;
                tracing::info!(path = ?path, "Listening on Unix socket");
                Ok(Self::Unix(listener, path.clone()))
            }
        }
    }

    /// Accept the next incoming connection.
    pub async fn accept(&self) -> io::Result<SocketStream> {
        match self {
            Self::Tcp(l) => {
                let (stream, addr) = l.accept().await?;
                tracing::debug!(peer = %addr, "Accepted TCP connection");
                Ok(SocketStream::Tcp(stream))
            }
            Self::Unix(l, _) => {
                let (stream, _addr) = l.accept().await?;
                tracing::debug!("Accepted Unix socket connection");
                Ok(SocketStream::Unix(stream))
            }
        }
    }

    /// Remove the socket file for Unix listeners. Idempotent.
    pub fn cleanup(&self) {
        if let Self::Unix(_, path) = self {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    tracing::warn!(error = %e, path = ?path, "Failed to remove socket file");
                }
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Create the socket's parent directory and remove a stale socket file.
fn prepare_socket_path(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    if path.exists() {
        tracing::warn!(path = ?path, "Removing stale socket file");
        std::fs::remove_file(path)?;
    }
    Ok(())
}
