//! Private worker addresses.
//!
//! Each worker binds a private listener the manager forwards connections to:
//! a filesystem socket under the pool's state directory, or a loopback TCP
//! port picked by the OS.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

/// A byte stream the proxy and applications can read and write.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Connection for T {}

/// Where a worker listens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerAddress {
    /// Filesystem (unix domain) socket.
    Unix { path: PathBuf },
    /// TCP socket, normally on loopback.
    Tcp { addr: SocketAddr },
}

impl WorkerAddress {
    /// Loopback TCP with an OS-assigned port.
    pub fn loopback() -> Self {
        Self::Tcp {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        }
    }

    /// Bind a listener at this address.
    ///
    /// Returns the listener together with the address actually bound (the
    /// real port for `tcp` with port 0). A stale socket file left behind by a
    /// crashed predecessor is removed first.
    pub async fn bind(&self) -> io::Result<(WorkerListener, WorkerAddress)> {
        match self {
            Self::Unix { path } => {
                match std::fs::remove_file(path) {
                    Ok(()) => tracing::debug!(path = %path.display(), "Removed stale worker socket"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
                let listener = UnixListener::bind(path)?;
                Ok((
                    WorkerListener::Unix {
                        listener,
                        path: path.clone(),
                    },
                    self.clone(),
                ))
            }
            Self::Tcp { addr } => {
                let listener = TcpListener::bind(addr).await?;
                let bound = Self::Tcp {
                    addr: listener.local_addr()?,
                };
                Ok((WorkerListener::Tcp(listener), bound))
            }
        }
    }

    /// Open a connection to this address.
    pub async fn connect(&self) -> io::Result<Box<dyn Connection>> {
        match self {
            Self::Unix { path } => Ok(Box::new(UnixStream::connect(path).await?)),
            Self::Tcp { addr } => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }
}

impl fmt::Display for WorkerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix { path } => write!(f, "unix:{}", path.display()),
            Self::Tcp { addr } => write!(f, "tcp:{}", addr),
        }
    }
}

/// A bound worker listener. A unix socket file is removed when this is dropped.
#[derive(Debug)]
pub enum WorkerListener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

impl WorkerListener {
    /// Accept the next connection.
    pub async fn accept(&self) -> io::Result<Box<dyn Connection>> {
        match self {
            Self::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }
}

impl Drop for WorkerListener {
    fn drop(&mut self) {
        if let Self::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}
