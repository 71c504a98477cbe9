//! TCP and Unix-domain listeners.
//!
//! - `host:port`: TCP socket
//! - `unix:/path`: Unix Domain Socket (unix only)
//!
//! # Example
//!
//! ```ignore
//! use fcgi_backend::transport::{ListenAddr, Listener};
//!
//! let addr: ListenAddr = "unix:/tmp/fcgi.sock".parse()?;
//! let listener = Listener::bind(&addr).await?;
//! let stream = listener.accept().await?;
//! ```

use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{FcgiError, Result};

#[cfg(unix)]
use std::path::PathBuf;
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

const UNIX_PREFIX: &str = "unix:";

/// Address to listen on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// `host:port`
    Tcp(String),
    /// Socket file path.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl FromStr for ListenAddr {
    type Err = FcgiError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(path) = s.strip_prefix(UNIX_PREFIX) {
            if path.is_empty() {
                return Err(FcgiError::InvalidAddress(s.to_string()));
            }
            #[cfg(unix)]
            return Ok(ListenAddr::Unix(PathBuf::from(path)));
            #[cfg(not(unix))]
            return Err(FcgiError::InvalidAddress(s.to_string()));
        }

        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(ListenAddr::Tcp(s.to_string()))
            }
            _ => Err(FcgiError::InvalidAddress(s.to_string())),
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => f.write_str(addr),
            #[cfg(unix)]
            ListenAddr::Unix(path) => write!(f, "{}{}", UNIX_PREFIX, path.display()),
        }
    }
}

/// A bound listener.
pub enum Listener {
    /// TCP listener.
    Tcp(TcpListener),
    /// Unix Domain Socket listener; the socket file is removed on drop.
    #[cfg(unix)]
    Unix {
        /// Underlying listener.
        listener: UnixListener,
        /// Socket file path.
        path: PathBuf,
    },
}

impl Listener {
    /// Bind to an address.
    ///
    /// For Unix sockets, removes any existing socket file at the path first.
    pub async fn bind(addr: &ListenAddr) -> Result<Self> {
        match addr {
            ListenAddr::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr.as_str()).await?)),
            #[cfg(unix)]
            ListenAddr::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
        }
    }

    /// Accept a single connection.
    pub async fn accept(&self) -> Result<Stream> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                tracing::debug!("Accepted TCP connection from {}", peer);
                Ok(Stream::Tcp(stream))
            }
            #[cfg(unix)]
            Listener::Unix { listener, .. } => {
                let (stream, _addr) = listener.accept().await?;
                tracing::debug!("Accepted Unix connection");
                Ok(Stream::Unix(stream))
            }
        }
    }

    /// The address actually bound (resolves port 0).
    pub fn local_addr(&self) -> Result<ListenAddr> {
        match self {
            Listener::Tcp(listener) => Ok(ListenAddr::Tcp(listener.local_addr()?.to_string())),
            #[cfg(unix)]
            Listener::Unix { path, .. } => Ok(ListenAddr::Unix(path.clone())),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            if let Listener::Unix { path, .. } = self {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

/// An accepted connection.
pub enum Stream {
    /// TCP stream.
    Tcp(TcpStream),
    /// Unix Domain Socket stream.
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Stream::Tcp(s) => s.is_write_vectored(),
            #[cfg(unix)]
            Stream::Unix(s) => s.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
