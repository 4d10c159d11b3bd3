//! TCP connect and TLS upgrade with independent timeouts.
//!
//! Each operation is a single await point wrapped in `tokio::time::timeout`:
//! the deadline is armed before the connect/handshake future is first polled,
//! so nothing the stack reports can be lost, and the losing branch is simply
//! dropped. Dropping a pending connect or handshake closes the socket, so a
//! failed call never leaves a half-open socket behind.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::ServerName;
use tokio_rustls::TlsConnector;

use crate::Endpoint;

/// Keep-alive idle time applied to every probe socket.
pub const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);

/// Error from the socket primitives.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("TCP connect to {endpoint} timed out after {timeout_ms}ms")]
    ConnectTimeout { endpoint: Endpoint, timeout_ms: u64 },

    #[error("TCP connect to {0} refused")]
    ConnectRefused(Endpoint),

    #[error("network unreachable for {endpoint}: {source}")]
    NetworkUnreachable {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("TCP connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake timed out after {timeout_ms}ms")]
    HandshakeTimeout { timeout_ms: u64 },

    #[error("TLS handshake failed: {0}")]
    Handshake(String),
}

impl SocketError {
    fn from_connect(endpoint: Endpoint, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::ConnectRefused(endpoint),
            io::ErrorKind::NetworkUnreachable | io::ErrorKind::HostUnreachable => {
                Self::NetworkUnreachable {
                    endpoint,
                    source: err,
                }
            }
            _ => Self::Connect {
                endpoint,
                source: err,
            },
        }
    }

    /// True for the TCP-layer variants.
    pub fn is_connect(&self) -> bool {
        !self.is_handshake()
    }

    /// True for the TLS-layer variants.
    pub fn is_handshake(&self) -> bool {
        matches!(self, Self::HandshakeTimeout { .. } | Self::Handshake(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout { .. } | Self::HandshakeTimeout { .. }
        )
    }
}

/// Open a TCP connection to `endpoint` within `timeout`.
///
/// On success the socket has keep-alive enabled and Nagle disabled.
pub async fn connect_tcp(endpoint: &Endpoint, timeout: Duration) -> Result<TcpStream, SocketError> {
    let attempt = tokio::time::timeout(timeout, TcpStream::connect(endpoint.socket_addr()));
    let stream = match attempt.await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(SocketError::from_connect(*endpoint, e)),
        Err(_) => {
            return Err(SocketError::ConnectTimeout {
                endpoint: *endpoint,
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    };
    tune_stream(&stream);
    Ok(stream)
}

/// Run a TLS client handshake over an already connected TCP stream.
///
/// The stream is consumed either way; on failure it is closed.
pub async fn upgrade_to_tls(
    connector: &TlsConnector,
    stream: TcpStream,
    server_name: &ServerName,
    timeout: Duration,
) -> Result<TlsStream<TcpStream>, SocketError> {
    let handshake = tokio::time::timeout(timeout, connector.connect(server_name.clone(), stream));
    let tls = match handshake.await {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => return Err(SocketError::Handshake(e.to_string())),
        Err(_) => {
            return Err(SocketError::HandshakeTimeout {
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    };
    tune_stream(tls.get_ref().0);
    Ok(tls)
}

/// Apply keep-alive and no-delay. Failures are logged and ignored: the
/// socket is still usable without them.
fn tune_stream(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "set_nodelay failed");
    }
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        tracing::debug!(error = %e, "set_tcp_keepalive failed");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────────────────

/// A pooled byte stream: plain TCP, or TLS layered over that same TCP socket.
pub enum Transport {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// The underlying TCP socket.
    pub fn tcp(&self) -> &TcpStream {
        match self {
            Self::Tcp(s) => s,
            Self::Tls(s) => s.get_ref().0,
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_tls() { "Tls" } else { "Tcp" };
        f.debug_tuple(kind).field(&self.tcp().peer_addr().ok()).finish()
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
