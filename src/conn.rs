//! Connection handle returned by the dialer

use crate::tls::TlsStrategy;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// AsyncReadWrite is implemented by every stream the dialer can hand out
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncReadWrite for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Boxed byte stream: plain TCP, a proxy tunnel, or TLS on top of either
pub type IoStream = Box<dyn AsyncReadWrite + 'static>;

/// Connection is an established, possibly proxied, possibly encrypted stream
///
/// The caller owns it exclusively. Dropping it closes the socket.
pub struct Connection {
    stream: IoStream,
    target: String,
    proxy: Option<String>,
    strategy: Option<TlsStrategy>,
    alpn: Option<Vec<u8>>,
}

impl Connection {
    pub(crate) fn new(stream: IoStream, target: impl Into<String>) -> Self {
        Self {
            stream,
            target: target.into(),
            proxy: None,
            strategy: None,
            alpn: None,
        }
    }

    pub(crate) fn with_proxy(mut self, proxy: String) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub(crate) fn into_parts(self) -> (IoStream, String, Option<String>) {
        (self.stream, self.target, self.proxy)
    }

    pub(crate) fn upgraded(
        stream: IoStream,
        target: String,
        proxy: Option<String>,
        strategy: TlsStrategy,
        alpn: Option<Vec<u8>>,
    ) -> Self {
        Self {
            stream,
            target,
            proxy,
            strategy: Some(strategy),
            alpn,
        }
    }

    /// target is the `host:port` this connection reaches
    pub fn target(&self) -> &str {
        &self.target
    }

    /// proxy is the redacted proxy URI that carried the connection, if any
    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    /// tls_strategy is the strategy that completed the handshake, if TLS was used
    pub fn tls_strategy(&self) -> Option<TlsStrategy> {
        self.strategy
    }

    /// negotiated_alpn is the ALPN protocol the server picked
    pub fn negotiated_alpn(&self) -> Option<&[u8]> {
        self.alpn.as_deref()
    }

    pub fn is_tls(&self) -> bool {
        self.strategy.is_some()
    }

    pub fn into_inner(self) -> IoStream {
        self.stream
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("target", &self.target)
            .field("proxy", &self.proxy)
            .field("strategy", &self.strategy)
            .field("alpn", &self.alpn.as_deref().map(String::from_utf8_lossy))
            .finish()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
