use socket2::SockRef;
use std::io::Error;
use std::net::Shutdown;
use std::ops::Deref;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client, server};

/// A byte stream the relay can pump and close.
///
/// Exposes the underlying TCP socket (when there is one) so that closing can
/// shut the file descriptor down before the higher level stream is dropped.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {
  /// The TCP socket carrying this stream.
  fn tcp_stream(&self) -> Option<&TcpStream>;
}

impl ProxyStream for TcpStream {
  fn tcp_stream(&self) -> Option<&TcpStream> {
    Some(self)
  }
}

impl<T: ProxyStream + ?Sized> ProxyStream for &mut T {
  fn tcp_stream(&self) -> Option<&TcpStream> {
    (**self).tcp_stream()
  }
}

impl<T: ProxyStream> ProxyStream for server::TlsStream<T> {
  fn tcp_stream(&self) -> Option<&TcpStream> {
    self.get_ref().0.tcp_stream()
  }
}

impl<T: ProxyStream> ProxyStream for client::TlsStream<T> {
  fn tcp_stream(&self) -> Option<&TcpStream> {
    self.get_ref().0.tcp_stream()
  }
}

/// Close a stream, tolerating streams that are already closed or half closed.
///
/// `shutdown(SHUT_RDWR)` is attempted on the socket first, then the stream's
/// own shutdown (which sends a TLS close_notify where applicable). Errors from
/// both are swallowed.
pub async fn safe_close<S: ProxyStream + ?Sized>(stream: &mut S) {
  if let Some(tcp) = stream.tcp_stream() {
    if let Err(e) = SockRef::from(tcp).shutdown(Shutdown::Both) {
      tracing::trace!("[Proxy] socket shutdown: {}", e);
    }
  }
  if let Err(e) = stream.shutdown().await {
    tracing::trace!("[Proxy] stream close: {}", e);
  }
}

/// Upstream connection returned by [`crate::ProxyConnector`]
#[derive(Debug)]
pub struct Socket {
  inner: MaybeTlsStream,
  target: String,
}

impl Socket {
  pub(crate) fn new(inner: MaybeTlsStream, target: String) -> Self {
    Self { inner, target }
  }

  /// `host:port` this socket was dialed for, regardless of any upstream proxy in between.
  pub fn target(&self) -> &str {
    &self.target
  }

  /// Whether the stream is wrapped in TLS.
  pub fn is_tls(&self) -> bool {
    matches!(self.inner, MaybeTlsStream::Tls(_))
  }

  /// ALPN protocol agreed with the origin, if any.
  pub fn alpn_protocol(&self) -> Option<&[u8]> {
    match &self.inner {
      MaybeTlsStream::Tcp(_) => None,
      MaybeTlsStream::Tls(stream) => stream.get_ref().1.alpn_protocol(),
    }
  }

  /// Run a TLS client handshake over the plain stream.
  ///
  /// A stream that is already TLS is returned as is.
  pub(crate) async fn tls<F, Fut>(self, func: F) -> Result<Self, Error>
  where
    F: FnOnce(TcpStream) -> Fut,
    Fut: std::future::Future<Output = Result<client::TlsStream<TcpStream>, Error>>,
  {
    let inner = match self.inner {
      MaybeTlsStream::Tcp(t) => MaybeTlsStream::Tls(Box::new(func(t).await?)),
      tls => tls,
    };
    Ok(Self {
      inner,
      target: self.target,
    })
  }
}

/// Plain or TLS wrapped upstream stream
#[derive(Debug)]
pub enum MaybeTlsStream {
  /// TCP
  Tcp(TcpStream),
  /// TLS
  Tls(Box<client::TlsStream<TcpStream>>),
}

impl ProxyStream for Socket {
  fn tcp_stream(&self) -> Option<&TcpStream> {
    Some(self.inner.deref())
  }
}

impl AsyncRead for Socket {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl AsyncWrite for Socket {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for MaybeTlsStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
    }
  }
}

// 直接暴露底层TCP socket
impl Deref for MaybeTlsStream {
  type Target = TcpStream;

  fn deref(&self) -> &Self::Target {
    match self {
      MaybeTlsStream::Tcp(s) => s,
      MaybeTlsStream::Tls(t) => t.get_ref().0,
    }
  }
}
