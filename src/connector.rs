use crate::config::ProxyConfig;
use crate::errors::{Error, Result};
use crate::proxy::UpstreamProxy;
use crate::socket::{MaybeTlsStream, Socket};
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::rustls;
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::TlsConnector;

/// The process wide rustls provider, falling back to ring.
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// ConnectorBuilder
#[derive(Clone, Debug)]
pub struct ConnectorBuilder {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  proxy: Option<UpstreamProxy>,
  certificates: Vec<CertificateDer<'static>>,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: true,
      proxy: None,
      certificates: vec![],
    }
  }
}

impl ConnectorBuilder {
  /// Set a timeout for the whole dial: TCP connect, upstream proxy handshake
  /// and TLS handshake.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }
  /// Set that all sockets have `SO_NODELAY` set to the supplied value `nodelay`.
  ///
  /// Default is `true`; the relay forwards small streamed chunks.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }
  /// Dial every origin through this upstream proxy.
  pub fn proxy(mut self, proxy: Option<UpstreamProxy>) -> ConnectorBuilder {
    self.proxy = proxy;
    self
  }
  /// Trust `cert` in addition to the bundled web PKI roots.
  pub fn add_root_certificate(mut self, cert: CertificateDer<'static>) -> ConnectorBuilder {
    self.certificates.push(cert);
    self
  }

  /// Combine the configuration of this builder with a connector to create a `ProxyConnector`.
  pub fn build(&self) -> Result<ProxyConnector> {
    let mut root_cert_store = rustls::RootCertStore::empty();
    root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    for cert in &self.certificates {
      root_cert_store
        .add(cert.clone())
        .map_err(|e| Error::tls_error(format!("Failed to add root certificate: {}", e)))?;
    }
    let mut config = rustls::ClientConfig::builder_with_provider(crypto_provider())
      .with_safe_default_protocol_versions()
      .map_err(|e| Error::tls_error(format!("invalid TLS versions: {}", e)))?
      .with_root_certificates(root_cert_store)
      .with_no_client_auth();
    // The relay recovers HTTP/1.x framing byte by byte, so never negotiate h2.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(ProxyConnector {
      connect_timeout: self.connect_timeout,
      nodelay: self.nodelay,
      proxy: self.proxy.clone(),
      tls: TlsConnector::from(Arc::new(config)),
    })
  }
}

/// Opens the real upstream connection for an exchange.
///
/// The connection goes directly to the origin or through the configured
/// upstream proxy, and is optionally wrapped in TLS with standard web PKI
/// verification. Callers get the same [`Socket`] either way.
#[derive(Clone)]
pub struct ProxyConnector {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  proxy: Option<UpstreamProxy>,
  tls: TlsConnector,
}

impl std::fmt::Debug for ProxyConnector {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ProxyConnector")
      .field("connect_timeout", &self.connect_timeout)
      .field("nodelay", &self.nodelay)
      .field("proxy", &self.proxy)
      .finish()
  }
}

impl ProxyConnector {
  /// Start building a connector.
  pub fn builder() -> ConnectorBuilder {
    ConnectorBuilder::default()
  }

  /// Connector using the upstream proxy and connect timeout from `config`.
  pub fn from_config(config: &ProxyConfig) -> Result<Self> {
    Self::builder()
      .proxy(config.upstream_proxy.clone())
      .connect_timeout(config.connect_timeout)
      .build()
  }

  /// The upstream proxy every dial goes through, if any.
  pub fn upstream_proxy(&self) -> Option<&UpstreamProxy> {
    self.proxy.as_ref()
  }

  /// Connect to `host:port`, with TLS toward the origin when `tls` is set.
  ///
  /// Every failure (resolution, refusal, proxy handshake, TLS handshake or
  /// timeout) comes back as [`Error::Connection`].
  pub async fn connect(&self, host: &str, port: u16, tls: bool) -> Result<Socket> {
    let dial = self.dial(host, port, tls);
    let socket = match self.connect_timeout {
      None => dial.await,
      Some(timeout) => tokio::time::timeout(timeout, dial)
        .await
        .unwrap_or_else(|_| Err(Error::other("timed out"))),
    };
    socket.map_err(|e| Error::connection_error(format!("{}:{}: {}", host, port, e)))
  }

  async fn dial(&self, host: &str, port: u16, tls: bool) -> Result<Socket> {
    let target = crate::proxy::format_host_port(host, port);
    let stream = match &self.proxy {
      None => self.connect_host(host, port).await?,
      Some(proxy) => {
        let (proxy_host, proxy_port) = proxy.endpoint();
        tracing::debug!("[Proxy] Dialing {} via {}", target, proxy.uri());
        let mut stream = self.connect_host(proxy_host, proxy_port).await?;
        proxy.establish(&mut stream, host, port).await?;
        stream
      }
    };
    let socket = Socket::new(MaybeTlsStream::Tcp(stream), target);
    if !tls {
      return Ok(socket);
    }
    let domain = ServerName::try_from(host.trim_start_matches('[').trim_end_matches(']').to_owned())
      .map_err(|e| Error::tls_error(format!("invalid server name {}: {}", host, e)))?;
    let connector = self.tls.clone();
    let socket = socket
      .tls(move |t| async move { connector.connect(domain, t).await })
      .await?;
    Ok(socket)
  }

  /// Resolve `host` and try each address in turn.
  async fn connect_host(&self, host: &str, port: u16) -> Result<TcpStream> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let mut last_error = None;
    for addr in tokio::net::lookup_host((host, port)).await? {
      match self.connect_with_addr(addr).await {
        Ok(stream) => return Ok(stream),
        Err(e) => last_error = Some(e),
      }
    }
    Err(last_error.unwrap_or_else(|| Error::other(format!("{} did not resolve", host))))
  }

  /// Connect to a remote endpoint with addr
  async fn connect_with_addr(&self, addr: SocketAddr) -> Result<TcpStream> {
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(true)?;
    }
    Ok(socket.connect(addr).await?)
  }
}
