//! The intercepting proxy server
//!
//! Accepts forward-proxy `CONNECT` tunnels. Tunnels to hosts the
//! [`DomainPolicy`] selects are decrypted with a leaf certificate from the
//! [`CertificateManager`] and relayed with sniffing; everything else is
//! relayed opaquely.

use crate::ca::CertificateManager;
use crate::config::ProxyConfig;
use crate::connector::ProxyConnector;
use crate::errors::{Error, Result};
use crate::event::{Envelope, OutputQueue};
use crate::framing::{self, ResponseHead, LAST_CHUNK};
use crate::interceptor::{HttpInterceptor, InterceptorFactory, StreamInterceptor};
use crate::policy::DomainPolicy;
use crate::socket::{safe_close, ProxyStream};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
/// Bytes read per relay step, and the cap on what is discarded after a CONNECT.
const CHUNK_SIZE: usize = 8192;
const MAX_REQUEST_LINE: usize = 8192;

/// MITM proxy server
#[derive(Clone)]
pub struct ProxyServer {
  config: Arc<ProxyConfig>,
  policy: Arc<DomainPolicy>,
  certs: Arc<CertificateManager>,
  connector: Arc<ProxyConnector>,
  interceptor: InterceptorFactory,
  queue: OutputQueue,
}

impl ProxyServer {
  /// Create a server from `config`.
  ///
  /// Loads or generates the root CA under `config.cert_dir`. Nothing is bound
  /// until [`ProxyServer::bind`] or [`ProxyServer::start`].
  pub async fn new(config: ProxyConfig) -> Result<Self> {
    let certs = CertificateManager::new(&config.cert_dir).await?;
    let connector = ProxyConnector::from_config(&config)?;
    let interceptor = StreamInterceptor::factory(&config.log_dir, config.dump_streams);
    Ok(Self {
      policy: Arc::new(config.policy()),
      config: Arc::new(config),
      certs: Arc::new(certs),
      connector: Arc::new(connector),
      interceptor,
      queue: OutputQueue::disabled(),
    })
  }

  /// Publish the ready signal and envelopes to `queue`.
  pub fn with_queue(mut self, queue: impl Into<OutputQueue>) -> Self {
    self.queue = queue.into();
    self
  }

  /// Dial upstreams with `connector` instead of one built from the config.
  pub fn with_connector(mut self, connector: ProxyConnector) -> Self {
    self.connector = Arc::new(connector);
    self
  }

  /// Tap intercepted exchanges with interceptors built by `factory`.
  pub fn with_interceptor(mut self, factory: InterceptorFactory) -> Self {
    self.interceptor = factory;
    self
  }

  /// Configuration this server was built with
  pub fn config(&self) -> &ProxyConfig {
    &self.config
  }

  /// Certificate manager issuing leaves for intercepted hosts
  pub fn certificates(&self) -> &CertificateManager {
    &self.certs
  }

  /// Whether a tunnel to `host` would be decrypted.
  pub fn should_intercept(&self, host: &str) -> bool {
    self.policy.should_intercept(host)
  }

  /// Bind the listening socket and publish the ready signal.
  pub async fn bind(&self) -> Result<TcpListener> {
    let listener = TcpListener::bind(self.config.bind_addr()).await?;
    tracing::info!("[Proxy] Serving on {}", listener.local_addr()?);
    tracing::info!(
      "[Proxy] Intercepting {:?}, passing through {:?}",
      self.policy.intercept(),
      self.policy.passthrough()
    );
    if let Some(proxy) = self.connector.upstream_proxy() {
      tracing::info!("[Proxy] Dialing upstreams via {}", proxy.uri());
    }
    self.queue.ready();
    Ok(listener)
  }

  /// Bind, signal ready, then serve until the process ends.
  pub async fn start(&self) -> Result<()> {
    let listener = self.bind().await?;
    self.serve(listener, std::future::pending()).await
  }

  /// Accept connections on `listener` until `shutdown` resolves.
  ///
  /// Every connection is handled on its own task in a set owned by this
  /// call; on shutdown the set is aborted and awaited before returning.
  pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
  where
    F: Future<Output = ()>,
  {
    let mut tasks = JoinSet::new();
    tokio::pin!(shutdown);
    loop {
      tokio::select! {
        _ = &mut shutdown => break,
        accepted = listener.accept() => match accepted {
          Ok((stream, peer)) => {
            tracing::debug!("[Proxy] Connection from {}", peer);
            let server = self.clone();
            tasks.spawn(async move { server.handle_client(stream, peer).await });
          }
          Err(e) => tracing::warn!("[Proxy] Accept failed: {}", e),
        },
        Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
          if let Err(e) = joined {
            if e.is_panic() {
              tracing::error!("[Proxy] Connection handler panicked: {}", e);
            }
          }
        }
      }
    }
    tracing::info!("[Proxy] Shutting down with {} open connection(s)", tasks.len());
    tasks.shutdown().await;
    Ok(())
  }

  /// Handle one accepted connection from start to close.
  async fn handle_client(self, mut client: TcpStream, peer: SocketAddr) {
    match self.dispatch(&mut client).await {
      Ok(()) => {}
      Err(Error::InvalidRequest(msg)) => tracing::debug!("[Proxy] Dropping {}: {}", peer, msg),
      Err(e) if e.is_disconnect() => tracing::debug!("[Proxy] {} went away: {}", peer, e),
      Err(e) => tracing::error!("[Proxy] {}: {}", peer, e),
    }
    safe_close(&mut client).await;
  }

  async fn dispatch(&self, client: &mut TcpStream) -> Result<()> {
    let line = before_relay(self.config.idle_timeout, read_request_line(client), || {
      Error::invalid_request("no request line before the idle timeout")
    })
    .await?;
    let mut parts = line.split(' ');
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
      return Err(Error::invalid_request(format!("malformed request line {:?}", line)));
    };
    if method != "CONNECT" {
      return Err(Error::invalid_request(format!("unsupported method {}", method)));
    }
    self.handle_connect(client, target).await
  }

  async fn handle_connect(&self, client: &mut TcpStream, target: &str) -> Result<()> {
    let (host, port) = parse_host_port(target)?;
    if self.policy.should_intercept(&host) {
      self.intercept(client, &host, port).await
    } else {
      self.tunnel(client, &host, port).await
    }
  }

  /// Opaque tunnel: bytes are relayed untouched in both directions.
  async fn tunnel(&self, client: &mut TcpStream, host: &str, port: u16) -> Result<()> {
    tracing::debug!("[Proxy] Tunnelling {}:{}", host, port);
    before_relay(self.config.idle_timeout, acknowledge_connect(&mut *client), || {
      Error::invalid_request("CONNECT headers not finished before the idle timeout")
    })
    .await?;
    let mut upstream = self.connector.connect(host, port, false).await?;
    relay_opaque(client, &mut upstream, self.config.idle_timeout).await;
    safe_close(&mut upstream).await;
    Ok(())
  }

  /// Decrypt the tunnel in place and relay it with sniffing.
  async fn intercept(&self, client: &mut TcpStream, host: &str, port: u16) -> Result<()> {
    let record = self.certs.ensure_cert(host).await?;
    let acceptor = TlsAcceptor::from(record.server_config());
    let upgrade = async move {
      acknowledge_connect(&mut *client).await?;
      acceptor
        .accept(client)
        .await
        .map_err(|e| Error::tls_error(format!("client handshake for {}: {}", host, e)))
    };
    let mut tls = before_relay(self.config.idle_timeout, upgrade, || {
      Error::tls_error(format!("client handshake for {} timed out", host))
    })
    .await?;
    tracing::debug!("[Proxy] Intercepting {}:{}", host, port);

    let mut upstream = match self.connector.connect(host, port, true).await {
      Ok(upstream) => upstream,
      Err(e) => {
        safe_close(&mut tls).await;
        return Err(e);
      }
    };

    let exchange = Exchange::new(host, &self.config.tap_markers, (self.interceptor)());
    relay_sniffing(&mut tls, &mut upstream, &exchange, &self.queue, self.config.idle_timeout).await;
    safe_close(&mut upstream).await;
    safe_close(&mut tls).await;
    Ok(())
  }
}

/// Run a step that comes before the relay under the idle limit.
async fn before_relay<T, F, E>(idle: Option<Duration>, step: F, elapsed: E) -> Result<T>
where
  F: Future<Output = Result<T>>,
  E: FnOnce() -> Error,
{
  match idle {
    None => step.await,
    Some(limit) => tokio::time::timeout(limit, step)
      .await
      .unwrap_or_else(|_| Err(elapsed())),
  }
}

/// Read the request line one byte at a time so that nothing after it is consumed.
async fn read_request_line<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String> {
  let mut line = Vec::with_capacity(128);
  let mut byte = [0u8; 1];
  loop {
    if stream.read(&mut byte).await? == 0 || byte[0] == b'\n' {
      break;
    }
    line.push(byte[0]);
    if line.len() > MAX_REQUEST_LINE {
      return Err(Error::invalid_request("request line too long"));
    }
  }
  Ok(String::from_utf8_lossy(&line).trim().to_string())
}

/// Answer the CONNECT, then throw away the rest of the CONNECT request.
///
/// The discard stops at the blank line ending the header block (or after
/// 8 KiB), so a TLS ClientHello sent right behind it stays in the socket.
async fn acknowledge_connect<S>(client: &mut S) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  client.write_all(CONNECT_ESTABLISHED).await?;
  client.flush().await?;

  // the request line's own line break
  let mut tail = b"\r\n".to_vec();
  let mut byte = [0u8; 1];
  while tail.len() - 2 < CHUNK_SIZE && !tail.ends_with(b"\r\n\r\n") && !tail.ends_with(b"\n\n") {
    if client.read(&mut byte).await? == 0 {
      break;
    }
    tail.push(byte[0]);
  }
  tracing::trace!("[Proxy] Discarded {} byte(s) after CONNECT", tail.len() - 2);
  Ok(())
}

/// Split a CONNECT target into host and port. IPv6 brackets are removed.
pub(crate) fn parse_host_port(target: &str) -> Result<(String, u16)> {
  let (host, port) = target
    .rsplit_once(':')
    .ok_or_else(|| Error::invalid_request(format!("CONNECT target without port: {}", target)))?;
  let port = port
    .parse::<u16>()
    .map_err(|_| Error::invalid_request(format!("bad port in CONNECT target: {}", target)))?;
  let host = host.trim_start_matches('[').trim_end_matches(']');
  if host.is_empty() {
    return Err(Error::invalid_request(format!("CONNECT target without host: {}", target)));
  }
  Ok((host.to_string(), port))
}

fn unix_now() -> f64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_secs_f64())
    .unwrap_or_default()
}

/// Last traffic seen in either direction of one exchange.
struct Activity {
  timeout: Option<Duration>,
  last: Mutex<Instant>,
}

impl Activity {
  fn new(timeout: Option<Duration>) -> Self {
    Self {
      timeout,
      last: Mutex::new(Instant::now()),
    }
  }

  fn touch(&self) {
    if let Ok(mut last) = self.last.lock() {
      *last = Instant::now();
    }
  }

  fn deadline(&self, timeout: Duration) -> Instant {
    self.last.lock().map(|last| *last).unwrap_or_else(|_| Instant::now()) + timeout
  }

  /// Read one chunk. Returns `0` on EOF and when both directions have been idle too long.
  async fn read<R: AsyncRead + Unpin>(&self, reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let Some(timeout) = self.timeout else {
      return reader.read(buf).await;
    };
    loop {
      let deadline = self.deadline(timeout);
      match tokio::time::timeout_at(deadline.into(), reader.read(buf)).await {
        Ok(read) => {
          self.touch();
          return read;
        }
        // the other direction may have moved in the meantime
        Err(_) if self.deadline(timeout) > Instant::now() => continue,
        Err(_) => {
          tracing::debug!("[Proxy] Idle for {:?}, closing", timeout);
          return Ok(0);
        }
      }
    }
  }
}

fn log_pump_end(direction: &str, result: Result<()>) {
  match result {
    Ok(()) => tracing::debug!("[Proxy] {} closed", direction),
    Err(e) if e.is_disconnect() => tracing::debug!("[Proxy] {} reset: {}", direction, e),
    Err(e) => tracing::error!("[Proxy] Error forwarding {}: {}", direction, e),
  }
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, activity: &Activity) -> Result<()>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut buf = vec![0u8; CHUNK_SIZE];
  loop {
    let n = activity.read(reader, &mut buf).await?;
    if n == 0 {
      return Ok(());
    }
    writer.write_all(&buf[..n]).await?;
    writer.flush().await?;
  }
}

/// Relay both directions untouched until either one ends.
async fn relay_opaque<C, U>(client: &mut C, upstream: &mut U, idle: Option<Duration>)
where
  C: ProxyStream,
  U: ProxyStream,
{
  let activity = Activity::new(idle);
  let (mut client_read, mut client_write) = tokio::io::split(client);
  let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);
  tokio::select! {
    r = pump(&mut client_read, &mut upstream_write, &activity) => log_pump_end("client -> upstream", r),
    r = pump(&mut upstream_read, &mut client_write, &activity) => log_pump_end("upstream -> client", r),
  }
}

/// State shared by the two pumps of one intercepted exchange.
struct Exchange<'a> {
  host: &'a str,
  markers: &'a [String],
  should_sniff: AtomicBool,
  /// `f64` seconds since the epoch, as bits
  request_ts: AtomicU64,
  interceptor: tokio::sync::Mutex<Box<dyn HttpInterceptor>>,
}

impl<'a> Exchange<'a> {
  fn new(host: &'a str, markers: &'a [String], interceptor: Box<dyn HttpInterceptor>) -> Self {
    Self {
      host,
      markers,
      should_sniff: AtomicBool::new(false),
      request_ts: AtomicU64::new(0f64.to_bits()),
      interceptor: tokio::sync::Mutex::new(interceptor),
    }
  }

  fn sniffing(&self) -> bool {
    self.should_sniff.load(Ordering::Acquire)
  }

  fn request_ts(&self) -> f64 {
    f64::from_bits(self.request_ts.load(Ordering::Acquire))
  }

  /// Look at a request head. Returns the bytes to send instead of `buf`, if any.
  async fn on_request(&self, buf: &[u8], header_end: usize) -> Option<Vec<u8>> {
    let (head, body) = buf.split_at(header_end);
    let path = framing::request_path(head)?;
    if !self.markers.iter().any(|m| path.contains(m.as_str())) {
      self.should_sniff.store(false, Ordering::Release);
      return None;
    }
    self.should_sniff.store(true, Ordering::Release);
    self.request_ts.store(unix_now().to_bits(), Ordering::Release);
    tracing::debug!("[Tap] {} {}", self.host, path);

    let mut interceptor = self.interceptor.lock().await;
    interceptor.reset_for_new_request();
    match interceptor.process_request(body, self.host, path).await {
      Ok(body) => {
        let mut outgoing = Vec::with_capacity(head.len() + body.len());
        outgoing.extend_from_slice(head);
        outgoing.extend_from_slice(&body);
        Some(outgoing)
      }
      Err(e) => {
        tracing::warn!("[Tap] Request interceptor failed for {}: {}", self.host, e);
        None
      }
    }
  }

  /// Publish what the accumulated response says so far.
  async fn on_response(&self, side: &mut ResponseSide, queue: &OutputQueue) {
    let Some(head) = &side.head else {
      return;
    };
    if head.status >= 400 {
      if !side.error_reported {
        tracing::error!("[Tap] Upstream error {} {} from {}", head.status, head.reason, self.host);
        queue.publish(&Envelope::upstream_error(head.status, &head.reason));
        side.error_reported = true;
      }
      return;
    }
    let body = side.buffer.get(head.body_start..).unwrap_or_default();
    let mut interceptor = self.interceptor.lock().await;
    match interceptor
      .process_response(body, self.host, "", &head.headers)
      .await
    {
      Ok(result) => {
        if result.done {
          tracing::debug!("[Tap] Stream complete from {} ({} body bytes)", self.host, body.len());
        }
        queue.publish(&Envelope::data(self.request_ts(), result));
      }
      Err(e) => tracing::warn!("[Tap] Response interceptor failed for {}: {}", self.host, e),
    }
  }
}

/// Server to client accumulation for one exchange.
#[derive(Default)]
struct ResponseSide {
  buffer: Vec<u8>,
  head: Option<ResponseHead>,
  error_reported: bool,
}

impl ResponseSide {
  fn reset(&mut self) {
    self.buffer.clear();
    self.head = None;
    self.error_reported = false;
  }
}

/// Client to server: only the chunk holding a request head is looked at.
async fn sniff_requests<R, W>(
  reader: &mut R,
  writer: &mut W,
  exchange: &Exchange<'_>,
  buffer: &mut Vec<u8>,
  activity: &Activity,
) -> Result<()>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut chunk = vec![0u8; CHUNK_SIZE];
  loop {
    let n = activity.read(reader, &mut chunk).await?;
    if n == 0 {
      return Ok(());
    }
    buffer.extend_from_slice(&chunk[..n]);
    let rewritten = match framing::header_end(buffer) {
      Some(end) => exchange.on_request(buffer, end).await,
      None => None,
    };
    writer
      .write_all(rewritten.as_deref().unwrap_or(buffer.as_slice()))
      .await?;
    writer.flush().await?;
    buffer.clear();
  }
}

/// Server to client: every chunk is forwarded as read; while sniffing, the
/// accumulated response is tapped first.
async fn sniff_responses<R, W>(
  reader: &mut R,
  writer: &mut W,
  exchange: &Exchange<'_>,
  side: &mut ResponseSide,
  queue: &OutputQueue,
  activity: &Activity,
) -> Result<()>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut chunk = vec![0u8; CHUNK_SIZE];
  loop {
    let n = activity.read(reader, &mut chunk).await?;
    if n == 0 {
      return Ok(());
    }
    side.buffer.extend_from_slice(&chunk[..n]);
    if side.head.is_none() {
      side.head = framing::header_end(&side.buffer).map(|end| ResponseHead::parse(&side.buffer[..end]));
    }
    if exchange.sniffing() {
      exchange.on_response(side, queue).await;
    }
    writer.write_all(&chunk[..n]).await?;
    writer.flush().await?;
    // The last-chunk marker is the only reset point, even while not sniffing:
    // non-chunked responses keep accumulating until the tunnel closes.
    // Earlier bytes were already searched.
    let from = side.buffer.len().saturating_sub(n + LAST_CHUNK.len() - 1);
    if framing::find(&side.buffer[from..], LAST_CHUNK).is_some() {
      side.reset();
    }
  }
}

/// Relay an intercepted exchange, tapping the responses to marker requests.
async fn relay_sniffing<C, U>(
  client: &mut C,
  upstream: &mut U,
  exchange: &Exchange<'_>,
  queue: &OutputQueue,
  idle: Option<Duration>,
) where
  C: ProxyStream,
  U: ProxyStream,
{
  let activity = Activity::new(idle);
  let mut requests = Vec::new();
  let mut responses = ResponseSide::default();
  let (mut client_read, mut client_write) = tokio::io::split(client);
  let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);
  tokio::select! {
    r = sniff_requests(&mut client_read, &mut upstream_write, exchange, &mut requests, &activity) => {
      log_pump_end("client -> upstream", r)
    }
    r = sniff_responses(&mut upstream_read, &mut client_write, exchange, &mut responses, queue, &activity) => {
      log_pump_end("upstream -> client", r)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::interceptor::InterceptorResult;
  use http::HeaderMap;
  use std::sync::atomic::AtomicUsize;

  #[test]
  fn connect_targets() {
    assert_eq!(parse_host_port("example.com:443").unwrap(), ("example.com".to_string(), 443));
    assert_eq!(parse_host_port("[::1]:8443").unwrap(), ("::1".to_string(), 8443));
    for bad in ["example.com", "example.com:https", ":443", "host:70000"] {
      assert!(matches!(parse_host_port(bad), Err(Error::InvalidRequest(_))), "{bad}");
    }
  }

  #[tokio::test]
  async fn request_line_stops_at_newline() {
    let (mut a, mut b) = tokio::io::duplex(64);
    b.write_all(b"CONNECT a.test:443 HTTP/1.1\r\nHost: a.test\r\n\r\n").await.unwrap();
    assert_eq!(read_request_line(&mut a).await.unwrap(), "CONNECT a.test:443 HTTP/1.1");
    let mut rest = [0u8; 16];
    let n = a.read(&mut rest).await.unwrap();
    assert!(rest[..n].starts_with(b"Host"));
  }

  #[tokio::test]
  async fn discard_keeps_bytes_after_the_header_block() {
    let (mut proxy, mut client) = tokio::io::duplex(256);
    client.write_all(b"Host: a.test:443\r\n\r\n\x16\x03\x01").await.unwrap();
    acknowledge_connect(&mut proxy).await.unwrap();
    let mut reply = [0u8; CONNECT_ESTABLISHED.len()];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, CONNECT_ESTABLISHED);
    let mut hello = [0u8; 3];
    proxy.read_exact(&mut hello).await.unwrap();
    assert_eq!(&hello, b"\x16\x03\x01");
  }

  #[tokio::test]
  async fn idle_guard_reports_eof() {
    let activity = Activity::new(Some(Duration::from_millis(50)));
    let (mut quiet, _peer) = tokio::io::duplex(16);
    let mut buf = [0u8; 4];
    assert_eq!(activity.read(&mut quiet, &mut buf).await.unwrap(), 0);
  }

  struct Counting {
    responses: Arc<AtomicUsize>,
  }

  #[async_trait::async_trait]
  impl HttpInterceptor for Counting {
    fn reset_for_new_request(&mut self) {}

    async fn process_request(&mut self, body: &[u8], _host: &str, _path: &str) -> Result<Vec<u8>> {
      let mut body = body.to_vec();
      body.extend_from_slice(b"+tapped");
      Ok(body)
    }

    async fn process_response(
      &mut self,
      body: &[u8],
      _host: &str,
      _path: &str,
      _headers: &HeaderMap,
    ) -> Result<InterceptorResult> {
      self.responses.fetch_add(1, Ordering::SeqCst);
      Ok(InterceptorResult {
        body: String::from_utf8_lossy(body).into_owned(),
        done: body.ends_with(b"0\r\n\r\n"),
        ..Default::default()
      })
    }
  }

  fn exchange<'a>(markers: &'a [String], responses: &Arc<AtomicUsize>) -> Exchange<'a> {
    Exchange::new(
      "tap.test",
      markers,
      Box::new(Counting {
        responses: responses.clone(),
      }),
    )
  }

  #[tokio::test]
  async fn marker_switches_sniffing_and_rewrites_body() {
    let markers = vec!["GenerateContent".to_string()];
    let calls = Arc::new(AtomicUsize::new(0));
    let exchange = exchange(&markers, &calls);

    let tapped = b"POST /x:streamGenerateContent HTTP/1.1\r\n\r\nbody";
    let out = exchange.on_request(tapped, tapped.len() - 4).await.unwrap();
    assert!(out.ends_with(b"body+tapped"));
    assert!(exchange.sniffing());
    assert!(exchange.request_ts() > 0.0);

    let plain = b"GET /other HTTP/1.1\r\n\r\n";
    assert!(exchange.on_request(plain, plain.len()).await.is_none());
    assert!(!exchange.sniffing());

    // not a request line: forwarded as is, sniff state untouched
    exchange.should_sniff.store(true, Ordering::Release);
    assert!(exchange.on_request(b"\x00\x01\r\n\r\n", 6).await.is_none());
    assert!(exchange.sniffing());
  }

  #[tokio::test]
  async fn error_status_is_published_once() {
    let markers = vec!["GenerateContent".to_string()];
    let calls = Arc::new(AtomicUsize::new(0));
    let exchange = exchange(&markers, &calls);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let queue = OutputQueue::new(tx);

    let mut side = ResponseSide::default();
    side.buffer = b"HTTP/1.1 404 Not Found\r\n\r\nmissing".to_vec();
    side.head = framing::header_end(&side.buffer).map(|end| ResponseHead::parse(&side.buffer[..end]));
    exchange.on_response(&mut side, &queue).await;
    exchange.on_response(&mut side, &queue).await;
    drop(queue);

    let first = rx.recv().await.unwrap();
    let envelope: Envelope = serde_json::from_str(&first).unwrap();
    assert_eq!(envelope, Envelope::upstream_error(404, "Not Found"));
    assert!(rx.recv().await.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }
}
