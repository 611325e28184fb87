#![deny(missing_docs)]

//! # stream-proxy
//!
//! An intercepting HTTPS proxy that sits between an automated browser and the
//! internet. It decrypts tunnels to selected hosts, taps one streaming RPC to
//! extract model output as it arrives, and forwards every byte to its real
//! destination unchanged.
//!
//! - Forward-proxy `CONNECT` tunnels, opaque or intercepted per [`DomainPolicy`]
//! - Root CA and per-host leaf certificates on disk ([`CertificateManager`])
//! - In-place TLS upgrade of the accepted client socket
//! - Upstream dialing directly or through an HTTP / SOCKS5 proxy ([`ProxyConnector`])
//! - Pluggable tap points ([`HttpInterceptor`]) publishing JSON [`Envelope`]s
//!
//! The root CA written to `ca.crt` must be trusted by the browser; installing
//! it is left to whoever launches the browser.
//!
//! ## Running a proxy
//!
//! ```no_run
//! use stream_proxy::{ProxyConfig, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//!   let server = ProxyServer::new(ProxyConfig::from_env()?).await?.with_queue(tx);
//!   tokio::spawn(async move {
//!     while let Some(message) = rx.recv().await {
//!       println!("{}", message);
//!     }
//!   });
//!   server.start().await?;
//!   Ok(())
//! }
//! ```
//!
//! ## Output queue
//!
//! Messages are strings: `READY` once the listener is bound, then one JSON
//! envelope per observation, either `{"ts": .., "data": {..}}` or
//! `{"error": true, "status": .., "message": "..", "done": true}`.

mod ca;
mod config;
mod connector;
mod errors;
mod event;
mod framing;
mod interceptor;
mod policy;
mod proxy;
mod server;
mod socket;

pub use ca::{CertRecord, CertificateAuthority, CertificateManager};
pub use config::{ProxyConfig, DEFAULT_PORT, DEFAULT_TAP_MARKERS};
pub use connector::{ConnectorBuilder, ProxyConnector};
pub use errors::{is_disconnect, Error, ReplyError, Result};
pub use event::{Envelope, OutputQueue, READY};
pub use interceptor::{
  FunctionCall, HttpInterceptor, InterceptorFactory, InterceptorResult, StreamInterceptor,
};
pub use policy::{DomainPolicy, DEFAULT_PASSTHROUGH_DOMAINS};
pub use proxy::{HttpProxy, Socks5Proxy, UpstreamProxy};
pub use server::ProxyServer;
pub use socket::{safe_close, MaybeTlsStream, ProxyStream, Socket};
