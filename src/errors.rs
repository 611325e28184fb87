//! Error types for the stream proxy

use std::io;
use thiserror::Error as ThisError;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that may occur while proxying, issuing certificates or tapping traffic.
#[derive(ThisError, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(#[from] io::Error),

  /// Certificate generation, loading or persistence failed
  #[error("Certificate error: {0}")]
  Certificate(String),

  /// TLS configuration or handshake failed
  #[error("TLS error: {0}")]
  Tls(String),

  /// Upstream proxy handshake failed
  #[error("Proxy error: {0}")]
  Proxy(String),

  /// Malformed inbound request line or CONNECT target
  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  /// Dialing the upstream failed
  #[error("Connection error: {0}")]
  Connection(String),

  /// The interceptor could not make sense of a body
  #[error("Interceptor error: {0}")]
  Interceptor(String),

  /// SOCKS5 reply error
  #[error(transparent)]
  Reply(#[from] ReplyError),

  /// Other errors
  #[error("{0}")]
  Other(String),
}

/// Failure replies a SOCKS5 upstream may send.
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyError {
  /// General SOCKS server failure
  #[error("General failure")]
  GeneralFailure,
  /// Connection not allowed by ruleset
  #[error("Connection not allowed by ruleset")]
  ConnectionNotAllowed,
  /// Network unreachable
  #[error("Network unreachable")]
  NetworkUnreachable,
  /// Host unreachable
  #[error("Host unreachable")]
  HostUnreachable,
  /// Connection refused
  #[error("Connection refused")]
  ConnectionRefused,
  /// TTL expired
  #[error("TTL expired")]
  TtlExpired,
  /// Command not supported
  #[error("Command not supported")]
  CommandNotSupported,
  /// Address type not supported
  #[error("Address type not supported")]
  AddressTypeNotSupported,
  /// Reply code outside the RFC 1928 table
  #[error("Unknown reply code {0}")]
  Unknown(u8),
}

impl Error {
  /// Create a certificate error
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    Error::Certificate(msg.into())
  }

  /// Create a TLS error
  pub fn tls_error(msg: impl Into<String>) -> Self {
    Error::Tls(msg.into())
  }

  /// Create an upstream proxy error
  pub fn proxy_error(msg: impl Into<String>) -> Self {
    Error::Proxy(msg.into())
  }

  /// Create an invalid request error
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    Error::InvalidRequest(msg.into())
  }

  /// Create a connection error
  pub fn connection_error(msg: impl Into<String>) -> Self {
    Error::Connection(msg.into())
  }

  /// Create an interceptor error
  pub fn interceptor_error(msg: impl Into<String>) -> Self {
    Error::Interceptor(msg.into())
  }

  /// Create an other error
  pub fn other(msg: impl Into<String>) -> Self {
    Error::Other(msg.into())
  }

  /// True when the error is a peer going away rather than a real failure.
  ///
  /// Resets, broken pipes and truncated TLS records are how browsers routinely
  /// drop keep-alive tunnels, so the relay treats them like a clean EOF.
  pub fn is_disconnect(&self) -> bool {
    match self {
      Error::Io(e) => is_disconnect(e),
      _ => false,
    }
  }
}

/// See [`Error::is_disconnect`].
pub fn is_disconnect(e: &io::Error) -> bool {
  matches!(
    e.kind(),
    io::ErrorKind::ConnectionReset
      | io::ErrorKind::ConnectionAborted
      | io::ErrorKind::BrokenPipe
      | io::ErrorKind::UnexpectedEof
      | io::ErrorKind::NotConnected
  )
}

pub(crate) fn new_io_error(error_kind: io::ErrorKind, msg: &str) -> Error {
  Error::Io(io::Error::new(error_kind, msg))
}

impl From<u8> for ReplyError {
  fn from(value: u8) -> Self {
    match value {
      0x01 => ReplyError::GeneralFailure,
      0x02 => ReplyError::ConnectionNotAllowed,
      0x03 => ReplyError::NetworkUnreachable,
      0x04 => ReplyError::HostUnreachable,
      0x05 => ReplyError::ConnectionRefused,
      0x06 => ReplyError::TtlExpired,
      0x07 => ReplyError::CommandNotSupported,
      0x08 => ReplyError::AddressTypeNotSupported,
      other => ReplyError::Unknown(other),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn disconnect_kinds_are_benign() {
    let reset: Error = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
    assert!(reset.is_disconnect());
    let refused: Error = io::Error::new(io::ErrorKind::ConnectionRefused, "refused").into();
    assert!(!refused.is_disconnect());
    assert!(!Error::tls_error("bad record").is_disconnect());
  }

  #[test]
  fn reply_codes_map() {
    assert_eq!(ReplyError::from(0x05), ReplyError::ConnectionRefused);
    assert_eq!(ReplyError::from(0x42), ReplyError::Unknown(0x42));
  }
}
