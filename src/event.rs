//! Messages published to the consumer of tapped traffic

use crate::interceptor::InterceptorResult;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

/// Sent once the listener is bound and accepting connections.
pub const READY: &str = "READY";

/// One published observation of a tapped exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
  /// The interceptor's reading of the response so far
  Data {
    /// Wall clock time of the tapped request, in seconds since the epoch
    ts: f64,
    /// Interceptor output
    data: InterceptorResult,
  },
  /// The upstream answered the tapped request with an HTTP error
  Error {
    /// Always `true`
    error: bool,
    /// HTTP status code
    status: u16,
    /// `"<status> <reason phrase>"`
    message: String,
    /// Always `true`; nothing follows an error
    done: bool,
  },
}

impl Envelope {
  /// Success envelope.
  pub fn data(ts: f64, data: InterceptorResult) -> Self {
    Envelope::Data { ts, data }
  }

  /// Error envelope for an upstream status of 400 or above.
  pub fn upstream_error(status: u16, reason: &str) -> Self {
    Envelope::Error {
      error: true,
      status,
      message: format!("{} {}", status, reason),
      done: true,
    }
  }

  /// Whether this is the last envelope of its stream.
  pub fn is_done(&self) -> bool {
    match self {
      Envelope::Data { data, .. } => data.done,
      Envelope::Error { done, .. } => *done,
    }
  }
}

/// The optional sink envelopes are published to.
///
/// Each publish is one complete JSON string, so concurrent exchanges never
/// interleave partial messages. Without a sink every publish is a no-op.
#[derive(Debug, Clone, Default)]
pub struct OutputQueue {
  sender: Option<UnboundedSender<String>>,
}

impl OutputQueue {
  /// Queue backed by `sender`.
  pub fn new(sender: UnboundedSender<String>) -> Self {
    Self {
      sender: Some(sender),
    }
  }

  /// Queue that drops everything.
  pub fn disabled() -> Self {
    Self::default()
  }

  /// Whether anything is listening.
  pub fn is_enabled(&self) -> bool {
    self.sender.is_some()
  }

  /// Publish the startup signal.
  pub fn ready(&self) {
    self.send(READY.to_string());
  }

  /// Publish an envelope as JSON.
  pub fn publish(&self, envelope: &Envelope) {
    if self.sender.is_none() {
      return;
    }
    match serde_json::to_string(envelope) {
      Ok(message) => self.send(message),
      Err(e) => tracing::error!("[Proxy] Failed to encode envelope: {}", e),
    }
  }

  fn send(&self, message: String) {
    if let Some(sender) = &self.sender {
      if sender.send(message).is_err() {
        tracing::debug!("[Proxy] Output queue closed, dropping message");
      }
    }
  }
}

impl From<UnboundedSender<String>> for OutputQueue {
  fn from(sender: UnboundedSender<String>) -> Self {
    Self::new(sender)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::interceptor::FunctionCall;
  use serde_json::json;

  #[test]
  fn error_envelope_shape() {
    let value = serde_json::to_value(Envelope::upstream_error(404, "Not Found")).unwrap();
    assert_eq!(
      value,
      json!({"error": true, "status": 404, "message": "404 Not Found", "done": true})
    );
  }

  #[test]
  fn data_envelope_shape() {
    let result = InterceptorResult {
      reason: "thinking".into(),
      body: "Hello".into(),
      function: vec![FunctionCall {
        name: "lookup".into(),
        params: json!({"q": "rust"}),
      }],
      done: true,
    };
    let value = serde_json::to_value(Envelope::data(1.5, result)).unwrap();
    assert_eq!(
      value,
      json!({
        "ts": 1.5,
        "data": {
          "reason": "thinking",
          "body": "Hello",
          "function": [{"name": "lookup", "params": {"q": "rust"}}],
          "done": true
        }
      })
    );
  }

  #[test]
  fn envelopes_parse_back() {
    let raw = r#"{"error":true,"status":503,"message":"503 Service Unavailable","done":true}"#;
    let envelope: Envelope = serde_json::from_str(raw).unwrap();
    assert!(envelope.is_done());
    assert!(matches!(envelope, Envelope::Error { status: 503, .. }));
  }

  #[tokio::test]
  async fn queue_delivers_whole_messages() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let queue = OutputQueue::new(tx);
    queue.ready();
    queue.publish(&Envelope::upstream_error(500, "Internal Server Error"));
    assert_eq!(rx.recv().await.unwrap(), READY);
    let message = rx.recv().await.unwrap();
    assert!(message.starts_with('{') && message.ends_with('}'));
  }

  #[test]
  fn disabled_queue_is_a_noop() {
    let queue = OutputQueue::disabled();
    assert!(!queue.is_enabled());
    queue.ready();
    queue.publish(&Envelope::upstream_error(400, "Bad Request"));
  }
}
