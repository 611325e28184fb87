//! Tap points for intercepted exchanges
//!
//! The relay hands an [`HttpInterceptor`] the body of every tapped request
//! and, on every inbound chunk, the whole response body received so far.
//! [`StreamInterceptor`] is the stock implementation: it recovers the
//! streamed model output (answer text, reasoning text and function calls)
//! from the backend's bracket-delimited JSON frames.

use crate::errors::{Error, Result};
use crate::framing;
use flate2::read::{GzDecoder, ZlibDecoder};
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::HeaderMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Decoded text that has not produced a frame is dropped past this size.
const MAX_BACKLOG: usize = 10 * 1024 * 1024;
/// Nesting levels peeled off function arguments before giving up.
const MAX_UNWRAP_DEPTH: usize = 10;

static FRAME_REGEX: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r#"\[\[\[null,.*?]],"model"]"#).unwrap());

/// Trait for tapping one intercepted exchange
///
/// Implementations never see sockets; they are handed bytes and return bytes
/// or a result. One instance serves one client connection.
#[async_trait::async_trait]
pub trait HttpInterceptor: Send + Sync {
  /// Forget everything about the previous tapped request on this connection.
  fn reset_for_new_request(&mut self);

  /// Inspect and optionally rewrite the body of a tapped request.
  ///
  /// Returning `body` unchanged is always valid.
  async fn process_request(&mut self, body: &[u8], host: &str, path: &str) -> Result<Vec<u8>>;

  /// Interpret the cumulative response body seen so far.
  async fn process_response(
    &mut self,
    body: &[u8],
    host: &str,
    path: &str,
    headers: &HeaderMap,
  ) -> Result<InterceptorResult>;
}

/// Builds a fresh interceptor for every intercepted connection.
pub type InterceptorFactory = Arc<dyn Fn() -> Box<dyn HttpInterceptor> + Send + Sync>;

/// What the interceptor made of the response so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterceptorResult {
  /// Reasoning text not reported by an earlier result of this exchange
  pub reason: String,
  /// Answer text not reported by an earlier result of this exchange
  pub body: String,
  /// Every distinct function call seen in this exchange so far
  pub function: Vec<FunctionCall>,
  /// The response body is complete
  pub done: bool,
}

/// A function call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
  /// Function name
  pub name: String,
  /// Decoded arguments, normally an object
  pub params: Value,
}

/// Extracts streamed model output from `GenerateContent` responses.
#[derive(Debug, Default)]
pub struct StreamInterceptor {
  log_dir: PathBuf,
  dump_streams: bool,
  /// Bytes of decoded text already scanned for frames
  scan_offset: usize,
  functions: Vec<FunctionCall>,
  seen_functions: HashSet<(String, String)>,
  dumped: bool,
}

impl StreamInterceptor {
  /// Interceptor writing any diagnostics under `log_dir`.
  pub fn new(log_dir: impl Into<PathBuf>) -> Self {
    Self {
      log_dir: log_dir.into(),
      ..Default::default()
    }
  }

  /// Write the decoded text of each completed stream to `<log_dir>/stream-<unix-ms>.txt`.
  pub fn dump_streams(mut self, value: bool) -> Self {
    self.dump_streams = value;
    self
  }

  /// Factory producing `StreamInterceptor`s with these settings.
  pub fn factory(log_dir: impl Into<PathBuf>, dump_streams: bool) -> InterceptorFactory {
    let log_dir = log_dir.into();
    Arc::new(move || Box::new(StreamInterceptor::new(log_dir.clone()).dump_streams(dump_streams)))
  }

  /// Scan `text` (the whole decoded body) for frames past the last scan.
  ///
  /// A backlog over [`MAX_BACKLOG`] with no complete frame is skipped and
  /// reported as [`Error::Interceptor`].
  fn scan(&mut self, text: &str, result: &mut InterceptorResult) -> Result<()> {
    let pending = match text.get(self.scan_offset..) {
      Some(pending) => pending,
      None => {
        // body restarted under us
        self.scan_offset = 0;
        text
      }
    };
    if pending.len() > MAX_BACKLOG {
      let dropped = pending.len();
      self.scan_offset = text.len();
      return Err(Error::interceptor_error(format!(
        "{} bytes without a complete frame, dropping them",
        dropped
      )));
    }
    let mut consumed = 0;
    for m in FRAME_REGEX.find_iter(pending) {
      consumed = m.end();
      match serde_json::from_str::<Value>(m.as_str()) {
        Ok(frame) => self.apply_frame(&frame, result),
        Err(e) => tracing::debug!("[Tap] Skipping unparsable frame: {}", e),
      }
    }
    self.scan_offset += consumed;
    Ok(())
  }

  fn apply_frame(&mut self, frame: &Value, result: &mut InterceptorResult) {
    let Some(payload) = frame
      .get(0)
      .and_then(|v| v.get(0))
      .and_then(Value::as_array)
    else {
      return;
    };
    match payload.len() {
      2 => {
        if let Some(text) = payload[1].as_str() {
          result.body.push_str(text);
        }
      }
      11 if payload[1].is_null() && payload[10].is_array() => self.add_function(&payload[10]),
      n if n > 2 => {
        if let Some(text) = payload[1].as_str() {
          result.reason.push_str(text);
        }
      }
      _ => {}
    }
  }

  fn add_function(&mut self, call: &Value) {
    let Some(name) = call.get(0).and_then(Value::as_str) else {
      tracing::debug!("[Tap] Function call without a name: {}", call);
      return;
    };
    let params = Value::Object(decode_params(call.get(1).unwrap_or(&Value::Null)));
    // serde_json maps are ordered, so this is a canonical form
    let key = (name.to_string(), params.to_string());
    if !self.seen_functions.insert(key) {
      tracing::trace!("[Tap] Duplicate function call {}", name);
      return;
    }
    if params.as_object().is_some_and(Map::is_empty) {
      tracing::debug!("[Tap] Function {} decoded with no arguments", name);
    }
    self.functions.push(FunctionCall {
      name: name.to_string(),
      params,
    });
  }

  async fn dump(&mut self, text: &str) {
    self.dumped = true;
    let millis = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_millis())
      .unwrap_or_default();
    let path = self.log_dir.join(format!("stream-{}.txt", millis));
    let written = async {
      tokio::fs::create_dir_all(&self.log_dir).await?;
      tokio::fs::write(&path, text.as_bytes()).await
    };
    match written.await {
      Ok(()) => tracing::debug!("[Tap] Stream written to {}", path.display()),
      Err(e) => tracing::warn!("[Tap] Failed to write {}: {}", path.display(), e),
    }
  }
}

#[async_trait::async_trait]
impl HttpInterceptor for StreamInterceptor {
  fn reset_for_new_request(&mut self) {
    self.scan_offset = 0;
    self.functions.clear();
    self.seen_functions.clear();
    self.dumped = false;
  }

  async fn process_request(&mut self, body: &[u8], host: &str, path: &str) -> Result<Vec<u8>> {
    tracing::debug!("[Tap] Request {}{} ({} body bytes)", host, path, body.len());
    Ok(body.to_vec())
  }

  async fn process_response(
    &mut self,
    body: &[u8],
    _host: &str,
    _path: &str,
    headers: &HeaderMap,
  ) -> Result<InterceptorResult> {
    let (payload, done) = unframe(body, headers);
    let decoded = decompress(&payload, headers);
    let text = match std::str::from_utf8(&decoded) {
      Ok(text) => text,
      // a multi-byte character split across reads, or not text at all
      Err(e) => std::str::from_utf8(&decoded[..e.valid_up_to()]).unwrap_or_default(),
    };

    let mut result = InterceptorResult {
      done,
      ..Default::default()
    };
    self.scan(text, &mut result)?;
    result.function = self.functions.clone();

    if done && self.dump_streams && !self.dumped {
      self.dump(text).await;
    }
    Ok(result)
  }
}

/// Strip the transfer framing, reporting whether the body is complete.
fn unframe(body: &[u8], headers: &HeaderMap) -> (Vec<u8>, bool) {
  let chunked = headers
    .get_all(TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .any(|v| v.to_ascii_lowercase().contains("chunked"));
  if chunked {
    return framing::decode_chunked(body);
  }
  let length = headers
    .get(CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.trim().parse::<usize>().ok());
  match length {
    Some(length) => (body[..length.min(body.len())].to_vec(), body.len() >= length),
    None => (body.to_vec(), false),
  }
}

/// Undo `Content-Encoding`, keeping whatever a truncated stream yields.
fn decompress(payload: &[u8], headers: &HeaderMap) -> Vec<u8> {
  let encoding = headers
    .get(CONTENT_ENCODING)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.trim().to_ascii_lowercase());
  let gzip_magic = payload.starts_with(&[0x1f, 0x8b]);
  let mut out = Vec::with_capacity(payload.len() * 4);
  let partial = match encoding.as_deref() {
    Some("gzip") | Some("x-gzip") => GzDecoder::new(payload).read_to_end(&mut out),
    Some("deflate") => ZlibDecoder::new(payload).read_to_end(&mut out),
    None if gzip_magic => GzDecoder::new(payload).read_to_end(&mut out),
    None | Some("identity") => return payload.to_vec(),
    Some(other) => {
      tracing::debug!("[Tap] Unsupported content encoding {}", other);
      return payload.to_vec();
    }
  };
  if let Err(e) = partial {
    tracing::trace!("[Tap] Partial decompression ({} bytes so far): {}", out.len(), e);
  }
  out
}

/// Decode a function call's argument list.
///
/// Arguments arrive as `[name, typed_value]` pairs, possibly wrapped in a few
/// extra list levels. The typed value's length tells its type: 1 null,
/// 2 number, 3 string, 4 boolean, 5 object, 6 array.
fn decode_params(args: &Value) -> Map<String, Value> {
  match unwrap_to_param_list(args) {
    Some(list) => decode_param_list(list),
    None => {
      tracing::debug!("[Tap] No parameter list in {}", args);
      Map::new()
    }
  }
}

fn decode_param_list(list: &[Value]) -> Map<String, Value> {
  let mut params = Map::new();
  for param in list {
    let Some((name, value)) = param
      .as_array()
      .filter(|p| p.len() >= 2)
      .and_then(|p| Some((p[0].as_str()?, &p[1])))
    else {
      continue;
    };
    params.insert(name.to_string(), decode_typed(value));
  }
  params
}

fn decode_typed(value: &Value) -> Value {
  let Some(v) = value.as_array() else {
    return value.clone();
  };
  match v.len() {
    1 => Value::Null,
    2 => v[1].clone(),
    3 => v[2].clone(),
    4 => Value::Bool(is_one(&v[3])),
    5 => Value::Object(decode_params(&v[4])),
    6 => match v[5].as_array() {
      Some(items) => Value::Array(items.iter().map(decode_array_item).collect()),
      None => Value::Array(vec![]),
    },
    n => {
      tracing::debug!("[Tap] Unknown typed value of length {}", n);
      value.clone()
    }
  }
}

/// Array elements use the same encoding but with wrapper levels of varying depth.
fn decode_array_item(item: &Value) -> Value {
  let Some(v) = item.as_array() else {
    return item.clone();
  };
  if v.is_empty() {
    return Value::Null;
  }
  if looks_like_param_list(v) {
    return Value::Object(decode_param_list(v));
  }
  let nested = v[0].is_array();
  match v.len() {
    1 if nested => decode_array_item(&v[0]),
    1 => Value::Null,
    2 if v[0].is_null() && !v[1].is_null() => v[1].clone(),
    3 if v[0].is_null() && v[1].is_null() => v[2].clone(),
    4 if v[..3].iter().all(Value::is_null) => Value::Bool(is_one(&v[3])),
    2..=4 if nested => decode_array_item(&v[0]),
    2 => v[1].clone(),
    3 => v[2].clone(),
    4 => Value::Bool(is_one(&v[3])),
    5 if v[4].is_null() => Value::Object(Map::new()),
    5 => Value::Object(decode_params(&v[4])),
    6 => match v[5].as_array() {
      Some(items) => Value::Array(items.iter().map(decode_array_item).collect()),
      None => Value::Array(vec![]),
    },
    _ if nested => decode_array_item(&v[0]),
    _ => item.clone(),
  }
}

/// Peel single leading list levels until a `[[name, value], ...]` list shows up.
fn unwrap_to_param_list(args: &Value) -> Option<&[Value]> {
  let mut current = args;
  for _ in 0..MAX_UNWRAP_DEPTH {
    let list = current.as_array().filter(|l| !l.is_empty())?;
    if looks_like_param_list(list) {
      return Some(list);
    }
    current = list[0].as_array().map(|_| &list[0])?;
  }
  tracing::warn!("[Tap] Gave up unwrapping arguments after {} levels", MAX_UNWRAP_DEPTH);
  None
}

fn looks_like_param_list(list: &[Value]) -> bool {
  list
    .first()
    .and_then(Value::as_array)
    .is_some_and(|first| first.len() >= 2 && first[0].is_string())
}

fn is_one(value: &Value) -> bool {
  value.as_f64() == Some(1.0) || value.as_bool() == Some(true)
}

#[cfg(test)]
mod tests {
  use super::*;
  use flate2::write::GzEncoder;
  use flate2::Compression;
  use http::HeaderValue;
  use serde_json::json;
  use std::io::Write;

  fn body_frame(text: &str) -> String {
    format!(r#"[[[null,{}]],"model"]"#, json!(text))
  }

  fn reason_frame(text: &str) -> String {
    format!(r#"[[[null,{},null,null,null,null,null,null,null,null,null,null,true]],"model"]"#, json!(text))
  }

  fn chunked(parts: &[&[u8]], last: bool) -> Vec<u8> {
    let mut out = Vec::new();
    for part in parts {
      out.extend_from_slice(format!("{:x}\r\n", part.len()).as_bytes());
      out.extend_from_slice(part);
      out.extend_from_slice(b"\r\n");
    }
    if last {
      out.extend_from_slice(b"0\r\n\r\n");
    }
    out
  }

  fn chunked_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    headers
  }

  #[tokio::test]
  async fn body_and_reason_are_reported_as_deltas() {
    let mut tap = StreamInterceptor::new("logs");
    tap.reset_for_new_request();
    let headers = chunked_headers();
    let first = body_frame("Hel");
    let second = format!("{},{}", reason_frame("thinking"), body_frame("lo"));

    let body = chunked(&[first.as_bytes()], false);
    let r1 = tap.process_response(&body, "h", "", &headers).await.unwrap();
    assert_eq!((r1.body.as_str(), r1.done), ("Hel", false));

    let body = chunked(&[first.as_bytes(), second.as_bytes()], true);
    let r2 = tap.process_response(&body, "h", "", &headers).await.unwrap();
    assert_eq!(r2.body, "lo");
    assert_eq!(r2.reason, "thinking");
    assert!(r2.done);
  }

  #[tokio::test]
  async fn gzip_body_decodes_while_partial() {
    let frames = format!("{}\n{}", body_frame("one"), body_frame("two"));
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(frames.as_bytes()).unwrap();
    let compressed = gz.finish().unwrap();

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(compressed.len()));

    let mut tap = StreamInterceptor::new("logs");
    let r = tap.process_response(&compressed, "h", "", &headers).await.unwrap();
    assert_eq!(r.body, "onetwo");
    assert!(r.done);
  }

  #[tokio::test]
  async fn function_calls_are_decoded_and_deduplicated() {
    let args = json!([[
      ["query", [null, null, "rust"]],
      ["limit", [null, 5]],
      ["exact", [null, null, null, 1]],
      ["filters", [null, null, null, null, [["lang", [null, null, "en"]]]]],
      ["tags", [null, null, null, null, null, [[null, null, "a"], [[null, 2]]]]],
      ["none", [null]]
    ]]);
    let payload = json!([null, null, null, null, null, null, null, null, null, null, ["search", args]]);
    let frame = format!(r#"[[{}],"model"]"#, payload);
    let text = format!("{0},{0}", frame);

    let mut tap = StreamInterceptor::new("logs");
    let r = tap
      .process_response(&chunked(&[text.as_bytes()], true), "h", "", &chunked_headers())
      .await
      .unwrap();
    assert_eq!(r.function.len(), 1);
    assert_eq!(r.function[0].name, "search");
    assert_eq!(
      r.function[0].params,
      json!({
        "query": "rust",
        "limit": 5,
        "exact": true,
        "filters": {"lang": "en"},
        "tags": ["a", 2],
        "none": null
      })
    );
  }

  #[tokio::test]
  async fn reset_starts_a_fresh_exchange() {
    let headers = chunked_headers();
    let frame = body_frame("again");
    let body = chunked(&[frame.as_bytes()], true);
    let mut tap = StreamInterceptor::new("logs");
    assert_eq!(tap.process_response(&body, "h", "", &headers).await.unwrap().body, "again");
    assert_eq!(tap.process_response(&body, "h", "", &headers).await.unwrap().body, "");
    tap.reset_for_new_request();
    assert_eq!(tap.process_response(&body, "h", "", &headers).await.unwrap().body, "again");
  }

  #[tokio::test]
  async fn request_body_passes_through() {
    let mut tap = StreamInterceptor::new("logs");
    let out = tap.process_request(b"[\"prompt\"]", "h", "/x").await.unwrap();
    assert_eq!(out, b"[\"prompt\"]");
  }

  #[tokio::test]
  async fn completed_stream_is_dumped_once() {
    let dir = std::env::temp_dir().join(format!("stream-proxy-dump-{}", std::process::id()));
    std::fs::remove_dir_all(&dir).ok();
    let mut tap = StreamInterceptor::new(&dir).dump_streams(true);
    let frame = body_frame("saved");
    let body = chunked(&[frame.as_bytes()], true);
    tap.process_response(&body, "h", "", &chunked_headers()).await.unwrap();
    tap.process_response(&body, "h", "", &chunked_headers()).await.unwrap();
    let files: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
    assert_eq!(files.len(), 1);
    std::fs::remove_dir_all(&dir).ok();
  }

  #[test]
  fn deep_wrappers_give_up() {
    let mut args = json!([["k", [null, 1]]]);
    for _ in 0..12 {
      args = json!([args]);
    }
    assert!(decode_params(&args).is_empty());
  }

  #[tokio::test]
  async fn oversized_backlog_is_an_interceptor_error() {
    let mut tap = StreamInterceptor::new("logs");
    let mut body = "x".repeat(MAX_BACKLOG + 1).into_bytes();
    let overflow = tap.process_response(&body, "h", "", &HeaderMap::new()).await;
    assert!(matches!(overflow, Err(Error::Interceptor(_))));

    // the dropped bytes are not rescanned, later frames still come through
    body.extend_from_slice(body_frame("after").as_bytes());
    let result = tap
      .process_response(&body, "h", "", &HeaderMap::new())
      .await
      .unwrap();
    assert_eq!(result.body, "after");
  }
}
