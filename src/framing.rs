//! Just enough HTTP/1.x to find requests and responses in a relayed byte stream.

use http::{HeaderMap, HeaderName, HeaderValue};

pub(crate) const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
/// Last-chunk marker of a chunked body; matched as a plain substring.
pub(crate) const LAST_CHUNK: &[u8] = b"0\r\n\r\n";
const CR_LF: &[u8] = b"\r\n";

/// Position of `needle` in `haystack`.
pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
  if needle.is_empty() || haystack.len() < needle.len() {
    return None;
  }
  haystack.windows(needle.len()).position(|w| w == needle)
}

/// Offset just past the first `\r\n\r\n`, i.e. where the body starts.
pub(crate) fn header_end(buf: &[u8]) -> Option<usize> {
  find(buf, HEADER_TERMINATOR).map(|i| i + HEADER_TERMINATOR.len())
}

/// Path of a `METHOD SP PATH SP VERSION` request line.
///
/// Anything other than exactly three space separated parts is not a request
/// line and yields `None`.
pub(crate) fn request_path(head: &[u8]) -> Option<&str> {
  let line = head.split(|b| *b == b'\n').next()?;
  let line = line.strip_suffix(b"\r").unwrap_or(line);
  let line = std::str::from_utf8(line).ok()?;
  let mut parts = line.split(' ');
  let (_method, path, _version) = (parts.next()?, parts.next()?, parts.next()?);
  if parts.next().is_some() {
    return None;
  }
  Some(path)
}

/// Status line and headers of a response.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResponseHead {
  /// Offset of the first body byte in the buffer the head was parsed from
  pub body_start: usize,
  pub status: u16,
  pub reason: String,
  pub headers: HeaderMap,
}

impl ResponseHead {
  /// Parse `head`, the bytes up to and including `\r\n\r\n`.
  ///
  /// An unreadable status line is taken as `200 OK`; header lines that are
  /// not `name: value` are skipped.
  pub(crate) fn parse(head: &[u8]) -> Self {
    let mut lines = head.split(|b| *b == b'\n');
    let (status, reason) = lines
      .next()
      .and_then(parse_status_line)
      .unwrap_or_else(|| (200, "OK".to_string()));
    let mut headers = HeaderMap::new();
    for line in lines {
      if let Some((k, v)) = parser_headers(line) {
        headers.append(k, v);
      }
    }
    Self {
      body_start: head.len(),
      status,
      reason,
      headers,
    }
  }
}

fn parse_status_line(line: &[u8]) -> Option<(u16, String)> {
  let line = line.strip_suffix(b"\r").unwrap_or(line);
  let line = std::str::from_utf8(line).ok()?;
  let mut parts = line.splitn(3, ' ');
  let _version = parts.next()?;
  let status = parts.next()?.parse().ok()?;
  let reason = parts.next().unwrap_or_default().to_string();
  Some((status, reason))
}

fn parser_headers(line: &[u8]) -> Option<(HeaderName, HeaderValue)> {
  let line = line.strip_suffix(b"\r").unwrap_or(line);
  let colon = line.iter().position(|b| *b == b':')?;
  let name = HeaderName::from_bytes(line[..colon].trim_ascii()).ok()?;
  let value = HeaderValue::from_bytes(line[colon + 1..].trim_ascii()).ok()?;
  Some((name, value))
}

/// Decode as much of a chunked body as has arrived.
///
/// Returns the concatenated chunk payloads and whether the terminating
/// zero-length chunk has been seen. Chunk extensions are ignored; a malformed
/// size line stops decoding at that point.
pub(crate) fn decode_chunked(mut body: &[u8]) -> (Vec<u8>, bool) {
  let mut decoded = Vec::with_capacity(body.len());
  loop {
    let Some(line_end) = find(body, CR_LF) else {
      break;
    };
    let size_line = &body[..line_end];
    let size_field = size_line
      .split(|b| *b == b';')
      .next()
      .unwrap_or(size_line)
      .trim_ascii();
    let Some(size) = std::str::from_utf8(size_field)
      .ok()
      .and_then(|s| usize::from_str_radix(s, 16).ok())
    else {
      tracing::debug!("[Tap] Bad chunk size line {:?}", String::from_utf8_lossy(size_line));
      break;
    };
    let data_start = line_end + CR_LF.len();
    if size == 0 {
      return (decoded, true);
    }
    let Some(data_end) = data_start.checked_add(size) else {
      break;
    };
    if data_end > body.len() {
      // partial chunk: keep what is there, the rest comes with later reads
      decoded.extend_from_slice(&body[data_start..]);
      break;
    }
    decoded.extend_from_slice(&body[data_start..data_end]);
    if data_end + CR_LF.len() > body.len() {
      break;
    }
    body = &body[data_end + CR_LF.len()..];
  }
  (decoded, false)
}
