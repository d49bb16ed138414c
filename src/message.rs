//! HTTP/1.1 envelopes: parsing, serialization and header hygiene.
//!
//! Requests and responses are modelled as `http::Request<Bytes>` /
//! `http::Response<Bytes>` with the body read fully into memory before any
//! hook runs. There is no streaming interception.

use crate::error::{Error, Result};
use bytes::Bytes;
use flate2::read::MultiGzDecoder;
use http::header::{
  HeaderName, HeaderValue, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, HOST, TRANSFER_ENCODING,
  UPGRADE,
};
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri, Version};
use std::io::Read;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_START_LINE: usize = 8 * 1024;
const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Hop-by-hop headers stripped from every forwarded request and every
/// returned response before hooks see them.
pub(crate) const HOP_HEADERS: [&str; 9] = [
  "keep-alive",
  "transfer-encoding",
  "te",
  "connection",
  "trailer",
  "upgrade",
  "proxy-authorization",
  "proxy-authenticate",
  "accept-encoding",
];

/// Parse a single request: start line, headers and the body, framed by
/// Content-Length or chunked transfer encoding.
pub(crate) async fn read_request<R: AsyncBufRead + Unpin>(
  reader: &mut R,
) -> Result<Request<Bytes>> {
  let start = read_line(reader, MAX_START_LINE).await?;
  let mut parts = start.split_whitespace();
  let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
    (Some(m), Some(t), Some(v)) => (m, t, v),
    _ => {
      return Err(Error::invalid_request(format!(
        "invalid request line: {:?}",
        start
      )))
    }
  };

  let method: Method = method
    .parse()
    .map_err(|_| Error::invalid_request(format!("invalid method: {}", method)))?;
  let uri: Uri = target
    .parse()
    .map_err(|_| Error::invalid_request(format!("invalid request target: {}", target)))?;
  let version = parse_version(version);

  let headers = read_headers(reader).await?;

  let mut request = Request::builder()
    .method(method)
    .uri(uri)
    .version(version)
    .body(Bytes::new())?;
  *request.headers_mut() = headers;

  // chunked request bodies are decoded here so the forwarded request,
  // which travels without Transfer-Encoding, keeps its payload
  if is_chunked(request.headers()) {
    let body = read_chunked_body(reader).await?;
    *request.body_mut() = Bytes::from(body);
  } else if let Some(len) = content_length(request.headers()) {
    if len > 0 {
      let mut body = vec![0u8; len];
      reader.read_exact(&mut body).await?;
      *request.body_mut() = Bytes::from(body);
    }
  }
  Ok(request)
}

/// Parse a response from an upstream stream. The status line and headers must
/// arrive within `header_timeout`; the body is then read according to
/// Transfer-Encoding, Content-Length or connection close.
pub(crate) async fn read_response<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  method: &Method,
  header_timeout: Duration,
) -> Result<Response<Bytes>> {
  let (version, status, headers) =
    tokio::time::timeout(header_timeout, read_response_head(reader))
      .await
      .map_err(|_| Error::timeout("upstream response headers timed out"))??;

  let mut response = Response::builder()
    .status(status)
    .version(version)
    .body(Bytes::new())?;
  *response.headers_mut() = headers;

  let body = read_response_body(reader, method, &response).await?;
  *response.body_mut() = Bytes::from(body);
  Ok(response)
}

async fn read_response_head<R: AsyncBufRead + Unpin>(
  reader: &mut R,
) -> Result<(Version, StatusCode, HeaderMap)> {
  let start = read_line(reader, MAX_START_LINE).await?;
  let mut parts = start.split_whitespace();
  let (version, code) = match (parts.next(), parts.next()) {
    (Some(v), Some(c)) => (v, c),
    _ => {
      return Err(Error::invalid_request(format!(
        "invalid status line: {:?}",
        start
      )))
    }
  };
  let status = StatusCode::from_bytes(code.as_bytes())
    .map_err(|_| Error::invalid_request(format!("invalid status code: {}", code)))?;
  let version = parse_version(version);
  let headers = read_headers(reader).await?;
  Ok((version, status, headers))
}

async fn read_response_body<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  method: &Method,
  response: &Response<Bytes>,
) -> Result<Vec<u8>> {
  let status = response.status();
  if *method == Method::HEAD
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
    || status.is_informational()
  {
    return Ok(Vec::new());
  }

  if is_chunked(response.headers()) {
    return read_chunked_body(reader).await;
  }
  if let Some(len) = content_length(response.headers()) {
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    return Ok(body);
  }
  // keep-alive is disabled on the outbound leg, so EOF bounds the body
  let mut body = Vec::new();
  reader.read_to_end(&mut body).await?;
  Ok(body)
}

async fn read_chunked_body<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
  let mut body = Vec::new();
  loop {
    let size_line = read_line(reader, MAX_START_LINE).await?;
    let size_str = size_line.split(';').next().unwrap_or("").trim();
    let size = usize::from_str_radix(size_str, 16)
      .map_err(|_| Error::invalid_request(format!("invalid chunk size: {:?}", size_str)))?;
    if size == 0 {
      // trailers run until the final blank line
      loop {
        let trailer = read_line(reader, MAX_START_LINE).await?;
        if trailer.is_empty() {
          break;
        }
      }
      break;
    }
    let mut chunk = vec![0u8; size];
    reader.read_exact(&mut chunk).await?;
    body.append(&mut chunk);
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
  }
  Ok(body)
}

async fn read_headers<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<HeaderMap> {
  let mut headers = HeaderMap::new();
  let mut total = 0usize;
  loop {
    let mut raw = String::new();
    let n = reader.read_line(&mut raw).await?;
    if n == 0 {
      return Err(Error::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed while reading headers",
      )));
    }
    total += n;
    if total > MAX_HEADER_BYTES {
      return Err(Error::invalid_request(
        "headers size exceeds maximum allowed",
      ));
    }
    let line = raw.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
      break;
    }
    let Some((name, value)) = line.split_once(':') else {
      continue;
    };
    let name = HeaderName::from_bytes(name.trim().as_bytes())
      .map_err(|_| Error::invalid_request(format!("invalid header name: {:?}", name)))?;
    let value = HeaderValue::from_str(value.trim())
      .map_err(|_| Error::invalid_request(format!("invalid header value for {}", name)))?;
    headers.append(name, value);
  }
  Ok(headers)
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R, limit: usize) -> Result<String> {
  let mut raw = String::new();
  let n = reader.read_line(&mut raw).await?;
  if n == 0 {
    return Err(Error::Io(std::io::Error::new(
      std::io::ErrorKind::UnexpectedEof,
      "connection closed while reading",
    )));
  }
  if n > limit {
    return Err(Error::invalid_request("line too long"));
  }
  Ok(raw.trim_end_matches(['\r', '\n']).to_string())
}

fn parse_version(token: &str) -> Version {
  match token {
    "HTTP/1.0" => Version::HTTP_10,
    _ => Version::HTTP_11,
  }
}

pub(crate) fn content_length(headers: &HeaderMap) -> Option<usize> {
  headers
    .get(CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.trim().parse().ok())
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get_all(TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
}

/// Remove the hop-by-hop header set, plus any header the `Connection` value
/// names.
pub(crate) fn strip_hop_headers(headers: &mut HeaderMap) {
  let listed: Vec<String> = headers
    .get_all(CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .map(|t| t.trim().to_ascii_lowercase())
    .filter(|t| !t.is_empty())
    .collect();
  for name in listed {
    if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
      headers.remove(name);
    }
  }
  for name in HOP_HEADERS {
    headers.remove(name);
  }
}

/// Decode a gzip body in place; the `Content-Encoding` header goes away with
/// it so the client sees a plain body with an accurate length. A body that
/// fails to decode degrades to empty, the response still goes out.
pub(crate) fn decode_gzip(response: &mut Response<Bytes>) {
  let is_gzip = response
    .headers()
    .get(CONTENT_ENCODING)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.trim().eq_ignore_ascii_case("gzip"))
    .unwrap_or(false);
  if !is_gzip || response.body().is_empty() {
    return;
  }
  let mut decoded = Vec::new();
  let mut decoder = MultiGzDecoder::new(response.body().as_ref());
  if let Err(e) = decoder.read_to_end(&mut decoded) {
    tracing::warn!("failed to decode gzip body, dropping it: {}", e);
    decoded.clear();
  }
  response.headers_mut().remove(CONTENT_ENCODING);
  *response.body_mut() = Bytes::from(decoded);
}

/// The request's host and port, taken from the target URI when present and
/// the `Host` header otherwise. A missing port stays `None`.
pub(crate) fn host_port(request: &Request<Bytes>) -> (Option<String>, Option<u16>) {
  if let Some(host) = request.uri().host() {
    return (Some(host.to_string()), request.uri().port_u16());
  }
  match request.headers().get(HOST).and_then(|v| v.to_str().ok()) {
    Some(value) => {
      let (host, port) = authority_host_port(value);
      (Some(host), port)
    }
    None => (None, None),
  }
}

/// Split an authority string into host and optional port, tolerating
/// bracketed IPv6 literals.
pub(crate) fn authority_host_port(value: &str) -> (String, Option<u16>) {
  if let Some(stripped) = value.strip_prefix('[') {
    if let Some((host, rest)) = stripped.split_once(']') {
      let port = rest.strip_prefix(':').and_then(|p| p.parse().ok());
      return (host.to_string(), port);
    }
  }
  match value.rsplit_once(':') {
    Some((host, port)) if !host.contains(':') => match port.parse() {
      Ok(p) => (host.to_string(), Some(p)),
      Err(_) => (value.to_string(), None),
    },
    _ => (value.to_string(), None),
  }
}

/// Rewrite the target of a request parsed from a TLS-terminated stream:
/// scheme becomes `https` and the authority comes from the `Host` header.
pub(crate) fn set_https_target(request: &mut Request<Bytes>) -> Result<()> {
  let authority = request
    .headers()
    .get(HOST)
    .and_then(|v| v.to_str().ok())
    .map(str::to_string)
    .or_else(|| request.uri().authority().map(|a| a.to_string()))
    .ok_or_else(|| Error::invalid_request("request has no host"))?;
  let path_and_query = request
    .uri()
    .path_and_query()
    .map(|pq| pq.as_str().to_string())
    .unwrap_or_else(|| "/".to_string());
  let uri = Uri::builder()
    .scheme("https")
    .authority(authority)
    .path_and_query(path_and_query)
    .build()?;
  *request.uri_mut() = uri;
  Ok(())
}

/// True when the request asks for a protocol upgrade.
pub(crate) fn wants_upgrade(headers: &HeaderMap) -> bool {
  headers.get(UPGRADE).is_some()
    || headers
      .get_all(CONNECTION)
      .iter()
      .filter_map(|v| v.to_str().ok())
      .flat_map(|v| v.split(','))
      .any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
}

/// Serialize a request. `absolute_form` selects the proxy form used when
/// forwarding through an upstream proxy. Keep-alive stays disabled on the
/// wire and the Content-Length always reflects the final body.
pub(crate) async fn write_request<W: AsyncWrite + Unpin>(
  writer: &mut W,
  request: &Request<Bytes>,
  absolute_form: bool,
) -> Result<()> {
  let target = if absolute_form {
    request.uri().to_string()
  } else {
    request
      .uri()
      .path_and_query()
      .map(|pq| pq.as_str().to_string())
      .unwrap_or_else(|| "/".to_string())
  };
  let host = request
    .uri()
    .authority()
    .map(|a| a.to_string())
    .or_else(|| {
      request
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    })
    .ok_or_else(|| Error::invalid_request("request has no host"))?;

  let body = request.body();
  let mut buf = Vec::with_capacity(256 + body.len());
  buf.extend_from_slice(format!("{} {} HTTP/1.1\r\n", request.method(), target).as_bytes());
  buf.extend_from_slice(format!("Host: {}\r\n", host).as_bytes());
  for (name, value) in request.headers() {
    if name == HOST || name == CONTENT_LENGTH || name == CONNECTION {
      continue;
    }
    buf.extend_from_slice(name.as_str().as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(b"\r\n");
  }
  buf.extend_from_slice(b"Connection: close\r\n");
  let needs_length = !body.is_empty()
    || matches!(
      request.method(),
      &Method::POST | &Method::PUT | &Method::PATCH
    );
  if needs_length {
    buf.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
  }
  buf.extend_from_slice(b"\r\n");
  buf.extend_from_slice(body);

  writer.write_all(&buf).await?;
  writer.flush().await?;
  Ok(())
}

/// Serialize a response back to the client. The Content-Length written is
/// the final body length, except for replies that carry no body by
/// definition (HEAD, 204, 304) where the upstream's declared length is kept.
pub(crate) async fn write_response<W: AsyncWrite + Unpin>(
  writer: &mut W,
  response: &Response<Bytes>,
  method: &Method,
) -> Result<()> {
  let status = response.status();
  let reason = status.canonical_reason().unwrap_or("Unknown");
  let body = response.body();
  let bodyless = *method == Method::HEAD
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED;

  let mut buf = Vec::with_capacity(256 + body.len());
  buf.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", status.as_u16(), reason).as_bytes());
  for (name, value) in response.headers() {
    if name == CONTENT_LENGTH && !bodyless {
      continue;
    }
    buf.extend_from_slice(name.as_str().as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(b"\r\n");
  }
  if !bodyless {
    buf.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
  }
  buf.extend_from_slice(b"\r\n");
  buf.extend_from_slice(body);

  writer.write_all(&buf).await?;
  writer.flush().await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use flate2::write::GzEncoder;
  use flate2::Compression;
  use std::io::Write;

  #[tokio::test]
  async fn parses_a_request_with_body() {
    let raw: &[u8] =
      b"POST http://example.test/submit?q=1 HTTP/1.1\r\nHost: example.test\r\nContent-Length: 5\r\nX-Tag: a\r\nX-Tag: b\r\n\r\nhello";
    let mut reader = raw;
    let request = read_request(&mut reader).await.unwrap();
    assert_eq!(request.method(), Method::POST);
    assert_eq!(request.uri().host(), Some("example.test"));
    assert_eq!(request.uri().query(), Some("q=1"));
    assert_eq!(request.body().as_ref(), b"hello");
    // multi-valued, case-insensitive lookup
    assert_eq!(request.headers().get_all("x-tag").iter().count(), 2);
  }

  #[tokio::test]
  async fn parses_a_connect_request() {
    let raw: &[u8] = b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n";
    let mut reader = raw;
    let request = read_request(&mut reader).await.unwrap();
    assert_eq!(request.method(), Method::CONNECT);
    let (host, port) = host_port(&request);
    assert_eq!(host.as_deref(), Some("example.test"));
    assert_eq!(port, Some(443));
  }

  #[tokio::test]
  async fn rejects_garbage() {
    let raw: &[u8] = b"\x05\x01\x00\r\n\r\n";
    let mut reader = raw;
    assert!(read_request(&mut reader).await.is_err());
  }

  #[test]
  fn strips_the_exact_hop_by_hop_set() {
    let mut headers = HeaderMap::new();
    for name in HOP_HEADERS {
      headers.insert(
        HeaderName::from_bytes(name.as_bytes()).unwrap(),
        HeaderValue::from_static("x"),
      );
    }
    headers.insert("content-type", HeaderValue::from_static("text/plain"));
    strip_hop_headers(&mut headers);
    assert_eq!(headers.len(), 1);
    assert!(headers.contains_key("content-type"));
  }

  #[test]
  fn connection_value_names_more_headers_to_strip() {
    let mut headers = HeaderMap::new();
    headers.insert(CONNECTION, HeaderValue::from_static("close, X-Custom-Hop"));
    headers.insert("x-custom-hop", HeaderValue::from_static("secret"));
    headers.insert("x-kept", HeaderValue::from_static("yes"));
    strip_hop_headers(&mut headers);
    assert!(!headers.contains_key("x-custom-hop"));
    assert!(!headers.contains_key(CONNECTION));
    assert!(headers.contains_key("x-kept"));
  }

  #[tokio::test]
  async fn decodes_chunked_bodies() {
    let raw: &[u8] =
      b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
    let mut reader = raw;
    let response = read_response(&mut reader, &Method::GET, Duration::from_secs(5))
      .await
      .unwrap();
    assert_eq!(response.body().as_ref(), b"hello world");
  }

  #[tokio::test]
  async fn reads_to_eof_without_length() {
    let raw: &[u8] = b"HTTP/1.1 200 OK\r\nServer: t\r\n\r\nstreamed until close";
    let mut reader = raw;
    let response = read_response(&mut reader, &Method::GET, Duration::from_secs(5))
      .await
      .unwrap();
    assert_eq!(response.body().as_ref(), b"streamed until close");
  }

  #[test]
  fn gzip_bodies_decode_and_drop_the_encoding_header() {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"the plain text").unwrap();
    let compressed = encoder.finish().unwrap();

    let mut response = Response::builder()
      .status(StatusCode::OK)
      .body(Bytes::from(compressed))
      .unwrap();
    response
      .headers_mut()
      .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));

    decode_gzip(&mut response);
    assert_eq!(response.body().as_ref(), b"the plain text");
    assert!(!response.headers().contains_key(CONTENT_ENCODING));
  }

  #[test]
  fn malformed_gzip_degrades_to_an_empty_body() {
    let mut response = Response::builder()
      .status(StatusCode::OK)
      .body(Bytes::from_static(b"\x1f\x8b\x08not really gzip"))
      .unwrap();
    response
      .headers_mut()
      .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));

    decode_gzip(&mut response);
    assert!(response.body().is_empty());
    assert!(!response.headers().contains_key(CONTENT_ENCODING));
  }

  #[tokio::test]
  async fn response_content_length_tracks_the_final_body() {
    let mut response = Response::builder()
      .status(StatusCode::OK)
      .body(Bytes::from_static(b"mutated"))
      .unwrap();
    response
      .headers_mut()
      .insert(CONTENT_LENGTH, HeaderValue::from_static("9999"));

    let mut out = Vec::new();
    write_response(&mut out, &response, &Method::GET).await.unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("Content-Length: 7\r\n"));
    assert!(!text.contains("9999"));
    assert!(text.ends_with("\r\n\r\nmutated"));
  }

  #[tokio::test]
  async fn head_responses_keep_the_upstream_length() {
    let mut response = Response::builder()
      .status(StatusCode::OK)
      .body(Bytes::new())
      .unwrap();
    response
      .headers_mut()
      .insert(CONTENT_LENGTH, HeaderValue::from_static("1234"));

    let mut out = Vec::new();
    write_response(&mut out, &response, &Method::HEAD).await.unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("content-length: 1234\r\n"));
    assert!(!text.contains("Content-Length: 0"));
    assert!(text.ends_with("\r\n\r\n"));
  }

  #[tokio::test]
  async fn not_modified_responses_keep_the_upstream_length() {
    let mut response = Response::builder()
      .status(StatusCode::NOT_MODIFIED)
      .body(Bytes::new())
      .unwrap();
    response
      .headers_mut()
      .insert(CONTENT_LENGTH, HeaderValue::from_static("88"));

    let mut out = Vec::new();
    write_response(&mut out, &response, &Method::GET).await.unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("HTTP/1.1 304 Not Modified\r\n"));
    assert!(text.contains("content-length: 88\r\n"));
  }

  #[tokio::test]
  async fn parses_a_chunked_request_body() {
    let raw: &[u8] =
      b"POST http://example.test/up HTTP/1.1\r\nHost: example.test\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nping\r\n3\r\n123\r\n0\r\n\r\n";
    let mut reader = raw;
    let request = read_request(&mut reader).await.unwrap();
    assert_eq!(request.method(), Method::POST);
    assert_eq!(request.body().as_ref(), b"ping123");
  }

  #[test]
  fn upgrade_detection_covers_both_spellings() {
    let mut headers = HeaderMap::new();
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
    assert!(wants_upgrade(&headers));

    let mut headers = HeaderMap::new();
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    assert!(wants_upgrade(&headers));

    assert!(!wants_upgrade(&HeaderMap::new()));
  }

  #[test]
  fn https_target_rewrites_scheme_and_authority() {
    let mut request = Request::builder()
      .method(Method::GET)
      .uri("/index.html?x=2")
      .body(Bytes::new())
      .unwrap();
    request
      .headers_mut()
      .insert(HOST, HeaderValue::from_static("example.test:8443"));
    set_https_target(&mut request).unwrap();
    assert_eq!(request.uri().scheme_str(), Some("https"));
    assert_eq!(request.uri().authority().unwrap().as_str(), "example.test:8443");
    assert_eq!(request.uri().path(), "/index.html");
    assert_eq!(request.uri().query(), Some("x=2"));
  }
}
