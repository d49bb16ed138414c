//! Outbound HTTP round-trips.
//!
//! One connection per request: keep-alive is disabled so EOF can bound
//! unframed response bodies. Upstream certificates are not validated; the
//! proxy terminates trust at its own root.

use crate::dialer::{split_host_port, Dialer};
use crate::error::{Error, Result};
use crate::rewind::{self, Rewind};
use crate::tls::{self, BoxedIo};
use crate::message;
use bytes::Bytes;
use http::{Request, Response};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Direct dial timeout.
pub(crate) const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Outbound TLS handshake timeout.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
/// Time allowed for upstream status line and headers to arrive.
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(30);

/// Forwards one request upstream and reads back one response.
pub(crate) struct Transport {
  dialer: Dialer,
  upstream: Option<String>,
}

impl Transport {
  pub(crate) fn new(dialer: Dialer, upstream: Option<String>) -> Self {
    Self { dialer, upstream }
  }

  /// Strip hop-by-hop headers, forward the request, and return the response
  /// with its hop-by-hop headers stripped in turn.
  pub(crate) async fn round_trip(&self, mut request: Request<Bytes>) -> Result<Response<Bytes>> {
    message::strip_hop_headers(request.headers_mut());

    let https = request.uri().scheme_str() == Some("https");
    let (host, port) = message::host_port(&request);
    let host = host.ok_or_else(|| Error::invalid_request("request has no host"))?;
    let port = port.unwrap_or(if https { 443 } else { 80 });
    let method = request.method().clone();

    let (mut io, absolute_form): (BoxedIo, bool) = match &self.upstream {
      Some(upstream) => {
        let (up_host, up_port) = split_host_port(upstream, 80)?;
        let stream = self.dialer.dial(&up_host, up_port, DIAL_TIMEOUT).await?;
        if https {
          let tunnel = connect_through(stream, &host, port).await?;
          let stream =
            tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, tls::client_handshake(tunnel, &host))
              .await
              .map_err(|_| Error::timeout(format!("TLS handshake with {} timed out", host)))??;
          (Box::new(stream), false)
        } else {
          (Box::new(stream), true)
        }
      }
      None => {
        let stream = self.dialer.dial(&host, port, DIAL_TIMEOUT).await?;
        if https {
          let stream =
            tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, tls::client_handshake(stream, &host))
              .await
              .map_err(|_| Error::timeout(format!("TLS handshake with {} timed out", host)))??;
          (Box::new(stream), false)
        } else {
          (Box::new(stream), false)
        }
      }
    };

    message::write_request(&mut io, &request, absolute_form).await?;

    let mut reader = BufReader::new(io);
    let mut response = message::read_response(&mut reader, &method, RESPONSE_HEADER_TIMEOUT).await?;
    message::strip_hop_headers(response.headers_mut());
    Ok(response)
  }
}

/// Open a CONNECT tunnel to `host:port` through an already-dialed upstream
/// proxy connection.
async fn connect_through(
  mut stream: TcpStream,
  host: &str,
  port: u16,
) -> Result<Rewind<TcpStream>> {
  let connect = format!(
    "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n",
    host = host,
    port = port
  );
  stream.write_all(connect.as_bytes()).await?;
  stream.flush().await?;

  let mut reader = BufReader::new(stream);
  let mut status = String::new();
  reader.read_line(&mut status).await?;
  let mut parts = status.split_whitespace();
  let ok = matches!((parts.next(), parts.next()), (Some(_), Some("200")));
  if !ok {
    return Err(Error::connection_error(format!(
      "upstream proxy refused CONNECT: {}",
      status.trim()
    )));
  }
  loop {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 || line == "\r\n" || line == "\n" {
      break;
    }
  }
  Ok(rewind::unbuffer(reader))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::dns::CachedResolver;
  use http::header::HeaderValue;
  use http::Method;
  use tokio::io::AsyncReadExt;
  use tokio::net::TcpListener;

  async fn one_shot_origin(response: &'static [u8]) -> (std::net::SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
      let (mut stream, _) = listener.accept().await.unwrap();
      let mut seen = vec![0u8; 4096];
      let n = stream.read(&mut seen).await.unwrap();
      seen.truncate(n);
      stream.write_all(response).await.unwrap();
      seen
    });
    (addr, handle)
  }

  #[tokio::test]
  async fn round_trip_strips_hop_headers_and_disables_keepalive() {
    let (addr, origin) =
      one_shot_origin(b"HTTP/1.1 200 OK\r\nKeep-Alive: 5\r\nContent-Length: 2\r\n\r\nok").await;

    let dialer = Dialer::new(CachedResolver::system().unwrap(), false);
    let transport = Transport::new(dialer, None);

    let mut request = Request::builder()
      .method(Method::GET)
      .uri(format!("http://{}/", addr))
      .body(Bytes::new())
      .unwrap();
    request
      .headers_mut()
      .insert("proxy-authorization", HeaderValue::from_static("basic x"));
    request
      .headers_mut()
      .insert("x-kept", HeaderValue::from_static("1"));

    let response = transport.round_trip(request).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.body().as_ref(), b"ok");
    // hop-by-hop headers never come back to the caller
    assert!(!response.headers().contains_key("keep-alive"));

    let seen = String::from_utf8(origin.await.unwrap()).unwrap();
    assert!(seen.starts_with("GET / HTTP/1.1\r\n"));
    assert!(seen.contains("Connection: close\r\n"));
    assert!(seen.contains("x-kept: 1\r\n"));
    assert!(!seen.to_ascii_lowercase().contains("proxy-authorization"));
  }
}
