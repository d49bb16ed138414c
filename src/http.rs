//! HTTP interceptor: plaintext forwarding, the CONNECT tunnel and TLS MITM.
//!
//! A CONNECT tunnel is answered with a forged certificate so the decrypted
//! request stream re-enters the same request pipeline. A tunnel whose first
//! byte is not a TLS ClientHello is handed to the WebSocket relay as
//! plaintext instead of being forced through a doomed handshake.

use crate::error::{Error, Result};
use crate::events::ConnInfo;
use crate::server::Shared;
use crate::transport::DIAL_TIMEOUT;
use crate::{dialer, message, rewind, tls, ws};
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Method, Request, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

pub(crate) const CONNECT_SUCCESS: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
pub(crate) const CONNECT_FAILED: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// Virtual host under which proxied clients download the root certificate.
const CA_FILE_HOST: &str = "shermie-proxy.io";
const CA_FILE_PATH: &str = "/tls";
const CA_MIME_TYPE: &str = "application/x-x509-ca-cert";

/// TLS record type of a ClientHello. Anything else arriving inside a CONNECT
/// tunnel is treated as plaintext WebSocket.
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Read deadline for the first request on a MITM'd TLS stream.
const TLS_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Read deadline for a plaintext request inside a CONNECT tunnel.
const TUNNEL_PLAINTEXT_TIMEOUT: Duration = Duration::from_secs(10);

/// Entry point: parse one request off the buffered client stream and branch
/// on CONNECT.
pub(crate) async fn handle(
  shared: &Arc<Shared>,
  mut reader: BufReader<TcpStream>,
  conn: &ConnInfo,
) -> Result<()> {
  let request = message::read_request(&mut reader).await?;
  if request.method() == Method::CONNECT {
    handle_connect(shared, reader, request, conn).await
  } else {
    handle_plain(shared, reader, request, conn).await
  }
}

/// Plaintext branch: certificate download endpoint or forward-and-intercept.
async fn handle_plain(
  shared: &Arc<Shared>,
  mut reader: BufReader<TcpStream>,
  request: Request<Bytes>,
  conn: &ConnInfo,
) -> Result<()> {
  let (host, _) = message::host_port(&request);
  if host.as_deref() == Some(CA_FILE_HOST) && request.uri().path() == CA_FILE_PATH {
    let response = ca_file_response(shared)?;
    return message::write_response(reader.get_mut(), &response, request.method()).await;
  }
  forward(shared, reader.get_mut(), request, conn).await
}

/// Run the request hook, the upstream round trip and the response hook, then
/// write the response back with its Content-Length matching the final body.
async fn forward<W: AsyncWrite + Unpin>(
  shared: &Arc<Shared>,
  writer: &mut W,
  mut request: Request<Bytes>,
  conn: &ConnInfo,
) -> Result<()> {
  if let Some(body) = shared.events.on_http_request(&request, conn).await? {
    *request.body_mut() = body;
  }

  let method = request.method().clone();
  let mut response = match shared.transport.round_trip(request).await {
    Ok(response) => response,
    Err(e) => {
      // the client sees the socket close, never a half response
      tracing::error!("[conn {}] upstream round trip failed: {}", conn.id, e);
      return Ok(());
    }
  };

  message::decode_gzip(&mut response);
  if let Some(body) = shared.events.on_http_response(&response, conn).await? {
    *response.body_mut() = body;
  }
  message::write_response(writer, &response, &method).await
}

/// CONNECT branch: probe the target, acknowledge the tunnel, then MITM or
/// fall through to plaintext WebSocket.
async fn handle_connect(
  shared: &Arc<Shared>,
  mut reader: BufReader<TcpStream>,
  request: Request<Bytes>,
  conn: &ConnInfo,
) -> Result<()> {
  let (host, port) = message::host_port(&request);
  let host = host.ok_or_else(|| Error::invalid_request("CONNECT without a host"))?;

  // reachability probe only; the tunnel itself is served by the MITM below
  let probe: Result<tls::BoxedIo> = match &shared.config.upstream_proxy {
    Some(upstream) => {
      let (up_host, up_port) = dialer::split_host_port(upstream, 80)?;
      shared
        .dialer
        .dial(&up_host, up_port, DIAL_TIMEOUT)
        .await
        .map(|s| Box::new(s) as tls::BoxedIo)
    }
    None => {
      let port = port.unwrap_or(443);
      if port == 443 {
        shared
          .dialer
          .dial_tls(&host, port, DIAL_TIMEOUT)
          .await
          .map(|s| Box::new(s) as tls::BoxedIo)
      } else {
        shared
          .dialer
          .dial(&host, port, DIAL_TIMEOUT)
          .await
          .map(|s| Box::new(s) as tls::BoxedIo)
      }
    }
  };
  match probe {
    Ok(stream) => drop(stream),
    Err(e) => {
      tracing::error!("[conn {}] CONNECT target {} unreachable: {}", conn.id, host, e);
      reader.get_mut().write_all(CONNECT_FAILED).await?;
      reader.get_mut().flush().await?;
      return Ok(());
    }
  }

  reader.get_mut().write_all(CONNECT_SUCCESS).await?;
  reader.get_mut().flush().await?;

  let first = match reader.fill_buf().await {
    Ok(peek) if !peek.is_empty() => peek[0],
    _ => return Ok(()),
  };

  if first == TLS_HANDSHAKE_RECORD {
    mitm(shared, reader, &host, port, conn).await
  } else {
    // plaintext WebSocket mis-tunneled through CONNECT
    let request = tokio::time::timeout(
      TUNNEL_PLAINTEXT_TIMEOUT,
      message::read_request(&mut reader),
    )
    .await
    .map_err(|_| Error::timeout("tunneled plaintext request timed out"))??;
    ws::relay(shared, rewind::unbuffer(reader), request, false, conn).await
  }
}

/// Terminate TLS with a forged certificate and re-enter the request pipeline
/// on the decrypted stream.
async fn mitm(
  shared: &Arc<Shared>,
  reader: BufReader<TcpStream>,
  host: &str,
  port: Option<u16>,
  conn: &ConnInfo,
) -> Result<()> {
  let forged = shared.certs.get(host, port).await?;
  let (chain, key) = forged.clone_parts();
  let acceptor = TlsAcceptor::from(Arc::new(tls::server_config(chain, key)?));

  let tls_stream = match acceptor.accept(rewind::unbuffer(reader)).await {
    Ok(stream) => stream,
    Err(e) => {
      tracing::error!("[conn {}] client TLS handshake failed: {}", conn.id, e);
      return Ok(());
    }
  };

  let mut reader = BufReader::new(tls_stream);
  let mut request = match tokio::time::timeout(
    TLS_REQUEST_TIMEOUT,
    message::read_request(&mut reader),
  )
  .await
  {
    Ok(Ok(request)) => request,
    Ok(Err(e)) if e.is_disconnect() => {
      tracing::debug!("[conn {}] TLS client went away: {}", conn.id, e);
      return Ok(());
    }
    Ok(Err(e)) => return Err(e),
    Err(_) => return Err(Error::timeout("TLS request read timed out")),
  };

  if message::wants_upgrade(request.headers()) {
    return ws::relay(shared, rewind::unbuffer(reader), request, true, conn).await;
  }

  message::set_https_target(&mut request)?;
  forward(shared, reader.get_mut(), request, conn).await
}

fn ca_file_response(shared: &Arc<Shared>) -> Result<Response<Bytes>> {
  let der = shared.certs.ca_cert_der().as_ref().to_vec();
  let mut response = Response::builder()
    .status(StatusCode::OK)
    .body(Bytes::from(der))?;
  response
    .headers_mut()
    .insert(CONTENT_TYPE, HeaderValue::from_static(CA_MIME_TYPE));
  Ok(response)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn connect_framing_is_byte_exact() {
    assert_eq!(CONNECT_SUCCESS, b"HTTP/1.1 200 Connection Established\r\n\r\n");
    assert_eq!(CONNECT_FAILED, b"HTTP/1.1 502 Bad Gateway\r\n\r\n");
  }
}
