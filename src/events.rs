//! Embedder-facing interception hooks

use crate::error::Result;
use bytes::Bytes;
use http::{Request, Response};
use std::net::SocketAddr;
use tokio_tungstenite::tungstenite::Message;

/// Immutable per-connection metadata handed to every hook.
///
/// Interceptors hold a shared configuration handle instead of a back-reference
/// to the server, so nothing mutates server state from a connection.
#[derive(Debug, Clone)]
pub struct ConnInfo {
  /// Monotonic connection counter, unique for the process lifetime
  pub id: u64,
  /// Remote address of the accepted client socket
  pub peer_addr: SocketAddr,
  /// Local address the client connected to
  pub local_addr: SocketAddr,
}

/// Interception hooks invoked by the engine.
///
/// Every method has a no-op default, so embedders implement only what they
/// need. Payload hooks return `Ok(Some(new))` to substitute the in-flight
/// payload, `Ok(None)` to forward it unchanged; the bytes the engine forwards
/// are the last value supplied. An `Err` is treated as a transport error for
/// that direction and terminates the affected flow only.
#[async_trait::async_trait]
pub trait ProxyEvents: Send + Sync {
  /// A client connection was accepted.
  async fn on_tcp_connect(&self, _conn: &ConnInfo) {}

  /// A client connection is about to close. Fires exactly once per accepted
  /// connection, after every other hook for that connection.
  async fn on_tcp_close(&self, _conn: &ConnInfo) {}

  /// An HTTP request was parsed and is about to be forwarded upstream.
  /// The body has been read fully into the request.
  async fn on_http_request(
    &self,
    _request: &Request<Bytes>,
    _conn: &ConnInfo,
  ) -> Result<Option<Bytes>> {
    Ok(None)
  }

  /// An upstream HTTP response arrived and is about to be written back.
  /// Gzip-encoded bodies are decoded before this hook sees them.
  async fn on_http_response(
    &self,
    _response: &Response<Bytes>,
    _conn: &ConnInfo,
  ) -> Result<Option<Bytes>> {
    Ok(None)
  }

  /// A WebSocket frame arrived from the client. Substituting a message of a
  /// different type is allowed; the engine otherwise preserves it.
  async fn on_ws_request(&self, _message: &Message, _conn: &ConnInfo) -> Result<Option<Message>> {
    Ok(None)
  }

  /// A WebSocket frame arrived from the upstream server.
  async fn on_ws_response(&self, _message: &Message, _conn: &ConnInfo) -> Result<Option<Message>> {
    Ok(None)
  }

  /// A chunk read from a SOCKS5 client, about to be written to the target.
  async fn on_socks5_request(&self, _chunk: &Bytes, _conn: &ConnInfo) -> Result<Option<Bytes>> {
    Ok(None)
  }

  /// A chunk read from a SOCKS5 target, about to be written to the client.
  async fn on_socks5_response(&self, _chunk: &Bytes, _conn: &ConnInfo) -> Result<Option<Bytes>> {
    Ok(None)
  }

  /// A chunk read from the client on the raw TCP passthrough path.
  async fn on_tcp_client_stream(&self, _chunk: &Bytes, _conn: &ConnInfo) -> Result<Option<Bytes>> {
    Ok(None)
  }

  /// A chunk read from the forward target on the raw TCP passthrough path.
  async fn on_tcp_server_stream(&self, _chunk: &Bytes, _conn: &ConnInfo) -> Result<Option<Bytes>> {
    Ok(None)
  }
}

/// Default hook table: observes nothing, substitutes nothing.
pub struct NoopEvents;

#[async_trait::async_trait]
impl ProxyEvents for NoopEvents {}

/// Hook table that traces every intercepted payload. Useful as a smoke-test
/// embedder and as a template for real implementations.
pub struct LoggingEvents;

#[async_trait::async_trait]
impl ProxyEvents for LoggingEvents {
  async fn on_tcp_connect(&self, conn: &ConnInfo) {
    tracing::info!("[conn {}] accepted from {}", conn.id, conn.peer_addr);
  }

  async fn on_tcp_close(&self, conn: &ConnInfo) {
    tracing::info!("[conn {}] closed", conn.id);
  }

  async fn on_http_request(
    &self,
    request: &Request<Bytes>,
    conn: &ConnInfo,
  ) -> Result<Option<Bytes>> {
    tracing::info!(
      "[conn {}] {} {} ({} byte body)",
      conn.id,
      request.method(),
      request.uri(),
      request.body().len()
    );
    Ok(None)
  }

  async fn on_http_response(
    &self,
    response: &Response<Bytes>,
    conn: &ConnInfo,
  ) -> Result<Option<Bytes>> {
    tracing::info!(
      "[conn {}] {} ({} byte body)",
      conn.id,
      response.status(),
      response.body().len()
    );
    Ok(None)
  }

  async fn on_ws_request(&self, message: &Message, conn: &ConnInfo) -> Result<Option<Message>> {
    tracing::info!("[conn {}] ws client frame: {} bytes", conn.id, message.len());
    Ok(None)
  }

  async fn on_ws_response(&self, message: &Message, conn: &ConnInfo) -> Result<Option<Message>> {
    tracing::info!("[conn {}] ws server frame: {} bytes", conn.id, message.len());
    Ok(None)
  }

  async fn on_socks5_request(&self, chunk: &Bytes, conn: &ConnInfo) -> Result<Option<Bytes>> {
    tracing::info!("[conn {}] socks5 client chunk: {} bytes", conn.id, chunk.len());
    Ok(None)
  }

  async fn on_socks5_response(&self, chunk: &Bytes, conn: &ConnInfo) -> Result<Option<Bytes>> {
    tracing::info!("[conn {}] socks5 target chunk: {} bytes", conn.id, chunk.len());
    Ok(None)
  }
}
