//! WebSocket relay: upgrade the client in place, dial the upstream, and pump
//! frames both ways through the per-frame hooks.
//!
//! Reaches here on two paths: a `wss` upgrade parsed off a MITM'd TLS stream,
//! and a plaintext upgrade mis-tunneled through CONNECT. The stream type
//! carries that difference; the relay itself is identical.

use crate::error::{Error, Result};
use crate::events::{ConnInfo, ProxyEvents};
use crate::server::Shared;
use crate::transport::DIAL_TIMEOUT;
use crate::{message, tls};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use http::header::{HeaderName, CONNECTION, HOST, UPGRADE};
use http::Request;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_tungstenite::client_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Upstream WebSocket handshake deadline (TLS wrap included for `wss`).
const WS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Headers the upstream handshake generates itself; carrying the client's
/// copies would corrupt it. `Host` is derived from the URL.
const WS_MANAGED_HEADERS: [&str; 5] = [
  "upgrade",
  "connection",
  "sec-websocket-key",
  "sec-websocket-version",
  "sec-websocket-extensions",
];

#[derive(Clone, Copy)]
enum WsDirection {
  ClientToServer,
  ServerToClient,
}

impl WsDirection {
  fn source(&self) -> &'static str {
    match self {
      WsDirection::ClientToServer => "client",
      WsDirection::ServerToClient => "server",
    }
  }
}

/// Relay one upgraded connection. Returns immediately when the request lacks
/// `Upgrade`.
pub(crate) async fn relay<S>(
  shared: &Arc<Shared>,
  mut stream: S,
  request: Request<Bytes>,
  is_tls: bool,
  conn: &ConnInfo,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
  if request.headers().get(UPGRADE).is_none() {
    return Ok(());
  }

  // upgrade the client side in place: any origin, subprotocol echoed
  let key = request
    .headers()
    .get("sec-websocket-key")
    .and_then(|v| v.to_str().ok())
    .ok_or_else(|| Error::invalid_request("upgrade without Sec-WebSocket-Key"))?;
  let accept = derive_accept_key(key.as_bytes());
  let subprotocol = request
    .headers()
    .get("sec-websocket-protocol")
    .and_then(|v| v.to_str().ok())
    .map(str::to_string);

  let mut response = format!(
    "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Accept: {}\r\n",
    accept
  );
  if let Some(p) = &subprotocol {
    response.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", p));
  }
  response.push_str("\r\n");
  stream.write_all(response.as_bytes()).await?;
  stream.flush().await?;

  let client_ws = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;

  // upstream URL mirrors the tunnel: wss through TLS, ws otherwise
  let authority = request
    .headers()
    .get(HOST)
    .and_then(|v| v.to_str().ok())
    .map(str::to_string)
    .or_else(|| request.uri().authority().map(|a| a.to_string()))
    .ok_or_else(|| Error::invalid_request("upgrade request without a host"))?;
  let (host, explicit_port) = message::authority_host_port(&authority);
  let port = explicit_port.unwrap_or(if is_tls { 443 } else { 80 });

  let path = request.uri().path();
  let mut url = format!(
    "{}://{}{}",
    if is_tls { "wss" } else { "ws" },
    authority,
    if path.is_empty() { "/" } else { path }
  );
  if let Some(query) = request.uri().query() {
    url.push('?');
    url.push_str(query);
  }

  let mut upstream_request = url.as_str().into_client_request()?;
  for (name, value) in request.headers() {
    if is_managed_header(name) {
      continue;
    }
    upstream_request.headers_mut().append(name.clone(), value.clone());
  }

  let tcp = shared.dialer.dial(&host, port, DIAL_TIMEOUT).await?;
  let io: tls::BoxedIo = if is_tls {
    let stream = tokio::time::timeout(WS_HANDSHAKE_TIMEOUT, tls::client_handshake(tcp, &host))
      .await
      .map_err(|_| Error::timeout(format!("wss handshake with {} timed out", host)))??;
    Box::new(stream)
  } else {
    Box::new(tcp)
  };
  let (server_ws, _) =
    tokio::time::timeout(WS_HANDSHAKE_TIMEOUT, client_async(upstream_request, io))
      .await
      .map_err(|_| Error::timeout(format!("websocket handshake with {} timed out", host)))??;

  let (server_sink, server_stream) = server_ws.split();
  let (client_sink, client_stream) = client_ws.split();

  // one reader task per direction; the first terminating error wins
  let (stop_tx, mut stop_rx) = mpsc::channel::<String>(2);
  let forward = tokio::spawn(pump_frames(
    client_stream,
    server_sink,
    WsDirection::ClientToServer,
    shared.events.clone(),
    conn.clone(),
    stop_tx.clone(),
  ));
  let backward = tokio::spawn(pump_frames(
    server_stream,
    client_sink,
    WsDirection::ServerToClient,
    shared.events.clone(),
    conn.clone(),
    stop_tx,
  ));

  if let Some(reason) = stop_rx.recv().await {
    tracing::info!("[conn {}] websocket relay ended: {}", conn.id, reason);
  }
  forward.abort();
  backward.abort();
  Ok(())
}

async fn pump_frames<R, W>(
  mut source: R,
  mut sink: W,
  direction: WsDirection,
  events: Arc<dyn ProxyEvents>,
  conn: ConnInfo,
  stop: mpsc::Sender<String>,
) where
  R: Stream<Item = tokio_tungstenite::tungstenite::Result<Message>> + Unpin,
  W: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
  loop {
    match source.next().await {
      Some(Ok(Message::Close(frame))) => {
        let _ = stop
          .send(format!(
            "{} sent {}",
            direction.source(),
            close_reason(frame.as_ref())
          ))
          .await;
        break;
      }
      Some(Ok(message)) => {
        let hooked = match direction {
          WsDirection::ClientToServer => events.on_ws_request(&message, &conn).await,
          WsDirection::ServerToClient => events.on_ws_response(&message, &conn).await,
        };
        let outgoing = match hooked {
          Ok(Some(replacement)) => replacement,
          Ok(None) => message,
          Err(e) => {
            let _ = stop
              .send(format!("{} hook failed: {}", direction.source(), e))
              .await;
            break;
          }
        };
        if let Err(e) = sink.send(outgoing).await {
          let _ = stop
            .send(format!(
              "relaying {} frame failed: {}",
              direction.source(),
              e
            ))
            .await;
          break;
        }
      }
      Some(Err(e)) => {
        let _ = stop
          .send(format!("reading from {} failed: {}", direction.source(), e))
          .await;
        break;
      }
      None => {
        let _ = stop
          .send(format!("{} stream ended", direction.source()))
          .await;
        break;
      }
    }
  }
}

/// Going-away and abnormal closures are clean terminations, just named.
fn close_reason(frame: Option<&CloseFrame>) -> String {
  match frame {
    Some(f) if f.code == CloseCode::Away => "close (going away)".to_string(),
    Some(f) if f.code == CloseCode::Abnormal => "close (abnormal closure)".to_string(),
    Some(f) => format!("close ({})", f.code),
    None => "close".to_string(),
  }
}

fn is_managed_header(name: &HeaderName) -> bool {
  name == HOST
    || name == UPGRADE
    || name == CONNECTION
    || WS_MANAGED_HEADERS.contains(&name.as_str())
}
