//! Raw TCP passthrough for connections that match no known protocol byte.
//!
//! Pipes bytes to the configured forward target in both directions, giving
//! the embedder a chance to observe or rewrite each chunk.

use crate::error::{Error, Result};
use crate::events::ConnInfo;
use crate::rewind;
use crate::server::Shared;
use crate::transport::DIAL_TIMEOUT;
use crate::dialer::split_host_port;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const PUMP_BUFFER_SIZE: usize = 10 * 1024;

enum PipeDirection {
  ClientToTarget,
  TargetToClient,
}

/// Pipe the connection to the configured forward target. Without one there
/// is nowhere to send the bytes, so the connection closes.
pub(crate) async fn handle(
  shared: &Arc<Shared>,
  reader: BufReader<TcpStream>,
  conn: &ConnInfo,
) -> Result<()> {
  let Some(to) = shared.config.to.as_deref() else {
    tracing::warn!(
      "[conn {}] unknown protocol and no forward target configured",
      conn.id
    );
    return Ok(());
  };
  let (host, port) = split_host_port(to, 0)?;
  if port == 0 {
    return Err(Error::invalid_request(format!(
      "forward target {} has no port",
      to
    )));
  }

  let target = shared.dialer.dial(&host, port, DIAL_TIMEOUT).await?;

  let client = rewind::unbuffer(reader);
  let (client_read, client_write) = tokio::io::split(client);
  let (target_read, target_write) = target.into_split();

  let (stop_tx, mut stop_rx) = mpsc::channel::<Error>(2);
  let forward = tokio::spawn(pipe(
    client_read,
    target_write,
    PipeDirection::ClientToTarget,
    shared.clone(),
    conn.clone(),
    stop_tx.clone(),
  ));
  let backward = tokio::spawn(pipe(
    target_read,
    client_write,
    PipeDirection::TargetToClient,
    shared.clone(),
    conn.clone(),
    stop_tx,
  ));

  if let Some(e) = stop_rx.recv().await {
    tracing::info!("[conn {}] tcp passthrough ended: {}", conn.id, e);
  }
  forward.abort();
  backward.abort();
  Ok(())
}

async fn pipe<R, W>(
  mut source: R,
  mut sink: W,
  direction: PipeDirection,
  shared: Arc<Shared>,
  conn: ConnInfo,
  stop: mpsc::Sender<Error>,
) where
  R: AsyncRead + Unpin + Send,
  W: AsyncWrite + Unpin + Send,
{
  let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
  loop {
    match source.read(&mut buf).await {
      Ok(0) => {
        let _ = stop.send(Error::Connection("peer closed".to_string())).await;
        break;
      }
      Ok(n) => {
        let chunk = Bytes::copy_from_slice(&buf[..n]);
        let hooked = match direction {
          PipeDirection::ClientToTarget => shared.events.on_tcp_client_stream(&chunk, &conn).await,
          PipeDirection::TargetToClient => shared.events.on_tcp_server_stream(&chunk, &conn).await,
        };
        let outgoing = match hooked {
          Ok(Some(replacement)) => replacement,
          Ok(None) => chunk,
          Err(e) => {
            let _ = stop.send(e).await;
            break;
          }
        };
        if let Err(e) = sink.write_all(&outgoing).await {
          let _ = stop.send(Error::Io(e)).await;
          break;
        }
      }
      Err(e) => {
        let _ = stop.send(Error::Io(e)).await;
        break;
      }
    }
  }
}
