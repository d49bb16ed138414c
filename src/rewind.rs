//! Stream wrapper that replays already-buffered bytes before the inner stream.
//!
//! The dispatcher peeks protocol bytes through a `BufReader`; when a
//! connection is handed to TLS, WebSocket or a byte pump, the buffered bytes
//! must stay readable on the raw stream. `Rewind` carries them across the
//! rewrap.

use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf};

/// A duplex stream that yields `prefix` before reading from `inner`.
#[derive(Debug)]
pub struct Rewind<T> {
  prefix: Bytes,
  inner: T,
}

impl<T> Rewind<T> {
  /// Wrap `inner`, replaying `prefix` on the first reads.
  pub fn new(prefix: Bytes, inner: T) -> Self {
    Self { prefix, inner }
  }
}

/// Convert a `BufReader` back into a raw duplex stream without losing the
/// bytes it had buffered.
pub(crate) fn unbuffer<T: AsyncRead>(reader: BufReader<T>) -> Rewind<T> {
  let prefix = Bytes::copy_from_slice(reader.buffer());
  Rewind::new(prefix, reader.into_inner())
}

impl<T: AsyncRead + Unpin> AsyncRead for Rewind<T> {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    if !self.prefix.is_empty() {
      let n = self.prefix.len().min(buf.remaining());
      let chunk = self.prefix.split_to(n);
      buf.put_slice(&chunk);
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Rewind<T> {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncBufReadExt, AsyncReadExt};

  #[tokio::test]
  async fn replays_prefix_before_inner() {
    let inner: &[u8] = b" world";
    let mut stream = Rewind::new(Bytes::from_static(b"hello"), inner);
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"hello world");
  }

  #[tokio::test]
  async fn unbuffer_keeps_peeked_bytes() {
    let data: &[u8] = b"CONNECT example.test:443 HTTP/1.1\r\n";
    let mut reader = BufReader::new(data);
    let peeked = reader.fill_buf().await.unwrap();
    assert_eq!(peeked[0], b'C');

    let mut stream = unbuffer(reader);
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, data);
  }
}
