//! Outbound TCP dialing through the DNS cache.

use crate::dns::CachedResolver;
use crate::error::{Error, Result};
use crate::tls;
use socket2::{Domain, Protocol, Socket as RawSocket, Type};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::client::TlsStream;

/// Dials targets for every interceptor: resolves through the shared DNS
/// cache, prefers IPv4, applies a per-dial timeout and the configured Nagle
/// toggle.
#[derive(Clone)]
pub struct Dialer {
  resolver: CachedResolver,
  nodelay: bool,
}

impl Dialer {
  /// `nagle` mirrors the server configuration: enabling Nagle clears
  /// `TCP_NODELAY` and vice versa.
  pub fn new(resolver: CachedResolver, nagle: bool) -> Self {
    Self {
      resolver,
      nodelay: !nagle,
    }
  }

  /// Dial `host:port` under `timeout`.
  pub async fn dial(&self, host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let ip = self.resolver.resolve_one(host).await?;
    let addr = SocketAddr::new(ip, port);
    self.dial_addr(addr, timeout).await
  }

  /// Dial an already-resolved address under `timeout`.
  pub async fn dial_addr(&self, addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let raw = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw.into());
    socket.set_nodelay(self.nodelay)?;
    let stream = tokio::time::timeout(timeout, socket.connect(addr))
      .await
      .map_err(|_| Error::timeout(format!("dial {} timed out", addr)))?
      .map_err(|e| {
        Error::connection_error(format!("failed to connect to {}: {}", addr, e))
      })?;
    Ok(stream)
  }

  /// Dial `host:port` and complete an insecure TLS client handshake on top.
  /// The whole sequence runs under `timeout`.
  pub async fn dial_tls(
    &self,
    host: &str,
    port: u16,
    timeout: Duration,
  ) -> Result<TlsStream<TcpStream>> {
    let stream = self.dial(host, port, timeout).await?;
    tokio::time::timeout(timeout, tls::client_handshake(stream, host))
      .await
      .map_err(|_| Error::timeout(format!("TLS handshake with {}:{} timed out", host, port)))?
  }

  /// Dial `host:port`, wrapping in TLS when `with_tls` is set. Used where the
  /// caller decides the transport by port number.
  pub(crate) async fn dial_target(
    &self,
    host: &str,
    port: u16,
    with_tls: bool,
    timeout: Duration,
  ) -> Result<(tls::BoxedIo, Option<SocketAddr>)> {
    let stream = self.dial(host, port, timeout).await?;
    let peer = stream.peer_addr().ok();
    if with_tls {
      let stream = tokio::time::timeout(timeout, tls::client_handshake(stream, host))
        .await
        .map_err(|_| Error::timeout(format!("TLS handshake with {}:{} timed out", host, port)))??;
      Ok((Box::new(stream), peer))
    } else {
      Ok((Box::new(stream), peer))
    }
  }
}

impl std::fmt::Debug for Dialer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Dialer")
      .field("nodelay", &self.nodelay)
      .finish()
  }
}

/// Split a `host:port` string, tolerating bracketed IPv6 literals.
pub(crate) fn split_host_port(target: &str, default_port: u16) -> Result<(String, u16)> {
  if let Some(stripped) = target.strip_prefix('[') {
    // [::1]:443
    let (host, rest) = stripped
      .split_once(']')
      .ok_or_else(|| Error::invalid_request(format!("invalid target address: {}", target)))?;
    let port = match rest.strip_prefix(':') {
      Some(p) => p
        .parse::<u16>()
        .map_err(|_| Error::invalid_request(format!("invalid port in {}", target)))?,
      None => default_port,
    };
    return Ok((host.to_string(), port));
  }
  match target.rsplit_once(':') {
    Some((host, port)) if !host.contains(':') => {
      let port = port
        .parse::<u16>()
        .map_err(|_| Error::invalid_request(format!("invalid port in {}", target)))?;
      Ok((host.to_string(), port))
    }
    // bare IPv6 literal or no port at all
    _ => Ok((target.to_string(), default_port)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn splits_host_and_port() {
    assert_eq!(
      split_host_port("example.test:8443", 443).unwrap(),
      ("example.test".to_string(), 8443)
    );
    assert_eq!(
      split_host_port("example.test", 443).unwrap(),
      ("example.test".to_string(), 443)
    );
  }

  #[test]
  fn splits_ipv6_literals() {
    assert_eq!(
      split_host_port("[2001:db8::1]:8080", 443).unwrap(),
      ("2001:db8::1".to_string(), 8080)
    );
    assert_eq!(
      split_host_port("2001:db8::1", 443).unwrap(),
      ("2001:db8::1".to_string(), 443)
    );
  }

  #[test]
  fn rejects_bad_ports() {
    assert!(split_host_port("example.test:70000", 443).is_err());
    assert!(split_host_port("[::1]:nope", 443).is_err());
  }
}
