//! SOCKS5 interceptor: RFC 1928 negotiation and the bidirectional pumps.
//!
//! Only the no-authentication method is negotiated. CONNECT gets a full
//! relay; BIND stops after the reply; UDP associate performs the initial
//! outbound dial and then reports failure, the association itself is not
//! supported.

use crate::error::{Error, Result};
use crate::events::ConnInfo;
use crate::rewind;
use crate::server::Shared;
use crate::tls::BoxedIo;
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;

const SOCKS5_VERSION: u8 = 0x05;
const NO_AUTHENTICATION: u8 = 0x00;
const RSV: u8 = 0x00;

const CMD_CONNECT: u8 = 0x01;
const CMD_BIND: u8 = 0x02;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_FAILURE: u8 = 0x01;

const TARGET_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const PUMP_BUFFER_SIZE: usize = 10 * 1024;

enum RawAddr {
  Ip(IpAddr),
  Domain(String),
}

/// Drive the greeting and request phases, dial the target, and relay.
pub(crate) async fn handle(
  shared: &Arc<Shared>,
  mut reader: BufReader<TcpStream>,
  conn: &ConnInfo,
) -> Result<()> {
  // greeting: VER, NMETHODS, METHODS[]
  let version = reader.read_u8().await?;
  if version != SOCKS5_VERSION {
    return Err(Error::proxy_error(format!(
      "unsupported SOCKS version: {}",
      version
    )));
  }
  let nmethods = reader.read_u8().await?;
  let mut methods = vec![0u8; nmethods as usize];
  reader.read_exact(&mut methods).await?;
  // only no-auth is ever negotiated
  reader
    .get_mut()
    .write_all(&[SOCKS5_VERSION, NO_AUTHENTICATION])
    .await?;
  reader.get_mut().flush().await?;

  // request: VER, CMD, RSV, ATYP
  let version = reader.read_u8().await?;
  if version != SOCKS5_VERSION {
    return Err(Error::proxy_error(format!(
      "invalid SOCKS version in request: {}",
      version
    )));
  }
  let command = reader.read_u8().await?;
  if !matches!(command, CMD_CONNECT | CMD_BIND | CMD_UDP_ASSOCIATE) {
    return Err(Error::proxy_error(format!(
      "unsupported SOCKS5 command: {}",
      command
    )));
  }
  let rsv = reader.read_u8().await?;
  if rsv != RSV {
    return Err(Error::proxy_error(format!(
      "invalid SOCKS5 reserved byte: {}",
      rsv
    )));
  }
  let atyp = reader.read_u8().await?;
  let raw = match atyp {
    ATYP_IPV4 => {
      let mut octets = [0u8; 4];
      reader.read_exact(&mut octets).await?;
      RawAddr::Ip(IpAddr::V4(Ipv4Addr::from(octets)))
    }
    ATYP_IPV6 => {
      let mut octets = [0u8; 16];
      reader.read_exact(&mut octets).await?;
      RawAddr::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
    }
    ATYP_DOMAIN => {
      let len = reader.read_u8().await? as usize;
      if len == 0 {
        return Err(Error::proxy_error("empty SOCKS5 domain name"));
      }
      let mut name = vec![0u8; len];
      reader.read_exact(&mut name).await?;
      let name =
        String::from_utf8(name).map_err(|_| Error::proxy_error("invalid SOCKS5 domain name"))?;
      RawAddr::Domain(name)
    }
    other => {
      return Err(Error::proxy_error(format!(
        "unsupported SOCKS5 address type: {}",
        other
      )));
    }
  };

  // port, big-endian; echoed verbatim in the reply
  let mut port_bytes = [0u8; 2];
  reader.read_exact(&mut port_bytes).await?;
  let port = u16::from_be_bytes(port_bytes);

  // domains go through the OS resolver, falling back to the literal name
  let (dial_host, domain) = match raw {
    RawAddr::Ip(ip) => (ip.to_string(), None),
    RawAddr::Domain(name) => {
      let resolved = tokio::net::lookup_host((name.as_str(), port))
        .await
        .ok()
        .and_then(|mut addrs| addrs.next());
      match resolved {
        Some(addr) => (addr.ip().to_string(), Some(name)),
        None => {
          tracing::warn!("[conn {}] failed to resolve {}, dialing literal", conn.id, name);
          (name.clone(), Some(name))
        }
      }
    }
  };

  if command == CMD_UDP_ASSOCIATE {
    let dialed = udp_dial(&dial_host, port).await;
    if let Err(e) = dialed {
      tracing::error!("[conn {}] UDP dial to {}:{} failed: {}", conn.id, dial_host, port, e);
    }
    let reply = encode_reply(REP_FAILURE, None, &dial_host, port_bytes);
    reader.get_mut().write_all(&reply).await?;
    reader.get_mut().flush().await?;
    return Ok(());
  }

  tracing::info!("[conn {}] socks5 target {}:{}", conn.id, dial_host, port);
  let dialed = shared
    .dialer
    .dial_target(&dial_host, port, port == 443, TARGET_DIAL_TIMEOUT)
    .await;
  let (target, peer) = match dialed {
    Ok(dialed) => dialed,
    Err(e) => {
      tracing::error!(
        "[conn {}] failed to connect to {}:{}: {}",
        conn.id,
        dial_host,
        port,
        e
      );
      let reply = encode_reply(REP_FAILURE, None, &dial_host, port_bytes);
      reader.get_mut().write_all(&reply).await?;
      reader.get_mut().flush().await?;
      return Ok(());
    }
  };

  let bound_name = domain.as_deref().unwrap_or(&dial_host);
  let reply = encode_reply(REP_SUCCESS, peer, bound_name, port_bytes);
  reader.get_mut().write_all(&reply).await?;
  reader.get_mut().flush().await?;

  if command != CMD_CONNECT {
    // BIND dials and replies, nothing more
    return Ok(());
  }

  run_pumps(shared, reader, target, conn).await
}

async fn udp_dial(host: &str, port: u16) -> std::io::Result<()> {
  let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
  socket.connect((host, port)).await?;
  Ok(())
}

/// Encode the reply: VER, REP, RSV, then the bound address. The address is
/// the actual remote address of the target socket when one exists, the
/// original hostname in DOMAIN form otherwise; the port bytes are echoed as
/// received.
fn encode_reply(
  rep: u8,
  peer: Option<SocketAddr>,
  fallback_name: &str,
  port_bytes: [u8; 2],
) -> Vec<u8> {
  let mut reply = vec![SOCKS5_VERSION, rep, RSV];
  match peer {
    Some(SocketAddr::V4(addr)) => {
      reply.push(ATYP_IPV4);
      reply.extend_from_slice(&addr.ip().octets());
    }
    Some(SocketAddr::V6(addr)) => {
      reply.push(ATYP_IPV6);
      reply.extend_from_slice(&addr.ip().octets());
    }
    None => {
      let name = &fallback_name.as_bytes()[..fallback_name.len().min(255)];
      reply.push(ATYP_DOMAIN);
      reply.push(name.len() as u8);
      reply.extend_from_slice(name);
    }
  }
  reply.extend_from_slice(&port_bytes);
  reply
}

enum PumpDirection {
  Request,
  Response,
}

async fn run_pumps(
  shared: &Arc<Shared>,
  reader: BufReader<TcpStream>,
  target: BoxedIo,
  conn: &ConnInfo,
) -> Result<()> {
  let client = rewind::unbuffer(reader);
  let (client_read, client_write) = tokio::io::split(client);
  let (target_read, target_write) = tokio::io::split(target);

  let (stop_tx, mut stop_rx) = mpsc::channel::<Error>(2);
  let request_pump = tokio::spawn(pump(
    client_read,
    target_write,
    PumpDirection::Request,
    shared.clone(),
    conn.clone(),
    stop_tx.clone(),
  ));
  let response_pump = tokio::spawn(pump(
    target_read,
    client_write,
    PumpDirection::Response,
    shared.clone(),
    conn.clone(),
    stop_tx,
  ));

  if let Some(e) = stop_rx.recv().await {
    tracing::info!("[conn {}] socks5 relay ended: {}", conn.id, e);
  }
  request_pump.abort();
  response_pump.abort();
  Ok(())
}

async fn pump<R, W>(
  mut source: R,
  mut sink: W,
  direction: PumpDirection,
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
          PumpDirection::Request => shared.events.on_socks5_request(&chunk, &conn).await,
          PumpDirection::Response => shared.events.on_socks5_response(&chunk, &conn).await,
        };
        let outgoing = match hooked {
          Ok(Some(replacement)) => replacement,
          Ok(None) => chunk,
          Err(e) => {
            let _ = stop.send(e).await;
            break;
          }
        };
        let written = async {
          sink.write_all(&outgoing).await?;
          sink.flush().await
        }
        .await;
        if let Err(e) = written {
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

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn reply_encodes_an_ipv4_bound_address() {
    let peer: SocketAddr = "192.0.2.9:443".parse().unwrap();
    let reply = encode_reply(REP_SUCCESS, Some(peer), "unused", [0x01, 0xBB]);
    assert_eq!(
      reply,
      vec![0x05, 0x00, 0x00, 0x01, 192, 0, 2, 9, 0x01, 0xBB]
    );
  }

  #[test]
  fn reply_encodes_an_ipv6_bound_address() {
    let peer: SocketAddr = "[2001:db8::1]:80".parse().unwrap();
    let reply = encode_reply(REP_SUCCESS, Some(peer), "unused", [0x00, 0x50]);
    assert_eq!(reply[0..4], [0x05, 0x00, 0x00, 0x04]);
    assert_eq!(reply.len(), 4 + 16 + 2);
    assert_eq!(reply[20..22], [0x00, 0x50]);
  }

  #[test]
  fn reply_falls_back_to_the_domain_form() {
    let reply = encode_reply(REP_SUCCESS, None, "example.test", [0x1F, 0x90]);
    assert_eq!(reply[0..4], [0x05, 0x00, 0x00, 0x03]);
    assert_eq!(reply[4] as usize, "example.test".len());
    assert_eq!(&reply[5..17], b"example.test");
    assert_eq!(reply[17..19], [0x1F, 0x90]);
  }

  #[test]
  fn failure_reply_keeps_the_received_port() {
    let reply = encode_reply(REP_FAILURE, None, "h", [0xAB, 0xCD]);
    assert_eq!(reply[1], 0x01);
    assert_eq!(reply[reply.len() - 2..], [0xAB, 0xCD]);
  }
}
