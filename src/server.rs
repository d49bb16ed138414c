//! Single-port acceptor and protocol demultiplexer.
//!
//! Five workers share one listener and hand every accepted connection to its
//! own task. The first peeked byte selects the interceptor; the peeked bytes
//! stay buffered for whichever interceptor wins.

use crate::ca::CertificateStore;
use crate::dialer::Dialer;
use crate::dns::CachedResolver;
use crate::error::Result;
use crate::events::{ConnInfo, NoopEvents, ProxyEvents};
use crate::transport::Transport;
use crate::{http, socks5, tcp};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

/// Parallel accept workers; softens accept-queue starvation under bursts on
/// platforms where accept is serialized.
const ACCEPT_WORKERS: usize = 5;
/// Pause after a transient accept failure.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

static START: Once = Once::new();
static CONN_SEQ: AtomicU64 = AtomicU64::new(1);

/// Process-wide one-time initialization, guarded so repeated servers in one
/// process do not repeat it.
fn init_process() {
  START.call_once(|| {
    let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();
    tracing::info!("interpose {} starting", env!("CARGO_PKG_VERSION"));
  });
}

/// Shared, read-only state every interceptor works against.
pub(crate) struct Shared {
  pub(crate) config: ProxyConfig,
  pub(crate) events: Arc<dyn ProxyEvents>,
  pub(crate) certs: CertificateStore,
  pub(crate) dialer: Dialer,
  pub(crate) transport: Transport,
}

/// Read-only configuration snapshot taken at construction.
pub(crate) struct ProxyConfig {
  pub(crate) port: String,
  pub(crate) upstream_proxy: Option<String>,
  pub(crate) to: Option<String>,
  pub(crate) network: String,
}

/// Interceptor selection for an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
  Http,
  Socks5,
  RawTcp,
}

/// Classify a connection by its first byte: ASCII method initials go to the
/// HTTP interceptor, the SOCKS5 version byte to SOCKS5, everything else to
/// the raw passthrough.
pub(crate) fn route_of(first: u8) -> Route {
  match first {
    b'G' | b'P' | b'D' | b'O' | b'H' | b'C' => Route::Http,
    0x05 => Route::Socks5,
    _ => Route::RawTcp,
  }
}

/// Builder for [`ProxyServer`].
pub struct ProxyServerBuilder {
  port: String,
  nagle: bool,
  upstream_proxy: Option<String>,
  to: Option<String>,
  network: String,
  ca_storage_path: PathBuf,
  events: Option<Arc<dyn ProxyEvents>>,
}

impl Default for ProxyServerBuilder {
  fn default() -> Self {
    Self {
      port: "8080".to_string(),
      nagle: false,
      upstream_proxy: None,
      to: None,
      network: "tcp".to_string(),
      ca_storage_path: PathBuf::from(".interpose"),
      events: None,
    }
  }
}

impl ProxyServerBuilder {
  /// Listening port, bound on all interfaces.
  pub fn port(mut self, port: impl Into<String>) -> Self {
    self.port = port.into();
    self
  }

  /// Enable Nagle's algorithm on outbound sockets (clears `TCP_NODELAY`).
  pub fn nagle(mut self, nagle: bool) -> Self {
    self.nagle = nagle;
    self
  }

  /// Forward through an upstream proxy at `host:port` instead of dialing
  /// targets directly.
  pub fn upstream_proxy(mut self, addr: impl Into<String>) -> Self {
    let addr = addr.into();
    self.upstream_proxy = if addr.is_empty() { None } else { Some(addr) };
    self
  }

  /// Forward target for the raw TCP passthrough path.
  pub fn to(mut self, addr: impl Into<String>) -> Self {
    let addr = addr.into();
    self.to = if addr.is_empty() { None } else { Some(addr) };
    self
  }

  /// Reserved transport selector, carried for configuration compatibility.
  pub fn network(mut self, network: impl Into<String>) -> Self {
    self.network = network.into();
    self
  }

  /// Directory holding the root CA material.
  pub fn ca_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
    self.ca_storage_path = path.into();
    self
  }

  /// Install the embedder hook table.
  pub fn events(mut self, events: Arc<dyn ProxyEvents>) -> Self {
    self.events = Some(events);
    self
  }

  /// Build the server: sets up the DNS cache, the dialer and the certificate
  /// store (loading or generating the root CA).
  pub async fn build(self) -> Result<ProxyServer> {
    let resolver = CachedResolver::system()?;
    let dialer = Dialer::new(resolver, self.nagle);
    let certs = CertificateStore::new(&self.ca_storage_path).await?;
    let transport = Transport::new(dialer.clone(), self.upstream_proxy.clone());
    let events = self.events.unwrap_or_else(|| Arc::new(NoopEvents));

    Ok(ProxyServer {
      shared: Arc::new(Shared {
        config: ProxyConfig {
          port: self.port,
          upstream_proxy: self.upstream_proxy,
          to: self.to,
          network: self.network,
        },
        events,
        certs,
        dialer,
        transport,
      }),
    })
  }
}

/// The intercepting proxy server.
pub struct ProxyServer {
  shared: Arc<Shared>,
}

impl ProxyServer {
  /// Start building a server.
  pub fn builder() -> ProxyServerBuilder {
    ProxyServerBuilder::default()
  }

  /// Root certificate in PEM form for manual trust-store installation.
  pub fn ca_cert_pem(&self) -> Result<String> {
    self.shared.certs.ca_cert_pem()
  }

  /// Root certificate in DER form, as served by the download endpoint.
  pub fn ca_cert_der(&self) -> Vec<u8> {
    self.shared.certs.ca_cert_der().as_ref().to_vec()
  }

  /// Path of the persisted root certificate.
  pub fn ca_cert_path(&self) -> PathBuf {
    self.shared.certs.ca_cert_path()
  }

  /// Bind the listener on `0.0.0.0:<port>`.
  pub async fn listen(&self) -> Result<TcpListener> {
    init_process();
    let addr = format!("0.0.0.0:{}", self.shared.config.port);
    let listener = TcpListener::bind(&addr).await?;
    Ok(listener)
  }

  /// Accept and dispatch connections on `listener` forever.
  pub async fn serve(&self, listener: TcpListener) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
      tracing::info!(
        network = %self.shared.config.network,
        upstream = self.shared.config.upstream_proxy.as_deref().unwrap_or("-"),
        "listening on {}",
        addr
      );
    }
    let listener = Arc::new(listener);
    let mut workers = JoinSet::new();
    for _ in 0..ACCEPT_WORKERS {
      let listener = listener.clone();
      let shared = self.shared.clone();
      workers.spawn(async move {
        loop {
          match listener.accept().await {
            Ok((stream, peer)) => {
              tokio::spawn(shared.clone().handle(stream, peer));
            }
            Err(e) if is_transient_accept(&e) => {
              tracing::warn!("accept timed out: {}", e);
              tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
            Err(e) => {
              tracing::error!("accept failed: {}", e);
            }
          }
        }
      });
    }
    while workers.join_next().await.is_some() {}
    Ok(())
  }

  /// Bind and serve.
  pub async fn run(&self) -> Result<()> {
    let listener = self.listen().await?;
    self.serve(listener).await
  }
}

fn is_transient_accept(e: &io::Error) -> bool {
  matches!(
    e.kind(),
    io::ErrorKind::WouldBlock
      | io::ErrorKind::TimedOut
      | io::ErrorKind::Interrupted
      | io::ErrorKind::ConnectionAborted
      | io::ErrorKind::ConnectionReset
  )
}

impl Shared {
  /// Serve one accepted connection: connect hook, peek, dispatch, close hook.
  /// The close hook fires exactly once, after everything else, and the socket
  /// drops with this frame.
  async fn handle(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
    let local = stream
      .local_addr()
      .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
    let info = ConnInfo {
      id: CONN_SEQ.fetch_add(1, Ordering::Relaxed),
      peer_addr: peer,
      local_addr: local,
    };

    self.events.on_tcp_connect(&info).await;

    let mut reader = BufReader::new(stream);
    match reader.fill_buf().await {
      Ok(peek) if !peek.is_empty() => {
        let result = match route_of(peek[0]) {
          Route::Http => http::handle(&self, reader, &info).await,
          Route::Socks5 => socks5::handle(&self, reader, &info).await,
          Route::RawTcp => tcp::handle(&self, reader, &info).await,
        };
        if let Err(e) = result {
          if e.is_disconnect() {
            tracing::debug!("[conn {}] peer went away: {}", info.id, e);
          } else {
            tracing::error!("[conn {}] {}", info.id, e);
          }
        }
      }
      // peek failure: close silently
      _ => {}
    }

    self.events.on_tcp_close(&info).await;
  }
}
