//! Programmable intercepting proxy.
//!
//! One listening port, four client protocols: plaintext HTTP, HTTPS through
//! `CONNECT` with dynamic certificate forging, WebSocket (`ws` and `wss`),
//! and SOCKS5. Every flow passes through embedder hooks that may inspect and
//! rewrite payloads before they are forwarded, so the proxy works as a
//! traffic-manipulation library rather than a passive relay.
//!
//! # Example
//!
//! ```no_run
//! use interpose::{LoggingEvents, ProxyServer};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = ProxyServer::builder()
//!         .port("9090")
//!         .events(Arc::new(LoggingEvents))
//!         .build()
//!         .await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! Clients must trust the proxy's root certificate for HTTPS interception;
//! proxied clients can fetch it from `http://shermie-proxy.io/tls`.

mod ca;
mod dialer;
mod dns;
mod error;
mod events;
mod http;
mod message;
mod rewind;
mod server;
mod socks5;
mod tcp;
mod tls;
mod transport;
mod ws;

pub use ca::{CertificateAuthority, CertificateStore, ForgedCert};
pub use dialer::Dialer;
pub use dns::CachedResolver;
pub use error::{Error, Result};
pub use events::{ConnInfo, LoggingEvents, NoopEvents, ProxyEvents};
pub use rewind::Rewind;
pub use server::{ProxyServer, ProxyServerBuilder};

/// Re-exported WebSocket message type used by the frame hooks.
pub use tokio_tungstenite::tungstenite::Message;
