//! Error types for the proxy engine

use std::io;
use thiserror::Error;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for proxy operations
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// Certificate error
  #[error("Certificate error: {0}")]
  Certificate(String),

  /// TLS error
  #[error("TLS error: {0}")]
  Tls(String),

  /// HTTP building/parsing error
  #[error("HTTP error: {0}")]
  Http(http::Error),

  /// WebSocket error
  #[error("WebSocket error: {0}")]
  WebSocket(tokio_tungstenite::tungstenite::Error),

  /// DNS resolution error
  #[error("Resolve error: {0}")]
  Resolve(String),

  /// Proxy protocol error
  #[error("Proxy error: {0}")]
  Proxy(String),

  /// Invalid request
  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  /// Connection error
  #[error("Connection error: {0}")]
  Connection(String),

  /// Other errors
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("Certificate error: {}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls_error(msg: impl Into<String>) -> Self {
    let error = Error::Tls(msg.into());
    tracing::error!("TLS error: {}", error);
    error
  }

  /// Create a resolve error and log it
  pub fn resolve_error(msg: impl Into<String>) -> Self {
    let error = Error::Resolve(msg.into());
    tracing::error!("Resolve error: {}", error);
    error
  }

  /// Create a proxy error and log it
  pub fn proxy_error(msg: impl Into<String>) -> Self {
    let error = Error::Proxy(msg.into());
    tracing::error!("Proxy error: {}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::error!("Invalid request: {}", error);
    error
  }

  /// Create a connection error and log it
  pub fn connection_error(msg: impl Into<String>) -> Self {
    let error = Error::Connection(msg.into());
    tracing::error!("Connection error: {}", error);
    error
  }

  /// Create a timeout error mapped onto the IO taxonomy
  pub fn timeout(what: impl Into<String>) -> Self {
    Error::Io(io::Error::new(io::ErrorKind::TimedOut, what.into()))
  }

  /// Create an other error and log it
  pub fn other(msg: impl Into<String>) -> Self {
    let error = Error::Other(msg.into());
    tracing::error!("Error: {}", error);
    error
  }

  /// True when the error is end-of-stream or a peer that went away, the
  /// cases the dispatcher closes without noise.
  pub fn is_disconnect(&self) -> bool {
    match self {
      Error::Io(e) => matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
          | io::ErrorKind::ConnectionReset
          | io::ErrorKind::ConnectionAborted
          | io::ErrorKind::BrokenPipe
      ),
      _ => false,
    }
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    Error::Io(value)
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    let error = Error::Http(value);
    tracing::error!("HTTP error: {}", error);
    error
  }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
  fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
    Error::WebSocket(value)
  }
}
