//! Hostname resolution with a coarse process-wide cache.
//!
//! Lookups go through hickory's async resolver; results are cached for a few
//! minutes so repeated dials to the same host skip the network. IP literals
//! bypass resolution entirely.

use crate::error::{Error, Result};
use hickory_resolver::TokioResolver;
use moka::future::Cache;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// How long a resolved address list stays valid.
const DNS_TTL: Duration = Duration::from_secs(5 * 60);

/// A caching DNS resolver shared by every outbound dial.
#[derive(Clone)]
pub struct CachedResolver {
  inner: Arc<TokioResolver>,
  cache: Cache<String, Arc<Vec<IpAddr>>>,
}

impl CachedResolver {
  /// Create a resolver using the system DNS configuration.
  pub fn system() -> Result<Self> {
    let resolver = TokioResolver::builder_tokio()
      .map_err(|e| Error::resolve_error(e.to_string()))?
      .build();
    Ok(Self {
      inner: Arc::new(resolver),
      cache: Cache::builder().time_to_live(DNS_TTL).build(),
    })
  }

  /// Resolve `host` to its address list, consulting the cache first.
  /// At most one lookup per hostname is in flight at a time.
  pub async fn lookup(&self, host: &str) -> Result<Arc<Vec<IpAddr>>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
      return Ok(Arc::new(vec![ip]));
    }
    let inner = self.inner.clone();
    let name = host.to_string();
    self
      .cache
      .try_get_with(name.clone(), async move {
        let lookup = inner
          .lookup_ip(name.as_str())
          .await
          .map_err(|e| Error::resolve_error(format!("lookup {} failed: {}", name, e)))?;
        let addrs: Vec<IpAddr> = lookup.iter().collect();
        if addrs.is_empty() {
          return Err(Error::resolve_error(format!("no addresses for {}", name)));
        }
        Ok(Arc::new(addrs))
      })
      .await
      .map_err(|e: Arc<Error>| Error::Resolve(e.to_string()))
  }

  /// Resolve `host` and pick the dial address: the first IPv4 entry, or the
  /// first entry of any family when no IPv4 address exists.
  pub async fn resolve_one(&self, host: &str) -> Result<IpAddr> {
    let addrs = self.lookup(host).await?;
    Ok(prefer_ipv4(&addrs))
  }
}

fn prefer_ipv4(addrs: &[IpAddr]) -> IpAddr {
  addrs
    .iter()
    .find(|ip| ip.is_ipv4())
    .copied()
    .unwrap_or(addrs[0])
}

impl std::fmt::Debug for CachedResolver {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CachedResolver").finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ipv4_is_preferred_over_ipv6() {
    let addrs: Vec<IpAddr> = vec![
      "2001:db8::1".parse().unwrap(),
      "192.0.2.7".parse().unwrap(),
      "192.0.2.8".parse().unwrap(),
    ];
    assert_eq!(prefer_ipv4(&addrs), "192.0.2.7".parse::<IpAddr>().unwrap());
  }

  #[test]
  fn falls_back_to_whatever_exists() {
    let addrs: Vec<IpAddr> = vec!["2001:db8::1".parse().unwrap()];
    assert_eq!(prefer_ipv4(&addrs), addrs[0]);
  }

  #[tokio::test]
  async fn ip_literals_bypass_resolution() {
    let resolver = CachedResolver::system().unwrap();
    let addr = resolver.resolve_one("127.0.0.1").await.unwrap();
    assert_eq!(addr, "127.0.0.1".parse::<IpAddr>().unwrap());
  }
}
