//! Root CA management and on-demand leaf certificate forging.
//!
//! The root key pair is loaded from the storage directory when present and
//! generated there otherwise. Leaf certificates are synthesized per
//! `(host, port)` and cached for the life of the process; the store is the
//! only consumer of the root signing key.

use crate::error::{Error, Result};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Leaf validity period in seconds (1 year)
const LEAF_TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Offset for not_before timestamps to absorb clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;

/// The root certificate authority backing the forge.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  storage_path: PathBuf,
}

impl CertificateAuthority {
  /// Load the CA from `storage_path`, generating and persisting a fresh one
  /// when none exists yet.
  pub async fn load_or_generate(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref().to_path_buf();
    if !storage_path.exists() {
      fs::create_dir_all(&storage_path).await?;
    }

    let cert_path = storage_path.join("ca_cert.pem");
    let key_path = storage_path.join("ca_key.pem");

    let (issuer, ca_cert_der) = if cert_path.exists() && key_path.exists() {
      Self::load(&cert_path, &key_path).await?
    } else {
      Self::generate(&cert_path, &key_path).await?
    };

    Ok(Self {
      issuer,
      ca_cert_der,
      storage_path,
    })
  }

  async fn load(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
    let cert_pem = fs::read_to_string(cert_path).await?;
    let key_pem = fs::read_to_string(key_path).await?;

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::certificate_error(format!("failed to parse CA key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate_error(format!("failed to load CA issuer: {}", e)))?;

    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate_error("no certificate found in CA PEM"))?
      .map_err(|e| Error::certificate_error(format!("failed to parse CA PEM: {}", e)))?;

    Ok((issuer, cert_der))
  }

  async fn generate(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Interpose Root CA");
    dn.push(DnType::OrganizationName, "Interpose");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(3650);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("failed to generate CA key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate_error(format!("failed to self-sign CA: {}", e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    let mut cert_file = fs::File::create(cert_path).await?;
    cert_file.write_all(cert_pem.as_bytes()).await?;
    let mut key_file = fs::File::create(key_path).await?;
    key_file.write_all(key_pem.as_bytes()).await?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate_error(format!("failed to create CA issuer: {}", e)))?;

    Ok((issuer, cert_der))
  }

  /// Forge a leaf certificate for `host`, signed by this root.
  /// The chain is `[leaf, root]`.
  fn forge_leaf(
    &self,
    host: &str,
  ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    // IP targets get both an iPAddress and a dNSName SAN; strict clients
    // check one or the other.
    params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = host.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::certificate_error(format!("invalid domain name: {}", host))
      })?)]
    };

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(LEAF_TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("failed to generate leaf key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate_error(format!("failed to sign leaf for {}: {}", host, e)))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate_error("failed to serialize leaf key"))?;

    Ok((vec![cert_der, self.ca_cert_der.clone()], key_der))
  }

  /// Root certificate in DER form, as served by the download endpoint.
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }

  /// Root certificate in PEM form for manual trust-store installation.
  pub fn ca_cert_pem(&self) -> Result<String> {
    let path = self.storage_path.join("ca_cert.pem");
    std::fs::read_to_string(&path)
      .map_err(|e| Error::certificate_error(format!("failed to read CA cert: {}", e)))
  }

  /// Path of the persisted root certificate.
  pub fn ca_cert_path(&self) -> PathBuf {
    self.storage_path.join("ca_cert.pem")
  }
}

/// A forged leaf certificate with its private key.
pub struct ForgedCert {
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
}

impl ForgedCert {
  /// The presented chain, leaf first.
  pub fn chain(&self) -> &[CertificateDer<'static>] {
    &self.chain
  }

  /// Clone chain and key for handing to a TLS acceptor.
  pub fn clone_parts(&self) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
    (self.chain.clone(), self.key.clone_key())
  }
}

/// Process-lived forge: at most one certificate ever exists per
/// `(host, port)`, and entries are never evicted.
pub struct CertificateStore {
  ca: CertificateAuthority,
  cache: Cache<String, Arc<ForgedCert>>,
}

impl CertificateStore {
  /// Create a store backed by the CA at `storage_path`.
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let ca = CertificateAuthority::load_or_generate(storage_path).await?;
    Ok(Self {
      ca,
      cache: Cache::builder().build(),
    })
  }

  /// Fetch or forge the certificate for `(host, port)`. Concurrent callers
  /// for the same key share a single forging pass.
  pub async fn get(&self, host: &str, port: Option<u16>) -> Result<Arc<ForgedCert>> {
    let key = cache_key(host, port);
    let host = host.to_string();
    self
      .cache
      .try_get_with(key, async {
        let (chain, key) = self.ca.forge_leaf(&host)?;
        Ok(Arc::new(ForgedCert { chain, key }))
      })
      .await
      .map_err(|e: Arc<Error>| Error::Certificate(e.to_string()))
  }

  /// Root certificate in DER form.
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    self.ca.ca_cert_der()
  }

  /// Root certificate in PEM form.
  pub fn ca_cert_pem(&self) -> Result<String> {
    self.ca.ca_cert_pem()
  }

  /// Path of the persisted root certificate.
  pub fn ca_cert_path(&self) -> PathBuf {
    self.ca.ca_cert_path()
  }
}

/// Canonical cache key: lowercase host plus numeric port, `-1` when the port
/// is unknown.
fn cache_key(host: &str, port: Option<u16>) -> String {
  match port {
    Some(p) => format!("{}:{}", host.to_ascii_lowercase(), p),
    None => format!("{}:-1", host.to_ascii_lowercase()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn temp_store_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("interpose-ca-test-{}-{}", tag, std::process::id()))
  }

  #[test]
  fn cache_keys_are_canonical() {
    assert_eq!(cache_key("Example.TEST", Some(443)), "example.test:443");
    assert_eq!(cache_key("example.test", None), "example.test:-1");
  }

  #[tokio::test]
  async fn forging_is_memoized_per_host_port() {
    let path = temp_store_path("memo");
    let store = CertificateStore::new(&path).await.unwrap();

    let first = store.get("example.test", Some(443)).await.unwrap();
    let second = store.get("example.test", Some(443)).await.unwrap();
    assert_eq!(first.chain()[0].as_ref(), second.chain()[0].as_ref());

    // a different port is a different identity
    let other = store.get("example.test", Some(8443)).await.unwrap();
    assert_ne!(first.chain()[0].as_ref(), other.chain()[0].as_ref());

    std::fs::remove_dir_all(&path).ok();
  }

  #[tokio::test]
  async fn leaf_carries_the_requested_host() {
    let path = temp_store_path("cn");
    let store = CertificateStore::new(&path).await.unwrap();

    let forged = store.get("example.test", Some(443)).await.unwrap();
    let leaf = forged.chain()[0].as_ref();
    let needle = b"example.test";
    assert!(
      leaf.windows(needle.len()).any(|w| w == needle),
      "leaf DER does not name the host"
    );
    // chain is [leaf, root]
    assert_eq!(forged.chain().len(), 2);
    assert_eq!(forged.chain()[1].as_ref(), store.ca_cert_der().as_ref());

    std::fs::remove_dir_all(&path).ok();
  }

  #[tokio::test]
  async fn ca_material_round_trips_through_storage() {
    let path = temp_store_path("persist");
    std::fs::remove_dir_all(&path).ok();

    let first = CertificateStore::new(&path).await.unwrap();
    let der = first.ca_cert_der().as_ref().to_vec();
    let pem = first.ca_cert_pem().unwrap();
    assert!(pem.contains("BEGIN CERTIFICATE"));
    drop(first);

    let second = CertificateStore::new(&path).await.unwrap();
    assert_eq!(second.ca_cert_der().as_ref(), der.as_slice());

    std::fs::remove_dir_all(&path).ok();
  }
}
