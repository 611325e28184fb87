//! Certificate Authority (CA) management for the intercepting proxy
//!
//! A self-signed root CA is generated on first use (or loaded from the
//! certificate directory) and signs one leaf certificate per intercepted
//! host. Leaves are persisted as `<host>.crt` / `<host>.key` and reused for
//! the life of the CA; deleting the directory is the only way to rotate them.
//!

use crate::errors::{Error, Result};
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
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

/// Leaf certificate validity period in seconds (1 year)
const TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;
/// Root CA file names inside the certificate directory
const CA_CERT_FILE: &str = "ca.crt";
const CA_KEY_FILE: &str = "ca.key";

/// Certificate Authority for generating certificates
pub struct CertificateAuthority {
  /// Root CA issuer
  issuer: Issuer<'static, KeyPair>,
  /// Root CA certificate in DER format
  ca_cert_der: CertificateDer<'static>,
  /// Storage path for certificates
  storage_path: PathBuf,
}

impl CertificateAuthority {
  /// Create a new Certificate Authority
  ///
  /// If a CA already exists at the storage path, it will be loaded.
  /// Otherwise, a new CA will be generated.
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref().to_path_buf();
    fs::create_dir_all(&storage_path).await.map_err(|e| {
      Error::certificate_error(format!(
        "Failed to create certificate directory {}: {}",
        storage_path.display(),
        e
      ))
    })?;

    let ca_cert_path = storage_path.join(CA_CERT_FILE);
    let ca_key_path = storage_path.join(CA_KEY_FILE);

    let (issuer, ca_cert_der) = if ca_cert_path.exists() && ca_key_path.exists() {
      tracing::debug!("[CA] Loading root CA from {}", ca_cert_path.display());
      Self::load_ca(&ca_cert_path, &ca_key_path).await?
    } else {
      tracing::info!("[CA] Generating root CA at {}", ca_cert_path.display());
      Self::generate_ca(&ca_cert_path, &ca_key_path).await?
    };

    Ok(Self {
      issuer,
      ca_cert_der,
      storage_path,
    })
  }

  /// Load existing CA certificate and key
  async fn load_ca(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
    let cert_pem = fs::read_to_string(cert_path).await?;
    let key_pem = fs::read_to_string(key_path).await?;

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::certificate_error(format!("Failed to parse CA key: {}", e)))?;

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair).map_err(|e| {
      Error::certificate_error(format!("Failed to create issuer from CA cert: {}", e))
    })?;

    let cert_der = first_cert(cert_pem.as_bytes())?;
    Ok((issuer, cert_der))
  }

  /// Generate a new CA certificate and key
  async fn generate_ca(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Stream Proxy CA");
    dn.push(DnType::OrganizationName, "Stream Proxy");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::CrlSign,
      KeyUsagePurpose::DigitalSignature,
    ];

    // Set validity period (10 years)
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(3650);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;

    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to generate CA: {}", e)))?;

    let cert_pem = cert.pem();
    write_pem(cert_path, &cert_pem).await?;
    write_pem(key_path, &key_pair.serialize_pem()).await?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to create issuer: {}", e)))?;
    Ok((issuer, cert_der))
  }

  /// Generate a leaf certificate for `domain` signed by this CA.
  ///
  /// Returns the PEM encoded certificate and private key.
  pub fn generate_server_cert(&self, domain: &str) -> Result<(String, String)> {
    let mut params = CertificateParams::default();

    // Random serial so re-issued leaves never collide in browser caches
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, domain);
    params.distinguished_name = dn;

    params.subject_alt_names = if let Ok(ip) = domain.parse::<IpAddr>() {
      vec![SanType::IpAddress(ip)]
    } else {
      vec![SanType::DnsName(domain.try_into().map_err(|_| {
        Error::certificate_error(format!("Invalid domain name: {}", domain))
      })?)]
    };
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;

    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate_error(format!("Failed to sign server cert: {}", e)))?;

    Ok((cert.pem(), key_pair.serialize_pem()))
  }

  /// Root CA certificate in DER format
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }

  /// Get CA certificate in PEM format for client installation
  pub fn ca_cert_pem(&self) -> Result<String> {
    std::fs::read_to_string(self.ca_cert_path())
      .map_err(|e| Error::certificate_error(format!("Failed to read CA cert: {}", e)))
  }

  /// Get CA certificate path
  pub fn ca_cert_path(&self) -> PathBuf {
    self.storage_path.join(CA_CERT_FILE)
  }

  /// Directory the CA and its leaves live in
  pub fn storage_path(&self) -> &Path {
    &self.storage_path
  }
}

/// One host's leaf certificate on disk, plus the TLS server config built from it.
pub struct CertRecord {
  /// Host the certificate was issued for
  pub host: String,
  /// PEM certificate path (`<host>.crt`)
  pub cert_path: PathBuf,
  /// PEM private key path (`<host>.key`)
  pub key_path: PathBuf,
  server_config: Arc<ServerConfig>,
}

impl CertRecord {
  /// TLS server configuration presenting this leaf (and the root CA) to clients.
  pub fn server_config(&self) -> Arc<ServerConfig> {
    self.server_config.clone()
  }
}

impl std::fmt::Debug for CertRecord {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CertRecord")
      .field("host", &self.host)
      .field("cert_path", &self.cert_path)
      .field("key_path", &self.key_path)
      .finish()
  }
}

/// Issues and caches per-host leaf certificates.
///
/// Concurrent `ensure_cert` calls for the same host share one generation.
pub struct CertificateManager {
  ca: CertificateAuthority,
  records: Cache<String, Arc<CertRecord>>,
}

impl CertificateManager {
  /// Create a new certificate manager rooted at `storage_path`
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let ca = CertificateAuthority::new(storage_path).await?;
    // Leaves live as long as the CA, so no TTL.
    let records = Cache::builder().max_capacity(10_000).build();
    Ok(Self { ca, records })
  }

  /// Make sure a leaf certificate for `host` exists and return its record.
  ///
  /// The first call for a host loads `<host>.crt`/`<host>.key` if they are
  /// already on disk and otherwise issues and writes them; later calls are
  /// served from memory. Failing to write is an error, not a skip.
  pub async fn ensure_cert(&self, host: &str) -> Result<Arc<CertRecord>> {
    validate_host(host)?;
    self
      .records
      .try_get_with(host.to_string(), self.load_or_issue(host))
      .await
      .map_err(|e: Arc<Error>| Error::certificate_error(format!("{}: {}", host, e)))
  }

  async fn load_or_issue(&self, host: &str) -> Result<Arc<CertRecord>> {
    let dir = self.ca.storage_path();
    let cert_path = dir.join(format!("{}.crt", host));
    let key_path = dir.join(format!("{}.key", host));

    let (cert_pem, key_pem) = if cert_path.exists() && key_path.exists() {
      tracing::debug!("[CA] Reusing certificate for {}", host);
      (
        fs::read_to_string(&cert_path).await?,
        fs::read_to_string(&key_path).await?,
      )
    } else {
      tracing::info!("[CA] Issuing certificate for {}", host);
      let (cert_pem, key_pem) = self.ca.generate_server_cert(host)?;
      write_pem(&key_path, &key_pem).await?;
      write_pem(&cert_path, &cert_pem).await?;
      (cert_pem, key_pem)
    };

    let leaf = first_cert(cert_pem.as_bytes())?;
    let key = private_key(key_pem.as_bytes())?;
    let server_config = server_config(vec![leaf, self.ca.ca_cert_der().clone()], key)?;

    Ok(Arc::new(CertRecord {
      host: host.to_string(),
      cert_path,
      key_path,
      server_config,
    }))
  }

  /// Get the CA certificate in PEM format
  pub fn ca_cert_pem(&self) -> Result<String> {
    self.ca.ca_cert_pem()
  }

  /// Get the CA certificate path
  pub fn ca_cert_path(&self) -> PathBuf {
    self.ca.ca_cert_path()
  }
}

/// Build the TLS server side used toward the browser.
///
/// ALPN is pinned to HTTP/1.1: the relay only understands HTTP/1.x framing.
pub fn server_config(
  cert_chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>> {
  let mut config = ServerConfig::builder_with_provider(crate::connector::crypto_provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls_error(format!("Failed to select TLS versions: {}", e)))?
    .with_no_client_auth()
    .with_single_cert(cert_chain, key)
    .map_err(|e| Error::tls_error(format!("Failed to create TLS config: {}", e)))?;
  config.alpn_protocols = vec![b"http/1.1".to_vec()];
  Ok(Arc::new(config))
}

/// Hostnames become file names, so only accept what a DNS name or IP literal can contain.
fn validate_host(host: &str) -> Result<()> {
  let valid = !host.is_empty()
    && host.len() <= 253
    && !host.starts_with('.')
    && !host.contains("..")
    && host
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':'));
  if valid {
    Ok(())
  } else {
    Err(Error::invalid_request(format!("Invalid host for certificate: {:?}", host)))
  }
}

async fn write_pem(path: &Path, pem: &str) -> Result<()> {
  fs::write(path, pem.as_bytes()).await.map_err(|e| {
    Error::certificate_error(format!("Failed to write {}: {}", path.display(), e))
  })
}

fn first_cert(mut pem: &[u8]) -> Result<CertificateDer<'static>> {
  rustls_pemfile::certs(&mut pem)
    .next()
    .ok_or_else(|| Error::certificate_error("No certificate found in PEM"))?
    .map_err(|e| Error::certificate_error(format!("Failed to parse PEM: {}", e)))
}

fn private_key(mut pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
  rustls_pemfile::private_key(&mut pem)
    .map_err(|e| Error::certificate_error(format!("Failed to parse key PEM: {}", e)))?
    .ok_or_else(|| Error::certificate_error("No private key found in PEM"))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("stream-proxy-ca-{}-{}", name, std::process::id()));
    std::fs::remove_dir_all(&dir).ok();
    dir
  }

  #[tokio::test]
  async fn ca_is_generated_then_reloaded() {
    let dir = temp_dir("reload");
    let first = CertificateAuthority::new(&dir).await.unwrap();
    let pem = first.ca_cert_pem().unwrap();
    assert!(pem.contains("BEGIN CERTIFICATE"));
    assert!(dir.join(CA_KEY_FILE).exists());

    let second = CertificateAuthority::new(&dir).await.unwrap();
    assert_eq!(first.ca_cert_der(), second.ca_cert_der());
    assert_eq!(second.ca_cert_pem().unwrap(), pem);
    std::fs::remove_dir_all(&dir).ok();
  }

  #[tokio::test]
  async fn leaf_files_are_written_per_host() {
    let dir = temp_dir("leaf");
    let manager = CertificateManager::new(&dir).await.unwrap();
    let record = manager.ensure_cert("api.example.com").await.unwrap();
    assert_eq!(record.cert_path, dir.join("api.example.com.crt"));
    assert_eq!(record.key_path, dir.join("api.example.com.key"));
    assert!(record.cert_path.exists());
    assert!(record.key_path.exists());
    assert_eq!(record.server_config().alpn_protocols, vec![b"http/1.1".to_vec()]);
    std::fs::remove_dir_all(&dir).ok();
  }

  #[tokio::test]
  async fn leaves_survive_a_restart() {
    let dir = temp_dir("restart");
    let key = {
      let manager = CertificateManager::new(&dir).await.unwrap();
      let record = manager.ensure_cert("reuse.example.com").await.unwrap();
      std::fs::read(&record.key_path).unwrap()
    };
    let manager = CertificateManager::new(&dir).await.unwrap();
    let record = manager.ensure_cert("reuse.example.com").await.unwrap();
    assert_eq!(std::fs::read(&record.key_path).unwrap(), key);
    std::fs::remove_dir_all(&dir).ok();
  }

  #[tokio::test]
  async fn concurrent_ensure_issues_once() {
    let dir = temp_dir("race");
    let manager = Arc::new(CertificateManager::new(&dir).await.unwrap());
    let tasks: Vec<_> = (0..8)
      .map(|_| {
        let manager = manager.clone();
        tokio::spawn(async move { manager.ensure_cert("race.example.com").await.unwrap() })
      })
      .collect();
    let mut records = Vec::new();
    for task in tasks {
      records.push(task.await.unwrap());
    }
    let key = std::fs::read(&records[0].key_path).unwrap();
    let expected = private_key(&key).unwrap();
    for record in &records {
      assert!(Arc::ptr_eq(record, &records[0]));
    }
    assert_eq!(
      private_key(&std::fs::read(&records[7].key_path).unwrap()).unwrap().secret_der(),
      expected.secret_der()
    );
    std::fs::remove_dir_all(&dir).ok();
  }

  #[tokio::test]
  async fn ip_literal_gets_ip_san() {
    let dir = temp_dir("ip");
    let manager = CertificateManager::new(&dir).await.unwrap();
    assert!(manager.ensure_cert("127.0.0.1").await.is_ok());
    std::fs::remove_dir_all(&dir).ok();
  }

  #[tokio::test]
  async fn path_like_hosts_are_rejected() {
    let dir = temp_dir("reject");
    let manager = CertificateManager::new(&dir).await.unwrap();
    for host in ["../etc/passwd", "a/b", "", ".hidden", "a..b"] {
      assert!(manager.ensure_cert(host).await.is_err(), "{host:?} accepted");
    }
    std::fs::remove_dir_all(&dir).ok();
  }
}
