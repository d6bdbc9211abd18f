//! Local root authority forging per-hostname leaf certificates

use crate::config::settings::CaConfig;
use crate::error::{Error, Result};
use crate::tls::cache::LeafCache;
use crate::tls::store::{encode_pem, FileRootStore, RootStore};
use async_trait::async_trait;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, PKCS_ECDSA_P256_SHA256,
};
use rustls::{Certificate as RustlsCertificate, PrivateKey};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

const DAY: u64 = 24 * 60 * 60;

/// A forged certificate for one hostname, ready to present in a handshake
#[derive(Debug, Clone)]
pub struct LeafCertificate {
    hostname: String,
    chain: Vec<RustlsCertificate>,
    key: PrivateKey,
    issued_at: SystemTime,
    not_after: SystemTime,
}

impl LeafCertificate {
    pub fn new(
        hostname: String,
        chain: Vec<RustlsCertificate>,
        key: PrivateKey,
        issued_at: SystemTime,
        not_after: SystemTime,
    ) -> Self {
        Self {
            hostname,
            chain,
            key,
            issued_at,
            not_after,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// `[leaf, root]`
    pub fn chain(&self) -> &[RustlsCertificate] {
        &self.chain
    }

    pub fn leaf_der(&self) -> Option<&[u8]> {
        self.chain.first().map(|cert| cert.0.as_slice())
    }

    pub fn key(&self) -> &PrivateKey {
        &self.key
    }

    pub fn issued_at(&self) -> SystemTime {
        self.issued_at
    }

    pub fn not_after(&self) -> SystemTime {
        self.not_after
    }
}

/// Certificate selection strategy consumed by the TLS terminator
#[async_trait]
pub trait LeafIssuer: Send + Sync {
    async fn issue_leaf(&self, hostname: &str) -> Result<Arc<LeafCertificate>>;
}

/// Normalized certificate subject
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectName {
    Dns(String),
    Ip(IpAddr),
}

impl SubjectName {
    pub fn as_key(&self) -> String {
        match self {
            SubjectName::Dns(name) => name.clone(),
            SubjectName::Ip(ip) => ip.to_string(),
        }
    }

    fn san(&self) -> SanType {
        match self {
            SubjectName::Dns(name) => SanType::DnsName(name.clone()),
            SubjectName::Ip(ip) => SanType::IpAddress(*ip),
        }
    }
}

/// Trim, lowercase and strip the trailing dot, then check DNS label syntax.
/// IP literals (bracketed or not) are accepted as-is.
pub fn normalize_hostname(hostname: &str) -> Result<SubjectName> {
    let trimmed = hostname.trim();
    let unbracketed = trimmed.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = unbracketed.parse::<IpAddr>() {
        return Ok(SubjectName::Ip(ip));
    }

    let name = trimmed.trim_end_matches('.').to_ascii_lowercase();
    let invalid = || Error::InvalidName(hostname.to_string());

    if name.is_empty() || name.len() > 253 {
        return Err(invalid());
    }
    for label in name.split('.') {
        let valid = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
        if !valid {
            return Err(invalid());
        }
    }

    Ok(SubjectName::Dns(name))
}

/// Owns the root key and certificate; issues and caches leaves.
pub struct CertificateAuthority {
    root: Certificate,
    root_der: Vec<u8>,
    cache: LeafCache,
    leaf_validity: Duration,
    signed: AtomicU64,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cached", &self.cache.len())
            .field("signed", &self.signed_count())
            .finish()
    }
}

impl CertificateAuthority {
    /// Load the root from the configured storage directory, creating it if absent
    pub fn from_config(config: &CaConfig) -> Result<Self> {
        let store = FileRootStore::new(&config.storage_dir, &config.key_file, &config.cert_file);
        Self::init(&store, config)
    }

    /// Load the root from `store`, or generate and persist a new one.
    ///
    /// Storage is written only when something had to be generated.
    pub fn init(store: &dyn RootStore, config: &CaConfig) -> Result<Self> {
        let (root, root_der) = match store.load_root()? {
            Some(artifacts) => {
                let key_pair = KeyPair::from_der(&artifacts.key_der)?;
                match artifacts.cert_der {
                    Some(cert_der) => {
                        let pem = encode_pem("CERTIFICATE", &cert_der);
                        let params = CertificateParams::from_ca_cert_pem(&pem, key_pair)?;
                        let root = Certificate::from_params(params)?;
                        info!("📜 Loaded root authority from {}", store.describe());
                        (root, cert_der)
                    }
                    None => {
                        let root = Certificate::from_params(root_params(config, Some(key_pair)))?;
                        let cert_der = root.serialize_der()?;
                        store.save_root(&artifacts.key_der, &cert_der)?;
                        info!("📜 Rebuilt root certificate for existing key in {}", store.describe());
                        (root, cert_der)
                    }
                }
            }
            None => {
                info!("🔧 Generating new root authority");
                info!("   Organization: {}", config.organization);
                info!("   Common Name: {}", config.common_name);
                info!("   Validity: {} days", config.root_validity_days);
                let root = Certificate::from_params(root_params(config, None))?;
                let cert_der = root.serialize_der()?;
                store.save_root(&root.serialize_private_key_der(), &cert_der)?;
                (root, cert_der)
            }
        };

        Ok(Self {
            root,
            root_der,
            cache: LeafCache::new(
                config.max_cached_leaves,
                Duration::from_secs(u64::from(config.leaf_renew_before_days) * DAY),
            ),
            leaf_validity: Duration::from_secs(u64::from(config.leaf_validity_days) * DAY),
            signed: AtomicU64::new(0),
        })
    }

    /// Root certificate (DER) clients must trust
    pub fn root_certificate_der(&self) -> &[u8] {
        &self.root_der
    }

    pub fn root_certificate_pem(&self) -> String {
        encode_pem("CERTIFICATE", &self.root_der)
    }

    /// Number of leaf signing operations performed since start
    pub fn signed_count(&self) -> u64 {
        self.signed.load(Ordering::Relaxed)
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    /// Return the leaf for `hostname`, issuing it on a cache miss.
    ///
    /// Concurrent calls for the same hostname share one signing operation.
    pub async fn issue_leaf(&self, hostname: &str) -> Result<Arc<LeafCertificate>> {
        let subject = normalize_hostname(hostname)?;
        let key = subject.as_key();
        self.cache
            .get_or_issue(&key, || async { self.sign_leaf(&subject) })
            .await
    }

    fn sign_leaf(&self, subject: &SubjectName) -> Result<LeafCertificate> {
        let hostname = subject.as_key();
        let issued_at = SystemTime::now();
        let not_after = issued_at + self.leaf_validity;

        let mut params = CertificateParams::new(Vec::<String>::new());
        params.alg = &PKCS_ECDSA_P256_SHA256;
        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, hostname.as_str());
        params.distinguished_name = distinguished_name;
        params.subject_alt_names = vec![subject.san()];
        params.not_before = issued_at.into();
        params.not_after = not_after.into();
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let leaf = Certificate::from_params(params).map_err(|e| Error::issuance(&hostname, e))?;
        let leaf_der = leaf
            .serialize_der_with_signer(&self.root)
            .map_err(|e| Error::issuance(&hostname, e))?;
        let key_der = leaf.serialize_private_key_der();

        let signed = self.signed.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("✍️  Signed leaf for {} ({} total)", hostname, signed);

        Ok(LeafCertificate::new(
            hostname,
            vec![
                RustlsCertificate(leaf_der),
                RustlsCertificate(self.root_der.clone()),
            ],
            PrivateKey(key_der),
            issued_at,
            not_after,
        ))
    }
}

#[async_trait]
impl LeafIssuer for CertificateAuthority {
    async fn issue_leaf(&self, hostname: &str) -> Result<Arc<LeafCertificate>> {
        CertificateAuthority::issue_leaf(self, hostname).await
    }
}

fn root_params(config: &CaConfig, key_pair: Option<KeyPair>) -> CertificateParams {
    let mut params = CertificateParams::new(Vec::<String>::new());
    params.alg = &PKCS_ECDSA_P256_SHA256;
    params.key_pair = key_pair;

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, config.common_name.as_str());
    distinguished_name.push(DnType::OrganizationName, config.organization.as_str());
    params.distinguished_name = distinguished_name;

    let now = SystemTime::now();
    params.not_before = now.into();
    params.not_after = (now + Duration::from_secs(u64::from(config.root_validity_days) * DAY)).into();

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::store::FileRootStore;
    use tempfile::TempDir;
    use x509_parser::extensions::GeneralName;
    use x509_parser::prelude::*;

    fn test_config(dir: &TempDir) -> CaConfig {
        CaConfig {
            storage_dir: dir.path().join("certificate"),
            ..CaConfig::default()
        }
    }

    #[test]
    fn test_normalize_hostname() {
        assert_eq!(
            normalize_hostname(" Example.COM. ").unwrap(),
            SubjectName::Dns("example.com".to_string())
        );
        assert_eq!(
            normalize_hostname("127.0.0.1").unwrap(),
            SubjectName::Ip("127.0.0.1".parse().unwrap())
        );
        assert!(matches!(normalize_hostname(""), Err(Error::InvalidName(_))));
        assert!(normalize_hostname("-bad.example.com").is_err());
        assert!(normalize_hostname("a..b").is_err());
        assert!(normalize_hostname("under_score.test").is_err());
        assert!(normalize_hostname(&"a".repeat(64)).is_err());
    }

    #[tokio::test]
    async fn test_leaf_verifies_against_root() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::from_config(&test_config(&dir)).unwrap();

        let leaf = ca.issue_leaf("example.com").await.unwrap();
        assert_eq!(leaf.chain().len(), 2);

        let (_, root) = X509Certificate::from_der(ca.root_certificate_der()).unwrap();
        let (_, cert) = X509Certificate::from_der(leaf.leaf_der().unwrap()).unwrap();

        cert.verify_signature(Some(root.public_key())).unwrap();
        assert_eq!(cert.issuer().to_string(), root.subject().to_string());

        let cn = cert.subject().iter_common_name().next().unwrap().as_str().unwrap();
        assert_eq!(cn, "example.com");

        let san = cert.subject_alternative_name().unwrap().unwrap();
        let names: Vec<_> = san.value.general_names.iter().collect();
        assert_eq!(names, vec![&GeneralName::DNSName("example.com")]);
        assert!(!cert.is_ca());
    }

    #[tokio::test]
    async fn test_ip_leaf_has_ip_san() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::from_config(&test_config(&dir)).unwrap();

        let leaf = ca.issue_leaf("127.0.0.1").await.unwrap();
        let (_, cert) = X509Certificate::from_der(leaf.leaf_der().unwrap()).unwrap();
        let san = cert.subject_alternative_name().unwrap().unwrap();
        assert_eq!(
            san.value.general_names,
            vec![GeneralName::IPAddress(&[127, 0, 0, 1])]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_issue_signs_once() {
        let dir = TempDir::new().unwrap();
        let ca = Arc::new(CertificateAuthority::from_config(&test_config(&dir)).unwrap());

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let ca = ca.clone();
            tasks.push(tokio::spawn(async move { ca.issue_leaf("coalesce.test").await }));
        }

        let mut leaves = Vec::new();
        for task in tasks {
            leaves.push(task.await.unwrap().unwrap());
        }

        assert_eq!(ca.signed_count(), 1);
        assert_eq!(ca.cached_count(), 1);
        assert!(leaves.iter().all(|leaf| Arc::ptr_eq(leaf, &leaves[0])));
    }

    #[tokio::test]
    async fn test_case_variants_share_entry() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::from_config(&test_config(&dir)).unwrap();

        let a = ca.issue_leaf("Example.com").await.unwrap();
        let b = ca.issue_leaf("example.com.").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(ca.signed_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_name_does_not_sign() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::from_config(&test_config(&dir)).unwrap();

        assert!(matches!(ca.issue_leaf("").await, Err(Error::InvalidName(_))));
        assert_eq!(ca.signed_count(), 0);
    }

    #[tokio::test]
    async fn test_restart_loads_identical_root() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let store = FileRootStore::new(&config.storage_dir, &config.key_file, &config.cert_file);

        let first = CertificateAuthority::init(&store, &config).unwrap();
        let key_before = std::fs::read(store.key_path()).unwrap();
        let cert_before = std::fs::read(store.cert_path()).unwrap();

        let second = CertificateAuthority::init(&store, &config).unwrap();
        assert_eq!(first.root_certificate_der(), second.root_certificate_der());
        assert_eq!(std::fs::read(store.key_path()).unwrap(), key_before);
        assert_eq!(std::fs::read(store.cert_path()).unwrap(), cert_before);

        // Leaves from the reloaded root still chain to the persisted certificate
        let leaf = second.issue_leaf("reload.test").await.unwrap();
        let (_, root) = X509Certificate::from_der(first.root_certificate_der()).unwrap();
        let (_, cert) = X509Certificate::from_der(leaf.leaf_der().unwrap()).unwrap();
        cert.verify_signature(Some(root.public_key())).unwrap();
    }

    #[test]
    fn test_key_without_certificate_keeps_key() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let store = FileRootStore::new(&config.storage_dir, &config.key_file, &config.cert_file);

        CertificateAuthority::init(&store, &config).unwrap();
        let key_before = std::fs::read(store.key_path()).unwrap();
        std::fs::remove_file(store.cert_path()).unwrap();

        let rebuilt = CertificateAuthority::init(&store, &config).unwrap();
        assert_eq!(std::fs::read(store.key_path()).unwrap(), key_before);
        assert!(store.cert_path().exists());

        let (_, root) = X509Certificate::from_der(rebuilt.root_certificate_der()).unwrap();
        assert!(root.is_ca());
    }
}
