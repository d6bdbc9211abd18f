//! TLS configuration utilities

use crate::config::settings::HttpClientConfig;
use crate::error::{Error, Result};
use crate::tls::authority::LeafCertificate;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, RootCertStore, ServerConfig};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Server config presenting `leaf` on the terminated side.
///
/// Only HTTP/1.1 is offered over ALPN.
pub fn create_server_config(leaf: &LeafCertificate) -> Result<Arc<ServerConfig>> {
    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(leaf.chain().to_vec(), leaf.key().clone())
        .map_err(|e| Error::issuance(leaf.hostname(), e))?;

    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Create rustls ClientConfig for origin connections
pub fn create_client_config(config: &HttpClientConfig) -> Result<ClientConfig> {
    debug!("Creating TLS client configuration");

    if config.skip_tls_verify {
        warn!("⚠️  WARNING: Skipping origin certificate verification (insecure)");
        return Ok(ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(AcceptAllCertVerifier))
            .with_no_client_auth());
    }

    let mut root_store = RootCertStore::empty();
    add_system_root_certificates(&mut root_store);

    if let Some(path) = &config.extra_root_ca {
        add_custom_root_ca(&mut root_store, path)?;
    }

    Ok(ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

/// Add system root certificates to the root store
fn add_system_root_certificates(root_store: &mut RootCertStore) {
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let mut added = 0;
            let mut failed = 0;

            for cert_der in certs {
                match root_store.add(&Certificate(cert_der.as_ref().to_vec())) {
                    Ok(_) => added += 1,
                    Err(_) => failed += 1,
                }
            }

            debug!("Root certificate store initialized: {} added, {} failed", added, failed);
        }
        Err(e) => {
            // Environments without a system store still reach plain-HTTP or extra-CA origins
            info!("⚠️  Could not load system root certificates: {}", e);
        }
    }
}

/// Add a PEM CA bundle to the root store
pub fn add_custom_root_ca(root_store: &mut RootCertStore, path: &Path) -> Result<()> {
    let pem = std::fs::read(path).map_err(|e| {
        Error::Config(format!("Failed to read CA file {}: {}", path.display(), e))
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem.as_slice()))
        .map_err(|e| Error::Config(format!("Invalid CA file {}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(Error::Config(format!("No certificates in {}", path.display())));
    }

    let (added, _ignored) = root_store.add_parsable_certificates(&certs);
    if added == 0 {
        return Err(Error::Config(format!(
            "No usable certificates in {}",
            path.display()
        )));
    }

    info!("✅ Trusting {} extra CA certificate(s) from {}", added, path.display());
    Ok(())
}

/// Certificate verifier that accepts every origin certificate (for testing)
pub struct AcceptAllCertVerifier;

impl ServerCertVerifier for AcceptAllCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::CaConfig;
    use crate::tls::authority::CertificateAuthority;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_server_config_from_leaf() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::from_config(&CaConfig {
            storage_dir: dir.path().to_path_buf(),
            ..CaConfig::default()
        })
        .unwrap();
        let leaf = ca.issue_leaf("example.com").await.unwrap();

        let config = create_server_config(&leaf).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_extra_root_ca_loaded() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::from_config(&CaConfig {
            storage_dir: dir.path().join("ca"),
            ..CaConfig::default()
        })
        .unwrap();
        let pem_path = dir.path().join("extra.pem");
        std::fs::write(&pem_path, ca.root_certificate_pem()).unwrap();

        let mut store = RootCertStore::empty();
        add_custom_root_ca(&mut store, &pem_path).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_missing_extra_root_ca_is_error() {
        let config = HttpClientConfig {
            extra_root_ca: Some("/nonexistent/ca.pem".into()),
            ..HttpClientConfig::default()
        };
        assert!(matches!(create_client_config(&config), Err(Error::Config(_))));
    }
}
