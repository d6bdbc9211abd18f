//! Root certificate authority management commands

use crate::config::settings::{CaConfig, ProxyConfig};
use crate::tls::authority::CertificateAuthority;
use crate::tls::store::FileRootStore;
use anyhow::{anyhow, Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Args, Subcommand, ValueEnum};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use tracing::info;
use x509_parser::pem::parse_x509_pem;

#[derive(Debug, Subcommand)]
pub enum CertCommand {
    /// Create the root authority, or load the existing one, without serving
    Init,

    /// Print details of the persisted root certificate
    Inspect(InspectArgs),
}

#[derive(Debug, Args)]
pub struct InspectArgs {
    /// Output format
    #[arg(long, value_enum, default_value_t = CertFormat::Text)]
    pub format: CertFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CertFormat {
    Text,
    Json,
}

/// What `cert inspect` reports about a certificate
#[derive(Debug, Serialize)]
pub struct CertificateSummary {
    pub subject: String,
    pub issuer: String,
    pub serial: String,
    pub not_before: String,
    pub not_after: String,
    pub is_ca: bool,
    pub sha256_fingerprint: String,
}

impl CertCommand {
    pub async fn execute(&self, config: &ProxyConfig) -> Result<()> {
        match self {
            CertCommand::Init => init_root(&config.ca),
            CertCommand::Inspect(args) => inspect_root(&config.ca, args.format),
        }
    }
}

fn store_for(config: &CaConfig) -> FileRootStore {
    FileRootStore::new(&config.storage_dir, &config.key_file, &config.cert_file)
}

fn init_root(config: &CaConfig) -> Result<()> {
    let store = store_for(config);
    let authority = CertificateAuthority::init(&store, config).context("Failed to initialize root authority")?;

    info!("✅ Root authority ready");
    info!("🔐 Private key: {}", store.key_path().display());
    info!("📜 Certificate: {}", store.cert_path().display());
    info!("   Install the certificate as trusted in clients that use the sidecar");

    let summary = summarize(authority.root_certificate_pem().as_bytes())?;
    println!("{}", store.cert_path().display());
    println!("SHA-256: {}", summary.sha256_fingerprint);
    Ok(())
}

fn inspect_root(config: &CaConfig, format: CertFormat) -> Result<()> {
    let store = store_for(config);
    let path = store.cert_path();
    let pem = fs::read(path).with_context(|| format!("Certificate file not found: {}", path.display()))?;
    let summary = summarize(&pem)?;

    match format {
        CertFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        CertFormat::Text => {
            println!("Certificate: {}", path.display());
            println!("  Subject:     {}", summary.subject);
            println!("  Issuer:      {}", summary.issuer);
            println!("  Serial:      {}", summary.serial);
            println!("  Not before:  {}", summary.not_before);
            println!("  Not after:   {}", summary.not_after);
            println!("  CA:          {}", summary.is_ca);
            println!("  SHA-256:     {}", summary.sha256_fingerprint);
        }
    }
    Ok(())
}

/// Parse the first certificate of a PEM document
pub fn summarize(pem: &[u8]) -> Result<CertificateSummary> {
    let (_, pem) = parse_x509_pem(pem).map_err(|e| anyhow!("Invalid PEM: {}", e))?;
    let cert = pem.parse_x509().map_err(|e| anyhow!("Invalid X.509 certificate: {}", e))?;
    let validity = cert.validity();

    Ok(CertificateSummary {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        serial: cert.raw_serial_as_string(),
        not_before: format_time(validity.not_before.timestamp()),
        not_after: format_time(validity.not_after.timestamp()),
        is_ca: cert.is_ca(),
        sha256_fingerprint: fingerprint(&pem.contents),
    })
}

fn format_time(timestamp: i64) -> String {
    match Utc.timestamp_opt(timestamp, 0).single() {
        Some(time) => time.to_rfc3339(),
        None => timestamp.to_string(),
    }
}

fn fingerprint(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ca_config(dir: &std::path::Path) -> CaConfig {
        CaConfig {
            storage_dir: dir.join("certificate"),
            common_name: "Inspect Test Root".to_string(),
            ..CaConfig::default()
        }
    }

    #[test]
    fn test_init_creates_artifacts() {
        let dir = tempdir().unwrap();
        let config = ca_config(dir.path());

        init_root(&config).unwrap();

        let store = store_for(&config);
        assert!(store.key_path().exists());
        assert!(store.cert_path().exists());
    }

    #[test]
    fn test_summary_of_generated_root() {
        let dir = tempdir().unwrap();
        let config = ca_config(dir.path());
        let authority = CertificateAuthority::from_config(&config).unwrap();

        let summary = summarize(authority.root_certificate_pem().as_bytes()).unwrap();
        assert!(summary.is_ca);
        assert!(summary.subject.contains("Inspect Test Root"));
        assert_eq!(summary.subject, summary.issuer);
        assert_eq!(summary.sha256_fingerprint.len(), 32 * 3 - 1);
        assert!(summary.not_before < summary.not_after);

        let expected = fingerprint(authority.root_certificate_der());
        assert_eq!(summary.sha256_fingerprint, expected);
    }

    #[test]
    fn test_inspect_without_root_fails() {
        let dir = tempdir().unwrap();
        let config = ca_config(dir.path());
        assert!(inspect_root(&config, CertFormat::Json).is_err());
    }

    #[test]
    fn test_summarize_rejects_garbage() {
        assert!(summarize(b"not a certificate").is_err());
    }
}
