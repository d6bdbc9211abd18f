//! Persistence of the root authority's key and certificate

use crate::error::{Error, Result};
use base64::{engine::general_purpose, Engine as _};
use std::fs;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Root key (PKCS#8 DER) and, when present, its certificate (DER)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootArtifacts {
    pub key_der: Vec<u8>,
    pub cert_der: Option<Vec<u8>>,
}

/// Storage slots for the root authority.
///
/// `load_root` returns `None` when no key is stored. A certificate stored
/// without its key is not usable and is reported as `None` too.
pub trait RootStore: Send + Sync {
    fn load_root(&self) -> Result<Option<RootArtifacts>>;

    fn save_root(&self, key_der: &[u8], cert_der: &[u8]) -> Result<()>;

    /// Human readable location used in logs
    fn describe(&self) -> String;
}

/// Two PEM files inside a storage directory
#[derive(Debug, Clone)]
pub struct FileRootStore {
    key_path: PathBuf,
    cert_path: PathBuf,
}

impl FileRootStore {
    pub fn new(dir: impl AsRef<Path>, key_file: &str, cert_file: &str) -> Self {
        let dir = dir.as_ref();
        Self {
            key_path: dir.join(key_file),
            cert_path: dir.join(cert_file),
        }
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    fn read_key(&self) -> Result<Vec<u8>> {
        let pem = fs::read(&self.key_path)?;
        let mut reader = BufReader::new(pem.as_slice());
        let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader).map_err(|e| {
            Error::crypto(format!("unreadable key {}: {}", self.key_path.display(), e))
        })?;
        if keys.is_empty() {
            return Err(Error::crypto(format!(
                "no PKCS#8 private key in {}",
                self.key_path.display()
            )));
        }
        Ok(keys.remove(0))
    }

    fn read_cert(&self) -> Result<Vec<u8>> {
        let pem = fs::read(&self.cert_path)?;
        let mut reader = BufReader::new(pem.as_slice());
        let mut certs = rustls_pemfile::certs(&mut reader).map_err(|e| {
            Error::crypto(format!("unreadable certificate {}: {}", self.cert_path.display(), e))
        })?;
        if certs.is_empty() {
            return Err(Error::crypto(format!(
                "no certificate in {}",
                self.cert_path.display()
            )));
        }
        Ok(certs.remove(0))
    }
}

impl RootStore for FileRootStore {
    fn load_root(&self) -> Result<Option<RootArtifacts>> {
        let has_key = self.key_path.exists();
        let has_cert = self.cert_path.exists();

        match (has_key, has_cert) {
            (false, false) => {
                debug!("No root artifacts in {}", self.describe());
                Ok(None)
            }
            (false, true) => {
                warn!(
                    "Root certificate {} has no private key, regenerating both",
                    self.cert_path.display()
                );
                Ok(None)
            }
            (true, false) => {
                warn!(
                    "Root key {} has no certificate, a new certificate will be built",
                    self.key_path.display()
                );
                Ok(Some(RootArtifacts {
                    key_der: self.read_key()?,
                    cert_der: None,
                }))
            }
            (true, true) => Ok(Some(RootArtifacts {
                key_der: self.read_key()?,
                cert_der: Some(self.read_cert()?),
            })),
        }
    }

    fn save_root(&self, key_der: &[u8], cert_der: &[u8]) -> Result<()> {
        for parent in [self.key_path.parent(), self.cert_path.parent()]
            .into_iter()
            .flatten()
        {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        write_private(&self.key_path, encode_pem("PRIVATE KEY", key_der).as_bytes())?;
        fs::write(&self.cert_path, encode_pem("CERTIFICATE", cert_der))?;

        info!("💾 Saved root private key to {}", self.key_path.display());
        info!("💾 Saved root certificate to {}", self.cert_path.display());
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{} + {}", self.key_path.display(), self.cert_path.display())
    }
}

/// PEM with 64-column base64 lines
pub fn encode_pem(label: &str, der: &[u8]) -> String {
    let b64 = general_purpose::STANDARD.encode(der);
    let mut pem = format!("-----BEGIN {}-----\n", label);
    for chunk in b64.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(chunk));
        pem.push('\n');
    }
    pem.push_str(&format!("-----END {}-----\n", label));
    pem
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode() only applies on creation
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    file.write_all(contents)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> FileRootStore {
        FileRootStore::new(dir.path().join("certificate"), "sidecar.pri", "sidecar.crt")
    }

    #[test]
    fn test_empty_store_loads_none() {
        let dir = TempDir::new().unwrap();
        assert_eq!(store(&dir).load_root().unwrap(), None);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let key = rcgen::KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let key_der = key.serialize_der();
        let cert_der = vec![0x30, 0x03, 0x02, 0x01, 0x01];

        store.save_root(&key_der, &cert_der).unwrap();
        let loaded = store.load_root().unwrap().unwrap();
        assert_eq!(loaded.key_der, key_der);
        assert_eq!(loaded.cert_der, Some(cert_der));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(store.key_path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_certificate_without_key_is_none() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fs::create_dir_all(store.cert_path().parent().unwrap()).unwrap();
        fs::write(store.cert_path(), encode_pem("CERTIFICATE", &[1, 2, 3])).unwrap();
        assert_eq!(store.load_root().unwrap(), None);
    }

    #[test]
    fn test_garbage_key_is_crypto_error() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fs::create_dir_all(store.key_path().parent().unwrap()).unwrap();
        fs::write(store.key_path(), "not a key").unwrap();
        assert!(matches!(store.load_root(), Err(Error::Crypto(_))));
    }

    #[test]
    fn test_pem_lines_are_wrapped() {
        let pem = encode_pem("CERTIFICATE", &[0u8; 200]);
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.lines().all(|line| line.len() <= 64));
    }
}
