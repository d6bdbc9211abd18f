//! Error handling module for the sidecar proxy

use thiserror::Error;
use tokio::time::error::Elapsed;

/// Custom error type for the sidecar proxy
#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid URI: {0}")]
    InvalidUri(#[from] hyper::http::uri::InvalidUri),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Destination unreachable while serving a CONNECT request
    #[error("Failed to dial {target}: {reason}")]
    Dial { target: String, reason: String },

    /// The accepting transport cannot hand over its raw socket
    #[error("Connection hijacking is not supported by this transport")]
    HijackUnsupported,

    /// Root key or certificate could not be generated, parsed or signed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Empty or malformed hostname presented for leaf issuance
    #[error("Invalid hostname '{0}'")]
    InvalidName(String),

    #[error("Certificate issuance failed for {hostname}: {reason}")]
    CertificateIssuance { hostname: String, reason: String },

    #[error("Origin {origin} unreachable: {reason}")]
    OriginForward { origin: String, reason: String },

    #[error("TLS error: {0}")]
    Tls(String),

    /// Terminal error returned by a listener after `close()`
    #[error("Listener closed")]
    ListenerClosed,

    #[error("Another instance is already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("Timeout error: {0}")]
    Timeout(#[from] Elapsed),
}

/// Result type for the sidecar proxy
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn crypto(reason: impl std::fmt::Display) -> Self {
        Error::Crypto(reason.to_string())
    }

    pub fn issuance(hostname: &str, reason: impl std::fmt::Display) -> Self {
        Error::CertificateIssuance {
            hostname: hostname.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<rcgen::RcgenError> for Error {
    fn from(err: rcgen::RcgenError) -> Self {
        Error::Crypto(err.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Error::Tls(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Config(err.to_string())
    }
}
