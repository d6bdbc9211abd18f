//! Sidecar configuration settings

use crate::error::{Error, Result};
use crate::proxy::policy::HostPattern;
use hyper::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the sidecar
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Plaintext listener accepting CONNECT requests
    pub listen_addr: SocketAddr,

    /// Log level configuration
    pub log_level: String,

    /// Single-instance lock artifact
    pub lock_file: PathBuf,

    /// Root authority and leaf issuance
    pub ca: CaConfig,

    /// Which CONNECT destinations get terminated instead of relayed
    pub intercept: InterceptConfig,

    /// Routing of decrypted requests
    pub routing: RoutingConfig,

    /// CONNECT handling timeouts
    pub connect: ConnectConfig,

    /// Origin HTTP client configuration
    pub http_client: HttpClientConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Runtime configuration
    pub runtime: RuntimeConfig,

    /// Standalone relay mode
    pub tunnel: TunnelConfig,
}

/// Root authority configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaConfig {
    /// Directory holding the persisted root artifacts
    pub storage_dir: PathBuf,

    /// Root private key file name inside `storage_dir`
    pub key_file: String,

    /// Root certificate file name inside `storage_dir`
    pub cert_file: String,

    pub organization: String,

    pub common_name: String,

    /// Root certificate validity period in days
    pub root_validity_days: u32,

    /// Leaf certificate validity period in days
    pub leaf_validity_days: u32,

    /// Cached leaves this close to expiry are re-issued
    pub leaf_renew_before_days: u32,

    /// Maximum number of cached leaf certificates
    pub max_cached_leaves: usize,
}

/// Interception policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptConfig {
    /// Host patterns: `*`, `*.example.com`, `example.com`, optionally `:port`
    pub hosts: Vec<String>,
}

/// A path prefix mapped to an origin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub path: String,
    pub origin: String,
}

/// A header set on every forwarded request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderConfig {
    pub name: String,
    pub value: String,
}

/// Routing of decrypted requests to origins
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Origin used when no rule matches
    pub default_origin: String,

    /// Ordered rules, first match wins
    pub rules: Vec<RouteConfig>,

    /// Headers injected into every forwarded request
    pub headers: Vec<HeaderConfig>,

    /// Keep the client's Host header instead of the origin's
    pub preserve_host: bool,

    /// Per-request origin timeout in seconds
    pub request_timeout_secs: u64,
}

/// CONNECT handling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Destination dial timeout in seconds
    pub dial_timeout_secs: u64,

    /// TLS handshake timeout for intercepted connections in seconds
    pub handshake_timeout_secs: u64,

    /// Connections with no request in flight and no traffic for this long are closed
    pub idle_timeout_secs: u64,
}

/// HTTP client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: u32,

    /// Idle timeout in seconds
    pub idle_timeout_secs: u64,

    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,

    /// Enable TCP keepalive
    pub tcp_keepalive: bool,

    /// TCP keepalive interval in seconds
    pub tcp_keepalive_interval_secs: u64,

    /// Skip origin certificate verification (for testing)
    pub skip_tls_verify: bool,

    /// Additional CA certificate (PEM) trusted for origin connections
    pub extra_root_ca: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Enable file logging
    pub enable_file_logging: bool,

    /// Directory for the log file
    pub directory: PathBuf,

    pub file_name: String,
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Runtime mode: "single_threaded" or "multi_threaded"
    pub mode: String,

    /// Number of worker threads for multi-threaded mode (0 = auto-detect CPU cores)
    pub worker_threads: Option<usize>,
}

/// Standalone relay mode configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub listen_addr: SocketAddr,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 4396)),
            log_level: "info".to_string(),
            lock_file: PathBuf::from("sidecar-server.lock"),
            ca: CaConfig::default(),
            intercept: InterceptConfig::default(),
            routing: RoutingConfig::default(),
            connect: ConnectConfig::default(),
            http_client: HttpClientConfig::default(),
            logging: LoggingConfig::default(),
            runtime: RuntimeConfig::default(),
            tunnel: TunnelConfig::default(),
        }
    }
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("certificate"),
            key_file: "sidecar.pri".to_string(),
            cert_file: "sidecar.crt".to_string(),
            organization: "Sidecar".to_string(),
            common_name: "Sidecar Root CA".to_string(),
            root_validity_days: 3650,
            leaf_validity_days: 365,
            leaf_renew_before_days: 7,
            max_cached_leaves: 1000,
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_origin: String::new(),
            rules: Vec::new(),
            headers: Vec::new(),
            preserve_host: true,
            request_timeout_secs: 30,
        }
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            dial_timeout_secs: 10,
            handshake_timeout_secs: 10,
            idle_timeout_secs: 5,
        }
    }
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 50,
            idle_timeout_secs: 90,
            connect_timeout_secs: 10,
            tcp_keepalive: true,
            tcp_keepalive_interval_secs: 30,
            skip_tls_verify: false,
            extra_root_ca: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_file_logging: true,
            directory: PathBuf::from("log"),
            file_name: "server.log".to_string(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: "multi_threaded".to_string(),
            worker_threads: None, // Auto-detect CPU cores
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 6699)),
        }
    }
}

impl ConnectConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl ProxyConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Load configuration from YAML file with environment variable overrides
    pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file '{}' not found",
                path.display()
            )));
        }

        let mut config = Self::from_yaml_file(path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Environment variables take precedence over the file
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("SIDECAR_LISTEN_ADDR") {
            self.listen_addr = addr
                .parse()
                .map_err(|e| Error::Config(format!("SIDECAR_LISTEN_ADDR '{}': {}", addr, e)))?;
        }

        if let Ok(addr) = std::env::var("SIDECAR_TUNNEL_ADDR") {
            self.tunnel.listen_addr = addr
                .parse()
                .map_err(|e| Error::Config(format!("SIDECAR_TUNNEL_ADDR '{}': {}", addr, e)))?;
        }

        if let Ok(level) = std::env::var("SIDECAR_LOG_LEVEL") {
            self.log_level = level;
        }

        Ok(())
    }

    /// Reject configurations the sidecar cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.routing.default_origin.trim().is_empty() {
            return Err(Error::Config("routing.default_origin must be set".to_string()));
        }
        validate_origin(&self.routing.default_origin)?;

        for rule in &self.routing.rules {
            if !rule.path.starts_with('/') {
                return Err(Error::Config(format!(
                    "routing rule path '{}' must start with '/'",
                    rule.path
                )));
            }
            validate_origin(&rule.origin)?;
        }

        for header in &self.routing.headers {
            HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|_| Error::Config(format!("invalid header name '{}'", header.name)))?;
            HeaderValue::from_str(&header.value).map_err(|_| {
                Error::Config(format!("invalid value for header '{}'", header.name))
            })?;
        }

        for host in &self.intercept.hosts {
            HostPattern::parse(host)?;
        }

        if self.routing.request_timeout_secs == 0 {
            return Err(Error::Config("routing.request_timeout_secs must be greater than 0".to_string()));
        }
        if self.connect.dial_timeout_secs == 0
            || self.connect.handshake_timeout_secs == 0
            || self.connect.idle_timeout_secs == 0
        {
            return Err(Error::Config("connect timeouts must be greater than 0".to_string()));
        }
        if self.ca.root_validity_days == 0 || self.ca.leaf_validity_days == 0 {
            return Err(Error::Config("certificate validity must be greater than 0".to_string()));
        }
        if self.ca.leaf_renew_before_days >= self.ca.leaf_validity_days {
            return Err(Error::Config(
                "ca.leaf_renew_before_days must be shorter than ca.leaf_validity_days".to_string(),
            ));
        }
        if self.ca.key_file.is_empty() || self.ca.cert_file.is_empty() {
            return Err(Error::Config("root artifact file names cannot be empty".to_string()));
        }

        Ok(())
    }
}

fn validate_origin(origin: &str) -> Result<()> {
    crate::proxy::router::Origin::parse(origin).map(|_| ())
}
