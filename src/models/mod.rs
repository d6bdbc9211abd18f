use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// One decrypted request forwarded to an origin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardLog {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub host: String,
    pub path: String,
    pub origin: String,
    pub status: Option<u16>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

// Body of the ingress `/health` endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub service: String,
    pub version: String,
    pub pid: u32,
    pub uptime_secs: u64,
    pub mode: String,
    pub cached_leaves: usize,
    pub signed_leaves: u64,
}

impl HealthReport {
    pub fn healthy(mode: &str, uptime_secs: u64, cached_leaves: usize, signed_leaves: u64) -> Self {
        Self {
            status: "healthy".to_string(),
            service: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            pid: std::process::id(),
            uptime_secs,
            mode: mode.to_string(),
            cached_leaves,
            signed_leaves,
        }
    }
}
