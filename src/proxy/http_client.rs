//! Pooled HTTP client for origin requests
//!
//! One shared hyper client over a rustls connector that speaks both `http`
//! and `https`, so every origin reuses the same connection pool.

use crate::config::settings::HttpClientConfig;
use crate::error::Result;
use crate::tls::config::create_client_config;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Request, Response};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use std::time::Duration;
use tracing::info;

pub type OriginConnector = HttpsConnector<HttpConnector>;

/// HTTP/1.1 client with connection pooling
#[derive(Clone)]
pub struct HttpClient {
    client: Client<OriginConnector, Body>,
}

impl HttpClient {
    /// Create HTTP client from configuration
    pub fn from_config(config: &HttpClientConfig) -> Result<Self> {
        info!("🚀 Initializing origin HTTP client with connection pooling");
        info!("   Max idle connections per host: {}", config.max_idle_per_host);
        info!("   Idle timeout: {}s", config.idle_timeout_secs);
        info!("   Connect timeout: {}s", config.connect_timeout_secs);
        info!("   TCP keepalive enabled: {}", config.tcp_keepalive);

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);
        http_connector.set_connect_timeout(Some(Duration::from_secs(config.connect_timeout_secs)));
        http_connector.set_nodelay(true);
        if config.tcp_keepalive {
            http_connector.set_keepalive(Some(Duration::from_secs(
                config.tcp_keepalive_interval_secs,
            )));
        }

        let https_connector = HttpsConnectorBuilder::new()
            .with_tls_config(create_client_config(config)?)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .pool_max_idle_per_host(config.max_idle_per_host as usize)
            .build(https_connector);

        Ok(Self { client })
    }

    /// Send a request; the URI must be absolute
    pub async fn request(&self, req: Request<Body>) -> std::result::Result<Response<Body>, hyper::Error> {
        self.client.request(req).await
    }
}
