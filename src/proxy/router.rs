//! Routing of decrypted requests to origins

use crate::config::settings::{ProxyConfig, RoutingConfig};
use crate::error::{Error, Result};
use crate::models::ForwardLog;
use crate::proxy::http_client::HttpClient;
use crate::utils::http::{build_error_response, strip_hop_by_hop_headers};
use crate::log_forward;
use chrono::Utc;
use hyper::header::{self, HeaderName, HeaderValue};
use hyper::{Body, Request, Response, StatusCode, Uri, Version};
use std::convert::Infallible;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use url::Url;

/// An origin server: scheme, authority and an optional base path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    scheme: String,
    authority: String,
    base_path: String,
}

impl Origin {
    pub fn parse(origin: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::Config(format!("invalid origin '{}': {}", origin, reason));

        let url = Url::parse(origin.trim()).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(invalid("scheme must be http or https"));
        }
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        if url.query().is_some() || url.fragment().is_some() {
            return Err(invalid("query and fragment are not allowed"));
        }

        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        Ok(Self {
            scheme: url.scheme().to_string(),
            authority,
            base_path: url.path().trim_end_matches('/').to_string(),
        })
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Absolute URI for `path_and_query` on this origin
    pub fn target_uri(&self, path_and_query: &str) -> Result<Uri> {
        let path_and_query = if path_and_query.is_empty() { "/" } else { path_and_query };
        let uri = format!(
            "{}://{}{}{}",
            self.scheme, self.authority, self.base_path, path_and_query
        );
        Ok(uri.parse::<Uri>()?)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority, self.base_path)
    }
}

/// A path prefix mapped to an origin
#[derive(Debug, Clone)]
pub struct RoutingRule {
    path_match: String,
    origin: Origin,
}

impl RoutingRule {
    pub fn new(path_match: &str, origin: Origin) -> Self {
        let trimmed = path_match.trim_end_matches('/');
        Self {
            path_match: if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() },
            origin,
        }
    }

    /// Segment-aware prefix match: `/api` matches `/api` and `/api/x`, not `/apix`
    pub fn matches(&self, path: &str) -> bool {
        if self.path_match == "/" {
            return true;
        }
        match path.strip_prefix(self.path_match.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }
}

/// A header set on every forwarded request, replacing any client value
#[derive(Debug, Clone)]
pub struct HeaderInjection {
    pub name: HeaderName,
    pub value: HeaderValue,
}

impl HeaderInjection {
    pub fn parse(name: &str, value: &str) -> Result<Self> {
        Ok(Self {
            name: HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::Config(format!("invalid header name '{}'", name)))?,
            value: HeaderValue::from_str(value)
                .map_err(|_| Error::Config(format!("invalid value for header '{}'", name)))?,
        })
    }
}

/// Post-handshake handler: picks an origin per request and forwards to it
pub struct RequestRouter {
    rules: Vec<RoutingRule>,
    default_origin: Origin,
    headers: Vec<HeaderInjection>,
    preserve_host: bool,
    request_timeout: Duration,
    client: HttpClient,
}

impl RequestRouter {
    pub fn new(
        rules: Vec<RoutingRule>,
        default_origin: Origin,
        headers: Vec<HeaderInjection>,
        client: HttpClient,
    ) -> Self {
        Self {
            rules,
            default_origin,
            headers,
            preserve_host: true,
            request_timeout: Duration::from_secs(30),
            client,
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        let client = HttpClient::from_config(&config.http_client)?;
        Self::from_routing(&config.routing, client)
    }

    pub fn from_routing(routing: &RoutingConfig, client: HttpClient) -> Result<Self> {
        let rules = routing
            .rules
            .iter()
            .map(|rule| Ok(RoutingRule::new(&rule.path, Origin::parse(&rule.origin)?)))
            .collect::<Result<Vec<_>>>()?;
        let headers = routing
            .headers
            .iter()
            .map(|h| HeaderInjection::parse(&h.name, &h.value))
            .collect::<Result<Vec<_>>>()?;

        let router = Self::new(rules, Origin::parse(&routing.default_origin)?, headers, client)
            .with_preserve_host(routing.preserve_host)
            .with_request_timeout(Duration::from_secs(routing.request_timeout_secs));

        info!("🧭 Request router ready");
        info!("   Default origin: {}", router.default_origin);
        for rule in &router.rules {
            info!("   {} → {}", rule.path_match, rule.origin);
        }
        Ok(router)
    }

    pub fn with_preserve_host(mut self, preserve_host: bool) -> Self {
        self.preserve_host = preserve_host;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// First matching rule's origin, else the default
    pub fn select(&self, path: &str) -> &Origin {
        self.rules
            .iter()
            .find(|rule| rule.matches(path))
            .map(RoutingRule::origin)
            .unwrap_or(&self.default_origin)
    }

    /// Rewrite a decrypted request for `origin`
    pub fn prepare(&self, mut req: Request<Body>, origin: &Origin, host: &str) -> Result<Request<Body>> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        *req.uri_mut() = origin.target_uri(&path_and_query)?;
        *req.version_mut() = Version::HTTP_11;

        let headers = req.headers_mut();
        strip_hop_by_hop_headers(headers);
        if self.preserve_host {
            if !headers.contains_key(header::HOST) {
                if let Ok(value) = HeaderValue::from_str(host) {
                    headers.insert(header::HOST, value);
                }
            }
        } else {
            headers.remove(header::HOST);
        }
        for injection in &self.headers {
            headers.insert(injection.name.clone(), injection.value.clone());
        }

        Ok(req)
    }

    /// Forward one decrypted request. Origin failures become 502 responses;
    /// the client connection stays usable.
    pub async fn route(&self, req: Request<Body>, host: &str) -> std::result::Result<Response<Body>, Infallible> {
        let started = Instant::now();
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let origin = self.select(&path);

        let outcome = match self.prepare(req, origin, host) {
            Ok(forward) => self.forward(forward, origin).await,
            Err(e) => Err(e),
        };

        let mut record = ForwardLog {
            timestamp: Utc::now(),
            method: method.clone(),
            host: host.to_string(),
            path: path.clone(),
            origin: origin.to_string(),
            status: None,
            error: None,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        let response = match outcome {
            Ok(mut response) => {
                strip_hop_by_hop_headers(response.headers_mut());
                record.status = Some(response.status().as_u16());
                info!("✅ {} {}{} → {} {}", method, host, path, origin, response.status());
                response
            }
            Err(e) => {
                warn!("❌ {} {}{} → {} failed: {}", method, host, path, origin, e);
                record.status = Some(StatusCode::BAD_GATEWAY.as_u16());
                record.error = Some(e.to_string());
                build_error_response(StatusCode::BAD_GATEWAY, "Bad Gateway: origin unreachable")
            }
        };
        log_forward!(&record);

        Ok(response)
    }

    async fn forward(&self, req: Request<Body>, origin: &Origin) -> Result<Response<Body>> {
        let to_error = |reason: String| Error::OriginForward {
            origin: origin.to_string(),
            reason,
        };
        match tokio::time::timeout(self.request_timeout, self.client.request(req)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(to_error(e.to_string())),
            Err(_) => Err(to_error(format!("no response within {:?}", self.request_timeout))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::HttpClientConfig;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::Server;
    use std::net::SocketAddr;

    fn client() -> HttpClient {
        HttpClient::from_config(&HttpClientConfig::default()).unwrap()
    }

    fn router(default: &str, rules: &[(&str, &str)]) -> RequestRouter {
        let rules = rules
            .iter()
            .map(|(path, origin)| RoutingRule::new(path, Origin::parse(origin).unwrap()))
            .collect();
        RequestRouter::new(
            rules,
            Origin::parse(default).unwrap(),
            vec![HeaderInjection::parse("X-Sidecar", "token").unwrap()],
            client(),
        )
    }

    /// Origin echoing its name, the request path and the injected header
    async fn spawn_origin(name: &'static str) -> SocketAddr {
        let make_svc = make_service_fn(move |_| async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| async move {
                let injected = req
                    .headers()
                    .get("x-sidecar")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-")
                    .to_string();
                let host = req
                    .headers()
                    .get(header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-")
                    .to_string();
                let body = format!("{} {} {} {}", name, req.uri().path(), injected, host);
                Ok::<_, Infallible>(Response::new(Body::from(body)))
            }))
        });
        let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
        let addr = server.local_addr();
        tokio::spawn(server);
        addr
    }

    #[test]
    fn test_rule_matching_is_segment_aware() {
        let rule = RoutingRule::new("/api/", Origin::parse("http://127.0.0.1:1").unwrap());
        assert!(rule.matches("/api"));
        assert!(rule.matches("/api/x"));
        assert!(!rule.matches("/apix"));
        assert!(RoutingRule::new("/", Origin::parse("http://a.test").unwrap()).matches("/anything"));
    }

    #[tokio::test]
    async fn test_first_match_wins_and_default_fallback() {
        let router = router(
            "http://default.test",
            &[("/api", "http://api.test"), ("/api/v2", "http://v2.test")],
        );
        assert_eq!(router.select("/api/v2/x").authority(), "api.test");
        assert_eq!(router.select("/static/app.js").authority(), "default.test");
    }

    #[test]
    fn test_origin_with_base_path() {
        let origin = Origin::parse("https://backend.test:8443/prefix/").unwrap();
        assert_eq!(
            origin.target_uri("/api/x?y=1").unwrap().to_string(),
            "https://backend.test:8443/prefix/api/x?y=1"
        );
        assert!(Origin::parse("ftp://backend.test").is_err());
        assert!(Origin::parse("http://backend.test/?q=1").is_err());
    }

    #[tokio::test]
    async fn test_prepare_injects_header_and_strips_hop_by_hop() {
        let router = router("http://127.0.0.1:9000", &[]);
        let req = Request::builder()
            .uri("/api/x?q=1")
            .header(header::HOST, "example.com")
            .header("x-sidecar", "spoofed")
            .header(header::CONNECTION, "keep-alive")
            .body(Body::empty())
            .unwrap();

        let origin = router.select("/api/x").clone();
        let forwarded = router.prepare(req, &origin, "example.com").unwrap();
        assert_eq!(forwarded.uri().to_string(), "http://127.0.0.1:9000/api/x?q=1");
        assert_eq!(forwarded.headers()["x-sidecar"], "token");
        assert_eq!(forwarded.headers()[header::HOST], "example.com");
        assert!(forwarded.headers().get(header::CONNECTION).is_none());

        let router = router.with_preserve_host(false);
        let req = Request::builder()
            .uri("/")
            .header(header::HOST, "example.com")
            .body(Body::empty())
            .unwrap();
        let forwarded = router.prepare(req, &origin, "example.com").unwrap();
        assert!(forwarded.headers().get(header::HOST).is_none());
    }

    #[tokio::test]
    async fn test_route_forwards_to_selected_origin() {
        let api = spawn_origin("api").await;
        let default = spawn_origin("default").await;
        let api_origin = format!("http://{}", api);
        let router = router(&format!("http://{}", default), &[("/api", api_origin.as_str())]);

        for (path, expected) in [
            ("/api/x", "api /api/x token example.com"),
            ("/other", "default /other token example.com"),
        ] {
            let req = Request::builder()
                .uri(path)
                .header(header::HOST, "example.com")
                .body(Body::empty())
                .unwrap();
            let response = router.route(req, "example.com").await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
            assert_eq!(body, expected.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_unreachable_origin_is_bad_gateway() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let router = router(&format!("http://127.0.0.1:{}", port), &[]);
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = router.route(req, "example.com").await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
