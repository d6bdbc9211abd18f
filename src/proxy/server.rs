//! Plaintext CONNECT ingress

use crate::error::{Error, Result};
use crate::models::HealthReport;
use crate::net::idle::DEFAULT_IDLE_TIMEOUT;
use crate::net::{IdleIo, IdleWatch, Io, Listener, PendingConnection, RendezvousListener};
use crate::proxy::policy::{Decision, InterceptPolicy};
use crate::proxy::tunnel::relay;
use crate::tls::authority::CertificateAuthority;
use crate::utils::http::{build_error_response, build_json_response};
use crate::utils::url::{join_host_port, parse_connect_target};
use crate::{log_debug, log_error};
use hyper::header::{self, HeaderValue};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Body, Method, Request, Response, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Handles CONNECT requests: dial, answer, hijack, then relay or hand the
/// client socket to the TLS terminator.
pub struct ConnectAcceptor {
    policy: InterceptPolicy,
    rendezvous: Option<Arc<RendezvousListener>>,
    authority: Option<Arc<CertificateAuthority>>,
    dial_timeout: Duration,
    idle_timeout: Duration,
    started: Instant,
}

impl ConnectAcceptor {
    /// Full sidecar mode: intercepted destinations go to `rendezvous`
    pub fn new(
        policy: InterceptPolicy,
        rendezvous: Arc<RendezvousListener>,
        authority: Arc<CertificateAuthority>,
        dial_timeout: Duration,
    ) -> Self {
        Self {
            policy,
            rendezvous: Some(rendezvous),
            authority: Some(authority),
            dial_timeout,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            started: Instant::now(),
        }
    }

    /// Standalone tunnel mode: every destination is relayed
    pub fn relay_only(dial_timeout: Duration) -> Self {
        Self {
            policy: InterceptPolicy::default(),
            rendezvous: None,
            authority: None,
            dial_timeout,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            started: Instant::now(),
        }
    }

    /// Close connections that sit between requests longer than `timeout`
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    fn mode(&self) -> &'static str {
        if self.rendezvous.is_some() {
            "sidecar"
        } else {
            "tunnel"
        }
    }

    /// Accept connections until the listener is closed
    pub async fn serve<L: Listener + 'static>(self: Arc<Self>, listener: Arc<L>) -> Result<()> {
        info!("🚪 CONNECT ingress accepting connections ({} mode)", self.mode());

        loop {
            let (io, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(Error::ListenerClosed) => break,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            let acceptor = Arc::clone(&self);
            tokio::spawn(async move {
                acceptor.serve_connection(io, peer).await;
            });
        }

        info!("🚪 CONNECT ingress stopped");
        Ok(())
    }

    async fn serve_connection<I: Io>(self: Arc<Self>, io: I, peer: SocketAddr) {
        log_debug!("New connection from: {}", peer);
        let watch = IdleWatch::new(self.idle_timeout);
        let io = IdleIo::new(io, Arc::clone(&watch));

        let service_watch = Arc::clone(&watch);
        let service = service_fn(move |req| {
            let acceptor = Arc::clone(&self);
            let in_flight = service_watch.begin();
            async move {
                let response = acceptor.handle(req, peer).await;
                drop(in_flight);
                Ok::<_, Infallible>(response)
            }
        });

        let connection = Http::new()
            .http1_only(true)
            .serve_connection(io, service)
            .with_upgrades();

        // An upgraded tunnel leaves this future, so only plain HTTP is reaped
        tokio::select! {
            result = connection => {
                if let Err(e) = result {
                    debug!("Ingress connection from {} ended: {}", peer, e);
                }
            }
            _ = watch.expired() => {
                debug!("Closing idle ingress connection from {} after {:?}", peer, watch.timeout());
            }
        }
    }

    /// Answer one request on the plaintext listener
    pub async fn handle(&self, mut req: Request<Body>, peer: SocketAddr) -> Response<Body> {
        if req.method() != Method::CONNECT {
            return self.handle_plain(&req);
        }

        let target = match req.uri().authority() {
            Some(authority) => authority.as_str().to_string(),
            None => {
                return build_error_response(StatusCode::BAD_REQUEST, "CONNECT requires host:port")
            }
        };
        let (host, port) = match parse_connect_target(&target) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("Rejecting CONNECT {} from {}: {}", target, peer, e);
                return build_error_response(StatusCode::BAD_REQUEST, "Malformed CONNECT target");
            }
        };

        let destination = match self.dial(&host, port).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("❌ CONNECT {} from {}: {}", target, peer, e);
                return build_error_response(StatusCode::SERVICE_UNAVAILABLE, "Destination unreachable");
            }
        };

        let decision = match self.rendezvous {
            Some(_) => self.policy.decide(&host, port),
            None => Decision::Relay,
        };

        let on_upgrade = match req.extensions_mut().remove::<OnUpgrade>() {
            Some(on_upgrade) => on_upgrade,
            None => {
                log_error!("CONNECT {}: {}", target, Error::HijackUnsupported);
                return build_error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Connection hijacking unsupported",
                );
            }
        };

        let rendezvous = self.rendezvous.clone();
        tokio::spawn(async move {
            let upgraded = match on_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    warn!("Failed to hijack CONNECT {} from {}: {}", target, peer, e);
                    return;
                }
            };

            match (decision, rendezvous) {
                (Decision::Intercept, Some(rendezvous)) => {
                    // Requests are routed per request after termination
                    drop(destination);
                    debug!("🔍 Intercepting {} for {}", target, peer);
                    let pending = PendingConnection::new(upgraded, peer, target.clone());
                    if let Err(e) = rendezvous.push(pending) {
                        debug!("Dropping intercepted {} from {}: {}", target, peer, e);
                    }
                }
                _ => {
                    debug!("🔁 Relaying {} for {}", target, peer);
                    let stats = relay(upgraded, destination).await;
                    debug!(
                        "Relay {} closed: {} bytes up, {} bytes down in {:?}",
                        target, stats.upstream_bytes, stats.downstream_bytes, stats.duration
                    );
                }
            }
        });

        Response::new(Body::empty())
    }

    async fn dial(&self, host: &str, port: u16) -> Result<TcpStream> {
        let address = join_host_port(host, port);
        let dial_error = |reason: String| Error::Dial {
            target: address.clone(),
            reason,
        };

        match tokio::time::timeout(self.dial_timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(dial_error(e.to_string())),
            Err(_) => Err(dial_error(format!("timed out after {:?}", self.dial_timeout))),
        }
    }

    fn handle_plain(&self, req: &Request<Body>) -> Response<Body> {
        if req.method() == Method::GET && req.uri().path() == "/health" {
            let (cached, signed) = match &self.authority {
                Some(authority) => (authority.cached_count(), authority.signed_count()),
                None => (0, 0),
            };
            let report = HealthReport::healthy(
                self.mode(),
                self.started.elapsed().as_secs(),
                cached,
                signed,
            );
            return build_json_response(StatusCode::OK, &report);
        }

        debug!("Rejecting {} {} on CONNECT ingress", req.method(), req.uri());
        let mut response = build_error_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
        response
            .headers_mut()
            .insert(header::ALLOW, HeaderValue::from_static("CONNECT"));
        response
    }
}
