//! TLS termination for intercepted connections

use crate::error::{Error, Result};
use crate::net::idle::DEFAULT_IDLE_TIMEOUT;
use crate::net::{IdleIo, IdleWatch, Io, Listener};
use crate::proxy::router::RequestRouter;
use crate::tls::authority::LeafIssuer;
use crate::tls::config::create_server_config;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info, warn};

/// TLS server whose connections come from a [`Listener`], usually the
/// rendezvous queue fed by the CONNECT ingress.
///
/// The certificate is chosen after the ClientHello is read: its SNI names
/// the leaf requested from the issuer.
pub struct TlsTerminator {
    issuer: Arc<dyn LeafIssuer>,
    router: Arc<RequestRouter>,
    handshake_timeout: Duration,
    idle_timeout: Duration,
}

impl TlsTerminator {
    pub fn new(issuer: Arc<dyn LeafIssuer>, router: Arc<RequestRouter>, handshake_timeout: Duration) -> Self {
        Self {
            issuer,
            router,
            handshake_timeout,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Close terminated connections that sit between requests longer than
    /// `timeout`
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Accept and terminate connections until the listener is closed
    pub async fn serve<L: Listener + 'static>(self: Arc<Self>, listener: Arc<L>) -> Result<()> {
        info!("🔐 TLS terminator waiting for intercepted connections");

        loop {
            let (io, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(Error::ListenerClosed) => break,
                Err(e) => {
                    warn!("Failed to accept intercepted connection: {}", e);
                    continue;
                }
            };

            let terminator = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = terminator.handle_connection(io, peer).await {
                    warn!("❌ Intercepted connection from {} aborted: {}", peer, e);
                }
            });
        }

        info!("🔐 TLS terminator stopped");
        Ok(())
    }

    /// Handshake with a leaf for the client's SNI, then serve HTTP/1.1
    pub async fn handle_connection<I: Io>(&self, io: I, peer: SocketAddr) -> Result<()> {
        let watch = IdleWatch::new(self.idle_timeout);
        let io = IdleIo::new(io, Arc::clone(&watch));
        let (tls, hostname) = tokio::time::timeout(self.handshake_timeout, self.handshake(io)).await??;
        debug!("✅ TLS handshake with {} for {}", peer, hostname);

        let router = Arc::clone(&self.router);
        let service_host = hostname.clone();
        let service_watch = Arc::clone(&watch);
        let service = service_fn(move |req| {
            let router = Arc::clone(&router);
            let host = service_host.clone();
            let in_flight = service_watch.begin();
            async move {
                let response = router.route(req, &host).await;
                drop(in_flight);
                response
            }
        });

        let connection = Http::new()
            .http1_only(true)
            .http1_keep_alive(true)
            .serve_connection(tls, service);

        tokio::select! {
            result = connection => {
                if let Err(e) = result {
                    debug!("Terminated connection for {} ended: {}", hostname, e);
                }
            }
            _ = watch.expired() => {
                debug!("Closing idle connection for {} from {} after {:?}", hostname, peer, watch.timeout());
            }
        }
        Ok(())
    }

    async fn handshake<I: Io>(&self, io: I) -> Result<(TlsStream<I>, String)> {
        let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), io).await?;

        let hostname = match start.client_hello().server_name() {
            Some(name) => name.to_string(),
            // Dropping `start` closes the socket without a certificate
            None => return Err(Error::InvalidName(String::new())),
        };

        let leaf = self.issuer.issue_leaf(&hostname).await?;
        let config = create_server_config(&leaf)?;
        let tls = start.into_stream(config).await?;

        Ok((tls, hostname))
    }
}
