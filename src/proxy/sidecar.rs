//! Wiring of the CONNECT ingress, rendezvous queue and TLS terminator

use crate::config::settings::{ConnectConfig, ProxyConfig};
use crate::error::{Error, Result};
use crate::net::{Listener, RendezvousListener, TcpAcceptor};
use crate::proxy::policy::InterceptPolicy;
use crate::proxy::router::RequestRouter;
use crate::proxy::server::ConnectAcceptor;
use crate::tls::authority::CertificateAuthority;
use crate::tls::server::TlsTerminator;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// The running sidecar: one TCP ingress plus a socketless TLS endpoint
pub struct Sidecar {
    ingress: Arc<TcpAcceptor>,
    rendezvous: Arc<RendezvousListener>,
    acceptor: Arc<ConnectAcceptor>,
    terminator: Arc<TlsTerminator>,
    authority: Arc<CertificateAuthority>,
}

impl Sidecar {
    /// Bind the ingress port and assemble every component from `config`
    pub async fn bind(config: &ProxyConfig, authority: Arc<CertificateAuthority>) -> Result<Self> {
        let policy = InterceptPolicy::from_patterns(&config.intercept.hosts)?;
        if policy.is_empty() {
            info!("⚠️  No intercept hosts configured, every CONNECT will be relayed");
        }
        let router = Arc::new(RequestRouter::from_config(config)?);

        let ingress = Arc::new(TcpAcceptor::bind(config.listen_addr).await?);
        let local_addr = ingress.local_addr()?;
        let rendezvous = Arc::new(RendezvousListener::new(local_addr));

        let acceptor = Arc::new(
            ConnectAcceptor::new(
                policy,
                Arc::clone(&rendezvous),
                Arc::clone(&authority),
                config.connect.dial_timeout(),
            )
            .with_idle_timeout(config.connect.idle_timeout()),
        );
        let terminator = Arc::new(
            TlsTerminator::new(authority.clone(), router, config.connect.handshake_timeout())
                .with_idle_timeout(config.connect.idle_timeout()),
        );

        info!("✅ Sidecar bound on {}", local_addr);
        Ok(Self {
            ingress,
            rendezvous,
            acceptor,
            terminator,
            authority,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.ingress.local_addr()
    }

    pub fn authority(&self) -> &Arc<CertificateAuthority> {
        &self.authority
    }

    /// Serve until `shutdown` resolves, then close both listeners and wait
    /// for both accept loops to stop
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let ingress_loop = tokio::spawn(Arc::clone(&self.acceptor).serve(Arc::clone(&self.ingress)));
        let tls_loop = tokio::spawn(Arc::clone(&self.terminator).serve(Arc::clone(&self.rendezvous)));

        shutdown.await;
        info!("🛑 Shutdown requested, closing listeners");

        self.ingress.close();
        self.rendezvous.close();

        join_loop(ingress_loop).await?;
        join_loop(tls_loop).await?;

        info!("🛑 Sidecar stopped");
        Ok(())
    }
}

/// Standalone relay: CONNECT, dial, relay; no certificate authority
pub async fn run_tunnel<F>(listen_addr: SocketAddr, connect: &ConnectConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let ingress = Arc::new(TcpAcceptor::bind(listen_addr).await?);
    info!("✅ Tunnel listening on {}", ingress.local_addr()?);

    let acceptor =
        Arc::new(ConnectAcceptor::relay_only(connect.dial_timeout()).with_idle_timeout(connect.idle_timeout()));
    let ingress_loop = tokio::spawn(acceptor.serve(Arc::clone(&ingress)));

    shutdown.await;
    info!("🛑 Shutdown requested, closing tunnel listener");
    ingress.close();
    join_loop(ingress_loop).await
}

async fn join_loop(handle: JoinHandle<Result<()>>) -> Result<()> {
    handle.await.map_err(|e| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("accept loop failed: {}", e),
        ))
    })?
}
