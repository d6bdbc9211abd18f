//! `sidecar tunnel`

use crate::config::settings::ProxyConfig;
use crate::lifecycle::shutdown_signal;
use crate::proxy::sidecar::run_tunnel;
use anyhow::{Context, Result};
use clap::Args;
use std::net::SocketAddr;

#[derive(Debug, Args)]
pub struct TunnelArgs {
    /// Listening address; defaults to `tunnel.listen_addr` from the config
    #[arg(long)]
    pub listen_addr: Option<SocketAddr>,
}

impl TunnelArgs {
    pub async fn execute(&self, config: &ProxyConfig) -> Result<()> {
        let addr = self.listen_addr.unwrap_or(config.tunnel.listen_addr);
        run_tunnel(addr, &config.connect, shutdown_signal())
            .await
            .with_context(|| format!("Tunnel on {} failed", addr))
    }
}
