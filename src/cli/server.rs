//! `sidecar server`

use crate::config::settings::ProxyConfig;
use crate::lifecycle::{shutdown_signal, ProcessLock};
use crate::proxy::sidecar::Sidecar;
use crate::tls::authority::CertificateAuthority;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

/// Lock, load the root, serve until SIGINT/SIGTERM.
///
/// The lock is released last, after both accept loops have stopped.
pub async fn run_server(config: ProxyConfig) -> Result<()> {
    config.validate().context("Invalid configuration")?;

    let _lock = ProcessLock::acquire(&config.lock_file)
        .with_context(|| format!("Failed to acquire lock {}", config.lock_file.display()))?;

    let authority = CertificateAuthority::from_config(&config.ca).with_context(|| {
        format!(
            "Failed to initialize root authority in {}",
            config.ca.storage_dir.display()
        )
    })?;

    info!("📋 Sidecar Configuration:");
    info!("   CONNECT listener: {}", config.listen_addr);
    info!("   Root authority: {}", config.ca.storage_dir.display());
    info!("   Intercepted hosts: {:?}", config.intercept.hosts);
    info!("   Default origin: {}", config.routing.default_origin);
    info!("   Routing rules: {}", config.routing.rules.len());

    let sidecar = Sidecar::bind(&config, Arc::new(authority))
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;

    sidecar.run(shutdown_signal()).await?;
    Ok(())
}
