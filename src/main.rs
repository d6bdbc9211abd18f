//! Sidecar proxy entry point

use anyhow::Context;
use clap::Parser;
use sidecar_proxy::{
    cli::{run_server, Cli, Commands},
    init_logger, log_error, log_info, log_warning,
    runtime::run_with_runtime,
    ProxyConfig,
};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_missing = !cli.config.exists();
    let mut config = if config_missing {
        let mut config = ProxyConfig::default();
        config.apply_env_overrides()?;
        config
    } else {
        ProxyConfig::load_config(&cli.config)
            .with_context(|| format!("Failed to load {}", cli.config.display()))?
    };
    if let Some(level) = cli.requested_log_level() {
        config.log_level = level;
    }

    // Dropping the guard flushes the file writer
    let _guard = init_logger(&config.log_level, &config.logging)?;
    if config_missing {
        log_warning!("⚠️  No {} found, using defaults", cli.config.display());
    }

    let runtime_config = config.runtime.clone();
    let result = run_with_runtime(&runtime_config, async_main(cli, config));
    if let Err(e) = &result {
        log_error!("❌ {:#}", e);
    }
    result
}

async fn async_main(cli: Cli, config: ProxyConfig) -> anyhow::Result<()> {
    log_info!("🚀 Sidecar proxy v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Some(Commands::Server) | None => run_server(config).await,
        Some(Commands::Tunnel(args)) => args.execute(&config).await,
        Some(Commands::Cert(cmd)) => cmd.execute(&config).await,
    }
}
