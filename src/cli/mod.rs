//! Command-line interface: serving, standalone tunnel and root management

pub mod cert;
pub mod server;
pub mod tunnel;

pub use cert::{CertCommand, CertFormat, CertificateSummary, InspectArgs};
pub use server::run_server;
pub use tunnel::TunnelArgs;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "sidecar")]
#[command(about = "Local intercepting HTTPS sidecar proxy")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to the YAML configuration file
    #[arg(short, long, global = true, default_value = "config.yml")]
    pub config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the sidecar (the default)
    Server,

    /// Relay every CONNECT without interception
    Tunnel(TunnelArgs),

    /// Root certificate authority management
    #[command(subcommand)]
    Cert(CertCommand),
}

impl Cli {
    /// Level requested on the command line, if any
    pub fn requested_log_level(&self) -> Option<String> {
        if self.verbose {
            Some("debug".to_string())
        } else {
            self.log_level.clone()
        }
    }
}
