use crate::config::settings::LoggingConfig;
use crate::models::ForwardLog;
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Initialize the global logger.
///
/// `RUST_LOG` takes precedence over `level`. When file logging is enabled the
/// returned guard must be held until exit, otherwise buffered lines are lost.
pub fn init_logger(level: &str, config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level '{}'", level))?;

    let console_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .with_ansi(true);

    let (file_layer, guard) = if config.enable_file_logging {
        std::fs::create_dir_all(&config.directory).with_context(|| {
            format!("Failed to create log directory {}", config.directory.display())
        })?;
        let appender = tracing_appender::rolling::never(&config.directory, &config.file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let subscriber = Registry::default()
        .with(filter)
        .with(console_layer)
        .with(file_layer);

    tracing::subscriber::set_global_default(subscriber)
        .context("Global tracing subscriber already set")?;

    // Bridge `log` records from dependencies into tracing
    if let Err(e) = LogTracer::init() {
        eprintln!("Warning: Failed to initialize LogTracer: {:?}", e);
    }

    Ok(guard)
}

/// Log a forwarded request record as JSON at debug level
pub fn log_transaction(log_entry: &ForwardLog) -> Result<()> {
    let log_message = serde_json::to_string(log_entry)?;
    debug!("FORWARD {}", log_message);
    Ok(())
}

/// Log an error message
pub fn log_error(message: &str) {
    error!("{}", message);
}

/// Log an info message
pub fn log_info(message: &str) {
    info!("{}", message);
}

/// Log a warning message
pub fn log_warning(message: &str) {
    warn!("{}", message);
}

/// Log a debug message
pub fn log_debug(message: &str) {
    debug!("{}", message);
}

/// Convenience macro for logging forwarded requests
#[macro_export]
macro_rules! log_forward {
    ($log_entry:expr) => {
        if let Err(e) = $crate::logging::log_transaction($log_entry) {
            eprintln!("Failed to log forwarded request: {}", e);
        }
    };
}

/// Convenience macro for logging errors
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::log_error(&format!($($arg)*));
    };
}

/// Convenience macro for logging info messages
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::log_info(&format!($($arg)*));
    };
}

/// Convenience macro for logging warning messages
#[macro_export]
macro_rules! log_warning {
    ($($arg:tt)*) => {
        $crate::logging::log_warning(&format!($($arg)*));
    };
}

/// Convenience macro for logging debug messages
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logging::log_debug(&format!($($arg)*));
    };
}
