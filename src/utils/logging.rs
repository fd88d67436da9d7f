//! Logging initialization for vipcore.
//!
//! Supports three formats:
//! - `pretty`: multi-line human readable output
//! - `component`: compact single-line output; events carry a `component`
//!   field (see [`log_component!`]) so one subsystem can be filtered out
//! - `json`: structured JSON lines for log aggregators

use std::fs::{File, OpenOptions};
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{CoreError, Result};

/// Builds the event filter: `RUST_LOG` when set, `cfg.level` otherwise.
pub fn build_filter(cfg: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level))
}

fn open_log_file(path: &str) -> Result<Arc<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Arc::new(file))
}

/// Initialize the global tracing subscriber from config.
///
/// Call this once at startup before any tracing events are emitted.
///
/// # Errors
/// Fails when the log file cannot be opened or a global subscriber is
/// already installed.
pub fn init_logging(cfg: &LoggingConfig) -> Result<()> {
    let filter = build_filter(cfg);
    let file = cfg.file.as_deref().map(open_log_file).transpose()?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let installed = match (cfg.format, file) {
        (LogFormat::Json, Some(file)) => builder.json().with_writer(file).try_init(),
        (LogFormat::Json, None) => builder.json().try_init(),
        (LogFormat::Pretty, Some(file)) => builder.pretty().with_ansi(false).with_writer(file).try_init(),
        (LogFormat::Pretty, None) => builder.pretty().try_init(),
        (LogFormat::Component, Some(file)) => {
            builder.compact().with_ansi(false).with_writer(file).try_init()
        }
        (LogFormat::Component, None) => builder.compact().try_init(),
    };
    installed.map_err(|e| CoreError::Config(format!("logging: {}", e)))
}

/// Emit a component-tagged tracing event.
///
/// Works with any tracing level (`trace`, `debug`, `info`, `warn`, `error`):
///
/// ```
/// # use vipcore::log_component;
/// log_component!(info, "scheduler", "deadline fired");
/// log_component!(warn, "heartbeat", "publish failed", failures = 3u32);
/// ```
#[macro_export]
macro_rules! log_component {
    ($level:ident, $component:expr, $msg:expr) => {
        tracing::$level!(component = $component, $msg)
    };
    ($level:ident, $component:expr, $msg:expr, $($key:ident = $val:expr),+ $(,)?) => {
        tracing::$level!(component = $component, $($key = $val,)+ $msg)
    };
}
