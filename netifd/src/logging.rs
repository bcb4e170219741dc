//! Structured logging setup.
//!
//! An [`tracing_subscriber::EnvFilter`] driven by `RUST_LOG` (default
//! `info`), a `pretty` or `json` formatter selected by `NETIFD_LOG_FORMAT`,
//! and — when running as a daemon — a daily-rotating file appender
//! alongside console output. One-shot CLI invocations (`status`, `up`,
//! `down`, `reload`) use [`init_cli`] instead, which skips the file
//! appender entirely so structured logs never interleave with the
//! command's own stdout.

use std::env;
use std::path::Path;

use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Error, Result};

const DAYS_TO_KEEP: usize = 7;

/// Initializes console-only logging for a one-shot CLI command.
///
/// # Errors
/// Returns [`Error::Logging`] if a subscriber is already installed.
pub fn init_cli() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let format = env::var("NETIFD_LOG_FORMAT").unwrap_or_else(|_| String::from("pretty"));
    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match format.as_str() {
        "json" => registry.with(fmt::layer().json().with_target(true).with_level(true)).try_init(),
        _ => registry
            .with(fmt::layer().pretty().with_target(true).with_level(true))
            .try_init(),
    };
    result.map_err(|err| Error::Logging(err.to_string()))
}

/// Initializes dual console+file logging for the daemon's `serve` loop.
/// Console output respects `RUST_LOG` (default `info`); file output uses
/// `NETIFD_FILE_LOG` (default `info`) and is never colorized. The file
/// appender rotates daily under `log_dir`, keeping `DAYS_TO_KEEP` days.
///
/// # Errors
/// Returns [`Error::Logging`] if the log directory can't be created or a
/// subscriber is already installed.
pub fn init_daemon(log_dir: &Path) -> Result<()> {
    let console_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_filter = env::var("NETIFD_FILE_LOG").map(EnvFilter::new).unwrap_or_else(|_| EnvFilter::new("info"));

    std::fs::create_dir_all(log_dir).map_err(|err| Error::Logging(err.to_string()))?;
    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .max_log_files(DAYS_TO_KEEP)
        .filename_prefix("netifd")
        .filename_suffix("log")
        .build(log_dir)
        .map_err(|err| Error::Logging(err.to_string()))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    // Leaked deliberately: the daemon process lives as long as this
    // subscriber does, so there's no later point to flush and drop it.
    std::mem::forget(guard);

    let format = env::var("NETIFD_LOG_FORMAT").unwrap_or_else(|_| String::from("pretty"));
    let registry = tracing_subscriber::registry();

    let result = match format.as_str() {
        "json" => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_level(true)
                    .with_writer(std::io::stdout)
                    .with_filter(console_filter),
            )
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_level(true)
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_filter(file_filter),
            )
            .try_init(),
        _ => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_level(true)
                    .with_writer(std::io::stdout)
                    .with_filter(console_filter),
            )
            .with(
                fmt::layer()
                    .compact()
                    .with_target(true)
                    .with_level(true)
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_filter(file_filter),
            )
            .try_init(),
    };
    result.map_err(|err| Error::Logging(err.to_string()))
}
