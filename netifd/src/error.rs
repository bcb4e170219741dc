//! The daemon's error type: wraps the reconciliation core's errors with
//! the failure modes that belong to the binary crate itself (config
//! loading, logging setup).

use thiserror::Error;

/// Errors surfaced by the `netifd` binary, as opposed to the
/// reconciliation core in `netifd_core`.
#[derive(Debug, Error)]
pub enum Error {
    /// The reconciliation core rejected an operation.
    #[error(transparent)]
    Core(#[from] netifd_core::Error),

    /// The configuration source could not be read or parsed.
    #[error("failed to load configuration from {source}: {reason}")]
    Config {
        /// Where the configuration was being loaded from (a path, or
        /// `"<inline>"` for a string source).
        source: String,
        /// What went wrong.
        reason: String,
    },

    /// Structured logging failed to initialize.
    #[error("failed to initialize logging: {0}")]
    Logging(String),
}

/// Convenience alias used throughout the binary crate.
pub type Result<T> = std::result::Result<T, Error>;
