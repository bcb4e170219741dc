//! Binary-crate plumbing around `netifd_core`: configuration loading,
//! the daemon event loop, the management facade, logging, and the CLI.
//! The reconciliation semantics themselves — device claims, interface
//! state machine, IP settings — live in `netifd_core`; this crate wires
//! that engine to a filesystem config source, a process supervisor, and
//! a command line.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod management;

pub use error::{Error, Result};
