//! The in-memory model and state machines at the core of `netifd`: the
//! device registry and dependent graph, alias devices, VLAN chaining,
//! the generic versioned-collection reconciliation primitive, IP
//! settings reconciliation, the interface state machine, protocol
//! handlers, the hotplug event queue, the system-backend trait
//! boundary, and the resolv.conf writer.
//!
//! This crate owns no I/O loop of its own — the `netifd` binary crate
//! drives it from a single-threaded cooperative event loop, per the
//! concurrency model: every mutation of the device registry, interface
//! registry, and IP collections runs to completion before control
//! returns to that loop.

pub mod device;
pub mod error;
pub mod hotplug;
pub mod interface;
pub mod ip;
pub mod protocol;
pub mod resolv;
pub mod system;
pub mod versioned;

pub use error::{Error, Result};
