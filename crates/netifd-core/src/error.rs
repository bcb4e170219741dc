use std::net::IpAddr;

/// Errors raised by the core model.
///
/// Per the error-handling design: structural/config errors are rejected
/// before any state mutates, transient kernel errors are surfaced to the
/// caller of the failing `system_*` call without discarding the entry from
/// its collection, and per-interface operational errors are *not*
/// represented here at all — they go into [`crate::interface::InterfaceError`]
/// and drive a state transition rather than unwinding.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A device name did not resolve to a known or creatable device.
    #[error("unknown device {name}")]
    UnknownDevice {
        /// The device name that failed to resolve.
        name: String,
    },

    /// A VLAN-chain device name had a segment that doesn't parse as a VLAN id.
    #[error("invalid vlan id {segment} in device name {name}")]
    InvalidVlanId {
        /// The full dotted device name.
        name: String,
        /// The offending segment.
        segment: String,
    },

    /// No protocol handler is registered under this name.
    #[error("unknown protocol handler {name}")]
    UnknownProtocol {
        /// The requested protocol name.
        name: String,
    },

    /// No interface exists under this name.
    #[error("unknown interface {name}")]
    UnknownInterface {
        /// The requested interface name.
        name: String,
    },

    /// An address string failed to parse.
    #[error("unparseable address {raw}")]
    UnparseableAddress {
        /// The raw text that failed to parse.
        raw: String,
    },

    /// A prefix length exceeded the bound for its address family.
    #[error("prefix length {length} out of range for {addr}")]
    PrefixOutOfRange {
        /// The address the length was attached to.
        addr: IpAddr,
        /// The rejected length.
        length: u8,
    },

    /// The system backend refused or failed an operation.
    #[error("system backend operation {operation} failed: {reason}")]
    SystemBackend {
        /// The operation that failed (e.g. `"add_address"`).
        operation: &'static str,
        /// A human-readable reason, usually from the underlying OS error.
        reason: String,
    },

    /// Launching an external process failed.
    #[error("failed to launch {what}: {source}")]
    Spawn {
        /// What was being launched (protocol script, hotplug command).
        what: &'static str,
        /// The underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// Writing resolv.conf failed.
    #[error("failed to write resolv.conf: {0}")]
    ResolvWrite(#[source] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
