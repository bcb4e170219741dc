//! Per-interface operational error log.

/// One entry in an interface's error log. Cleared on every `set_up` and
/// config reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceError {
    /// The subsystem that raised the error (`"device"`, `"proto"`, ...).
    pub subsystem: String,
    /// A short machine-readable code (`"NO_DEVICE"`, `"SETUP_FAILED"`, ...).
    pub code: String,
    /// Free-form diagnostic data, e.g. the backend's failure reason.
    pub data: Vec<String>,
}

impl InterfaceError {
    /// Builds a new error log entry.
    pub fn new(subsystem: impl Into<String>, code: impl Into<String>, data: Vec<String>) -> Self {
        Self { subsystem: subsystem.into(), code: code.into(), data }
    }
}
