//! The narrow boundary between the daemon and its configuration source.
//!
//! The real UCI parser (reading `/etc/config/network`) is an external
//! collaborator; what lives here is a minimal UCI-flavoured text parser
//! sufficient to drive the daemon from a file or an in-memory string in
//! tests, plus the [`ConfigSource`] trait a richer implementation could
//! stand behind without the daemon caring.

mod uci;

use std::fs;
use std::path::{Path, PathBuf};

use netifd_core::device::DeviceConfig;
use netifd_core::interface::InterfaceConfig;

use crate::error::{Error, Result};

/// Every device and interface section parsed from one configuration
/// source, in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedConfig {
    /// `config device` sections, named.
    pub devices: Vec<(String, DeviceConfig)>,
    /// `config interface` sections, named.
    pub interfaces: Vec<(String, InterfaceConfig)>,
}

/// A source the daemon can load its configuration from.
pub trait ConfigSource {
    /// Loads and parses the configuration.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if the source can't be read or doesn't
    /// parse as valid UCI-flavoured text.
    fn load(&self) -> Result<ParsedConfig>;
}

/// Loads configuration from a file on disk, in the `/etc/config/network`
/// location and format.
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    /// Builds a source that reads `path` on every [`ConfigSource::load`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> Result<ParsedConfig> {
        let text = fs::read_to_string(&self.path).map_err(|err| Error::Config {
            source: self.path.display().to_string(),
            reason: err.to_string(),
        })?;
        parse(&text, &self.path)
    }
}

/// Loads configuration from an in-memory string, for tests and for
/// embedding a default configuration.
pub struct TextConfigSource {
    text: String,
}

impl TextConfigSource {
    /// Builds a source over `text`.
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl ConfigSource for TextConfigSource {
    fn load(&self) -> Result<ParsedConfig> {
        parse(&self.text, Path::new("<inline>"))
    }
}

fn parse(text: &str, source: &Path) -> Result<ParsedConfig> {
    uci::parse(text).map_err(|reason| Error::Config { source: source.display().to_string(), reason })
}

#[cfg(test)]
mod tests {
    use super::*;
    use netifd_core::device::DeviceKind;

    #[test]
    fn parses_devices_and_interfaces_from_text() {
        let source = TextConfigSource::new(
            r"
config device
    option name 'br-lan'
    option type 'bridge'
    list ports 'eth0'
    list ports 'eth1'

config interface 'lan'
    option ifname 'br-lan'
    option proto 'static'
    option auto '1'
    option metric '10'

config interface 'wan'
    option ifname 'eth2'
    option proto 'dhcp'
    option auto '0'
    option defaultroute '0'
",
        );

        let parsed = source.load().expect("valid config");
        assert_eq!(parsed.devices.len(), 1);
        assert_eq!(parsed.devices[0].0, "br-lan");
        assert!(matches!(&parsed.devices[0].1.kind, DeviceKind::Bridge { members } if members == &["eth0", "eth1"]));

        assert_eq!(parsed.interfaces.len(), 2);
        let lan = &parsed.interfaces[0].1;
        assert_eq!(lan.ifname, "br-lan");
        assert_eq!(lan.proto, "static");
        assert!(lan.autostart);
        assert_eq!(lan.metric, 10);
        assert!(!lan.no_defaultroute);

        let wan = &parsed.interfaces[1].1;
        assert!(!wan.autostart);
        assert!(wan.no_defaultroute);
    }

    #[test]
    fn missing_file_is_a_config_error_not_a_panic() {
        let source = FileConfigSource::new("/nonexistent/path/to/network");
        assert!(source.load().is_err());
    }
}
