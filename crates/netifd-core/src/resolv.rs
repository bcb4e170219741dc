//! The resolv.conf writer: one `# Interface <name>` block per UP
//! interface that has DNS data, config-IP servers before proto-IP ones,
//! written to a `.tmp` file and atomically renamed into place so readers
//! never observe a half-written file.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::error::Result;
use crate::interface::{Interface, InterfaceRegistry, InterfaceState};
use crate::ip::IpSettings;

/// Writes `resolv_conf` by rendering every UP interface's DNS data, via
/// a same-directory `.tmp` file and an atomic rename.
///
/// # Errors
/// Returns [`crate::error::Error::ResolvWrite`] if the temporary file
/// can't be written or the rename fails.
pub fn write(interfaces: &InterfaceRegistry, resolv_conf: &Path) -> Result<()> {
    let mut contents = String::new();
    for iface in interfaces.iter() {
        render_interface(&mut contents, iface);
    }

    let tmp_path = tmp_path(resolv_conf);
    fs::write(&tmp_path, contents).map_err(crate::error::Error::ResolvWrite)?;
    fs::rename(&tmp_path, resolv_conf).map_err(crate::error::Error::ResolvWrite)?;
    Ok(())
}

fn tmp_path(resolv_conf: &Path) -> std::path::PathBuf {
    let mut name = resolv_conf.as_os_str().to_os_string();
    name.push(".tmp");
    name.into()
}

fn render_interface(out: &mut String, iface: &Interface) {
    if iface.state() != InterfaceState::Up {
        return;
    }
    let config_ip = iface.config_ip();
    let proto_ip = iface.proto_ip();
    let has_dns = has_dns_data(config_ip) || (!proto_ip.is_dns_suppressed() && has_dns_data(proto_ip));
    if !has_dns {
        return;
    }

    let _ = writeln!(out, "# Interface {}", iface.name());
    render_entries(out, config_ip);
    if !proto_ip.is_dns_suppressed() {
        render_entries(out, proto_ip);
    }
}

fn has_dns_data(ip: &IpSettings) -> bool {
    ip.dns_servers().next().is_some() || ip.search_domains().next().is_some()
}

fn render_entries(out: &mut String, ip: &IpSettings) {
    for server in ip.dns_servers() {
        let _ = writeln!(out, "nameserver {server}");
    }
    for domain in ip.search_domains() {
        let _ = writeln!(out, "search {domain}");
    }
}
