//! The management facade: spec.md §6's RPC surface
//! (`network.restart`, `network.reload`,
//! `network.device.status`/`set_alias`,
//! `network.interface.<name>.{up,down,status,notify_proto,remove}`),
//! exposed as an in-process trait a real ubus-equivalent transport would
//! sit on top of. [`Daemon`] implements it directly so tests can call it
//! exactly the way a transport's handlers would.

use serde_json::{Value, json};

use netifd_core::protocol::Notify;

use crate::config::ConfigSource;
use crate::daemon::Daemon;
use crate::error::Result;

/// The in-process RPC surface a transport would expose.
pub trait ManagementApi {
    /// `network.restart`: tears every interface down, then reloads
    /// configuration from `source` as if the daemon had just started.
    ///
    /// # Errors
    /// Propagates errors from teardown or from the subsequent reload.
    fn network_restart(&mut self, source: &dyn ConfigSource) -> Result<()>;

    /// `network.reload`: re-applies `source`'s configuration without
    /// tearing down interfaces that are unaffected by the change.
    ///
    /// # Errors
    /// Propagates errors from loading or applying the configuration.
    fn network_reload(&mut self, source: &dyn ConfigSource) -> Result<()>;

    /// `network.device.status`: a status object for one device, or
    /// `None` if no such device is registered.
    fn device_status(&self, name: &str) -> Option<Value>;

    /// `network.device.set_alias`: binds (or, with `target = None`,
    /// unbinds) the named alias device.
    ///
    /// # Errors
    /// Propagates errors from the underlying alias rebind.
    fn device_set_alias(&mut self, name: &str, target: Option<&str>) -> Result<()>;

    /// `network.interface.<name>.up`.
    ///
    /// # Errors
    /// Returns an error if `name` isn't a registered interface.
    fn interface_up(&mut self, name: &str) -> Result<()>;

    /// `network.interface.<name>.down`.
    ///
    /// # Errors
    /// Returns an error if `name` isn't a registered interface.
    fn interface_down(&mut self, name: &str) -> Result<()>;

    /// `network.interface.<name>.status`: a status object for one
    /// interface, or `None` if no such interface is registered.
    fn interface_status(&self, name: &str) -> Option<Value>;

    /// `network.interface.<name>.notify_proto`: forwards a notify
    /// message from the external protocol driver to the interface's
    /// attached handler.
    ///
    /// # Errors
    /// Returns an error if `name` isn't a registered interface.
    fn interface_notify_proto(&mut self, name: &str, message: Notify) -> Result<()>;

    /// `network.interface.<name>.remove`: schedules the interface for
    /// deletion once it reaches DOWN.
    ///
    /// # Errors
    /// Returns an error if `name` isn't a registered interface.
    fn interface_remove(&mut self, name: &str) -> Result<()>;
}

impl ManagementApi for Daemon {
    fn network_restart(&mut self, source: &dyn ConfigSource) -> Result<()> {
        let names: Vec<String> = self.interfaces().iter().map(|iface| iface.name().to_string()).collect();
        for name in &names {
            self.interfaces_mut().set_down(name, true, self.devices_mut())?;
        }
        self.network_reload(source)
    }

    fn network_reload(&mut self, source: &dyn ConfigSource) -> Result<()> {
        let parsed = source.load()?;
        self.load_config(parsed)
    }

    fn device_status(&self, name: &str) -> Option<Value> {
        let device = self.devices().get(name)?;
        let stats = self.devices().backend().dump_stats(device.ifname());
        Some(json!({
            "present": device.is_present(),
            "active": device.is_active(),
            "refcount": device.refcount(),
            "ifname": device.ifname(),
            "statistics": stats,
        }))
    }

    fn device_set_alias(&mut self, name: &str, target: Option<&str>) -> Result<()> {
        let events = self.devices_mut().alias_notify(name, target)?;
        self.interfaces_mut().apply_device_events(events, self.devices_mut())?;
        self.write_resolv_conf()
    }

    fn interface_up(&mut self, name: &str) -> Result<()> {
        self.interfaces_mut().set_up(name, self.devices_mut())?;
        self.write_resolv_conf()
    }

    fn interface_down(&mut self, name: &str) -> Result<()> {
        self.interfaces_mut().set_down(name, false, self.devices_mut())?;
        self.write_resolv_conf()
    }

    fn interface_status(&self, name: &str) -> Option<Value> {
        let iface = self.interfaces().get(name)?;
        Some(json!({
            "up": iface.state() == netifd_core::interface::InterfaceState::Up,
            "device": iface.main_device_name(),
            "l3_device": iface.l3_device_name(),
            "available": iface.is_available(),
            "errors": iface
                .errors()
                .iter()
                .map(|e| json!({ "subsystem": e.subsystem, "code": e.code, "data": e.data }))
                .collect::<Vec<_>>(),
        }))
    }

    fn interface_notify_proto(&mut self, name: &str, message: Notify) -> Result<()> {
        Ok(self.interfaces_mut().notify_proto(name, message)?)
    }

    fn interface_remove(&mut self, name: &str) -> Result<()> {
        self.interfaces_mut().remove_config(name, self.devices_mut())?;
        self.write_resolv_conf()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use netifd_core::hotplug::RecordingHotplugRunner;
    use netifd_core::system::InMemoryBackend;

    use super::*;
    use crate::config::TextConfigSource;

    fn daemon() -> Daemon {
        let dir = tempfile::tempdir().expect("tempdir");
        Daemon::new(
            Arc::new(InMemoryBackend::default()),
            dir.path().to_path_buf(),
            Arc::new(RecordingHotplugRunner::default()),
            dir.path().join("resolv.conf"),
            dir.path().join("netifd.sock"),
        )
    }

    #[test]
    fn interface_status_reports_unknown_interfaces_as_none() {
        let d = daemon();
        assert!(d.interface_status("ghost").is_none());
    }

    #[test]
    fn reload_picks_up_a_newly_added_interface() {
        let mut d = daemon();
        d.devices_mut().device_get("eth0", true).expect("create eth0");
        d.devices_mut().set_present("eth0", true).expect("present");

        let source = TextConfigSource::new(
            "config interface 'lan'\n    option ifname 'eth0'\n    option proto 'static'\n    option auto '1'\n",
        );
        d.network_reload(&source).expect("reload");
        assert!(d.interface_status("lan").is_some());
    }

    #[test]
    fn interface_up_on_an_unregistered_interface_is_an_error() {
        let mut d = daemon();
        assert!(d.interface_up("ghost").is_err());
    }
}
