//! The daemon: owns the device registry, interface registry, and hotplug
//! queue, and drives them from a single-threaded cooperative event loop.
//! Nothing here ever `.await`s inside a core mutation — only at the
//! `next_proto_event` suspension point between reconciliation passes, per
//! the concurrency model the core crate was built against.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use netifd_core::device::DeviceRegistry;
use netifd_core::hotplug::{HotplugQueue, HotplugRunner};
use netifd_core::interface::InterfaceRegistry;
use netifd_core::protocol::ProtocolHandlerRegistry;
use netifd_core::system::SystemBackend;

use crate::config::ParsedConfig;
use crate::error::Result;

/// Everything the daemon owns, and the socket path a real transport
/// would bind to (recorded, not acted on — see [`SPEC_FULL`]'s
/// management-facade section).
pub struct Daemon {
    devices: DeviceRegistry,
    interfaces: InterfaceRegistry,
    hotplug: HotplugQueue,
    resolv_conf: PathBuf,
    socket_path: PathBuf,
}

impl Daemon {
    /// Builds an empty daemon. Call [`Self::load_config`] before
    /// [`Self::run`] to populate it.
    pub fn new(
        backend: Arc<dyn SystemBackend>,
        script_dir: PathBuf,
        hotplug_runner: Arc<dyn HotplugRunner>,
        resolv_conf: PathBuf,
        socket_path: PathBuf,
    ) -> Self {
        let hotplug = HotplugQueue::new(hotplug_runner);
        let mut interfaces = InterfaceRegistry::new(ProtocolHandlerRegistry::with_builtins(script_dir));
        interfaces.set_hotplug(hotplug.clone());
        Self {
            devices: DeviceRegistry::new(backend),
            interfaces,
            hotplug,
            resolv_conf,
            socket_path,
        }
    }

    /// The management socket path this daemon was configured with.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Read-only access to the device registry, for status dumps.
    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    /// Read-only access to the interface registry, for status dumps.
    pub fn interfaces(&self) -> &InterfaceRegistry {
        &self.interfaces
    }

    /// The hotplug queue, shared with anything that wants to observe or
    /// drive it directly (tests mostly; the daemon queues its own events
    /// internally as interfaces reach UP/DOWN).
    pub fn hotplug(&self) -> &HotplugQueue {
        &self.hotplug
    }

    /// Applies `parsed` as the daemon's full configuration: devices
    /// first (an interface's `ifname` often names a device section),
    /// then interfaces, mirroring the original's two-phase config load.
    /// Locked for the duration so a device RECREATE's dependent transfer
    /// doesn't trigger a premature `free_unused` sweep mid-load.
    ///
    /// # Errors
    /// Propagates errors from any device or interface apply.
    pub fn load_config(&mut self, parsed: ParsedConfig) -> Result<()> {
        self.devices.lock();
        let result = self.load_config_locked(parsed);
        self.devices.unlock();
        result?;
        self.devices.set_initial_config_done();
        self.devices.free_unused();
        self.write_resolv_conf()?;
        Ok(())
    }

    fn load_config_locked(&mut self, parsed: ParsedConfig) -> Result<()> {
        for (name, config) in parsed.devices {
            let (_outcome, events) = self.devices.apply_config(&name, config)?;
            self.interfaces.apply_device_events(events, &mut self.devices)?;
        }
        for (name, config) in parsed.interfaces {
            self.interfaces.apply_config(&name, config, &mut self.devices)?;
        }

        // `apply_config`'s CREATED outcome leaves a fresh interface in
        // DOWN even when it's marked `auto` — bring-up on config load is
        // the loader's job, the same way the original's `interface_add`
        // defers to a caller-driven `interface_set_up` rather than doing
        // it itself.
        let autostart_candidates: Vec<String> = self
            .interfaces
            .iter()
            .filter(|iface| iface.autostart() && iface.is_available() && iface.state() == netifd_core::interface::InterfaceState::Down)
            .map(|iface| iface.name().to_string())
            .collect();
        for name in autostart_candidates {
            self.interfaces.set_up(&name, &mut self.devices)?;
        }
        Ok(())
    }

    /// Drives the event loop until every protocol sender has been
    /// dropped (daemon shutdown). Each iteration applies exactly one
    /// protocol event to completion, then re-renders resolv.conf —
    /// cheap enough that doing it unconditionally is simpler than
    /// tracking whether DNS actually changed.
    ///
    /// # Errors
    /// Propagates errors from interface reconciliation or the
    /// resolv.conf writer.
    pub async fn run(&mut self) -> Result<()> {
        while self.interfaces.next_proto_event(&mut self.devices).await? {
            self.write_resolv_conf()?;
        }
        Ok(())
    }

    pub(crate) fn write_resolv_conf(&self) -> Result<()> {
        netifd_core::resolv::write(&self.interfaces, &self.resolv_conf)?;
        Ok(())
    }

    pub(crate) fn devices_mut(&mut self) -> &mut DeviceRegistry {
        &mut self.devices
    }

    pub(crate) fn interfaces_mut(&mut self) -> &mut InterfaceRegistry {
        &mut self.interfaces
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use netifd_core::hotplug::RecordingHotplugRunner;
    use netifd_core::interface::InterfaceState;
    use netifd_core::system::InMemoryBackend;

    use super::*;
    use crate::config::{ConfigSource, TextConfigSource};
    use crate::management::ManagementApi;

    fn daemon(backend: Arc<InMemoryBackend>) -> Daemon {
        let dir = tempfile::tempdir().expect("tempdir");
        Daemon::new(
            backend,
            dir.path().to_path_buf(),
            Arc::new(RecordingHotplugRunner::default()),
            dir.path().join("resolv.conf"),
            dir.path().join("netifd.sock"),
        )
    }

    #[test]
    fn load_config_brings_up_an_available_static_interface() {
        let backend = Arc::new(InMemoryBackend::default());
        backend.set_present("eth0", true);
        let mut d = daemon(backend);

        let source = TextConfigSource::new(
            "config interface 'lan'\n    option ifname 'eth0'\n    option proto 'static'\n    option auto '1'\n",
        );
        d.load_config(source.load().expect("parse")).expect("load");

        // `load_config` already claims the device and issues Setup;
        // `static`'s Up event is queued on the channel rather than
        // applied synchronously, so the interface is still SETUP until
        // the loop (or this poll) drains it.
        assert_eq!(d.interfaces().get("lan").expect("lan exists").state(), InterfaceState::Setup);
        d.interfaces_mut().poll_proto_events(d.devices_mut()).expect("drain");
        assert_eq!(d.interfaces().get("lan").expect("lan exists").state(), InterfaceState::Up);
    }

    #[test]
    fn device_set_alias_reaches_a_down_interface_through_the_facade() {
        let backend = Arc::new(InMemoryBackend::default());
        let mut d = daemon(backend);
        d.devices_mut().device_get("eth0", true).expect("create eth0");

        d.device_set_alias("lanalias", Some("eth0")).expect("bind alias");
        assert!(d.device_status("lanalias").is_some());
    }
}
