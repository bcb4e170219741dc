//! The interface state machine and its registry.
//!
//! An [`Interface`] claims a device, attaches a protocol handler, and
//! sequences that handler's SETUP/TEARDOWN against the two IP settings
//! bundles it owns. Device claim/release is mediated through a
//! [`crate::device::DeviceRegistry`] passed into every method that needs
//! it, rather than owned directly — interfaces hold device *names*, the
//! same "handles, not owning pointers" choice made in [`crate::device`].

mod error;

pub use error::InterfaceError;

use std::collections::HashMap;
use std::time::SystemTime;

use serde_json::Value;

use netifd_common::{Property, PropertyStream};
use tokio::sync::mpsc;

use crate::device::{DeviceEvent, DeviceRegistry, Owner};
use crate::error::{Error, Result};
use crate::hotplug::{HotplugEvent, HotplugQueue};
use crate::ip::{DeviceRoute, IpSettings};
use crate::protocol::{ProtoCommand, ProtoEvent, ProtocolHandler, ProtocolHandlerRegistry};
use crate::system::SystemBackend;

/// Which leg of the interface's device claim an event arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSlot {
    /// The interface's main device dependent.
    Main,
    /// The interface's L3 device dependent.
    L3,
}

/// The interface's four lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceState {
    /// Idle: no device claimed, no protocol running.
    Down,
    /// Protocol is starting.
    Setup,
    /// Protocol reports link up.
    Up,
    /// Protocol is stopping.
    Teardown,
}

/// The interface's pending configuration action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigState {
    /// No pending configuration change.
    Normal,
    /// A new configuration is waiting for the current DOWN transition.
    Reload,
    /// The interface should be deleted once it reaches DOWN.
    Remove,
}

/// The user-authored configuration for one interface.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceConfig {
    /// The device name or alias/VLAN-chain hint this interface binds to.
    /// Empty means "no device configured yet".
    pub ifname: String,
    /// The registered protocol handler name to attach.
    pub proto: String,
    /// Opaque configuration blob handed to the protocol's `attach`.
    pub proto_config: Value,
    /// Whether this interface should come up automatically.
    pub autostart: bool,
    /// The metric inherited by routes with no metric of their own.
    pub metric: u32,
    /// Suppresses installing default routes while keeping them tracked.
    pub no_defaultroute: bool,
}

/// Outcome of applying an [`InterfaceConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigApplyOutcome {
    /// A new interface was created.
    Created,
    /// Configuration was unchanged.
    NoChange,
    /// Configuration differs; a reload was applied (immediately if the
    /// interface was DOWN, otherwise deferred to the next DOWN).
    Reloaded,
    /// The interface is scheduled for removal once it reaches DOWN
    /// (immediately, if it already was).
    Removed,
}

/// An interface: the named logical network endpoint.
pub struct Interface {
    name: String,
    config: InterfaceConfig,
    main_dev: Option<String>,
    l3_ifname: Option<String>,
    protocol: Option<Box<dyn ProtocolHandler>>,
    state: InterfaceState,
    state_property: Property<InterfaceState>,
    available: bool,
    config_state: ConfigState,
    config_ip: IpSettings,
    proto_ip: IpSettings,
    host_routes: Vec<DeviceRoute>,
    start_time: Option<SystemTime>,
    errors: Vec<InterfaceError>,
}

impl Interface {
    /// The interface's logical name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current state.
    pub fn state(&self) -> InterfaceState {
        self.state
    }

    /// Subscribes to this interface's state transitions, for callers
    /// (tests, a status-watching client) that want to await a change
    /// rather than poll [`Self::state`].
    pub fn watch_state(&self) -> PropertyStream<InterfaceState> {
        self.state_property.watch()
    }

    fn set_state(&mut self, state: InterfaceState) {
        self.state = state;
        self.state_property.set(state);
    }

    /// Whether the configured device is currently available to claim.
    pub fn is_available(&self) -> bool {
        self.available
    }

    /// The device name claimed as this interface's main dependent.
    pub fn main_device_name(&self) -> Option<&str> {
        self.main_dev.as_deref()
    }

    /// The effective L3 ifname (what protocols/consumers should treat as
    /// "the" device), tracking the main device unless a protocol
    /// explicitly switched it via notify.
    pub fn l3_device_name(&self) -> Option<&str> {
        self.l3_ifname.as_deref().or(self.main_dev.as_deref())
    }

    /// User-authored IP settings.
    pub fn config_ip(&self) -> &IpSettings {
        &self.config_ip
    }

    /// Protocol-supplied IP settings.
    pub fn proto_ip(&self) -> &IpSettings {
        &self.proto_ip
    }

    /// Protocol-supplied IP settings, mutably (tests and the notify path
    /// poking proto-IP directly rather than through a full link update).
    pub fn proto_ip_mut(&mut self) -> &mut IpSettings {
        &mut self.proto_ip
    }

    /// The interface's operational error log.
    pub fn errors(&self) -> &[InterfaceError] {
        &self.errors
    }

    /// Appends an operational error.
    pub fn add_error(&mut self, subsystem: impl Into<String>, code: impl Into<String>, data: Vec<String>) {
        self.errors.push(InterfaceError::new(subsystem, code, data));
    }

    /// The interface's configured metric.
    pub fn metric(&self) -> u32 {
        self.config.metric
    }

    /// Whether this interface should come up as soon as its device is
    /// available, without an explicit `up` call.
    pub fn autostart(&self) -> bool {
        self.config.autostart
    }

    fn main_owner(&self) -> Owner {
        Owner::InterfaceMain(self.name.clone())
    }

    fn l3_owner(&self) -> Owner {
        Owner::InterfaceL3(self.name.clone())
    }
}

/// The interface registry: every configured interface, plus the
/// protocol factory table used to attach handlers.
pub struct InterfaceRegistry {
    interfaces: HashMap<String, Interface>,
    protocols: ProtocolHandlerRegistry,
    event_tx: mpsc::UnboundedSender<(String, ProtoEvent)>,
    event_rx: mpsc::UnboundedReceiver<(String, ProtoEvent)>,
    hotplug: Option<HotplugQueue>,
}

impl InterfaceRegistry {
    /// Creates an empty registry using `protocols` to attach handlers.
    /// Every attached protocol instance reports back through the one
    /// channel this registry owns; [`Self::poll_proto_events`] drains it.
    pub fn new(protocols: ProtocolHandlerRegistry) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self { interfaces: HashMap::new(), protocols, event_tx, event_rx, hotplug: None }
    }

    /// Wires the hotplug queue this registry notifies as interfaces
    /// cross the UP/DOWN boundary (entering UP from SETUP; leaving UP
    /// for TEARDOWN or for SETUP on link loss). Left unset, interfaces
    /// still transition normally — nothing is queued.
    pub fn set_hotplug(&mut self, hotplug: HotplugQueue) {
        self.hotplug = Some(hotplug);
    }

    /// Drains every protocol event queued since the last call and applies
    /// each to its owning interface. The event loop (or tests) should
    /// call this after anything that might have run a protocol task to
    /// completion.
    ///
    /// # Errors
    /// Propagates errors from any device claim/release an event triggers.
    pub fn poll_proto_events(&mut self, devices: &mut DeviceRegistry) -> Result<()> {
        while let Ok((iface, event)) = self.event_rx.try_recv() {
            self.on_proto_event(&iface, event, devices)?;
        }
        Ok(())
    }

    /// Awaits the next protocol event and applies it to its owning
    /// interface. Used by the daemon's event loop; returns `Ok(false)`
    /// once every protocol sender has been dropped (registry shutdown).
    ///
    /// # Errors
    /// Propagates errors from any device claim/release the event
    /// triggers.
    pub async fn next_proto_event(&mut self, devices: &mut DeviceRegistry) -> Result<bool> {
        match self.event_rx.recv().await {
            Some((iface, event)) => {
                self.on_proto_event(&iface, event, devices)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Looks up an interface by name.
    pub fn get(&self, name: &str) -> Option<&Interface> {
        self.interfaces.get(name)
    }

    /// Looks up an interface by name, mutably.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Interface> {
        self.interfaces.get_mut(name)
    }

    /// Iterates every configured interface.
    pub fn iter(&self) -> impl Iterator<Item = &Interface> {
        self.interfaces.values()
    }

    /// Finds an interface in state UP whose logical name is `name`.
    pub fn find_up_by_name(&self, name: &str) -> Option<&Interface> {
        self.interfaces.get(name).filter(|iface| iface.state == InterfaceState::Up)
    }

    /// Applies `config` to interface `name`, creating, reloading, or
    /// scheduling removal depending on what changed.
    ///
    /// # Errors
    /// Propagates errors from device claim/release or protocol attach.
    pub fn apply_config(
        &mut self,
        name: &str,
        config: InterfaceConfig,
        devices: &mut DeviceRegistry,
    ) -> Result<ConfigApplyOutcome> {
        if !self.interfaces.contains_key(name) {
            self.create(name, config, devices)?;
            return Ok(ConfigApplyOutcome::Created);
        }

        let unchanged = self.interfaces[name].config == config;
        if unchanged {
            return Ok(ConfigApplyOutcome::NoChange);
        }

        let iface = self.interfaces.get_mut(name).expect("checked above");
        iface.config_state = ConfigState::Reload;
        self.set_down(name, false, devices)?;
        if self.interfaces[name].state == InterfaceState::Down {
            self.finish_pending_config(name, Some(config), devices)?;
        } else {
            // Stash the new config on the interface for the eventual DOWN
            // transition; reuse the `config` field as the pending value
            // since `config_state == Reload` already marks it dirty.
            self.interfaces.get_mut(name).expect("present").config = config;
        }
        Ok(ConfigApplyOutcome::Reloaded)
    }

    /// Schedules `name` for deletion once it reaches DOWN.
    ///
    /// # Errors
    /// Propagates errors from the `set_down` this triggers.
    pub fn remove_config(&mut self, name: &str, devices: &mut DeviceRegistry) -> Result<ConfigApplyOutcome> {
        let Some(iface) = self.interfaces.get_mut(name) else {
            return Err(Error::UnknownInterface { name: name.to_string() });
        };
        iface.config_state = ConfigState::Remove;
        self.set_down(name, false, devices)?;
        if self.interfaces.get(name).is_some_and(|i| i.state == InterfaceState::Down) {
            self.finish_pending_config(name, None, devices)?;
        }
        Ok(ConfigApplyOutcome::Removed)
    }

    fn create(&mut self, name: &str, config: InterfaceConfig, devices: &mut DeviceRegistry) -> Result<()> {
        let protocol = if config.proto.is_empty() {
            None
        } else {
            Some(self.protocols.attach(&config.proto, name, config.proto_config.clone(), self.event_tx.clone())?)
        };

        let main_dev = if config.ifname.is_empty() { None } else { Some(config.ifname.clone()) };
        let mut iface = Interface {
            name: name.to_string(),
            config,
            main_dev: None,
            l3_ifname: None,
            protocol,
            state: InterfaceState::Down,
            state_property: Property::new(InterfaceState::Down),
            available: false,
            config_state: ConfigState::Normal,
            config_ip: IpSettings::default(),
            proto_ip: IpSettings::default(),
            host_routes: Vec::new(),
            start_time: None,
            errors: Vec::new(),
        };

        sync_no_defaultroute(&mut iface, devices.backend(), name);

        if let Some(dev_name) = main_dev {
            let owner = iface.main_owner();
            let events = devices.add_user(&dev_name, owner, false)?;
            iface.main_dev = Some(dev_name);
            iface.available = devices.get(iface.main_dev.as_deref().expect("just set")).is_some_and(|d| d.is_present());
            self.interfaces.insert(name.to_string(), iface);
            self.route_device_events(events, devices)?;
        } else {
            self.interfaces.insert(name.to_string(), iface);
        }
        Ok(())
    }

    fn finish_pending_config(
        &mut self,
        name: &str,
        new_config: Option<InterfaceConfig>,
        devices: &mut DeviceRegistry,
    ) -> Result<()> {
        let remove = new_config.is_none();
        if remove {
            if let Some(iface) = self.interfaces.get(name) {
                if let Some(dev) = &iface.main_dev {
                    let owner = iface.main_owner();
                    let events = devices.remove_user(dev, &owner)?;
                    self.route_device_events(events, devices)?;
                }
            }
            self.interfaces.remove(name);
            devices.free_unused();
            return Ok(());
        }

        let new_config = new_config.expect("checked above");
        let old_dev = self.interfaces.get(name).and_then(|i| i.main_dev.clone());
        if let Some(old) = &old_dev {
            let owner = self.interfaces[name].main_owner();
            let events = devices.remove_user(old, &owner)?;
            self.route_device_events(events, devices)?;
        }

        let event_tx = self.event_tx.clone();
        let iface = self.interfaces.get_mut(name).expect("present");
        iface.protocol = if new_config.proto.is_empty() {
            None
        } else {
            Some(self.protocols.attach(&new_config.proto, name, new_config.proto_config.clone(), event_tx)?)
        };
        iface.main_dev = None;
        iface.l3_ifname = None;
        iface.config_state = ConfigState::Normal;
        let new_dev_name = (!new_config.ifname.is_empty()).then(|| new_config.ifname.clone());
        iface.config = new_config;
        sync_no_defaultroute(iface, devices.backend(), name);

        if let Some(dev_name) = new_dev_name {
            let owner = iface.main_owner();
            let events = devices.add_user(&dev_name, owner, false)?;
            let iface = self.interfaces.get_mut(name).expect("present");
            iface.main_dev = Some(dev_name);
            iface.available = devices.get(iface.main_dev.as_deref().expect("just set")).is_some_and(|d| d.is_present());
            self.route_device_events(events, devices)?;
        }

        if self.interfaces[name].config.autostart && self.interfaces[name].available {
            self.set_up(name, devices)?;
        }
        Ok(())
    }

    /// `set_up`: DOWN → SETUP, guarded by `available`.
    ///
    /// # Errors
    /// Returns [`Error::UnknownInterface`] if `name` isn't registered, or
    /// propagates a device claim failure.
    pub fn set_up(&mut self, name: &str, devices: &mut DeviceRegistry) -> Result<()> {
        let iface = self.interfaces.get_mut(name).ok_or_else(|| Error::UnknownInterface { name: name.to_string() })?;
        if iface.state != InterfaceState::Down {
            return Ok(());
        }
        if !iface.available {
            iface.add_error("device", "NO_DEVICE", vec![]);
            return Ok(());
        }
        let Some(dev_name) = iface.main_dev.clone() else {
            iface.add_error("device", "NO_DEVICE", vec![]);
            return Ok(());
        };
        let owner = iface.main_owner();
        iface.errors.clear();

        let events = devices.claim(&dev_name, owner)?;
        let iface = self.interfaces.get_mut(name).expect("present");
        iface.set_state(InterfaceState::Setup);
        iface.start_time = Some(now());
        let has_protocol = iface.protocol.is_some();
        if has_protocol {
            iface.protocol.as_mut().expect("checked").handle(ProtoCommand::Setup);
        }
        if !has_protocol {
            // No protocol attached: treat as immediately up with whatever
            // config-IP already holds.
            protocol_absent_up(self, name, devices)?;
        }
        self.route_device_events(events, devices)
    }

    /// `set_down`: UP/SETUP → TEARDOWN. `force` skips the
    /// protocol's graceful phase and reclaims devices immediately.
    ///
    /// # Errors
    /// Returns [`Error::UnknownInterface`] if `name` isn't registered.
    pub fn set_down(&mut self, name: &str, force: bool, devices: &mut DeviceRegistry) -> Result<()> {
        let iface = self.interfaces.get_mut(name).ok_or_else(|| Error::UnknownInterface { name: name.to_string() })?;
        if !matches!(iface.state, InterfaceState::Up | InterfaceState::Setup) {
            if force && iface.state == InterfaceState::Down {
                return self.finalize_teardown(name, devices);
            }
            return Ok(());
        }
        let was_up = iface.state == InterfaceState::Up;
        let dev_name = resolve_dev_name(iface, devices, name);
        let backend = devices.backend();
        iface.config_ip.disable(backend, &dev_name);
        iface.set_state(InterfaceState::Teardown);
        if was_up && let Some(hotplug) = &self.hotplug {
            hotplug.queue_event(name, HotplugEvent::Down);
        }
        if let Some(protocol) = iface.protocol.as_mut() {
            protocol.handle(ProtoCommand::Teardown { force });
        }
        if force || iface.protocol.is_none() {
            return self.finalize_teardown(name, devices);
        }
        Ok(())
    }

    fn finalize_teardown(&mut self, name: &str, devices: &mut DeviceRegistry) -> Result<()> {
        let backend = devices.backend_arc();
        let iface = self.interfaces.get(name).expect("present");
        let iface_dev_name = resolve_dev_name(iface, devices, name);
        let iface = self.interfaces.get_mut(name).expect("present");
        iface.proto_ip.flush(backend.as_ref(), &iface_dev_name);
        iface.set_state(InterfaceState::Down);

        let dev_name = iface.main_dev.clone();
        let owner = iface.main_owner();
        let mut events = Vec::new();
        if let Some(dev_name) = dev_name {
            events = devices.release(&dev_name, &owner)?;
        }
        self.route_device_events(events, devices)?;

        match self.interfaces.get(name).map(|i| i.config_state) {
            Some(ConfigState::Reload) => {
                let pending = self.interfaces[name].config.clone();
                self.finish_pending_config(name, Some(pending), devices)?;
            }
            Some(ConfigState::Remove) => {
                self.finish_pending_config(name, None, devices)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// `set_available`: any state → `set_down(force=true)`
    /// when the device becomes unavailable.
    ///
    /// # Errors
    /// Propagates errors from the forced `set_down`.
    pub fn set_available(&mut self, name: &str, available: bool, devices: &mut DeviceRegistry) -> Result<()> {
        let Some(iface) = self.interfaces.get_mut(name) else {
            return Ok(());
        };
        iface.available = available;
        if !available {
            self.set_down(name, true, devices)?;
        } else if iface.config.autostart && iface.state == InterfaceState::Down {
            self.set_up(name, devices)?;
        }
        Ok(())
    }

    /// Delivers a protocol event to interface `name`.
    ///
    /// # Errors
    /// Propagates errors from any device claim/release this triggers.
    pub fn on_proto_event(&mut self, name: &str, event: ProtoEvent, devices: &mut DeviceRegistry) -> Result<()> {
        let Some(iface) = self.interfaces.get_mut(name) else {
            return Ok(());
        };
        match (iface.state, event) {
            (InterfaceState::Setup, ProtoEvent::Up(update)) => {
                if let Some(new_ifname) = &update.ifname {
                    iface.l3_ifname = Some(new_ifname.clone());
                }
                let dev_name = resolve_dev_name(iface, devices, name);
                let backend = devices.backend_arc();
                apply_link_update(iface, backend.as_ref(), &dev_name, &update);
                iface.config_ip.enable(backend.as_ref(), &dev_name);
                for route in std::mem::take(&mut iface.host_routes) {
                    if !route.is_external() {
                        if let Err(reason) = backend.add_route(&dev_name, &route) {
                            tracing::warn!(iface = name, %reason, "host route install failed");
                        }
                    }
                    iface.host_routes.push(route);
                }
                iface.set_state(InterfaceState::Up);
                if let Some(hotplug) = &self.hotplug {
                    hotplug.queue_event(name, HotplugEvent::Up);
                }
            }
            (InterfaceState::Setup, ProtoEvent::Down) => {
                iface.add_error("proto", "SETUP_FAILED", vec![]);
                return self.finalize_teardown(name, devices);
            }
            (InterfaceState::Up, ProtoEvent::LinkLost) => {
                iface.set_state(InterfaceState::Setup);
                if let Some(hotplug) = &self.hotplug {
                    hotplug.queue_event(name, HotplugEvent::Down);
                }
            }
            (InterfaceState::Teardown, ProtoEvent::Down) => {
                return self.finalize_teardown(name, devices);
            }
            _ => {}
        }
        Ok(())
    }

    /// Adds a host route reachable through this interface's subnet.
    pub fn add_target_route(&mut self, name: &str, route: DeviceRoute) {
        if let Some(iface) = self.interfaces.get_mut(name) {
            iface.host_routes.push(route);
        }
    }

    /// Toggles `no_defaultroute` on a live interface, reconciling both IP
    /// bundles against the backend immediately rather than waiting for a
    /// full config reload. Default routes already installed are removed
    /// (or reinstalled) in place; nothing else about the interface's
    /// state changes.
    ///
    /// # Errors
    /// Returns [`Error::UnknownInterface`] if `name` isn't registered.
    pub fn set_no_defaultroute(&mut self, name: &str, no_defaultroute: bool, devices: &DeviceRegistry) -> Result<()> {
        let iface = self.interfaces.get_mut(name).ok_or_else(|| Error::UnknownInterface { name: name.to_string() })?;
        iface.config.no_defaultroute = no_defaultroute;
        let dev_name = resolve_dev_name(iface, devices, name);
        let backend = devices.backend();
        sync_no_defaultroute(iface, backend, &dev_name);
        Ok(())
    }

    /// Delivers a notify message from the external protocol driver
    /// directly to `name`'s attached handler, the counterpart of the
    /// `network.interface.<name>.notify_proto` management call.
    ///
    /// # Errors
    /// Returns [`Error::UnknownInterface`] if `name` isn't registered.
    pub fn notify_proto(&mut self, name: &str, message: crate::protocol::Notify) -> Result<()> {
        let iface = self.interfaces.get_mut(name).ok_or_else(|| Error::UnknownInterface { name: name.to_string() })?;
        if let Some(protocol) = iface.protocol.as_mut() {
            protocol.notify(message);
        }
        Ok(())
    }

    /// Applies device events raised by a `DeviceRegistry` mutation with
    /// no interface action of its own (the config loader applying a
    /// `config device` section directly) to whichever interfaces own
    /// them. Everything that goes through [`Self::create`],
    /// [`Self::set_up`], [`Self::set_down`], etc. already routes its own
    /// events; this is the entry point for callers driving the device
    /// registry independently.
    ///
    /// # Errors
    /// Propagates errors from any device claim/release this triggers.
    pub fn apply_device_events(&mut self, events: Vec<(Owner, DeviceEvent)>, devices: &mut DeviceRegistry) -> Result<()> {
        self.route_device_events(events, devices)
    }

    /// Routes externally-visible device events (ADD/REMOVE affecting
    /// `available`, UpdateIfname affecting the L3 name) to the owning
    /// interface.
    fn route_device_events(&mut self, events: Vec<(Owner, DeviceEvent)>, devices: &mut DeviceRegistry) -> Result<()> {
        for (owner, event) in events {
            let (name, slot) = match owner {
                Owner::InterfaceMain(name) => (name, DeviceSlot::Main),
                Owner::InterfaceL3(name) => (name, DeviceSlot::L3),
                Owner::Alias(_) | Owner::Vlan(_) => continue,
            };
            match event {
                DeviceEvent::Add => self.set_available(&name, true, devices)?,
                DeviceEvent::Remove => self.set_available(&name, false, devices)?,
                DeviceEvent::UpdateIfname(new_name) => {
                    if let Some(iface) = self.interfaces.get_mut(&name)
                        && slot == DeviceSlot::Main
                    {
                        iface.l3_ifname = Some(new_name);
                    }
                }
                DeviceEvent::Setup | DeviceEvent::Up | DeviceEvent::Teardown | DeviceEvent::Down => {}
            }
        }
        Ok(())
    }
}

fn apply_link_update(iface: &mut Interface, backend: &dyn crate::system::SystemBackend, dev_name: &str, update: &crate::protocol::LinkUpdate) {
    use crate::ip::{AddrFlags, DeviceAddr};

    iface.proto_ip.update_start();
    for (addr, mask) in update.ipaddr.iter().chain(update.ip6addr.iter()) {
        if let Ok(mut entry) = DeviceAddr::new(*addr, *mask) {
            if update.address_external {
                entry.flags |= AddrFlags::EXTERNAL;
            }
            iface.proto_ip.add_address(backend, dev_name, entry, Some(iface.config.metric));
        }
    }
    for (dest, mask, nexthop) in update.routes.iter().chain(update.routes6.iter()) {
        let route = DeviceRoute::new(*dest, *mask, *nexthop);
        iface.proto_ip.add_route(backend, dev_name, route, iface.config.metric);
    }
    for dns in &update.dns {
        iface.proto_ip.add_dns_server(*dns);
    }
    for domain in &update.dns_search {
        iface.proto_ip.add_search_domain(domain.clone());
    }
    iface.proto_ip.update_complete(backend, dev_name);
}

fn protocol_absent_up(registry: &mut InterfaceRegistry, name: &str, devices: &mut DeviceRegistry) -> Result<()> {
    registry.on_proto_event(name, ProtoEvent::Up(Box::default()), devices)
}

fn now() -> SystemTime {
    SystemTime::now()
}

/// Pushes `iface.config.no_defaultroute` into both IP bundles. Safe to
/// call whether or not the interface is currently enabled — disabled
/// bundles just remember the flag for their next `enable`.
fn sync_no_defaultroute(iface: &mut Interface, backend: &dyn SystemBackend, dev_name: &str) {
    let no_defaultroute = iface.config.no_defaultroute;
    iface.config_ip.set_no_defaultroute(backend, dev_name, no_defaultroute);
    iface.proto_ip.set_no_defaultroute(backend, dev_name, no_defaultroute);
}

/// The real OS-visible device name backend calls should target: the
/// protocol-switched L3 ifname if one was set, otherwise the current
/// `ifname` of the claimed main device (which, for an alias-bound main
/// device, mirrors whatever concrete device the alias is presently
/// bound to rather than the alias's own registry key), falling back to
/// the interface's logical name if no device is claimed at all.
fn resolve_dev_name(iface: &Interface, devices: &DeviceRegistry, name: &str) -> String {
    iface
        .l3_ifname
        .clone()
        .or_else(|| iface.main_dev.as_deref().and_then(|dev| devices.get(dev)).map(|dev| dev.ifname().to_string()))
        .unwrap_or_else(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::device::DeviceRegistry;
    use crate::system::InMemoryBackend;

    fn base_config(ifname: &str, proto: &str) -> InterfaceConfig {
        InterfaceConfig {
            ifname: ifname.to_string(),
            proto: proto.to_string(),
            proto_config: serde_json::json!({}),
            autostart: true,
            metric: 0,
            no_defaultroute: false,
        }
    }

    fn setup() -> (InterfaceRegistry, DeviceRegistry) {
        let backend = Arc::new(InMemoryBackend::default());
        let mut devices = DeviceRegistry::new(backend);
        devices.set_initial_config_done();
        let registry = InterfaceRegistry::new(ProtocolHandlerRegistry::with_builtins("/tmp".into()));
        (registry, devices)
    }

    #[test]
    fn set_up_is_a_noop_once_already_up() {
        let (mut registry, mut devices) = setup();
        registry.apply_config("lan", base_config("eth0", "static"), &mut devices).unwrap();
        devices.set_present("eth0", true).unwrap();
        registry.set_available("lan", true, &mut devices).unwrap();
        registry.poll_proto_events(&mut devices).unwrap();
        assert_eq!(registry.get("lan").unwrap().state(), InterfaceState::Up);

        registry.set_up("lan", &mut devices).unwrap();
        assert_eq!(registry.get("lan").unwrap().state(), InterfaceState::Up);
    }

    #[test]
    fn set_up_without_a_present_device_logs_an_error_instead_of_panicking() {
        let (mut registry, mut devices) = setup();
        registry.apply_config("wan", base_config("eth1", "static"), &mut devices).unwrap();
        registry.set_up("wan", &mut devices).unwrap();
        let iface = registry.get("wan").unwrap();
        assert_eq!(iface.state(), InterfaceState::Down);
        assert_eq!(iface.errors().len(), 1);
        assert_eq!(iface.errors()[0].code, "NO_DEVICE");
    }

    #[test]
    fn device_going_unavailable_forces_teardown_without_autostart_flapping() {
        let (mut registry, mut devices) = setup();
        registry.apply_config("lan", base_config("eth0", "static"), &mut devices).unwrap();
        devices.set_present("eth0", true).unwrap();
        registry.set_available("lan", true, &mut devices).unwrap();
        registry.poll_proto_events(&mut devices).unwrap();
        assert_eq!(registry.get("lan").unwrap().state(), InterfaceState::Up);

        devices.set_present("eth0", false).unwrap();
        registry.set_available("lan", false, &mut devices).unwrap();
        assert_eq!(registry.get("lan").unwrap().state(), InterfaceState::Down);
        assert!(!registry.get("lan").unwrap().is_available());
    }

    #[test]
    fn link_lost_returns_to_setup_without_releasing_the_device() {
        let (mut registry, mut devices) = setup();
        registry.apply_config("lan", base_config("eth0", "static"), &mut devices).unwrap();
        devices.set_present("eth0", true).unwrap();
        registry.set_available("lan", true, &mut devices).unwrap();
        registry.poll_proto_events(&mut devices).unwrap();
        assert_eq!(registry.get("lan").unwrap().state(), InterfaceState::Up);

        registry.on_proto_event("lan", ProtoEvent::LinkLost, &mut devices).unwrap();
        assert_eq!(registry.get("lan").unwrap().state(), InterfaceState::Setup);
        assert_eq!(devices.get("eth0").unwrap().refcount(), 1, "device stays claimed across link loss");
    }

    #[test]
    fn reload_while_up_is_deferred_until_the_interface_reaches_down() {
        let (mut registry, mut devices) = setup();
        registry.apply_config("lan", base_config("eth0", "static"), &mut devices).unwrap();
        devices.set_present("eth0", true).unwrap();
        registry.set_available("lan", true, &mut devices).unwrap();
        registry.poll_proto_events(&mut devices).unwrap();
        assert_eq!(registry.get("lan").unwrap().state(), InterfaceState::Up);

        let outcome = registry
            .apply_config("lan", base_config("eth1", "static"), &mut devices)
            .unwrap();
        assert_eq!(outcome, ConfigApplyOutcome::Reloaded);
        // Still tearing down the old device; the new ifname hasn't taken effect yet.
        assert_eq!(registry.get("lan").unwrap().main_device_name(), Some("eth0"));

        registry.poll_proto_events(&mut devices).unwrap();
        assert_eq!(registry.get("lan").unwrap().main_device_name(), Some("eth1"));
        assert_eq!(
            registry.get("lan").unwrap().state(),
            InterfaceState::Down,
            "eth1 isn't present yet, so autostart didn't re-claim it"
        );

        devices.set_present("eth1", true).unwrap();
        registry.set_available("lan", true, &mut devices).unwrap();
        registry.poll_proto_events(&mut devices).unwrap();
        assert_eq!(registry.get("lan").unwrap().state(), InterfaceState::Up);
    }

    #[test]
    fn toggling_no_defaultroute_live_uninstalls_and_reinstalls_the_default_route() {
        let (mut registry, mut devices) = setup();
        registry.apply_config("wan", base_config("eth0", "static"), &mut devices).unwrap();
        devices.set_present("eth0", true).unwrap();
        registry.set_available("wan", true, &mut devices).unwrap();
        registry.poll_proto_events(&mut devices).unwrap();

        let route = crate::ip::DeviceRoute::new("0.0.0.0".parse().unwrap(), 0, None);
        registry.get_mut("wan").unwrap().proto_ip_mut().update_start();
        registry
            .get_mut("wan")
            .unwrap()
            .proto_ip_mut()
            .add_route(devices.backend(), "eth0", route, 0);
        registry.get_mut("wan").unwrap().proto_ip_mut().update_complete(devices.backend(), "eth0");
        assert_eq!(registry.get("wan").unwrap().proto_ip().routes().count(), 1);

        registry.set_no_defaultroute("wan", true, &devices).unwrap();
        assert_eq!(registry.get("wan").unwrap().proto_ip().routes().count(), 1, "entry stays tracked");

        registry.set_no_defaultroute("wan", false, &devices).unwrap();
        assert_eq!(registry.get("wan").unwrap().proto_ip().routes().count(), 1);
    }

    #[test]
    fn errors_are_cleared_on_the_next_successful_set_up() {
        let (mut registry, mut devices) = setup();
        registry.apply_config("wan", base_config("eth1", "static"), &mut devices).unwrap();
        registry.set_up("wan", &mut devices).unwrap();
        assert_eq!(registry.get("wan").unwrap().errors().len(), 1);

        devices.set_present("eth1", true).unwrap();
        registry.set_available("wan", true, &mut devices).unwrap();
        registry.poll_proto_events(&mut devices).unwrap();
        assert!(registry.get("wan").unwrap().errors().is_empty());
    }
}
