//! Device registry and dependent graph.
//!
//! A [`Device`] is identified by a stable name and lives in exactly one
//! [`DeviceRegistry`]. Consumers (interfaces, the alias table, VLAN
//! chain links) attach as [`DependentEdge`]s identified by an [`Owner`]
//! tag rather than a callback closure: a handle, not an owning pointer,
//! which avoids reference cycles and re-entrant callback plumbing.
//! Events a device broadcasts to dependents owned by another device in
//! this same registry (an alias or a VLAN link) are absorbed and
//! re-dispatched internally by [`DeviceRegistry::dispatch`]; only events
//! owned by external subscribers (interfaces) are returned to the caller
//! for the core orchestrator to apply to the interface state machine.

mod alias;
mod ops;
mod vlan;

pub use alias::AliasState;
pub use ops::{AliasOps, BridgeOps, DeviceOps, SimpleOps, VlanOps};
pub use vlan::MAX_VLAN_ID;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::system::SystemBackend;

bitflags! {
    /// Which optional fields a device's configuration explicitly set, as
    /// opposed to left at the kind's default.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceFlags: u8 {
        /// `mtu` was set by configuration.
        const MTU_SET = 1 << 0;
        /// `mac` was set by configuration.
        const MAC_SET = 1 << 1;
        /// `txqueuelen` was set by configuration.
        const TXQUEUELEN_SET = 1 << 2;
    }
}

/// The tagged variant behind the device's polymorphic behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    /// A physical device, or any device type with no special modeling.
    Simple,
    /// A software bridge over member devices.
    Bridge {
        /// Names of the devices currently enslaved to this bridge.
        members: Vec<String>,
    },
    /// A VLAN link synthesised by the `.`-chain resolver.
    Vlan {
        /// The device directly beneath this link in the chain.
        parent: String,
        /// The 802.1Q VLAN id, `1..=4094`.
        vid: u16,
    },
    /// A virtual device that tracks another device by indirection.
    Alias,
}

impl DeviceKind {
    /// Looks up the behavior table for this kind.
    pub fn ops(&self) -> &'static dyn DeviceOps {
        match self {
            DeviceKind::Simple => &SimpleOps,
            DeviceKind::Bridge { .. } => &BridgeOps,
            DeviceKind::Vlan { .. } => &VlanOps,
            DeviceKind::Alias => &AliasOps,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            DeviceKind::Simple => "simple",
            DeviceKind::Bridge { .. } => "bridge",
            DeviceKind::Vlan { .. } => "vlan",
            DeviceKind::Alias => "alias",
        }
    }
}

/// Who holds a dependent edge on a device. Edges owned by [`Owner::Alias`]
/// or [`Owner::Vlan`] name another device in the *same* registry and are
/// handled internally by [`DeviceRegistry::dispatch`]; [`Owner::InterfaceMain`]
/// and [`Owner::InterfaceL3`] are external and are returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Owner {
    /// An interface's main device dependent.
    InterfaceMain(String),
    /// An interface's L3 device dependent (may differ from main once a
    /// protocol switches it).
    InterfaceL3(String),
    /// The named alias device's binding to its current target.
    Alias(String),
    /// The named VLAN device's claim on the link beneath it.
    Vlan(String),
}

impl Owner {
    /// If this owner names another device in the registry (alias or VLAN
    /// chain link), returns that device's name.
    fn internal_device(&self) -> Option<&str> {
        match self {
            Owner::Alias(name) | Owner::Vlan(name) => Some(name.as_str()),
            Owner::InterfaceMain(_) | Owner::InterfaceL3(_) => None,
        }
    }
}

/// An edge from a dependent to the device it points at. Stored in the device's own list; the dependent's
/// *owner* identifies who it belongs to, not a callback.
#[derive(Debug, Clone)]
pub struct DependentEdge {
    owner: Owner,
    claimed: bool,
    alias: bool,
}

impl DependentEdge {
    /// The owner this edge belongs to.
    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    /// Whether this dependent currently holds an active claim.
    pub fn is_claimed(&self) -> bool {
        self.claimed
    }
}

/// An event broadcast from a device to its dependents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The device started being observed in the OS.
    Add,
    /// The device stopped being observed in the OS.
    Remove,
    /// The first dependent claimed the device; bring-up is starting.
    Setup,
    /// Bring-up succeeded.
    Up,
    /// The last dependent released the device; tear-down is starting.
    Teardown,
    /// Tear-down completed.
    Down,
    /// An alias rebound; `ifname` is the alias's new effective name.
    UpdateIfname(String),
}

/// A network device.
#[derive(Debug, Clone)]
pub struct Device {
    name: String,
    kind: DeviceKind,
    flags: DeviceFlags,
    mtu: Option<u32>,
    mac: Option<[u8; 6]>,
    txqueuelen: Option<u32>,
    refcount: u32,
    present: bool,
    /// Set while this device exists because configuration named it,
    /// distinct from existing only because a dependent did `device_get`.
    /// Cleared once the owning config is removed; gates `free_unused`.
    current_config: bool,
    ifname: String,
    dependents: Vec<DependentEdge>,
    alias: Option<AliasState>,
}

impl Device {
    fn new(name: impl Into<String>, kind: DeviceKind) -> Self {
        let name = name.into();
        let alias = matches!(kind, DeviceKind::Alias).then(AliasState::default);
        Self {
            ifname: name.clone(),
            name,
            kind,
            flags: DeviceFlags::empty(),
            mtu: None,
            mac: None,
            txqueuelen: None,
            refcount: 0,
            present: false,
            current_config: false,
            dependents: Vec::new(),
            alias,
        }
    }

    /// The device's stable registry key.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The device's effective OS-visible name (differs from `name` only
    /// for an alias, which mirrors its bound target).
    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    /// The device's kind.
    pub fn kind(&self) -> &DeviceKind {
        &self.kind
    }

    /// Whether the OS currently reports this device as present.
    pub fn is_present(&self) -> bool {
        self.present
    }

    /// Whether at least one dependent holds an active claim.
    pub fn is_active(&self) -> bool {
        self.refcount > 0
    }

    /// The number of claimed dependents.
    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    /// The device's dependents, for status dumps and tests.
    pub fn dependents(&self) -> &[DependentEdge] {
        &self.dependents
    }

    /// Whether a device configuration currently names this device.
    pub fn is_current_config(&self) -> bool {
        self.current_config
    }

    fn find_edge_mut(&mut self, owner: &Owner) -> Option<&mut DependentEdge> {
        self.dependents.iter_mut().find(|e| &e.owner == owner)
    }
}

/// A description used to create or reconfigure a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// The device's kind.
    pub kind: DeviceKind,
    /// Explicitly-set optional fields.
    pub flags: DeviceFlags,
    /// MTU, if `flags` has `MTU_SET`.
    pub mtu: Option<u32>,
    /// MAC address, if `flags` has `MAC_SET`.
    pub mac: Option<[u8; 6]>,
    /// Tx queue length, if `flags` has `TXQUEUELEN_SET`.
    pub txqueuelen: Option<u32>,
}

/// The outcome of applying a [`DeviceConfig`] to an existing device
/// (a three-way decision: no change, in-place update, or recreate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Configuration was semantically identical; nothing changed.
    NoChange,
    /// Same kind, reload supported: updated in place.
    Applied,
    /// Kind changed, or reload unsupported: the device was replaced.
    Recreated,
}

/// The device registry: all known devices, keyed by name, plus the
/// single-threaded reclamation gate for deferred sweeps.
pub struct DeviceRegistry {
    devices: HashMap<String, Device>,
    backend: Arc<dyn SystemBackend>,
    lock_depth: u32,
    sweep_pending: bool,
    initial_config_done: bool,
}

impl DeviceRegistry {
    /// Creates an empty registry backed by `backend`.
    pub fn new(backend: Arc<dyn SystemBackend>) -> Self {
        Self {
            devices: HashMap::new(),
            backend,
            lock_depth: 0,
            sweep_pending: false,
            initial_config_done: false,
        }
    }

    /// Looks up a device without creating it.
    pub fn get(&self, name: &str) -> Option<&Device> {
        self.devices.get(name)
    }

    /// Iterates all devices, for status dumps.
    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Resolves `name` to a device, creating it if `create` is set and it
    /// doesn't exist yet. Names prefixed with `@` resolve through the
    /// alias table; names containing `.` resolve through the VLAN
    /// chain resolver.
    ///
    /// # Errors
    /// Returns [`Error::UnknownDevice`] if `create` is false and no such
    /// device exists, or [`Error::InvalidVlanId`] if a dotted name has a
    /// segment that isn't a valid VLAN id.
    pub fn device_get(&mut self, name: &str, create: bool) -> Result<&Device> {
        if let Some(alias_name) = name.strip_prefix('@') {
            if !self.devices.contains_key(alias_name) && create {
                self.devices
                    .insert(alias_name.to_string(), Device::new(alias_name, DeviceKind::Alias));
            }
            return self
                .devices
                .get(alias_name)
                .ok_or_else(|| Error::UnknownDevice { name: name.to_string() });
        }
        if name.contains('.') && !self.devices.contains_key(name) {
            if create {
                vlan::resolve_chain(self, name)?;
            } else {
                return Err(Error::UnknownDevice { name: name.to_string() });
            }
        }
        if create && !self.devices.contains_key(name) {
            self.devices.insert(name.to_string(), Device::new(name, DeviceKind::Simple));
        }
        self.devices
            .get(name)
            .ok_or_else(|| Error::UnknownDevice { name: name.to_string() })
    }

    /// Ensures a device named `name` exists with kind `kind`, without the
    /// alias/VLAN indirection of [`Self::device_get`]. Used by the config
    /// loader and by the VLAN chain resolver for the links it creates.
    fn ensure(&mut self, name: &str, kind: DeviceKind) -> &mut Device {
        self.devices
            .entry(name.to_string())
            .or_insert_with(|| Device::new(name, kind))
    }

    /// Adds `owner` as a dependent of `name`, creating the device if
    /// needed. Delivers the immediate ADD (and UP, if active) callback
    /// semantics as part of the
    /// returned event list, already run through [`Self::dispatch`].
    ///
    /// # Errors
    /// Returns [`Error::UnknownDevice`] if the device cannot be resolved.
    pub fn add_user(&mut self, name: &str, owner: Owner, alias: bool) -> Result<Vec<(Owner, DeviceEvent)>> {
        self.device_get(name, true)?;
        let device = self.devices.get_mut(name).expect("just resolved");
        if device.find_edge_mut(&owner).is_some() {
            return Ok(Vec::new());
        }
        device.dependents.push(DependentEdge { owner: owner.clone(), claimed: false, alias });

        let mut queue = VecDeque::new();
        if device.present {
            queue.push_back((name.to_string(), owner.clone(), DeviceEvent::Add));
            if device.is_active() {
                queue.push_back((name.to_string(), owner, DeviceEvent::Up));
            }
        }
        Ok(self.dispatch(queue))
    }

    /// Removes `owner` from `name`'s dependent list. A claimed edge is
    /// released first.
    ///
    /// # Errors
    /// Returns [`Error::UnknownDevice`] if no such device is registered.
    pub fn remove_user(&mut self, name: &str, owner: &Owner) -> Result<Vec<(Owner, DeviceEvent)>> {
        let claimed = self
            .devices
            .get(name)
            .ok_or_else(|| Error::UnknownDevice { name: name.to_string() })?
            .dependents
            .iter()
            .any(|e| &e.owner == owner && e.claimed);

        let mut events = if claimed { self.release(name, owner)? } else { Vec::new() };

        if let Some(device) = self.devices.get_mut(name) {
            device.dependents.retain(|e| &e.owner != owner);
        }
        events.extend(self.maybe_free(name));
        Ok(events)
    }

    /// Claims `name` on behalf of `owner`. The first successful claim on
    /// a device transitions it to active: SETUP is broadcast, the backend
    /// brings the link up, and on success UP is broadcast. Claiming an already-claimed edge is a no-op.
    ///
    /// # Errors
    /// Returns [`Error::UnknownDevice`] if the device doesn't exist, or
    /// [`Error::SystemBackend`] if bring-up fails — in which case the
    /// refcount and claim are rolled back before returning.
    pub fn claim(&mut self, name: &str, owner: Owner) -> Result<Vec<(Owner, DeviceEvent)>> {
        {
            let device = self
                .devices
                .get_mut(name)
                .ok_or_else(|| Error::UnknownDevice { name: name.to_string() })?;
            if device.find_edge_mut(&owner).is_none() {
                device.dependents.push(DependentEdge {
                    owner: owner.clone(),
                    claimed: false,
                    alias: false,
                });
            }
            let edge = device.find_edge_mut(&owner).expect("just inserted or present");
            if edge.claimed {
                return Ok(Vec::new());
            }
            edge.claimed = true;
            device.refcount += 1;
        }

        let device = self.devices.get(name).expect("present");
        if device.refcount != 1 {
            return Ok(Vec::new());
        }

        let mut queue = VecDeque::new();
        let dependents: Vec<Owner> = self.devices[name].dependents.iter().map(|e| e.owner.clone()).collect();
        for dep_owner in &dependents {
            queue.push_back((name.to_string(), dep_owner.clone(), DeviceEvent::Setup));
        }

        let bring_up_result = self.bring_up(name);
        match bring_up_result {
            Ok(mut nested) => {
                queue.append(&mut nested);
                for dep_owner in dependents {
                    queue.push_back((name.to_string(), dep_owner, DeviceEvent::Up));
                }
                Ok(self.dispatch(queue))
            }
            Err(err) => {
                let device = self.devices.get_mut(name).expect("present");
                device.refcount -= 1;
                if let Some(edge) = device.find_edge_mut(&owner) {
                    edge.claimed = false;
                }
                Err(err)
            }
        }
    }

    /// Releases `owner`'s claim on `name`. Symmetric with [`Self::claim`]:
    /// the last release broadcasts TEARDOWN, brings the backend down, then
    /// broadcasts DOWN.
    ///
    /// # Errors
    /// Returns [`Error::UnknownDevice`] if the device doesn't exist.
    pub fn release(&mut self, name: &str, owner: &Owner) -> Result<Vec<(Owner, DeviceEvent)>> {
        {
            let device = self
                .devices
                .get_mut(name)
                .ok_or_else(|| Error::UnknownDevice { name: name.to_string() })?;
            let Some(edge) = device.find_edge_mut(owner) else {
                return Ok(Vec::new());
            };
            if !edge.claimed {
                return Ok(Vec::new());
            }
            edge.claimed = false;
            device.refcount = device.refcount.saturating_sub(1);
        }

        let device = self.devices.get(name).expect("present");
        if device.is_active() {
            return Ok(Vec::new());
        }

        let mut queue = VecDeque::new();
        let dependents: Vec<Owner> = self.devices[name].dependents.iter().map(|e| e.owner.clone()).collect();
        for dep_owner in &dependents {
            queue.push_back((name.to_string(), dep_owner.clone(), DeviceEvent::Teardown));
        }
        let mut nested = self.bring_down(name);
        queue.append(&mut nested);
        for dep_owner in dependents {
            queue.push_back((name.to_string(), dep_owner, DeviceEvent::Down));
        }
        Ok(self.dispatch(queue))
    }

    /// The backend up-call for `claim`'s first activation. For an alias
    /// device this recursively claims the bound target instead of
    /// touching the system backend (the alias kind forwards bring-up/bring-down
    /// to `claim`/`release` on its bound target).
    fn bring_up(&mut self, name: &str) -> Result<VecDeque<(String, Owner, DeviceEvent)>> {
        let kind = self.devices[name].kind.clone();
        if let DeviceKind::Alias = kind {
            let target = self.devices[name].alias.as_ref().and_then(|a| a.target.clone());
            if let Some(target) = target {
                let events = self.claim(&target, Owner::Alias(name.to_string()))?;
                return Ok(events.into_iter().map(|(o, e)| (target.clone(), o, e)).collect());
            }
            return Err(Error::UnknownDevice { name: name.to_string() });
        }
        self.backend
            .if_up(name)
            .map_err(|reason| Error::SystemBackend { operation: "if_up", reason })?;
        Ok(VecDeque::new())
    }

    /// The backend down-call mirroring [`Self::bring_up`]. Alias/VLAN
    /// backend failures are logged, not propagated: tear-down must
    /// always succeed so the state machine can reach DOWN.
    fn bring_down(&mut self, name: &str) -> VecDeque<(String, Owner, DeviceEvent)> {
        let kind = self.devices[name].kind.clone();
        if let DeviceKind::Alias = kind {
            let target = self.devices[name].alias.as_ref().and_then(|a| a.target.clone());
            if let Some(target) = target {
                match self.release(&target, &Owner::Alias(name.to_string())) {
                    Ok(events) => return events.into_iter().map(|(o, e)| (target.clone(), o, e)).collect(),
                    Err(err) => {
                        tracing::warn!(device = name, error = %err, "alias release of target failed");
                        return VecDeque::new();
                    }
                }
            }
            return VecDeque::new();
        }
        if let Err(reason) = self.backend.if_down(name) {
            tracing::warn!(device = name, %reason, "backend if_down failed");
        }
        VecDeque::new()
    }

    /// Marks `name` present or absent. Idempotent on no-change; otherwise
    /// broadcasts ADD/REMOVE to dependents.
    ///
    /// # Errors
    /// Returns [`Error::UnknownDevice`] if the device doesn't exist.
    pub fn set_present(&mut self, name: &str, present: bool) -> Result<Vec<(Owner, DeviceEvent)>> {
        if !self.devices.contains_key(name) {
            return Err(Error::UnknownDevice { name: name.to_string() });
        }
        Ok(self.set_present_raw(name, present))
    }

    /// Internal variant of `set_present` used by the event-forwarding
    /// loop, where the device is known to exist; returns a raw (not yet
    /// flattened) queue instead of recursing into `dispatch` itself so
    /// the caller can fold it into its own in-flight queue.
    fn set_present_raw(&mut self, name: &str, present: bool) -> Vec<(Owner, DeviceEvent)> {
        let Some(device) = self.devices.get_mut(name) else {
            return Vec::new();
        };
        if device.present == present {
            return Vec::new();
        }
        device.present = present;
        let event = if present { DeviceEvent::Add } else { DeviceEvent::Remove };
        let dependents: Vec<Owner> = device.dependents.iter().map(|e| e.owner.clone()).collect();
        let mut queue = VecDeque::new();
        for owner in dependents {
            queue.push_back((name.to_string(), owner, event.clone()));
        }
        self.dispatch(queue)
    }

    /// Drains a queue of `(device, owner, event)` triples, absorbing and
    /// re-dispatching any event owned by another device in this registry
    /// (an alias or VLAN link) and returning only the events meant for
    /// external subscribers. This is the save-next iteration pattern from
    /// §5: a dependent callback may mutate the dependent list mid-dispatch
    /// without invalidating iteration.
    fn dispatch(&mut self, mut queue: VecDeque<(String, Owner, DeviceEvent)>) -> Vec<(Owner, DeviceEvent)> {
        let mut external = Vec::new();
        while let Some((_from, owner, event)) = queue.pop_front() {
            let Some(target) = owner.internal_device() else {
                external.push((owner, event));
                continue;
            };
            match event {
                DeviceEvent::Add => {
                    for item in self.set_present_raw(target, true) {
                        queue.push_back((target.to_string(), item.0, item.1));
                    }
                }
                DeviceEvent::Remove => {
                    for item in self.set_present_raw(target, false) {
                        queue.push_back((target.to_string(), item.0, item.1));
                    }
                }
                other => {
                    if let Some(dev) = self.devices.get(target) {
                        let forward: Vec<Owner> = dev.dependents.iter().map(|e| e.owner.clone()).collect();
                        for dep_owner in forward {
                            queue.push_back((target.to_string(), dep_owner, other.clone()));
                        }
                    }
                }
            }
        }
        external
    }

    /// Applies `config` to `name`, creating it if absent. Implements the
    /// three-way no-change/update/recreate decision.
    ///
    /// # Errors
    /// Propagates errors from claim/release performed as part of a
    /// RECREATE's dependent transfer.
    pub fn apply_config(
        &mut self,
        name: &str,
        config: DeviceConfig,
    ) -> Result<(ApplyOutcome, Vec<(Owner, DeviceEvent)>)> {
        let Some(existing) = self.devices.get(name) else {
            let mut device = Device::new(name, config.kind);
            device.flags = config.flags;
            device.mtu = config.mtu;
            device.mac = config.mac;
            device.txqueuelen = config.txqueuelen;
            device.current_config = true;
            self.devices.insert(name.to_string(), device);
            return Ok((ApplyOutcome::Applied, Vec::new()));
        };

        let semantically_equal = existing.kind == config.kind
            && existing.flags == config.flags
            && existing.mtu == config.mtu
            && existing.mac == config.mac
            && existing.txqueuelen == config.txqueuelen;
        if semantically_equal {
            return Ok((ApplyOutcome::NoChange, Vec::new()));
        }

        let same_type_reloadable = existing.kind.label() == config.kind.label() && existing.kind.ops().supports_reload();
        if same_type_reloadable {
            let was_present = existing.present;
            let device = self.devices.get_mut(name).expect("checked above");
            device.kind = config.kind;
            device.flags = config.flags;
            device.mtu = config.mtu;
            device.mac = config.mac;
            device.txqueuelen = config.txqueuelen;
            device.current_config = true;
            let mut events = Vec::new();
            if was_present {
                events.extend(self.set_present_raw(name, false));
                events.extend(self.set_present_raw(name, true));
            }
            return Ok((ApplyOutcome::Applied, events));
        }

        self.recreate(name, config)
    }

    /// RECREATE branch of config-apply: delete the old device, create the
    /// new one, and transfer every dependent atomically — re-claiming on
    /// the new device only if the old one was present, so a not-yet-live
    /// device doesn't spuriously emit DOWN.
    fn recreate(&mut self, name: &str, config: DeviceConfig) -> Result<(ApplyOutcome, Vec<(Owner, DeviceEvent)>)> {
        let old = self.devices.remove(name).expect("checked by caller");
        let was_present = old.present;
        let claimed_owners: Vec<Owner> = old.dependents.iter().filter(|e| e.claimed).map(|e| e.owner.clone()).collect();
        let unclaimed_owners: Vec<Owner> = old
            .dependents
            .iter()
            .filter(|e| !e.claimed)
            .map(|e| e.owner.clone())
            .collect();

        let mut new_device = Device::new(name, config.kind);
        new_device.flags = config.flags;
        new_device.mtu = config.mtu;
        new_device.mac = config.mac;
        new_device.txqueuelen = config.txqueuelen;
        new_device.current_config = true;
        self.devices.insert(name.to_string(), new_device);

        let mut events = Vec::new();
        for owner in unclaimed_owners {
            self.devices.get_mut(name).expect("just inserted").dependents.push(DependentEdge {
                owner,
                claimed: false,
                alias: false,
            });
        }
        if was_present {
            events.extend(self.set_present_raw(name, true));
        }
        for owner in claimed_owners {
            events.extend(self.claim(name, owner)?);
        }
        Ok((ApplyOutcome::Recreated, events))
    }

    /// Enters the reclamation-deferred critical section: `free_unused`
    /// defers its sweep until the matching `unlock`, so a lookup in
    /// progress never has its device reclaimed out from under it.
    /// Re-entrant: nested lock/unlock pairs only trigger a sweep once the
    /// outermost unlock runs.
    pub fn lock(&mut self) {
        self.lock_depth += 1;
    }

    /// Leaves the critical section, running any sweep that was requested
    /// while locked.
    pub fn unlock(&mut self) {
        self.lock_depth = self.lock_depth.saturating_sub(1);
        if self.lock_depth == 0 && self.sweep_pending {
            self.sweep_pending = false;
            self.free_unused();
        }
    }

    /// Marks the daemon's initial configuration pass complete, allowing
    /// `free_unused` to actually reclaim devices from then on.
    pub fn set_initial_config_done(&mut self) {
        self.initial_config_done = true;
    }

    /// Sweeps devices with no dependents and no owning configuration
    /// Deferred if the registry is currently locked.
    pub fn free_unused(&mut self) {
        if self.lock_depth > 0 {
            self.sweep_pending = true;
            return;
        }
        if !self.initial_config_done {
            return;
        }
        self.devices
            .retain(|_, device| !(device.dependents.is_empty() && !device.current_config));
    }

    /// Access to the backend, for callers (e.g. the interface state
    /// machine's `check_state`) that need to query link status directly.
    pub fn backend(&self) -> &dyn SystemBackend {
        self.backend.as_ref()
    }

    /// A clone of the backend handle. Useful when a caller needs to hold
    /// onto the backend across a call that also needs `&mut self` on this
    /// registry, since `&dyn SystemBackend` borrowed from [`Self::backend`]
    /// can't coexist with that.
    pub fn backend_arc(&self) -> Arc<dyn SystemBackend> {
        self.backend.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::InMemoryBackend;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(Arc::new(InMemoryBackend::default()))
    }

    #[test]
    fn two_claimers_share_one_setup_up_pair() {
        let mut reg = registry();
        reg.device_get("eth0", true).unwrap();

        let a = Owner::InterfaceMain("a".into());
        let b = Owner::InterfaceMain("b".into());

        let events_a = reg.claim("eth0", a.clone()).unwrap();
        assert_eq!(events_a, vec![(a.clone(), DeviceEvent::Setup), (a.clone(), DeviceEvent::Up)]);

        let events_b = reg.claim("eth0", b.clone()).unwrap();
        assert!(events_b.is_empty());
        assert_eq!(reg.get("eth0").unwrap().refcount(), 2);

        let events = reg.release("eth0", &a).unwrap();
        assert!(events.is_empty(), "refcount still 1, no teardown yet");

        let events = reg.release("eth0", &b).unwrap();
        assert_eq!(events, vec![(b.clone(), DeviceEvent::Teardown), (b, DeviceEvent::Down)]);
    }

    #[test]
    fn claim_twice_by_same_owner_is_noop() {
        let mut reg = registry();
        reg.device_get("eth0", true).unwrap();
        let owner = Owner::InterfaceMain("a".into());
        reg.claim("eth0", owner.clone()).unwrap();
        let second = reg.claim("eth0", owner).unwrap();
        assert!(second.is_empty());
        assert_eq!(reg.get("eth0").unwrap().refcount(), 1);
    }

    #[test]
    fn set_present_is_idempotent() {
        let mut reg = registry();
        reg.device_get("eth0", true).unwrap();
        let events = reg.set_present("eth0", true).unwrap();
        assert_eq!(events, vec![]); // no dependents yet, nothing to broadcast
        assert!(reg.get("eth0").unwrap().is_present());
        let events = reg.set_present("eth0", true).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn free_unused_reclaims_orphans_after_initial_config() {
        let mut reg = registry();
        reg.device_get("eth0", true).unwrap();
        reg.set_initial_config_done();
        reg.free_unused();
        assert!(reg.get("eth0").is_none());
    }

    #[test]
    fn free_unused_keeps_devices_during_initial_config() {
        let mut reg = registry();
        reg.device_get("eth0", true).unwrap();
        reg.free_unused();
        assert!(reg.get("eth0").is_some());
    }

    #[test]
    fn recreate_transfers_dependents_without_spurious_down() {
        let mut reg = registry();
        reg.device_get("eth0", true).unwrap();
        let owner = Owner::InterfaceMain("iface1".into());
        reg.claim("eth0", owner.clone()).unwrap();

        let (outcome, events) = reg
            .apply_config(
                "eth0",
                DeviceConfig {
                    kind: DeviceKind::Bridge { members: vec![] },
                    flags: DeviceFlags::empty(),
                    mtu: None,
                    mac: None,
                    txqueuelen: None,
                },
            )
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Recreated);
        // eth0 was not present, so no DOWN should have been emitted for iface1.
        assert!(!events.iter().any(|(o, e)| o == &owner && *e == DeviceEvent::Down));
        assert!(reg.get("eth0").unwrap().dependents().iter().any(|e| e.owner() == &owner));
    }
}
