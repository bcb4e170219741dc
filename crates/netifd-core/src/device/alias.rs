//! Alias device binding.
//!
//! The alias *device* (kind [`super::DeviceKind::Alias`]) and its claim
//! forwarding live in [`super::DeviceRegistry::bring_up`]/`bring_down`;
//! this module holds the alias-specific state record and the
//! `alias_notify`/`check_state` operations that mutate the binding.

use super::{Device, DeviceEvent, DeviceKind, DeviceRegistry, Owner};
use crate::error::{Error, Result};
use crate::interface::InterfaceRegistry;

/// Per-alias-device state: which target it's bound to, and whether it's
/// still hidden from status dumps pending its first bind.
#[derive(Debug, Clone, Default)]
pub struct AliasState {
    /// The device name this alias currently tracks, if bound.
    pub target: Option<String>,
    /// True until the first successful `alias_notify` bind. A never-bound
    /// alias is suppressed from `dump_info`.
    pub hidden: bool,
}

impl DeviceRegistry {
    /// Binds or unbinds alias `alias_name` to `target`. Rebinding to the
    /// same target is a no-op: repeated `alias_notify(a, X)` calls emit
    /// ADD at most once. Binding to `None` hides the alias and
    /// clears its `ifname`; binding to `Some` rewrites `ifname` to the
    /// target's and emits `UpdateIfname` to the alias's own dependents.
    ///
    /// # Errors
    /// Returns [`Error::UnknownDevice`] if `alias_name` does not resolve
    /// to an alias device, or if `target` is `Some` and does not resolve.
    pub fn alias_notify(&mut self, alias_name: &str, target: Option<&str>) -> Result<Vec<(Owner, DeviceEvent)>> {
        self.device_get(&format!("@{alias_name}"), true)?;
        let current = self
            .devices
            .get(alias_name)
            .and_then(|d| d.alias.as_ref())
            .and_then(|a| a.target.clone());
        if current.as_deref() == target {
            return Ok(Vec::new());
        }
        if let Some(t) = target {
            self.device_get(t, false)?;
        }

        let mut events = Vec::new();
        let was_claimed = self
            .devices
            .get(alias_name)
            .is_some_and(|d| d.dependents.iter().any(|e| e.owner == Owner::Alias(alias_name.to_string()) && e.claimed));

        if let Some(old_target) = current {
            events.extend(self.remove_user(&old_target, &Owner::Alias(alias_name.to_string()))?);
        }

        let device = self.devices.get_mut(alias_name).expect("resolved above");
        let alias_state = device.alias.get_or_insert_with(AliasState::default);
        alias_state.target = target.map(ToOwned::to_owned);
        alias_state.hidden = target.is_none();

        match target {
            Some(t) => {
                device.ifname = self.devices.get(t).map(|d| d.ifname.clone()).unwrap_or_else(|| t.to_string());

                // `add_user` already mirrors the target's current presence
                // onto the alias via `DeviceRegistry::dispatch`'s internal
                // forwarding, since the edge is owned by `Owner::Alias`.
                events.extend(self.add_user(t, Owner::Alias(alias_name.to_string()), true)?);
                if was_claimed {
                    events.extend(self.claim(t, Owner::Alias(alias_name.to_string()))?);
                }

                let alias_dependents: Vec<Owner> =
                    self.devices[alias_name].dependents.iter().map(|e| e.owner.clone()).collect();
                let ifname = self.devices[alias_name].ifname.clone();
                for owner in alias_dependents {
                    events.push((owner, DeviceEvent::UpdateIfname(ifname.clone())));
                }
            }
            None => {
                device.ifname = alias_name.to_string();
                events.extend(self.set_present(alias_name, false)?);
            }
        }
        Ok(events)
    }

    /// Re-resolves alias `alias_name` against the interfaces currently in
    /// state UP, recovering the L3 device of an interface whose *logical*
    /// name matches the alias name. Returns the
    /// events produced by rebinding, if a match was found and is new.
    ///
    /// # Errors
    /// Propagates errors from the underlying `alias_notify` call.
    pub fn alias_check_state(
        &mut self,
        alias_name: &str,
        interfaces: &InterfaceRegistry,
    ) -> Result<Vec<(Owner, DeviceEvent)>> {
        let target = interfaces
            .find_up_by_name(alias_name)
            .and_then(|iface| iface.l3_device_name().map(ToOwned::to_owned));
        self.alias_notify(alias_name, target.as_deref())
    }
}

impl DeviceRegistry {
    /// True if `name` is an alias device, for callers deciding whether to
    /// route through `@name` creation.
    pub fn is_alias(&self, name: &str) -> bool {
        matches!(self.get(name).map(Device::kind), Some(DeviceKind::Alias))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::system::InMemoryBackend;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(Arc::new(InMemoryBackend::default()))
    }

    #[test]
    fn rebind_to_same_target_is_idempotent() {
        let mut reg = registry();
        reg.device_get("eth0", true).unwrap();
        reg.alias_notify("lan-alias", Some("eth0")).unwrap();
        let events = reg.alias_notify("lan-alias", Some("eth0")).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn unbind_hides_alias_and_clears_ifname() {
        let mut reg = registry();
        reg.device_get("eth0", true).unwrap();
        reg.alias_notify("lan-alias", Some("eth0")).unwrap();
        reg.alias_notify("lan-alias", None).unwrap();
        let alias = reg.get("lan-alias").unwrap();
        assert_eq!(alias.ifname(), "lan-alias");
        assert!(!alias.is_present());
    }

    #[test]
    fn bound_alias_mirrors_underlying_presence() {
        let mut reg = registry();
        reg.device_get("eth0", true).unwrap();
        reg.alias_notify("lan-alias", Some("eth0")).unwrap();
        reg.set_present("eth0", true).unwrap();
        assert!(reg.get("lan-alias").unwrap().is_present());
        reg.set_present("eth0", false).unwrap();
        assert!(!reg.get("lan-alias").unwrap().is_present());
    }
}
