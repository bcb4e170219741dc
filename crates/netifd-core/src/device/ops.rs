//! Polymorphic per-kind device behavior.
//!
//! A small trait implemented by one zero-sized marker per
//! [`super::DeviceKind`] variant and looked up via
//! [`super::DeviceKind::ops`] — a table, not an inheritance chain.

use serde_json::{Value, json};

use super::Device;
use crate::system::SystemBackend;

/// The operations a device kind supports, looked up by [`super::DeviceKind::ops`].
pub trait DeviceOps: Send + Sync {
    /// Whether this kind supports in-place reconfiguration (the `APPLIED`
    /// branch of the config-apply decision). Kinds that
    /// return `false` force a RECREATE on any parameter change.
    fn supports_reload(&self) -> bool;

    /// Serializes kind-specific fields for `network.device.status`.
    fn dump_info(&self, device: &Device) -> Value;

    /// Serializes backend-reported counters for `network.device.status`.
    fn dump_stats(&self, device: &Device, backend: &dyn SystemBackend) -> Value {
        backend.dump_stats(&device.name)
    }
}

/// A physical or otherwise unremarkable device: no reload support beyond
/// the generic MTU/MAC/txqueuelen fields (those are compared directly by
/// the registry's config-apply, not through this trait).
#[derive(Debug, Default)]
pub struct SimpleOps;

impl DeviceOps for SimpleOps {
    fn supports_reload(&self) -> bool {
        true
    }

    fn dump_info(&self, _device: &Device) -> Value {
        json!({ "type": "simple" })
    }
}

/// A software bridge aggregating member devices.
#[derive(Debug, Default)]
pub struct BridgeOps;

impl DeviceOps for BridgeOps {
    fn supports_reload(&self) -> bool {
        // Adding/removing bridge members should reload rather than
        // recreate; nothing else about bridge identity is modeled, so
        // treat every config change as reloadable.
        true
    }

    fn dump_info(&self, device: &Device) -> Value {
        let members = match &device.kind {
            super::DeviceKind::Bridge { members } => members.clone(),
            _ => Vec::new(),
        };
        json!({ "type": "bridge", "members": members })
    }
}

/// A VLAN link synthesised by the chain resolver ([`super::vlan`]).
#[derive(Debug, Default)]
pub struct VlanOps;

impl DeviceOps for VlanOps {
    fn supports_reload(&self) -> bool {
        // The (parent, vid) pair *is* the device's identity; any change
        // to either is a different device entirely.
        false
    }

    fn dump_info(&self, device: &Device) -> Value {
        match &device.kind {
            super::DeviceKind::Vlan { parent, vid } => {
                json!({ "type": "vlan", "parent": parent, "vid": vid })
            }
            _ => json!({ "type": "vlan" }),
        }
    }
}

/// The virtual alias device. Never reload-applies: rebinding goes
/// through `alias_notify`, not the registry's generic config-apply path.
#[derive(Debug, Default)]
pub struct AliasOps;

impl DeviceOps for AliasOps {
    fn supports_reload(&self) -> bool {
        false
    }

    fn dump_info(&self, device: &Device) -> Value {
        json!({
            "type": "alias",
            "target": device.alias.as_ref().and_then(|a| a.target.clone()),
        })
    }

    fn dump_stats(&self, _device: &Device, _backend: &dyn SystemBackend) -> Value {
        // An alias has no kernel-visible link of its own to query.
        json!({})
    }
}
