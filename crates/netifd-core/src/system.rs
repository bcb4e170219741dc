//! The system backend: the narrow trait boundary standing in for the
//! kernel syscall layer (netlink, ioctl) that actually moves addresses,
//! routes, and link state into the OS. The core cannot reconcile
//! anything without *a* backend to call against, so this crate defines
//! the boundary and ships two implementations for hosts without a real
//! netlink backend: [`DummyBackend`] (logs every call and reports
//! success) and [`InMemoryBackend`] (tracks installed state in-process,
//! for reconciliation tests).
//!
//! Calls on this trait are synchronous and must not suspend: the core
//! event loop is single-threaded, and a suspended backend call would
//! stall every other device and interface in the registry.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Mutex;

use serde_json::{Value, json};

use crate::ip::{DeviceAddr, DeviceRoute};

/// The kernel-facing operations the core model needs. Every method
/// returns `Result<(), String>` rather than [`crate::error::Error`]
/// directly: the backend doesn't know about the core's error type, and
/// callers wrap the `String` reason into [`crate::error::Error::SystemBackend`].
pub trait SystemBackend: Send + Sync {
    /// Brings the named link up.
    fn if_up(&self, name: &str) -> Result<(), String>;
    /// Brings the named link down.
    fn if_down(&self, name: &str) -> Result<(), String>;
    /// Reports whether the OS currently shows the named link as present.
    fn if_check(&self, name: &str) -> bool;
    /// Installs an address on `iface`.
    fn add_address(&self, iface: &str, addr: &DeviceAddr) -> Result<(), String>;
    /// Removes an address from `iface`.
    fn del_address(&self, iface: &str, addr: &DeviceAddr) -> Result<(), String>;
    /// Installs a route on `iface`.
    fn add_route(&self, iface: &str, route: &DeviceRoute) -> Result<(), String>;
    /// Removes a route from `iface`.
    fn del_route(&self, iface: &str, route: &DeviceRoute) -> Result<(), String>;
    /// Enslaves `member` to bridge `bridge`.
    fn bridge_addif(&self, bridge: &str, member: &str) -> Result<(), String>;
    /// Creates a VLAN link `name` over `parent` with the given id.
    fn vlan_add(&self, name: &str, parent: &str, vid: u16) -> Result<(), String>;
    /// Removes a VLAN link.
    fn vlan_del(&self, name: &str) -> Result<(), String>;
    /// Updates the MTU the daemon computes for IPv6 on a link carrying a
    /// delegated prefix.
    fn update_ipv6_mtu(&self, iface: &str) -> Result<(), String>;
    /// Backend-reported counters for `network.device.status`.
    fn dump_stats(&self, iface: &str) -> Value;
}

/// Logs every call at `debug` and always succeeds. Reports `eth0` as
/// always present, a convenience for interactive testing without real
/// hardware.
#[derive(Debug, Default)]
pub struct DummyBackend;

impl SystemBackend for DummyBackend {
    fn if_up(&self, name: &str) -> Result<(), String> {
        tracing::debug!(device = name, "dummy: if_up");
        Ok(())
    }

    fn if_down(&self, name: &str) -> Result<(), String> {
        tracing::debug!(device = name, "dummy: if_down");
        Ok(())
    }

    fn if_check(&self, name: &str) -> bool {
        name == "eth0"
    }

    fn add_address(&self, iface: &str, addr: &DeviceAddr) -> Result<(), String> {
        tracing::debug!(iface, address = %addr.address, "dummy: add_address");
        Ok(())
    }

    fn del_address(&self, iface: &str, addr: &DeviceAddr) -> Result<(), String> {
        tracing::debug!(iface, address = %addr.address, "dummy: del_address");
        Ok(())
    }

    fn add_route(&self, iface: &str, route: &DeviceRoute) -> Result<(), String> {
        tracing::debug!(iface, destination = %route.destination, "dummy: add_route");
        Ok(())
    }

    fn del_route(&self, iface: &str, route: &DeviceRoute) -> Result<(), String> {
        tracing::debug!(iface, destination = %route.destination, "dummy: del_route");
        Ok(())
    }

    fn bridge_addif(&self, bridge: &str, member: &str) -> Result<(), String> {
        tracing::debug!(bridge, member, "dummy: bridge_addif");
        Ok(())
    }

    fn vlan_add(&self, name: &str, parent: &str, vid: u16) -> Result<(), String> {
        tracing::debug!(name, parent, vid, "dummy: vlan_add");
        Ok(())
    }

    fn vlan_del(&self, name: &str) -> Result<(), String> {
        tracing::debug!(name, "dummy: vlan_del");
        Ok(())
    }

    fn update_ipv6_mtu(&self, iface: &str) -> Result<(), String> {
        tracing::debug!(iface, "dummy: update_ipv6_mtu");
        Ok(())
    }

    fn dump_stats(&self, _iface: &str) -> Value {
        json!({ "rx_bytes": 0, "tx_bytes": 0 })
    }
}

/// A key identifying an installed address or route for the purposes of
/// [`InMemoryBackend`]'s tracking set. Distinct from the versioned
/// collections' own comparison keys — this one only needs to answer "is
/// this exact record currently installed".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Installed {
    Address { iface: String, addr: IpAddr, mask: u8 },
    Route { iface: String, dest: IpAddr, mask: u8, nexthop: Option<IpAddr> },
}

/// Tracks installed addresses/routes in a `HashSet` so reconciliation
/// tests can assert on kernel-visible state without a real network
/// namespace.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    installed: Mutex<HashSet<Installed>>,
    present: Mutex<HashSet<String>>,
}

impl InMemoryBackend {
    /// Marks `name` as present in the OS (for tests exercising link-loss
    /// and hotplug scenarios without a real kernel).
    pub fn set_present(&self, name: &str, present: bool) {
        let mut guard = self.present.lock().expect("lock poisoned");
        if present {
            guard.insert(name.to_string());
        } else {
            guard.remove(name);
        }
    }

    /// The addresses currently installed on `iface`, for test assertions.
    pub fn installed_addresses(&self, iface: &str) -> Vec<IpAddr> {
        self.installed
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter_map(|entry| match entry {
                Installed::Address { iface: i, addr, .. } if i == iface => Some(*addr),
                _ => None,
            })
            .collect()
    }

    /// The route destinations currently installed on `iface`.
    pub fn installed_routes(&self, iface: &str) -> Vec<IpAddr> {
        self.installed
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter_map(|entry| match entry {
                Installed::Route { iface: i, dest, .. } if i == iface => Some(*dest),
                _ => None,
            })
            .collect()
    }
}

impl SystemBackend for InMemoryBackend {
    fn if_up(&self, _name: &str) -> Result<(), String> {
        Ok(())
    }

    fn if_down(&self, _name: &str) -> Result<(), String> {
        Ok(())
    }

    fn if_check(&self, name: &str) -> bool {
        self.present.lock().expect("lock poisoned").contains(name)
    }

    fn add_address(&self, iface: &str, addr: &DeviceAddr) -> Result<(), String> {
        self.installed.lock().expect("lock poisoned").insert(Installed::Address {
            iface: iface.to_string(),
            addr: addr.address,
            mask: addr.mask,
        });
        Ok(())
    }

    fn del_address(&self, iface: &str, addr: &DeviceAddr) -> Result<(), String> {
        self.installed.lock().expect("lock poisoned").remove(&Installed::Address {
            iface: iface.to_string(),
            addr: addr.address,
            mask: addr.mask,
        });
        Ok(())
    }

    fn add_route(&self, iface: &str, route: &DeviceRoute) -> Result<(), String> {
        self.installed.lock().expect("lock poisoned").insert(Installed::Route {
            iface: iface.to_string(),
            dest: route.destination,
            mask: route.mask,
            nexthop: route.nexthop,
        });
        Ok(())
    }

    fn del_route(&self, iface: &str, route: &DeviceRoute) -> Result<(), String> {
        self.installed.lock().expect("lock poisoned").remove(&Installed::Route {
            iface: iface.to_string(),
            dest: route.destination,
            mask: route.mask,
            nexthop: route.nexthop,
        });
        Ok(())
    }

    fn bridge_addif(&self, _bridge: &str, _member: &str) -> Result<(), String> {
        Ok(())
    }

    fn vlan_add(&self, _name: &str, _parent: &str, _vid: u16) -> Result<(), String> {
        Ok(())
    }

    fn vlan_del(&self, _name: &str) -> Result<(), String> {
        Ok(())
    }

    fn update_ipv6_mtu(&self, _iface: &str) -> Result<(), String> {
        Ok(())
    }

    fn dump_stats(&self, _iface: &str) -> Value {
        json!({ "rx_bytes": 0, "tx_bytes": 0 })
    }
}
