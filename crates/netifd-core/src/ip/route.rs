//! [`DeviceRoute`] and its reconciliation callback.

use std::net::IpAddr;

use bitflags::bitflags;

use crate::system::SystemBackend;

bitflags! {
    /// Per-route flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RouteFlags: u8 {
        /// Installed outside our control.
        const EXTERNAL = 1 << 0;
        /// `metric` was explicitly set rather than inherited.
        const METRIC_SET = 1 << 1;
        /// `mtu` was explicitly set.
        const MTU_SET = 1 << 2;
    }
}

/// A route scoped to one interface.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRoute {
    /// Destination network address.
    pub destination: IpAddr,
    /// Destination prefix mask length.
    pub mask: u8,
    /// Gateway, if any (`None` for an on-link/device route).
    pub nexthop: Option<IpAddr>,
    /// Route metric. `None` until resolved against the interface's
    /// configured metric by [`reconcile_route`]'s metric inheritance.
    pub metric: Option<u32>,
    /// Route-specific MTU override.
    pub mtu: Option<u32>,
    /// Per-route flags.
    pub flags: RouteFlags,
    /// Whether this route should currently be installed. Cleared (but
    /// the entry kept) when `no_defaultroute` suppresses a default
    /// route.
    pub enabled: bool,
}

/// The versioned-set key for a route: destination and mask identify the
/// same routing entity across generations; the nexthop is compared as a
/// value-level "keep or replace" decision, not identity.
pub type RouteKey = (IpAddr, u8);

impl DeviceRoute {
    /// Builds a new enabled, non-external, unmetered route.
    pub fn new(destination: IpAddr, mask: u8, nexthop: Option<IpAddr>) -> Self {
        Self {
            destination,
            mask,
            nexthop,
            metric: None,
            mtu: None,
            flags: RouteFlags::empty(),
            enabled: true,
        }
    }

    /// The versioned-set key for this route.
    pub fn key(&self) -> RouteKey {
        (self.destination, self.mask)
    }

    /// True for the IPv4/IPv6 default route (mask length zero).
    pub fn is_default(&self) -> bool {
        self.mask == 0
    }

    /// True for routes the daemon must never install or remove.
    pub fn is_external(&self) -> bool {
        self.flags.contains(RouteFlags::EXTERNAL)
    }
}

/// Decides keep vs. replace for a route update: if both
/// share the same nexthop, the install is skipped (kept); otherwise old
/// is deleted and new is installed. A route with no set metric inherits
/// `interface_metric`.
pub fn reconcile_route(
    backend: &dyn SystemBackend,
    iface: &str,
    new: &DeviceRoute,
    old: Option<&DeviceRoute>,
    interface_metric: u32,
) -> DeviceRoute {
    let mut new = new.clone();
    if !new.flags.contains(RouteFlags::METRIC_SET) {
        new.metric = Some(new.metric.unwrap_or(interface_metric));
    }

    match old {
        None => {
            if new.enabled && !new.is_external() {
                if let Err(reason) = backend.add_route(iface, &new) {
                    tracing::warn!(iface, destination = %new.destination, %reason, "add_route failed");
                }
            }
        }
        Some(old) => {
            let same_nexthop = new.nexthop == old.nexthop && new.enabled == old.enabled;
            if !same_nexthop && new.enabled {
                if old.enabled
                    && !old.is_external()
                    && let Err(reason) = backend.del_route(iface, old)
                {
                    tracing::warn!(iface, destination = %old.destination, %reason, "del_route failed");
                }
                if !new.is_external()
                    && let Err(reason) = backend.add_route(iface, &new)
                {
                    tracing::warn!(iface, destination = %new.destination, %reason, "add_route failed");
                }
            } else if !new.enabled && old.enabled && !old.is_external() {
                if let Err(reason) = backend.del_route(iface, old) {
                    tracing::warn!(iface, destination = %old.destination, %reason, "del_route failed");
                }
            }
        }
    }
    new
}

/// Uninstalls `route` from the kernel unless it's EXTERNAL or already
/// disabled.
pub fn uninstall_route(backend: &dyn SystemBackend, iface: &str, route: &DeviceRoute) {
    if route.is_external() || !route.enabled {
        return;
    }
    if let Err(reason) = backend.del_route(iface, route) {
        tracing::warn!(iface, destination = %route.destination, %reason, "del_route failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_metric_inherits_interface_metric() {
        let route = DeviceRoute::new("0.0.0.0".parse().unwrap(), 0, None);
        let reconciled = reconcile_route(&crate::system::DummyBackend, "eth0", &route, None, 42);
        assert_eq!(reconciled.metric, Some(42));
    }

    #[test]
    fn default_route_is_detected_by_zero_mask() {
        let route = DeviceRoute::new("0.0.0.0".parse().unwrap(), 0, None);
        assert!(route.is_default());
    }
}
