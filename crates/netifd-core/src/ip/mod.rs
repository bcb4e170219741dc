//! IP settings bundle and its reconciliation against the system backend.

mod address;
mod prefix;
mod route;

pub use address::{AddrFlags, AddrKey, DeviceAddr};
pub use prefix::{DevicePrefix, PrefixKey, SubPrefix};
pub use route::{DeviceRoute, RouteFlags, RouteKey};

use std::net::IpAddr;

use crate::system::SystemBackend;
use crate::versioned::{VersionedList, VersionedSet};

/// One interface's addresses, routes, IPv6 prefixes, and DNS data, plus
/// the two policy flags that govern reconciliation.
///
/// An interface owns two of these: `config_ip` (user-authored) and
/// `proto_ip` (protocol-supplied); both reconcile against the same
/// backend independently.
#[derive(Default)]
pub struct IpSettings {
    addresses: VersionedSet<AddrKey, DeviceAddr>,
    routes: VersionedSet<RouteKey, DeviceRoute>,
    prefixes: VersionedSet<PrefixKey, DevicePrefix>,
    dns_servers: VersionedList<IpAddr>,
    search_domains: VersionedList<String>,
    /// Whether this bundle's entries should currently be installed.
    /// Toggled by the interface state machine on SETUP/TEARDOWN.
    enabled: bool,
    /// Suppresses installation of zero-length-prefix (default) routes;
    /// the route stays in the collection with `enabled = false`.
    no_defaultroute: bool,
    /// Suppresses this bundle's DNS entries from the resolv.conf writer
    /// without discarding them (only meaningful on `proto_ip`: a
    /// protocol may supply nameservers the user doesn't want used).
    no_dns: bool,
}

impl IpSettings {
    /// Current DNS servers, in insertion order.
    pub fn dns_servers(&self) -> impl Iterator<Item = &IpAddr> {
        self.dns_servers.iter()
    }

    /// Current DNS search domains, in insertion order.
    pub fn search_domains(&self) -> impl Iterator<Item = &str> {
        self.search_domains.iter().map(String::as_str)
    }

    /// Current addresses.
    pub fn addresses(&self) -> impl Iterator<Item = &DeviceAddr> {
        self.addresses.iter()
    }

    /// Current routes.
    pub fn routes(&self) -> impl Iterator<Item = &DeviceRoute> {
        self.routes.iter()
    }

    /// Current delegated prefixes.
    pub fn prefixes(&self) -> impl Iterator<Item = &DevicePrefix> {
        self.prefixes.iter()
    }

    /// Whether this bundle is currently installed.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether this bundle's DNS entries are suppressed from resolv.conf.
    pub fn is_dns_suppressed(&self) -> bool {
        self.no_dns
    }

    /// Sets whether this bundle's DNS entries are suppressed from
    /// resolv.conf.
    pub fn set_no_dns(&mut self, no_dns: bool) {
        self.no_dns = no_dns;
    }

    /// Sets `no_defaultroute`, re-evaluating every route's `enabled` bit
    /// and reconciling the delta with the backend immediately.
    pub fn set_no_defaultroute(&mut self, backend: &dyn SystemBackend, iface: &str, no_defaultroute: bool) {
        if self.no_defaultroute == no_defaultroute {
            return;
        }
        self.no_defaultroute = no_defaultroute;
        if !self.enabled {
            return;
        }
        for route in self.routes.iter_mut() {
            let should_enable = !(no_defaultroute && route.is_default());
            if route.enabled == should_enable {
                continue;
            }
            route.enabled = should_enable;
            if should_enable {
                if !route.is_external()
                    && let Err(reason) = backend.add_route(iface, route)
                {
                    tracing::warn!(iface, destination = %route.destination, %reason, "add_route failed");
                }
            } else if !route.is_external()
                && let Err(reason) = backend.del_route(iface, route)
            {
                tracing::warn!(iface, destination = %route.destination, %reason, "del_route failed");
            }
        }
    }

    /// Begins a reconciliation generation across addresses, routes,
    /// prefixes, and the two DNS lists.
    pub fn update_start(&mut self) {
        self.addresses.update_start();
        self.routes.update_start();
        self.prefixes.update_start();
        self.dns_servers.update_start();
        self.search_domains.update_start();
    }

    /// Adds or promotes one address this generation, reconciling keep vs.
    /// replace with the backend. When `metric` is set and `addr` is a
    /// non-external IPv4 address, also installs a companion subnet route
    /// at that metric through the same generation's route collection.
    pub fn add_address(&mut self, backend: &dyn SystemBackend, iface: &str, addr: DeviceAddr, metric: Option<u32>) {
        let key = addr.key();
        let enabled = self.enabled;
        let subnet_route = (metric, addr.address.is_ipv4(), addr.is_external()) == (metric, true, false);
        self.addresses.add(key.clone(), addr, |new, old| {
            let mut reconciled = if enabled {
                address::reconcile_address(backend, iface, new, old)
            } else {
                new.clone()
            };
            reconciled.enabled = enabled;
            reconciled
        });
        if let (Some(metric), true) = (metric, subnet_route) {
            let addr = self.addresses.get(&key).expect("just inserted");
            let mut route = DeviceRoute::new(network_address(addr.address, addr.mask), addr.mask, None);
            route.metric = Some(metric);
            route.flags |= RouteFlags::METRIC_SET;
            self.add_route(backend, iface, route, metric);
        }
    }

    /// Adds or promotes one route this generation, with
    /// `no_defaultroute` suppressing default-route installs and metric
    /// inheritance from `interface_metric` for routes with no set metric.
    pub fn add_route(&mut self, backend: &dyn SystemBackend, iface: &str, mut route: DeviceRoute, interface_metric: u32) {
        if self.no_defaultroute && route.is_default() {
            route.enabled = false;
        }
        let key = route.key();
        let enabled = self.enabled;
        self.routes.add(key, route, |new, old| {
            if enabled {
                route::reconcile_route(backend, iface, new, old, interface_metric)
            } else {
                let mut r = new.clone();
                if !r.flags.contains(RouteFlags::METRIC_SET) {
                    r.metric = Some(r.metric.unwrap_or(interface_metric));
                }
                r
            }
        });
    }

    /// Adds or promotes one delegated prefix this generation, preserving
    /// sub-assignments across the refresh and re-running each
    /// assignment's update via `on_reassign` so the caller can re-plumb
    /// addresses onto the downstream interfaces.
    pub fn add_prefix<F>(&mut self, mut prefix: DevicePrefix, mut on_reassign: F)
    where
        F: FnMut(&str, &SubPrefix),
    {
        let key = prefix.key();
        if let Some(old) = self.prefixes.get(&key) {
            let mut old = old.clone();
            prefix.transfer_assignments_from(&mut old);
            for (iface, sub) in prefix.assignments() {
                on_reassign(iface, sub);
            }
        }
        self.prefixes.add(key, prefix, |new, _old| new.clone());
    }

    /// Adds a DNS server for this generation.
    pub fn add_dns_server(&mut self, server: IpAddr) {
        self.dns_servers.add(server);
    }

    /// Adds a DNS search domain for this generation.
    pub fn add_search_domain(&mut self, domain: String) {
        self.search_domains.add(domain);
    }

    /// Completes the generation: anything not re-added this round is
    /// uninstalled and dropped.
    pub fn update_complete(&mut self, backend: &dyn SystemBackend, iface: &str) {
        let enabled = self.enabled;
        self.addresses.update_complete(|old| {
            if enabled {
                address::uninstall_address(backend, iface, old);
            }
        });
        self.routes.update_complete(|old| {
            if enabled {
                route::uninstall_route(backend, iface, old);
            }
        });
        self.prefixes.update_complete(|_old| {});
        self.dns_servers.update_complete();
        self.search_domains.update_complete();
    }

    /// Enables this bundle, installing every non-external address and
    /// enabled route.
    pub fn enable(&mut self, backend: &dyn SystemBackend, iface: &str) {
        if self.enabled {
            return;
        }
        self.enabled = true;
        for addr in self.addresses.iter_mut() {
            addr.enabled = true;
            if !addr.is_external()
                && let Err(reason) = backend.add_address(iface, addr)
            {
                tracing::warn!(iface, address = %addr.address, %reason, "add_address failed");
            }
        }
        let no_defaultroute = self.no_defaultroute;
        for route in self.routes.iter_mut() {
            route.enabled = !(no_defaultroute && route.is_default());
            if route.enabled
                && !route.is_external()
                && let Err(reason) = backend.add_route(iface, route)
            {
                tracing::warn!(iface, destination = %route.destination, %reason, "add_route failed");
            }
        }
    }

    /// Disables this bundle, uninstalling every installed entry but
    /// keeping them in the collection for the next enable.
    pub fn disable(&mut self, backend: &dyn SystemBackend, iface: &str) {
        if !self.enabled {
            return;
        }
        self.enabled = false;
        for addr in self.addresses.iter() {
            address::uninstall_address(backend, iface, addr);
        }
        for route in self.routes.iter() {
            route::uninstall_route(backend, iface, route);
        }
    }

    /// Uninstalls and drops every address and route, leaving DNS/prefix
    /// data untouched.
    pub fn flush(&mut self, backend: &dyn SystemBackend, iface: &str) {
        let enabled = self.enabled;
        self.addresses.clear(|addr| {
            if enabled {
                address::uninstall_address(backend, iface, addr);
            }
        });
        self.routes.clear(|route| {
            if enabled {
                route::uninstall_route(backend, iface, route);
            }
        });
    }
}

/// The network address for `addr/mask` (host bits zeroed), used to key
/// the companion subnet route a metered v4 address installs.
fn network_address(addr: IpAddr, mask: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let keep = if mask == 0 { 0 } else { u32::MAX << (32 - u32::from(mask)) };
            IpAddr::V4((bits & keep).into())
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let keep = if mask == 0 { 0 } else { u128::MAX << (128 - u32::from(mask)) };
            IpAddr::V6((bits & keep).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::InMemoryBackend;

    #[test]
    fn address_reconciliation_adds_keeps_and_removes() {
        let backend = InMemoryBackend::default();
        let mut ip = IpSettings::default();
        ip.enabled = true;

        ip.update_start();
        ip.add_address(&backend, "eth0", DeviceAddr::new("10.0.0.1".parse().unwrap(), 24).unwrap(), None);
        ip.update_complete(&backend, "eth0");
        assert_eq!(backend.installed_addresses("eth0"), vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);

        ip.update_start();
        ip.add_address(&backend, "eth0", DeviceAddr::new("10.0.0.1".parse().unwrap(), 24).unwrap(), None);
        ip.add_address(&backend, "eth0", DeviceAddr::new("10.0.0.2".parse().unwrap(), 24).unwrap(), None);
        ip.update_complete(&backend, "eth0");
        let mut installed = backend.installed_addresses("eth0");
        installed.sort();
        assert_eq!(
            installed,
            vec!["10.0.0.1".parse::<IpAddr>().unwrap(), "10.0.0.2".parse().unwrap()]
        );

        ip.update_start();
        ip.add_address(&backend, "eth0", DeviceAddr::new("10.0.0.2".parse().unwrap(), 24).unwrap(), None);
        ip.update_complete(&backend, "eth0");
        assert_eq!(backend.installed_addresses("eth0"), vec!["10.0.0.2".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn mask_change_is_remove_then_add() {
        let backend = InMemoryBackend::default();
        let mut ip = IpSettings::default();
        ip.enabled = true;

        ip.update_start();
        ip.add_address(&backend, "eth0", DeviceAddr::new("10.0.0.2".parse().unwrap(), 24).unwrap(), None);
        ip.update_complete(&backend, "eth0");

        ip.update_start();
        ip.add_address(&backend, "eth0", DeviceAddr::new("10.0.0.2".parse().unwrap(), 25).unwrap(), None);
        ip.update_complete(&backend, "eth0");

        assert_eq!(backend.installed_addresses("eth0"), vec!["10.0.0.2".parse::<IpAddr>().unwrap()]);
        assert_eq!(ip.addresses.get(&("10.0.0.2".parse().unwrap(), 25)).unwrap().mask, 25);
    }

    #[test]
    fn no_defaultroute_uninstalls_but_keeps_the_entry() {
        let backend = InMemoryBackend::default();
        let mut ip = IpSettings::default();
        ip.enabled = true;

        ip.update_start();
        ip.add_route(&backend, "eth0", DeviceRoute::new("0.0.0.0".parse().unwrap(), 0, None), 0);
        ip.update_complete(&backend, "eth0");
        assert_eq!(backend.installed_routes("eth0").len(), 1);

        ip.set_no_defaultroute(&backend, "eth0", true);
        assert!(backend.installed_routes("eth0").is_empty());
        assert_eq!(ip.routes().count(), 1);

        ip.set_no_defaultroute(&backend, "eth0", false);
        assert_eq!(backend.installed_routes("eth0").len(), 1);
    }

    #[test]
    fn metered_address_installs_companion_subnet_route() {
        let backend = InMemoryBackend::default();
        let mut ip = IpSettings::default();
        ip.enabled = true;

        ip.update_start();
        ip.add_address(
            &backend,
            "eth0",
            DeviceAddr::new("10.0.0.5".parse().unwrap(), 24).unwrap(),
            Some(5),
        );
        ip.update_complete(&backend, "eth0");

        assert_eq!(backend.installed_routes("eth0"), vec!["10.0.0.0".parse::<IpAddr>().unwrap()]);

        ip.update_start();
        ip.update_complete(&backend, "eth0");
        assert!(backend.installed_routes("eth0").is_empty(), "address gone, subnet route removed too");
    }

    #[test]
    fn flush_leaves_nothing_installed() {
        let backend = InMemoryBackend::default();
        let mut ip = IpSettings::default();
        ip.enabled = true;
        ip.update_start();
        ip.add_address(&backend, "eth0", DeviceAddr::new("10.0.0.1".parse().unwrap(), 24).unwrap(), None);
        ip.add_route(&backend, "eth0", DeviceRoute::new("0.0.0.0".parse().unwrap(), 0, None), 0);
        ip.update_complete(&backend, "eth0");

        ip.flush(&backend, "eth0");
        assert!(backend.installed_addresses("eth0").is_empty());
        assert!(backend.installed_routes("eth0").is_empty());
        assert!(ip.addresses().next().is_none());
    }
}
