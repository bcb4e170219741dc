//! [`DeviceAddr`] and its reconciliation callback.

use std::net::IpAddr;
use std::time::SystemTime;

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::system::SystemBackend;

bitflags! {
    /// Per-address flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AddrFlags: u8 {
        /// Installed outside our control; never touched by reconciliation.
        const EXTERNAL = 1 << 0;
        /// A host route rather than an address carrying real traffic.
        const DEVICE = 1 << 1;
    }
}

/// An IPv4 or IPv6 address assigned to an interface.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceAddr {
    /// The address itself; its variant (`V4`/`V6`) is the family.
    pub address: IpAddr,
    /// Prefix mask length: `0..=32` for v4, `0..=128` for v6.
    pub mask: u8,
    /// Per-address flags.
    pub flags: AddrFlags,
    /// IPv4 broadcast address, derived from `address`/`mask` unless the
    /// configuration supplied one explicitly. Always `None` for v6.
    pub broadcast: Option<IpAddr>,
    /// When this address stops being preferred for new connections
    /// (RFC 4862 style, for delegated-prefix-derived addresses).
    pub preferred_until: Option<SystemTime>,
    /// When this address is no longer valid at all.
    pub valid_until: Option<SystemTime>,
    /// Whether this address should currently be installed in the kernel.
    /// Toggled in bulk by `no_defaultroute`/interface enable-disable.
    pub enabled: bool,
}

/// The versioned-set key for an address: same address family and value
/// identify "the same entity" across generations.
pub type AddrKey = (IpAddr, u8);

impl DeviceAddr {
    /// Builds a new, enabled, non-external address with mask-derived
    /// IPv4 broadcast.
    pub fn new(address: IpAddr, mask: u8) -> Result<Self> {
        let max = if address.is_ipv4() { 32 } else { 128 };
        if mask > max {
            return Err(Error::PrefixOutOfRange { addr: address, length: mask });
        }
        let broadcast = derive_broadcast(address, mask);
        Ok(Self {
            address,
            mask,
            flags: AddrFlags::empty(),
            broadcast,
            preferred_until: None,
            valid_until: None,
            enabled: true,
        })
    }

    /// The versioned-set key for this address.
    pub fn key(&self) -> AddrKey {
        (self.address, self.mask)
    }

    /// True for addresses the daemon must never install or remove.
    pub fn is_external(&self) -> bool {
        self.flags.contains(AddrFlags::EXTERNAL)
    }
}

fn derive_broadcast(address: IpAddr, mask: u8) -> Option<IpAddr> {
    match address {
        IpAddr::V4(v4) => {
            if mask >= 31 {
                return None; // point-to-point / host routes carry no broadcast
            }
            let addr_bits = u32::from(v4);
            let host_bits = 32 - u32::from(mask);
            let host_mask = if host_bits == 32 { u32::MAX } else { (1u32 << host_bits) - 1 };
            Some(IpAddr::V4((addr_bits | host_mask).into()))
        }
        IpAddr::V6(_) => None,
    }
}

/// Decides keep vs. replace for an address update: kept
/// when the v4 broadcast (recomputed) and flags match, otherwise the old
/// entry is uninstalled and the new one installed (unless EXTERNAL).
/// Returns the value that should actually be stored — the kept old value
/// when reconciliation decided not to touch the kernel, matching the
/// versioned set's "callback return becomes the stored value" contract.
pub fn reconcile_address(
    backend: &dyn SystemBackend,
    iface: &str,
    new: &DeviceAddr,
    old: Option<&DeviceAddr>,
) -> DeviceAddr {
    let mut new = new.clone();
    match old {
        None => {
            if !new.is_external() {
                if let Err(reason) = backend.add_address(iface, &new) {
                    tracing::warn!(iface, address = %new.address, %reason, "add_address failed");
                }
            }
        }
        Some(old) => {
            let recomputed_broadcast = derive_broadcast(new.address, new.mask);
            let keep = recomputed_broadcast == old.broadcast && new.flags == old.flags;
            if keep {
                new.broadcast = old.broadcast;
            } else if !new.is_external() {
                if !old.is_external()
                    && let Err(reason) = backend.del_address(iface, old)
                {
                    tracing::warn!(iface, address = %old.address, %reason, "del_address failed");
                }
                if let Err(reason) = backend.add_address(iface, &new) {
                    tracing::warn!(iface, address = %new.address, %reason, "add_address failed");
                }
            }
        }
    }
    new
}

/// Uninstalls `addr` from the kernel unless it's EXTERNAL.
pub fn uninstall_address(backend: &dyn SystemBackend, iface: &str, addr: &DeviceAddr) {
    if addr.is_external() {
        return;
    }
    if let Err(reason) = backend.del_address(iface, addr) {
        tracing::warn!(iface, address = %addr.address, %reason, "del_address failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_is_derived_from_mask() {
        let addr = DeviceAddr::new("10.0.0.5".parse().unwrap(), 24).unwrap();
        assert_eq!(addr.broadcast, Some("10.0.0.255".parse().unwrap()));
    }

    #[test]
    fn point_to_point_has_no_broadcast() {
        let addr = DeviceAddr::new("10.0.0.5".parse().unwrap(), 31).unwrap();
        assert_eq!(addr.broadcast, None);
    }

    #[test]
    fn out_of_range_mask_rejected() {
        let err = DeviceAddr::new("10.0.0.5".parse().unwrap(), 33).unwrap_err();
        assert!(matches!(err, Error::PrefixOutOfRange { .. }));
    }

    #[test]
    fn v6_mask_bound_is_128() {
        let err = DeviceAddr::new("::1".parse().unwrap(), 129).unwrap_err();
        assert!(matches!(err, Error::PrefixOutOfRange { .. }));
    }
}
