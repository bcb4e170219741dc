//! [`DevicePrefix`], IPv6 delegated-prefix sub-assignment, and its
//! free-bitmap allocator.

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::time::SystemTime;

use crate::error::{Error, Result};

/// An IPv6 prefix delegated to this interface, with sub-prefixes handed
/// out to downstream interfaces.
#[derive(Debug, Clone, PartialEq)]
pub struct DevicePrefix {
    /// The delegated prefix's network address.
    pub address: Ipv6Addr,
    /// The delegated prefix's length, typically `<=64`.
    pub length: u8,
    /// When this delegation stops being valid at all.
    pub valid_until: Option<SystemTime>,
    /// When this delegation stops being preferred.
    pub preferred_until: Option<SystemTime>,
    /// Free-bitmap over the 64-bit space of sub-prefixes: bit `n` set
    /// means sub-prefix `n` (of the delegation's sub-prefix length) is
    /// available. Only meaningful when `length < 64`.
    avail: u64,
    /// Sub-prefixes handed to downstream interfaces, keyed by interface
    /// name. Preserved across a prefix refresh by transferring this map
    /// from the old node to the new one.
    assignments: HashMap<String, SubPrefix>,
}

/// A sub-prefix assigned from a [`DevicePrefix`] to one downstream
/// interface.
#[derive(Debug, Clone, PartialEq)]
pub struct SubPrefix {
    /// The sub-prefix's network address.
    pub address: Ipv6Addr,
    /// The sub-prefix's length, `1..=64`.
    pub length: u8,
    /// Which bit of the parent's `avail` bitmap this occupies.
    slot: u64,
}

/// The versioned-set key for a delegated prefix.
pub type PrefixKey = (Ipv6Addr, u8);

impl DevicePrefix {
    /// Builds a new prefix with every sub-prefix slot free.
    pub fn new(address: Ipv6Addr, length: u8) -> Self {
        Self {
            address,
            length,
            valid_until: None,
            preferred_until: None,
            avail: u64::MAX,
            assignments: HashMap::new(),
        }
    }

    /// The versioned-set key for this prefix.
    pub fn key(&self) -> PrefixKey {
        (self.address, self.length)
    }

    /// This prefix's existing sub-assignments, for status dumps.
    pub fn assignments(&self) -> impl Iterator<Item = (&str, &SubPrefix)> {
        self.assignments.iter().map(|(name, sub)| (name.as_str(), sub))
    }

    /// Allocates a sub-prefix of `sub_length` bits for `iface`, reusing
    /// its existing assignment if one is already held. `sub_length` must
    /// be `1..=64`; outside that range the
    /// assignment is dropped instead.
    ///
    /// # Errors
    /// Returns [`Error::PrefixOutOfRange`] if `sub_length` is outside
    /// `1..=64`, or if no free slot remains at that length.
    pub fn assign(&mut self, iface: &str, sub_length: u8) -> Result<Ipv6Addr> {
        if !(1..=64).contains(&sub_length) {
            self.unassign(iface);
            return Err(Error::PrefixOutOfRange {
                addr: self.address.into(),
                length: sub_length,
            });
        }
        if let Some(existing) = self.assignments.get(iface) {
            return Ok(existing.address);
        }

        let slots = 1u64 << sub_length.saturating_sub(self.length).min(63);
        let slot = (0..slots)
            .find(|slot| self.avail & (1 << slot) != 0)
            .ok_or_else(|| Error::PrefixOutOfRange {
                addr: self.address.into(),
                length: sub_length,
            })?;
        self.avail &= !(1 << slot);

        let sub_addr = sub_address(self.address, self.length, sub_length, slot);
        self.assignments.insert(
            iface.to_string(),
            SubPrefix { address: sub_addr, length: sub_length, slot },
        );
        Ok(sub_addr)
    }

    /// Releases `iface`'s sub-prefix assignment, if any, returning its
    /// slot to the free bitmap.
    pub fn unassign(&mut self, iface: &str) {
        if let Some(sub) = self.assignments.remove(iface) {
            self.avail |= 1 << sub.slot;
        }
    }

    /// Transfers every assignment from `old` into `self`, for a prefix
    /// refresh that should preserve downstream sub-prefixes rather than
    /// re-derive them. Callers re-run each transferred
    /// assignment's update afterward to re-plumb addresses onto the
    /// downstream interfaces.
    pub fn transfer_assignments_from(&mut self, old: &mut DevicePrefix) {
        self.assignments = std::mem::take(&mut old.assignments);
        self.avail = old.avail;
    }

    /// A null-route destination (the prefix itself) installed to
    /// suppress routing loops for any sub-prefix range not currently
    /// assigned.
    pub fn null_route_destination(&self) -> (Ipv6Addr, u8) {
        (self.address, self.length)
    }
}

fn sub_address(base: Ipv6Addr, base_len: u8, sub_len: u8, slot: u64) -> Ipv6Addr {
    let base_bits = u128::from(base);
    let shift = 128u32 - u32::from(sub_len);
    let slot_bits = (slot as u128) << shift;
    let mask_above = if base_len == 0 { 0 } else { u128::MAX << (128 - u32::from(base_len)) };
    Ipv6Addr::from((base_bits & mask_above) | slot_bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_and_reassign_same_iface_is_stable() {
        let mut prefix = DevicePrefix::new("2001:db8::".parse().unwrap(), 60);
        let first = prefix.assign("lan1", 64).unwrap();
        let second = prefix.assign("lan1", 64).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn distinct_interfaces_get_distinct_slots() {
        let mut prefix = DevicePrefix::new("2001:db8::".parse().unwrap(), 60);
        let a = prefix.assign("lan1", 64).unwrap();
        let b = prefix.assign("lan2", 64).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn out_of_range_length_is_rejected() {
        let mut prefix = DevicePrefix::new("2001:db8::".parse().unwrap(), 60);
        let err = prefix.assign("lan1", 65).unwrap_err();
        assert!(matches!(err, Error::PrefixOutOfRange { .. }));
    }

    #[test]
    fn unassign_frees_the_slot_for_reuse() {
        let mut prefix = DevicePrefix::new("2001:db8::".parse().unwrap(), 60);
        let a = prefix.assign("lan1", 64).unwrap();
        prefix.unassign("lan1");
        let b = prefix.assign("lan2", 64).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn transfer_preserves_assignments_across_refresh() {
        let mut old = DevicePrefix::new("2001:db8::".parse().unwrap(), 60);
        old.assign("lan1", 64).unwrap();

        let mut fresh = DevicePrefix::new("2001:db8::".parse().unwrap(), 60);
        fresh.transfer_assignments_from(&mut old);
        assert!(fresh.assignments().any(|(name, _)| name == "lan1"));
    }
}
