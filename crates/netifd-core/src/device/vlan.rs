//! VLAN chain resolution: a dotted device name like `eth0.10.20`
//! synthesises a stack of VLAN links over `eth0`, innermost segment
//! first, each link claiming the one beneath it.

use super::{Device, DeviceKind, DeviceRegistry, Owner};
use crate::error::{Error, Result};

/// The inclusive bound on an 802.1Q VLAN id (0 and 4095 are reserved).
pub const MAX_VLAN_ID: u16 = 4094;

/// Resolves (creating as needed) every link in the dotted chain `name`,
/// e.g. `eth0.10.20` creates/reuses `eth0`, then `eth0.10` over it, then
/// `eth0.10.20` over that, with each link claiming the one below it.
///
/// # Errors
/// Returns [`Error::InvalidVlanId`] if a segment doesn't parse as
/// `1..=4094`.
pub(super) fn resolve_chain(registry: &mut DeviceRegistry, name: &str) -> Result<()> {
    let mut segments = name.split('.');
    let base = segments.next().expect("split always yields at least one segment");

    registry.device_get(base, true)?;

    let mut parent = base.to_string();
    let mut built = base.to_string();
    for segment in segments {
        built.push('.');
        built.push_str(segment);
        let vid: u16 = segment
            .parse()
            .ok()
            .filter(|v| (1..=MAX_VLAN_ID).contains(v))
            .ok_or_else(|| Error::InvalidVlanId {
                name: name.to_string(),
                segment: segment.to_string(),
            })?;

        if !registry.devices.contains_key(&built) {
            registry.ensure(&built, DeviceKind::Vlan { parent: parent.clone(), vid });
            registry.claim(&parent, Owner::Vlan(built.clone()))?;
        }
        parent = built.clone();
    }
    Ok(())
}

impl Device {
    /// The parent device and VLAN id, if this device is a VLAN link.
    pub fn vlan_parent(&self) -> Option<(&str, u16)> {
        match &self.kind {
            DeviceKind::Vlan { parent, vid } => Some((parent.as_str(), *vid)),
            _ => None,
        }
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
    fn dotted_name_builds_stacked_links() {
        let mut reg = registry();
        reg.device_get("eth0.10.20", true).unwrap();
        assert!(reg.get("eth0").is_some());
        assert_eq!(reg.get("eth0.10").unwrap().vlan_parent(), Some(("eth0", 10)));
        assert_eq!(reg.get("eth0.10.20").unwrap().vlan_parent(), Some(("eth0.10", 20)));
    }

    #[test]
    fn invalid_segment_is_rejected() {
        let mut reg = registry();
        let err = reg.device_get("eth0.bogus", true).unwrap_err();
        assert!(matches!(err, Error::InvalidVlanId { .. }));
    }

    #[test]
    fn out_of_range_vid_is_rejected() {
        let mut reg = registry();
        let err = reg.device_get("eth0.4095", true).unwrap_err();
        assert!(matches!(err, Error::InvalidVlanId { .. }));
    }
}
