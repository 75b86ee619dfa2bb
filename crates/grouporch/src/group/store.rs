//! Replicated group stores.
//!
//! Three [`EcMap`]s shared by every orchestrator and cluster member. Keys
//! carry the owning device so one set of maps serves the whole fabric.

use super::types::{GroupId, GroupMetadata, Treatment};
use crate::destination::{DestinationSet, NextNeighbors};
use serde::{Deserialize, Serialize};
use sr_orch_common::EcMap;
use sr_types::{DeviceId, PortNumber, VlanId};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DestinationSetKey {
    pub device: DeviceId,
    pub ds: DestinationSet,
}

impl DestinationSetKey {
    pub fn new(device: DeviceId, ds: DestinationSet) -> Self {
        Self { device, ds }
    }
}

impl fmt::Display for DestinationSetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.ds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VlanKey {
    pub device: DeviceId,
    pub vlan: VlanId,
}

impl VlanKey {
    pub fn new(device: DeviceId, vlan: VlanId) -> Self {
        Self { device, vlan }
    }
}

/// Single-port group key. Two treatments to the same port are two groups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortKey {
    pub device: DeviceId,
    pub port: PortNumber,
    pub treatment: Treatment,
    pub metadata: Option<GroupMetadata>,
}

impl PortKey {
    pub fn new(
        device: DeviceId,
        port: PortNumber,
        treatment: Treatment,
        metadata: Option<GroupMetadata>,
    ) -> Self {
        Self {
            device,
            port,
            treatment,
            metadata,
        }
    }
}

/// Handles to the three group stores. Cloning shares the maps.
#[derive(Debug, Clone)]
pub struct GroupStore {
    destinations: Arc<EcMap<DestinationSetKey, NextNeighbors>>,
    vlans: Arc<EcMap<VlanKey, GroupId>>,
    ports: Arc<EcMap<PortKey, GroupId>>,
}

impl GroupStore {
    /// Creates empty stores written by cluster member `member`.
    pub fn new(member: u32) -> Self {
        Self {
            destinations: Arc::new(EcMap::new("ds-next-objective-store", member)),
            vlans: Arc::new(EcMap::new("vlan-next-objective-store", member)),
            ports: Arc::new(EcMap::new("port-next-objective-store", member)),
        }
    }

    pub fn destinations(&self) -> &EcMap<DestinationSetKey, NextNeighbors> {
        &self.destinations
    }

    pub fn vlans(&self) -> &EcMap<VlanKey, GroupId> {
        &self.vlans
    }

    pub fn ports(&self) -> &EcMap<PortKey, GroupId> {
        &self.ports
    }

    /// Destination-set records owned by `device`.
    pub fn destinations_of(&self, device: &DeviceId) -> Vec<(DestinationSetKey, NextNeighbors)> {
        self.destinations
            .entries()
            .into_iter()
            .filter(|(key, _)| &key.device == device)
            .collect()
    }

    /// Compacts the tombstones of all three maps, see [`EcMap::compact`].
    pub fn compact_tombstones(&self, horizon: u64) -> usize {
        self.destinations.compact(horizon) + self.vlans.compact(horizon) + self.ports.compact(horizon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::{DestinationSetType, NextHopMap};
    use crate::group::GroupType;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_clones_share_maps() {
        let store = GroupStore::new(1);
        let other = store.clone();
        let leaf1 = DeviceId::new("leaf1").unwrap();
        let ds = DestinationSet::single(DestinationSetType::PushNone, leaf1.clone(), None);

        other.destinations().put(
            DestinationSetKey::new(leaf1.clone(), ds.clone()),
            NextNeighbors::new(NextHopMap::new(), GroupId::new(1), GroupType::Hashed),
        );

        assert_eq!(store.destinations_of(&leaf1).len(), 1);
        assert!(store
            .destinations_of(&DeviceId::new("leaf2").unwrap())
            .is_empty());
    }

    #[test]
    fn test_compact_tombstones_covers_every_map() {
        let store = GroupStore::new(1);
        let leaf1 = DeviceId::new("leaf1").unwrap();
        let vlan = VlanKey::new(leaf1.clone(), VlanId::new(100).unwrap());
        store.vlans().put(vlan.clone(), GroupId::new(1));
        store.vlans().remove(&vlan);
        store.vlans().put(VlanKey::new(leaf1, VlanId::new(200).unwrap()), GroupId::new(2));

        assert_eq!(store.compact_tombstones(0), 1);
        assert_eq!(store.vlans().tombstones(), 0);
        assert_eq!(store.vlans().len(), 1);
    }
}
