//! In-process collaborators for simulation mode.
//!
//! [`SimulatedProgrammer`] keeps a group table per device and applies every
//! request to it, reporting outcomes the way a real device would.
//! [`StaticDeviceConfig`] and [`StaticRoutingState`] serve the topology
//! read from the configuration file.

use crate::group::{
    DeviceConfig, GroupId, GroupOp, GroupOutcome, GroupProgrammer, GroupRequest, OutcomeSender,
    ProgrammingError, RoutingState, Treatment,
};
use parking_lot::{Mutex, RwLock};
use sr_types::{DeviceId, MacAddress, PortNumber, VlanId};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

/// First group id handed out on every device.
const GROUP_ID_BASE: u32 = 0x4000_0000;

#[derive(Debug, Default)]
pub struct SimulatedProgrammer {
    tables: Mutex<HashMap<(DeviceId, GroupId), BTreeSet<Treatment>>>,
    next_ids: Mutex<HashMap<DeviceId, u32>>,
}

impl SimulatedProgrammer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buckets currently installed for `group_id` on `device`.
    pub fn buckets(&self, device: &DeviceId, group_id: GroupId) -> Option<BTreeSet<Treatment>> {
        self.tables
            .lock()
            .get(&(device.clone(), group_id))
            .cloned()
    }

    pub fn group_count(&self, device: &DeviceId) -> usize {
        self.tables
            .lock()
            .keys()
            .filter(|(d, _)| d == device)
            .count()
    }

    fn apply(&self, request: &GroupRequest) -> Result<(), ProgrammingError> {
        let mut tables = self.tables.lock();
        let key = (request.device.clone(), request.group_id);

        if request.op == GroupOp::Add {
            if tables.contains_key(&key) {
                return Err(ProgrammingError::GroupAlreadyExists);
            }
            tables.insert(key, request.buckets.clone());
            return Ok(());
        }

        if request.op == GroupOp::Remove {
            return tables
                .remove(&key)
                .map(|_| ())
                .ok_or(ProgrammingError::GroupMissing);
        }

        let Some(buckets) = tables.get_mut(&key) else {
            return Err(ProgrammingError::GroupMissing);
        };
        match request.op {
            GroupOp::AddToExisting => buckets.extend(request.buckets.iter().cloned()),
            GroupOp::RemoveFromExisting => buckets.retain(|b| !request.buckets.contains(b)),
            GroupOp::Verify => *buckets = request.buckets.clone(),
            GroupOp::Add | GroupOp::Remove => {}
        }
        Ok(())
    }
}

impl GroupProgrammer for SimulatedProgrammer {
    fn allocate_group_id(&self, device: &DeviceId) -> GroupId {
        let mut next_ids = self.next_ids.lock();
        let next = next_ids.entry(device.clone()).or_insert(GROUP_ID_BASE);
        let id = *next;
        // Ids restart at the base once the range is exhausted.
        *next = next.checked_add(1).unwrap_or(GROUP_ID_BASE);
        GroupId::new(id)
    }

    fn submit(&self, request: GroupRequest, outcomes: OutcomeSender) -> Result<(), ProgrammingError> {
        let result = self.apply(&request);
        trace!(
            device = %request.device,
            group_id = %request.group_id,
            op = %request.op,
            ok = result.is_ok(),
            "Simulated group request"
        );
        let outcome = GroupOutcome {
            request_id: request.request_id,
            result,
        };
        if outcomes.send(outcome).is_err() {
            debug!(device = %request.device, "Outcome receiver gone");
        }
        Ok(())
    }
}

/// Device and interface configuration known up front.
#[derive(Debug, Default)]
pub struct StaticDeviceConfig {
    router_macs: HashMap<DeviceId, MacAddress>,
    /// Per device and VLAN, each member port and whether it is tagged.
    vlans: HashMap<DeviceId, BTreeMap<VlanId, BTreeMap<PortNumber, bool>>>,
}

impl StaticDeviceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_router_mac(mut self, device: DeviceId, mac: MacAddress) -> Self {
        self.router_macs.insert(device, mac);
        self
    }

    pub fn with_vlan_port(mut self, device: DeviceId, vlan: VlanId, port: PortNumber, tagged: bool) -> Self {
        self.vlans
            .entry(device)
            .or_default()
            .entry(vlan)
            .or_default()
            .insert(port, tagged);
        self
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceId> {
        self.router_macs.keys()
    }
}

impl DeviceConfig for StaticDeviceConfig {
    fn router_mac(&self, device: &DeviceId) -> Option<MacAddress> {
        self.router_macs.get(device).copied()
    }

    fn is_vlan_tagged(&self, device: &DeviceId, port: PortNumber, vlan: VlanId) -> bool {
        self.vlans
            .get(device)
            .and_then(|vlans| vlans.get(&vlan))
            .and_then(|ports| ports.get(&port))
            .copied()
            .unwrap_or(false)
    }

    fn vlan_ports(&self, device: &DeviceId) -> BTreeMap<VlanId, BTreeSet<PortNumber>> {
        self.vlans
            .get(device)
            .map(|vlans| {
                vlans
                    .iter()
                    .map(|(vlan, ports)| (*vlan, ports.keys().copied().collect()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Mastership and stability set by the operator instead of elected.
#[derive(Debug)]
pub struct StaticRoutingState {
    masters: RwLock<HashSet<DeviceId>>,
    stable: AtomicBool,
}

impl StaticRoutingState {
    pub fn new(stable: bool) -> Self {
        Self {
            masters: RwLock::new(HashSet::new()),
            stable: AtomicBool::new(stable),
        }
    }

    pub fn set_master(&self, device: DeviceId, master: bool) {
        let mut masters = self.masters.write();
        if master {
            masters.insert(device);
        } else {
            masters.remove(&device);
        }
    }

    pub fn set_stable(&self, stable: bool) {
        self.stable.store(stable, Ordering::SeqCst);
    }

    pub fn masters(&self) -> BTreeSet<DeviceId> {
        self.masters.read().iter().cloned().collect()
    }
}

impl RoutingState for StaticRoutingState {
    fn is_local_master(&self, device: &DeviceId) -> bool {
        self.masters.read().contains(device)
    }

    fn is_routing_stable(&self) -> bool {
        self.stable.load(Ordering::SeqCst)
    }
}
