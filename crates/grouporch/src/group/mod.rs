//! GroupOrch - forwarding group orchestration for segment routing.
//!
//! One [`GroupOrch`] runs per locally mastered device. It owns the device's
//! adjacency, writes intent to the shared [`GroupStore`] and submits group
//! edits to a [`GroupProgrammer`]. Edits complete asynchronously; outcomes
//! come back over a channel and are applied by
//! [`GroupOrch::process_outcome`].
//!
//! Split by concern:
//! - `orch`: construction, hashed-group creation, bucket edits, next-hop
//!   reconciliation
//! - `link`: link and neighbor events
//! - `edge`: broadcast and single-port groups, group removal
//! - `verify`: periodic bucket verification
//! - `completion`: asynchronous outcome handling

mod completion;
mod edge;
mod link;
mod orch;
mod store;
mod types;
mod verify;

pub use completion::GroupOrchTask;
pub use orch::{
    DeviceConfig, GroupOrch, GroupOrchConfig, GroupOrchContext, GroupOrchError, GroupOrchStats,
    GroupProgrammer, RoutingLock, RoutingState,
};
pub use store::{DestinationSetKey, GroupStore, PortKey, VlanKey};
pub use types::{
    GroupId, GroupMetadata, GroupOp, GroupOutcome, GroupRequest, GroupType, MplsAction,
    OutcomeReceiver, OutcomeSender, ProgrammingError, Treatment,
};
pub use verify::{SkipReason, VerificationOutcome, VerificationState};

#[cfg(test)]
pub(crate) mod testing {
    //! Fixture shared by the unit tests of this module.

    use super::*;
    use crate::adjacency::{ConnectPoint, Link};
    use crate::daemon::simulated::{SimulatedProgrammer, StaticDeviceConfig, StaticRoutingState};
    use crate::destination::NextHopMap;
    use parking_lot::Mutex;
    use sr_types::{DeviceId, MacAddress, MplsLabel, PortNumber, VlanId};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    pub fn dev(id: &str) -> DeviceId {
        DeviceId::new(id).unwrap()
    }

    pub fn port(p: u32) -> PortNumber {
        PortNumber::new(p)
    }

    pub fn label(l: u32) -> Option<MplsLabel> {
        MplsLabel::new(l).ok()
    }

    pub fn mac(last: u8) -> MacAddress {
        MacAddress::new([0x00, 0x00, 0x00, 0x00, 0x00, last])
    }

    pub fn hops(destination: &str, neighbors: &[&str]) -> NextHopMap {
        NextHopMap::from([(
            dev(destination),
            neighbors.iter().map(|n| dev(n)).collect::<BTreeSet<_>>(),
        )])
    }

    pub fn direct(src: &str, sp: u32, dst: &str, dp: u32) -> Link {
        Link::direct(
            ConnectPoint::new(dev(src), port(sp)),
            ConnectPoint::new(dev(dst), port(dp)),
        )
    }

    /// Records every request and can reject the next one, otherwise
    /// behaves like the simulated device.
    pub struct RecordingProgrammer {
        device: SimulatedProgrammer,
        requests: Mutex<Vec<GroupRequest>>,
        reject: Mutex<Option<ProgrammingError>>,
    }

    impl RecordingProgrammer {
        fn new() -> Self {
            Self {
                device: SimulatedProgrammer::new(),
                requests: Mutex::new(Vec::new()),
                reject: Mutex::new(None),
            }
        }

        pub fn requests(&self) -> Vec<GroupRequest> {
            self.requests.lock().clone()
        }

        pub fn clear(&self) {
            self.requests.lock().clear();
        }

        pub fn reject_next(&self, error: ProgrammingError) {
            *self.reject.lock() = Some(error);
        }

        pub fn buckets(&self, device: &DeviceId, group_id: GroupId) -> Option<BTreeSet<Treatment>> {
            self.device.buckets(device, group_id)
        }
    }

    impl GroupProgrammer for RecordingProgrammer {
        fn allocate_group_id(&self, device: &DeviceId) -> GroupId {
            self.device.allocate_group_id(device)
        }

        fn submit(&self, request: GroupRequest, outcomes: OutcomeSender) -> Result<(), ProgrammingError> {
            self.requests.lock().push(request.clone());
            if let Some(error) = self.reject.lock().take() {
                return Err(error);
            }
            self.device.submit(request, outcomes)
        }
    }

    /// leaf1 reaches spine1 over ports 1 and 2 and spine2 over port 3.
    /// Ports 10 and 11 are edge ports in VLAN 100; port 11 is tagged.
    pub struct Fixture {
        pub programmer: Arc<RecordingProgrammer>,
        pub device_config: Arc<StaticDeviceConfig>,
        pub routing: Arc<StaticRoutingState>,
        pub routing_lock: RoutingLock,
        pub store: GroupStore,
        pub links: Vec<Link>,
    }

    impl Fixture {
        pub fn new() -> Self {
            let vlan = VlanId::new(100).unwrap();
            let device_config = StaticDeviceConfig::new()
                .with_router_mac(dev("leaf1"), mac(1))
                .with_router_mac(dev("spine1"), mac(0x11))
                .with_router_mac(dev("spine2"), mac(0x12))
                .with_router_mac(dev("leaf5"), mac(5))
                .with_vlan_port(dev("leaf1"), vlan, port(10), false)
                .with_vlan_port(dev("leaf1"), vlan, port(11), true);
            let routing = StaticRoutingState::new(true);
            routing.set_master(dev("leaf1"), true);

            Self {
                programmer: Arc::new(RecordingProgrammer::new()),
                device_config: Arc::new(device_config),
                routing: Arc::new(routing),
                routing_lock: RoutingLock::new(),
                store: GroupStore::new(1),
                links: vec![
                    direct("leaf1", 1, "spine1", 1),
                    direct("leaf1", 2, "spine1", 2),
                    direct("leaf1", 3, "spine2", 1),
                    direct("spine1", 1, "leaf1", 1),
                ],
            }
        }

        pub fn context(&self) -> GroupOrchContext {
            GroupOrchContext {
                programmer: self.programmer.clone(),
                device_config: self.device_config.clone(),
                routing: self.routing.clone(),
                routing_lock: self.routing_lock.clone(),
                store: self.store.clone(),
            }
        }

        pub fn orch(&self, device: &str) -> (GroupOrch, OutcomeReceiver) {
            GroupOrch::new(dev(device), GroupOrchConfig::default(), self.context(), &self.links)
                .map_err(|e| e.to_string())
                .unwrap()
        }
    }
}
