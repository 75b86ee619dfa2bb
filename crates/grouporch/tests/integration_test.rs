//! Integration tests for the group orchestrator.
//!
//! A recording [`MockProgrammer`] keeps a device group table, records every
//! request and can fail the next request synchronously or asynchronously.

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use sr_grouporch::daemon::simulated::{SimulatedProgrammer, StaticDeviceConfig, StaticRoutingState};
use sr_grouporch::{
    ConnectPoint, DestinationSet, DestinationSetType, GroupId, GroupOp, GroupOrch, GroupOrchConfig,
    GroupOrchContext, GroupOutcome, GroupProgrammer, GroupRequest, GroupStore, GroupType, Link,
    MplsAction, NextHopMap, OutcomeReceiver, OutcomeSender, ProgrammingError, RoutingLock,
    Treatment, VerificationOutcome,
};
use sr_types::{DeviceId, MacAddress, MplsLabel, PortNumber};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Default)]
struct MockProgrammer {
    device: SimulatedProgrammer,
    requests: Mutex<Vec<GroupRequest>>,
    fail_sync: Mutex<Option<ProgrammingError>>,
    fail_async: Mutex<Option<ProgrammingError>>,
}

impl MockProgrammer {
    fn requests(&self) -> Vec<GroupRequest> {
        self.requests.lock().clone()
    }

    fn clear(&self) {
        self.requests.lock().clear();
    }

    fn fail_next_sync(&self, error: ProgrammingError) {
        *self.fail_sync.lock() = Some(error);
    }

    fn fail_next_async(&self, error: ProgrammingError) {
        *self.fail_async.lock() = Some(error);
    }

    fn buckets(&self, device: &DeviceId, group_id: GroupId) -> BTreeSet<Treatment> {
        self.device.buckets(device, group_id).unwrap_or_default()
    }

    /// Drops a group from the device table behind the orchestrator's back.
    fn lose_group(&self, device: &DeviceId, group_id: GroupId) {
        let (tx, _rx) = mpsc::unbounded_channel();
        let request = GroupRequest {
            request_id: 0,
            device: device.clone(),
            group_id,
            group_type: GroupType::Hashed,
            buckets: BTreeSet::new(),
            metadata: None,
            op: GroupOp::Remove,
        };
        let _ = self.device.submit(request, tx);
    }
}

impl GroupProgrammer for MockProgrammer {
    fn allocate_group_id(&self, device: &DeviceId) -> GroupId {
        self.device.allocate_group_id(device)
    }

    fn submit(&self, request: GroupRequest, outcomes: OutcomeSender) -> Result<(), ProgrammingError> {
        self.requests.lock().push(request.clone());
        if let Some(error) = self.fail_sync.lock().take() {
            return Err(error);
        }
        if let Some(error) = self.fail_async.lock().take() {
            let _ = outcomes.send(GroupOutcome::failure(request.request_id, error));
            return Ok(());
        }
        self.device.submit(request, outcomes)
    }
}

fn dev(id: &str) -> DeviceId {
    DeviceId::new(id).unwrap()
}

fn port(p: u32) -> PortNumber {
    PortNumber::new(p)
}

fn label(l: u32) -> Option<MplsLabel> {
    MplsLabel::new(l).ok()
}

fn mac(last: u8) -> MacAddress {
    MacAddress::new([0x02, 0, 0, 0, 0, last])
}

fn set(ids: &[&str]) -> BTreeSet<DeviceId> {
    ids.iter().map(|id| dev(id)).collect()
}

fn hops(entries: &[(&str, &[&str])]) -> NextHopMap {
    entries
        .iter()
        .map(|(dst, neighbors)| (dev(dst), set(neighbors)))
        .collect()
}

fn link(src: &str, sp: u32, dst: &str, dp: u32) -> Link {
    Link::direct(
        ConnectPoint::new(dev(src), port(sp)),
        ConnectPoint::new(dev(dst), port(dp)),
    )
}

fn ports_of(buckets: &BTreeSet<Treatment>) -> Vec<u32> {
    buckets.iter().map(|b| b.output.as_u32()).collect()
}

/// D1 reaches N1, N2 and N3 on ports 1, 2 and 3.
struct Harness {
    programmer: Arc<MockProgrammer>,
    routing_lock: RoutingLock,
    store: GroupStore,
    orch: GroupOrch,
    outcomes: OutcomeReceiver,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(GroupOrchConfig::default())
    }

    fn with_config(config: GroupOrchConfig) -> Self {
        let device_config = StaticDeviceConfig::new()
            .with_router_mac(dev("D1"), mac(0x01))
            .with_router_mac(dev("N1"), mac(0x11))
            .with_router_mac(dev("N2"), mac(0x12))
            .with_router_mac(dev("N3"), mac(0x13));
        let routing = StaticRoutingState::new(true);
        routing.set_master(dev("D1"), true);

        let programmer = Arc::new(MockProgrammer::default());
        let routing_lock = RoutingLock::new();
        let store = GroupStore::new(1);
        let context = GroupOrchContext {
            programmer: programmer.clone(),
            device_config: Arc::new(device_config),
            routing: Arc::new(routing),
            routing_lock: routing_lock.clone(),
            store: store.clone(),
        };
        let links = [
            link("D1", 1, "N1", 1),
            link("D1", 2, "N2", 1),
            link("D1", 3, "N3", 1),
        ];
        let (orch, outcomes) = GroupOrch::new(dev("D1"), config, context, &links).unwrap();

        Self {
            programmer,
            routing_lock,
            store,
            orch,
            outcomes,
        }
    }

    fn drain(&mut self) -> usize {
        self.orch.drain_outcomes(&mut self.outcomes)
    }

    fn device_buckets(&self, group_id: GroupId) -> BTreeSet<Treatment> {
        self.programmer.buckets(&dev("D1"), group_id)
    }
}

#[test]
fn test_destination_set_symmetry() {
    let ab = DestinationSet::paired(DestinationSetType::PushBos, dev("A"), label(100), dev("B"), label(200));
    let ba = DestinationSet::paired(DestinationSetType::PushBos, dev("B"), label(200), dev("A"), label(100));

    let hash = |ds: &DestinationSet| {
        let mut hasher = DefaultHasher::new();
        ds.hash(&mut hasher);
        hasher.finish()
    };
    assert_eq!(ab, ba);
    assert_eq!(hash(&ab), hash(&ba));
}

#[test]
fn test_idempotent_bucket_add() {
    let mut h = Harness::new();
    let ds = DestinationSet::single(DestinationSetType::PushNone, dev("D5"), None);
    let group_id = h
        .orch
        .get_or_create_group(&ds, &hops(&[("D5", &["N1"])]), None, false)
        .unwrap();
    h.drain();
    let expected = h.orch.expected_buckets(&ds).unwrap();

    h.orch.add_ports_for_neighbor(&ds, &dev("N1"), None, group_id).unwrap();
    h.orch.add_ports_for_neighbor(&ds, &dev("N1"), None, group_id).unwrap();
    h.drain();

    assert_eq!(h.orch.expected_buckets(&ds).unwrap(), expected);
    assert_eq!(h.device_buckets(group_id), expected);
    assert_eq!(h.device_buckets(group_id).len(), 1);
}

#[test]
fn test_update_next_hops_convergence() {
    let mut h = Harness::new();
    let ds = DestinationSet::single(DestinationSetType::PushNone, dev("D5"), None);
    let group_id = h
        .orch
        .get_or_create_group(&ds, &hops(&[("D5", &["N1", "N2"])]), None, false)
        .unwrap();
    h.drain();
    h.programmer.clear();

    assert!(h.orch.update_next_hops(&ds, &hops(&[("D5", &["N2", "N3"])])));
    h.drain();

    let requests = h.programmer.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].op, GroupOp::AddToExisting);
    assert_eq!(ports_of(&requests[0].buckets), vec![3]);
    assert_eq!(requests[1].op, GroupOp::RemoveFromExisting);
    assert_eq!(ports_of(&requests[1].buckets), vec![1]);

    assert_eq!(h.orch.next_neighbors(&ds).unwrap().next_hops(&dev("D5")), set(&["N2", "N3"]));
    assert_eq!(ports_of(&h.device_buckets(group_id)), vec![2, 3]);
}

#[test]
fn test_update_next_hops_rejected_edit_keeps_record() {
    let mut h = Harness::new();
    let ds = DestinationSet::single(DestinationSetType::PushNone, dev("D5"), None);
    h.orch
        .get_or_create_group(&ds, &hops(&[("D5", &["N1"])]), None, false)
        .unwrap();
    h.drain();

    h.programmer.fail_next_sync(ProgrammingError::Disconnected("D1".to_string()));
    assert!(!h.orch.update_next_hops(&ds, &hops(&[("D5", &["N2"])])));

    // The add was rejected; the remove was still attempted.
    let ops: Vec<_> = h.programmer.requests().iter().skip(1).map(|r| r.op).collect();
    assert_eq!(ops, vec![GroupOp::AddToExisting, GroupOp::RemoveFromExisting]);
    assert_eq!(h.orch.next_neighbors(&ds).unwrap().next_hops(&dev("D5")), set(&["N1"]));
}

#[test]
fn test_fix_hash_groups_scoping() {
    let mut h = Harness::new();
    let ds = DestinationSet::paired(DestinationSetType::PushBos, dev("X"), label(100), dev("Y"), label(200));
    let group_id = h
        .orch
        .get_or_create_group(&ds, &hops(&[("X", &["N1", "N2"]), ("Y", &["N1"])]), None, false)
        .unwrap();
    h.drain();

    let y_buckets = |buckets: BTreeSet<Treatment>| -> BTreeSet<Treatment> {
        buckets
            .into_iter()
            .filter(|b| matches!(b.mpls, Some(MplsAction::Push { label: l, .. }) if Some(l) == label(200)))
            .collect()
    };
    let y_before = y_buckets(h.device_buckets(group_id));
    assert_eq!(y_before.len(), 1);

    assert!(h.orch.fix_hash_groups(&dev("D1"), &set(&["N1"]), &dev("X"), true));
    h.drain();
    assert!(h.orch.fix_hash_groups(&dev("D1"), &set(&["N1", "N3"]), &dev("X"), false));
    h.drain();

    let record = h.orch.next_neighbors(&ds).unwrap();
    assert_eq!(record.next_hops(&dev("X")), set(&["N1", "N3"]));
    assert_eq!(record.next_hops(&dev("Y")), set(&["N1"]));
    assert_eq!(y_buckets(h.device_buckets(group_id)), y_before);
    assert_eq!(ports_of(&h.device_buckets(group_id)), vec![1, 1, 3]);
}

#[test]
fn test_link_down_cleanup() {
    let mut h = Harness::new();
    let ds = DestinationSet::single(DestinationSetType::PushNone, dev("D5"), None);
    let group_id = h
        .orch
        .get_or_create_group(&ds, &hops(&[("D5", &["N1", "N2"])]), None, false)
        .unwrap();
    h.drain();

    h.orch.on_link_down(&link("D1", 2, "N2", 1));
    h.drain();

    assert!(h.orch.adjacency().ports_to(&dev("N2")).is_empty());
    assert!(h.orch.adjacency().neighbor_at(port(2)).is_none());
    assert!(h.device_buckets(group_id).iter().all(|b| b.output != port(2)));
    assert!(h.orch.expected_buckets(&ds).unwrap().iter().all(|b| b.output != port(2)));
    assert!(!h.orch.next_neighbors(&ds).unwrap().contains_next_hop(&dev("N2")));
}

#[test]
fn test_verification_idempotence() {
    let mut h = Harness::new();
    let ds = DestinationSet::single(DestinationSetType::PushBos, dev("D5"), label(100));
    let group_id = h
        .orch
        .get_or_create_group(&ds, &hops(&[("D5", &["N1", "N2"])]), None, false)
        .unwrap();
    h.drain();
    let installed = h.device_buckets(group_id);
    h.programmer.clear();

    assert_eq!(h.orch.trigger_verification(), VerificationOutcome::Completed { groups_verified: 1 });
    h.drain();
    assert_eq!(h.orch.trigger_verification(), VerificationOutcome::Completed { groups_verified: 1 });
    h.drain();

    let requests = h.programmer.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.op == GroupOp::Verify));
    assert_eq!(requests[0].buckets, requests[1].buckets);
    assert_eq!(requests[0].buckets, installed);
    assert_eq!(h.device_buckets(group_id), installed);
}

#[test]
fn test_verification_repairs_async_failure() {
    let mut h = Harness::new();
    let ds = DestinationSet::single(DestinationSetType::PushNone, dev("D5"), None);
    let group_id = h
        .orch
        .get_or_create_group(&ds, &hops(&[("D5", &["N1"])]), None, false)
        .unwrap();
    h.drain();

    h.programmer.fail_next_async(ProgrammingError::GroupInstallationFailed("table full".to_string()));
    assert!(h.orch.update_next_hops(&ds, &hops(&[("D5", &["N1", "N3"])])));
    h.drain();

    assert_eq!(h.orch.stats().outcomes_failed, 1);
    assert_eq!(ports_of(&h.device_buckets(group_id)), vec![1]);
    // The record kept the intent; verification installs it.
    assert_eq!(h.orch.next_neighbors(&ds).unwrap().next_hops(&dev("D5")), set(&["N1", "N3"]));

    h.orch.trigger_verification();
    h.drain();
    assert_eq!(ports_of(&h.device_buckets(group_id)), vec![1, 3]);
}

#[test]
fn test_verification_skipped_during_route_computation() {
    let mut h = Harness::new();
    let ds = DestinationSet::single(DestinationSetType::PushNone, dev("D5"), None);
    h.orch
        .get_or_create_group(&ds, &hops(&[("D5", &["N1"])]), None, false)
        .unwrap();
    h.drain();
    h.programmer.clear();

    let guard = h.routing_lock.lock();
    assert!(matches!(h.orch.trigger_verification(), VerificationOutcome::Skipped(_)));
    drop(guard);

    assert!(h.programmer.requests().is_empty());
}

#[test]
fn test_lost_group_recreated_on_edit() {
    let mut h = Harness::new();
    let ds = DestinationSet::single(DestinationSetType::PushNone, dev("D5"), None);
    let group_id = h
        .orch
        .get_or_create_group(&ds, &hops(&[("D5", &["N1"])]), None, false)
        .unwrap();
    h.drain();

    h.programmer.lose_group(&dev("D1"), group_id);
    assert!(h.orch.update_next_hops(&ds, &hops(&[("D5", &["N1", "N2"])])));
    h.drain();

    assert_eq!(h.orch.stats().groups_recreated, 1);
    assert_eq!(ports_of(&h.device_buckets(group_id)), vec![1, 2]);
    assert_eq!(h.orch.pending_count(), 0);
}

#[test]
fn test_end_to_end_push_bos_group() {
    let mut h = Harness::new();
    let ds = DestinationSet::single(DestinationSetType::PushBos, dev("D5"), label(100));

    let group_id = h
        .orch
        .get_or_create_group(&ds, &hops(&[("D5", &["N1", "N2"])]), None, false)
        .unwrap();
    h.drain();

    let requests = h.programmer.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].op, GroupOp::Add);
    assert_eq!(requests[0].group_type, GroupType::Hashed);
    let buckets: Vec<_> = requests[0].buckets.iter().cloned().collect();
    assert_eq!(buckets.len(), 2);
    for (bucket, (out, neighbor_mac)) in buckets.iter().zip([(1, mac(0x11)), (2, mac(0x12))]) {
        assert_eq!(bucket.output, port(out));
        assert_eq!(bucket.eth_dst, Some(neighbor_mac));
        assert_eq!(bucket.eth_src, Some(mac(0x01)));
        assert_eq!(
            bucket.mpls,
            Some(MplsAction::Push {
                label: MplsLabel::new(100).unwrap(),
                copy_ttl_out: true,
            })
        );
    }
    h.programmer.clear();

    h.orch.on_link_down(&link("D1", 2, "N2", 1));
    h.drain();

    let requests = h.programmer.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].op, GroupOp::RemoveFromExisting);
    assert_eq!(requests[0].buckets, BTreeSet::from([buckets[1].clone()]));
    assert_eq!(h.orch.next_neighbors(&ds).unwrap().next_hops(&dev("D5")), set(&["N1"]));
    assert_eq!(h.device_buckets(group_id), BTreeSet::from([buckets[0].clone()]));
}

#[test]
fn test_label_swap_group_single_path_without_mpls_ecmp() {
    let mut h = Harness::new();
    let ds = DestinationSet::single(DestinationSetType::SwapBos, dev("D5"), label(300));
    let group_id = h
        .orch
        .get_or_create_group(&ds, &hops(&[("D5", &["N1"])]), None, false)
        .unwrap();
    h.drain();
    h.programmer.clear();

    h.orch.on_link_up(&link("D1", 4, "N1", 2));
    assert!(h.programmer.requests().is_empty());
    assert_eq!(h.device_buckets(group_id).len(), 1);

    let mut ecmp = Harness::with_config(GroupOrchConfig {
        mpls_ecmp: true,
        ..GroupOrchConfig::default()
    });
    let group_id = ecmp
        .orch
        .get_or_create_group(&ds, &hops(&[("D5", &["N1"])]), None, false)
        .unwrap();
    ecmp.drain();
    ecmp.orch.on_link_up(&link("D1", 4, "N1", 2));
    ecmp.drain();
    assert_eq!(ports_of(&ecmp.device_buckets(group_id)), vec![1, 4]);
}

#[test]
fn test_single_path_groups_untouched_on_link_down() {
    let mut h = Harness::new();
    let swap = DestinationSet::single(DestinationSetType::SwapBos, dev("D5"), label(300));
    let simple = DestinationSet::single(DestinationSetType::PushNone, dev("D5"), None);
    let swap_id = h
        .orch
        .get_or_create_group(&swap, &hops(&[("D5", &["N1"])]), None, false)
        .unwrap();
    let simple_id = h
        .orch
        .get_or_create_group(&simple, &hops(&[("D5", &["N2", "N3"])]), None, true)
        .unwrap();
    h.drain();
    assert_eq!(h.device_buckets(simple_id).len(), 1);
    let simple_hops = h.orch.next_neighbors(&simple).unwrap().next_hops(&dev("D5"));
    assert_eq!(simple_hops.len(), 1);
    h.programmer.clear();

    h.orch.on_link_down(&link("D1", 1, "N1", 1));
    h.orch.on_link_down(&link("D1", 2, "N2", 1));
    h.orch.on_link_down(&link("D1", 3, "N3", 1));
    h.drain();

    assert!(h
        .programmer
        .requests()
        .iter()
        .all(|r| r.op != GroupOp::RemoveFromExisting));
    assert_eq!(h.device_buckets(swap_id).len(), 1);
    assert_eq!(h.device_buckets(simple_id).len(), 1);
    assert_eq!(
        h.orch.next_neighbors(&swap).unwrap().next_hops(&dev("D5")),
        set(&["N1"])
    );
    assert_eq!(
        h.orch.next_neighbors(&simple).unwrap().next_hops(&dev("D5")),
        simple_hops
    );
}

#[tokio::test]
async fn test_store_replicates_to_second_member() {
    let mut h = Harness::new();
    let replica = GroupStore::new(2);
    let mut feed = h.store.destinations().subscribe();
    let ds = DestinationSet::single(DestinationSetType::PushNone, dev("D5"), None);

    h.orch
        .get_or_create_group(&ds, &hops(&[("D5", &["N1"])]), None, false)
        .unwrap();
    h.drain();

    let update = feed.recv().await.unwrap();
    assert!(replica.destinations().merge(update));
    assert_eq!(replica.destinations_of(&dev("D1")).len(), 1);
    assert_eq!(
        replica.destinations_of(&dev("D1"))[0].1,
        h.orch.next_neighbors(&ds).unwrap()
    );
}
