//! Group orchestration logic: creation, bucket edits and next-hop
//! reconciliation for destination-set groups.

use super::store::{DestinationSetKey, GroupStore, PortKey, VlanKey};
use super::types::{
    GroupId, GroupMetadata, GroupOp, GroupRequest, GroupType, MplsAction, OutcomeReceiver,
    OutcomeSender, ProgrammingError, Treatment,
};
use super::verify::VerificationState;
use crate::adjacency::{AdjacencyTracker, Link};
use crate::destination::{DestinationSet, DestinationSetType, NextHopMap, NextNeighbors};
use crate::{audit_log, audit::{AuditCategory, AuditOutcome, AuditRecord}};
use parking_lot::{Mutex, MutexGuard};
use rand::seq::IteratorRandom;
use sr_types::{DeviceId, MacAddress, MplsLabel, PortNumber, VlanId};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroupOrchError {
    #[error("No adjacency port to neighbor {0}")]
    NoAdjacency(DeviceId),
    #[error("No next hops for {0}")]
    NoNextHops(String),
    #[error("Destination {0} is not a member of {1}")]
    NotInDestinationSet(DeviceId, String),
    #[error("Device config not found: {0}")]
    DeviceConfigNotFound(DeviceId),
    #[error("Request for {requested} sent to orchestrator of {local}")]
    WrongDevice { requested: DeviceId, local: DeviceId },
    #[error("Group not found: {0}")]
    GroupNotFound(String),
    #[error("Broadcast group for VLAN {0} has no ports")]
    NoPorts(VlanId),
    #[error("Programming error: {0}")]
    Programming(#[from] ProgrammingError),
}

#[derive(Debug, Clone)]
pub struct GroupOrchConfig {
    /// Period of the verification pass.
    pub verify_interval: Duration,
    /// Delay before the first verification pass.
    pub verify_initial_delay: Duration,
    /// Whether the devices support hashing over label-swapping buckets.
    pub mpls_ecmp: bool,
    /// VLAN matched by hashed-group metadata.
    pub internal_vlan: VlanId,
    /// VLAN set on not-bottom-of-stack buckets.
    pub pseudowire_vlan: VlanId,
}

impl Default for GroupOrchConfig {
    fn default() -> Self {
        Self {
            verify_interval: Duration::from_secs(30),
            verify_initial_delay: Duration::from_secs(10),
            mpls_ecmp: false,
            internal_vlan: VlanId::SR_INTERNAL,
            pseudowire_vlan: VlanId::SR_PSEUDOWIRE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupOrchStats {
    pub groups_created: u64,
    pub groups_removed: u64,
    pub groups_recreated: u64,
    pub buckets_added: u64,
    pub buckets_removed: u64,
    pub verify_requests: u64,
    pub verification_passes: u64,
    pub verification_skipped: u64,
    pub outcomes_succeeded: u64,
    pub outcomes_failed: u64,
    pub submissions_rejected: u64,
    pub orphans_removed: u64,
    pub intents_dropped: u64,
}

/// Device-programming layer.
///
/// `submit` either rejects the request synchronously or later sends exactly
/// one [`GroupOutcome`](super::GroupOutcome) for it on `outcomes`.
pub trait GroupProgrammer: Send + Sync {
    fn allocate_group_id(&self, device: &DeviceId) -> GroupId;
    fn submit(&self, request: GroupRequest, outcomes: OutcomeSender) -> Result<(), ProgrammingError>;
}

/// Device and interface configuration.
pub trait DeviceConfig: Send + Sync {
    fn router_mac(&self, device: &DeviceId) -> Option<MacAddress>;
    /// False when `port` carries `vlan` untagged, so broadcast buckets pop the tag.
    fn is_vlan_tagged(&self, device: &DeviceId, port: PortNumber, vlan: VlanId) -> bool;
    fn vlan_ports(&self, device: &DeviceId) -> BTreeMap<VlanId, BTreeSet<PortNumber>>;
}

/// Mastership and route-computation status.
pub trait RoutingState: Send + Sync {
    fn is_local_master(&self, device: &DeviceId) -> bool;
    fn is_routing_stable(&self) -> bool;
}

/// Lock serialising route computation with verification.
#[derive(Debug, Clone, Default)]
pub struct RoutingLock(Arc<Mutex<()>>);

impl RoutingLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Held by route computation for the duration of a recompute.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.0.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.0.try_lock()
    }
}

/// Collaborators shared by every orchestrator in the process.
#[derive(Clone)]
pub struct GroupOrchContext {
    pub programmer: Arc<dyn GroupProgrammer>,
    pub device_config: Arc<dyn DeviceConfig>,
    pub routing: Arc<dyn RoutingState>,
    pub routing_lock: RoutingLock,
    pub store: GroupStore,
}

/// Store entry a submitted request belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum GroupOwner {
    Destination(DestinationSet),
    Vlan(VlanId),
    Port(PortKey),
}

#[derive(Debug, Clone)]
pub(crate) struct PendingEdit {
    pub(crate) owner: GroupOwner,
    pub(crate) request: GroupRequest,
}

/// Group orchestrator for one locally mastered device.
pub struct GroupOrch {
    pub(super) device: DeviceId,
    pub(super) config: GroupOrchConfig,
    pub(super) router_mac: MacAddress,
    pub(super) adjacency: AdjacencyTracker,
    pub(super) store: GroupStore,
    pub(super) programmer: Arc<dyn GroupProgrammer>,
    pub(super) device_config: Arc<dyn DeviceConfig>,
    pub(super) routing: Arc<dyn RoutingState>,
    pub(super) routing_lock: RoutingLock,
    pub(super) outcome_tx: OutcomeSender,
    pub(super) pending: Mutex<HashMap<u64, PendingEdit>>,
    pub(super) next_request_id: AtomicU64,
    pub(super) seen_links: Mutex<HashSet<Link>>,
    pub(super) verification_state: Mutex<VerificationState>,
    pub(super) stats: Mutex<GroupOrchStats>,
}

impl GroupOrch {
    /// Creates the orchestrator for `device`, learning adjacency from the
    /// direct links in `links` that leave it.
    ///
    /// Outcomes of submitted requests arrive on the returned receiver and
    /// must be fed back through [`GroupOrch::process_outcome`].
    pub fn new(
        device: DeviceId,
        config: GroupOrchConfig,
        ctx: GroupOrchContext,
        links: &[Link],
    ) -> Result<(Self, OutcomeReceiver), GroupOrchError> {
        let router_mac = ctx
            .device_config
            .router_mac(&device)
            .ok_or_else(|| GroupOrchError::DeviceConfigNotFound(device.clone()))?;

        let adjacency = AdjacencyTracker::from_links(device.clone(), links);
        let seen_links = links
            .iter()
            .filter(|l| l.is_direct() && l.src.device == device)
            .cloned()
            .collect();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

        info!(
            device = %device,
            router_mac = %router_mac,
            neighbors = adjacency.neighbors().len(),
            "GroupOrch initialized"
        );

        let orch = Self {
            device,
            config,
            router_mac,
            adjacency,
            store: ctx.store,
            programmer: ctx.programmer,
            device_config: ctx.device_config,
            routing: ctx.routing,
            routing_lock: ctx.routing_lock,
            outcome_tx,
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(0),
            seen_links: Mutex::new(seen_links),
            verification_state: Mutex::new(VerificationState::Idle),
            stats: Mutex::new(GroupOrchStats::default()),
        };
        Ok((orch, outcome_rx))
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn config(&self) -> &GroupOrchConfig {
        &self.config
    }

    pub fn adjacency(&self) -> &AdjacencyTracker {
        &self.adjacency
    }

    pub fn store(&self) -> &GroupStore {
        &self.store
    }

    pub fn stats(&self) -> GroupOrchStats {
        self.stats.lock().clone()
    }

    pub fn has_group(&self, ds: &DestinationSet) -> bool {
        self.store.destinations().contains_key(&self.key(ds))
    }

    pub fn next_neighbors(&self, ds: &DestinationSet) -> Option<NextNeighbors> {
        self.store.destinations().get(&self.key(ds))
    }

    pub(super) fn key(&self, ds: &DestinationSet) -> DestinationSetKey {
        DestinationSetKey::new(self.device.clone(), ds.clone())
    }

    /// Group id the store currently names for `owner`.
    pub(super) fn stored_group_id(&self, owner: &GroupOwner) -> Option<GroupId> {
        match owner {
            GroupOwner::Destination(ds) => self.store.destinations().get(&self.key(ds)).map(|r| r.group_id),
            GroupOwner::Vlan(vlan) => self.store.vlans().get(&VlanKey::new(self.device.clone(), *vlan)),
            GroupOwner::Port(key) => self.store.ports().get(key),
        }
    }

    /// Deletes the store entry of `owner`.
    pub(super) fn forget_owner(&self, owner: &GroupOwner) {
        match owner {
            GroupOwner::Destination(ds) => {
                self.store.destinations().remove(&self.key(ds));
            }
            GroupOwner::Vlan(vlan) => {
                self.store.vlans().remove(&VlanKey::new(self.device.clone(), *vlan));
            }
            GroupOwner::Port(key) => {
                self.store.ports().remove(key);
            }
        }
    }

    /// Returns the group for `ds`, creating it if needed.
    ///
    /// An existing group whose recorded next hops differ from `next_hops` is
    /// patched with [`GroupOrch::update_next_hops`] first. Creation fails
    /// without side effects if a next hop has no known adjacency port.
    pub fn get_or_create_group(
        &self,
        ds: &DestinationSet,
        next_hops: &NextHopMap,
        metadata: Option<GroupMetadata>,
        simple: bool,
    ) -> Result<GroupId, GroupOrchError> {
        if let Some(record) = self.store.destinations().get(&self.key(ds)) {
            if record.dst_next_hops != project(ds, next_hops)
                && !self.update_next_hops(ds, next_hops)
            {
                warn!(device = %self.device, ds = %ds, "Next-hop update incomplete");
            }
            return Ok(record.group_id);
        }
        self.create_group(ds, next_hops, metadata, simple)
    }

    fn create_group(
        &self,
        ds: &DestinationSet,
        next_hops: &NextHopMap,
        metadata: Option<GroupMetadata>,
        simple: bool,
    ) -> Result<GroupId, GroupOrchError> {
        let fail = |err: GroupOrchError| {
            self.audit_failure(AuditCategory::GroupCreate, "create_group", &ds.to_string(), &err);
            err
        };

        if let Some(outsider) = next_hops.keys().find(|d| !ds.contains(d)) {
            return Err(fail(GroupOrchError::NotInDestinationSet(
                outsider.clone(),
                ds.to_string(),
            )));
        }
        let dst_next_hops = project(ds, next_hops);
        if dst_next_hops.is_empty() {
            return Err(fail(GroupOrchError::NoNextHops(ds.to_string())));
        }

        let group_type = if simple || self.requires_simple(ds) {
            GroupType::Simple
        } else {
            GroupType::Hashed
        };

        let mut rng = rand::thread_rng();
        let mut buckets = BTreeSet::new();
        let mut recorded = NextHopMap::new();
        'destinations: for (destination, hops) in &dst_next_hops {
            let label = ds.edge_label(destination);
            for neighbor in hops {
                let ports = self.adjacency.ports_to(neighbor);
                if ports.is_empty() {
                    return Err(fail(GroupOrchError::NoAdjacency(neighbor.clone())));
                }
                let mac = self.neighbor_mac(neighbor).map_err(fail)?;
                recorded
                    .entry(destination.clone())
                    .or_default()
                    .insert(neighbor.clone());
                if group_type == GroupType::Simple {
                    // One path in total: a random port of the first neighbor.
                    if let Some(port) = ports.iter().copied().choose(&mut rng) {
                        buckets.insert(self.build_bucket(ds.ds_type(), port, mac, label));
                    }
                    break 'destinations;
                }
                for port in ports {
                    buckets.insert(self.build_bucket(ds.ds_type(), port, mac, label));
                }
            }
        }

        let group_id = self.programmer.allocate_group_id(&self.device);
        let metadata = metadata.unwrap_or_else(|| self.hashed_metadata());
        let bucket_count = buckets.len();
        self.submit(
            GroupOwner::Destination(ds.clone()),
            group_id,
            group_type,
            buckets,
            Some(metadata),
            GroupOp::Add,
        )
        .map_err(|e| fail(e.into()))?;

        self.store.destinations().put(
            self.key(ds),
            NextNeighbors::new(recorded, group_id, group_type),
        );
        {
            let mut stats = self.stats.lock();
            stats.groups_created += 1;
            stats.buckets_added += bucket_count as u64;
        }

        info!(
            device = %self.device,
            ds = %ds,
            group_id = %group_id,
            group_type = %group_type,
            buckets = bucket_count,
            "Created group"
        );
        audit_log!(
            AuditRecord::new(AuditCategory::GroupCreate, "GroupOrch", "create_group")
                .with_outcome(AuditOutcome::InProgress)
                .with_object_id(format!("{}/{}", self.device, group_id))
                .with_object_type(group_type.as_str())
                .with_details(serde_json::json!({
                    "destination_set": ds.to_string(),
                    "bucket_count": bucket_count,
                }))
        );

        Ok(group_id)
    }

    /// Adds one bucket per adjacency port to `neighbor` to `group_id`.
    ///
    /// A simple group is never extended; it keeps the single path it was
    /// created with.
    pub fn add_ports_for_neighbor(
        &self,
        ds: &DestinationSet,
        neighbor: &DeviceId,
        edge_label: Option<MplsLabel>,
        group_id: GroupId,
    ) -> Result<(), GroupOrchError> {
        let ports = self.adjacency.ports_to(neighbor);
        if ports.is_empty() {
            let err = GroupOrchError::NoAdjacency(neighbor.clone());
            self.audit_failure(AuditCategory::GroupModify, "add_buckets", &group_id.to_string(), &err);
            return Err(err);
        }
        if self.next_neighbors(ds).is_some_and(|r| r.is_simple()) {
            debug!(
                device = %self.device,
                ds = %ds,
                neighbor = %neighbor,
                group_id = %group_id,
                "Simple group keeps its single path"
            );
            return Ok(());
        }
        self.edit_neighbor_buckets(ds, neighbor, &ports, edge_label, group_id, GroupOp::AddToExisting)
            .map(|_| ())
    }

    /// Removes the buckets for every adjacency port to `neighbor` from
    /// `group_id`. Succeeds trivially when no port is known.
    pub fn remove_ports_for_neighbor(
        &self,
        ds: &DestinationSet,
        neighbor: &DeviceId,
        edge_label: Option<MplsLabel>,
        group_id: GroupId,
    ) -> Result<(), GroupOrchError> {
        let ports = self.adjacency.ports_to(neighbor);
        if ports.is_empty() {
            debug!(
                device = %self.device,
                neighbor = %neighbor,
                group_id = %group_id,
                "No ports to neighbor, nothing to remove"
            );
            return Ok(());
        }
        self.edit_neighbor_buckets(
            ds,
            neighbor,
            &ports,
            edge_label,
            group_id,
            GroupOp::RemoveFromExisting,
        )
        .map(|_| ())
    }

    /// Patches the group for `ds` from its recorded next hops to
    /// `new_next_hops`, destination by destination.
    ///
    /// Every edit is attempted; the result is false if any failed, in which
    /// case the record is left as it was for verification to repair.
    /// A simple group is not edited bucket by bucket; it stays on its path or
    /// moves to one new path.
    pub fn update_next_hops(&self, ds: &DestinationSet, new_next_hops: &NextHopMap) -> bool {
        let key = self.key(ds);
        let Some(record) = self.store.destinations().get(&key) else {
            warn!(device = %self.device, ds = %ds, "No group to update");
            return false;
        };
        let desired = project(ds, new_next_hops);
        if record.is_simple() {
            return self.reroute_simple(ds, key, &record, &desired);
        }
        let group_id = record.group_id;
        let mut success = true;

        for destination in ds.destinations() {
            let current = record.next_hops(destination);
            let wanted = desired.get(destination).cloned().unwrap_or_default();
            let label = ds.edge_label(destination);

            for neighbor in wanted.difference(&current) {
                if let Err(e) = self.add_ports_for_neighbor(ds, neighbor, label, group_id) {
                    warn!(
                        device = %self.device,
                        ds = %ds,
                        neighbor = %neighbor,
                        error = %e,
                        "Failed to add next hop"
                    );
                    success = false;
                }
            }
            for neighbor in current.difference(&wanted) {
                if bucket_shared(ds, &desired, destination, neighbor) {
                    debug!(neighbor = %neighbor, ds = %ds, "Bucket still used by another destination");
                    continue;
                }
                if let Err(e) = self.remove_ports_for_neighbor(ds, neighbor, label, group_id) {
                    warn!(
                        device = %self.device,
                        ds = %ds,
                        neighbor = %neighbor,
                        error = %e,
                        "Failed to remove next hop"
                    );
                    success = false;
                }
            }
        }

        if success {
            self.store.destinations().put(
                key,
                NextNeighbors::new(desired, group_id, record.group_type),
            );
        }
        audit_log!(
            AuditRecord::new(AuditCategory::GroupModify, "GroupOrch", "update_next_hops")
                .with_outcome(if success { AuditOutcome::Success } else { AuditOutcome::Failure })
                .with_object_id(format!("{}/{}", self.device, group_id))
                .with_details(serde_json::json!({ "destination_set": ds.to_string() }))
        );
        success
    }

    /// Keeps a simple group on its path while that neighbor is still a
    /// usable next hop, otherwise replaces its one bucket with a new single
    /// path through `desired`.
    fn reroute_simple(
        &self,
        ds: &DestinationSet,
        key: DestinationSetKey,
        record: &NextNeighbors,
        desired: &NextHopMap,
    ) -> bool {
        let path_kept = record.dst_next_hops.iter().any(|(dst, hops)| {
            hops.iter().any(|neighbor| {
                desired.get(dst).is_some_and(|d| d.contains(neighbor))
                    && self.adjacency.has_ports_to(neighbor)
            })
        });
        if path_kept {
            debug!(device = %self.device, ds = %ds, "Simple group path still valid");
            return true;
        }

        let Some((destination, neighbor, bucket)) = self.simple_path(ds, desired) else {
            warn!(device = %self.device, ds = %ds, "No usable next hop for simple group");
            return false;
        };
        if let Err(e) = self.submit(
            GroupOwner::Destination(ds.clone()),
            record.group_id,
            GroupType::Simple,
            BTreeSet::from([bucket]),
            Some(self.hashed_metadata()),
            GroupOp::Verify,
        ) {
            let err = GroupOrchError::from(e);
            self.audit_failure(AuditCategory::GroupModify, "reroute_simple", &record.group_id.to_string(), &err);
            return false;
        }

        self.store.destinations().put(
            key,
            NextNeighbors::new(
                NextHopMap::from([(destination, BTreeSet::from([neighbor.clone()]))]),
                record.group_id,
                GroupType::Simple,
            ),
        );
        info!(
            device = %self.device,
            ds = %ds,
            group_id = %record.group_id,
            neighbor = %neighbor,
            "Moved simple group to new path"
        );
        audit_log!(
            AuditRecord::new(AuditCategory::GroupModify, "GroupOrch", "reroute_simple")
                .with_outcome(AuditOutcome::InProgress)
                .with_object_id(format!("{}/{}", self.device, record.group_id))
                .with_object_type(GroupType::Simple.as_str())
                .with_details(serde_json::json!({
                    "destination_set": ds.to_string(),
                    "neighbor": neighbor.to_string(),
                }))
        );
        true
    }

    /// First usable path through `next_hops` in destination order, on a
    /// randomly chosen port.
    fn simple_path(
        &self,
        ds: &DestinationSet,
        next_hops: &NextHopMap,
    ) -> Option<(DeviceId, DeviceId, Treatment)> {
        let mut rng = rand::thread_rng();
        for destination in ds.destinations() {
            let Some(hops) = next_hops.get(destination) else {
                continue;
            };
            for neighbor in hops {
                let Ok(mac) = self.neighbor_mac(neighbor) else {
                    continue;
                };
                let Some(port) = self.adjacency.ports_to(neighbor).into_iter().choose(&mut rng) else {
                    continue;
                };
                let bucket = self.build_bucket(ds.ds_type(), port, mac, ds.edge_label(destination));
                return Some((destination.clone(), neighbor.clone(), bucket));
            }
        }
        None
    }

    /// Projects `next_hops` towards `destination` onto every non-simple
    /// group of `target` that covers `destination`.
    ///
    /// With `revoke` only buckets for neighbors no longer in `next_hops` are
    /// removed, otherwise only buckets for new neighbors are added. Returns
    /// true when every relevant group was updated, or none exists.
    pub fn fix_hash_groups(
        &self,
        target: &DeviceId,
        next_hops: &BTreeSet<DeviceId>,
        destination: &DeviceId,
        revoke: bool,
    ) -> bool {
        if target != &self.device {
            let err = GroupOrchError::WrongDevice {
                requested: target.clone(),
                local: self.device.clone(),
            };
            warn!(error = %err, "Rejecting fix_hash_groups");
            return false;
        }

        let mut success = true;
        for (key, record) in self.store.destinations_of(&self.device) {
            let ds = &key.ds;
            if !ds.contains(destination) || record.is_simple() {
                continue;
            }
            let Some(current) = record.dst_next_hops.get(destination).cloned() else {
                warn!(device = %self.device, ds = %ds, destination = %destination, "No next hops recorded");
                success = false;
                continue;
            };

            let label = ds.edge_label(destination);
            let mut key_ok = true;
            let updated: BTreeSet<DeviceId> = if revoke {
                let mut after = record.dst_next_hops.clone();
                after.insert(destination.clone(), current.intersection(next_hops).cloned().collect());
                for neighbor in current.difference(next_hops) {
                    if bucket_shared(ds, &after, destination, neighbor) {
                        continue;
                    }
                    if let Err(e) = self.remove_ports_for_neighbor(ds, neighbor, label, record.group_id) {
                        warn!(ds = %ds, neighbor = %neighbor, error = %e, "Failed to revoke next hop");
                        key_ok = false;
                    }
                }
                current.intersection(next_hops).cloned().collect()
            } else {
                for neighbor in next_hops.difference(&current) {
                    if let Err(e) = self.add_ports_for_neighbor(ds, neighbor, label, record.group_id) {
                        warn!(ds = %ds, neighbor = %neighbor, error = %e, "Failed to add next hop");
                        key_ok = false;
                    }
                }
                current.union(next_hops).cloned().collect()
            };

            if key_ok {
                let destination = destination.clone();
                if let Err(e) = self
                    .store
                    .destinations()
                    .update(&key, |r| r.set_next_hops(destination, updated))
                {
                    warn!(ds = %ds, error = %e, "Record vanished during update");
                    key_ok = false;
                }
            }
            success &= key_ok;
        }

        debug!(
            device = %self.device,
            destination = %destination,
            revoke,
            success,
            "fix_hash_groups finished"
        );
        success
    }

    /// Buckets the group for `ds` should hold, from its record and the
    /// current adjacency.
    pub fn expected_buckets(&self, ds: &DestinationSet) -> Option<BTreeSet<Treatment>> {
        let record = self.store.destinations().get(&self.key(ds))?;
        Some(self.buckets_for_record(ds, &record))
    }

    pub(super) fn buckets_for_record(
        &self,
        ds: &DestinationSet,
        record: &NextNeighbors,
    ) -> BTreeSet<Treatment> {
        if record.is_simple() {
            return self
                .simple_path(ds, &record.dst_next_hops)
                .map(|(_, _, bucket)| BTreeSet::from([bucket]))
                .unwrap_or_default();
        }
        let mut buckets = BTreeSet::new();
        for (destination, hops) in &record.dst_next_hops {
            let label = ds.edge_label(destination);
            for neighbor in hops {
                let Ok(mac) = self.neighbor_mac(neighbor) else {
                    warn!(neighbor = %neighbor, "Skipping neighbor without router MAC");
                    continue;
                };
                for port in self.adjacency.ports_to(neighbor) {
                    buckets.insert(self.build_bucket(ds.ds_type(), port, mac, label));
                }
            }
        }
        buckets
    }

    /// Whether link events and verification may edit this group bucket by
    /// bucket. Simple groups and label-swapping groups on devices without
    /// MPLS ECMP keep their single path.
    pub(super) fn is_hash_editable(&self, ds: &DestinationSet, record: &NextNeighbors) -> bool {
        !record.is_simple() && !self.requires_simple(ds)
    }

    fn requires_simple(&self, ds: &DestinationSet) -> bool {
        (ds.is_not_bos() || ds.is_swap()) && !self.config.mpls_ecmp
    }

    pub(super) fn neighbor_mac(&self, neighbor: &DeviceId) -> Result<MacAddress, GroupOrchError> {
        self.device_config
            .router_mac(neighbor)
            .ok_or_else(|| GroupOrchError::DeviceConfigNotFound(neighbor.clone()))
    }

    pub(super) fn hashed_metadata(&self) -> GroupMetadata {
        GroupMetadata::vlan(self.config.internal_vlan)
    }

    /// One bucket towards a neighbor through `port`.
    pub(super) fn build_bucket(
        &self,
        ds_type: DestinationSetType,
        port: PortNumber,
        neighbor_mac: MacAddress,
        label: Option<MplsLabel>,
    ) -> Treatment {
        let mut bucket = Treatment::output(port)
            .with_eth_dst(neighbor_mac)
            .with_eth_src(self.router_mac);
        if let Some(label) = label {
            let action = if ds_type.is_swap() {
                MplsAction::Swap(label)
            } else {
                MplsAction::Push {
                    label,
                    copy_ttl_out: true,
                }
            };
            bucket = bucket.with_mpls(action);
        }
        if ds_type.is_not_bos() {
            bucket = bucket.with_vlan(self.config.pseudowire_vlan);
        }
        bucket
    }

    /// Submits buckets towards `neighbor` through `ports` as one edit.
    pub(super) fn edit_neighbor_buckets(
        &self,
        ds: &DestinationSet,
        neighbor: &DeviceId,
        ports: &BTreeSet<PortNumber>,
        label: Option<MplsLabel>,
        group_id: GroupId,
        op: GroupOp,
    ) -> Result<usize, GroupOrchError> {
        let action = if op.is_remove_path() { "remove_buckets" } else { "add_buckets" };
        let mac = match self.neighbor_mac(neighbor) {
            Ok(mac) => mac,
            Err(err) => {
                self.audit_failure(AuditCategory::GroupModify, action, &group_id.to_string(), &err);
                return Err(err);
            }
        };
        let buckets: BTreeSet<Treatment> = ports
            .iter()
            .map(|port| self.build_bucket(ds.ds_type(), *port, mac, label))
            .collect();
        let count = buckets.len();
        let group_type = self
            .store
            .destinations()
            .get(&self.key(ds))
            .map_or(GroupType::Hashed, |r| r.group_type);

        if let Err(e) = self.submit(
            GroupOwner::Destination(ds.clone()),
            group_id,
            group_type,
            buckets,
            Some(self.hashed_metadata()),
            op,
        ) {
            let err = GroupOrchError::from(e);
            self.audit_failure(AuditCategory::GroupModify, action, &group_id.to_string(), &err);
            return Err(err);
        }

        {
            let mut stats = self.stats.lock();
            if op.is_remove_path() {
                stats.buckets_removed += count as u64;
            } else {
                stats.buckets_added += count as u64;
            }
        }
        debug!(
            device = %self.device,
            group_id = %group_id,
            neighbor = %neighbor,
            op = %op,
            buckets = count,
            "Submitted bucket edit"
        );
        audit_log!(
            AuditRecord::new(AuditCategory::GroupModify, "GroupOrch", action)
                .with_outcome(AuditOutcome::InProgress)
                .with_object_id(format!("{}/{}", self.device, group_id))
                .with_object_type(group_type.as_str())
                .with_details(serde_json::json!({
                    "neighbor": neighbor.to_string(),
                    "ports": ports.iter().map(|p| p.as_u32()).collect::<Vec<_>>(),
                }))
        );
        Ok(count)
    }

    /// Hands a request to the programmer and tracks it until its outcome
    /// arrives. Returns the request id.
    pub(super) fn submit(
        &self,
        owner: GroupOwner,
        group_id: GroupId,
        group_type: GroupType,
        buckets: BTreeSet<Treatment>,
        metadata: Option<GroupMetadata>,
        op: GroupOp,
    ) -> Result<u64, ProgrammingError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst) + 1;
        let request = GroupRequest {
            request_id,
            device: self.device.clone(),
            group_id,
            group_type,
            buckets,
            metadata,
            op,
        };

        self.pending.lock().insert(
            request_id,
            PendingEdit {
                owner,
                request: request.clone(),
            },
        );
        if let Err(e) = self.programmer.submit(request, self.outcome_tx.clone()) {
            self.pending.lock().remove(&request_id);
            self.stats.lock().submissions_rejected += 1;
            warn!(
                device = %self.device,
                group_id = %group_id,
                op = %op,
                error = %e,
                "Device rejected group request"
            );
            return Err(e);
        }
        Ok(request_id)
    }

    pub(super) fn audit_failure(
        &self,
        category: AuditCategory,
        action: &str,
        object: &str,
        err: &GroupOrchError,
    ) {
        warn!(device = %self.device, object = %object, error = %err, "{} failed", action);
        audit_log!(
            AuditRecord::new(category, "GroupOrch", action)
                .with_object_id(format!("{}/{}", self.device, object))
                .with_error(err.to_string())
        );
    }
}

/// `next_hops` restricted to members of `ds`, without empty sets.
fn project(ds: &DestinationSet, next_hops: &NextHopMap) -> NextHopMap {
    next_hops
        .iter()
        .filter(|(dst, hops)| ds.contains(dst) && !hops.is_empty())
        .map(|(dst, hops)| (dst.clone(), hops.clone()))
        .collect()
}

/// True if another destination of `ds` still reaches `neighbor` with the
/// same label, i.e. would own identical buckets.
fn bucket_shared(
    ds: &DestinationSet,
    next_hops: &NextHopMap,
    destination: &DeviceId,
    neighbor: &DeviceId,
) -> bool {
    let label = ds.edge_label(destination);
    next_hops.iter().any(|(dst, hops)| {
        dst != destination && hops.contains(neighbor) && ds.edge_label(dst) == label
    })
}
