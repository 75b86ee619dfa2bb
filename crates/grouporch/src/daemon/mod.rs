//! GroupOrchDaemon implementation.
//!
//! The daemon runs one [`GroupOrch`] per locally mastered device and:
//! - routes topology events to the orchestrator of the device they start on
//! - pumps each orchestrator's outcome channel through the `Orch` loop
//! - owns the verification timers and shuts everything down together

pub mod simulated;

use crate::adjacency::Link;
use crate::group::{GroupOrch, GroupOrchConfig, GroupOrchContext, GroupOrchError, GroupOrchTask};
use crate::{audit_log, audit::{AuditCategory, AuditOutcome, AuditRecord}};
use log::{debug, info, warn};
use sr_orch_common::Orch;
use sr_types::DeviceId;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Configuration for the GroupOrchDaemon.
#[derive(Debug, Clone)]
pub struct GroupOrchDaemonConfig {
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Store tombstones older than this many logical ticks are dropped
    pub tombstone_horizon: u64,
}

impl Default for GroupOrchDaemonConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1000,
            tombstone_horizon: 100_000,
        }
    }
}

/// Stops a running daemon from another task.
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    shutdown: Arc<watch::Sender<bool>>,
}

impl DaemonHandle {
    pub fn stop(&self) {
        info!("Stopping GroupOrchDaemon");
        audit_log!(
            AuditRecord::new(AuditCategory::SystemLifecycle, "GroupOrchDaemon", "stop_requested")
                .with_outcome(AuditOutcome::Success)
        );
        self.shutdown.send_replace(true);
    }
}

pub struct GroupOrchDaemon {
    config: GroupOrchDaemonConfig,
    orch_config: GroupOrchConfig,
    context: GroupOrchContext,
    links: Vec<Link>,
    /// Registered Orchs sorted by priority
    orchs: BTreeMap<i32, Vec<Box<dyn Orch>>>,
    by_device: BTreeMap<DeviceId, Arc<GroupOrch>>,
    verifiers: Vec<JoinHandle<()>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl GroupOrchDaemon {
    /// Creates a daemon whose orchestrators share `context` and learn
    /// adjacency from `links`.
    pub fn new(
        config: GroupOrchDaemonConfig,
        orch_config: GroupOrchConfig,
        context: GroupOrchContext,
        links: Vec<Link>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            orch_config,
            context,
            links,
            orchs: BTreeMap::new(),
            by_device: BTreeMap::new(),
            verifiers: Vec::new(),
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Registers an Orch with the daemon.
    ///
    /// Orchs are ordered by priority (lower = higher priority).
    pub fn register_orch(&mut self, orch: Box<dyn Orch>) {
        let priority = orch.priority();
        let orch_name = orch.name().to_string();
        info!("Registering {} with priority {}", orch_name, priority);

        audit_log!(
            AuditRecord::new(
                AuditCategory::SystemLifecycle,
                "GroupOrchDaemon",
                format!("register_orch: {}", orch_name),
            )
            .with_outcome(AuditOutcome::Success)
            .with_object_id(&orch_name)
            .with_object_type("orch_module")
            .with_details(serde_json::json!({ "priority": priority }))
        );

        self.orchs.entry(priority).or_default().push(orch);
    }

    /// Starts orchestrating `device`.
    pub fn add_device(&mut self, device: DeviceId) -> Result<Arc<GroupOrch>, GroupOrchError> {
        if let Some(orch) = self.by_device.get(&device) {
            return Ok(Arc::clone(orch));
        }
        let (orch, outcomes) = GroupOrch::new(
            device.clone(),
            self.orch_config.clone(),
            self.context.clone(),
            &self.links,
        )?;
        let orch = Arc::new(orch);
        self.register_orch(Box::new(GroupOrchTask::new(Arc::clone(&orch), outcomes)));
        self.by_device.insert(device, Arc::clone(&orch));
        Ok(orch)
    }

    pub fn orch(&self, device: &DeviceId) -> Option<&Arc<GroupOrch>> {
        self.by_device.get(device)
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceId> {
        self.by_device.keys()
    }

    pub fn orch_count(&self) -> usize {
        self.orchs.values().map(Vec::len).sum()
    }

    /// Builds the broadcast groups of every orchestrated device.
    pub async fn init(&mut self) -> bool {
        info!("Initializing GroupOrchDaemon with {} orchestrators", self.by_device.len());
        audit_log!(
            AuditRecord::new(AuditCategory::SystemLifecycle, "GroupOrchDaemon", "daemon_initialization_start")
                .with_outcome(AuditOutcome::InProgress)
                .with_details(serde_json::json!({ "orch_count": self.by_device.len() }))
        );

        let mut broadcast_groups = 0;
        for orch in self.by_device.values() {
            broadcast_groups += orch.create_groups_from_vlan_config();
        }

        audit_log!(
            AuditRecord::new(AuditCategory::SystemLifecycle, "GroupOrchDaemon", "daemon_initialization_end")
                .with_outcome(AuditOutcome::Success)
                .with_details(serde_json::json!({
                    "orch_count": self.by_device.len(),
                    "broadcast_groups": broadcast_groups,
                }))
        );
        true
    }

    /// Starts one verification timer per orchestrator.
    pub fn spawn_verifiers(&mut self) {
        for orch in self.by_device.values() {
            let handle = Arc::clone(orch).spawn_verifier(self.shutdown.subscribe());
            self.verifiers.push(handle);
        }
        info!("Started {} verifiers", self.verifiers.len());
    }

    pub fn on_link_up(&self, link: &Link) -> usize {
        match self.by_device.get(&link.src.device) {
            Some(orch) => orch.on_link_up(link),
            None => {
                debug!("Link up {} on unmanaged device", link);
                0
            }
        }
    }

    pub fn on_link_down(&self, link: &Link) -> usize {
        match self.by_device.get(&link.src.device) {
            Some(orch) => orch.on_link_down(link),
            None => {
                debug!("Link down {} on unmanaged device", link);
                0
            }
        }
    }

    /// Drops every port towards `device` on all orchestrated devices.
    pub fn on_device_down(&self, device: &DeviceId) -> usize {
        let ports: usize = self
            .by_device
            .values()
            .map(|orch| orch.on_neighbor_down(device).len())
            .sum();
        info!("Device {} down, dropped {} ports", device, ports);
        ports
    }

    /// Hands a next-hop change to the orchestrator of `target`.
    pub fn fix_hash_groups(
        &self,
        target: &DeviceId,
        next_hops: &BTreeSet<DeviceId>,
        destination: &DeviceId,
        revoke: bool,
    ) -> bool {
        match self.by_device.get(target) {
            Some(orch) => orch.fix_hash_groups(target, next_hops, destination, revoke),
            None => {
                warn!("fix_hash_groups for unmanaged device {}", target);
                false
            }
        }
    }

    async fn process_orchs(&mut self) {
        for orchs in self.orchs.values_mut() {
            for orch in orchs.iter_mut() {
                if orch.has_pending_tasks() {
                    debug!("Processing tasks for {}", orch.name());
                    orch.do_task().await;
                }
                orch.on_timer();
            }
        }
    }

    /// Runs the main event loop until [`DaemonHandle::stop`] is called.
    pub async fn run(&mut self) {
        info!("Starting GroupOrchDaemon event loop");
        audit_log!(
            AuditRecord::new(AuditCategory::SystemLifecycle, "GroupOrchDaemon", "event_loop_started")
                .with_outcome(AuditOutcome::Success)
                .with_details(serde_json::json!({
                    "heartbeat_interval_ms": self.config.heartbeat_interval_ms,
                    "orch_count": self.orch_count(),
                }))
        );

        let heartbeat = tokio::time::Duration::from_millis(self.config.heartbeat_interval_ms.max(1));
        let mut shutdown = self.shutdown.subscribe();
        while !*shutdown.borrow() {
            self.process_orchs().await;
            let compacted = self.context.store.compact_tombstones(self.config.tombstone_horizon);
            if compacted > 0 {
                debug!("Compacted {} store tombstones", compacted);
            }

            tokio::select! {
                _ = tokio::time::sleep(heartbeat) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        // Apply outcomes that arrived during the last heartbeat.
        self.process_orchs().await;
        for verifier in self.verifiers.drain(..) {
            if let Err(e) = verifier.await {
                warn!("Verifier task failed: {}", e);
            }
        }

        info!("GroupOrchDaemon event loop stopped");
        audit_log!(
            AuditRecord::new(AuditCategory::SystemLifecycle, "GroupOrchDaemon", "event_loop_stopped")
                .with_outcome(AuditOutcome::Success)
        );
    }

    pub fn dump_pending_tasks(&self) -> Vec<String> {
        self.orchs
            .values()
            .flatten()
            .flat_map(|orch| {
                let name = orch.name().to_string();
                orch.dump_pending_tasks()
                    .into_iter()
                    .map(move |task| format!("{}: {}", name, task))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::simulated::{SimulatedProgrammer, StaticDeviceConfig, StaticRoutingState};
    use super::*;
    use crate::adjacency::ConnectPoint;
    use crate::destination::{DestinationSet, DestinationSetType, NextHopMap};
    use crate::group::{GroupStore, RoutingLock};
    use pretty_assertions::assert_eq;
    use sr_types::{MacAddress, PortNumber, VlanId};
    use std::time::Duration;

    fn dev(id: &str) -> DeviceId {
        DeviceId::new(id).unwrap()
    }

    fn link(src: &str, sp: u32, dst: &str, dp: u32) -> Link {
        Link::direct(
            ConnectPoint::new(dev(src), PortNumber::new(sp)),
            ConnectPoint::new(dev(dst), PortNumber::new(dp)),
        )
    }

    fn daemon() -> GroupOrchDaemon {
        let device_config = StaticDeviceConfig::new()
            .with_router_mac(dev("leaf1"), MacAddress::new([0, 0, 0, 0, 0, 1]))
            .with_router_mac(dev("leaf2"), MacAddress::new([0, 0, 0, 0, 0, 2]))
            .with_router_mac(dev("spine1"), MacAddress::new([0, 0, 0, 0, 0, 0x11]))
            .with_vlan_port(dev("leaf1"), VlanId::new(100).unwrap(), PortNumber::new(10), false);
        let routing = StaticRoutingState::new(true);
        routing.set_master(dev("leaf1"), true);
        routing.set_master(dev("leaf2"), true);
        let context = GroupOrchContext {
            programmer: Arc::new(SimulatedProgrammer::new()),
            device_config: Arc::new(device_config),
            routing: Arc::new(routing),
            routing_lock: RoutingLock::new(),
            store: GroupStore::new(1),
        };
        let links = vec![link("leaf1", 1, "spine1", 1), link("leaf2", 1, "spine1", 2)];
        GroupOrchDaemon::new(
            GroupOrchDaemonConfig {
                heartbeat_interval_ms: 5,
                ..Default::default()
            },
            GroupOrchConfig::default(),
            context,
            links,
        )
    }

    #[tokio::test]
    async fn test_add_device_registers_once() {
        let mut daemon = daemon();
        daemon.add_device(dev("leaf1")).unwrap();
        daemon.add_device(dev("leaf1")).unwrap();

        assert_eq!(daemon.orch_count(), 1);
        assert!(daemon.add_device(dev("unknown")).is_err());
        assert!(daemon.init().await);
        assert!(daemon
            .orch(&dev("leaf1"))
            .unwrap()
            .vlan_group_id(VlanId::new(100).unwrap())
            .is_some());
    }

    #[tokio::test]
    async fn test_events_dispatched_by_source_device() {
        let mut daemon = daemon();
        daemon.add_device(dev("leaf1")).unwrap();
        daemon.add_device(dev("leaf2")).unwrap();

        daemon.on_link_up(&link("leaf2", 2, "spine1", 3));
        assert_eq!(
            daemon.orch(&dev("leaf2")).unwrap().adjacency().ports_to(&dev("spine1")).len(),
            2
        );
        assert_eq!(
            daemon.orch(&dev("leaf1")).unwrap().adjacency().ports_to(&dev("spine1")).len(),
            1
        );

        assert_eq!(daemon.on_device_down(&dev("spine1")), 3);
        assert_eq!(daemon.on_link_up(&link("spine1", 1, "leaf1", 1)), 0);
    }

    #[tokio::test]
    async fn test_fix_hash_groups_dispatched_by_target() {
        let mut daemon = daemon();
        let leaf1 = daemon.add_device(dev("leaf1")).unwrap();
        let ds = DestinationSet::single(DestinationSetType::PushNone, dev("leaf2"), None);
        let next_hops = NextHopMap::from([(dev("leaf2"), BTreeSet::from([dev("spine1")]))]);
        leaf1.get_or_create_group(&ds, &next_hops, None, false).unwrap();

        assert!(daemon.fix_hash_groups(&dev("leaf1"), &BTreeSet::new(), &dev("leaf2"), true));
        assert!(leaf1.next_neighbors(&ds).unwrap().next_hops(&dev("leaf2")).is_empty());
        assert!(!daemon.fix_hash_groups(&dev("leaf9"), &BTreeSet::new(), &dev("leaf2"), true));
    }

    #[tokio::test]
    async fn test_run_pumps_outcomes_until_stopped() {
        let mut daemon = daemon();
        let leaf1 = daemon.add_device(dev("leaf1")).unwrap();
        daemon.init().await;
        daemon.spawn_verifiers();
        assert_eq!(leaf1.pending_count(), 1);
        assert_eq!(daemon.dump_pending_tasks().len(), 1);

        let handle = daemon.handle();
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            handle.stop();
        });
        daemon.run().await;
        stopper.await.unwrap();

        assert_eq!(leaf1.pending_count(), 0);
        assert_eq!(leaf1.stats().outcomes_succeeded, 1);
    }
}
