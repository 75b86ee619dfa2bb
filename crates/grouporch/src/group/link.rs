//! Link and neighbor event handling.

use super::orch::GroupOrch;
use super::types::GroupOp;
use crate::adjacency::Link;
use crate::{audit_log, audit::{AuditCategory, AuditOutcome, AuditRecord}};
use sr_types::{DeviceId, MplsLabel, PortNumber};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

impl GroupOrch {
    fn owns_link(&self, link: &Link) -> bool {
        if !link.is_direct() || link.src.device != self.device {
            debug!(device = %self.device, link = %link, "Ignoring link event");
            return false;
        }
        true
    }

    /// Handles a link coming up from this device.
    ///
    /// Adjacency is always updated. If this instance is master, every
    /// hash-editable group already using the neighbor gains buckets: for all
    /// ports to it when the link was never seen before, otherwise only for
    /// the port that came up. Returns the number of bucket edits submitted.
    pub fn on_link_up(&self, link: &Link) -> usize {
        if !self.owns_link(link) {
            return 0;
        }
        let neighbor = &link.dst.device;
        let port = link.src.port;

        self.adjacency.add_neighbor_at_port(neighbor.clone(), port);
        let first_time = self.seen_links.lock().insert(link.clone());

        info!(device = %self.device, link = %link, first_time, "Link up");
        audit_log!(
            AuditRecord::new(AuditCategory::TopologyChange, "GroupOrch", "link_up")
                .with_outcome(AuditOutcome::Success)
                .with_object_id(link.to_string())
                .with_object_type("link")
                .with_details(serde_json::json!({ "first_time": first_time }))
        );

        if !self.routing.is_local_master(&self.device) {
            debug!(device = %self.device, "Not master, leaving groups untouched");
            return 0;
        }

        let ports = if first_time {
            self.adjacency.ports_to(neighbor)
        } else {
            BTreeSet::from([port])
        };
        self.edit_groups_via(neighbor, &ports, GroupOp::AddToExisting)
    }

    /// Handles a link from this device going down.
    ///
    /// Buckets for the down port are removed from every hash-editable group
    /// using the neighbor before the port is dropped from adjacency. A
    /// neighbor left without ports is dropped from those groups' records.
    pub fn on_link_down(&self, link: &Link) -> usize {
        if !self.owns_link(link) {
            return 0;
        }
        let neighbor = &link.dst.device;
        let port = link.src.port;
        let master = self.routing.is_local_master(&self.device);

        let edits = if master {
            self.edit_groups_via(neighbor, &BTreeSet::from([port]), GroupOp::RemoveFromExisting)
        } else {
            0
        };
        self.adjacency.remove_neighbor_at_port(port);

        if master && !self.adjacency.has_ports_to(neighbor) {
            self.forget_next_hop(neighbor);
        }

        info!(device = %self.device, link = %link, edits, "Link down");
        audit_log!(
            AuditRecord::new(AuditCategory::TopologyChange, "GroupOrch", "link_down")
                .with_outcome(AuditOutcome::Success)
                .with_object_id(link.to_string())
                .with_object_type("link")
        );
        edits
    }

    /// Drops every port to a neighbor device that went away.
    pub fn on_neighbor_down(&self, neighbor: &DeviceId) -> BTreeSet<PortNumber> {
        let ports = self.adjacency.remove_neighbor(neighbor);
        self.seen_links.lock().retain(|l| &l.dst.device != neighbor);
        info!(
            device = %self.device,
            neighbor = %neighbor,
            ports = ports.len(),
            "Neighbor down"
        );
        audit_log!(
            AuditRecord::new(AuditCategory::TopologyChange, "GroupOrch", "neighbor_down")
                .with_outcome(AuditOutcome::Success)
                .with_object_id(neighbor.to_string())
                .with_object_type("device")
        );
        ports
    }

    /// Submits one edit per (group, label) for the hash-editable groups that
    /// use `neighbor` as a next hop.
    fn edit_groups_via(&self, neighbor: &DeviceId, ports: &BTreeSet<PortNumber>, op: GroupOp) -> usize {
        if ports.is_empty() {
            return 0;
        }
        let mut edits = 0;
        for (key, record) in self.store.destinations_of(&self.device) {
            if !record.contains_next_hop(neighbor) || !self.is_hash_editable(&key.ds, &record) {
                continue;
            }
            // Destinations sharing a label share the bucket.
            let labels: BTreeSet<Option<MplsLabel>> = record
                .destinations_for_next_hop(neighbor)
                .iter()
                .map(|dst| key.ds.edge_label(dst))
                .collect();
            for label in labels {
                match self.edit_neighbor_buckets(&key.ds, neighbor, ports, label, record.group_id, op) {
                    Ok(_) => edits += 1,
                    Err(e) => warn!(
                        device = %self.device,
                        ds = %key.ds,
                        neighbor = %neighbor,
                        error = %e,
                        "Link-triggered bucket edit failed"
                    ),
                }
            }
        }
        edits
    }

    fn forget_next_hop(&self, neighbor: &DeviceId) {
        for (key, record) in self.store.destinations_of(&self.device) {
            if !record.contains_next_hop(neighbor) || !self.is_hash_editable(&key.ds, &record) {
                continue;
            }
            if let Err(e) = self.store.destinations().update(&key, |r| {
                r.remove_next_hop(neighbor);
            }) {
                warn!(ds = %key.ds, error = %e, "Record vanished while dropping next hop");
            }
        }
    }
}
