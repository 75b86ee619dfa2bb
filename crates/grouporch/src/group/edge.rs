//! Broadcast and single-port groups, and removal of any group by id.

use super::orch::{GroupOrch, GroupOrchError, GroupOwner};
use super::store::{PortKey, VlanKey};
use super::types::{GroupId, GroupMetadata, GroupOp, GroupType, Treatment};
use crate::{audit_log, audit::{AuditCategory, AuditOutcome, AuditRecord}};
use sr_types::{PortNumber, VlanId};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

impl GroupOrch {
    fn flood_bucket(port: PortNumber, pop_vlan: bool) -> Treatment {
        let bucket = Treatment::output(port);
        if pop_vlan {
            bucket.with_pop_vlan()
        } else {
            bucket
        }
    }

    fn pops_vlan(&self, port: PortNumber, vlan: VlanId) -> bool {
        !self.device_config.is_vlan_tagged(&self.device, port, vlan)
    }

    pub fn vlan_group_id(&self, vlan: VlanId) -> Option<GroupId> {
        self.store
            .vlans()
            .get(&VlanKey::new(self.device.clone(), vlan))
    }

    /// Creates the broadcast group for `vlan` over `ports`. A group that
    /// already exists is returned as is.
    pub fn create_broadcast_group(
        &self,
        vlan: VlanId,
        ports: &BTreeSet<PortNumber>,
    ) -> Result<GroupId, GroupOrchError> {
        let buckets = ports
            .iter()
            .map(|port| Self::flood_bucket(*port, self.pops_vlan(*port, vlan)))
            .collect();
        self.install_broadcast_group(vlan, buckets)
    }

    fn install_broadcast_group(
        &self,
        vlan: VlanId,
        buckets: BTreeSet<Treatment>,
    ) -> Result<GroupId, GroupOrchError> {
        if let Some(group_id) = self.vlan_group_id(vlan) {
            debug!(device = %self.device, vlan = %vlan, group_id = %group_id, "Broadcast group exists");
            return Ok(group_id);
        }
        if buckets.is_empty() {
            let err = GroupOrchError::NoPorts(vlan);
            self.audit_failure(AuditCategory::GroupCreate, "create_broadcast_group", &vlan.to_string(), &err);
            return Err(err);
        }

        let group_id = self.programmer.allocate_group_id(&self.device);
        let count = buckets.len();
        if let Err(e) = self.submit(
            GroupOwner::Vlan(vlan),
            group_id,
            GroupType::Broadcast,
            buckets,
            Some(GroupMetadata::vlan(vlan)),
            GroupOp::Add,
        ) {
            let err = GroupOrchError::from(e);
            self.audit_failure(AuditCategory::GroupCreate, "create_broadcast_group", &vlan.to_string(), &err);
            return Err(err);
        }

        self.store
            .vlans()
            .put(VlanKey::new(self.device.clone(), vlan), group_id);
        {
            let mut stats = self.stats.lock();
            stats.groups_created += 1;
            stats.buckets_added += count as u64;
        }
        info!(device = %self.device, vlan = %vlan, group_id = %group_id, ports = count, "Created broadcast group");
        audit_log!(
            AuditRecord::new(AuditCategory::GroupCreate, "GroupOrch", "create_broadcast_group")
                .with_outcome(AuditOutcome::InProgress)
                .with_object_id(format!("{}/{}", self.device, group_id))
                .with_object_type(GroupType::Broadcast.as_str())
                .with_details(serde_json::json!({ "vlan": vlan.as_u16(), "ports": count }))
        );
        Ok(group_id)
    }

    /// Creates one broadcast group per VLAN configured on this device.
    /// Returns how many groups exist afterwards.
    pub fn create_groups_from_vlan_config(&self) -> usize {
        let mut ready = 0;
        for (vlan, ports) in self.device_config.vlan_ports(&self.device) {
            match self.create_broadcast_group(vlan, &ports) {
                Ok(_) => ready += 1,
                Err(e) => warn!(device = %self.device, vlan = %vlan, error = %e, "Broadcast group not created"),
            }
        }
        ready
    }

    /// Adds or removes an edge port's bucket in the VLAN's broadcast group.
    ///
    /// The first port to come up in a VLAN without a group creates it; a
    /// port going down in such a VLAN is a no-op.
    pub fn process_edge_port(
        &self,
        port: PortNumber,
        vlan: VlanId,
        pop_vlan: bool,
        port_up: bool,
    ) -> Result<(), GroupOrchError> {
        match self.vlan_group_id(vlan) {
            Some(group_id) => {
                let op = if port_up {
                    GroupOp::AddToExisting
                } else {
                    GroupOp::RemoveFromExisting
                };
                self.edit_broadcast_bucket(vlan, Self::flood_bucket(port, pop_vlan), group_id, op)
            }
            None if port_up => self
                .install_broadcast_group(vlan, BTreeSet::from([Self::flood_bucket(port, pop_vlan)]))
                .map(|_| ()),
            None => {
                debug!(device = %self.device, vlan = %vlan, port = %port, "No broadcast group for down port");
                Ok(())
            }
        }
    }

    /// Installs or removes `port` in `group_id`, popping the tag when the
    /// interface config has the port untagged in `vlan`.
    pub fn update_group_from_vlan_configuration(
        &self,
        vlan: VlanId,
        port: PortNumber,
        group_id: GroupId,
        install: bool,
    ) -> Result<(), GroupOrchError> {
        let op = if install {
            GroupOp::AddToExisting
        } else {
            GroupOp::RemoveFromExisting
        };
        let bucket = Self::flood_bucket(port, self.pops_vlan(port, vlan));
        self.edit_broadcast_bucket(vlan, bucket, group_id, op)
    }

    fn edit_broadcast_bucket(
        &self,
        vlan: VlanId,
        bucket: Treatment,
        group_id: GroupId,
        op: GroupOp,
    ) -> Result<(), GroupOrchError> {
        let port = bucket.output;
        if let Err(e) = self.submit(
            GroupOwner::Vlan(vlan),
            group_id,
            GroupType::Broadcast,
            BTreeSet::from([bucket]),
            Some(GroupMetadata::vlan(vlan)),
            op,
        ) {
            let err = GroupOrchError::from(e);
            self.audit_failure(AuditCategory::GroupModify, "edit_broadcast_group", &group_id.to_string(), &err);
            return Err(err);
        }
        {
            let mut stats = self.stats.lock();
            if op.is_remove_path() {
                stats.buckets_removed += 1;
            } else {
                stats.buckets_added += 1;
            }
        }
        debug!(device = %self.device, vlan = %vlan, port = %port, op = %op, "Edited broadcast group");
        Ok(())
    }

    /// Removes the broadcast group for `vlan`. Returns false if there is none.
    pub fn remove_broadcast_group(&self, vlan: VlanId, port: PortNumber, pop_vlan: bool) -> bool {
        let key = VlanKey::new(self.device.clone(), vlan);
        let Some(group_id) = self.store.vlans().get(&key) else {
            debug!(device = %self.device, vlan = %vlan, "No broadcast group to remove");
            return false;
        };
        let buckets = BTreeSet::from([Self::flood_bucket(port, pop_vlan)]);
        self.remove_owned_group(
            GroupOwner::Vlan(vlan),
            group_id,
            GroupType::Broadcast,
            buckets,
            Some(GroupMetadata::vlan(vlan)),
        )
    }

    /// Returns the single-port group for the exact treatment, optionally
    /// creating it.
    pub fn port_group_id(
        &self,
        port: PortNumber,
        treatment: &Treatment,
        metadata: Option<GroupMetadata>,
        create_if_missing: bool,
    ) -> Option<GroupId> {
        let key = self.port_key(port, treatment, metadata);
        if let Some(group_id) = self.store.ports().get(&key) {
            return Some(group_id);
        }
        if !create_if_missing {
            return None;
        }
        match self.create_simple_port_group(port, treatment, metadata) {
            Ok(group_id) => Some(group_id),
            Err(e) => {
                warn!(device = %self.device, port = %port, error = %e, "Port group not created");
                None
            }
        }
    }

    fn port_key(&self, port: PortNumber, treatment: &Treatment, metadata: Option<GroupMetadata>) -> PortKey {
        PortKey::new(
            self.device.clone(),
            port,
            treatment.clone().with_output(port),
            metadata,
        )
    }

    /// Creates a one-bucket group sending to `port` with `treatment`.
    pub fn create_simple_port_group(
        &self,
        port: PortNumber,
        treatment: &Treatment,
        metadata: Option<GroupMetadata>,
    ) -> Result<GroupId, GroupOrchError> {
        let key = self.port_key(port, treatment, metadata);
        if let Some(group_id) = self.store.ports().get(&key) {
            return Ok(group_id);
        }

        let group_id = self.programmer.allocate_group_id(&self.device);
        if let Err(e) = self.submit(
            GroupOwner::Port(key.clone()),
            group_id,
            GroupType::Simple,
            BTreeSet::from([key.treatment.clone()]),
            metadata,
            GroupOp::Add,
        ) {
            let err = GroupOrchError::from(e);
            self.audit_failure(AuditCategory::GroupCreate, "create_port_group", &port.to_string(), &err);
            return Err(err);
        }

        self.store.ports().put(key, group_id);
        {
            let mut stats = self.stats.lock();
            stats.groups_created += 1;
            stats.buckets_added += 1;
        }
        info!(device = %self.device, port = %port, group_id = %group_id, "Created port group");
        audit_log!(
            AuditRecord::new(AuditCategory::GroupCreate, "GroupOrch", "create_port_group")
                .with_outcome(AuditOutcome::InProgress)
                .with_object_id(format!("{}/{}", self.device, group_id))
                .with_object_type(GroupType::Simple.as_str())
                .with_details(serde_json::json!({ "port": port.as_u32() }))
        );
        Ok(group_id)
    }

    /// Removes the port group for the exact treatment. Returns false if
    /// there is none.
    pub fn remove_simple_port_group(
        &self,
        port: PortNumber,
        treatment: &Treatment,
        metadata: Option<GroupMetadata>,
    ) -> bool {
        let key = self.port_key(port, treatment, metadata);
        let Some(group_id) = self.store.ports().get(&key) else {
            return false;
        };
        let buckets = BTreeSet::from([key.treatment.clone()]);
        self.remove_owned_group(GroupOwner::Port(key), group_id, GroupType::Simple, buckets, metadata)
    }

    /// Removes a group of this device by id, whichever store owns it.
    /// Returns false if no store references `group_id`.
    pub fn remove_group(&self, group_id: GroupId) -> bool {
        let destination = self
            .store
            .destinations_of(&self.device)
            .into_iter()
            .find(|(_, record)| record.group_id == group_id);
        if let Some((key, record)) = destination {
            let buckets = self.buckets_for_record(&key.ds, &record);
            return self.remove_owned_group(
                GroupOwner::Destination(key.ds),
                group_id,
                record.group_type,
                buckets,
                Some(self.hashed_metadata()),
            );
        }

        let vlan = self
            .store
            .vlans()
            .entries()
            .into_iter()
            .find(|(key, id)| key.device == self.device && *id == group_id);
        if let Some((key, _)) = vlan {
            return self.remove_owned_group(
                GroupOwner::Vlan(key.vlan),
                group_id,
                GroupType::Broadcast,
                BTreeSet::new(),
                Some(GroupMetadata::vlan(key.vlan)),
            );
        }

        let port = self
            .store
            .ports()
            .entries()
            .into_iter()
            .find(|(key, id)| key.device == self.device && *id == group_id);
        if let Some((key, _)) = port {
            let buckets = BTreeSet::from([key.treatment.clone()]);
            let metadata = key.metadata;
            return self.remove_owned_group(GroupOwner::Port(key), group_id, GroupType::Simple, buckets, metadata);
        }

        debug!(device = %self.device, group_id = %group_id, "No store references group");
        false
    }

    fn remove_owned_group(
        &self,
        owner: GroupOwner,
        group_id: GroupId,
        group_type: GroupType,
        buckets: BTreeSet<Treatment>,
        metadata: Option<GroupMetadata>,
    ) -> bool {
        if let Err(e) = self.submit(owner.clone(), group_id, group_type, buckets, metadata, GroupOp::Remove) {
            let err = GroupOrchError::from(e);
            self.audit_failure(AuditCategory::GroupDelete, "remove_group", &group_id.to_string(), &err);
            return false;
        }

        self.forget_owner(&owner);
        self.stats.lock().groups_removed += 1;

        info!(device = %self.device, group_id = %group_id, group_type = %group_type, "Removed group");
        audit_log!(
            AuditRecord::new(AuditCategory::GroupDelete, "GroupOrch", "remove_group")
                .with_outcome(AuditOutcome::InProgress)
                .with_object_id(format!("{}/{}", self.device, group_id))
                .with_object_type(group_type.as_str())
        );
        true
    }
}
