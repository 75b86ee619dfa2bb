//! Asynchronous outcome handling.
//!
//! Every submitted [`GroupRequest`](super::GroupRequest) stays pending until
//! the programmer reports its outcome. A group found missing on an add path
//! is re-created with the buckets it should hold; on a remove path the
//! missing group already is the desired state. A group the device reports
//! as already present is checked against the store, and an edit the device
//! cannot realise drops the intent behind it.

use super::orch::{GroupOrch, GroupOwner, PendingEdit};
use super::store::VlanKey;
use super::types::{GroupMetadata, GroupOp, GroupOutcome, OutcomeReceiver, ProgrammingError, Treatment};
use crate::{audit_log, audit::{AuditCategory, AuditOutcome, AuditRecord}};
use async_trait::async_trait;
use sr_orch_common::Orch;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, error, info, warn};

impl GroupOrch {
    /// Applies the outcome of a previously submitted request. Outcomes for
    /// unknown request ids are ignored.
    pub fn process_outcome(&self, outcome: GroupOutcome) {
        let Some(edit) = self.pending.lock().remove(&outcome.request_id) else {
            debug!(device = %self.device, request_id = outcome.request_id, "Outcome for unknown request");
            return;
        };
        let request = &edit.request;

        match outcome.result {
            Ok(()) => self.outcome_succeeded(&edit),
            Err(ProgrammingError::GroupMissing) if request.op.is_remove_path() => {
                debug!(device = %self.device, group_id = %request.group_id, "Group already gone");
                self.outcome_succeeded(&edit);
            }
            Err(ProgrammingError::GroupMissing) => self.recreate_group(&edit),
            Err(ProgrammingError::GroupAlreadyExists) => self.group_already_exists(&edit),
            Err(ProgrammingError::Unsupported(reason)) => self.drop_unsupported(&edit, &reason),
            Err(e) => {
                self.stats.lock().outcomes_failed += 1;
                error!(
                    device = %self.device,
                    group_id = %request.group_id,
                    op = %request.op,
                    error = %e,
                    "Group request failed"
                );
                audit_log!(
                    AuditRecord::new(AuditCategory::ErrorCondition, "GroupOrch", "group_request_failed")
                        .with_object_id(format!("{}/{}", self.device, request.group_id))
                        .with_object_type(request.group_type.as_str())
                        .with_error(e.to_string())
                        .with_details(serde_json::json!({ "op": request.op.to_string() }))
                );
            }
        }
    }

    fn outcome_succeeded(&self, edit: &PendingEdit) {
        self.stats.lock().outcomes_succeeded += 1;
        debug!(
            device = %self.device,
            request_id = edit.request.request_id,
            group_id = %edit.request.group_id,
            op = %edit.request.op,
            "Group request completed"
        );
    }

    /// The device already holds the group. Fine if the store still names
    /// it; otherwise the group is an orphan and is removed.
    fn group_already_exists(&self, edit: &PendingEdit) {
        let request = &edit.request;
        self.outcome_succeeded(edit);
        let stored = self.stored_group_id(&edit.owner);
        if stored == Some(request.group_id) {
            debug!(device = %self.device, group_id = %request.group_id, "Group already present");
            return;
        }

        warn!(
            device = %self.device,
            group_id = %request.group_id,
            stored = ?stored.map(|id| id.to_string()),
            "Group present on device but not in store, removing"
        );
        match self.submit(
            edit.owner.clone(),
            request.group_id,
            request.group_type,
            BTreeSet::new(),
            request.metadata,
            GroupOp::Remove,
        ) {
            Ok(_) => {
                self.stats.lock().orphans_removed += 1;
                audit_log!(
                    AuditRecord::new(AuditCategory::GroupDelete, "GroupOrch", "remove_orphan_group")
                        .with_outcome(AuditOutcome::InProgress)
                        .with_object_id(format!("{}/{}", self.device, request.group_id))
                        .with_object_type(request.group_type.as_str())
                );
            }
            Err(e) => error!(device = %self.device, group_id = %request.group_id, error = %e, "Orphan removal rejected"),
        }
    }

    /// The device cannot realise the edit. It is not retried: the store
    /// entry is dropped so verification stops resubmitting it, and a group
    /// left half-programmed is removed.
    fn drop_unsupported(&self, edit: &PendingEdit, reason: &str) {
        let request = &edit.request;
        self.stats.lock().outcomes_failed += 1;
        error!(
            device = %self.device,
            group_id = %request.group_id,
            op = %request.op,
            reason = %reason,
            "Group request unsupported by device, dropping intent"
        );
        audit_log!(
            AuditRecord::new(AuditCategory::ErrorCondition, "GroupOrch", "group_unsupported")
                .with_object_id(format!("{}/{}", self.device, request.group_id))
                .with_object_type(request.group_type.as_str())
                .with_error(reason.to_string())
                .with_details(serde_json::json!({ "op": request.op.to_string() }))
        );

        if self.stored_group_id(&edit.owner) == Some(request.group_id) {
            self.forget_owner(&edit.owner);
            self.stats.lock().intents_dropped += 1;
        }
        if matches!(request.op, GroupOp::Add | GroupOp::Remove) {
            return;
        }
        if let Err(e) = self.submit(
            edit.owner.clone(),
            request.group_id,
            request.group_type,
            BTreeSet::new(),
            request.metadata,
            GroupOp::Remove,
        ) {
            error!(device = %self.device, group_id = %request.group_id, error = %e, "Removal rejected");
        }
    }

    /// Re-adds a group the device lost, under the same id, with the buckets
    /// its store entry calls for now.
    fn recreate_group(&self, edit: &PendingEdit) {
        let request = &edit.request;
        let Some((buckets, metadata)) = self.expected_for_owner(&edit.owner) else {
            info!(
                device = %self.device,
                group_id = %request.group_id,
                "Missing group no longer in store, not re-creating"
            );
            self.stats.lock().outcomes_succeeded += 1;
            return;
        };

        warn!(
            device = %self.device,
            group_id = %request.group_id,
            op = %request.op,
            buckets = buckets.len(),
            "Group missing on device, re-creating"
        );
        match self.submit(
            edit.owner.clone(),
            request.group_id,
            request.group_type,
            buckets,
            metadata,
            GroupOp::Add,
        ) {
            Ok(_) => {
                self.stats.lock().groups_recreated += 1;
                audit_log!(
                    AuditRecord::new(AuditCategory::GroupCreate, "GroupOrch", "recreate_group")
                        .with_outcome(AuditOutcome::InProgress)
                        .with_object_id(format!("{}/{}", self.device, request.group_id))
                        .with_object_type(request.group_type.as_str())
                );
            }
            Err(e) => {
                self.stats.lock().outcomes_failed += 1;
                error!(device = %self.device, group_id = %request.group_id, error = %e, "Re-create rejected");
            }
        }
    }

    fn expected_for_owner(
        &self,
        owner: &GroupOwner,
    ) -> Option<(BTreeSet<Treatment>, Option<GroupMetadata>)> {
        match owner {
            GroupOwner::Destination(ds) => {
                let record = self.store.destinations().get(&self.key(ds))?;
                Some((self.buckets_for_record(ds, &record), Some(self.hashed_metadata())))
            }
            GroupOwner::Vlan(vlan) => {
                if !self
                    .store
                    .vlans()
                    .contains_key(&VlanKey::new(self.device.clone(), *vlan))
                {
                    return None;
                }
                let ports = self
                    .device_config
                    .vlan_ports(&self.device)
                    .remove(vlan)
                    .unwrap_or_default();
                let buckets = ports
                    .into_iter()
                    .map(|port| {
                        let bucket = Treatment::output(port);
                        if self.device_config.is_vlan_tagged(&self.device, port, *vlan) {
                            bucket
                        } else {
                            bucket.with_pop_vlan()
                        }
                    })
                    .collect();
                Some((buckets, Some(GroupMetadata::vlan(*vlan))))
            }
            GroupOwner::Port(key) => {
                if !self.store.ports().contains_key(key) {
                    return None;
                }
                Some((BTreeSet::from([key.treatment.clone()]), key.metadata))
            }
        }
    }

    /// Applies every outcome already queued on `outcomes` without waiting.
    /// Returns how many were processed.
    pub fn drain_outcomes(&self, outcomes: &mut OutcomeReceiver) -> usize {
        let mut processed = 0;
        loop {
            match outcomes.try_recv() {
                Ok(outcome) => {
                    self.process_outcome(outcome);
                    processed += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        processed
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn pending_requests(&self) -> Vec<String> {
        let mut requests: Vec<_> = self
            .pending
            .lock()
            .values()
            .map(|edit| {
                format!(
                    "{}: {} {} {}",
                    edit.request.request_id, edit.request.op, edit.request.group_type, edit.request.group_id
                )
            })
            .collect();
        requests.sort();
        requests
    }
}

/// Daemon-side handle pumping one orchestrator's outcome channel.
pub struct GroupOrchTask {
    name: String,
    orch: Arc<GroupOrch>,
    outcomes: OutcomeReceiver,
}

impl GroupOrchTask {
    pub fn new(orch: Arc<GroupOrch>, outcomes: OutcomeReceiver) -> Self {
        Self {
            name: format!("GroupOrch:{}", orch.device()),
            orch,
            outcomes,
        }
    }

    pub fn orch(&self) -> &Arc<GroupOrch> {
        &self.orch
    }
}

#[async_trait]
impl Orch for GroupOrchTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn do_task(&mut self) {
        let processed = self.orch.drain_outcomes(&mut self.outcomes);
        if processed > 0 {
            debug!(orch = %self.name, processed, "Processed outcomes");
        }
    }

    fn has_pending_tasks(&self) -> bool {
        !self.outcomes.is_empty()
    }

    fn dump_pending_tasks(&self) -> Vec<String> {
        self.orch.pending_requests()
    }

    fn on_timer(&mut self) {
        let pending = self.orch.pending_count();
        if pending > 0 {
            debug!(orch = %self.name, pending, "Awaiting outcomes");
        }
    }
}
