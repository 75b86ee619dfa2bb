//! Periodic bucket verification.
//!
//! A pass walks this device's hash-editable destination-set groups,
//! rebuilds the bucket set each should hold from the stored record and the
//! current adjacency, and submits a `Verify` edit that makes the device
//! group equal that set. Passes are gated on mastership and routing
//! stability, and skip instead of waiting when route computation holds the
//! routing lock.

use super::orch::{GroupOrch, GroupOwner};
use super::types::{GroupId, GroupOp};
use crate::{audit_log, audit::{AuditCategory, AuditOutcome, AuditRecord}};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationState {
    Idle,
    Scanning,
    BuildingExpectedBuckets,
    SubmittingVerify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotMaster,
    RoutingUnstable,
    LockContended,
}

impl SkipReason {
    fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NotMaster => "not_master",
            SkipReason::RoutingUnstable => "routing_unstable",
            SkipReason::LockContended => "lock_contended",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationOutcome {
    Skipped(SkipReason),
    Completed { groups_verified: usize },
}

impl GroupOrch {
    pub fn verification_state(&self) -> VerificationState {
        *self.verification_state.lock()
    }

    /// Runs one verification pass over every eligible group.
    pub fn trigger_verification(&self) -> VerificationOutcome {
        self.run_verification(None)
    }

    /// Runs a verification pass restricted to `group_id`.
    pub fn verify_group(&self, group_id: GroupId) -> VerificationOutcome {
        self.run_verification(Some(group_id))
    }

    fn run_verification(&self, only: Option<GroupId>) -> VerificationOutcome {
        if !self.routing.is_local_master(&self.device) {
            return self.skip_verification(SkipReason::NotMaster);
        }
        if !self.routing.is_routing_stable() {
            return self.skip_verification(SkipReason::RoutingUnstable);
        }
        let Some(_guard) = self.routing_lock.try_lock() else {
            return self.skip_verification(SkipReason::LockContended);
        };

        *self.verification_state.lock() = VerificationState::Scanning;
        let mut verified = 0;
        for (key, record) in self.store.destinations_of(&self.device) {
            if only.is_some_and(|id| id != record.group_id) {
                continue;
            }
            if !self.is_hash_editable(&key.ds, &record) {
                continue;
            }

            *self.verification_state.lock() = VerificationState::BuildingExpectedBuckets;
            let buckets = self.buckets_for_record(&key.ds, &record);
            let count = buckets.len();

            *self.verification_state.lock() = VerificationState::SubmittingVerify;
            match self.submit(
                GroupOwner::Destination(key.ds.clone()),
                record.group_id,
                record.group_type,
                buckets,
                Some(self.hashed_metadata()),
                GroupOp::Verify,
            ) {
                Ok(_) => {
                    verified += 1;
                    self.stats.lock().verify_requests += 1;
                    debug!(
                        device = %self.device,
                        ds = %key.ds,
                        group_id = %record.group_id,
                        buckets = count,
                        "Submitted verify"
                    );
                }
                Err(e) => warn!(
                    device = %self.device,
                    group_id = %record.group_id,
                    error = %e,
                    "Verify request rejected"
                ),
            }
            *self.verification_state.lock() = VerificationState::Scanning;
        }
        *self.verification_state.lock() = VerificationState::Idle;
        self.stats.lock().verification_passes += 1;

        info!(device = %self.device, groups_verified = verified, "Verification pass finished");
        audit_log!(
            AuditRecord::new(AuditCategory::Verification, "GroupOrch", "verify_groups")
                .with_outcome(AuditOutcome::Success)
                .with_object_id(self.device.to_string())
                .with_object_type("device")
                .with_details(serde_json::json!({
                    "groups_verified": verified,
                    "group_id": only.map(|id| id.as_u32()),
                }))
        );
        VerificationOutcome::Completed {
            groups_verified: verified,
        }
    }

    fn skip_verification(&self, reason: SkipReason) -> VerificationOutcome {
        self.stats.lock().verification_skipped += 1;
        debug!(device = %self.device, reason = reason.as_str(), "Skipping verification");
        audit_log!(
            AuditRecord::new(AuditCategory::Verification, "GroupOrch", "verify_groups")
                .with_outcome(AuditOutcome::Skipped)
                .with_object_id(self.device.to_string())
                .with_object_type("device")
                .with_details(serde_json::json!({ "reason": reason.as_str() }))
        );
        VerificationOutcome::Skipped(reason)
    }

    /// Runs verification every `verify_interval` after
    /// `verify_initial_delay` until `shutdown` turns true or its sender is
    /// dropped.
    pub fn spawn_verifier(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config.verify_interval.max(Duration::from_millis(1));
            let start = Instant::now() + self.config.verify_initial_delay;
            let mut ticker = time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.trigger_verification();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(device = %self.device, "Verifier stopped");
        })
    }
}
