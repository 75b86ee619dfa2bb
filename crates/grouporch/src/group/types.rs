//! Group, bucket and device-programming request types.

use serde::{Deserialize, Serialize};
use sr_types::{DeviceId, MacAddress, MplsLabel, PortNumber, VlanId};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Data-plane group identifier, allocated per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(u32);

impl GroupId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupType {
    /// Traffic is hashed across every bucket.
    Hashed,
    /// One active path; buckets are not edited on link flaps.
    Simple,
    /// Every bucket receives a copy.
    Broadcast,
}

impl GroupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupType::Hashed => "hashed_group",
            GroupType::Simple => "simple_group",
            GroupType::Broadcast => "broadcast_group",
        }
    }
}

impl fmt::Display for GroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupOp {
    /// Create the group with the given buckets.
    Add,
    /// Add buckets to an existing group.
    AddToExisting,
    /// Remove buckets from an existing group.
    RemoveFromExisting,
    /// Remove the whole group.
    Remove,
    /// Make the group's buckets equal exactly the given set.
    Verify,
}

impl GroupOp {
    /// True for edits whose purpose is to take state away from the device.
    pub fn is_remove_path(&self) -> bool {
        matches!(self, GroupOp::RemoveFromExisting | GroupOp::Remove)
    }
}

impl fmt::Display for GroupOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GroupOp::Add => "add",
            GroupOp::AddToExisting => "add_to_existing",
            GroupOp::RemoveFromExisting => "remove_from_existing",
            GroupOp::Remove => "remove",
            GroupOp::Verify => "verify",
        };
        f.write_str(s)
    }
}

/// MPLS label operation carried by a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MplsAction {
    /// Push a new label, optionally copying the IP TTL outwards.
    Push { label: MplsLabel, copy_ttl_out: bool },
    /// Rewrite the top label.
    Swap(MplsLabel),
}

/// Action list of one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Treatment {
    pub output: PortNumber,
    pub eth_dst: Option<MacAddress>,
    pub eth_src: Option<MacAddress>,
    pub mpls: Option<MplsAction>,
    pub set_vlan: Option<VlanId>,
    pub pop_vlan: bool,
}

impl Treatment {
    /// A bucket that only outputs on `port`.
    pub fn output(port: PortNumber) -> Self {
        Self {
            output: port,
            eth_dst: None,
            eth_src: None,
            mpls: None,
            set_vlan: None,
            pop_vlan: false,
        }
    }

    pub fn with_output(mut self, port: PortNumber) -> Self {
        self.output = port;
        self
    }

    pub fn with_eth_dst(mut self, mac: MacAddress) -> Self {
        self.eth_dst = Some(mac);
        self
    }

    pub fn with_eth_src(mut self, mac: MacAddress) -> Self {
        self.eth_src = Some(mac);
        self
    }

    pub fn with_mpls(mut self, action: MplsAction) -> Self {
        self.mpls = Some(action);
        self
    }

    pub fn with_vlan(mut self, vlan: VlanId) -> Self {
        self.set_vlan = Some(vlan);
        self
    }

    pub fn with_pop_vlan(mut self) -> Self {
        self.pop_vlan = true;
        self
    }
}

impl fmt::Display for Treatment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "output:{}", self.output)?;
        if let Some(mac) = self.eth_dst {
            write!(f, " eth_dst:{}", mac)?;
        }
        match self.mpls {
            Some(MplsAction::Push { label, .. }) => write!(f, " push:{}", label)?,
            Some(MplsAction::Swap(label)) => write!(f, " swap:{}", label)?,
            None => {}
        }
        if let Some(vlan) = self.set_vlan {
            write!(f, " vlan:{}", vlan)?;
        }
        if self.pop_vlan {
            write!(f, " pop_vlan")?;
        }
        Ok(())
    }
}

/// Match conditions the device may use to pick a group implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub match_vlan: Option<VlanId>,
}

impl GroupMetadata {
    pub fn vlan(vlan: VlanId) -> Self {
        Self {
            match_vlan: Some(vlan),
        }
    }
}

/// One group edit handed to the device-programming layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRequest {
    pub request_id: u64,
    pub device: DeviceId,
    pub group_id: GroupId,
    pub group_type: GroupType,
    pub buckets: BTreeSet<Treatment>,
    pub metadata: Option<GroupMetadata>,
    pub op: GroupOp,
}

/// Failures reported by the device-programming layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgrammingError {
    #[error("Group missing on device")]
    GroupMissing,
    #[error("Group already exists on device")]
    GroupAlreadyExists,
    #[error("Group installation failed: {0}")]
    GroupInstallationFailed(String),
    #[error("Flow installation failed: {0}")]
    FlowInstallationFailed(String),
    #[error("Unsupported by device: {0}")]
    Unsupported(String),
    #[error("Device disconnected: {0}")]
    Disconnected(String),
}

/// Asynchronous completion of a [`GroupRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupOutcome {
    pub request_id: u64,
    pub result: Result<(), ProgrammingError>,
}

impl GroupOutcome {
    pub fn success(request_id: u64) -> Self {
        Self {
            request_id,
            result: Ok(()),
        }
    }

    pub fn failure(request_id: u64, error: ProgrammingError) -> Self {
        Self {
            request_id,
            result: Err(error),
        }
    }
}

pub type OutcomeSender = mpsc::UnboundedSender<GroupOutcome>;
pub type OutcomeReceiver = mpsc::UnboundedReceiver<GroupOutcome>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_bucket_set_deduplicates() {
        let mac = MacAddress::new([0, 0, 0, 0, 0, 2]);
        let label = MplsLabel::new(100).unwrap();
        let bucket = Treatment::output(PortNumber::new(1))
            .with_eth_dst(mac)
            .with_mpls(MplsAction::Push {
                label,
                copy_ttl_out: true,
            });

        let buckets: BTreeSet<Treatment> = [bucket.clone(), bucket.clone()].into_iter().collect();
        assert_eq!(buckets.len(), 1);
        assert_eq!(
            bucket.to_string(),
            "output:1 eth_dst:00:00:00:00:00:02 push:100"
        );
    }

    #[test]
    fn test_remove_path_ops() {
        assert!(GroupOp::Remove.is_remove_path());
        assert!(GroupOp::RemoveFromExisting.is_remove_path());
        assert!(!GroupOp::AddToExisting.is_remove_path());
        assert!(!GroupOp::Verify.is_remove_path());
    }

    #[test]
    fn test_group_id_display() {
        assert_eq!(GroupId::new(0x2000_0001).to_string(), "0x20000001");
    }
}
