//! Segment-routing group orchestrator.
//!
//! Creates, edits and verifies the data-plane forwarding groups that
//! realise segment-routing next hops on each locally mastered switch:
//!
//! - hashed (ECMP) groups towards a [`DestinationSet`], with MPLS
//!   push or swap actions
//! - broadcast groups flooding a VLAN to its edge ports
//! - single-port groups keyed by their exact output treatment
//!
//! Intent lives in three replicated stores ([`GroupStore`]). Topology events
//! keep the [`AdjacencyTracker`] current and patch affected groups bucket by
//! bucket, and a periodic verification pass rewrites device buckets to match
//! the recorded intent.

pub mod adjacency;
pub mod audit;
pub mod config_file;
pub mod daemon;
pub mod destination;
pub mod group;

pub use adjacency::{AdjacencyTracker, ConnectPoint, Link, LinkType};
pub use destination::{DestinationSet, DestinationSetType, NextHopMap, NextNeighbors};
pub use group::{
    DestinationSetKey, DeviceConfig, GroupId, GroupMetadata, GroupOp, GroupOrch, GroupOrchConfig,
    GroupOrchContext, GroupOrchError, GroupOrchStats, GroupOrchTask, GroupOutcome,
    GroupProgrammer, GroupRequest, GroupStore, GroupType, MplsAction, OutcomeReceiver,
    OutcomeSender, PortKey, ProgrammingError, RoutingLock, RoutingState, SkipReason, Treatment,
    VerificationOutcome, VerificationState, VlanKey,
};
