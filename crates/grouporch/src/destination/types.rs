//! Destination set key and next-hop record.

use crate::group::{GroupId, GroupType};
use serde::{Deserialize, Serialize};
use sr_types::{DeviceId, MplsLabel};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Label handling for traffic routed through a destination set's group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DestinationSetType {
    /// Plain IP forwarding, no label.
    PushNone,
    /// Push the destination's node label as bottom of stack.
    PushBos,
    /// Pop the bottom-of-stack label.
    PopBos,
    /// Swap the bottom-of-stack label.
    SwapBos,
    /// Pop a label that is not bottom of stack.
    PopNotBos,
    /// Swap a label that is not bottom of stack.
    SwapNotBos,
}

impl DestinationSetType {
    pub fn is_not_bos(&self) -> bool {
        matches!(self, Self::PopNotBos | Self::SwapNotBos)
    }

    pub fn is_swap(&self) -> bool {
        matches!(self, Self::SwapBos | Self::SwapNotBos)
    }

    pub fn is_pop(&self) -> bool {
        matches!(self, Self::PopBos | Self::PopNotBos)
    }

    /// Whether buckets for this type carry an edge label.
    pub fn carries_label(&self) -> bool {
        matches!(self, Self::PushBos | Self::SwapBos | Self::SwapNotBos)
    }
}

impl fmt::Display for DestinationSetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PushNone => "PUSH_NONE",
            Self::PushBos => "PUSH_BOS",
            Self::PopBos => "POP_BOS",
            Self::SwapBos => "SWAP_BOS",
            Self::PopNotBos => "POP_NOT_BOS",
            Self::SwapNotBos => "SWAP_NOT_BOS",
        };
        f.write_str(s)
    }
}

/// One member of a destination set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Destination {
    pub device: DeviceId,
    pub label: Option<MplsLabel>,
}

/// Immutable key identifying a hashed group's forwarding target.
///
/// Paired sets are stored ordered by device id, so `paired(t, a, la, b, lb)`
/// and `paired(t, b, lb, a, la)` are equal.
///
/// ```
/// use sr_grouporch::{DestinationSet, DestinationSetType};
/// use sr_types::{DeviceId, MplsLabel};
///
/// let a = DeviceId::new("leaf1").unwrap();
/// let b = DeviceId::new("leaf2").unwrap();
/// let la = MplsLabel::new(101).ok();
/// let lb = MplsLabel::new(102).ok();
///
/// let ab = DestinationSet::paired(DestinationSetType::PushBos, a.clone(), la, b.clone(), lb);
/// let ba = DestinationSet::paired(DestinationSetType::PushBos, b, lb, a, la);
/// assert_eq!(ab, ba);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DestinationSet {
    ds_type: DestinationSetType,
    primary: Destination,
    secondary: Option<Destination>,
}

impl DestinationSet {
    pub fn single(ds_type: DestinationSetType, device: DeviceId, label: Option<MplsLabel>) -> Self {
        Self {
            ds_type,
            primary: Self::member(ds_type, device, label),
            secondary: None,
        }
    }

    pub fn paired(
        ds_type: DestinationSetType,
        a: DeviceId,
        label_a: Option<MplsLabel>,
        b: DeviceId,
        label_b: Option<MplsLabel>,
    ) -> Self {
        if a == b {
            return Self::single(ds_type, a, label_a);
        }
        let first = Self::member(ds_type, a, label_a);
        let second = Self::member(ds_type, b, label_b);
        let (primary, secondary) = if first.device < second.device {
            (first, second)
        } else {
            (second, first)
        };
        Self {
            ds_type,
            primary,
            secondary: Some(secondary),
        }
    }

    fn member(ds_type: DestinationSetType, device: DeviceId, label: Option<MplsLabel>) -> Destination {
        Destination {
            device,
            label: label.filter(|_| ds_type.carries_label()),
        }
    }

    pub fn ds_type(&self) -> DestinationSetType {
        self.ds_type
    }

    pub fn primary(&self) -> &Destination {
        &self.primary
    }

    pub fn secondary(&self) -> Option<&Destination> {
        self.secondary.as_ref()
    }

    pub fn is_paired(&self) -> bool {
        self.secondary.is_some()
    }

    pub fn is_not_bos(&self) -> bool {
        self.ds_type.is_not_bos()
    }

    pub fn is_swap(&self) -> bool {
        self.ds_type.is_swap()
    }

    /// Member devices, primary first.
    pub fn destinations(&self) -> impl Iterator<Item = &DeviceId> {
        std::iter::once(&self.primary)
            .chain(self.secondary.iter())
            .map(|d| &d.device)
    }

    pub fn contains(&self, device: &DeviceId) -> bool {
        self.destinations().any(|d| d == device)
    }

    /// Label associated with member `device`. `None` for non-members and
    /// for types without labels.
    pub fn edge_label(&self, device: &DeviceId) -> Option<MplsLabel> {
        std::iter::once(&self.primary)
            .chain(self.secondary.iter())
            .find(|d| &d.device == device)
            .and_then(|d| d.label)
    }
}

impl fmt::Display for DestinationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.ds_type)?;
        for (i, d) in std::iter::once(&self.primary)
            .chain(self.secondary.iter())
            .enumerate()
        {
            if i > 0 {
                write!(f, ", ")?;
            }
            match d.label {
                Some(label) => write!(f, "{}({})", d.device, label)?,
                None => write!(f, "{}", d.device)?,
            }
        }
        write!(f, "]")
    }
}

/// Destination device -> neighbors used as next hops towards it.
pub type NextHopMap = BTreeMap<DeviceId, BTreeSet<DeviceId>>;

/// Next hops and group realising one destination set on one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextNeighbors {
    pub dst_next_hops: NextHopMap,
    pub group_id: GroupId,
    pub group_type: GroupType,
}

impl NextNeighbors {
    pub fn new(dst_next_hops: NextHopMap, group_id: GroupId, group_type: GroupType) -> Self {
        Self {
            dst_next_hops,
            group_id,
            group_type,
        }
    }

    pub fn next_hops(&self, destination: &DeviceId) -> BTreeSet<DeviceId> {
        self.dst_next_hops
            .get(destination)
            .cloned()
            .unwrap_or_default()
    }

    pub fn contains_next_hop(&self, neighbor: &DeviceId) -> bool {
        self.dst_next_hops.values().any(|hops| hops.contains(neighbor))
    }

    /// Destinations reached through `neighbor`.
    pub fn destinations_for_next_hop(&self, neighbor: &DeviceId) -> BTreeSet<DeviceId> {
        self.dst_next_hops
            .iter()
            .filter(|(_, hops)| hops.contains(neighbor))
            .map(|(dst, _)| dst.clone())
            .collect()
    }

    pub fn set_next_hops(&mut self, destination: DeviceId, next_hops: BTreeSet<DeviceId>) {
        self.dst_next_hops.insert(destination, next_hops);
    }

    /// Drops `neighbor` from every destination. Returns true if it was present.
    pub fn remove_next_hop(&mut self, neighbor: &DeviceId) -> bool {
        let mut removed = false;
        for hops in self.dst_next_hops.values_mut() {
            removed |= hops.remove(neighbor);
        }
        removed
    }

    pub fn is_simple(&self) -> bool {
        self.group_type == GroupType::Simple
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn dev(id: &str) -> DeviceId {
        DeviceId::new(id).unwrap()
    }

    fn label(l: u32) -> Option<MplsLabel> {
        MplsLabel::new(l).ok()
    }

    fn hash_of(ds: &DestinationSet) -> u64 {
        let mut hasher = DefaultHasher::new();
        ds.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_paired_is_symmetric() {
        let ab = DestinationSet::paired(
            DestinationSetType::SwapNotBos,
            dev("leaf2"),
            label(202),
            dev("leaf1"),
            label(201),
        );
        let ba = DestinationSet::paired(
            DestinationSetType::SwapNotBos,
            dev("leaf1"),
            label(201),
            dev("leaf2"),
            label(202),
        );

        assert_eq!(ab, ba);
        assert_eq!(hash_of(&ab), hash_of(&ba));
        assert_eq!(ab.primary().device, dev("leaf1"));
        assert_eq!(ab.edge_label(&dev("leaf2")), label(202));
    }

    #[test]
    fn test_labels_dropped_for_unlabelled_types() {
        let ds = DestinationSet::single(DestinationSetType::PopBos, dev("leaf5"), label(100));
        assert_eq!(ds.edge_label(&dev("leaf5")), None);
        assert_eq!(
            ds,
            DestinationSet::single(DestinationSetType::PopBos, dev("leaf5"), None)
        );
    }

    #[test]
    fn test_pair_of_same_device_collapses() {
        let ds = DestinationSet::paired(
            DestinationSetType::PushBos,
            dev("leaf5"),
            label(100),
            dev("leaf5"),
            label(100),
        );
        assert!(!ds.is_paired());
        assert_eq!(ds.destinations().count(), 1);
    }

    #[test]
    fn test_type_predicates() {
        assert!(DestinationSetType::SwapNotBos.is_not_bos());
        assert!(DestinationSetType::SwapNotBos.is_swap());
        assert!(DestinationSetType::PopNotBos.is_pop());
        assert!(!DestinationSetType::PushBos.is_swap());
        assert!(!DestinationSetType::PopBos.carries_label());
    }

    #[test]
    fn test_display() {
        let ds = DestinationSet::paired(
            DestinationSetType::PushBos,
            dev("leaf1"),
            label(101),
            dev("leaf2"),
            label(102),
        );
        assert_eq!(ds.to_string(), "PUSH_BOS[leaf1(101), leaf2(102)]");
    }

    #[test]
    fn test_next_neighbors_queries() {
        let mut record = NextNeighbors::new(
            NextHopMap::from([
                (dev("leaf1"), BTreeSet::from([dev("spine1"), dev("spine2")])),
                (dev("leaf2"), BTreeSet::from([dev("spine2")])),
            ]),
            GroupId::new(7),
            GroupType::Hashed,
        );

        assert!(record.contains_next_hop(&dev("spine1")));
        assert_eq!(
            record.destinations_for_next_hop(&dev("spine2")),
            BTreeSet::from([dev("leaf1"), dev("leaf2")])
        );

        assert!(record.remove_next_hop(&dev("spine2")));
        assert!(!record.remove_next_hop(&dev("spine2")));
        assert_eq!(record.next_hops(&dev("leaf2")), BTreeSet::new());
        assert_eq!(record.next_hops(&dev("leaf1")), BTreeSet::from([dev("spine1")]));
    }
}
