//! Per-device neighbor/port adjacency.
//!
//! Tracks which local ports connect to which neighbor switch, in both
//! directions, so that group buckets can fan out over every parallel link
//! to a next hop.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sr_types::{DeviceId, PortNumber};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use tracing::{debug, warn};

/// Kind of a topology link. Only direct links carry group buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    Direct,
    Indirect,
    Virtual,
}

/// A port on a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectPoint {
    pub device: DeviceId,
    pub port: PortNumber,
}

impl ConnectPoint {
    pub fn new(device: DeviceId, port: PortNumber) -> Self {
        Self { device, port }
    }
}

impl fmt::Display for ConnectPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.port)
    }
}

/// A unidirectional link between two connect points.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Link {
    pub src: ConnectPoint,
    pub dst: ConnectPoint,
    pub link_type: LinkType,
}

impl Link {
    pub fn new(src: ConnectPoint, dst: ConnectPoint, link_type: LinkType) -> Self {
        Self { src, dst, link_type }
    }

    pub fn direct(src: ConnectPoint, dst: ConnectPoint) -> Self {
        Self::new(src, dst, LinkType::Direct)
    }

    pub fn is_direct(&self) -> bool {
        self.link_type == LinkType::Direct
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

#[derive(Debug, Default)]
struct AdjacencyMaps {
    neighbor_to_ports: HashMap<DeviceId, BTreeSet<PortNumber>>,
    port_to_neighbor: HashMap<PortNumber, DeviceId>,
}

impl AdjacencyMaps {
    fn detach_port(&mut self, port: PortNumber) -> Option<DeviceId> {
        let neighbor = self.port_to_neighbor.remove(&port)?;
        if let Some(ports) = self.neighbor_to_ports.get_mut(&neighbor) {
            ports.remove(&port);
            if ports.is_empty() {
                self.neighbor_to_ports.remove(&neighbor);
            }
        }
        Some(neighbor)
    }
}

/// Bidirectional neighbor <-> local port map for one device.
#[derive(Debug)]
pub struct AdjacencyTracker {
    device: DeviceId,
    maps: RwLock<AdjacencyMaps>,
}

impl AdjacencyTracker {
    pub fn new(device: DeviceId) -> Self {
        Self {
            device,
            maps: RwLock::new(AdjacencyMaps::default()),
        }
    }

    /// Builds the tracker from every direct link leaving `device`.
    pub fn from_links<'a>(device: DeviceId, links: impl IntoIterator<Item = &'a Link>) -> Self {
        let tracker = Self::new(device);
        for link in links {
            if link.is_direct() && link.src.device == tracker.device {
                tracker.add_neighbor_at_port(link.dst.device.clone(), link.src.port);
            }
        }
        tracker
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Records that `port` leads to `neighbor`.
    ///
    /// If the port previously led to a different neighbor the old mapping is
    /// replaced and that neighbor is returned.
    pub fn add_neighbor_at_port(&self, neighbor: DeviceId, port: PortNumber) -> Option<DeviceId> {
        let mut maps = self.maps.write();

        let current = maps.port_to_neighbor.get(&port).cloned();
        let previous = match current {
            Some(existing) if existing != neighbor => maps.detach_port(port),
            _ => None,
        };
        if let Some(ref old) = previous {
            warn!(
                device = %self.device,
                port = %port,
                old_neighbor = %old,
                new_neighbor = %neighbor,
                "Port changed neighbor"
            );
        }

        maps.neighbor_to_ports
            .entry(neighbor.clone())
            .or_default()
            .insert(port);
        maps.port_to_neighbor.insert(port, neighbor);
        previous
    }

    /// Forgets `port`. Returns the neighbor it led to, if known.
    pub fn remove_neighbor_at_port(&self, port: PortNumber) -> Option<DeviceId> {
        let removed = self.maps.write().detach_port(port);
        if removed.is_none() {
            debug!(device = %self.device, port = %port, "Port has no known neighbor");
        }
        removed
    }

    /// Forgets every port leading to `neighbor` and returns them.
    pub fn remove_neighbor(&self, neighbor: &DeviceId) -> BTreeSet<PortNumber> {
        let mut maps = self.maps.write();
        let ports = maps.neighbor_to_ports.remove(neighbor).unwrap_or_default();
        for port in &ports {
            maps.port_to_neighbor.remove(port);
        }
        ports
    }

    /// Snapshot of the ports currently leading to `neighbor`.
    pub fn ports_to(&self, neighbor: &DeviceId) -> BTreeSet<PortNumber> {
        self.maps
            .read()
            .neighbor_to_ports
            .get(neighbor)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_ports_to(&self, neighbor: &DeviceId) -> bool {
        self.maps.read().neighbor_to_ports.contains_key(neighbor)
    }

    pub fn neighbor_at(&self, port: PortNumber) -> Option<DeviceId> {
        self.maps.read().port_to_neighbor.get(&port).cloned()
    }

    pub fn neighbors(&self) -> BTreeSet<DeviceId> {
        self.maps.read().neighbor_to_ports.keys().cloned().collect()
    }
}
