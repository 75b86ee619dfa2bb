//! Configuration file support for grouporchd
//!
//! Loads and validates grouporchd configuration from TOML files.
//! Default location: /etc/sonic/grouporchd.toml
//!
//! Besides orchestrator tuning, the file carries the static topology
//! (devices, links, VLAN membership) used when the daemon runs against
//! simulated devices.

use crate::adjacency::{ConnectPoint, Link};
use crate::daemon::simulated::{StaticDeviceConfig, StaticRoutingState};
use crate::group::GroupOrchConfig;
use serde::{Deserialize, Serialize};
use sr_types::{DeviceId, MacAddress, PortNumber, VlanId};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },
    #[error("Failed to serialize config: {0}")]
    Serialize(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Orchestrator tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchSection {
    /// Seconds between verification passes
    #[serde(default = "default_verify_interval")]
    pub verify_interval_secs: u64,

    /// Seconds before the first verification pass
    #[serde(default = "default_verify_initial_delay")]
    pub verify_initial_delay_secs: u64,

    /// Devices hash over label-swapping buckets
    #[serde(default)]
    pub mpls_ecmp: bool,

    #[serde(default = "default_internal_vlan")]
    pub internal_vlan: VlanId,

    #[serde(default = "default_pseudowire_vlan")]
    pub pseudowire_vlan: VlanId,
}

/// Daemon loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSection {
    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Cluster member id stamped on store writes
    #[serde(default = "default_member_id")]
    pub member_id: u32,

    /// Age in logical ticks after which store tombstones are dropped
    #[serde(default = "default_tombstone_horizon")]
    pub tombstone_horizon: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: DeviceId,
    pub router_mac: MacAddress,
    /// Whether this instance masters the device
    #[serde(default)]
    pub master: bool,
}

/// A cable between two device ports. Produces one direct link each way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEntry {
    pub src: DeviceId,
    pub src_port: PortNumber,
    pub dst: DeviceId,
    pub dst_port: PortNumber,
}

/// VLAN membership of one edge port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanEntry {
    pub device: DeviceId,
    pub vlan: VlanId,
    pub port: PortNumber,
    #[serde(default)]
    pub tagged: bool,
}

/// Complete grouporchd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupOrchdConfig {
    #[serde(default)]
    pub orch: OrchSection,

    #[serde(default)]
    pub daemon: DaemonSection,

    #[serde(default)]
    pub devices: Vec<DeviceEntry>,

    #[serde(default)]
    pub links: Vec<LinkEntry>,

    #[serde(default)]
    pub vlans: Vec<VlanEntry>,
}

fn default_verify_interval() -> u64 {
    30
}

fn default_verify_initial_delay() -> u64 {
    10
}

fn default_internal_vlan() -> VlanId {
    VlanId::SR_INTERNAL
}

fn default_pseudowire_vlan() -> VlanId {
    VlanId::SR_PSEUDOWIRE
}

fn default_heartbeat_interval() -> u64 {
    1000
}

fn default_member_id() -> u32 {
    1
}

fn default_tombstone_horizon() -> u64 {
    100_000
}

impl Default for OrchSection {
    fn default() -> Self {
        Self {
            verify_interval_secs: default_verify_interval(),
            verify_initial_delay_secs: default_verify_initial_delay(),
            mpls_ecmp: false,
            internal_vlan: default_internal_vlan(),
            pseudowire_vlan: default_pseudowire_vlan(),
        }
    }
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval(),
            member_id: default_member_id(),
            tombstone_horizon: default_tombstone_horizon(),
        }
    }
}

impl GroupOrchdConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                message: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("Config file {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> Result<Self> {
        Self::load_or_default("/etc/sonic/grouporchd.toml")
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn verify_interval(&self) -> Duration {
        Duration::from_secs(self.orch.verify_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.daemon.heartbeat_interval_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.orch.verify_interval_secs == 0 {
            return Err(ConfigError::Invalid("verify_interval_secs must be > 0".to_string()));
        }
        if self.daemon.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid("heartbeat_interval_ms must be > 0".to_string()));
        }
        if self.orch.internal_vlan == self.orch.pseudowire_vlan {
            return Err(ConfigError::Invalid(format!(
                "internal_vlan and pseudowire_vlan must differ (both {})",
                self.orch.internal_vlan
            )));
        }

        let mut known = HashSet::new();
        for device in &self.devices {
            if !known.insert(&device.id) {
                return Err(ConfigError::Invalid(format!("duplicate device {}", device.id)));
            }
        }
        for link in &self.links {
            for end in [&link.src, &link.dst] {
                if !known.contains(end) {
                    return Err(ConfigError::Invalid(format!("link references unknown device {end}")));
                }
            }
            if link.src == link.dst {
                return Err(ConfigError::Invalid(format!("link loops on {}", link.src)));
            }
        }
        for entry in &self.vlans {
            if !known.contains(&entry.device) {
                return Err(ConfigError::Invalid(format!(
                    "vlan {} references unknown device {}",
                    entry.vlan, entry.device
                )));
            }
        }

        Ok(())
    }

    pub fn orch_config(&self) -> GroupOrchConfig {
        GroupOrchConfig {
            verify_interval: self.verify_interval(),
            verify_initial_delay: Duration::from_secs(self.orch.verify_initial_delay_secs),
            mpls_ecmp: self.orch.mpls_ecmp,
            internal_vlan: self.orch.internal_vlan,
            pseudowire_vlan: self.orch.pseudowire_vlan,
        }
    }

    pub fn device_config(&self) -> StaticDeviceConfig {
        let config = self
            .devices
            .iter()
            .fold(StaticDeviceConfig::new(), |config, device| {
                config.with_router_mac(device.id.clone(), device.router_mac)
            });
        self.vlans.iter().fold(config, |config, entry| {
            config.with_vlan_port(entry.device.clone(), entry.vlan, entry.port, entry.tagged)
        })
    }

    /// Routing reported stable, with the configured masters.
    pub fn routing_state(&self) -> StaticRoutingState {
        let routing = StaticRoutingState::new(true);
        for device in self.devices.iter().filter(|d| d.master) {
            routing.set_master(device.id.clone(), true);
        }
        routing
    }

    pub fn topology_links(&self) -> Vec<Link> {
        self.links
            .iter()
            .flat_map(|entry| {
                let a = ConnectPoint::new(entry.src.clone(), entry.src_port);
                let b = ConnectPoint::new(entry.dst.clone(), entry.dst_port);
                [Link::direct(a.clone(), b.clone()), Link::direct(b, a)]
            })
            .collect()
    }
}
