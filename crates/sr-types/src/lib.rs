//! Network primitives shared by the segment-routing group orchestrator.
//!
//! Every type here is a small validated value type that can be used as a
//! map key, serialised into the distributed group stores and printed in
//! logs:
//!
//! - [`DeviceId`]: identifier of a switch in the fabric
//! - [`PortNumber`]: a port local to one switch
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses
//! - [`VlanId`]: IEEE 802.1Q VLAN identifiers
//! - [`MplsLabel`]: 20-bit MPLS labels used as segment ids

mod device;
mod mac;
mod mpls;
mod port;
mod vlan;

pub use device::DeviceId;
pub use mac::MacAddress;
pub use mpls::MplsLabel;
pub use port::PortNumber;
pub use vlan::VlanId;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid VLAN ID: {0} (must be 1-4094)")]
    InvalidVlanId(u16),

    #[error("invalid device id: {0:?}")]
    InvalidDeviceId(String),

    #[error("invalid port number: {0}")]
    InvalidPortNumber(String),

    #[error("invalid MPLS label: {0} (must be 0-1048575)")]
    InvalidMplsLabel(u32),
}
