//! Destination sets and their next-hop records.
//!
//! A [`DestinationSet`] names one destination switch, or a dual-homed pair,
//! together with the MPLS label handling for traffic sent towards it. It is
//! the identity of a hashed group. [`NextNeighbors`] records which neighbors
//! currently carry traffic to each member destination and which group
//! realises them.

mod types;

pub use types::{Destination, DestinationSet, DestinationSetType, NextHopMap, NextNeighbors};
