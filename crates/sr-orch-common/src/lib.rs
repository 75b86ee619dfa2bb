//! Common orchestration abstractions for the segment-routing control plane.
//!
//! - [`Orch`]: Base trait for orchestration agents driven by the daemon loop
//! - [`EcMap`]: Eventually-consistent key/value map shared by cluster members
//!
//! # Architecture
//!
//! 1. Topology and routing events reach the daemon
//! 2. The daemon dispatches them to the Orch owning the affected device
//! 3. Orchs submit group edits to the device-programming layer
//! 4. Intent is recorded in [`EcMap`] stores and replicated to peers
//! 5. Completion outcomes are drained from `do_task()`

mod ec_map;
mod orch;

pub use ec_map::{EcMap, EcMapError, Timestamp, Update};
pub use orch::Orch;
