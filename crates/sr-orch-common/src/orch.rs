//! Base Orch trait.

use async_trait::async_trait;

/// Base trait for all orchestration agents.
///
/// Each Orch module implements this trait to participate in the daemon
/// event loop. The daemon calls `do_task()` whenever the Orch reports
/// pending work and `on_timer()` on every heartbeat.
///
/// # Thread Safety
///
/// Orch implementations must be `Send + Sync` so that topology callbacks,
/// the verification timer and the daemon loop can share them.
#[async_trait]
pub trait Orch: Send + Sync {
    /// Returns the name of this Orch (for logging and debugging).
    fn name(&self) -> &str;

    /// Processes pending work, e.g. completion outcomes from the device.
    async fn do_task(&mut self);

    /// Returns the priority of this Orch (lower = higher priority).
    fn priority(&self) -> i32 {
        0
    }

    /// Returns true if this Orch has pending work.
    fn has_pending_tasks(&self) -> bool {
        false
    }

    /// Dumps pending tasks for debugging.
    fn dump_pending_tasks(&self) -> Vec<String> {
        vec![]
    }

    /// Called periodically by the daemon's heartbeat.
    fn on_timer(&mut self) {}
}
