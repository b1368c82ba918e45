pub mod models;
pub mod runner;

use std::net::Ipv4Addr;

use crate::errors::VmError;

pub use self::models::{PlayReport, TaskResult, TaskStatus};
pub use self::runner::AnsibleRunner;

/// Narrow automation capability injected into the disk manager. Runs
/// idempotent, declarative task sequences against a VM's address with a
/// fixed automation identity; safe to re-invoke after a partial failure.
pub trait Automation {
    /// Execute a named playbook with the given task parameters and return
    /// the ordered per-task outcome.
    async fn run_playbook(
        &self,
        host: Ipv4Addr,
        name: &str,
        vars: serde_json::Value,
    ) -> Result<PlayReport, VmError>;

    /// Execute a single idempotent in-guest command and return its stdout.
    async fn run_command(&self, host: Ipv4Addr, command: &str) -> Result<String, VmError>;
}
